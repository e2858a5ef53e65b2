pub mod config;
pub mod run;
pub mod runs;
pub mod serve;
pub mod servers;
pub mod watch;
