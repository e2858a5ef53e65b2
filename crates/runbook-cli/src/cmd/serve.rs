use anyhow::Context;
use runbook_core::config::Config;
use runbook_server::executor::ProcessExecutor;
use std::path::Path;
use std::sync::Arc;

/// `runbook serve`: run the coordinator and HTTP API until interrupted.
pub fn run(config_path: &Path, listen: Option<String>) -> anyhow::Result<()> {
    let mut config = Config::load_validated(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        runbook_server::serve(config, Arc::new(ProcessExecutor::new())).await
    })
}
