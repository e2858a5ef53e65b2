use anyhow::{anyhow, Context};
use runbook_core::gate::{self, DenyReason, GateDecision, CONFIRMATION_PHRASE};
use runbook_core::registry::Action;
use std::io::{BufRead, Write};

use crate::client::Client;
use crate::cmd::watch;
use crate::output::print_json;

// ---------------------------------------------------------------------------
// Exit codes for runs that finished badly or were never sent
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum RunExit {
    Failed { exit_code: Option<i32> },
    Errored { message: String },
    GateDenied(DenyReason),
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::Failed { .. } => 2,
            RunExit::Errored { .. } => 3,
            RunExit::GateDenied(_) => 4,
        }
    }
}

impl std::fmt::Display for RunExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunExit::Failed {
                exit_code: Some(code),
            } => write!(f, "run failed with exit code {code}"),
            RunExit::Failed { exit_code: None } => write!(f, "run failed"),
            RunExit::Errored { message } => write!(f, "run ended in error: {message}"),
            RunExit::GateDenied(reason) => write!(f, "not sent: {reason}"),
        }
    }
}

impl std::error::Error for RunExit {}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Gate, submit and (unless `detach`) follow a run to completion.
pub fn run(
    client: &Client,
    server_id: &str,
    action_id: &str,
    confirm: Option<String>,
    detach: bool,
    json: bool,
) -> anyhow::Result<()> {
    let servers = client.servers().context("failed to load servers")?;
    let server = servers
        .iter()
        .find(|s| s.id == server_id)
        .ok_or_else(|| anyhow!("server '{server_id}' not found"))?;
    let action = server
        .actions
        .iter()
        .find(|a| a.id == action_id)
        .ok_or_else(|| anyhow!("action '{action_id}' not found on '{server_id}'"))?;
    let me = client.whoami().context("failed to resolve caller")?;

    let confirmation = match confirm {
        Some(text) => text,
        None if action.dangerous && me.tier >= gate::required_tier(action) => {
            prompt_confirmation(action, &server.name)?
        }
        None => String::new(),
    };

    if let GateDecision::Deny { reason } = gate::check(action, me.tier, &confirmation) {
        tracing::debug!(server_id, action_id, %reason, "gate denied run");
        return Err(RunExit::GateDenied(reason).into());
    }

    let run_id = client
        .submit(server_id, action_id)
        .with_context(|| format!("failed to submit {server_id}/{action_id}"))?;

    if detach {
        if json {
            print_json(&serde_json::json!({ "run_id": run_id }))?;
        } else {
            println!("{run_id}");
        }
        return Ok(());
    }

    if !json {
        eprintln!("run {run_id}: {} on {}", action.name, server.name);
    }
    watch::follow(client, &run_id, json)
}

fn prompt_confirmation(action: &Action, server_name: &str) -> anyhow::Result<String> {
    let mut stderr = std::io::stderr();
    write!(
        stderr,
        "'{}' on {server_name} is dangerous. Type '{CONFIRMATION_PHRASE}' to proceed: ",
        action.name
    )?;
    stderr.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line)
}
