use runbook_core::assembler::OutputAssembler;
use runbook_core::run::RunEvent;
use runbook_core::types::RunStatus;

use crate::client::Client;
use crate::cmd::run::RunExit;

/// Stream a run's events through an [`OutputAssembler`] and map the
/// outcome to an exit status.
///
/// Text mode prints assembled lines as they arrive; JSON mode prints one
/// event per line.
pub fn follow(client: &Client, run_id: &str, json: bool) -> anyhow::Result<()> {
    let mut assembler = OutputAssembler::new(run_id);
    let mut last_terminal = None;

    client.follow(run_id, |seq, message| {
        if message.event.is_terminal() && last_terminal.is_none() {
            last_terminal = Some(message.event.clone());
        }
        let added = assembler.apply(&message.event);
        if json {
            let mut value = serde_json::to_value(&message)?;
            value["seq"] = seq.into();
            println!("{}", serde_json::to_string(&value)?);
        } else {
            let lines = assembler.lines();
            for line in &lines[lines.len() - added..] {
                println!("{line}");
            }
        }
        Ok(())
    })?;

    match (assembler.status(), last_terminal) {
        (RunStatus::Success, _) => Ok(()),
        (RunStatus::Failure, Some(RunEvent::Completed { exit_code, .. })) => {
            Err(RunExit::Failed { exit_code }.into())
        }
        (RunStatus::Failure, _) => Err(RunExit::Failed { exit_code: None }.into()),
        (RunStatus::Error, Some(RunEvent::Error { message })) => {
            Err(RunExit::Errored { message }.into())
        }
        (RunStatus::Error, _) => Err(RunExit::Errored {
            message: String::new(),
        }
        .into()),
        (RunStatus::Requested | RunStatus::Running, _) => {
            anyhow::bail!("event stream for run {run_id} ended before the run finished")
        }
    }
}
