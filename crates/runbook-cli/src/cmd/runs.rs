use runbook_core::run::Run;

use crate::client::Client;
use crate::output::{print_json, print_table};

/// `runbook runs`: recent runs, newest first.
pub fn list(client: &Client, json: bool) -> anyhow::Result<()> {
    let runs = client.runs()?;
    if json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        println!("No runs yet.");
        return Ok(());
    }
    let rows = runs
        .iter()
        .map(|r| {
            vec![
                r.run_id.clone(),
                r.server_id.clone(),
                r.action_id.clone(),
                r.status.to_string(),
                outcome(r),
                r.requested_by.clone(),
                r.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(
        &["RUN", "SERVER", "ACTION", "STATUS", "RESULT", "BY", "STARTED"],
        rows,
    );
    Ok(())
}

/// `runbook show <run_id>`: one run record.
pub fn show(client: &Client, run_id: &str, json: bool) -> anyhow::Result<()> {
    let run = client.run(run_id)?;
    if json {
        return print_json(&run);
    }
    println!("Run:       {}", run.run_id);
    println!("Action:    {}/{}", run.server_id, run.action_id);
    println!("Status:    {}", run.status);
    println!("By:        {}", run.requested_by);
    println!("Started:   {}", run.started_at.to_rfc3339());
    if let Some(done) = run.completed_at {
        println!("Completed: {}", done.to_rfc3339());
    }
    let result = outcome(&run);
    if !result.is_empty() {
        println!("Result:    {result}");
    }
    Ok(())
}

fn outcome(run: &Run) -> String {
    if let Some(err) = &run.error {
        return err.clone();
    }
    match (run.exit_code, &run.signal) {
        (Some(code), Some(sig)) => format!("exit {code} ({sig})"),
        (Some(code), None) => format!("exit {code}"),
        (None, Some(sig)) => sig.clone(),
        (None, None) => String::new(),
    }
}
