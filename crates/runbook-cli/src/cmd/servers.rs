use runbook_core::gate;

use crate::client::Client;
use crate::output::{print_json, print_table};

/// `runbook servers`: every server's actions and the tier each needs.
pub fn list(client: &Client, json: bool) -> anyhow::Result<()> {
    let servers = client.servers()?;
    if json {
        return print_json(&servers);
    }
    let rows = servers
        .iter()
        .flat_map(|s| {
            s.actions.iter().map(move |a| {
                vec![
                    s.id.clone(),
                    s.host.clone(),
                    a.id.clone(),
                    a.name.clone(),
                    gate::required_tier(a).to_string(),
                    if a.dangerous { "yes" } else { "" }.to_string(),
                ]
            })
        })
        .collect();
    print_table(
        &["SERVER", "HOST", "ACTION", "NAME", "TIER", "DANGEROUS"],
        rows,
    );
    Ok(())
}

/// `runbook whoami`
pub fn whoami(client: &Client, json: bool) -> anyhow::Result<()> {
    let me = client.whoami()?;
    if json {
        print_json(&serde_json::json!({ "name": me.name, "tier": me.tier }))
    } else {
        println!("{} ({})", me.name, me.tier);
        Ok(())
    }
}
