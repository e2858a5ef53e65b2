//! Blocking HTTP client for a running `runbook serve`.

use anyhow::{anyhow, Context};
use runbook_core::registry::ServerListing;
use runbook_core::run::{Run, RunMessage};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::io::BufRead;

#[derive(Debug, Clone, Deserialize)]
pub struct Whoami {
    pub name: String,
    pub tier: runbook_core::types::PermissionTier,
}

pub struct Client {
    base: String,
    token: String,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base: &str, token: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            agent: ureq::AgentBuilder::new().build(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let resp = self
            .agent
            .get(&self.url(path))
            .set("Authorization", &format!("Bearer {}", self.token))
            .call()
            .map_err(api_error)?;
        resp.into_json()
            .with_context(|| format!("invalid response from GET {path}"))
    }

    pub fn servers(&self) -> anyhow::Result<Vec<ServerListing>> {
        self.get_json("/api/servers")
    }

    pub fn whoami(&self) -> anyhow::Result<Whoami> {
        self.get_json("/api/whoami")
    }

    pub fn runs(&self) -> anyhow::Result<Vec<Run>> {
        self.get_json("/api/runs")
    }

    pub fn run(&self, run_id: &str) -> anyhow::Result<Run> {
        self.get_json(&format!("/api/runs/{run_id}"))
    }

    /// Submit a run; returns the new run id.
    pub fn submit(&self, server_id: &str, action_id: &str) -> anyhow::Result<String> {
        let resp = self
            .agent
            .post(&self.url("/api/runs"))
            .set("Authorization", &format!("Bearer {}", self.token))
            .send_json(serde_json::json!({
                "server_id": server_id,
                "action_id": action_id,
            }))
            .map_err(api_error)?;
        let body: serde_json::Value = resp.into_json().context("invalid submit response")?;
        body["run_id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("submit response carried no run_id"))
    }

    /// Follow a run's event stream, calling `on_message` for each event in
    /// order. Returns after the terminal event or when the server closes
    /// the stream.
    pub fn follow(
        &self,
        run_id: &str,
        mut on_message: impl FnMut(u64, RunMessage) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let resp = self
            .agent
            .get(&self.url(&format!("/api/runs/{run_id}/events")))
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "text/event-stream")
            .call()
            .map_err(api_error)?;

        let reader = std::io::BufReader::new(resp.into_reader());
        let mut parser = SseParser::default();
        for line in reader.lines() {
            let line = line.context("event stream interrupted")?;
            let Some(frame) = parser.feed(&line) else {
                continue;
            };
            let message: RunMessage = serde_json::from_str(&frame.data)
                .with_context(|| format!("invalid '{}' event", frame.event))?;
            let terminal = message.event.is_terminal();
            on_message(frame.id.unwrap_or(0), message)?;
            if terminal {
                break;
            }
        }
        Ok(())
    }
}

/// Turn a ureq error into an anyhow error carrying the server's message.
fn api_error(err: ureq::Error) -> anyhow::Error {
    match err {
        ureq::Error::Status(code, resp) => {
            let message = resp
                .into_json::<serde_json::Value>()
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or_else(|| "no error message".to_string());
            anyhow!("server returned {code}: {message}")
        }
        ureq::Error::Transport(t) => anyhow!("cannot reach runbook server: {t}"),
    }
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub id: Option<u64>,
    pub data: String,
}

/// Line-oriented Server-Sent Events parser. Comment lines (keep-alives) are
/// skipped; a blank line completes a frame.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    id: Option<u64>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event = None;
                return None;
            }
            return Some(SseFrame {
                event: self.event.take().unwrap_or_else(|| "message".into()),
                id: self.id.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = value.trim().parse().ok(),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
