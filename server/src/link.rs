use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::alarm::scheduler::SchedulerSnapshot;
use crate::protocol::{ClientMessage, Mailbox, ServerMessage};

const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

/// Controller side of the message channel to the scheduler.
pub trait SchedulerLink {
    fn post(&self, message: &ClientMessage) -> Result<()>;
}

/// Identifies one foreground context to the scheduler's registry.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub instance_id: String,
}

impl ClientIdentity {
    pub fn detect() -> Self {
        Self {
            client_id: detect_hostname(),
            instance_id: format!(
                "{}-{}",
                std::process::id(),
                Local::now().timestamp_millis()
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub scheduler: SchedulerSnapshot,
    pub clients_seen: usize,
    pub total_requests: u64,
    pub server_started_unix_ms: i64,
    pub response_unix_ms: i64,
}

pub struct HttpSchedulerLink {
    base_url: String,
    identity: ClientIdentity,
    http: Client,
}

impl HttpSchedulerLink {
    /// Opens a link only if the scheduler answers its health check.
    pub fn connect(base_url: &str, identity: ClientIdentity) -> Result<Self> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        let link = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            identity,
            http,
        };
        link.http
            .get(link.url("/healthz"))
            .send()
            .and_then(|response| response.error_for_status())
            .with_context(|| format!("scheduler at {} did not answer", link.base_url))?;
        debug!(base_url = %link.base_url, "scheduler link established");
        Ok(link)
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Refreshes this context's registration and drains its mailbox.
    pub fn poll_messages(&self) -> Result<Vec<ServerMessage>> {
        let mailbox = self
            .http
            .get(self.url("/v1/client/messages"))
            .header("X-Client-Id", &self.identity.client_id)
            .header("X-Client-Instance", &self.identity.instance_id)
            .send()
            .and_then(|response| response.error_for_status())
            .context("mailbox poll failed")?
            .json::<Mailbox>()
            .context("mailbox response was not valid JSON")?;
        Ok(mailbox.messages)
    }

    pub fn state(&self) -> Result<SchedulerState> {
        self.http
            .get(self.url("/v1/state"))
            .send()
            .and_then(|response| response.error_for_status())
            .context("state request failed")?
            .json::<SchedulerState>()
            .context("state response was not valid JSON")
    }

    pub fn disconnect(&self) -> Result<()> {
        self.http
            .post(self.url("/v1/client/disconnect"))
            .header("X-Client-Id", &self.identity.client_id)
            .header("X-Client-Instance", &self.identity.instance_id)
            .send()
            .and_then(|response| response.error_for_status())
            .context("disconnect request failed")?;
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl SchedulerLink for HttpSchedulerLink {
    fn post(&self, message: &ClientMessage) -> Result<()> {
        self.http
            .post(self.url("/v1/messages"))
            .json(message)
            .send()
            .and_then(|response| response.error_for_status())
            .context("failed to deliver message to scheduler")?;
        Ok(())
    }
}

fn detect_hostname() -> String {
    let candidate = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_else(|| "alarmclock".to_string());
    let trimmed = candidate.trim();
    if trimmed.is_empty() {
        "alarmclock".to_string()
    } else {
        trimmed
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' {
                    ch.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect::<String>()
    }
}
