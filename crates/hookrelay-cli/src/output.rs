//! Output formatting for the CLI.

use anyhow::Result;
use hookrelay_core::{Decision, OutboundMessage};
use serde::Serialize;

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    #[default]
    Human,
    /// JSON output
    Json,
}

/// Result of running one payload through the filter.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct CheckReport {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<OutboundMessage>,
}

impl From<Decision> for CheckReport {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Forward(message) => Self {
                status: "forwarded",
                reason: None,
                message: Some(message),
            },
            Decision::Skip(reason) => Self {
                status: "filtered",
                reason: Some(reason.to_string()),
                message: None,
            },
        }
    }
}

impl CheckReport {
    /// Render the report.
    ///
    /// # Errors
    /// Returns error if the outbound message cannot be serialized.
    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            OutputFormat::Human => {
                let mut out = self.status.to_string();
                if let Some(reason) = &self.reason {
                    out.push_str(": ");
                    out.push_str(reason);
                }
                if let Some(message) = &self.message {
                    let payload = message.to_payload()?;
                    out.push('\n');
                    out.push_str(&String::from_utf8_lossy(&payload));
                }
                Ok(out)
            }
        }
    }
}
