//! Relay configuration.

use anyhow::{bail, Context, Result};
use hookrelay_broker::{AccessCredentials, BrokerOptions, TransportKind};
use hookrelay_core::{AllowList, Pipeline, WORK_ITEM_UPDATED};
use hookrelay_server::ForwardMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Relay configuration stored in `hookrelay.yml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// HTTP listener.
    #[serde(default)]
    pub server: ServerSettings,

    /// Broker connection.
    #[serde(default)]
    pub mqtt: MqttSettings,

    /// Access headers for the WebSocket transport.
    #[serde(default)]
    pub access: AccessCredentials,

    /// Filter rules.
    #[serde(default)]
    pub forward: ForwardSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    7071
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker address, e.g. `emqx.example.com:8083/mqtt` or `localhost:1883`.
    #[serde(default = "default_broker_url")]
    pub broker_url: String,

    #[serde(default = "default_username")]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_true")]
    pub clean_session: bool,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_timeout_secs")]
    pub publish_timeout_secs: u64,

    #[serde(default)]
    pub transport: TransportKind,
}

fn default_broker_url() -> String {
    "emqx.adamdixon.dev:8083/mqtt".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_username() -> Option<String> {
    Some("devopsmonitor".to_string())
}

fn default_client_id() -> String {
    "devops-listener".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_keep_alive_secs() -> u64 {
    30
}

const fn default_timeout_secs() -> u64 {
    10
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username: default_username(),
            password: None,
            client_id: default_client_id(),
            clean_session: true,
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_secs: default_timeout_secs(),
            publish_timeout_secs: default_timeout_secs(),
            transport: TransportKind::default(),
        }
    }
}

impl fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttSettings")
            .field("broker_url", &self.broker_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("client_id", &self.client_id)
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardSettings {
    #[serde(default)]
    pub mode: ForwardMode,

    /// Only events of this kind are forwarded.
    #[serde(default = "default_event_type")]
    pub event_type: String,

    /// Assignees whose work items are forwarded.
    #[serde(default = "default_assignees")]
    pub assignees: AllowList,

    #[serde(default)]
    pub work_item_type: WorkItemTypeRule,
}

fn default_event_type() -> String {
    WORK_ITEM_UPDATED.to_string()
}

fn default_assignees() -> AllowList {
    AllowList::new([
        "adam.dixon <adam.dixon@cnhind.com>",
        "iryna.onishchuk <iryna.onishchuk@external.cnhind.com>",
    ])
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            mode: ForwardMode::default(),
            event_type: default_event_type(),
            assignees: default_assignees(),
            work_item_type: WorkItemTypeRule::default(),
        }
    }
}

/// Optional restriction on the work item type. Off unless enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemTypeRule {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_work_item_types")]
    pub allowed: Vec<String>,
}

fn default_work_item_types() -> Vec<String> {
    vec!["Bug".to_string()]
}

impl Default for WorkItemTypeRule {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed: default_work_item_types(),
        }
    }
}

/// Values given on the command line or in the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub mqtt_password: Option<String>,
    pub access_client_id: Option<String>,
    pub access_client_secret: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl RelayConfig {
    /// Read and parse a YAML config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Like [`Self::load`], but fall back to defaults if the file is absent.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "Config file not found, using defaults");
            Ok(Self::default())
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        if let Some(password) = overrides.mqtt_password {
            self.mqtt.password = Some(password);
        }
        if let Some(client_id) = overrides.access_client_id {
            self.access.client_id = client_id;
        }
        if let Some(client_secret) = overrides.access_client_secret {
            self.access.client_secret = client_secret;
        }
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        self
    }

    /// Check the settings needed to start serving.
    ///
    /// # Errors
    /// Returns error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.mqtt.broker_url.trim().is_empty() {
            bail!("mqtt.broker_url is required");
        }

        for (name, value) in [
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
            ("mqtt.connect_timeout_secs", self.mqtt.connect_timeout_secs),
            ("mqtt.publish_timeout_secs", self.mqtt.publish_timeout_secs),
        ] {
            if value == 0 {
                bail!("{name} must be greater than zero");
            }
        }

        if self.mqtt.transport == TransportKind::Websocket && !self.access.is_complete() {
            bail!("access.client_id and access.client_secret are required for the websocket transport");
        }

        if self.forward.mode == ForwardMode::Filtered {
            if self.forward.assignees.is_empty() {
                bail!("forward.assignees must list at least one assignee in filtered mode");
            }
            if self.forward.work_item_type.enabled && self.forward.work_item_type.allowed.is_empty() {
                bail!("forward.work_item_type.allowed must not be empty when the rule is enabled");
            }
        }

        Ok(())
    }

    /// Address the HTTP server binds to.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Broker client settings.
    #[must_use]
    pub fn broker_options(&self) -> BrokerOptions {
        let mqtt = &self.mqtt;
        let mut options = BrokerOptions::new(mqtt.broker_url.trim())
            .with_client_id(mqtt.client_id.clone())
            .with_transport(mqtt.transport)
            .with_keep_alive(Duration::from_secs(mqtt.keep_alive_secs))
            .with_publish_timeout(Duration::from_secs(mqtt.publish_timeout_secs));
        options.clean_session = mqtt.clean_session;
        options.connect_timeout = Duration::from_secs(mqtt.connect_timeout_secs);

        if let Some(username) = &mqtt.username {
            options = options.with_credentials(
                username.clone(),
                mqtt.password.clone().unwrap_or_default(),
            );
        }
        if self.access.is_complete() {
            options = options.with_access(self.access.clone());
        }
        options
    }

    /// Filter chain described by the `forward` section.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        let forward = &self.forward;
        let mut pipeline = Pipeline::with_rules(
            forward.event_type.clone(),
            forward.assignees.clone(),
            forward.work_item_type.allowed.clone(),
        );
        pipeline.set_enabled("work_item_type", forward.work_item_type.enabled);
        pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_core::InboundEvent;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
server:
  port: 8080
mqtt:
  broker_url: emqx.example.com:8083/mqtt
  username: devopsmonitor
  password: from-file
access:
  client_id: id.access
  client_secret: secret
forward:
  assignees:
    - "adam.dixon <adam.dixon@cnhind.com>"
  work_item_type:
    enabled: true
"#;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn event(kind: &str) -> InboundEvent {
        InboundEvent::from_json(&format!(
            r#"{{
                "eventType": "workitem.updated",
                "resource": {{
                    "workItemId": 7,
                    "fields": {{ "System.AssignedTo": {{ "newValue": "adam.dixon <adam.dixon@cnhind.com>" }} }},
                    "revision": {{ "fields": {{ "System.WorkItemType": "{kind}" }} }}
                }}
            }}"#
        ))
        .unwrap()
    }

    #[test]
    fn test_load_fills_defaults() {
        let file = write_config(SAMPLE);
        let config = RelayConfig::load(file.path()).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.mqtt.client_id, "devops-listener");
        assert!(config.mqtt.clean_session);
        assert_eq!(config.mqtt.keep_alive_secs, 30);
        assert_eq!(config.mqtt.transport, TransportKind::Websocket);
        assert_eq!(config.forward.mode, ForwardMode::Filtered);
        assert_eq!(config.forward.event_type, "workitem.updated");
        assert_eq!(config.forward.work_item_type.allowed, vec!["Bug".to_string()]);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load_or_default(&dir.path().join("hookrelay.yml")).unwrap();

        assert_eq!(config.server.port, 7071);
        assert_eq!(config.mqtt.broker_url, "emqx.adamdixon.dev:8083/mqtt");
        assert_eq!(config.mqtt.username.as_deref(), Some("devopsmonitor"));
        assert_eq!(config.mqtt.password, None);
        assert_eq!(
            config.forward.assignees,
            AllowList::new([
                "adam.dixon <adam.dixon@cnhind.com>",
                "iryna.onishchuk <iryna.onishchuk@external.cnhind.com>",
            ])
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("access.client_id"), "{err}");

        let config = config.with_overrides(Overrides {
            access_client_id: Some("id.access".to_string()),
            access_client_secret: Some("secret".to_string()),
            ..Overrides::default()
        });
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_documented_defaults() {
        let file = write_config("server:\n  port: 8080\n");
        let config = RelayConfig::load(file.path()).unwrap();

        assert_eq!(config.mqtt.broker_url, "emqx.adamdixon.dev:8083/mqtt");
        assert_eq!(config.mqtt.username.as_deref(), Some("devopsmonitor"));
        assert_eq!(config.forward.assignees.len(), 2);
    }

    #[test]
    fn test_invalid_yaml_is_an_error() {
        let file = write_config("mqtt: [not, a, map]");
        let err = RelayConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file = write_config(SAMPLE);
        let config = RelayConfig::load(file.path())
            .unwrap()
            .with_overrides(Overrides {
                mqtt_password: Some("from-env".to_string()),
                access_client_secret: Some("rotated".to_string()),
                port: Some(9000),
                ..Overrides::default()
            });

        assert_eq!(config.mqtt.password.as_deref(), Some("from-env"));
        assert_eq!(config.access.client_id, "id.access");
        assert_eq!(config.access.client_secret, "rotated");
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn test_validate_rejects_incomplete_settings() {
        let valid = RelayConfig::load(write_config(SAMPLE).path()).unwrap();

        let mut config = valid.clone();
        config.mqtt.broker_url = "  ".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("broker_url"));

        let mut config = valid.clone();
        config.mqtt.publish_timeout_secs = 0;
        assert!(config.validate().unwrap_err().to_string().contains("publish_timeout_secs"));

        let mut config = valid.clone();
        config.access.client_secret.clear();
        assert!(config.validate().unwrap_err().to_string().contains("websocket"));
        config.mqtt.transport = TransportKind::Tcp;
        config.validate().unwrap();

        let mut config = valid.clone();
        config.forward.assignees = AllowList::default();
        assert!(config.validate().unwrap_err().to_string().contains("assignees"));
        config.forward.mode = ForwardMode::Passthrough;
        config.validate().unwrap();
    }

    #[test]
    fn test_broker_options_follow_config() {
        let config = RelayConfig::load(write_config(SAMPLE).path()).unwrap();
        let options = config.broker_options();

        assert_eq!(options.address, "emqx.example.com:8083/mqtt");
        assert_eq!(options.client_id, "devops-listener");
        assert_eq!(options.username.as_deref(), Some("devopsmonitor"));
        assert_eq!(options.password.as_deref(), Some("from-file"));
        assert_eq!(options.keep_alive, Duration::from_secs(30));
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert_eq!(options.access, Some(AccessCredentials::new("id.access", "secret")));
        assert!(options.build_transport().is_ok());
    }

    #[test]
    fn test_pipeline_honours_work_item_type_toggle() {
        let mut config = RelayConfig::load(write_config(SAMPLE).path()).unwrap();

        assert!(config.pipeline().evaluate(&event("Bug")).is_some());
        assert!(config.pipeline().evaluate(&event("Task")).is_none());

        config.forward.work_item_type.enabled = false;
        assert!(config.pipeline().evaluate(&event("Task")).is_some());
    }

    #[test]
    fn test_default_pipeline_is_the_standard_chain() {
        let config = RelayConfig::default();
        assert_eq!(
            config.pipeline(),
            Pipeline::standard(config.forward.assignees.clone())
        );
    }
}
