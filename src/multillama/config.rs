//! Configuration for multillama.
//!
//! Two records live here:
//!
//! * [`Settings`] is the user-editable settings record that gets persisted through a
//!   [`StateStore`](crate::persistence::StateStore): hosts, feature toggles and the
//!   [`ChatConfiguration`] block.
//! * [`OrchestratorConfig`] holds runtime tunables (queue capacity, inter-turn delay,
//!   scanner limits). Users construct it however they want; it is never persisted.
//!
//! # Example
//!
//! ```rust
//! use multillama::config::{OrchestratorConfig, Settings};
//! use std::time::Duration;
//!
//! let settings = Settings::default();
//! assert_eq!(settings.hosts[0].url, "http://127.0.0.1:11434");
//!
//! let config = OrchestratorConfig {
//!     inter_turn_delay: Duration::from_millis(0),
//!     ..OrchestratorConfig::default()
//! };
//! assert_eq!(config.queue_capacity, 5);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::host_registry::{normalize_host_url, Host, DEFAULT_HOST_ID, DEFAULT_HOST_URL};

/// Upper bound accepted for [`ChatConfiguration::max_output_length`].
pub const MAX_OUTPUT_LENGTH_LIMIT: usize = 120_000;

/// Standard port of the inference API.
pub const INFERENCE_PORT: u16 = 11434;

/// Global prompt shaping applied to every outgoing call when enabled.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfiguration {
    pub enabled: bool,
    /// Text placed before the user content.
    pub pre_prompt: String,
    /// Text placed after the user content.
    pub post_prompt: String,
    /// Character cap on replies. Always `None` or within `1..=MAX_OUTPUT_LENGTH_LIMIT`
    /// after [`normalized`](ChatConfiguration::normalized).
    pub max_output_length: Option<usize>,
}

impl ChatConfiguration {
    /// Clamp the output cap into its accepted range.
    pub fn normalized(mut self) -> Self {
        self.max_output_length = clamp_max_output_length(self.max_output_length);
        self
    }

    /// The cap that is actually in force, i.e. only while the block is enabled.
    pub fn effective_max_output_length(&self) -> Option<usize> {
        if self.enabled {
            self.max_output_length.filter(|max| *max > 0)
        } else {
            None
        }
    }
}

/// Clamp a requested output cap: zero means "no cap", anything above the limit is cut.
pub fn clamp_max_output_length(value: Option<usize>) -> Option<usize> {
    match value {
        None | Some(0) => None,
        Some(v) => Some(v.min(MAX_OUTPUT_LENGTH_LIMIT)),
    }
}

/// The persisted user settings record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hosts: Vec<Host>,
    pub persist_data_locally: bool,
    pub enable_roles: bool,
    pub allow_same_model_multi_chat: bool,
    pub enable_message_streaming: bool,
    pub chat_config: ChatConfiguration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hosts: vec![Host::new(DEFAULT_HOST_ID, DEFAULT_HOST_URL)],
            persist_data_locally: true,
            enable_roles: true,
            allow_same_model_multi_chat: true,
            enable_message_streaming: false,
            chat_config: ChatConfiguration::default(),
        }
    }
}

impl Settings {
    /// Normalize host URLs, drop blank or duplicate hosts, restore the default host when
    /// none remain and clamp the chat configuration.
    pub fn normalized(mut self) -> Self {
        let mut seen_ids = HashSet::new();
        let mut seen_urls = HashSet::new();
        let mut hosts = Vec::with_capacity(self.hosts.len());
        for host in self.hosts.drain(..) {
            let url = normalize_host_url(&host.url);
            if url.is_empty() || host.id.trim().is_empty() {
                continue;
            }
            if !seen_ids.insert(host.id.clone()) || !seen_urls.insert(url.clone()) {
                continue;
            }
            hosts.push(Host::new(host.id, url));
        }
        if hosts.is_empty() {
            hosts.push(Host::new(DEFAULT_HOST_ID, DEFAULT_HOST_URL));
        }
        self.hosts = hosts;
        self.chat_config = self.chat_config.normalized();
        self
    }
}

/// Tunables for the [`NetworkScanner`](crate::network_scan::NetworkScanner).
#[derive(Clone, Debug)]
pub struct ScannerConfig {
    /// Number of probes in flight at once.
    pub concurrency: usize,
    /// Per-probe deadline; a probe that misses it is dropped and counts as "not found".
    pub probe_timeout: Duration,
    /// Whether to infer prefixes from the local machine's interfaces.
    pub detect_local_interfaces: bool,
    /// Bounded wait for interface discovery.
    pub interface_discovery_timeout: Duration,
    /// Port probed on every candidate address.
    pub inference_port: u16,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            concurrency: 24,
            probe_timeout: Duration::from_millis(900),
            detect_local_interfaces: true,
            interface_discovery_timeout: Duration::from_millis(1500),
            inference_port: INFERENCE_PORT,
        }
    }
}

/// Runtime tunables for the [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Maximum number of queued requests, the processing one included.
    pub queue_capacity: usize,
    /// Pause between autonomous turns.
    pub inter_turn_delay: Duration,
    /// Number of most recent transcript entries quoted in each autonomous turn prompt.
    pub transcript_window: usize,
    /// Spawn a drain task whenever a request is queued and a tokio runtime is available.
    pub auto_drain: bool,
    pub scanner: ScannerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 5,
            inter_turn_delay: Duration::from_millis(400),
            transcript_window: 24,
            auto_drain: true,
            scanner: ScannerConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_max_output_length() {
        assert_eq!(clamp_max_output_length(None), None);
        assert_eq!(clamp_max_output_length(Some(0)), None);
        assert_eq!(clamp_max_output_length(Some(500)), Some(500));
        assert_eq!(
            clamp_max_output_length(Some(999_999)),
            Some(MAX_OUTPUT_LENGTH_LIMIT)
        );
    }

    #[test]
    fn test_effective_cap_requires_enabled_block() {
        let mut config = ChatConfiguration {
            enabled: false,
            max_output_length: Some(10),
            ..ChatConfiguration::default()
        };
        assert_eq!(config.effective_max_output_length(), None);
        config.enabled = true;
        assert_eq!(config.effective_max_output_length(), Some(10));
    }

    #[test]
    fn test_settings_normalization_dedupes_and_restores_default() {
        let settings = Settings {
            hosts: vec![
                Host::new("a", "localhost:3000/"),
                Host::new("b", "http://127.0.0.1:11434"),
                Host::new("c", "  "),
            ],
            ..Settings::default()
        }
        .normalized();
        assert_eq!(settings.hosts, vec![Host::new("a", "http://127.0.0.1:11434")]);

        let empty = Settings {
            hosts: vec![],
            ..Settings::default()
        }
        .normalized();
        assert_eq!(empty.hosts[0].id, DEFAULT_HOST_ID);
    }

    #[test]
    fn test_settings_deserialize_fills_missing_fields() {
        let settings: Settings = serde_json::from_str(r#"{"enable_roles": false}"#).unwrap();
        assert!(!settings.enable_roles);
        assert!(settings.persist_data_locally);
        assert_eq!(settings.hosts.len(), 1);
    }
}
