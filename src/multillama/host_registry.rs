//! Configured inference hosts, their connection status and the model catalog they serve.
//!
//! The registry is plain data. Operations that need the network (connection tests,
//! catalog refreshes) live on the [`Orchestrator`](crate::orchestrator::Orchestrator),
//! which calls back into the registry to record the outcome.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use crate::client_wrapper::{ModelDetails, ModelInfo};
use crate::config::INFERENCE_PORT;

/// Id of the host every fresh install starts with.
pub const DEFAULT_HOST_ID: &str = "host-local";
/// URL of the host every fresh install starts with.
pub const DEFAULT_HOST_URL: &str = "http://127.0.0.1:11434";

/// Ports used by local dev servers that users paste by mistake instead of the API port.
const DEV_SERVER_PORTS: [u16; 2] = [3000, 5173];

/// A configured inference endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub url: String,
}

impl Host {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }
}

/// Connection status of a host. Only scans and connection tests change it, plus failed
/// chat calls which flip it to `Failed`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    #[default]
    Idle,
    Testing,
    Connected,
    Failed,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HostStatus::Idle => "idle",
            HostStatus::Testing => "testing",
            HostStatus::Connected => "connected",
            HostStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// A model offered by a specific host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableModel {
    pub host_id: String,
    pub host_url: String,
    pub model_name: String,
    pub size: Option<u64>,
    pub modified_at: Option<String>,
    pub details: Option<ModelDetails>,
}

impl AvailableModel {
    fn from_info(host: &Host, info: ModelInfo) -> Self {
        Self {
            host_id: host.id.clone(),
            host_url: host.url.clone(),
            model_name: info.name,
            size: info.size,
            modified_at: info.modified_at,
            details: info.details,
        }
    }
}

/// Normalize a user-entered host URL.
///
/// Defaults the scheme to `http://`, rewrites `localhost` to `127.0.0.1`, maps dev-server
/// ports on loopback to the inference port and strips trailing slashes. Blank input
/// yields an empty string.
///
/// ```rust
/// use multillama::host_registry::normalize_host_url;
///
/// assert_eq!(normalize_host_url("localhost:3000"), "http://127.0.0.1:11434");
/// assert_eq!(normalize_host_url("https://gpu-box:11434//"), "https://gpu-box:11434");
/// ```
pub fn normalize_host_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let mut parsed = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(_) => return with_scheme.trim_end_matches('/').to_string(),
    };

    if parsed.host_str() == Some("localhost") && parsed.set_host(Some("127.0.0.1")).is_err() {
        return with_scheme.trim_end_matches('/').to_string();
    }
    if parsed.host_str() == Some("127.0.0.1") {
        if let Some(port) = parsed.port() {
            if DEV_SERVER_PORTS.contains(&port) {
                // Only fails for cannot-be-a-base URLs, which an http(s) URL never is.
                let _ = parsed.set_port(Some(INFERENCE_PORT));
            }
        }
    }
    parsed.to_string().trim_end_matches('/').to_string()
}

/// The `/24` prefix (`a.b.c`) of a URL whose host is an IPv4 literal.
pub fn ipv4_prefix_of_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let addr: Ipv4Addr = parsed.host_str()?.parse().ok()?;
    let [a, b, c, _] = addr.octets();
    Some(format!("{}.{}.{}", a, b, c))
}

/// Hosts, statuses and catalog.
#[derive(Clone, Debug, Default)]
pub struct HostRegistry {
    hosts: Vec<Host>,
    statuses: HashMap<String, HostStatus>,
    catalog: Vec<AvailableModel>,
}

impl HostRegistry {
    /// Build a registry from already normalized hosts.
    pub fn new(hosts: Vec<Host>) -> Self {
        Self {
            hosts,
            statuses: HashMap::new(),
            catalog: Vec::new(),
        }
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn host(&self, host_id: &str) -> Option<&Host> {
        self.hosts.iter().find(|h| h.id == host_id)
    }

    pub fn find_by_url(&self, url: &str) -> Option<&Host> {
        let normalized = normalize_host_url(url);
        self.hosts.iter().find(|h| h.url == normalized)
    }

    /// Base URL serving `host_id`, if the host is configured.
    pub fn resolve(&self, host_id: &str) -> Option<String> {
        self.host(host_id).map(|h| h.url.clone())
    }

    /// Add a host by URL. Returns the id of the new host, or of the existing host with the
    /// same normalized URL. `None` for blank input.
    pub fn add_host(&mut self, url: &str) -> Option<String> {
        let normalized = normalize_host_url(url);
        if normalized.is_empty() {
            return None;
        }
        if let Some(existing) = self.hosts.iter().find(|h| h.url == normalized) {
            return Some(existing.id.clone());
        }
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("host-{}", &simple[..8]);
        log::info!("HostRegistry: added host {} -> {}", id, normalized);
        self.hosts.push(Host::new(id.clone(), normalized));
        Some(id)
    }

    /// Point an existing host at a new URL. Clears its status and catalog entries.
    pub fn update_host_url(&mut self, host_id: &str, url: &str) -> bool {
        let normalized = normalize_host_url(url);
        if normalized.is_empty() {
            return false;
        }
        let Some(host) = self.hosts.iter_mut().find(|h| h.id == host_id) else {
            return false;
        };
        host.url = normalized;
        self.statuses.remove(host_id);
        self.catalog.retain(|m| m.host_id != host_id);
        true
    }

    /// Drop a host together with its status and catalog entries.
    pub fn remove_host(&mut self, host_id: &str) -> Option<Host> {
        let index = self.hosts.iter().position(|h| h.id == host_id)?;
        self.statuses.remove(host_id);
        self.catalog.retain(|m| m.host_id != host_id);
        Some(self.hosts.remove(index))
    }

    pub fn status(&self, host_id: &str) -> HostStatus {
        self.statuses.get(host_id).copied().unwrap_or_default()
    }

    pub fn statuses(&self) -> &HashMap<String, HostStatus> {
        &self.statuses
    }

    /// Record a status. Returns `true` when it changed.
    pub fn set_status(&mut self, host_id: &str, status: HostStatus) -> bool {
        let previous = self.statuses.insert(host_id.to_string(), status);
        previous != Some(status)
    }

    pub fn catalog(&self) -> &[AvailableModel] {
        &self.catalog
    }

    /// Models served by one host.
    pub fn models_for(&self, host_id: &str) -> Vec<&AvailableModel> {
        self.catalog.iter().filter(|m| m.host_id == host_id).collect()
    }

    /// Replace the catalog entries of one host.
    pub fn replace_models(&mut self, host_id: &str, models: Vec<ModelInfo>) {
        let Some(host) = self.host(host_id).cloned() else {
            return;
        };
        self.catalog.retain(|m| m.host_id != host_id);
        self.catalog
            .extend(models.into_iter().map(|info| AvailableModel::from_info(&host, info)));
    }
}
