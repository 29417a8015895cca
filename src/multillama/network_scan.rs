//! Discovery of inference hosts on the local network.
//!
//! A scan probes `GET /api/tags` on every candidate address with a bounded worker pool.
//! Candidates are the 254 host addresses of each `/24` prefix on the inference port,
//! plus loopback and the configured hosts themselves. A custom range switches to strict
//! mode: only the prefix of the given address is probed.
//!
//! Probe failures of any kind (refused, timed out, non-2xx) just mean "not here"; only
//! a scan without a single hit reports [`ScanOutcome::NotFound`].

use futures_util::future::join_all;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;

use crate::client_wrapper::ClientWrapper;
use crate::config::ScannerConfig;
use crate::event::{EventHandler, ScanEvent};
use crate::host_registry::{ipv4_prefix_of_url, normalize_host_url};

/// Prefixes probed on every non-strict scan.
pub const DEFAULT_PREFIXES: [&str; 3] = ["10.0.0", "192.168.0", "192.168.1"];

/// Targets used to ask the OS which local address routes towards each private range.
/// Nothing is sent; connecting a UDP socket only selects a route.
const ROUTE_PROBE_TARGETS: [&str; 4] = [
    "10.255.255.254:9",
    "172.31.255.254:9",
    "192.168.255.254:9",
    "8.8.8.8:53",
];

lazy_static! {
    static ref IPV4_IN_TEXT: Regex = Regex::new(r"\b(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})\b").unwrap();
}

/// A reachable host found by a scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedHost {
    pub url: String,
    pub model_count: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// At least one host answered; sorted by URL, one entry per normalized URL.
    Found(Vec<ScannedHost>),
    /// The scan completed without a single hit.
    NotFound,
    /// Another scan is in progress; nothing was probed.
    AlreadyScanning,
}

/// Extract the `/24` prefix from a user-entered range such as `192.168.9.55` or
/// `192.168.9.0/24`.
///
/// ```rust
/// use multillama::network_scan::parse_scan_range;
///
/// assert_eq!(parse_scan_range("192.168.9.55").as_deref(), Some("192.168.9"));
/// assert_eq!(parse_scan_range(" range 10.1.2.0/24 ").as_deref(), Some("10.1.2"));
/// assert_eq!(parse_scan_range("10.1.300.4"), None);
/// assert_eq!(parse_scan_range("office"), None);
/// ```
pub fn parse_scan_range(raw: &str) -> Option<String> {
    let caps = IPV4_IN_TEXT.captures(raw.trim())?;
    let mut octets = [0u8; 4];
    for (slot, index) in octets.iter_mut().zip(1..=4) {
        *slot = caps.get(index)?.as_str().parse().ok()?;
    }
    Some(format!("{}.{}.{}", octets[0], octets[1], octets[2]))
}

/// Build the ordered, de-duplicated candidate URL list.
///
/// In strict mode only the addresses of `prefixes` are produced. Otherwise loopback,
/// every configured host URL and the prefixes of IPv4 host URLs come first.
pub fn build_scan_candidates(host_urls: &[String], prefixes: &[String], strict: bool, port: u16) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates: Vec<String> = Vec::new();
    let mut push = |url: String| {
        let normalized = normalize_host_url(&url);
        if !normalized.is_empty() && seen.insert(normalized.clone()) {
            candidates.push(normalized);
        }
    };

    let mut all_prefixes: Vec<String> = Vec::new();
    let mut add_prefix = |prefix: &str| {
        if !prefix.is_empty() && !all_prefixes.iter().any(|p| p == prefix) {
            all_prefixes.push(prefix.to_string());
        }
    };
    for prefix in prefixes {
        add_prefix(prefix);
    }

    if !strict {
        push(format!("http://127.0.0.1:{}", port));
        push(format!("http://localhost:{}", port));
        for url in host_urls {
            let normalized = normalize_host_url(url);
            if normalized.is_empty() {
                continue;
            }
            if let Some(prefix) = ipv4_prefix_of_url(&normalized) {
                add_prefix(&prefix);
            }
            push(normalized);
        }
    }

    for prefix in &all_prefixes {
        for host in 1..=254 {
            push(format!("http://{}.{}:{}", prefix, host, port));
        }
    }
    candidates
}

fn is_private_v4(addr: &Ipv4Addr) -> bool {
    addr.is_private() && !addr.is_loopback()
}

/// Best-effort discovery of the `/24` prefixes of this machine's private IPv4
/// interfaces. Gives up after `wait` and returns whatever it found.
pub async fn local_ipv4_prefixes(wait: Duration) -> Vec<String> {
    let discover = async {
        let mut prefixes: Vec<String> = Vec::new();
        for target in ROUTE_PROBE_TARGETS {
            let Ok(socket) = UdpSocket::bind("0.0.0.0:0").await else {
                continue;
            };
            if socket.connect(target).await.is_err() {
                continue;
            }
            if let Ok(local) = socket.local_addr() {
                if let IpAddr::V4(v4) = local.ip() {
                    if is_private_v4(&v4) {
                        let [a, b, c, _] = v4.octets();
                        let prefix = format!("{}.{}.{}", a, b, c);
                        if !prefixes.contains(&prefix) {
                            prefixes.push(prefix);
                        }
                    }
                }
            }
        }
        prefixes
    };
    match tokio::time::timeout(wait, discover).await {
        Ok(prefixes) => prefixes,
        Err(_) => {
            log::debug!("NetworkScanner: interface discovery timed out after {:?}", wait);
            Vec::new()
        }
    }
}

/// Clears the scanning flag when a scan ends, including when its future is dropped.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Concurrent prober for inference hosts.
pub struct NetworkScanner {
    client: Arc<dyn ClientWrapper>,
    config: ScannerConfig,
    scanning: AtomicBool,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl NetworkScanner {
    pub fn new(client: Arc<dyn ClientWrapper>, config: ScannerConfig) -> Self {
        Self {
            client,
            config,
            scanning: AtomicBool::new(false),
            event_handler: None,
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    async fn emit(&self, event: ScanEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_scan_event(&event).await;
        }
    }

    /// Work out which prefixes to probe and whether the scan is strict.
    async fn plan(&self, host_urls: &[String], custom_range: Option<&str>) -> (Vec<String>, bool) {
        if let Some(prefix) = custom_range.and_then(parse_scan_range) {
            return (vec![prefix], true);
        }
        if let Some(raw) = custom_range.filter(|r| !r.trim().is_empty()) {
            log::warn!("NetworkScanner: ignoring unparseable range {:?}", raw);
        }

        let mut prefixes: Vec<String> = DEFAULT_PREFIXES.iter().map(|p| p.to_string()).collect();
        for url in host_urls {
            if let Some(prefix) = ipv4_prefix_of_url(&normalize_host_url(url)) {
                prefixes.push(prefix);
            }
        }
        if self.config.detect_local_interfaces {
            prefixes.extend(local_ipv4_prefixes(self.config.interface_discovery_timeout).await);
        }
        let mut seen = HashSet::new();
        prefixes.retain(|p| seen.insert(p.clone()));
        (prefixes, false)
    }

    /// Probe the network for reachable hosts.
    ///
    /// `host_urls` are the configured hosts; `custom_range` (any text containing an IPv4
    /// address) restricts the scan to that address's `/24`.
    pub async fn scan(&self, host_urls: &[String], custom_range: Option<&str>) -> ScanOutcome {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::info!("NetworkScanner: scan already in progress");
            return ScanOutcome::AlreadyScanning;
        }
        let _guard = ScanGuard(&self.scanning);

        let (prefixes, strict) = self.plan(host_urls, custom_range).await;
        let candidates = build_scan_candidates(host_urls, &prefixes, strict, self.config.inference_port);
        log::info!(
            "NetworkScanner: probing {} candidates across {:?} (strict: {})",
            candidates.len(),
            prefixes,
            strict
        );
        self.emit(ScanEvent::Started {
            prefixes: prefixes.clone(),
            candidates: candidates.len(),
        })
        .await;

        let found = self.probe_all(&candidates).await;

        let mut seen = HashSet::new();
        let mut hosts: Vec<ScannedHost> = found
            .into_iter()
            .filter(|h| seen.insert(normalize_host_url(&h.url)))
            .collect();
        hosts.sort_by(|a, b| a.url.cmp(&b.url));

        self.emit(ScanEvent::Completed { hits: hosts.len() }).await;
        if hosts.is_empty() {
            log::info!("NetworkScanner: no reachable host found");
            ScanOutcome::NotFound
        } else {
            log::info!("NetworkScanner: found {} host(s)", hosts.len());
            ScanOutcome::Found(hosts)
        }
    }

    /// Run every probe through `concurrency` workers pulling from a shared cursor.
    async fn probe_all(&self, candidates: &[String]) -> Vec<ScannedHost> {
        let cursor = AtomicUsize::new(0);
        let found: Mutex<Vec<ScannedHost>> = Mutex::new(Vec::new());
        let workers = self.config.concurrency.max(1).min(candidates.len());

        let (cursor_ref, found_ref) = (&cursor, &found);
        join_all((0..workers).map(|_| async move {
            loop {
                let next = cursor_ref.fetch_add(1, Ordering::Relaxed);
                let Some(url) = candidates.get(next) else {
                    break;
                };
                if let Some(hit) = self.probe(url).await {
                    found_ref
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(hit);
                }
            }
        }))
        .await;

        found.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    async fn probe(&self, url: &str) -> Option<ScannedHost> {
        match tokio::time::timeout(self.config.probe_timeout, self.client.list_models(url)).await {
            Ok(Ok(models)) => {
                log::debug!("NetworkScanner: {} answered with {} models", url, models.len());
                Some(ScannedHost {
                    url: url.to_string(),
                    model_count: models.len(),
                })
            }
            Ok(Err(_)) | Err(_) => None,
        }
    }
}
