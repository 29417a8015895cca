//! The conversation orchestrator.
//!
//! [`Orchestrator`] owns every piece of mutable state (settings, host registry, sessions,
//! the outgoing queue and the autonomous run) and is the only way to change it. It is a
//! cheap `Clone` handle around shared state, so the presentation layer, spawned drain
//! tasks and the autonomous loop all talk to the same instance.
//!
//! State sits behind one mutex that is only ever taken for short, synchronous critical
//! sections and never held across an `.await`. Network calls run outside the lock and
//! write their results back in a fresh critical section, so concurrent broadcast replies
//! settle in any order without interfering with each other.
//!
//! # Broadcast flow
//!
//! ```text
//! submit ─▶ MessageQueue ─▶ process_next
//!                              ├─ resolve @mentions
//!                              ├─ append user message, mark targets loading
//!                              ├─ join_all(call each target)   (concurrent)
//!                              │    └─ reply / synthesized error + host `failed`
//!                              └─ finish queue item, persist
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use multillama::clients::ollama::OllamaClient;
//! use multillama::orchestrator::{Orchestrator, SubmitRequest};
//! use multillama::participant::ModelRef;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::builder(Arc::new(OllamaClient::new())).build();
//!     orchestrator.add_participant(ModelRef::new("host-local", "llama3:8b"))?;
//!     orchestrator.add_participant(ModelRef::new("host-local", "mistral"))?;
//!
//!     orchestrator.submit(SubmitRequest::text("@mistral what is a monad?")).await?;
//!     orchestrator.drain().await;
//!
//!     for participant in orchestrator.participants() {
//!         println!("{}: {:?}", participant.key, participant.messages.last());
//!     }
//!     Ok(())
//! }
//! ```

use futures_util::future::join_all;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::autonomous::{AutonomousReport, AutonomousRun, AutonomousStatus};
use crate::client_wrapper::{ClientError, ClientWrapper, Message, Role};
use crate::config::{OrchestratorConfig, Settings};
use crate::event::{EventHandler, OrchestratorEvent};
use crate::host_registry::{AvailableModel, Host, HostRegistry, HostStatus};
use crate::mentions::resolve_mentions;
use crate::message_queue::{MessageQueue, QueueError, QueuedRequest};
use crate::network_scan::{NetworkScanner, ScanOutcome};
use crate::participant::{ModelRef, Participant, ParticipantKey};
use crate::persistence::{PersistenceError, StateStore};
use crate::prompt::{
    apply_output_length_limit, build_request_messages, error_reply, flatten_attachments, image_payloads,
    Attachment,
};
use crate::session_store::{ChatState, ConversationSession, SessionStore};

/// Errors returned by [`Orchestrator`] operations.
///
/// Validation failures are reported before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    /// Neither text nor attachments were supplied.
    EmptyInput,
    /// No existing participant is targeted.
    NoTargets,
    /// The outgoing queue already holds `capacity` requests.
    QueueFull { capacity: usize },
    /// Autonomous mode needs at least two participants.
    NotEnoughParticipants,
    /// Autonomous mode found no seed message to start from.
    NoSeed,
    /// An interruption is already waiting for the next turn boundary.
    InterruptionPending,
    /// Autonomous mode is running.
    AutonomousActive,
    /// A broadcast request is being processed.
    Busy,
    UnknownParticipant(ParticipantKey),
    UnknownHost(String),
    UnknownSession(Uuid),
    /// The model already has an instance in the session and duplicates are disabled.
    DuplicateModel(ModelRef),
    /// The queued request is being processed and cannot be removed.
    QueueItemProcessing(Uuid),
    QueueItemNotFound(Uuid),
    /// A host rejected or failed a model management call.
    Client(ClientError),
    /// The operation needs a tokio runtime and none is running.
    NoRuntime,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::EmptyInput => write!(f, "Message is empty"),
            OrchestratorError::NoTargets => write!(f, "No model selected to receive the message"),
            OrchestratorError::QueueFull { capacity } => {
                write!(f, "Queue is full ({} requests); wait for one to finish", capacity)
            }
            OrchestratorError::NotEnoughParticipants => {
                write!(f, "Inter-model chat needs at least two models")
            }
            OrchestratorError::NoSeed => write!(f, "No message to start the inter-model chat from"),
            OrchestratorError::InterruptionPending => write!(
                f,
                "An interruption is already queued; wait for the next turn"
            ),
            OrchestratorError::AutonomousActive => write!(f, "Inter-model chat is running"),
            OrchestratorError::Busy => write!(f, "A request is being processed"),
            OrchestratorError::UnknownParticipant(key) => write!(f, "Unknown participant: {}", key),
            OrchestratorError::UnknownHost(id) => write!(f, "Unknown host: {}", id),
            OrchestratorError::UnknownSession(id) => write!(f, "Unknown session: {}", id),
            OrchestratorError::DuplicateModel(model) => {
                write!(f, "{} is already in this chat", model)
            }
            OrchestratorError::QueueItemProcessing(id) => {
                write!(f, "Request {} is being processed and cannot be removed", id)
            }
            OrchestratorError::QueueItemNotFound(id) => write!(f, "Request {} is not queued", id),
            OrchestratorError::Client(err) => write!(f, "{}", err),
            OrchestratorError::NoRuntime => write!(f, "No tokio runtime is running"),
        }
    }
}

impl Error for OrchestratorError {}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Full { capacity } => OrchestratorError::QueueFull { capacity },
            QueueError::Processing(id) => OrchestratorError::QueueItemProcessing(id),
            QueueError::NotFound(id) => OrchestratorError::QueueItemNotFound(id),
        }
    }
}

/// User input handed to [`Orchestrator::submit`].
#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Participants to address; `None` targets every participant of the active session.
    pub targets: Option<Vec<ParticipantKey>>,
    /// Start the autonomous dialogue with this input as seed once it reaches the head
    /// of the queue.
    pub start_autonomous: bool,
}

impl SubmitRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_targets(mut self, targets: Vec<ParticipantKey>) -> Self {
        self.targets = Some(targets);
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn autonomous(mut self) -> Self {
        self.start_autonomous = true;
        self
    }
}

/// What [`Orchestrator::submit`] did with the input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued(Uuid),
    /// Autonomous mode is running; the input will be injected at the next turn boundary.
    Interruption,
}

/// Result of one broadcast request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub request_id: Uuid,
    /// Participants addressed after mention resolution.
    pub targets: Vec<ParticipantKey>,
    pub succeeded: Vec<ParticipantKey>,
    pub failed: Vec<ParticipantKey>,
}

/// Result of [`Orchestrator::process_next`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Broadcast(BroadcastOutcome),
    AutonomousStarted { request_id: Uuid },
    AutonomousRejected { request_id: Uuid, error: OrchestratorError },
}

/// Point-in-time copy of everything the presentation layer renders.
#[derive(Clone, Debug)]
pub struct OrchestratorSnapshot {
    pub settings: Settings,
    pub session: ConversationSession,
    pub role_library: Vec<String>,
    pub queue: Vec<QueuedRequest>,
    pub processing: Option<Uuid>,
    pub host_statuses: HashMap<String, HostStatus>,
    pub catalog: Vec<AvailableModel>,
    pub autonomous: Option<AutonomousStatus>,
    pub scanning: bool,
}

/// Everything the orchestrator mutates.
pub(crate) struct OrchestratorState {
    pub(crate) settings: Settings,
    pub(crate) registry: HostRegistry,
    pub(crate) sessions: SessionStore,
    pub(crate) queue: MessageQueue,
    pub(crate) autonomous: Option<AutonomousRun>,
    pub(crate) autonomous_handle: Option<JoinHandle<AutonomousReport>>,
    /// Sequence number of the latest persistence snapshot taken.
    persist_seq: u64,
}

impl OrchestratorState {
    /// Settings with the host list taken from the registry, which owns it at runtime.
    fn settings_record(&self) -> Settings {
        let mut settings = self.settings.clone();
        settings.hosts = self.registry.hosts().to_vec();
        settings
    }

    pub(crate) fn is_broadcast_processing(&self) -> bool {
        self.queue.is_processing()
    }

    /// Record a synthesized error reply for `key` and flip its host to `failed`.
    /// Returns whether the host status changed.
    pub(crate) fn record_failure(
        &mut self,
        key: &ParticipantKey,
        err: &ClientError,
        replace_placeholder: bool,
    ) -> bool {
        let content = error_reply(&key.model_name, &err.to_string());
        write_reply(&mut self.sessions, key, content, replace_placeholder);
        if self.registry.host(&key.host_id).is_some() {
            self.registry.set_status(&key.host_id, HostStatus::Failed)
        } else {
            false
        }
    }
}

/// Append `content` as an assistant message, or overwrite the streaming placeholder.
pub(crate) fn write_reply(sessions: &mut SessionStore, key: &ParticipantKey, content: String, replace_placeholder: bool) {
    let Some(participant) = sessions.active_mut().participant_mut(key) else {
        return;
    };
    participant.loading = false;
    let overwrite = replace_placeholder
        && matches!(participant.messages.last(), Some(last) if last.role == Role::Assistant);
    match participant.messages.last_mut() {
        Some(last) if overwrite => last.content = content,
        _ => participant.messages.push(Message::assistant(content)),
    }
    sessions.active_mut().touch();
}

pub(crate) struct Inner {
    pub(crate) client: Arc<dyn ClientWrapper>,
    pub(crate) config: OrchestratorConfig,
    pub(crate) state: Mutex<OrchestratorState>,
    pub(crate) event_handler: Option<Arc<dyn EventHandler>>,
    pub(crate) store: Option<Arc<dyn StateStore>>,
    /// Sequence number of the newest snapshot written; held while writing.
    pub(crate) persisted_seq: Mutex<u64>,
    pub(crate) scanner: NetworkScanner,
}

/// A snapshot of the persisted records, taken under the state lock.
struct PersistJob {
    inner: Arc<Inner>,
    store: Arc<dyn StateStore>,
    seq: u64,
    settings: Settings,
    chat_state: ChatState,
}

impl PersistJob {
    /// Write the snapshot unless a newer one already reached the store.
    fn write(self) -> Result<(), PersistenceError> {
        let mut written = self
            .inner
            .persisted_seq
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *written >= self.seq {
            log::debug!("Orchestrator: skipping stale snapshot {}", self.seq);
            return Ok(());
        }
        self.store.save_settings(&self.settings)?;
        self.store.save_chat_state(&self.chat_state)?;
        *written = self.seq;
        Ok(())
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    client: Arc<dyn ClientWrapper>,
    settings: Settings,
    chat_state: Option<ChatState>,
    config: OrchestratorConfig,
    event_handler: Option<Arc<dyn EventHandler>>,
    store: Option<Arc<dyn StateStore>>,
}

impl OrchestratorBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn chat_state(mut self, state: ChatState) -> Self {
        self.chat_state = Some(state);
        self
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Persist through `store` after every settled mutation.
    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Persist through `store` and restore settings and chat state from it.
    pub fn restore_from(mut self, store: Arc<dyn StateStore>) -> Result<Self, PersistenceError> {
        if let Some(settings) = store.load_settings()? {
            self.settings = settings;
        }
        if let Some(state) = store.load_chat_state()? {
            self.chat_state = Some(state);
        }
        self.store = Some(store);
        Ok(self)
    }

    pub fn build(self) -> Orchestrator {
        let settings = self.settings.normalized();
        let registry = HostRegistry::new(settings.hosts.clone());
        let sessions = match self.chat_state {
            Some(state) => SessionStore::from_chat_state(state),
            None => SessionStore::new(),
        };
        let mut scanner = NetworkScanner::new(self.client.clone(), self.config.scanner.clone());
        if let Some(handler) = &self.event_handler {
            scanner = scanner.with_event_handler(handler.clone());
        }
        let state = OrchestratorState {
            settings,
            registry,
            sessions,
            queue: MessageQueue::new(self.config.queue_capacity),
            autonomous: None,
            autonomous_handle: None,
            persist_seq: 0,
        };
        Orchestrator {
            inner: Arc::new(Inner {
                client: self.client,
                config: self.config,
                state: Mutex::new(state),
                event_handler: self.event_handler,
                store: self.store,
                persisted_seq: Mutex::new(0),
                scanner,
            }),
        }
    }
}

/// Handle to the shared orchestrator state.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) inner: Arc<Inner>,
}

/// One participant call prepared under the lock and executed outside it.
struct CallJob {
    key: ParticipantKey,
    host_url: Option<String>,
    messages: Vec<Message>,
    max_output: Option<usize>,
}

impl Orchestrator {
    pub fn builder(client: Arc<dyn ClientWrapper>) -> OrchestratorBuilder {
        OrchestratorBuilder {
            client,
            settings: Settings::default(),
            chat_state: None,
            config: OrchestratorConfig::default(),
            event_handler: None,
            store: None,
        }
    }

    pub fn new(client: Arc<dyn ClientWrapper>) -> Self {
        Self::builder(client).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn ClientWrapper> {
        &self.inner.client
    }

    /// Run `f` inside a short critical section. Never call from inside another `f`.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut OrchestratorState) -> R) -> R {
        let mut guard = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    pub(crate) async fn emit(&self, event: OrchestratorEvent) {
        if let Some(handler) = &self.inner.event_handler {
            handler.on_orchestrator_event(&event).await;
        }
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Save settings and chat state through the configured store. A no-op without a
    /// store or when local persistence is switched off.
    pub fn persist(&self) -> Result<(), PersistenceError> {
        match self.persist_job() {
            Some(job) => job.write(),
            None => Ok(()),
        }
    }

    fn persist_job(&self) -> Option<PersistJob> {
        let store = self.inner.store.clone()?;
        let (seq, settings, chat_state) = self.with_state(|s| {
            s.persist_seq += 1;
            (s.persist_seq, s.settings_record(), s.sessions.to_chat_state())
        });
        if !settings.persist_data_locally {
            return None;
        }
        Some(PersistJob {
            inner: self.inner.clone(),
            store,
            seq,
            settings,
            chat_state,
        })
    }

    pub(crate) fn persist_quietly(&self) {
        if let Err(err) = self.persist() {
            log::warn!("Orchestrator: failed to persist state: {}", err);
        }
    }

    /// Persist from async code. The store is written on the blocking pool so file I/O
    /// never stalls a runtime worker.
    pub(crate) async fn persist_in_background(&self) {
        let Some(job) = self.persist_job() else {
            return;
        };
        match tokio::task::spawn_blocking(move || job.write()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::warn!("Orchestrator: failed to persist state: {}", err),
            Err(err) => log::error!("Orchestrator: persistence task failed: {}", err),
        }
    }

    // ── Settings ─────────────────────────────────────────────────────────

    /// Current settings, host list included.
    pub fn settings(&self) -> Settings {
        self.with_state(|s| s.settings_record())
    }

    /// Edit settings in place. Host changes are ignored here; use the host operations.
    pub fn update_settings(&self, f: impl FnOnce(&mut Settings)) {
        self.with_state(|s| {
            let mut edited = s.settings.clone();
            f(&mut edited);
            let hosts = s.registry.hosts().to_vec();
            edited.hosts = hosts;
            s.settings = edited.normalized();
        });
        self.persist_quietly();
    }

    // ── Hosts ────────────────────────────────────────────────────────────

    pub fn hosts(&self) -> Vec<Host> {
        self.with_state(|s| s.registry.hosts().to_vec())
    }

    pub fn host_status(&self, host_id: &str) -> HostStatus {
        self.with_state(|s| s.registry.status(host_id))
    }

    pub fn catalog(&self) -> Vec<AvailableModel> {
        self.with_state(|s| s.registry.catalog().to_vec())
    }

    /// Add a host by URL; returns the id of the new or already configured host.
    pub fn add_host(&self, url: &str) -> Result<String, OrchestratorError> {
        let id = self
            .with_state(|s| s.registry.add_host(url))
            .ok_or(OrchestratorError::EmptyInput)?;
        self.persist_quietly();
        Ok(id)
    }

    pub fn update_host_url(&self, host_id: &str, url: &str) -> Result<(), OrchestratorError> {
        if url.trim().is_empty() {
            return Err(OrchestratorError::EmptyInput);
        }
        if !self.with_state(|s| s.registry.update_host_url(host_id, url)) {
            return Err(OrchestratorError::UnknownHost(host_id.to_string()));
        }
        self.persist_quietly();
        Ok(())
    }

    /// Remove a host. Its catalog entries go with it, and every participant it served is
    /// dropped from every session, from queued requests and from the autonomous run.
    pub fn remove_host(&self, host_id: &str) -> Result<Host, OrchestratorError> {
        let removed = self.with_state(|s| {
            let host = s.registry.remove_host(host_id)?;
            let keys = s.sessions.remove_host_participants(host_id);
            let dropped = s.queue.purge_targets(|k| k.host_id == host_id);
            if let Some(run) = s.autonomous.as_mut() {
                for key in &keys {
                    run.remove_participant(key);
                }
            }
            log::info!(
                "Orchestrator: removed host {} ({} participants, {} queued requests)",
                host_id,
                keys.len(),
                dropped
            );
            Some(host)
        });
        let host = removed.ok_or_else(|| OrchestratorError::UnknownHost(host_id.to_string()))?;
        self.persist_quietly();
        Ok(host)
    }

    pub(crate) async fn set_host_status(&self, host_id: &str, status: HostStatus) {
        let changed = self.with_state(|s| {
            s.registry.host(host_id).is_some() && s.registry.set_status(host_id, status)
        });
        if changed {
            self.emit(OrchestratorEvent::HostStatusChanged {
                host_id: host_id.to_string(),
                status,
            })
            .await;
        }
    }

    /// Probe a host's model listing: `testing`, then `connected` with a refreshed
    /// catalog, or `failed`.
    pub async fn test_connection(&self, host_id: &str) -> Result<HostStatus, OrchestratorError> {
        let url = self
            .with_state(|s| s.registry.resolve(host_id))
            .ok_or_else(|| OrchestratorError::UnknownHost(host_id.to_string()))?;
        self.set_host_status(host_id, HostStatus::Testing).await;

        let status = match self.client().list_models(&url).await {
            Ok(models) => {
                log::info!("Orchestrator: {} serves {} models", url, models.len());
                self.with_state(|s| s.registry.replace_models(host_id, models));
                HostStatus::Connected
            }
            Err(err) => {
                log::warn!("Orchestrator: connection test failed for {}: {}", url, err);
                HostStatus::Failed
            }
        };
        self.set_host_status(host_id, status).await;
        Ok(status)
    }

    /// Test every configured host concurrently.
    pub async fn refresh_all_hosts(&self) -> Vec<(String, HostStatus)> {
        let ids: Vec<String> = self.with_state(|s| s.registry.hosts().iter().map(|h| h.id.clone()).collect());
        let results = join_all(ids.iter().map(|id| self.test_connection(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, result)| result.ok().map(|status| (id, status)))
            .collect()
    }

    /// Scan the local network for inference hosts.
    pub async fn scan_network(&self, custom_range: Option<&str>) -> ScanOutcome {
        let urls: Vec<String> = self.with_state(|s| s.registry.hosts().iter().map(|h| h.url.clone()).collect());
        self.inner.scanner.scan(&urls, custom_range).await
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanner.is_scanning()
    }

    /// Add a host found by a scan (or reuse the configured one) and test it.
    pub async fn add_scanned_host(&self, url: &str) -> Result<(String, HostStatus), OrchestratorError> {
        let id = self.add_host(url)?;
        let status = self.test_connection(&id).await?;
        Ok((id, status))
    }

    /// Ask a host to download a model, then refresh its catalog.
    pub async fn pull_model(&self, host_id: &str, model: &str) -> Result<(), OrchestratorError> {
        let url = self
            .with_state(|s| s.registry.resolve(host_id))
            .ok_or_else(|| OrchestratorError::UnknownHost(host_id.to_string()))?;
        self.client()
            .pull_model(&url, model)
            .await
            .map_err(OrchestratorError::Client)?;
        self.test_connection(host_id).await?;
        Ok(())
    }

    /// Ask a host to delete a model, then refresh its catalog.
    pub async fn delete_model(&self, host_id: &str, model: &str) -> Result<(), OrchestratorError> {
        let url = self
            .with_state(|s| s.registry.resolve(host_id))
            .ok_or_else(|| OrchestratorError::UnknownHost(host_id.to_string()))?;
        self.client()
            .delete_model(&url, model)
            .await
            .map_err(OrchestratorError::Client)?;
        self.test_connection(host_id).await?;
        Ok(())
    }

    // ── Participants ─────────────────────────────────────────────────────

    pub fn participants(&self) -> Vec<Participant> {
        self.with_state(|s| s.sessions.active().participants.clone())
    }

    pub fn participant_keys(&self) -> Vec<ParticipantKey> {
        self.with_state(|s| s.sessions.active().keys())
    }

    pub fn participant(&self, key: &ParticipantKey) -> Option<Participant> {
        self.with_state(|s| s.sessions.active().participant(key).cloned())
    }

    pub fn display_name(&self, key: &ParticipantKey) -> String {
        self.with_state(|s| s.sessions.active().display_name(key))
    }

    /// Add an instance of `model` to the active session.
    pub fn add_participant(&self, model: ModelRef) -> Result<ParticipantKey, OrchestratorError> {
        let key = self.with_state(|s| -> Result<ParticipantKey, OrchestratorError> {
            if s.registry.host(&model.host_id).is_none() {
                return Err(OrchestratorError::UnknownHost(model.host_id.clone()));
            }
            let allow = s.settings.allow_same_model_multi_chat;
            s.sessions
                .add_participant(&model, allow)
                .ok_or_else(|| OrchestratorError::DuplicateModel(model.clone()))
        })?;
        self.persist_quietly();
        Ok(key)
    }

    /// Add a copy of an existing participant, history and role included.
    pub fn duplicate_participant(&self, key: &ParticipantKey) -> Result<ParticipantKey, OrchestratorError> {
        let copy = self
            .with_state(|s| s.sessions.duplicate_participant(key))
            .ok_or_else(|| OrchestratorError::UnknownParticipant(key.clone()))?;
        self.persist_quietly();
        Ok(copy)
    }

    /// Remove a participant from the active session, from every queued request and from
    /// the autonomous run. A run left with fewer than two members is cancelled.
    pub fn remove_participant(&self, key: &ParticipantKey) -> Result<Participant, OrchestratorError> {
        let removed = self.with_state(|s| {
            let removed = s.sessions.remove_participant(key)?;
            s.queue.purge_targets(|k| k == key);
            if let Some(run) = s.autonomous.as_mut() {
                run.remove_participant(key);
            }
            Some(removed)
        });
        let removed = removed.ok_or_else(|| OrchestratorError::UnknownParticipant(key.clone()))?;
        self.persist_quietly();
        Ok(removed)
    }

    /// Assign a role; returns the normalized label.
    pub fn set_role(&self, key: &ParticipantKey, label: &str) -> Result<String, OrchestratorError> {
        let label = self
            .with_state(|s| s.sessions.set_role(key, label))
            .ok_or_else(|| OrchestratorError::UnknownParticipant(key.clone()))?;
        self.persist_quietly();
        Ok(label)
    }

    pub fn role_library(&self) -> Vec<String> {
        self.with_state(|s| s.sessions.role_library().to_vec())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    fn ensure_idle(state: &OrchestratorState) -> Result<(), OrchestratorError> {
        if state.autonomous.is_some() {
            return Err(OrchestratorError::AutonomousActive);
        }
        if state.is_broadcast_processing() {
            return Err(OrchestratorError::Busy);
        }
        Ok(())
    }

    pub fn active_session(&self) -> ConversationSession {
        self.with_state(|s| s.sessions.active().clone())
    }

    /// Sessions, most recently updated first.
    pub fn sessions(&self) -> Vec<ConversationSession> {
        self.with_state(|s| s.sessions.sessions().into_iter().cloned().collect())
    }

    pub fn new_session(&self) -> Result<Uuid, OrchestratorError> {
        let id = self.with_state(|s| -> Result<Uuid, OrchestratorError> {
            Self::ensure_idle(s)?;
            s.queue.clear();
            Ok(s.sessions.new_session())
        })?;
        self.persist_quietly();
        Ok(id)
    }

    /// Activate another session. Requests still waiting in the queue target the old
    /// session's participants and are discarded.
    pub fn switch_session(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.with_state(|s| -> Result<(), OrchestratorError> {
            Self::ensure_idle(s)?;
            if !s.sessions.switch_session(id) {
                return Err(OrchestratorError::UnknownSession(id));
            }
            s.queue.clear();
            Ok(())
        })?;
        self.persist_quietly();
        Ok(())
    }

    pub fn delete_session(&self, id: Uuid) -> Result<(), OrchestratorError> {
        self.with_state(|s| -> Result<(), OrchestratorError> {
            Self::ensure_idle(s)?;
            let was_active = s.sessions.active_id() == id;
            s.sessions
                .delete_session(id)
                .ok_or(OrchestratorError::UnknownSession(id))?;
            if was_active {
                s.queue.clear();
            }
            Ok(())
        })?;
        self.persist_quietly();
        Ok(())
    }

    // ── Queue ────────────────────────────────────────────────────────────

    pub fn queued_requests(&self) -> Vec<QueuedRequest> {
        self.with_state(|s| s.queue.items().cloned().collect())
    }

    /// Cancel a waiting request. The processing one cannot be cancelled.
    pub fn remove_queued(&self, id: Uuid) -> Result<QueuedRequest, OrchestratorError> {
        Ok(self.with_state(|s| s.queue.remove(id))?)
    }

    /// Accept user input.
    ///
    /// While autonomous mode runs the input becomes the pending interruption; otherwise
    /// it is queued and, with `auto_drain`, a drain task is spawned. A run that was asked
    /// to stop no longer takes interruptions, so input sent while it winds down is queued
    /// and drained once the loop exits.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitOutcome, OrchestratorError> {
        if request.text.trim().is_empty() && request.attachments.is_empty() {
            return Err(OrchestratorError::EmptyInput);
        }

        let outcome = self.with_state(|s| -> Result<(SubmitOutcome, usize), OrchestratorError> {
            if let Some(run) = s.autonomous.as_mut().filter(|r| !r.token.is_cancelled()) {
                if run.pending_interruption.is_some() {
                    return Err(OrchestratorError::InterruptionPending);
                }
                let text = flatten_attachments(&request.text, &request.attachments);
                let images = image_payloads(&request.attachments);
                run.pending_interruption = Some(Message::user(text).with_images(images));
                return Ok((SubmitOutcome::Interruption, 0));
            }

            let session = s.sessions.active();
            let targets: Vec<ParticipantKey> = match &request.targets {
                Some(wanted) => session
                    .keys()
                    .into_iter()
                    .filter(|k| wanted.contains(k))
                    .collect(),
                None => session.keys(),
            };
            if targets.is_empty() {
                return Err(OrchestratorError::NoTargets);
            }
            let mut queued = QueuedRequest::new(request.text.clone(), request.attachments.clone(), targets);
            queued.autonomous_mode_requested = request.start_autonomous;
            let id = s.queue.enqueue(queued)?;
            Ok((SubmitOutcome::Queued(id), s.queue.len()))
        })?;

        match &outcome.0 {
            SubmitOutcome::Queued(id) => {
                log::debug!("Orchestrator: queued request {} ({} in queue)", id, outcome.1);
                self.emit(OrchestratorEvent::RequestQueued {
                    request_id: *id,
                    queue_len: outcome.1,
                })
                .await;
                if self.inner.config.auto_drain {
                    self.kick_drain();
                }
            }
            SubmitOutcome::Interruption => {
                log::info!("Orchestrator: interruption pending for the next turn");
            }
        }
        Ok(outcome.0)
    }

    /// Spawn a drain task when a runtime is available.
    pub(crate) fn kick_drain(&self) {
        match Handle::try_current() {
            Ok(handle) => {
                let orchestrator = self.clone();
                handle.spawn(async move { orchestrator.drain().await });
            }
            Err(_) => log::debug!("Orchestrator: no runtime, queue left for a manual drain"),
        }
    }

    /// Process queued requests until the queue is empty, autonomous mode starts, or
    /// another task holds the processing slot.
    pub async fn drain(&self) -> usize {
        let mut processed = 0;
        while self.process_next().await.is_some() {
            processed += 1;
        }
        processed
    }

    /// Process the head of the queue. `None` when there is nothing to do right now:
    /// the queue is empty, an item is already processing, or autonomous mode runs.
    pub async fn process_next(&self) -> Option<ProcessOutcome> {
        let request = self.with_state(|s| {
            if s.autonomous.is_some() {
                return None;
            }
            s.queue.begin_next()
        })?;

        if request.autonomous_mode_requested {
            self.with_state(|s| s.queue.finish(request.id));
            let seed = flatten_attachments(&request.raw_input, &request.attachments);
            return Some(match self.start_autonomous(Some(&seed), request.targets.clone()) {
                Ok(()) => ProcessOutcome::AutonomousStarted {
                    request_id: request.id,
                },
                Err(error) => {
                    log::warn!("Orchestrator: could not start inter-model chat: {}", error);
                    ProcessOutcome::AutonomousRejected {
                        request_id: request.id,
                        error,
                    }
                }
            });
        }

        Some(ProcessOutcome::Broadcast(self.run_broadcast(request).await))
    }

    /// Fan one request out to its targets and wait for every call to settle.
    async fn run_broadcast(&self, request: QueuedRequest) -> BroadcastOutcome {
        let (jobs, streaming) = self.with_state(|s| {
            let session = s.sessions.active();
            let candidates: Vec<ParticipantKey> = session
                .keys()
                .into_iter()
                .filter(|k| request.targets.contains(k))
                .collect();
            let resolution = resolve_mentions(&request.raw_input, &candidates);
            let text = if resolution.text.is_empty() && request.attachments.is_empty() {
                request.raw_input.trim().to_string()
            } else {
                resolution.text
            };
            let content = flatten_attachments(&text, &request.attachments);
            let images = image_payloads(&request.attachments);

            let roles_enabled = s.settings.enable_roles;
            let chat_config = s.settings.chat_config.clone();
            let max_output = chat_config.effective_max_output_length();
            let mut jobs = Vec::with_capacity(resolution.targets.len());
            for key in resolution.targets {
                let host_url = s.registry.resolve(&key.host_id);
                let Some(participant) = s.sessions.active_mut().participant_mut(&key) else {
                    continue;
                };
                participant
                    .messages
                    .push(Message::user(content.clone()).with_images(images.clone()));
                participant.loading = true;
                let messages =
                    build_request_messages(&participant.role, roles_enabled, &participant.messages, &chat_config);
                jobs.push(CallJob {
                    key,
                    host_url,
                    messages,
                    max_output,
                });
            }
            s.sessions.active_mut().touch();
            (jobs, s.settings.enable_message_streaming)
        });

        let targets: Vec<ParticipantKey> = jobs.iter().map(|j| j.key.clone()).collect();
        log::info!(
            "Orchestrator: broadcasting request {} to {} participant(s)",
            request.id,
            targets.len()
        );
        self.emit(OrchestratorEvent::RequestStarted {
            request_id: request.id,
            targets: targets.clone(),
        })
        .await;

        let results = join_all(jobs.iter().map(|job| self.dispatch(job, streaming))).await;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (job, ok) in jobs.iter().zip(results) {
            if ok {
                succeeded.push(job.key.clone());
            } else {
                failed.push(job.key.clone());
            }
        }

        self.with_state(|s| {
            s.queue.finish(request.id);
        });
        self.persist_in_background().await;
        self.emit(OrchestratorEvent::RequestCompleted {
            request_id: request.id,
            succeeded: succeeded.len(),
            failed: failed.len(),
        })
        .await;

        BroadcastOutcome {
            request_id: request.id,
            targets,
            succeeded,
            failed,
        }
    }

    /// Run one participant call and record its outcome. Returns `true` on success.
    async fn dispatch(&self, job: &CallJob, streaming: bool) -> bool {
        let mut placeholder = false;
        let result = self.call_backend(job, streaming, &mut placeholder).await;
        match result {
            Ok(content) => {
                let length = content.chars().count();
                self.with_state(|s| write_reply(&mut s.sessions, &job.key, content, placeholder));
                self.emit(OrchestratorEvent::ParticipantResponded {
                    participant: job.key.clone(),
                    response_length: length,
                })
                .await;
                true
            }
            Err(err) => {
                log::warn!("Orchestrator: {} failed: {}", job.key, err);
                let changed = self.with_state(|s| s.record_failure(&job.key, &err, placeholder));
                if changed {
                    self.emit(OrchestratorEvent::HostStatusChanged {
                        host_id: job.key.host_id.clone(),
                        status: HostStatus::Failed,
                    })
                    .await;
                }
                self.emit(OrchestratorEvent::ParticipantFailed {
                    participant: job.key.clone(),
                    error: err.to_string(),
                })
                .await;
                false
            }
        }
    }

    async fn call_backend(&self, job: &CallJob, streaming: bool, placeholder: &mut bool) -> Result<String, ClientError> {
        let url = job.host_url.as_deref().ok_or_else(|| ClientError::Network {
            host: job.key.host_id.clone(),
            detail: "Host is no longer configured".to_string(),
        })?;
        let model = job.key.model_name.as_str();

        if streaming {
            match self.client().send_message_stream(url, model, &job.messages).await {
                Ok(mut stream) => {
                    self.with_state(|s| {
                        if let Some(p) = s.sessions.active_mut().participant_mut(&job.key) {
                            p.messages.push(Message::assistant(String::new()));
                        }
                    });
                    *placeholder = true;
                    let mode = self.client().chunk_mode();
                    let mut accumulated = String::new();
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk?;
                        mode.accumulate(&mut accumulated, &chunk.content);
                        let shown = apply_output_length_limit(&accumulated, job.max_output);
                        self.with_state(|s| {
                            if let Some(p) = s.sessions.active_mut().participant_mut(&job.key) {
                                if let Some(last) = p.messages.last_mut() {
                                    last.content = shown;
                                }
                            }
                        });
                        if chunk.is_final {
                            break;
                        }
                    }
                    return Ok(apply_output_length_limit(&accumulated, job.max_output));
                }
                Err(ClientError::Unsupported(_)) => {
                    log::debug!("Orchestrator: streaming unsupported, falling back to batch call");
                }
                Err(err) => return Err(err),
            }
        }

        let reply = self.client().send_message(url, model, &job.messages).await?;
        Ok(apply_output_length_limit(&reply.content, job.max_output))
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        let scanning = self.inner.scanner.is_scanning();
        self.with_state(|s| OrchestratorSnapshot {
            settings: s.settings_record(),
            session: s.sessions.active().clone(),
            role_library: s.sessions.role_library().to_vec(),
            queue: s.queue.items().cloned().collect(),
            processing: s.queue.processing(),
            host_statuses: s.registry.statuses().clone(),
            catalog: s.registry.catalog().to_vec(),
            autonomous: s.autonomous.as_ref().map(AutonomousRun::status),
            scanning,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_wrapper::ModelInfo;
    use async_trait::async_trait;

    struct SilentClient;

    #[async_trait]
    impl ClientWrapper for SilentClient {
        async fn list_models(&self, _base_url: &str) -> Result<Vec<ModelInfo>, ClientError> {
            Ok(Vec::new())
        }

        async fn send_message(
            &self,
            _base_url: &str,
            _model: &str,
            _messages: &[Message],
        ) -> Result<Message, ClientError> {
            Ok(Message::assistant("ok"))
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        settings: Mutex<Option<Settings>>,
        chat_state: Mutex<Option<ChatState>>,
    }

    impl StateStore for MemoryStore {
        fn load_settings(&self) -> Result<Option<Settings>, PersistenceError> {
            Ok(self.settings.lock().unwrap().clone())
        }

        fn save_settings(&self, settings: &Settings) -> Result<(), PersistenceError> {
            *self.settings.lock().unwrap() = Some(settings.clone());
            Ok(())
        }

        fn load_chat_state(&self) -> Result<Option<ChatState>, PersistenceError> {
            Ok(self.chat_state.lock().unwrap().clone())
        }

        fn save_chat_state(&self, state: &ChatState) -> Result<(), PersistenceError> {
            *self.chat_state.lock().unwrap() = Some(state.clone());
            Ok(())
        }
    }

    #[test]
    fn test_stale_snapshot_never_overwrites_a_newer_one() {
        let store = Arc::new(MemoryStore::default());
        let orchestrator = Orchestrator::builder(Arc::new(SilentClient))
            .state_store(store.clone())
            .build();

        orchestrator.update_settings(|s| s.enable_message_streaming = false);
        let older = orchestrator.persist_job().unwrap();
        orchestrator.update_settings(|s| s.enable_message_streaming = true);
        let newer = orchestrator.persist_job().unwrap();

        newer.write().unwrap();
        older.write().unwrap();
        let saved = store.settings.lock().unwrap().clone().unwrap();
        assert!(saved.enable_message_streaming);
    }

    #[tokio::test]
    async fn test_background_persist_lands_before_returning() {
        let store = Arc::new(MemoryStore::default());
        let orchestrator = Orchestrator::builder(Arc::new(SilentClient))
            .state_store(store.clone())
            .build();
        orchestrator.with_state(|s| s.settings.enable_message_streaming = true);

        orchestrator.persist_in_background().await;
        let saved = store.settings.lock().unwrap().clone().unwrap();
        assert!(saved.enable_message_streaming);
    }
}
