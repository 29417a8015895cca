//! # multillama
//!
//! multillama talks to several locally hosted language models at once. It is the engine
//! behind a multi-model chat front end. The presentation layer is kept out of the crate:
//! it submits user intent to an [`Orchestrator`] and renders whatever state the
//! orchestrator exposes.
//!
//! The crate provides:
//!
//! * **Targeted broadcast**: one message fanned out concurrently to every selected model,
//!   narrowed with `@model` / `@model#2` mentions ([`mentions`]).
//! * **Autonomous dialogue**: a round-robin conversation between models that the user can
//!   interrupt between turns and stop cooperatively ([`autonomous`]).
//! * **Outgoing queue**: a bounded FIFO so only one broadcast runs at a time
//!   ([`message_queue`]).
//! * **Hosts**: URL normalization, connection status and model catalogs
//!   ([`host_registry`]), plus discovery of hosts on the local network
//!   ([`network_scan`]).
//! * **Sessions**: named conversations persisted as JSON ([`session_store`],
//!   [`persistence`]).
//!
//! Backends sit behind the [`ClientWrapper`] trait; [`clients::ollama::OllamaClient`]
//! implements it for the Ollama HTTP API.
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use multillama::clients::ollama::OllamaClient;
//! use multillama::orchestrator::{Orchestrator, SubmitRequest};
//! use multillama::participant::ModelRef;
//! use multillama::persistence::JsonFileStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     multillama::init_logger();
//!
//!     let orchestrator = Orchestrator::builder(Arc::new(OllamaClient::new()))
//!         .restore_from(Arc::new(JsonFileStore::new("./multillama-data")))?
//!         .build();
//!     orchestrator.refresh_all_hosts().await;
//!
//!     let llama = orchestrator.add_participant(ModelRef::new("host-local", "llama3:8b"))?;
//!     let qwen = orchestrator.add_participant(ModelRef::new("host-local", "qwen2.5:7b"))?;
//!
//!     orchestrator
//!         .submit(SubmitRequest::text("Name one sorting algorithm each.").autonomous())
//!         .await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     orchestrator.stop_autonomous();
//!
//!     if let Some(report) = orchestrator.wait_autonomous().await {
//!         for entry in report.transcript {
//!             println!("{}: {}", entry.speaker, entry.content);
//!         }
//!     }
//!     println!("{} / {}", orchestrator.display_name(&llama), orchestrator.display_name(&qwen));
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Filtering follows `RUST_LOG`, e.g. `RUST_LOG=multillama=debug`.
///
/// ```rust
/// multillama::init_logger();
/// multillama::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `multillama` module.
pub mod multillama;

// Re-exporting key items for easier external access.
pub use multillama::autonomous;
pub use multillama::autonomous::{AutonomousReport, AutonomousStatus, TranscriptEntry};
pub use multillama::client_wrapper;
pub use multillama::client_wrapper::{
    ChunkMode, ClientError, ClientWrapper, Message, MessageChunk, MessageChunkStream, ModelInfo,
    Role,
};
pub use multillama::clients;
pub use multillama::config;
pub use multillama::config::{ChatConfiguration, OrchestratorConfig, ScannerConfig, Settings};
pub use multillama::event;
pub use multillama::event::{EventHandler, OrchestratorEvent, ScanEvent};
pub use multillama::host_registry;
pub use multillama::host_registry::{Host, HostStatus};
pub use multillama::mentions;
pub use multillama::message_queue;
pub use multillama::network_scan;
pub use multillama::network_scan::{NetworkScanner, ScanOutcome, ScannedHost};
pub use multillama::orchestrator;
pub use multillama::orchestrator::{
    Orchestrator, OrchestratorError, OrchestratorSnapshot, SubmitOutcome, SubmitRequest,
};
pub use multillama::participant;
pub use multillama::participant::{ModelRef, Participant, ParticipantKey};
pub use multillama::persistence;
pub use multillama::persistence::{JsonFileStore, StateStore};
pub use multillama::prompt;
pub use multillama::prompt::Attachment;
pub use multillama::roles;
pub use multillama::session_store;
pub use multillama::session_store::{ConversationSession, SessionStore};
