//! Orchestrator and scanner event system.
//!
//! Implement [`EventHandler`] to observe what the orchestrator is doing without polling
//! [`snapshot`](crate::orchestrator::Orchestrator::snapshot):
//!
//! - **Queue lifecycle**: requests queued, started and completed
//! - **Broadcast results**: each participant's reply or failure
//! - **Autonomous dialogue**: start, turn boundaries, interruptions, stop
//! - **Hosts**: status transitions
//! - **Network scans**: start and outcome
//!
//! Both trait methods default to no-ops. The handler is stored as
//! `Arc<dyn EventHandler>` and awaited inline, so a slow handler slows the emitting
//! task down; hand work off to a channel if that matters.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use multillama::event::{EventHandler, OrchestratorEvent};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl EventHandler for Printer {
//!     async fn on_orchestrator_event(&self, event: &OrchestratorEvent) {
//!         if let OrchestratorEvent::TurnCompleted { turn, speaker, .. } = event {
//!             println!("turn {} by {}", turn, speaker);
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use uuid::Uuid;

use crate::host_registry::HostStatus;
use crate::participant::ParticipantKey;

/// Events emitted by the [`Orchestrator`](crate::orchestrator::Orchestrator).
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    // ── Queue lifecycle ──────────────────────────────────────────────────

    /// A request was accepted into the queue.
    RequestQueued {
        request_id: Uuid,
        /// Queue length after the insertion, processing item included.
        queue_len: usize,
    },

    /// The head of the queue moved into the processing slot.
    RequestStarted {
        request_id: Uuid,
        /// Participants that receive the message after mention resolution.
        targets: Vec<ParticipantKey>,
    },

    /// Every participant call of a request has settled.
    RequestCompleted {
        request_id: Uuid,
        succeeded: usize,
        failed: usize,
    },

    // ── Per-participant results ──────────────────────────────────────────

    /// A participant produced a reply (broadcast or autonomous turn).
    ParticipantResponded {
        participant: ParticipantKey,
        /// Character length of the stored reply, after output limiting.
        response_length: usize,
    },

    /// A participant call failed; a synthesized error reply was recorded.
    ParticipantFailed {
        participant: ParticipantKey,
        error: String,
    },

    // ── Autonomous dialogue ──────────────────────────────────────────────

    AutonomousStarted {
        participants: Vec<ParticipantKey>,
        /// Seed the first speaker answers.
        seed: String,
    },

    /// A speaker was picked for the next turn.
    TurnStarted {
        /// 1-based turn counter.
        turn: usize,
        speaker: ParticipantKey,
    },

    /// A turn settled and the round-robin index advanced.
    TurnCompleted {
        /// 1-based turn counter matching the corresponding `TurnStarted`.
        turn: usize,
        speaker: ParticipantKey,
        /// Index of the next speaker.
        next_index: usize,
        success: bool,
    },

    /// A pending interruption was injected as a user turn.
    InterruptionApplied { text: String },

    /// The loop observed cancellation and exited.
    AutonomousStopped {
        /// Number of speaker turns completed.
        turns: usize,
    },

    // ── Hosts ────────────────────────────────────────────────────────────

    HostStatusChanged { host_id: String, status: HostStatus },
}

/// Events emitted by the [`NetworkScanner`](crate::network_scan::NetworkScanner).
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// Candidate generation finished and probing begins.
    Started {
        prefixes: Vec<String>,
        candidates: usize,
    },
    /// Probing finished. `hits` is zero for a "not found" outcome.
    Completed { hits: usize },
}

/// Receives orchestrator and scanner events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every [`OrchestratorEvent`]. Default: no-op.
    async fn on_orchestrator_event(&self, _event: &OrchestratorEvent) {}

    /// Called for every [`ScanEvent`]. Default: no-op.
    async fn on_scan_event(&self, _event: &ScanEvent) {}
}
