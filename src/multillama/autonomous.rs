//! Autonomous round-robin dialogue between participants.
//!
//! ```text
//!  Idle ──start_autonomous──▶ Running ──stop_autonomous / < 2 members──▶ Idle
//!                              │  ▲
//!                              ▼  │   per iteration:
//!                 cancelled? ─▶ exit
//!                 pending interruption? ─▶ inject as "User" turn, loop
//!                 speaker = participants[index]
//!                 prompt  = room + windowed transcript + latest speaker
//!                 call backend (never aborted mid-flight)
//!                 record reply or error, index = (index + 1) mod N
//!                 sleep inter_turn_delay (cut short by cancellation)
//! ```
//!
//! Each member keeps a run-local context history (the explicit seed, interruptions and
//! its own replies). Every turn sends that context plus a prompt rebuilt from the shared
//! transcript, so every member sees the whole conversation and not only the last reply.
//! The transcript quoted in the prompt is bounded by
//! [`OrchestratorConfig::transcript_window`](crate::config::OrchestratorConfig::transcript_window).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::client_wrapper::{ClientError, Message, Role};
use crate::event::OrchestratorEvent;
use crate::host_registry::HostStatus;
use crate::orchestrator::{write_reply, Orchestrator, OrchestratorError, OrchestratorState};
use crate::participant::ParticipantKey;
use crate::prompt::{apply_output_length_limit, build_request_messages, compose_turn_prompt};
use crate::session_store::ConversationSession;

/// Speaker label of user turns in the transcript.
pub const USER_SPEAKER: &str = "User";

/// One line of the shared transcript.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// Display name of the participant, or [`USER_SPEAKER`].
    pub speaker: String,
    pub content: String,
}

impl TranscriptEntry {
    pub fn new(speaker: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            speaker: speaker.into(),
            content: content.into(),
        }
    }
}

/// Live view of a running dialogue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutonomousStatus {
    pub participants: Vec<ParticipantKey>,
    /// Index of the next (or current) speaker.
    pub index: usize,
    /// Participant whose call is in flight.
    pub current_speaker: Option<ParticipantKey>,
    pub pending_interruption: Option<String>,
    pub transcript_len: usize,
    pub turns: usize,
}

/// Summary returned once the loop exits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AutonomousReport {
    /// Completed speaker turns (interruptions not counted).
    pub turns: usize,
    /// Index the next turn would have used.
    pub next_index: usize,
    pub transcript: Vec<TranscriptEntry>,
}

pub(crate) struct AutonomousRun {
    pub(crate) token: CancellationToken,
    pub(crate) participants: Vec<ParticipantKey>,
    pub(crate) index: usize,
    pub(crate) pending_interruption: Option<Message>,
    pub(crate) transcript: Vec<TranscriptEntry>,
    contexts: HashMap<ParticipantKey, Vec<Message>>,
    current_speaker: Option<ParticipantKey>,
    turns: usize,
}

impl AutonomousRun {
    fn new(token: CancellationToken, participants: Vec<ParticipantKey>) -> Self {
        Self {
            token,
            participants,
            index: 0,
            pending_interruption: None,
            transcript: Vec::new(),
            contexts: HashMap::new(),
            current_speaker: None,
            turns: 0,
        }
    }

    pub(crate) fn status(&self) -> AutonomousStatus {
        AutonomousStatus {
            participants: self.participants.clone(),
            index: self.index,
            current_speaker: self.current_speaker.clone(),
            pending_interruption: self.pending_interruption.as_ref().map(|m| m.content.clone()),
            transcript_len: self.transcript.len(),
            turns: self.turns,
        }
    }

    fn push_user_turn(&mut self, message: &Message) {
        for key in &self.participants {
            self.contexts
                .entry(key.clone())
                .or_default()
                .push(message.clone());
        }
        self.transcript
            .push(TranscriptEntry::new(USER_SPEAKER, message.content.clone()));
    }

    /// Drop a member, keeping `index` on the same upcoming speaker. Fewer than two
    /// remaining members cancels the run.
    pub(crate) fn remove_participant(&mut self, key: &ParticipantKey) {
        let Some(position) = self.participants.iter().position(|k| k == key) else {
            return;
        };
        self.participants.remove(position);
        self.contexts.remove(key);
        if position < self.index {
            self.index -= 1;
        }
        if self.index >= self.participants.len() {
            self.index = 0;
        }
        if self.participants.len() < 2 {
            log::info!("Autonomous: fewer than two members left, stopping");
            self.token.cancel();
            self.pending_interruption = None;
        }
    }

    /// Index of the speaker after `speaker`, given the membership as it is now.
    fn advance_after(&mut self, speaker: &ParticipantKey) {
        if self.participants.is_empty() {
            self.index = 0;
            return;
        }
        // A speaker removed mid-call already moved `index` onto its successor.
        if let Some(position) = self.participants.iter().position(|k| k == speaker) {
            self.index = (position + 1) % self.participants.len();
        }
    }
}

/// Seed for a new run: `(speaker label, content, explicit)`.
fn pick_seed(
    session: &ConversationSession,
    members: &[ParticipantKey],
    explicit: Option<&str>,
) -> Option<(String, String, bool)> {
    if let Some(text) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return Some((USER_SPEAKER.to_string(), text.to_string(), true));
    }
    let latest_of = |role: Role| {
        members.iter().find_map(|key| {
            session
                .participant(key)
                .and_then(|p| p.last_message_of(role))
                .map(|content| (key, content.to_string()))
        })
    };
    if let Some((key, content)) = latest_of(Role::Assistant) {
        return Some((session.display_name(key), content, false));
    }
    latest_of(Role::User).map(|(_, content)| (USER_SPEAKER.to_string(), content, false))
}

struct TurnJob {
    number: usize,
    speaker: ParticipantKey,
    speaker_name: String,
    host_url: Option<String>,
    messages: Vec<Message>,
    max_output: Option<usize>,
}

enum Step {
    Interruption(String),
    Turn(TurnJob),
    Finished,
}

enum TurnResult {
    Replied { length: usize },
    Failed { error: String, host_changed: bool },
}

fn prepare_step(state: &mut OrchestratorState, window: usize) -> Step {
    let Some(run) = state.autonomous.as_mut() else {
        return Step::Finished;
    };

    if let Some(message) = run.pending_interruption.take() {
        run.push_user_turn(&message);
        let session = state.sessions.active_mut();
        for key in &run.participants {
            if let Some(participant) = session.participant_mut(key) {
                participant.messages.push(message.clone());
            }
        }
        session.touch();
        return Step::Interruption(message.content);
    }

    if run.participants.len() < 2 {
        return Step::Finished;
    }
    run.index %= run.participants.len();
    let speaker = run.participants[run.index].clone();
    run.current_speaker = Some(speaker.clone());

    let session = state.sessions.active();
    let names: Vec<String> = run.participants.iter().map(|k| session.display_name(k)).collect();
    let speaker_name = session.display_name(&speaker);
    let role = session
        .participant(&speaker)
        .map(|p| p.role.clone())
        .unwrap_or_default();

    let mut history = run.contexts.get(&speaker).cloned().unwrap_or_default();
    history.push(Message::user(compose_turn_prompt(
        &names,
        &run.transcript,
        window,
        &speaker_name,
    )));
    let messages = build_request_messages(
        &role,
        state.settings.enable_roles,
        &history,
        &state.settings.chat_config,
    );

    if let Some(participant) = state.sessions.active_mut().participant_mut(&speaker) {
        participant.loading = true;
    }

    Step::Turn(TurnJob {
        number: run.turns + 1,
        host_url: state.registry.resolve(&speaker.host_id),
        speaker,
        speaker_name,
        messages,
        max_output: state.settings.chat_config.effective_max_output_length(),
    })
}

fn record_turn(state: &mut OrchestratorState, turn: &TurnJob, result: Result<Message, ClientError>) -> (TurnResult, usize) {
    let outcome = match result {
        Ok(reply) => {
            let content = apply_output_length_limit(&reply.content, turn.max_output);
            if let Some(run) = state.autonomous.as_mut() {
                if run.participants.contains(&turn.speaker) {
                    run.transcript
                        .push(TranscriptEntry::new(turn.speaker_name.clone(), content.clone()));
                    run.contexts
                        .entry(turn.speaker.clone())
                        .or_default()
                        .push(Message::assistant(content.clone()));
                }
            }
            let length = content.chars().count();
            write_reply(&mut state.sessions, &turn.speaker, content, false);
            TurnResult::Replied { length }
        }
        Err(err) => {
            log::warn!("Autonomous: {} failed: {}", turn.speaker, err);
            let host_changed = state.record_failure(&turn.speaker, &err, false);
            TurnResult::Failed {
                error: err.to_string(),
                host_changed,
            }
        }
    };

    let next_index = match state.autonomous.as_mut() {
        Some(run) => {
            run.turns += 1;
            run.current_speaker = None;
            run.advance_after(&turn.speaker);
            run.index
        }
        None => 0,
    };
    (outcome, next_index)
}

impl Orchestrator {
    /// Start the round-robin dialogue among `participants` (kept in session order).
    ///
    /// The seed is `seed` when given (recorded as a user turn for every member), else
    /// the most recent assistant message across members, else the most recent user
    /// message. Nothing changes when this returns an error.
    pub fn start_autonomous(&self, seed: Option<&str>, participants: Vec<ParticipantKey>) -> Result<(), OrchestratorError> {
        let handle = Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;
        let token = CancellationToken::new();

        self.with_state(|s| -> Result<(), OrchestratorError> {
            if s.autonomous.is_some() {
                return Err(OrchestratorError::AutonomousActive);
            }
            if s.is_broadcast_processing() {
                return Err(OrchestratorError::Busy);
            }
            let session = s.sessions.active();
            let members: Vec<ParticipantKey> = session
                .keys()
                .into_iter()
                .filter(|k| participants.contains(k))
                .collect();
            if members.len() < 2 {
                return Err(OrchestratorError::NotEnoughParticipants);
            }
            let (speaker, content, explicit) =
                pick_seed(session, &members, seed).ok_or(OrchestratorError::NoSeed)?;

            let mut run = AutonomousRun::new(token.clone(), members);
            if explicit {
                run.push_user_turn(&Message::user(content.clone()));
                let session = s.sessions.active_mut();
                for key in &run.participants {
                    if let Some(participant) = session.participant_mut(key) {
                        participant.messages.push(Message::user(content.clone()));
                    }
                }
                session.touch();
            } else {
                run.transcript.push(TranscriptEntry::new(speaker, content));
            }
            s.autonomous = Some(run);
            Ok(())
        })?;

        let orchestrator = self.clone();
        let join = handle.spawn(async move { orchestrator.run_round_robin(token).await });
        self.with_state(|s| s.autonomous_handle = Some(join));
        Ok(())
    }

    /// Request cancellation. Takes effect at the next iteration boundary; an in-flight
    /// call still settles and is recorded. Clears any pending interruption.
    pub fn stop_autonomous(&self) -> bool {
        self.with_state(|s| match s.autonomous.as_mut() {
            Some(run) => {
                run.token.cancel();
                run.pending_interruption = None;
                true
            }
            None => false,
        })
    }

    pub fn is_autonomous_active(&self) -> bool {
        self.with_state(|s| s.autonomous.is_some())
    }

    pub fn autonomous_status(&self) -> Option<AutonomousStatus> {
        self.with_state(|s| s.autonomous.as_ref().map(AutonomousRun::status))
    }

    /// Wait for the most recently started run to exit and return its report.
    pub async fn wait_autonomous(&self) -> Option<AutonomousReport> {
        let handle = self.with_state(|s| s.autonomous_handle.take())?;
        match handle.await {
            Ok(report) => Some(report),
            Err(err) => {
                log::error!("Autonomous: loop task failed: {}", err);
                None
            }
        }
    }

    async fn run_round_robin(self, token: CancellationToken) -> AutonomousReport {
        let window = self.inner.config.transcript_window;
        let delay = self.inner.config.inter_turn_delay;

        let start = self.with_state(|s| {
            s.autonomous.as_ref().map(|run| {
                let seed = run.transcript.last().map(|e| e.content.clone()).unwrap_or_default();
                (run.participants.clone(), seed)
            })
        });
        if let Some((participants, seed)) = start {
            log::info!("Autonomous: starting with {} participants", participants.len());
            self.emit(OrchestratorEvent::AutonomousStarted { participants, seed })
                .await;
        }

        loop {
            if token.is_cancelled() {
                break;
            }

            let turn = match self.with_state(|s| prepare_step(s, window)) {
                Step::Finished => break,
                Step::Interruption(text) => {
                    log::info!("Autonomous: applied interruption");
                    self.emit(OrchestratorEvent::InterruptionApplied { text }).await;
                    self.persist_in_background().await;
                    continue;
                }
                Step::Turn(turn) => turn,
            };

            log::debug!("Autonomous: turn {} by {}", turn.number, turn.speaker);
            self.emit(OrchestratorEvent::TurnStarted {
                turn: turn.number,
                speaker: turn.speaker.clone(),
            })
            .await;

            let result = match &turn.host_url {
                Some(url) => {
                    self.client()
                        .send_message(url, &turn.speaker.model_name, &turn.messages)
                        .await
                }
                None => Err(ClientError::Network {
                    host: turn.speaker.host_id.clone(),
                    detail: "Host is no longer configured".to_string(),
                }),
            };

            let (outcome, next_index) = self.with_state(|s| record_turn(s, &turn, result));
            let success = match outcome {
                TurnResult::Replied { length } => {
                    self.emit(OrchestratorEvent::ParticipantResponded {
                        participant: turn.speaker.clone(),
                        response_length: length,
                    })
                    .await;
                    true
                }
                TurnResult::Failed {
                    error,
                    host_changed,
                } => {
                    if host_changed {
                        self.emit(OrchestratorEvent::HostStatusChanged {
                            host_id: turn.speaker.host_id.clone(),
                            status: HostStatus::Failed,
                        })
                        .await;
                    }
                    self.emit(OrchestratorEvent::ParticipantFailed {
                        participant: turn.speaker.clone(),
                        error,
                    })
                    .await;
                    false
                }
            };
            self.persist_in_background().await;

            self.emit(OrchestratorEvent::TurnCompleted {
                turn: turn.number,
                speaker: turn.speaker.clone(),
                next_index,
                success,
            })
            .await;

            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let (report, queue_waiting) = self.with_state(|s| {
            let run = s.autonomous.take();
            let session = s.sessions.active_mut();
            if let Some(run) = &run {
                for key in &run.participants {
                    if let Some(participant) = session.participant_mut(key) {
                        participant.loading = false;
                    }
                }
            }
            let report = match run {
                Some(run) => AutonomousReport {
                    turns: run.turns,
                    next_index: run.index,
                    transcript: run.transcript,
                },
                None => AutonomousReport {
                    turns: 0,
                    next_index: 0,
                    transcript: Vec::new(),
                },
            };
            (report, !s.queue.is_empty())
        });

        log::info!("Autonomous: stopped after {} turns", report.turns);
        self.emit(OrchestratorEvent::AutonomousStopped {
            turns: report.turns,
        })
        .await;
        self.persist_in_background().await;
        if queue_waiting && self.inner.config.auto_drain {
            self.kick_drain();
        }
        report
    }
}
