//! Named conversation sessions.
//!
//! Exactly one session is active at a time. The store also owns the shared role-label
//! library and the counter that hands out participant instance ordinals, so keys stay
//! unique across sessions and survive a save/load cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client_wrapper::Role;
use crate::participant::{ModelRef, Participant, ParticipantKey};
use crate::roles::{normalize_role_label, preset_role_library, PRESET_ROLES};

/// Title of a session without any user message.
pub const DEFAULT_SESSION_TITLE: &str = "New chat";
const TITLE_MAX_CHARS: usize = 48;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub id: Uuid,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub participants: Vec<Participant>,
}

impl ConversationSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: DEFAULT_SESSION_TITLE.to_string(),
            created_at: now,
            updated_at: now,
            participants: Vec::new(),
        }
    }

    /// Whether any participant holds a non-blank message.
    pub fn has_content(&self) -> bool {
        self.participants.iter().any(Participant::has_content)
    }

    pub fn participant(&self, key: &ParticipantKey) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.key == key)
    }

    pub fn participant_mut(&mut self, key: &ParticipantKey) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.key == key)
    }

    pub fn keys(&self) -> Vec<ParticipantKey> {
        self.participants.iter().map(|p| p.key.clone()).collect()
    }

    /// Base model name, suffixed with ` #k` when several instances of that model share
    /// the session (`k` counts instances in session order, starting at 1).
    pub fn display_name(&self, key: &ParticipantKey) -> String {
        let siblings: Vec<&ParticipantKey> = self
            .participants
            .iter()
            .map(|p| &p.key)
            .filter(|k| k.model_name == key.model_name)
            .collect();
        if siblings.len() <= 1 {
            return key.model_name.clone();
        }
        match siblings.iter().position(|k| *k == key) {
            Some(ordinal) => format!("{} #{}", key.model_name, ordinal + 1),
            None => key.model_name.clone(),
        }
    }

    /// Recompute the title and bump `updated_at`. Called after every mutation.
    pub fn touch(&mut self) {
        self.title = derive_title(&self.participants);
        self.updated_at = Utc::now();
    }
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Title derived from the first non-empty user message across participants.
///
/// ```rust
/// use multillama::client_wrapper::Message;
/// use multillama::participant::{ModelRef, Participant, ParticipantKey};
/// use multillama::session_store::derive_title;
///
/// let mut p = Participant::new(ParticipantKey::new(&ModelRef::new("h", "m"), 1));
/// assert_eq!(derive_title(std::slice::from_ref(&p)), "New chat");
/// p.messages.push(Message::user("  Plan the release\nwith details"));
/// assert_eq!(derive_title(&[p]), "Plan the release");
/// ```
pub fn derive_title(participants: &[Participant]) -> String {
    let first = participants.iter().find_map(|p| {
        p.messages
            .iter()
            .find(|m| m.role == Role::User && !m.content.trim().is_empty())
    });
    let Some(message) = first else {
        return DEFAULT_SESSION_TITLE.to_string();
    };
    let line = message
        .content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    title = title.trim_end().to_string();
    title.push('…');
    title
}

/// The persisted chat-state record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatState {
    pub sessions: Vec<ConversationSession>,
    pub active_session_id: Option<Uuid>,
    pub role_library: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SessionStore {
    sessions: Vec<ConversationSession>,
    active_id: Uuid,
    role_library: Vec<String>,
    next_instance: u32,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// A store holding one empty active session and the preset role library.
    pub fn new() -> Self {
        let session = ConversationSession::new();
        Self {
            active_id: session.id,
            sessions: vec![session],
            role_library: preset_role_library(),
            next_instance: 1,
        }
    }

    /// Restore a store from its persisted record.
    ///
    /// Trailing empty assistant messages (captured mid-stream) are dropped and loading
    /// flags reset. Falls back to the most recently updated session when the recorded
    /// active id is missing, and to a fresh session when there is none.
    pub fn from_chat_state(state: ChatState) -> Self {
        let mut sessions = state.sessions;
        for session in &mut sessions {
            for participant in &mut session.participants {
                participant.drop_trailing_empty_assistant();
                participant.loading = false;
            }
        }

        let next_instance = sessions
            .iter()
            .flat_map(|s| s.participants.iter())
            .map(|p| p.key.instance)
            .max()
            .unwrap_or(0)
            + 1;

        let mut role_library = preset_role_library();
        for label in state.role_library {
            let label = normalize_role_label(&label);
            if !role_library.contains(&label) {
                role_library.push(label);
            }
        }

        let active_id = state
            .active_session_id
            .filter(|id| sessions.iter().any(|s| s.id == *id))
            .or_else(|| {
                sessions
                    .iter()
                    .max_by_key(|s| s.updated_at)
                    .map(|s| s.id)
            });
        let active_id = match active_id {
            Some(id) => id,
            None => {
                let session = ConversationSession::new();
                let id = session.id;
                sessions.push(session);
                id
            }
        };

        Self {
            sessions,
            active_id,
            role_library,
            next_instance,
        }
    }

    /// Record to persist. Sessions without any non-empty message are left out.
    pub fn to_chat_state(&self) -> ChatState {
        let sessions: Vec<ConversationSession> = self
            .sessions
            .iter()
            .filter(|s| s.has_content())
            .cloned()
            .collect();
        let active_session_id = sessions
            .iter()
            .any(|s| s.id == self.active_id)
            .then_some(self.active_id);
        ChatState {
            sessions,
            active_session_id,
            role_library: self
                .role_library
                .iter()
                .filter(|label| !PRESET_ROLES.contains(&label.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn active(&self) -> &ConversationSession {
        // `active_id` always names a stored session; every removal path re-points it.
        match self.sessions.iter().position(|s| s.id == self.active_id) {
            Some(index) => &self.sessions[index],
            None => &self.sessions[0],
        }
    }

    pub fn active_mut(&mut self) -> &mut ConversationSession {
        let index = self
            .sessions
            .iter()
            .position(|s| s.id == self.active_id)
            .unwrap_or(0);
        &mut self.sessions[index]
    }

    pub fn active_id(&self) -> Uuid {
        self.active_id
    }

    pub fn session(&self, id: Uuid) -> Option<&ConversationSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// All sessions, most recently updated first.
    pub fn sessions(&self) -> Vec<&ConversationSession> {
        let mut sessions: Vec<&ConversationSession> = self.sessions.iter().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub fn role_library(&self) -> &[String] {
        &self.role_library
    }

    /// Create and activate a new session. An empty active session is reused instead.
    pub fn new_session(&mut self) -> Uuid {
        if !self.active().has_content() && self.active().participants.is_empty() {
            return self.active_id;
        }
        let session = ConversationSession::new();
        let id = session.id;
        self.sessions.push(session);
        self.active_id = id;
        id
    }

    pub fn switch_session(&mut self, id: Uuid) -> bool {
        if self.session(id).is_none() {
            return false;
        }
        self.active_id = id;
        true
    }

    /// Delete a session. Deleting the active one activates the most recently updated
    /// remaining session, or a fresh one when none is left.
    pub fn delete_session(&mut self, id: Uuid) -> Option<ConversationSession> {
        let index = self.sessions.iter().position(|s| s.id == id)?;
        let removed = self.sessions.remove(index);
        if self.active_id == id {
            match self.sessions.iter().max_by_key(|s| s.updated_at) {
                Some(next) => self.active_id = next.id,
                None => {
                    let session = ConversationSession::new();
                    self.active_id = session.id;
                    self.sessions.push(session);
                }
            }
        }
        Some(removed)
    }

    fn allocate_key(&mut self, model: &ModelRef) -> ParticipantKey {
        let key = ParticipantKey::new(model, self.next_instance);
        self.next_instance += 1;
        key
    }

    /// Add a fresh instance of `model` to the active session. `None` when an instance of
    /// the model is already present and duplicates are not allowed.
    pub fn add_participant(&mut self, model: &ModelRef, allow_duplicates: bool) -> Option<ParticipantKey> {
        let present = self
            .active()
            .participants
            .iter()
            .any(|p| &p.key.model_ref() == model);
        if present && !allow_duplicates {
            return None;
        }
        let key = self.allocate_key(model);
        let session = self.active_mut();
        session.participants.push(Participant::new(key.clone()));
        session.touch();
        Some(key)
    }

    /// Add a copy of `source` (history and role) right after it in the active session.
    pub fn duplicate_participant(&mut self, source: &ParticipantKey) -> Option<ParticipantKey> {
        let original = self.active().participant(source)?.clone();
        let key = self.allocate_key(&source.model_ref());
        let session = self.active_mut();
        let index = session
            .participants
            .iter()
            .position(|p| &p.key == source)
            .map_or(session.participants.len(), |i| i + 1);
        session.participants.insert(
            index,
            Participant {
                key: key.clone(),
                role: original.role,
                messages: original.messages,
                loading: false,
            },
        );
        session.touch();
        Some(key)
    }

    /// Remove a participant from the active session.
    pub fn remove_participant(&mut self, key: &ParticipantKey) -> Option<Participant> {
        let session = self.active_mut();
        let index = session.participants.iter().position(|p| &p.key == key)?;
        let removed = session.participants.remove(index);
        session.touch();
        Some(removed)
    }

    /// Remove every participant served by `host_id` from every session. Returns the
    /// removed keys of the active session.
    pub fn remove_host_participants(&mut self, host_id: &str) -> Vec<ParticipantKey> {
        let active_id = self.active_id;
        let mut removed_from_active = Vec::new();
        for session in &mut self.sessions {
            let before = session.participants.len();
            if session.id == active_id {
                removed_from_active.extend(
                    session
                        .participants
                        .iter()
                        .filter(|p| p.key.host_id == host_id)
                        .map(|p| p.key.clone()),
                );
            }
            session.participants.retain(|p| p.key.host_id != host_id);
            if session.participants.len() != before {
                session.touch();
            }
        }
        removed_from_active
    }

    /// Assign a role to a participant of the active session. Custom labels join the
    /// shared library. Returns the normalized label.
    pub fn set_role(&mut self, key: &ParticipantKey, raw_label: &str) -> Option<String> {
        let label = normalize_role_label(raw_label);
        let session = self.active_mut();
        session.participant_mut(key)?.role = label.clone();
        session.touch();
        if !self.role_library.contains(&label) {
            self.role_library.push(label.clone());
        }
        Some(label)
    }
}
