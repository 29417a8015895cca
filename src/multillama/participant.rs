//! Participants: independently tracked conversation threads bound to one model on one host.
//!
//! The same base model can be instantiated several times in one session. Each instance is
//! identified by a typed [`ParticipantKey`] (host id, model name, instance ordinal) rather
//! than a delimiter-joined string, so there is nothing to parse and nothing to collide.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::client_wrapper::{Message, Role};
use crate::roles::DEFAULT_ROLE;

/// A model offered by a particular host.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelRef {
    pub host_id: String,
    pub model_name: String,
}

impl ModelRef {
    pub fn new(host_id: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            model_name: model_name.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.model_name, self.host_id)
    }
}

/// Unique identity of one model instance.
///
/// `instance` ordinals come from a store-wide counter, so a key is unique across every
/// session and never reused after removal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantKey {
    pub host_id: String,
    pub model_name: String,
    pub instance: u32,
}

impl ParticipantKey {
    pub fn new(model: &ModelRef, instance: u32) -> Self {
        Self {
            host_id: model.host_id.clone(),
            model_name: model.model_name.clone(),
            instance,
        }
    }

    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(self.host_id.clone(), self.model_name.clone())
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.model_name, self.host_id, self.instance)
    }
}

/// One model instance in a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub key: ParticipantKey,
    /// Normalized display role; see [`normalize_role_label`](crate::roles::normalize_role_label).
    pub role: String,
    /// Append-ordered history of user and assistant messages.
    pub messages: Vec<Message>,
    /// `true` while a call for this participant is in flight. Never persisted.
    #[serde(skip)]
    pub loading: bool,
}

impl Participant {
    pub fn new(key: ParticipantKey) -> Self {
        Self {
            key,
            role: DEFAULT_ROLE.to_string(),
            messages: Vec::new(),
            loading: false,
        }
    }

    pub fn model_name(&self) -> &str {
        &self.key.model_name
    }

    /// Content of the most recent message with `role`, when it is not blank.
    pub fn last_message_of(&self, role: Role) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == role)
            .map(|m| m.content.as_str())
            .filter(|content| !content.trim().is_empty())
    }

    /// Whether any message carries non-blank text.
    pub fn has_content(&self) -> bool {
        self.messages.iter().any(|m| !m.content.trim().is_empty())
    }

    /// Drop trailing empty assistant messages left behind by an interrupted stream.
    pub fn drop_trailing_empty_assistant(&mut self) {
        while matches!(
            self.messages.last(),
            Some(last) if last.role == Role::Assistant && last.content.trim().is_empty()
        ) {
            self.messages.pop();
        }
    }
}

/// Whether a mention token names this model: either the full model name or the part
/// before the `:tag` suffix, compared case-insensitively.
pub fn model_name_matches(model_name: &str, token: &str) -> bool {
    let name = model_name.to_lowercase();
    let token = token.to_lowercase();
    if name == token {
        return true;
    }
    match name.split_once(':') {
        Some((base, _)) => base == token,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_message_of_skips_blank() {
        let mut p = Participant::new(ParticipantKey::new(&ModelRef::new("h", "m"), 1));
        p.messages.push(Message::assistant("first"));
        p.messages.push(Message::user("question"));
        p.messages.push(Message::assistant("   "));
        assert_eq!(p.last_message_of(Role::User), Some("question"));
        assert_eq!(p.last_message_of(Role::Assistant), None);
    }

    #[test]
    fn test_drop_trailing_empty_assistant() {
        let mut p = Participant::new(ParticipantKey::new(&ModelRef::new("h", "m"), 1));
        p.messages.push(Message::user("hi"));
        p.messages.push(Message::assistant(""));
        p.drop_trailing_empty_assistant();
        assert_eq!(p.messages, vec![Message::user("hi")]);
    }

    #[test]
    fn test_model_name_matches() {
        assert!(model_name_matches("Llama3:8b", "llama3"));
        assert!(model_name_matches("llama3:8b", "LLAMA3:8B"));
        assert!(!model_name_matches("llama3:8b", "llama"));
        assert!(model_name_matches("mistral", "Mistral"));
    }
}
