//! Outgoing prompt composition.
//!
//! Every call to a backend goes through the same shaping steps:
//!
//! 1. a system preamble pinning the participant's role (when roles are enabled and the
//!    role is not the default one),
//! 2. the global pre/post instructions wrapped around the latest user turn, plus an
//!    output-length hint when a cap is configured,
//! 3. after the reply arrives, a hard truncation to the cap. The hint is advisory, the
//!    truncation is what guarantees the bound.
//!
//! Attachments are flattened here as well: text files become fenced blocks appended to
//! the prompt, images ride along in the message `images` array.

use serde::{Deserialize, Serialize};

use crate::autonomous::TranscriptEntry;
use crate::client_wrapper::{Message, Role};
use crate::config::ChatConfiguration;
use crate::roles::is_default_role;

/// Marker appended to truncated replies.
pub const ELLIPSIS: char = '…';

/// Payload of an [`Attachment`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum AttachmentKind {
    /// Decoded text content of a file.
    Text(String),
    /// Base64 encoded image bytes.
    Image(String),
}

/// A file submitted together with a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime_type: String,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn text(name: impl Into<String>, mime_type: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            kind: AttachmentKind::Text(content.into()),
        }
    }

    pub fn image(name: impl Into<String>, mime_type: impl Into<String>, base64: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            kind: AttachmentKind::Image(base64.into()),
        }
    }
}

/// Merge text attachments into `text` as labelled fenced blocks.
///
/// ```rust
/// use multillama::prompt::{flatten_attachments, Attachment};
///
/// let merged = flatten_attachments(
///     "Review this",
///     &[Attachment::text("main.rs", "text/x-rust", "fn main() {}")],
/// );
/// assert_eq!(merged, "Review this\n\nAttachment: main.rs (text/x-rust)\n```\nfn main() {}\n```");
/// ```
pub fn flatten_attachments(text: &str, attachments: &[Attachment]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed.to_string());
    }
    for attachment in attachments {
        match &attachment.kind {
            AttachmentKind::Text(content) => parts.push(format!(
                "Attachment: {} ({})\n```\n{}\n```",
                attachment.name,
                attachment.mime_type,
                content.trim_end()
            )),
            AttachmentKind::Image(_) => parts.push(format!("Image attached: {}", attachment.name)),
        }
    }
    parts.join("\n\n")
}

/// Base64 payloads of the image attachments, in submission order.
pub fn image_payloads(attachments: &[Attachment]) -> Vec<String> {
    attachments
        .iter()
        .filter_map(|a| match &a.kind {
            AttachmentKind::Image(data) => Some(data.clone()),
            AttachmentKind::Text(_) => None,
        })
        .collect()
}

/// System preamble for a participant role. `None` when roles are disabled or the role is
/// the default.
pub fn role_instruction(role: &str, roles_enabled: bool) -> Option<String> {
    if !roles_enabled || is_default_role(role) {
        return None;
    }
    let role = role.trim();
    Some(format!(
        "You are acting as the {role} in this conversation. Stay in that role for every \
         answer and respond consistently from the perspective of a {role}."
    ))
}

/// Wrap `base` with the configured pre/post instructions and the output-length hint.
/// Returns `base` untouched when the configuration is disabled.
pub fn apply_chat_configuration(base: &str, config: &ChatConfiguration) -> String {
    if !config.enabled {
        return base.to_string();
    }
    let mut parts: Vec<String> = Vec::new();
    let pre = config.pre_prompt.trim();
    let post = config.post_prompt.trim();
    if !pre.is_empty() {
        parts.push(pre.to_string());
    }
    parts.push(base.to_string());
    if !post.is_empty() {
        parts.push(post.to_string());
    }
    if let Some(max) = config.effective_max_output_length() {
        parts.push(format!(
            "Output limit: Keep your final response under {} characters.",
            max
        ));
    }
    parts.join("\n\n").trim().to_string()
}

/// Hard-truncate `output` to `max` characters followed by [`ELLIPSIS`].
///
/// ```rust
/// use multillama::prompt::apply_output_length_limit;
///
/// assert_eq!(apply_output_length_limit("abcdefghijklmnopqrst", Some(10)), "abcdefghij…");
/// assert_eq!(apply_output_length_limit("short", Some(10)), "short");
/// assert_eq!(apply_output_length_limit("no cap", None), "no cap");
/// ```
pub fn apply_output_length_limit(output: &str, max: Option<usize>) -> String {
    let Some(max) = max.filter(|m| *m > 0) else {
        return output.to_string();
    };
    if output.chars().count() <= max {
        return output.to_string();
    }
    let head: String = output.chars().take(max).collect();
    let mut truncated = head.trim_end().to_string();
    truncated.push(ELLIPSIS);
    truncated
}

/// Assemble the message list for one backend call.
///
/// `history` is the participant's conversation as it should be sent; its last user
/// message is rewritten with the chat configuration. Synthesized error replies are
/// left out so a previous failure does not leak into the next call.
pub fn build_request_messages(
    role: &str,
    roles_enabled: bool,
    history: &[Message],
    chat_config: &ChatConfiguration,
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if let Some(instruction) = role_instruction(role, roles_enabled) {
        messages.push(Message::system(instruction));
    }

    let last_user = history.iter().rposition(|m| m.role == Role::User);
    for (index, message) in history.iter().enumerate() {
        if message.role == Role::Assistant && is_error_reply(&message.content) {
            continue;
        }
        if Some(index) == last_user {
            let mut wrapped = message.clone();
            wrapped.content = apply_chat_configuration(&message.content, chat_config);
            messages.push(wrapped);
        } else {
            messages.push(message.clone());
        }
    }
    messages
}

/// Text of the synthesized reply recorded when a participant call fails.
pub fn error_reply(model_name: &str, detail: &str) -> String {
    format!("Error: Could not get response from {}: {}", model_name, detail)
}

fn is_error_reply(content: &str) -> bool {
    content.starts_with("Error: Could not get response from ")
}

/// Build the user turn for one autonomous round-robin step.
///
/// Quotes at most `window` of the most recent transcript entries and says how many
/// earlier ones were left out.
pub fn compose_turn_prompt(
    participant_names: &[String],
    transcript: &[TranscriptEntry],
    window: usize,
    current_speaker: &str,
) -> String {
    let window = window.max(1);
    let omitted = transcript.len().saturating_sub(window);
    let mut prompt = String::new();

    prompt.push_str("You are taking part in a group conversation between several AI models.\n");
    prompt.push_str("Participants in this room: ");
    prompt.push_str(&participant_names.join(", "));
    prompt.push_str("\n\nConversation so far:\n");
    if omitted > 0 {
        prompt.push_str(&format!("({} earlier messages omitted)\n", omitted));
    }
    for entry in &transcript[omitted..] {
        prompt.push_str(&format!("{}: {}\n", entry.speaker, entry.content.trim()));
    }

    match transcript.last() {
        Some(latest) => prompt.push_str(&format!(
            "\nThe latest message is from {}.\n",
            latest.speaker
        )),
        None => prompt.push('\n'),
    }
    prompt.push_str(&format!(
        "You are {}. Respond as {} to the latest message, continuing the conversation. \
         Do not prefix your reply with your name.",
        current_speaker, current_speaker
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(pre: &str, post: &str, max: Option<usize>) -> ChatConfiguration {
        ChatConfiguration {
            enabled: true,
            pre_prompt: pre.to_string(),
            post_prompt: post.to_string(),
            max_output_length: max,
        }
    }

    #[test]
    fn test_chat_configuration_wraps_prompt() {
        let config = enabled(" Be brief. ", "Answer in English.", Some(200));
        assert_eq!(
            apply_chat_configuration("What is Rust?", &config),
            "Be brief.\n\nWhat is Rust?\n\nAnswer in English.\n\n\
             Output limit: Keep your final response under 200 characters."
        );
    }

    #[test]
    fn test_disabled_chat_configuration_is_identity() {
        let mut config = enabled("pre", "post", Some(5));
        config.enabled = false;
        assert_eq!(apply_chat_configuration("hello", &config), "hello");
    }

    #[test]
    fn test_output_limit_counts_characters() {
        assert_eq!(apply_output_length_limit("ééééé", Some(3)), "ééé…");
        assert_eq!(apply_output_length_limit("abc   def", Some(5)), "abc…");
    }

    #[test]
    fn test_role_instruction_skips_default_role() {
        assert!(role_instruction("General", true).is_none());
        assert!(role_instruction("Tester", false).is_none());
        assert!(role_instruction("Tester", true).unwrap().contains("Tester"));
    }

    #[test]
    fn test_build_request_messages() {
        let history = vec![
            Message::user("first"),
            Message::assistant(error_reply("m", "boom")),
            Message::user("second").with_images(vec!["aGk=".to_string()]),
        ];
        let messages =
            build_request_messages("Reviewer", true, &history, &enabled("PRE", "", None));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[1].content, "first");
        assert_eq!(messages[2].content, "PRE\n\nsecond");
        assert_eq!(messages[2].images, vec!["aGk=".to_string()]);
    }

    #[test]
    fn test_image_attachments_are_not_inlined() {
        let attachments = vec![
            Attachment::image("cat.png", "image/png", "Y2F0"),
            Attachment::text("notes.txt", "text/plain", "remember\n"),
        ];
        let merged = flatten_attachments("", &attachments);
        assert!(merged.starts_with("Image attached: cat.png"));
        assert!(merged.contains("```\nremember\n```"));
        assert_eq!(image_payloads(&attachments), vec!["Y2F0".to_string()]);
    }

    #[test]
    fn test_turn_prompt_windows_transcript() {
        let transcript: Vec<TranscriptEntry> = (0..5)
            .map(|i| TranscriptEntry::new(format!("s{}", i), format!("line {}", i)))
            .collect();
        let names = vec!["a".to_string(), "b".to_string()];
        let prompt = compose_turn_prompt(&names, &transcript, 2, "a");
        assert!(prompt.contains("Participants in this room: a, b"));
        assert!(prompt.contains("(3 earlier messages omitted)"));
        assert!(!prompt.contains("line 2"));
        assert!(prompt.contains("s4: line 4"));
        assert!(prompt.contains("The latest message is from s4."));
        assert!(prompt.contains("Respond as a"));
    }
}
