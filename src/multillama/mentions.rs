//! `@name` / `@name#k` targeting inside broadcast messages.
//!
//! A tag selects every targeted participant whose base model name matches it; `#k`
//! narrows the selection to the k-th instance of that model (1-indexed, in session
//! order). Matched tags are removed from the text. When no tag matches anything, the
//! message goes to every originally targeted participant and the text is left as typed.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

use crate::participant::{model_name_matches, ParticipantKey};

lazy_static! {
    static ref MENTION: Regex = Regex::new(r"@([^\s@#,;!?()]+)(?:#(\d+))?").unwrap();
    static ref SPACE_RUN: Regex = Regex::new(r"[ \t]{2,}").unwrap();
}

/// Outcome of mention resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MentionResolution {
    /// Participants that receive the message, in session order.
    pub targets: Vec<ParticipantKey>,
    /// Message text with matched tags stripped.
    pub text: String,
    /// Whether at least one tag matched a participant.
    pub matched: bool,
}

/// Resolve mention tags in `text` against `candidates` (the originally targeted
/// participants, in session order).
///
/// ```rust
/// use multillama::mentions::resolve_mentions;
/// use multillama::participant::{ModelRef, ParticipantKey};
///
/// let alpha = ModelRef::new("host-local", "alpha");
/// let beta = ModelRef::new("host-local", "beta");
/// let candidates = vec![
///     ParticipantKey::new(&alpha, 1),
///     ParticipantKey::new(&alpha, 2),
///     ParticipantKey::new(&beta, 3),
/// ];
///
/// let resolved = resolve_mentions("@alpha#2 what do you think?", &candidates);
/// assert_eq!(resolved.targets, vec![candidates[1].clone()]);
/// assert_eq!(resolved.text, "what do you think?");
/// ```
pub fn resolve_mentions(text: &str, candidates: &[ParticipantKey]) -> MentionResolution {
    let mut selected: HashSet<usize> = HashSet::new();
    let mut strip_spans: Vec<(usize, usize)> = Vec::new();

    for caps in MENTION.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        // A tag must start the text or follow whitespace; `me@example.com` is not a tag.
        let preceded_ok = text[..whole.start()]
            .chars()
            .next_back()
            .map_or(true, char::is_whitespace);
        if !preceded_ok {
            continue;
        }

        let name = caps
            .get(1)
            .map(|m| m.as_str().trim_end_matches(['.', ':']))
            .unwrap_or_default();
        if name.is_empty() {
            continue;
        }
        let instance: Option<usize> = caps.get(2).and_then(|m| m.as_str().parse().ok());

        let matching: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, key)| model_name_matches(&key.model_name, name))
            .map(|(index, _)| index)
            .collect();

        let hits: Vec<usize> = match instance {
            Some(k) if k >= 1 => matching.get(k - 1).copied().into_iter().collect(),
            Some(_) => Vec::new(),
            None => matching,
        };
        if hits.is_empty() {
            continue;
        }
        selected.extend(hits);

        // Strip the tag as captured; trailing punctuation that was trimmed off the name
        // stays in the text.
        let end = match caps.get(2) {
            Some(k) => k.end(),
            None => whole.start() + 1 + name.len(),
        };
        strip_spans.push((whole.start(), end));
    }

    if selected.is_empty() {
        return MentionResolution {
            targets: candidates.to_vec(),
            text: text.trim().to_string(),
            matched: false,
        };
    }

    let mut stripped = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end) in strip_spans {
        stripped.push_str(&text[cursor..start]);
        cursor = end;
    }
    stripped.push_str(&text[cursor..]);

    let cleaned = stripped
        .lines()
        .map(|line| SPACE_RUN.replace_all(line.trim(), " ").into_owned())
        .collect::<Vec<_>>()
        .join("\n");

    MentionResolution {
        targets: candidates
            .iter()
            .enumerate()
            .filter(|(index, _)| selected.contains(index))
            .map(|(_, key)| key.clone())
            .collect(),
        text: cleaned.trim().to_string(),
        matched: true,
    }
}
