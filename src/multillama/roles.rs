//! Display roles assigned to participants.

/// Role every participant starts with. Participants holding it get no role preamble.
pub const DEFAULT_ROLE: &str = "General";

/// Built-in role library.
pub const PRESET_ROLES: [&str; 15] = [
    "General",
    "Tester",
    "Designer",
    "Product Manager",
    "Developer",
    "Reviewer",
    "Architect",
    "Analyst",
    "Security Engineer",
    "DevOps Engineer",
    "Data Scientist",
    "Researcher",
    "Technical Writer",
    "SRE",
    "QA Engineer",
];

/// Normalize a free-text role label.
///
/// Blank input becomes [`DEFAULT_ROLE`]; a few abbreviations map to their canonical
/// label; anything else is title-cased word by word.
///
/// ```rust
/// use multillama::roles::normalize_role_label;
///
/// assert_eq!(normalize_role_label("pm"), "Product Manager");
/// assert_eq!(normalize_role_label("  security   ENGINEER "), "Security Engineer");
/// assert_eq!(normalize_role_label(""), "General");
/// ```
pub fn normalize_role_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return DEFAULT_ROLE.to_string();
    }
    match trimmed.to_lowercase().as_str() {
        "pm" => return "Product Manager".to_string(),
        "qa" => return "QA Engineer".to_string(),
        "sre" => return "SRE".to_string(),
        "devops" => return "DevOps Engineer".to_string(),
        _ => {}
    }
    trimmed
        .split_whitespace()
        .map(title_case_word)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(|c| c.to_lowercase()))
            .collect(),
        None => String::new(),
    }
}

/// Whether `role` is the default role (compared case-insensitively).
pub fn is_default_role(role: &str) -> bool {
    role.trim().is_empty() || role.trim().eq_ignore_ascii_case(DEFAULT_ROLE)
}

/// The preset library as owned labels.
pub fn preset_role_library() -> Vec<String> {
    PRESET_ROLES.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases() {
        assert_eq!(normalize_role_label("QA"), "QA Engineer");
        assert_eq!(normalize_role_label("sre"), "SRE");
        assert_eq!(normalize_role_label("DevOps"), "DevOps Engineer");
    }

    #[test]
    fn test_title_case() {
        assert_eq!(normalize_role_label("data scientist"), "Data Scientist");
        assert_eq!(normalize_role_label("rUST guru"), "Rust Guru");
    }

    #[test]
    fn test_is_default_role() {
        assert!(is_default_role("general"));
        assert!(is_default_role(""));
        assert!(!is_default_role("Tester"));
    }
}
