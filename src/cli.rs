//! Flag parsing shared by the task binaries. Flags accept both
//! `--flag value` and `--flag=value` spellings.

use std::collections::HashSet;

pub fn flag_value(args: &[String], name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
        {
            let trimmed = next.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub fn flag_values(args: &[String], name: &str) -> Vec<String> {
    let prefix = format!("{name}=");
    let mut out = Vec::new();
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
        {
            let trimmed = next.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

pub fn flag_present(args: &[String], name: &str) -> bool {
    args.iter().any(|arg| arg == name)
}

pub fn env_value(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Split a comma/semicolon/space separated env list, deduplicated in
/// first-seen order.
pub fn split_list(raw: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for part in raw.split([',', ';', ' ']) {
        let trimmed = part.trim();
        if !trimmed.is_empty() && seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        }
    }
    out
}

/// Matching mode as an integer code or a named alias.
pub fn parse_matching_mode(value: &str) -> Option<i64> {
    if let Ok(code) = value.trim().parse::<i64>() {
        return Some(code);
    }
    match value.trim().to_ascii_lowercase().as_str() {
        "normal" => Some(2),
        "ranked" => Some(3),
        "cobalt" => Some(6),
        "union" => Some(8),
        _ => None,
    }
}

/// Default team mode for the well-known matching modes.
pub fn default_team_mode(matching_mode: i64) -> Option<i64> {
    match matching_mode {
        2 | 3 | 8 => Some(3),
        6 => Some(4),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{default_team_mode, flag_value, flag_values, parse_matching_mode, split_list};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flag_value_accepts_both_spellings() {
        assert_eq!(
            flag_value(&args(&["--db", "stats.sqlite"]), "--db").as_deref(),
            Some("stats.sqlite")
        );
        assert_eq!(
            flag_value(&args(&["--db=stats.sqlite"]), "--db").as_deref(),
            Some("stats.sqlite")
        );
        assert_eq!(flag_value(&args(&["--db"]), "--db"), None);
    }

    #[test]
    fn flag_values_collects_repeats() {
        let parsed = flag_values(
            &args(&["--nickname", "Alice", "--nickname=Bob"]),
            "--nickname",
        );
        assert_eq!(parsed, vec!["Alice".to_string(), "Bob".to_string()]);
    }

    #[test]
    fn split_list_dedups_in_order() {
        assert_eq!(
            split_list("a, b;a c"),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn matching_mode_aliases() {
        assert_eq!(parse_matching_mode("ranked"), Some(3));
        assert_eq!(parse_matching_mode("6"), Some(6));
        assert_eq!(parse_matching_mode("bogus"), None);
        assert_eq!(default_team_mode(6), Some(4));
        assert_eq!(default_team_mode(99), None);
    }
}
