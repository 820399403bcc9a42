// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Injection-safe string handling
//!
//! Three sanitizers, each with a narrow contract:
//!
//! - [`shell_escape`] for user text interpolated into download scripts
//! - [`strategy_class_name`] for free-form strategy names that must become a
//!   Python class name, a substrate object key, and a filename stem
//! - [`label_value`] for cluster object label values

/// Fallback class name when sanitization consumes the whole input.
pub const DEFAULT_STRATEGY_NAME: &str = "MyStrategy";

/// Maximum byte length of a cluster label value.
const LABEL_VALUE_MAX: usize = 63;

/// Quote `input` as a single shell word whose expansion equals `input`.
///
/// The input is wrapped in single quotes and each embedded single quote is
/// encoded as `'\''`. No other transformation happens: command
/// substitutions, backticks, pipes and redirects survive as literal bytes.
#[must_use]
pub fn shell_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 2);
    out.push('\'');
    for ch in input.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Convert a free-form strategy name to a valid PascalCase identifier.
///
/// Drops every character that is not alphanumeric or an ASCII space. An
/// empty remainder yields [`DEFAULT_STRATEGY_NAME`]. A remainder without
/// spaces gets its first character uppercased and the rest preserved;
/// otherwise each whitespace-separated word is title-cased and the words
/// concatenated. Output always matches `^[A-Z][A-Za-z0-9]*$`.
#[must_use]
pub fn strategy_class_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() {
        return DEFAULT_STRATEGY_NAME.to_string();
    }

    if !cleaned.contains(' ') {
        return upper_first(cleaned);
    }

    let pascal: String = cleaned.split_whitespace().map(title_case).collect();
    // A digit can end up first when the leading word is numeric; the class
    // name must still start with a letter.
    if pascal.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return format!("Strategy{pascal}");
    }
    pascal
}

fn upper_first(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut out = first.to_ascii_uppercase().to_string();
            out.push_str(chars.as_str());
            if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                return format!("Strategy{out}");
            }
            out
        }
        None => DEFAULT_STRATEGY_NAME.to_string(),
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut out = first.to_ascii_uppercase().to_string();
            out.push_str(&chars.as_str().to_ascii_lowercase());
            out
        }
        None => String::new(),
    }
}

/// Sanitize a string for use as a cluster object label value.
///
/// Output is at most 63 bytes, contains only `[A-Za-z0-9._-]`, and begins
/// and ends with an alphanumeric character (or is empty). Whitespace runs
/// become a single `-`; other disallowed characters are stripped.
#[must_use]
pub fn label_value(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(LABEL_VALUE_MAX));
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            if !out.is_empty() {
                pending_dash = true;
            }
            continue;
        }
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            if pending_dash {
                out.push('-');
                pending_dash = false;
            }
            out.push(ch);
        }
    }

    let trimmed = out.trim_matches(|c: char| !c.is_ascii_alphanumeric());
    let mut value = String::new();
    for ch in trimmed.chars() {
        if value.len() + ch.len_utf8() > LABEL_VALUE_MAX {
            break;
        }
        value.push(ch);
    }
    // Truncation can re-expose a trailing separator.
    value
        .trim_end_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn shell_escape_injection_attempts() {
        assert_eq!(shell_escape("$(whoami)"), "'$(whoami)'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
        assert_eq!(shell_escape("'; rm -rf / #"), "''\\''; rm -rf / #'");
        assert_eq!(shell_escape("`date`"), "'`date`'");
        assert_eq!(shell_escape("a | b > c"), "'a | b > c'");
    }

    /// Re-expand an escaped word the way a POSIX shell would and compare
    /// against the original input.
    fn shell_expand(escaped: &str) -> Option<String> {
        let mut out = String::new();
        let mut rest = escaped;
        loop {
            rest = rest.strip_prefix('\'')?;
            let end = rest.find('\'')?;
            out.push_str(&rest[..end]);
            rest = &rest[end + 1..];
            if rest.is_empty() {
                return Some(out);
            }
            // Only the `'\''` sequence may separate two quoted spans.
            rest = rest.strip_prefix("\\'")?;
            out.push('\'');
        }
    }

    proptest! {
        #[test]
        fn shell_escape_round_trips(input in "\\PC*") {
            let escaped = shell_escape(&input);
            prop_assert_eq!(shell_expand(&escaped), Some(input));
        }

        #[test]
        fn strategy_name_output_is_pascal_case(input in "\\PC*") {
            let name = strategy_class_name(&input);
            let mut chars = name.chars();
            prop_assert!(chars.next().is_some_and(|c| c.is_ascii_uppercase()));
            prop_assert!(chars.all(|c| c.is_ascii_alphanumeric()));
        }

        #[test]
        fn label_value_bounds(input in "\\PC*") {
            let value = label_value(&input);
            prop_assert!(value.len() <= LABEL_VALUE_MAX);
            prop_assert!(value.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'));
            if let (Some(first), Some(last)) = (value.chars().next(), value.chars().last()) {
                prop_assert!(first.is_ascii_alphanumeric());
                prop_assert!(last.is_ascii_alphanumeric());
            }
        }
    }

    #[test]
    fn strategy_name_examples() {
        assert_eq!(strategy_class_name("RSI Test Strategy"), "RsiTestStrategy");
        assert_eq!(strategy_class_name(""), "MyStrategy");
        assert_eq!(strategy_class_name("!!!"), "MyStrategy");
        assert_eq!(strategy_class_name("myStrategy"), "MyStrategy");
        assert_eq!(strategy_class_name("MySTRATEGY"), "MySTRATEGY");
    }

    #[test]
    fn strategy_name_pascal_input_is_identity() {
        assert_eq!(strategy_class_name("SampleStrategy42"), "SampleStrategy42");
        assert_eq!(strategy_class_name("Ema9Cross21"), "Ema9Cross21");
    }

    #[test]
    fn strategy_name_strips_punctuation() {
        assert_eq!(strategy_class_name("mean-reversion v2"), "MeanreversionV2");
        assert_eq!(strategy_class_name("  grid   bot  "), "GridBot");
    }

    #[test]
    fn label_value_examples() {
        assert_eq!(label_value("My Bot"), "My-Bot");
        assert_eq!(label_value("--weird--"), "weird");
        assert_eq!(label_value("a.b_c-d"), "a.b_c-d");
        assert_eq!(label_value("!!!"), "");
        let long = "x".repeat(100);
        assert_eq!(label_value(&long).len(), 63);
    }

    #[test]
    fn label_value_truncation_retrims() {
        // 62 alphanumerics followed by separators: truncation at 63 must not
        // leave a trailing '-'.
        let input = format!("{}--tail", "a".repeat(62));
        let value = label_value(&input);
        assert!(value.len() <= 63);
        assert!(value.ends_with(|c: char| c.is_ascii_alphanumeric()));
    }
}
