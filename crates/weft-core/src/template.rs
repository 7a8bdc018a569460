//! `{name}` interpolation inside instruction text.

use std::sync::OnceLock;

use regex::Regex;

fn var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_-]+)\}").expect("valid variable pattern"))
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("valid identifier pattern"))
}

/// Whether `s` is a legal agent, variable, label or temp agent name.
pub fn is_identifier(s: &str) -> bool {
    identifier_pattern().is_match(s)
}

/// Variable names referenced by `text`, first occurrence order, no duplicates.
pub fn references(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in var_pattern().captures_iter(text) {
        let name = &cap[1];
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Substitute every `{name}` using `lookup`.
///
/// Returns the first name `lookup` cannot resolve as the error.
pub fn render<'a, F>(text: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<&'a str>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for cap in var_pattern().captures_iter(text) {
        let Some(whole) = cap.get(0) else {
            continue;
        };
        let name = &cap[1];
        let value = lookup(name).ok_or_else(|| name.to_string())?;
        out.push_str(&text[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_references_dedup_in_order() {
        let refs = references("fix {bugs} using {plan}, then recheck {bugs}");
        assert_eq!(refs, vec!["bugs".to_string(), "plan".to_string()]);
    }

    #[test]
    fn test_non_identifier_braces_ignored() {
        assert!(references(r#"return {"ok": true}"#).is_empty());
        assert!(references("{ spaced }").is_empty());
    }

    #[test]
    fn test_render_substitutes() {
        let out = render("fix {bugs}!", |name| (name == "bugs").then_some("b1, b2")).unwrap();
        assert_eq!(out, "fix b1, b2!");
    }

    #[test]
    fn test_render_reports_missing() {
        let err = render("use {plan} and {bugs}", |name| (name == "plan").then_some("p")).unwrap_err();
        assert_eq!(err, "bugs");
    }

    #[test]
    fn test_identifiers() {
        assert!(is_identifier("general-purpose"));
        assert!(is_identifier("fix_2"));
        assert!(!is_identifier("bad name"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("ns:agent"));
    }
}
