//! Leading `@` directives.
//!
//! `@<model-id>` at the start of a message rewrites the provider/model for
//! that call only. Other `@key` or `@key=value` tokens are collected and
//! ignored by the core (plugins may consume them later). Parsing stops at
//! the first token that is not an `@` directive; the rest is the body with
//! its original spacing.

use crate::cli::provider_for_model;

#[derive(Debug, Clone, Default)]
pub struct Directives {
    /// `(provider, model)` when a model directive was present.
    pub model: Option<(&'static str, String)>,
    /// Unrecognized `@` tokens, stripped from the body.
    pub ignored: Vec<String>,
    pub body: String,
}

pub fn parse(text: &str) -> Directives {
    let mut directives = Directives::default();
    let mut rest = text.trim_start();

    loop {
        let Some(token) = rest.split_whitespace().next() else {
            break;
        };
        let Some(stripped) = token.strip_prefix('@') else {
            break;
        };
        if stripped.is_empty() {
            break;
        }

        let key = stripped.split('=').next().unwrap_or(stripped);
        if let Some(provider) = provider_for_model(key) {
            directives.model = Some((provider, key.to_string()));
        } else {
            directives.ignored.push(stripped.to_string());
        }

        rest = rest[token.len()..].trim_start();
    }

    directives.body = rest.to_string();
    directives
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_directive() {
        let d = parse("@opus review this file");
        assert_eq!(d.model, Some(("claude", "opus".to_string())));
        assert_eq!(d.body, "review this file");
        assert!(d.ignored.is_empty());
    }

    #[test]
    fn test_codex_model_directive() {
        let d = parse("@gpt-5-codex fix the tests");
        assert_eq!(d.model, Some(("codex", "gpt-5-codex".to_string())));
        assert_eq!(d.body, "fix the tests");
    }

    #[test]
    fn test_unknown_directives_collected() {
        let d = parse("@verbose @retries=3 do the thing");
        assert!(d.model.is_none());
        assert_eq!(d.ignored, vec!["verbose", "retries=3"]);
        assert_eq!(d.body, "do the thing");
    }

    #[test]
    fn test_directive_only_message() {
        let d = parse("@sonnet");
        assert_eq!(d.model, Some(("claude", "sonnet".to_string())));
        assert!(d.body.is_empty());
    }

    #[test]
    fn test_at_midsentence_is_not_a_directive() {
        let d = parse("email me @ work about @opus");
        assert!(d.model.is_none());
        assert_eq!(d.body, "email me @ work about @opus");
    }

    #[test]
    fn test_plain_text_untouched() {
        let d = parse("just a normal message");
        assert!(d.model.is_none());
        assert_eq!(d.body, "just a normal message");
    }
}
