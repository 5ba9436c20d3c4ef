//! Exact-word keyword matching.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex_lite::Regex;

/// Used when keyword filtering is enabled but no keywords are configured.
pub const DEFAULT_KEYWORDS: [&str; 5] = ["مشروع", "خصوصى", "خصوصي", "خصوصيين", "خصو"];

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[0-9A-Za-z\x{0600}-\x{06FF}]+").expect("static regex"))
}

/// Split text into words of ASCII letters, digits and Arabic-block
/// characters. Everything else is a separator.
pub fn tokenize(text: &str) -> Vec<&str> {
    word_re().find_iter(text).map(|m| m.as_str()).collect()
}

#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    keywords: HashSet<String>,
    case_insensitive: bool,
}

impl KeywordMatcher {
    pub fn new<I, S>(keywords: I, case_insensitive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set: HashSet<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_string())
            .filter(|k| !k.is_empty())
            .map(|k| if case_insensitive { k.to_lowercase() } else { k })
            .collect();
        if set.is_empty() {
            set = DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect();
        }
        Self {
            keywords: set,
            case_insensitive,
        }
    }

    /// Keywords that occur as whole words in `text`, in order of first
    /// appearance.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let folded;
        let text = if self.case_insensitive {
            folded = text.to_lowercase();
            folded.as_str()
        } else {
            text
        };

        let mut hits: Vec<String> = Vec::new();
        for word in tokenize(text) {
            if self.keywords.contains(word) && !hits.iter().any(|h| h == word) {
                hits.push(word.to_string());
            }
        }
        hits
    }

    pub fn is_match(&self, text: &str) -> bool {
        !self.matches(text).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_splits_on_punctuation() {
        assert_eq!(tokenize("need-a tutor, ASAP!"), vec!["need", "a", "tutor", "ASAP"]);
        assert_eq!(tokenize("مشروع! تخرج"), vec!["مشروع", "تخرج"]);
    }

    #[test]
    fn matches_whole_words_only() {
        let matcher = KeywordMatcher::new(["tutor", "Project"], true);
        assert!(matcher.is_match("Looking for a TUTOR."));
        assert!(matcher.is_match("graduation project"));
        assert!(!matcher.is_match("tutoring sessions"));
        assert_eq!(matcher.matches("tutor? tutor! project"), vec!["tutor", "project"]);
    }

    #[test]
    fn case_sensitive_matching() {
        let matcher = KeywordMatcher::new(["Tutor"], false);
        assert!(matcher.is_match("Tutor wanted"));
        assert!(!matcher.is_match("tutor wanted"));
    }

    #[test]
    fn empty_list_falls_back_to_defaults() {
        let matcher = KeywordMatcher::new(Vec::<String>::new(), true);
        assert!(matcher.is_match("عندي مشروع تخرج"));
        assert!(!matcher.is_match("hello there"));
    }
}
