//! Topic sections: named keyword groups filed under a topic tag.

use std::collections::HashSet;

use sha2::{Digest, Sha256};

use crate::database::TopicSection;

/// Global sections first, then topic sections, skipping names already seen.
pub fn merge_sections(global: &[TopicSection], topic: &[TopicSection]) -> Vec<TopicSection> {
    let mut seen = HashSet::new();
    global
        .iter()
        .chain(topic)
        .filter(|s| {
            let name = s.name.trim();
            !name.is_empty() && seen.insert(name.to_string())
        })
        .cloned()
        .collect()
}

/// Names of the sections with a keyword occurring anywhere in `text`
/// (substring match, not whole words).
pub fn match_sections(text: &str, sections: &[TopicSection], case_insensitive: bool) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let haystack = if case_insensitive { text.to_lowercase() } else { text.to_string() };

    let mut matched: Vec<String> = Vec::new();
    for section in sections {
        let hit = section.keywords.iter().any(|kw| {
            let kw = kw.trim();
            if kw.is_empty() {
                return false;
            }
            if case_insensitive {
                haystack.contains(&kw.to_lowercase())
            } else {
                haystack.contains(kw)
            }
        });
        if hit && !matched.contains(&section.name) {
            matched.push(section.name.clone());
        }
    }
    matched
}

/// File stem for a section queue: lowercase, whitespace runs become `_`,
/// anything outside `[0-9a-zA-Z_]` is dropped, at most 60 chars. Names
/// with nothing left map to `sec_<hash>`.
pub fn slugify_section_name(name: &str) -> String {
    let mut slug = String::new();
    let mut in_space = false;
    for c in name.trim().to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_space {
                slug.push('_');
            }
            in_space = true;
            continue;
        }
        in_space = false;
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c);
        }
    }

    if slug.is_empty() {
        let digest: String = Sha256::digest(name.as_bytes())
            .iter()
            .take(5)
            .map(|b| format!("{:02x}", b))
            .collect();
        return format!("sec_{}", digest);
    }
    slug.chars().take(60).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(name: &str, keywords: &[&str]) -> TopicSection {
        TopicSection {
            name: name.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn global_sections_come_first_and_win_on_name_clash() {
        let merged = merge_sections(
            &[section("Thesis", &["thesis"]), section("Calculus", &["integral"])],
            &[section("Calculus", &["calc"]), section("Physics", &["physics"])],
        );
        let names: Vec<&str> = merged.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Thesis", "Calculus", "Physics"]);
        assert_eq!(merged[1].keywords, vec!["integral"]);
    }

    #[test]
    fn substring_matching_is_case_folded() {
        let sections = [section("Calculus", &["calc"]), section("Physics", &["physics", ""])];
        assert_eq!(
            match_sections("Need help with CALCULUS homework", &sections, true),
            vec!["Calculus"]
        );
        assert!(match_sections("Need help with CALCULUS", &sections, false).is_empty());
        assert!(match_sections("   ", &sections, true).is_empty());
    }

    #[test]
    fn slugs() {
        assert_eq!(slugify_section_name("  Linear   Algebra 2 "), "linear_algebra_2");
        assert_eq!(slugify_section_name("C++ / Data-Structures"), "c__datastructures");
        assert_eq!(slugify_section_name(&"x".repeat(80)).len(), 60);

        let arabic = slugify_section_name("رياضيات");
        assert!(arabic.starts_with("sec_"));
        assert_eq!(arabic.len(), 14);
    }
}
