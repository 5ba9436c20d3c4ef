//! Message templates and the variant keys that scope send history.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

pub const DEFAULT_TEMPLATE_PATH: &str = "templates/default.txt";
const BUILTIN_TEMPLATE: &str = "Hello {username}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplate {
    pub text: String,
    /// Stable identity of the template; part of the history variant key.
    pub id: String,
}

impl MessageTemplate {
    /// Template stored inline (flow metadata). The id is derived from the
    /// text, so editing the template starts a fresh variant.
    pub fn inline(text: &str) -> Self {
        let text = text.trim().to_string();
        let id = format!("tpl-{}", short_digest(&text));
        Self { text, id }
    }

    /// Template read from `path`, falling back to `templates/default.txt`
    /// and then to a built-in greeting. The id is the file name of `path`.
    pub fn from_file(path: Option<&Path>) -> Self {
        let id = path
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "default".to_string());
        Self {
            text: load_template_text(path, Path::new(DEFAULT_TEMPLATE_PATH)),
            id,
        }
    }

    pub fn render(&self, recipient: &str, flow: &str, identity: &str) -> String {
        render(&self.text, recipient, flow, identity)
    }
}

pub fn variant_key(flow: &str, template: &MessageTemplate) -> String {
    format!("{}:{}", flow, template.id)
}

pub fn load_template_text(path: Option<&Path>, default_path: &Path) -> String {
    for candidate in path.into_iter().chain(std::iter::once(default_path)) {
        match fs::read_to_string(candidate) {
            Ok(text) if !text.trim().is_empty() => return text.trim().to_string(),
            Ok(_) => {}
            Err(e) => tracing::debug!("Template {:?} not readable: {}", candidate, e),
        }
    }
    BUILTIN_TEMPLATE.to_string()
}

/// Fill `{username}`, `{group_name}` and `{sender_name}` (aliases
/// `{recipient}`, `{flow}`, `{identity}`). Unknown placeholders are kept
/// verbatim; `{{` and `}}` produce literal braces.
pub fn render(template: &str, recipient: &str, flow: &str, identity: &str) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut rest = template;

    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            out.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find(['}', '{']) {
            Some(end) if tail.as_bytes()[end + 1] == b'}' => {
                let name = &tail[1..end + 1];
                match placeholder_value(name.trim(), recipient, flow, identity) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&tail[..end + 2]),
                }
                rest = &tail[end + 2..];
            }
            _ => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn placeholder_value<'a>(
    name: &str,
    recipient: &'a str,
    flow: &'a str,
    identity: &'a str,
) -> Option<&'a str> {
    match name {
        "username" | "recipient" => Some(recipient),
        "group_name" | "flow" => Some(flow),
        "sender_name" | "identity" => Some(identity),
        _ => None,
    }
}

fn short_digest(text: &str) -> String {
    Sha256::digest(text.as_bytes())
        .iter()
        .take(5)
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_known_placeholders() {
        let text = render(
            "Hi {username}, {group_name} here ({sender_name}) / {flow} {identity} {recipient}",
            "@alice",
            "physics",
            "sender_a",
        );
        assert_eq!(
            text,
            "Hi @alice, physics here (sender_a) / physics sender_a @alice"
        );
    }

    #[test]
    fn unknown_and_broken_placeholders_survive() {
        assert_eq!(
            render("{greeting} {username} {", "@bob_b", "f", "s"),
            "{greeting} @bob_b {"
        );
        assert_eq!(render("{{username}} }", "@bob_b", "f", "s"), "{username} }");
        assert_eq!(render("a {x {username}", "@bob_b", "f", "s"), "a {x @bob_b");
    }

    #[test]
    fn inline_variant_changes_with_text() {
        let a = MessageTemplate::inline("Offer A {username}");
        let b = MessageTemplate::inline("Offer B {username}");
        assert_ne!(variant_key("physics", &a), variant_key("physics", &b));
        assert_eq!(a.id, MessageTemplate::inline("  Offer A {username}\n").id);
        assert!(variant_key("physics", &a).starts_with("physics:tpl-"));
    }

    #[test]
    fn file_template_uses_file_name_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto_offer.txt");
        std::fs::write(&path, "  Welcome {username}\n").unwrap();

        let tpl = MessageTemplate::from_file(Some(&path));
        assert_eq!(tpl.text, "Welcome {username}");
        assert_eq!(variant_key("AUTO", &tpl), "AUTO:auto_offer.txt");

        let missing = load_template_text(
            Some(&dir.path().join("missing.txt")),
            &dir.path().join("also_missing.txt"),
        );
        assert_eq!(missing, BUILTIN_TEMPLATE);
    }
}
