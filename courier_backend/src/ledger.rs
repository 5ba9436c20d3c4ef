//! Minimal append-only CSV helpers shared by the send-history ledger and the
//! send-outcome log.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }
    Ok(())
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn format_row(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Append one row, writing `header` first when the file is new or empty.
pub fn append_row(path: &Path, header: &[&str], fields: &[&str]) -> Result<()> {
    ensure_parent_dir(path)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open ledger {:?}", path))?;

    let is_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
    let mut buf = String::new();
    if is_empty {
        buf.push_str(&format_row(header));
        buf.push('\n');
    }
    buf.push_str(&format_row(fields));
    buf.push('\n');

    file.write_all(buf.as_bytes())
        .with_context(|| format!("Failed to append to ledger {:?}", path))?;
    Ok(())
}

/// Split a single CSV line, honoring double-quoted fields.
pub fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' if current.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_fields_that_need_it() {
        assert_eq!(format_row(&["a", "b,c", "say \"hi\""]), "a,\"b,c\",\"say \"\"hi\"\"\"");
    }

    #[test]
    fn split_handles_quoted_commas() {
        let row = format_row(&["2024-01-01T00:00:00+00:00", "@alice", "err, with comma"]);
        assert_eq!(
            split_row(&row),
            vec!["2024-01-01T00:00:00+00:00", "@alice", "err, with comma"]
        );
    }

    #[test]
    fn header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("x.csv");
        append_row(&path, &["a", "b"], &["1", "2"]).unwrap();
        append_row(&path, &["a", "b"], &["3", "4"]).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "a,b\n1,2\n3,4\n");
    }
}
