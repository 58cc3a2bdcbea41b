//! Netrc lookup for the upload tool's credentials.
//!
//! The harness never authenticates anything itself; the upload tool reads
//! the netrc on its own.  This module only fails fast *before* a campaign
//! when the required machine entry is absent, instead of discovering it 37
//! uploads in.

use std::path::Path;

use crate::{HarnessError, HarnessResult};

/// One resolved netrc machine entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrcEntry {
    pub login: String,
    pub password: String,
}

/// Look up `machine` in the netrc file at `path`.
///
/// Falls back to a `default` entry when present.
///
/// # Errors
///
/// Returns `HarnessError::Credentials` when the file cannot be read or no
/// matching entry exists.
pub fn require_entry(path: &Path, machine: &str) -> HarnessResult<NetrcEntry> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        HarnessError::Credentials(format!("cannot read netrc {}: {e}", path.display()))
    })?;
    lookup(&content, machine).ok_or_else(|| {
        HarnessError::Credentials(format!(
            "no '{machine}' entry in netrc {}",
            path.display()
        ))
    })
}

/// Find the entry for `machine` (or the `default` entry) in netrc text.
#[must_use]
pub fn lookup(content: &str, machine: &str) -> Option<NetrcEntry> {
    let mut entries: Vec<(String, NetrcEntry)> = Vec::new();
    let mut tokens = content.split_whitespace();

    let mut name: Option<String> = None;
    let mut entry = NetrcEntry {
        login: String::new(),
        password: String::new(),
    };

    while let Some(tok) = tokens.next() {
        match tok {
            "machine" | "default" => {
                if let Some(n) = name.take() {
                    entries.push((n, entry.clone()));
                }
                entry.login.clear();
                entry.password.clear();
                name = if tok == "default" {
                    Some("default".to_owned())
                } else {
                    tokens.next().map(str::to_owned)
                };
            }
            "login" => entry.login = tokens.next().unwrap_or_default().to_owned(),
            "password" => entry.password = tokens.next().unwrap_or_default().to_owned(),
            // `account` values and `macdef` bodies are irrelevant here.
            _ => {}
        }
    }
    if let Some(n) = name.take() {
        entries.push((n, entry));
    }

    entries
        .iter()
        .find(|(n, _)| n == machine)
        .or_else(|| entries.iter().find(|(n, _)| n == "default"))
        .map(|(_, e)| e.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
machine Dropbox login svc_writer password hunter2
machine other login nobody password nothing
";

    #[test]
    fn lookup_finds_named_machine() {
        let entry = lookup(SAMPLE, "Dropbox").unwrap();
        assert_eq!(entry.login, "svc_writer");
        assert_eq!(entry.password, "hunter2");
    }

    #[test]
    fn lookup_misses_absent_machine() {
        assert_eq!(lookup(SAMPLE, "absent"), None);
    }

    #[test]
    fn lookup_falls_back_to_default_entry() {
        let content = "default login anon password guest\n";
        let entry = lookup(content, "whatever").unwrap();
        assert_eq!(entry.login, "anon");
    }

    #[test]
    fn named_entry_wins_over_default() {
        let content = "\
default login anon password guest
machine Dropbox login svc password pw
";
        let entry = lookup(content, "Dropbox").unwrap();
        assert_eq!(entry.login, "svc");
    }

    #[test]
    fn multi_line_form_parses() {
        let content = "machine Dropbox\n  login a\n  password b\n";
        let entry = lookup(content, "Dropbox").unwrap();
        assert_eq!(entry.login, "a");
        assert_eq!(entry.password, "b");
    }

    #[test]
    fn require_entry_reports_missing_file() {
        let err = require_entry(Path::new("/nonexistent/netrc"), "Dropbox").unwrap_err();
        assert!(err.to_string().contains("cannot read netrc"));
    }

    #[test]
    fn require_entry_reports_missing_machine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netrc");
        std::fs::write(&path, "machine other login x password y\n").unwrap();
        let err = require_entry(&path, "Dropbox").unwrap_err();
        assert!(err.to_string().contains("no 'Dropbox' entry"));
    }
}
