//! External query-tool invocation.
//!
//! The conditions query CLI is driven as a black box: spawn, capture combined
//! output, and either check for a produced file (snapshot export) or parse a
//! value out of the text (FCSR).  The parsers are pure functions so they can
//! be exercised without the tool installed.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use crate::{capture_combined, HarnessError, HarnessResult};

/// Configuration for the query tool.
#[derive(Debug, Clone)]
pub struct QueryToolConfig {
    /// Binary name or path of the conditions query CLI.
    pub command: String,
}

impl Default for QueryToolConfig {
    fn default() -> Self {
        Self {
            command: "conddb".to_owned(),
        }
    }
}

/// Wrapper around the conditions query CLI.
pub struct QueryTool {
    config: QueryToolConfig,
}

impl QueryTool {
    #[must_use]
    pub fn new(config: QueryToolConfig) -> Self {
        Self { config }
    }

    /// Export the `[from, to]` since range of `input_tag` into the snapshot
    /// file at `dest`, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::SnapshotMissing` (carrying the tool's output)
    /// when the file does not exist afterwards, or `HarnessError::Io` if the
    /// tool cannot be spawned.
    pub fn export_tag_range(
        &self,
        input_tag: &str,
        from: i64,
        to: i64,
        dest: &Path,
    ) -> HarnessResult<()> {
        if dest.exists() {
            std::fs::remove_file(dest)?;
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.arg("--yes")
            .arg("copy")
            .arg(input_tag)
            .arg(input_tag)
            .arg("--destdb")
            .arg(dest)
            .arg("-f")
            .arg(from.to_string())
            .arg("-t")
            .arg(to.to_string());
        debug!(input_tag, from, to, dest = %dest.display(), "exporting snapshot");
        let output = capture_combined(&mut cmd)?;

        if !dest.exists() {
            return Err(HarnessError::SnapshotMissing {
                path: dest.to_path_buf(),
                detail: truncate(&output, 512),
            });
        }
        info!(input_tag, from, to, dest = %dest.display(), "snapshot exported");
        Ok(())
    }

    /// Query the first-conditions-safe-run watermark.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::ToolOutput` when the marker line is absent, or
    /// `HarnessError::Io` if the tool cannot be spawned.
    pub fn show_fcsr(&self) -> HarnessResult<i64> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("showFCSR");
        let output = capture_combined(&mut cmd)?;
        parse_fcsr_output(&output).ok_or(HarnessError::ToolOutput { what: "FCSR" })
    }
}

/// Extract the FCSR value from the query tool's textual output.
///
/// The tool prints a line of the shape `... Time: <value> [<date>] ...`; the
/// watermark is the integer between the marker and the bracket.
#[must_use]
pub fn parse_fcsr_output(output: &str) -> Option<i64> {
    for line in output.lines() {
        let Some(pos) = line.find("Time:") else {
            continue;
        };
        let rest = &line[pos + "Time:".len()..];
        let value = match rest.find('[') {
            Some(end) => &rest[..end],
            None => rest,
        };
        if let Ok(parsed) = value.trim().parse::<i64>() {
            return Some(parsed);
        }
    }
    None
}

fn truncate(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = s[..end].to_owned();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_fcsr_from_marker_line() {
        let output = "\
Connecting...
FCSR report
----------
Run: 361234 [2026-01-12]
Time: 6936865094961725440 [2026-01-12 08:00:00]
";
        assert_eq!(parse_fcsr_output(output), Some(6_936_865_094_961_725_440));
    }

    #[test]
    fn parse_fcsr_without_bracket() {
        assert_eq!(parse_fcsr_output("Time: 42"), Some(42));
    }

    #[test]
    fn parse_fcsr_missing_marker() {
        assert_eq!(parse_fcsr_output("no watermark here"), None);
    }

    #[test]
    fn parse_fcsr_non_numeric_value() {
        assert_eq!(parse_fcsr_output("Time: pending [n/a]"), None);
    }

    #[test]
    fn export_with_missing_tool_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tool = QueryTool::new(QueryToolConfig {
            command: "definitely-not-a-real-query-tool".to_owned(),
        });
        let err = tool
            .export_tag_range("tag", 1, 2, &dir.path().join("out.db"))
            .unwrap_err();
        assert!(matches!(err, HarnessError::Io(_)));
    }

    #[test]
    fn truncate_marks_long_output() {
        let long = "x".repeat(1000);
        let t = truncate(&long, 100);
        assert!(t.ends_with("...[truncated]"));
        assert!(t.len() < 130);
    }
}
