//! Structured run reporting.
//!
//! The append-only text log stays the primary trace of a run (every tool's
//! raw output lands there); this module adds a machine-readable
//! `results.json` and a rendered `report.md` on top.

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::HarnessResult;

/// JSON schema version for the run report format.
pub const REPORT_SCHEMA_V1: &str = "condupload-e2e.report.v1";

/// Outcome of one campaign step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: u32,
    pub tag: String,
    pub sync: String,
    /// Resolved target insertion point; `None` for skipped steps.
    pub target_since: Option<i64>,
    pub expected_success: bool,
    pub action: String,
    pub passed: bool,
    /// True when the step had a watermark-relative target and no watermark
    /// had been observed yet.
    pub skipped: bool,
    pub inserted_since: Option<i64>,
    pub detail: String,
    pub duration_ms: u64,
}

/// Aggregate counters over the step records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub steps: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Expectation mismatches accumulated by the driver.
    pub errors: u32,
}

/// Top-level report for one campaign run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub schema_version: String,
    pub run_id: String,
    pub timetype: String,
    pub mode: String,
    pub started_unix_ms: i64,
    pub duration_ms: u64,
    pub summary: RunSummary,
    pub steps: Vec<StepRecord>,
}

impl ValidationReport {
    /// Assemble a report from collected step records.
    #[must_use]
    pub fn new(
        run_id: String,
        timetype: &str,
        mode: &str,
        started_unix_ms: i64,
        duration_ms: u64,
        errors: u32,
        steps: Vec<StepRecord>,
    ) -> Self {
        let passed = steps.iter().filter(|s| s.passed && !s.skipped).count();
        let failed = steps.iter().filter(|s| !s.passed).count();
        let skipped = steps.iter().filter(|s| s.skipped).count();
        Self {
            schema_version: REPORT_SCHEMA_V1.to_owned(),
            run_id,
            timetype: timetype.to_owned(),
            mode: mode.to_owned(),
            started_unix_ms,
            duration_ms,
            summary: RunSummary {
                steps: steps.len(),
                passed,
                failed,
                skipped,
                errors,
            },
            steps,
        }
    }

    /// Render the human-readable markdown form.
    #[must_use]
    pub fn render_markdown(&self) -> String {
        let mut out = String::with_capacity(2048);
        let _ = writeln!(out, "# Conditions Upload Validation Report\n");
        let _ = writeln!(out, "- **Run ID:** {}", self.run_id);
        let _ = writeln!(out, "- **Timetype:** {}", self.timetype);
        let _ = writeln!(out, "- **Mode:** {}", self.mode);
        let _ = writeln!(out, "- **Duration:** {}ms", self.duration_ms);
        let _ = writeln!(
            out,
            "- **Summary:** {}/{} passed, {} failed, {} skipped, {} error(s)\n",
            self.summary.passed,
            self.summary.steps,
            self.summary.failed,
            self.summary.skipped,
            self.summary.errors,
        );

        let _ = writeln!(out, "| Step | Tag | Sync | Target since | Expected | Result |");
        let _ = writeln!(out, "|------|-----|------|--------------|----------|--------|");
        for s in &self.steps {
            let target = s
                .target_since
                .map_or_else(|| "-".to_owned(), |v| v.to_string());
            let expected = format!(
                "{} {}",
                if s.expected_success { "ok" } else { "fail" },
                s.action
            );
            let result = if s.skipped {
                "skipped"
            } else if s.passed {
                "passed"
            } else {
                "FAILED"
            };
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                s.id, s.tag, s.sync, target, expected, result
            );
        }

        if self.summary.failed > 0 {
            let _ = writeln!(out, "\n## Failures\n");
            for s in self.steps.iter().filter(|s| !s.passed) {
                let _ = writeln!(out, "### Step {}\n", s.id);
                let _ = writeln!(out, "- **Tag:** {}", s.tag);
                let _ = writeln!(out, "- **Detail:** {}", s.detail);
                if let Some(since) = s.inserted_since {
                    let _ = writeln!(out, "- **Inserted since:** {since}");
                }
                let _ = writeln!(out);
            }
        }

        out
    }

    /// Write `results.json` and `report.md` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Io`/`HarnessError::Json` on write or
    /// serialization failure.
    pub fn write_files(&self, dir: &Path) -> HarnessResult<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join("results.json"), json)?;
        std::fs::write(dir.join("report.md"), self.render_markdown())?;
        Ok(())
    }
}

/// Load a previously written `results.json`.
///
/// # Errors
///
/// Returns `HarnessError::Io` when the file is missing and
/// `HarnessError::Json` when it does not parse.
pub fn load_results(dir: &Path) -> HarnessResult<ValidationReport> {
    let content = std::fs::read_to_string(dir.join("results.json"))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_step(id: u32, passed: bool) -> StepRecord {
        StepRecord {
            id,
            tag: "test_CondUpload_any".to_owned(),
            sync: "any".to_owned(),
            target_since: Some(200_000),
            expected_success: true,
            action: "CREATE".to_owned(),
            passed,
            skipped: false,
            inserted_since: passed.then_some(200_000),
            detail: if passed {
                "inserted expected since".to_owned()
            } else {
                "since mismatch".to_owned()
            },
            duration_ms: 12,
        }
    }

    #[test]
    fn summary_counts_steps() {
        let report = ValidationReport::new(
            "run-1".to_owned(),
            "run",
            "v1",
            0,
            100,
            1,
            vec![sample_step(1, true), sample_step(2, false)],
        );
        assert_eq!(report.summary.steps, 2);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.errors, 1);
    }

    #[test]
    fn markdown_contains_table_and_failures() {
        let report = ValidationReport::new(
            "run-1".to_owned(),
            "run",
            "compare",
            0,
            100,
            1,
            vec![sample_step(1, true), sample_step(2, false)],
        );
        let md = report.render_markdown();
        assert!(md.contains("# Conditions Upload Validation Report"));
        assert!(md.contains("| 1 | test_CondUpload_any | any | 200000 | ok CREATE | passed |"));
        assert!(md.contains("## Failures"));
        assert!(md.contains("since mismatch"));
    }

    #[test]
    fn write_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let report = ValidationReport::new(
            "run-2".to_owned(),
            "lumi",
            "v2",
            5,
            42,
            0,
            vec![sample_step(1, true)],
        );
        report.write_files(dir.path()).unwrap();

        assert!(dir.path().join("report.md").exists());
        let loaded = load_results(dir.path()).unwrap();
        assert_eq!(loaded.run_id, "run-2");
        assert_eq!(loaded.schema_version, REPORT_SCHEMA_V1);
        assert_eq!(loaded.steps.len(), 1);
    }

    #[test]
    fn skipped_steps_render_with_dash_target() {
        let mut step = sample_step(17, true);
        step.skipped = true;
        step.target_since = None;
        let report =
            ValidationReport::new("run-3".to_owned(), "run", "v1", 0, 1, 0, vec![step]);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.summary.passed, 0);
        assert!(report.render_markdown().contains("| - |"));
    }
}
