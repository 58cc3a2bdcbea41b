//! End-to-end validation harness for the conditions upload service.
//!
//! This crate provides the infrastructure for:
//! - **Payload staging**: exporting tag snapshots through the query tool,
//!   copying them into per-step working files, and hashing them for the log
//! - **Upload invocation**: spawning the upload tool, scanning its output for
//!   the success marker, and appending the raw output to the run log
//! - **State assertions**: parameterized queries against the conditions
//!   schema and row-by-row comparison of two tags' contents
//! - **Campaign orchestration**: the fixed per-synchronization-mode scenario
//!   table, executed sequentially with an expectation check after every step

pub mod db;
pub mod driver;
pub mod metadata;
pub mod netrc;
pub mod query_tool;
pub mod report;
pub mod scenario;
pub mod snapshot;
pub mod uploader;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Result type alias used throughout the harness.
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Errors that can arise while driving a validation campaign.
///
/// Expectation mismatches are *not* errors at this level: they increment the
/// driver's error counter and only surface as [`HarnessError::WorkflowFailed`]
/// once a step finishes with a nonzero count.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// An I/O error from the filesystem or a spawned process.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A conditions-schema or snapshot-file query error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Metadata or report serialization failure.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// The upload tool's credentials file is missing or incomplete.
    #[error("credentials: {0}")]
    Credentials(String),

    /// The query tool did not produce the requested snapshot file.
    #[error("snapshot was not created: {path} ({detail})")]
    SnapshotMissing { path: PathBuf, detail: String },

    /// A required value could not be parsed out of a tool's textual output.
    #[error("could not parse {what} from tool output")]
    ToolOutput { what: &'static str },

    /// A step finished with accumulated expectation mismatches.
    #[error("workflow {step} failed with {errors} accumulated error(s)")]
    WorkflowFailed { step: u32, errors: u32 },
}

/// Which upload service implementation a run exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestMode {
    /// The original upload tool only.
    V1,
    /// The successor upload tool only.
    V2,
    /// Every step runs against both tools and the resulting tags are diffed.
    Compare,
}

impl TestMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
            Self::Compare => "compare",
        }
    }
}

/// Harness-wide settings with the defaults the campaign was written against.
///
/// This struct is the single source of truth for the knobs shared between the
/// staging, upload, and reporting stages.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Destination database URI written into every metadata file.
    pub destination_database: String,
    /// Prefix for the per-synchronization-mode destination tags.
    pub base_tag: String,
    /// Upload server URL passed to the successor tool.
    pub server_url: String,
    /// Machine entry the upload tool expects in the netrc file.
    pub netrc_machine: String,
    /// Fixed delay after every upload so runs never overlap on the server.
    pub post_upload_delay: Duration,
    /// File name of the append-only text log.
    pub log_file_name: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            destination_database: "oracle://cms_orcoff_prep/CMS_CONDITIONS".to_owned(),
            base_tag: "test_CondUpload".to_owned(),
            server_url: "https://cms-conddb-dev.cern.ch/cmsDbCondUpload/".to_owned(),
            netrc_machine: "Dropbox".to_owned(),
            post_upload_delay: Duration::from_secs(2),
            log_file_name: "condition_upload_e2e.log".to_owned(),
        }
    }
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn unix_ms() -> i64 {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    i64::try_from(ms).unwrap_or(i64::MAX)
}

/// Append one line to the run log, creating the file if needed.
///
/// # Errors
///
/// Returns `HarnessError::Io` if the file cannot be opened or written.
pub fn append_log_line(path: &Path, text: &str) -> HarnessResult<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    writeln!(file, "{text}")?;
    Ok(())
}

/// Capture a child process's stdout and stderr as one combined string.
///
/// The exit status is intentionally discarded by most callers: the tools this
/// harness drives signal success through output markers, not exit codes.
pub(crate) fn capture_combined(cmd: &mut std::process::Command) -> std::io::Result<String> {
    let output = cmd
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()?;
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&stderr);
    }
    Ok(combined)
}
