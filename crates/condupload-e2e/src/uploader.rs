//! External upload invocation.
//!
//! One blocking subprocess per upload: spawn the tool, capture combined
//! output, scan it line-by-line for the tool's success marker, append the raw
//! output to the run log, then sleep a fixed delay so consecutive uploads
//! never overlap on the server.  A missing marker is an upload *failure*, not
//! a harness error; the driver decides whether failure was expected.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::{append_log_line, capture_combined, HarnessResult};

/// Which generation of the upload tool to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolVersion {
    V1,
    V2,
}

impl ToolVersion {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

/// Everything the uploader needs to know about one upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub tool: ToolVersion,
    pub dest_tag: String,
    /// Working-file stem: the snapshot lives at `<stem>.db`, the metadata
    /// document at `<stem>.json`.
    pub stem: PathBuf,
    pub since: i64,
}

/// Outcome of one upload attempt.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    /// Whether the tool's success marker was found in the output.
    pub succeeded: bool,
    /// Combined stdout/stderr of the tool.
    pub raw_output: String,
}

/// Seam between the driver and the upload subprocess.
pub trait UploadService {
    /// Perform one upload and report whether the tool claimed success.
    ///
    /// # Errors
    ///
    /// Implementations return an error only when the upload could not be
    /// *attempted* (spawn failure, unreadable staging files); a tool that ran
    /// and failed is a successful call with `succeeded == false`.
    fn upload(&mut self, request: &UploadRequest) -> HarnessResult<UploadOutcome>;
}

/// Configuration for the subprocess-backed uploader.
#[derive(Debug, Clone)]
pub struct UploadToolConfig {
    /// Binary name or path of the original upload tool.
    pub v1_command: String,
    /// Authentication directory passed to the original tool via `-a`.
    pub v1_auth_path: PathBuf,
    /// Binary name or path of the successor upload tool.
    pub v2_command: String,
    /// Upload server URL for the successor tool.
    pub server_url: String,
    /// Netrc file for the successor tool.
    pub netrc: PathBuf,
    /// Fixed post-upload delay.
    pub post_upload_delay: Duration,
    /// Append-only run log receiving every tool's raw output.
    pub log_file: PathBuf,
}

/// Subprocess-backed [`UploadService`].
pub struct ProcessUploader {
    config: UploadToolConfig,
}

impl ProcessUploader {
    #[must_use]
    pub fn new(config: UploadToolConfig) -> Self {
        Self { config }
    }

    fn build_command(&self, request: &UploadRequest) -> Command {
        match request.tool {
            ToolVersion::V1 => {
                let mut cmd = Command::new(&self.config.v1_command);
                cmd.arg("-a")
                    .arg(&self.config.v1_auth_path)
                    .arg(&request.stem);
                cmd
            }
            ToolVersion::V2 => {
                let mut cmd = Command::new(&self.config.v2_command);
                cmd.arg("--metadataFile")
                    .arg(request.stem.with_extension("json"))
                    .arg("--server")
                    .arg(&self.config.server_url)
                    .arg("--netrc")
                    .arg(&self.config.netrc)
                    .arg("--sourceDB")
                    .arg(request.stem.with_extension("db"));
                cmd
            }
        }
    }
}

impl UploadService for ProcessUploader {
    fn upload(&mut self, request: &UploadRequest) -> HarnessResult<UploadOutcome> {
        let mut cmd = self.build_command(request);
        debug!(
            tool = request.tool.as_str(),
            dest_tag = %request.dest_tag,
            since = request.since,
            "invoking upload tool"
        );
        let raw_output = capture_combined(&mut cmd)?;
        let succeeded = upload_succeeded(request.tool, &raw_output);
        append_log_line(&self.config.log_file, &raw_output)?;
        info!(
            tool = request.tool.as_str(),
            dest_tag = %request.dest_tag,
            succeeded,
            "upload finished"
        );
        std::thread::sleep(self.config.post_upload_delay);
        Ok(UploadOutcome {
            succeeded,
            raw_output,
        })
    }
}

/// Marker line prefix of the original tool; the trailing token is its exit
/// code and only `0` counts as success.
const V1_MARKER: &str = "upload ended with code:";
/// Marker line of the successor tool.
const V2_MARKER: &str = "Process completed without issues.";

/// Scan tool output for the version-specific success marker.
#[must_use]
pub fn upload_succeeded(tool: ToolVersion, output: &str) -> bool {
    match tool {
        ToolVersion::V1 => v1_succeeded(output),
        ToolVersion::V2 => output.lines().any(|line| line.starts_with(V2_MARKER)),
    }
}

fn v1_succeeded(output: &str) -> bool {
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix(V1_MARKER) {
            return rest.trim() == "0";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_marker_requires_code_zero() {
        let ok = "copying payloads...\nupload ended with code: 0\n";
        let bad = "copying payloads...\nupload ended with code: 34\n";
        assert!(upload_succeeded(ToolVersion::V1, ok));
        assert!(!upload_succeeded(ToolVersion::V1, bad));
    }

    #[test]
    fn v1_marker_must_start_the_line() {
        let buried = "note: upload ended with code: 0\n";
        assert!(!upload_succeeded(ToolVersion::V1, buried));
    }

    #[test]
    fn v2_marker_is_a_plain_line() {
        let ok = "validating...\nProcess completed without issues.\n";
        assert!(upload_succeeded(ToolVersion::V2, ok));
        assert!(!upload_succeeded(ToolVersion::V2, "Process aborted.\n"));
    }

    #[test]
    fn missing_marker_is_failure_for_both_tools() {
        assert!(!upload_succeeded(ToolVersion::V1, ""));
        assert!(!upload_succeeded(ToolVersion::V2, ""));
    }

    #[test]
    fn markers_do_not_cross_tools() {
        assert!(!upload_succeeded(
            ToolVersion::V1,
            "Process completed without issues.\n"
        ));
        assert!(!upload_succeeded(
            ToolVersion::V2,
            "upload ended with code: 0\n"
        ));
    }

    #[test]
    fn v1_command_shape() {
        let uploader = ProcessUploader::new(test_config());
        let request = request_for(ToolVersion::V1);
        let cmd = uploader.build_command(&request);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-a");
        assert!(args[1].ends_with("auth"));
        assert!(args[2].ends_with("dest_tag_any"));
    }

    #[test]
    fn v2_command_shape() {
        let uploader = ProcessUploader::new(test_config());
        let request = request_for(ToolVersion::V2);
        let cmd = uploader.build_command(&request);
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "--metadataFile");
        assert!(args[1].ends_with("dest_tag_any.json"));
        assert_eq!(args[2], "--server");
        assert_eq!(args[3], "https://upload.example/");
        assert_eq!(args[4], "--netrc");
        assert_eq!(args[6], "--sourceDB");
        assert!(args[7].ends_with("dest_tag_any.db"));
    }

    fn test_config() -> UploadToolConfig {
        UploadToolConfig {
            v1_command: "uploadConditions".to_owned(),
            v1_auth_path: PathBuf::from("/work/auth"),
            v2_command: "uploadConditions-v2".to_owned(),
            server_url: "https://upload.example/".to_owned(),
            netrc: PathBuf::from("/work/.netrc"),
            post_upload_delay: Duration::from_millis(0),
            log_file: PathBuf::from("/tmp/run.log"),
        }
    }

    fn request_for(tool: ToolVersion) -> UploadRequest {
        UploadRequest {
            tool,
            dest_tag: "dest_tag_any".to_owned(),
            stem: PathBuf::from("/work/dest_tag_any"),
            since: 200_000,
        }
    }
}
