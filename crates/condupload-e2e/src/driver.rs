//! Scenario driver.
//!
//! Executes the campaign sequentially: stage payload + metadata, invoke the
//! upload through the [`UploadService`] seam, then check the observed rows
//! against the step's declared expectation.  Mismatches increment a shared
//! error counter and are written to the run log; a step that finishes with a
//! nonzero counter aborts the run.
//!
//! In comparison mode every step is repeated against the successor tool into
//! a `_v2` sibling tag, and the two tags' contents are diffed row-by-row.

use std::path::PathBuf;
use std::time::Instant;

use tracing::{info, warn};

use crate::db::{compare_iovs, compare_metadata, CondDb};
use crate::metadata::UploadMetadata;
use crate::report::{StepRecord, ValidationReport};
use crate::scenario::{phases, ExpectedAction, InputDataset, Step, SyncMode, TimeType};
use crate::snapshot::{remove_staged, stage_for_upload, BaseSnapshot, SnapshotProvider};
use crate::uploader::{ToolVersion, UploadRequest, UploadService};
use crate::{append_log_line, unix_ms, HarnessError, HarnessResult, ServiceSettings, TestMode};

/// Driver configuration: shared settings plus the run-local paths.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub settings: ServiceSettings,
    pub mode: TestMode,
    /// Directory receiving staged snapshots and metadata files.
    pub workdir: PathBuf,
    /// Append-only run log.
    pub log_file: PathBuf,
}

/// Result of one upload attempt plus its expectation check.
struct AttemptOutcome {
    ok: bool,
    inserted: Option<i64>,
    detail: String,
}

/// Sequential scenario driver.
pub struct ValidationDriver<U, S> {
    db: CondDb,
    uploader: U,
    snapshots: S,
    config: DriverConfig,
    errors: u32,
    upload_seq: u32,
    fcsr: Option<i64>,
    /// Latest millisecond at which an earlier attempt may have written rows;
    /// the next observation window must open strictly after it.
    clock_floor: Option<i64>,
    records: Vec<StepRecord>,
    started_unix_ms: i64,
    started: Instant,
}

impl<U: UploadService, S: SnapshotProvider> ValidationDriver<U, S> {
    #[must_use]
    pub fn new(db: CondDb, uploader: U, snapshots: S, config: DriverConfig) -> Self {
        Self {
            db,
            uploader,
            snapshots,
            config,
            errors: 0,
            upload_seq: 0,
            fcsr: None,
            clock_floor: None,
            records: Vec::new(),
            started_unix_ms: unix_ms(),
            started: Instant::now(),
        }
    }

    /// Accumulated expectation mismatches.
    #[must_use]
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Run the full campaign for `timetype`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::WorkflowFailed`] as soon as a step finishes
    /// with a nonzero error counter; infrastructure failures (staging, SQL,
    /// spawn) propagate as their own variants.  Step records collected up to
    /// the failure stay available through [`Self::into_report`].
    pub fn run_campaign(&mut self, timetype: TimeType) -> HarnessResult<()> {
        let dataset = timetype.dataset();
        self.log(&format!(
            "# Campaign start: timetype={} mode={}",
            timetype.as_str(),
            self.config.mode.as_str()
        ));

        for phase in phases(timetype) {
            let tag = phase.dest_tag(&self.config.settings.base_tag);
            self.clean_up(&tag)?;
            for step in &phase.steps {
                self.run_step(&tag, phase.sync, &dataset, step)?;
            }
            self.clean_up(&tag)?;
        }

        self.log(&format!("Done. Errors: {}", self.errors));
        Ok(())
    }

    /// Execute one step: primary upload, expectation check, and, in
    /// comparison mode, the `_v2` sibling upload plus the row-level diff.
    ///
    /// # Errors
    ///
    /// See [`Self::run_campaign`].
    pub fn run_step(
        &mut self,
        tag: &str,
        sync: SyncMode,
        dataset: &InputDataset,
        step: &Step,
    ) -> HarnessResult<()> {
        let step_started = Instant::now();

        let Some(target) = step.since.resolve(self.fcsr) else {
            self.log(&format!(
                "# {} skipped: no watermark observed yet",
                step.id
            ));
            self.records.push(StepRecord {
                id: step.id,
                tag: tag.to_owned(),
                sync: sync.as_str().to_owned(),
                target_since: None,
                expected_success: step.expect_success,
                action: step.action.as_str().to_owned(),
                passed: true,
                skipped: true,
                inserted_since: None,
                detail: "no watermark observed; step skipped".to_owned(),
                duration_ms: 0,
            });
            return Ok(());
        };

        let base = self.snapshots.base(step.base, dataset)?;
        let errors_before = self.errors;

        self.log(&format!(
            "# {} ---------------------------------------------------------------------------",
            step.id
        ));
        self.log(&format!(
            "# Testing tag {tag} with synch={}, target since={target} - expecting ret={} action={} (snapshot sha256 {})",
            sync.as_str(),
            step.expect_success,
            step.action.as_str(),
            &base.sha256[..16],
        ));

        let primary_tool = match self.config.mode {
            TestMode::V2 => ToolVersion::V2,
            TestMode::V1 | TestMode::Compare => ToolVersion::V1,
        };
        let primary = self.attempt(tag, sync, dataset, step, target, primary_tool, &base)?;
        let mut detail = primary.detail.clone();

        if primary.ok && step.verify_against_snapshot {
            self.verify_snapshot_copy(tag, dataset, &base)?;
        }

        if self.config.mode == TestMode::Compare && primary.ok && self.errors == errors_before {
            let sibling = format!("{tag}_v2");
            let second =
                self.attempt(&sibling, sync, dataset, step, target, ToolVersion::V2, &base)?;
            if second.ok {
                if primary.inserted != second.inserted {
                    self.log_error(&format!(
                        "last inserted since v1={:?} differs from last inserted since v2={:?}",
                        primary.inserted, second.inserted
                    ));
                }
                self.diff_sibling_tags(tag, &sibling)?;
            }
            detail = format!("{detail}; v2: {}", second.detail);
        }

        if let (ExpectedAction::Synchronize, Some(observed)) = (step.action, primary.inserted) {
            self.fcsr = Some(observed);
        }

        let passed = self.errors == errors_before;
        self.records.push(StepRecord {
            id: step.id,
            tag: tag.to_owned(),
            sync: sync.as_str().to_owned(),
            target_since: Some(target),
            expected_success: step.expect_success,
            action: step.action.as_str().to_owned(),
            passed,
            skipped: false,
            inserted_since: primary.inserted,
            detail,
            duration_ms: u64::try_from(step_started.elapsed().as_millis()).unwrap_or(u64::MAX),
        });

        if self.errors > 0 {
            self.log(&format!("##### Workflow {} FAILED!", step.id));
            return Err(HarnessError::WorkflowFailed {
                step: step.id,
                errors: self.errors,
            });
        }
        Ok(())
    }

    /// Remove the phase tag (and its `_v2` sibling in comparison mode).
    ///
    /// # Errors
    ///
    /// Returns `HarnessError::Sqlite` on delete failure.
    pub fn clean_up(&mut self, tag: &str) -> HarnessResult<()> {
        self.db.remove_tag(tag)?;
        if self.config.mode == TestMode::Compare {
            self.db.remove_tag(&format!("{tag}_v2"))?;
        }
        Ok(())
    }

    /// Consume the driver and assemble the run report.
    #[must_use]
    pub fn into_report(self, timetype: TimeType) -> ValidationReport {
        ValidationReport::new(
            format!("run-{}", self.started_unix_ms),
            timetype.as_str(),
            self.config.mode.as_str(),
            self.started_unix_ms,
            u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX),
            self.errors,
            self.records,
        )
    }

    /// Stage the working files, run one upload, and check the stored state
    /// against the step's expectation.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &mut self,
        dest_tag: &str,
        sync: SyncMode,
        dataset: &InputDataset,
        step: &Step,
        target: i64,
        tool: ToolVersion,
        base: &BaseSnapshot,
    ) -> HarnessResult<AttemptOutcome> {
        self.upload_seq += 1;
        let stem = stage_for_upload(base, &self.config.workdir, dest_tag)?;
        let user_text = format!(
            "Testing conditions upload with synch:{} - Upload #{}",
            sync.as_str(),
            self.upload_seq
        );
        UploadMetadata::new(
            &self.config.settings.destination_database,
            dataset.input_tag,
            dest_tag,
            target,
            &user_text,
        )
        .write(&stem.with_extension("json"))?;

        let request = UploadRequest {
            tool,
            dest_tag: dest_tag.to_owned(),
            stem: stem.clone(),
            since: target,
        };

        let before_ms = self.window_start();
        let upload = self.uploader.upload(&request);
        remove_staged(&stem);
        let upload = upload?;

        let outcome = self.check_outcome(dest_tag, sync, step, target, upload.succeeded, before_ms)?;
        self.clock_floor = Some(unix_ms());
        Ok(outcome)
    }

    /// Start of the observation window for the next upload: strictly after
    /// every millisecond in which an earlier attempt may have written rows.
    fn window_start(&self) -> i64 {
        let mut now = unix_ms();
        while self.clock_floor.is_some_and(|floor| now <= floor) {
            std::thread::sleep(std::time::Duration::from_millis(1));
            now = unix_ms();
        }
        now
    }

    /// Compare the upload tool's claimed result and the observed row against
    /// the expectation.
    fn check_outcome(
        &mut self,
        dest_tag: &str,
        sync: SyncMode,
        step: &Step,
        target: i64,
        succeeded: bool,
        before_ms: i64,
    ) -> HarnessResult<AttemptOutcome> {
        if succeeded != step.expect_success {
            let detail = format!(
                "the return value for the upload of tag {dest_tag} with synch {} was {succeeded}, while the expected result is {}",
                sync.as_str(),
                step.expect_success
            );
            self.log_error(&detail);
            return Ok(AttemptOutcome {
                ok: false,
                inserted: None,
                detail,
            });
        }

        let Some(row) = self.db.last_inserted_since(dest_tag, before_ms)? else {
            return Ok(if step.action == ExpectedAction::Fail {
                self.log("# OK: expected action=FAIL");
                AttemptOutcome {
                    ok: true,
                    inserted: None,
                    detail: "upload rejected and nothing stored".to_owned(),
                }
            } else {
                let detail = format!(
                    "nothing inserted by the last upload - expected action: {}",
                    step.action.as_str()
                );
                self.log_error(&detail);
                AttemptOutcome {
                    ok: false,
                    inserted: None,
                    detail,
                }
            });
        };

        if !succeeded {
            // Rows written by a rejected upload only count against the
            // expectation when success was expected.
            warn!(
                tag = dest_tag,
                since = row.since,
                "row inserted alongside a failed upload"
            );
            self.log(&format!(
                "found new inserted since: {} timestamp: {}",
                row.since, row.insertion_time_ms
            ));
            return Ok(if step.action == ExpectedAction::Fail {
                self.log("# OK: upload failed as expected.");
                AttemptOutcome {
                    ok: true,
                    inserted: None,
                    detail: "upload failed as expected".to_owned(),
                }
            } else {
                let detail = format!("upload failed; expected value: {target}");
                self.log_error(&detail);
                AttemptOutcome {
                    ok: false,
                    inserted: None,
                    detail,
                }
            });
        }

        match step.action {
            ExpectedAction::Create | ExpectedAction::Insert | ExpectedAction::Append => {
                if row.since == target {
                    self.log(&format!(
                        "# OK: found expected value for last since inserted: {} timestamp: {}",
                        row.since, row.insertion_time_ms
                    ));
                    if step.action == ExpectedAction::Create {
                        self.db.set_synchronization(dest_tag, sync.as_str())?;
                    }
                    Ok(AttemptOutcome {
                        ok: true,
                        inserted: Some(row.since),
                        detail: "inserted expected since".to_owned(),
                    })
                } else {
                    let detail = format!(
                        "the since inserted is {}, expected value is {target} - expected action: {}",
                        row.since,
                        step.action.as_str()
                    );
                    self.log_error(&detail);
                    Ok(AttemptOutcome {
                        ok: false,
                        inserted: Some(row.since),
                        detail,
                    })
                }
            }
            ExpectedAction::Synchronize => {
                if row.since == target {
                    let detail = format!(
                        "the since inserted {} has not been synchronized with the FCSR",
                        row.since
                    );
                    self.log_error(&detail);
                    Ok(AttemptOutcome {
                        ok: false,
                        inserted: Some(row.since),
                        detail,
                    })
                } else {
                    self.log(&format!(
                        "# OK: found synchronized value for the last since inserted: {} timestamp: {}",
                        row.since, row.insertion_time_ms
                    ));
                    Ok(AttemptOutcome {
                        ok: true,
                        inserted: Some(row.since),
                        detail: "synchronized to the watermark".to_owned(),
                    })
                }
            }
            ExpectedAction::Fail => {
                let detail = format!(
                    "found an inserted since {} - expected action: FAIL",
                    row.since
                );
                self.log_error(&detail);
                Ok(AttemptOutcome {
                    ok: false,
                    inserted: Some(row.since),
                    detail,
                })
            }
        }
    }

    /// Check that the freshly created tag is a faithful copy of the source
    /// tag inside the base snapshot.
    fn verify_snapshot_copy(
        &mut self,
        tag: &str,
        dataset: &InputDataset,
        base: &BaseSnapshot,
    ) -> HarnessResult<()> {
        let imported = self.db.iovs(tag)?;
        let source = CondDb::iovs_in_snapshot(&base.path, dataset.input_tag)?;
        let cmp = compare_iovs(&imported, &source);
        if cmp.is_match() {
            self.log("# OK: imported tag is a faithful copy of the source tag.");
        } else {
            for line in cmp.describe() {
                self.log(&format!("  {line}"));
            }
            self.log_error("imported tag is not a faithful copy of the source tag");
        }
        Ok(())
    }

    /// Row-by-row diff of the primary tag and its `_v2` sibling.
    fn diff_sibling_tags(&mut self, tag: &str, sibling: &str) -> HarnessResult<()> {
        let iov_cmp = compare_iovs(&self.db.iovs(tag)?, &self.db.iovs(sibling)?);
        if iov_cmp.is_match() {
            self.log("# OK: v1 tag and v2 tag contents are equal.");
        } else {
            for line in iov_cmp.describe() {
                self.log(&format!("  {line}"));
            }
            self.log_error("v1 tag and v2 tag contents differ");
        }

        let meta_cmp =
            compare_metadata(&self.db.tag_metadata(tag)?, &self.db.tag_metadata(sibling)?);
        if meta_cmp.is_match() {
            self.log("# OK: v1 tag metadata and v2 tag metadata are equal.");
        } else {
            for line in meta_cmp.describe() {
                self.log(&format!("  {line}"));
            }
            self.log_error("v1 tag metadata and v2 tag metadata differ");
        }
        Ok(())
    }

    fn log(&self, message: &str) {
        info!("{message}");
        if let Err(e) = append_log_line(&self.config.log_file, message) {
            warn!("could not write run log: {e}");
        }
    }

    fn log_error(&mut self, message: &str) {
        self.log(&format!("ERROR: {message}"));
        self.errors += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CONDITIONS_SCHEMA;
    use crate::scenario::{BaseFile, SinceSpec};
    use crate::uploader::UploadOutcome;

    /// Upload service that claims success but never touches the store.
    struct InertService;

    impl UploadService for InertService {
        fn upload(&mut self, _request: &UploadRequest) -> HarnessResult<UploadOutcome> {
            Ok(UploadOutcome {
                succeeded: true,
                raw_output: "upload ended with code: 0".to_owned(),
            })
        }
    }

    /// Provider handing out one pre-made snapshot file for every kind.
    struct FixedSnapshot(BaseSnapshot);

    impl SnapshotProvider for FixedSnapshot {
        fn base(
            &mut self,
            _kind: BaseFile,
            _dataset: &InputDataset,
        ) -> HarnessResult<BaseSnapshot> {
            Ok(self.0.clone())
        }
    }

    fn scratch_driver(dir: &std::path::Path) -> ValidationDriver<InertService, FixedSnapshot> {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(CONDITIONS_SCHEMA).unwrap();
        let db = CondDb::from_connection(conn);

        let base_path = dir.join("base.db");
        std::fs::write(&base_path, b"snapshot").unwrap();
        let base = BaseSnapshot::from_file(base_path).unwrap();

        ValidationDriver::new(
            db,
            InertService,
            FixedSnapshot(base),
            DriverConfig {
                settings: ServiceSettings::default(),
                mode: TestMode::V1,
                workdir: dir.to_path_buf(),
                log_file: dir.join("run.log"),
            },
        )
    }

    #[test]
    fn silent_service_fails_a_create_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = scratch_driver(dir.path());
        let dataset = TimeType::Run.dataset();
        let step = Step {
            id: 1,
            base: BaseFile::Primary,
            since: SinceSpec::Absolute(dataset.start_since),
            expect_success: true,
            action: ExpectedAction::Create,
            verify_against_snapshot: false,
        };

        let err = driver
            .run_step("tag_any", SyncMode::Any, &dataset, &step)
            .unwrap_err();
        assert!(matches!(
            err,
            HarnessError::WorkflowFailed { step: 1, errors: 1 }
        ));
        assert_eq!(driver.errors(), 1);

        let log = std::fs::read_to_string(dir.path().join("run.log")).unwrap();
        assert!(log.contains("ERROR: nothing inserted by the last upload"));
        assert!(log.contains("##### Workflow 1 FAILED!"));
    }

    #[test]
    fn watermark_relative_step_is_skipped_without_fcsr() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = scratch_driver(dir.path());
        let dataset = TimeType::Run.dataset();
        let step = Step {
            id: 17,
            base: BaseFile::Primary,
            since: SinceSpec::FcsrPlus(200),
            expect_success: true,
            action: ExpectedAction::Append,
            verify_against_snapshot: false,
        };

        driver
            .run_step("tag_hlt", SyncMode::Hlt, &dataset, &step)
            .unwrap();
        assert_eq!(driver.errors(), 0);

        let report = driver.into_report(TimeType::Run);
        assert_eq!(report.summary.skipped, 1);
        assert_eq!(report.steps[0].id, 17);
        assert!(report.steps[0].skipped);
    }

    #[test]
    fn staged_files_are_removed_after_a_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut driver = scratch_driver(dir.path());
        let dataset = TimeType::Run.dataset();
        let step = Step {
            id: 2,
            base: BaseFile::Secondary,
            since: SinceSpec::Absolute(dataset.start_since),
            expect_success: false,
            action: ExpectedAction::Fail,
            verify_against_snapshot: false,
        };

        // The inert service claims success, so the fail expectation is
        // violated and the step errors out; staging must be gone regardless.
        let _ = driver.run_step("tag_any", SyncMode::Any, &dataset, &step);
        assert!(!dir.path().join("tag_any.db").exists());
        assert!(!dir.path().join("tag_any.json").exists());
    }
}
