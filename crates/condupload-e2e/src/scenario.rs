//! The fixed validation campaign.
//!
//! This module is deliberately **pure computation** (no I/O) so the scenario
//! table can be asserted on in unit tests and rendered without a database or
//! any external tool.
//!
//! A campaign is one phase per synchronization mode.  Each phase uploads into
//! its own destination tag (`<base>_<mode>`), starting and ending with a
//! cleanup, and every step declares the upload's target insertion point, the
//! expected success flag, and the expected resulting action.

/// Input-dataset preset selected by the time representation of the IOV keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeType {
    Run,
    Lumi,
    Time,
}

impl TimeType {
    /// Parse a CLI value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "run" => Some(Self::Run),
            "lumi" => Some(Self::Lumi),
            "time" => Some(Self::Time),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Lumi => "lumi",
            Self::Time => "time",
        }
    }

    /// The preset constants for this time representation.
    #[must_use]
    pub fn dataset(self) -> InputDataset {
        match self {
            Self::Run => InputDataset {
                input_tag: "runinfo_31X_hlt",
                start_since: 200_000,
                interval: 100,
                step_large: 20,
                step_small: 10,
                second_start: 200_200,
            },
            Self::Lumi => InputDataset {
                input_tag: "BeamSpotOnlineTestLegacy",
                start_since: 1_447_562_892_541_957,
                interval: 100,
                step_large: 20,
                step_small: 10,
                second_start: 1_454_190_027_079_685,
            },
            Self::Time => InputDataset {
                input_tag: "EcalLaserAPDPNRatios_prompt_v2",
                start_since: 6_936_865_094_961_725_440,
                interval: 500_000_000_000_000,
                step_large: 20_000_000_000_000,
                step_small: 10_000_000_000_000,
                second_start: 6_937_263_354_394_181_632,
            },
        }
    }
}

/// Constants describing one input tag and the offsets the campaign uploads
/// at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputDataset {
    /// Existing production tag the snapshots are exported from.
    pub input_tag: &'static str,
    /// First insertion point the campaign targets.
    pub start_since: i64,
    /// Width of every exported since range.
    pub interval: i64,
    /// Larger in-range offset (append-then-insert pairs).
    pub step_large: i64,
    /// Smaller in-range offset.
    pub step_small: i64,
    /// Start of the second, disjoint since range.
    pub second_start: i64,
}

/// Synchronization policy a phase runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Any,
    Validation,
    Mc,
    Hlt,
    Express,
    Prompt,
    Pcl,
    Offline,
}

impl SyncMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Validation => "validation",
            Self::Mc => "mc",
            Self::Hlt => "hlt",
            Self::Express => "express",
            Self::Prompt => "prompt",
            Self::Pcl => "pcl",
            Self::Offline => "offline",
        }
    }
}

/// What the service is expected to have done after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedAction {
    /// The tag did not exist and was created with the target since.
    Create,
    /// The target since extends the tag past its last insertion point.
    Append,
    /// The target since lands at or before an existing insertion point.
    Insert,
    /// The target since was moved up to the FCSR watermark.
    Synchronize,
    /// The upload was rejected and nothing was stored.
    Fail,
}

impl ExpectedAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Append => "APPEND",
            Self::Insert => "INSERT",
            Self::Synchronize => "SYNCHRONIZE",
            Self::Fail => "FAIL",
        }
    }
}

/// Which prepared base snapshot a step uploads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseFile {
    /// The `[start, start+interval]` range.
    Primary,
    /// The disjoint `[second_start, second_start+interval]` range.
    Secondary,
    /// A re-export of the primary range, made mid-campaign.
    FreshPrimary,
    /// The `[1, interval]` range the `mc` phase uploads from.
    UnitOrigin,
}

impl BaseFile {
    /// The since range this base file is exported with.
    #[must_use]
    pub fn since_range(self, dataset: &InputDataset) -> (i64, i64) {
        match self {
            Self::Primary | Self::FreshPrimary => {
                (dataset.start_since, dataset.start_since + dataset.interval)
            }
            Self::Secondary => (
                dataset.second_start,
                dataset.second_start + dataset.interval,
            ),
            Self::UnitOrigin => (1, dataset.interval),
        }
    }
}

/// Target insertion point of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinceSpec {
    /// A fixed value.
    Absolute(i64),
    /// An offset from the FCSR watermark observed by an earlier synchronize
    /// step.  Steps with this spec are skipped while no watermark is known.
    FcsrPlus(i64),
}

impl SinceSpec {
    /// Resolve against the watermark observed so far.
    #[must_use]
    pub fn resolve(self, fcsr: Option<i64>) -> Option<i64> {
        match self {
            Self::Absolute(v) => Some(v),
            Self::FcsrPlus(offset) => fcsr.map(|f| f + offset),
        }
    }
}

/// One upload step of the campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Campaign-wide step id (stable across timetypes).
    pub id: u32,
    pub base: BaseFile,
    pub since: SinceSpec,
    /// Whether the upload tool is expected to report success.
    pub expect_success: bool,
    pub action: ExpectedAction,
    /// After the step, also verify that the destination tag is a faithful
    /// copy of the source tag inside the base snapshot.
    pub verify_against_snapshot: bool,
}

impl Step {
    const fn new(
        id: u32,
        base: BaseFile,
        since: SinceSpec,
        expect_success: bool,
        action: ExpectedAction,
    ) -> Self {
        Self {
            id,
            base,
            since,
            expect_success,
            action,
            verify_against_snapshot: false,
        }
    }
}

/// One synchronization-mode phase: a destination tag and its steps.
#[derive(Debug, Clone)]
pub struct Phase {
    pub sync: SyncMode,
    pub steps: Vec<Step>,
}

impl Phase {
    /// Destination tag for this phase.
    #[must_use]
    pub fn dest_tag(&self, base_tag: &str) -> String {
        format!("{base_tag}_{}", self.sync.as_str())
    }
}

/// Build the full campaign for a time representation.
///
/// The `hlt`/`express`/`prompt`/`pcl` phases require run- or lumi-keyed
/// tags and are omitted for [`TimeType::Time`]; step ids stay stable so a
/// given id always denotes the same expectation.
#[must_use]
pub fn phases(timetype: TimeType) -> Vec<Phase> {
    use BaseFile::{FreshPrimary, Primary, Secondary, UnitOrigin};
    use ExpectedAction::{Append, Create, Fail, Insert, Synchronize};
    use SinceSpec::{Absolute, FcsrPlus};

    let ds = timetype.dataset();
    let s0 = ds.start_since;
    let i = ds.interval;
    let a = ds.step_large;
    let b = ds.step_small;

    let mut out = Vec::new();

    let mut first = Step::new(1, Primary, Absolute(s0), true, Create);
    first.verify_against_snapshot = true;
    out.push(Phase {
        sync: SyncMode::Any,
        steps: vec![
            first,
            // The target since cannot be served from the secondary range.
            Step::new(2, Secondary, Absolute(s0), false, Fail),
            Step::new(3, Primary, Absolute(s0 + a), true, Append),
            Step::new(4, Primary, Absolute(s0 + b), true, Insert),
            Step::new(5, Primary, Absolute(s0 + a), true, Insert),
        ],
    });

    out.push(Phase {
        sync: SyncMode::Validation,
        steps: vec![
            Step::new(6, Primary, Absolute(s0), true, Create),
            Step::new(7, Primary, Absolute(s0), true, Insert),
            Step::new(8, FreshPrimary, Absolute(s0 + a), true, Append),
            Step::new(9, Primary, Absolute(s0 + b), true, Insert),
        ],
    });

    out.push(Phase {
        sync: SyncMode::Mc,
        steps: vec![
            Step::new(10, Secondary, Absolute(1), false, Fail),
            Step::new(11, UnitOrigin, Absolute(1), true, Create),
            Step::new(12, UnitOrigin, Absolute(1), false, Fail),
            Step::new(13, UnitOrigin, Absolute(200), false, Fail),
        ],
    });

    if timetype != TimeType::Time {
        for (sync, base_id) in [
            (SyncMode::Hlt, 14),
            (SyncMode::Express, 19),
            (SyncMode::Prompt, 24),
        ] {
            out.push(Phase {
                sync,
                steps: vec![
                    Step::new(base_id, Primary, Absolute(s0), true, Create),
                    Step::new(base_id + 1, Primary, Absolute(s0 + 2 * i), true, Synchronize),
                    Step::new(base_id + 2, Primary, Absolute(s0 + i), true, Synchronize),
                    Step::new(base_id + 3, Primary, FcsrPlus(2 * i), true, Append),
                    Step::new(base_id + 4, Primary, FcsrPlus(i), true, Insert),
                ],
            });
        }

        // pcl rejects pre-watermark insertions instead of moving them; its
        // watermark-relative steps reuse the one observed by the prompt phase.
        out.push(Phase {
            sync: SyncMode::Pcl,
            steps: vec![
                Step::new(29, Primary, Absolute(s0), true, Create),
                Step::new(30, Primary, Absolute(s0 + 2 * i), false, Fail),
                Step::new(31, Primary, FcsrPlus(2 * i), true, Append),
                Step::new(32, Primary, FcsrPlus(i), true, Insert),
            ],
        });
    }

    out.push(Phase {
        sync: SyncMode::Offline,
        steps: vec![
            Step::new(33, Primary, Absolute(s0), true, Create),
            Step::new(34, Primary, Absolute(s0 + 2 * i), true, Append),
            Step::new(35, Primary, Absolute(s0 + i), false, Fail),
            Step::new(36, Primary, Absolute(s0 + 2 * i), false, Fail),
            Step::new(37, Primary, Absolute(s0 + 3 * i), true, Append),
        ],
    });

    out
}
