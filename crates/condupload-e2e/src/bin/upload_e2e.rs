//! Campaign runner for the conditions upload service.
//!
//! # Subcommands
//!
//! - `run` — Execute the validation campaign against a conditions store.
//! - `report` — Re-render `report.md` from a previous run's `results.json`.

use std::ffi::OsString;
use std::io::{self, Write as _};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use condupload_e2e::db::CondDb;
use condupload_e2e::driver::{DriverConfig, ValidationDriver};
use condupload_e2e::netrc;
use condupload_e2e::query_tool::{QueryTool, QueryToolConfig};
use condupload_e2e::scenario::TimeType;
use condupload_e2e::snapshot::ToolSnapshotProvider;
use condupload_e2e::uploader::{ProcessUploader, UploadToolConfig};
use condupload_e2e::{ServiceSettings, TestMode};

fn main() {
    let exit_code = run_cli(std::env::args_os());
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run_cli<I>(os_args: I) -> i32
where
    I: IntoIterator<Item = OsString>,
{
    let raw: Vec<String> = os_args
        .into_iter()
        .map(|a| a.to_string_lossy().into_owned())
        .collect();

    let tail = if raw.len() > 1 { &raw[1..] } else { &[] };

    if tail.is_empty() || tail.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return if tail.is_empty() { 2 } else { 0 };
    }

    match tail[0].as_str() {
        "run" => cmd_run(&tail[1..]),
        "report" => cmd_report(&tail[1..]),
        other => {
            eprintln!("error: unknown subcommand `{other}`");
            eprintln!();
            print_help();
            2
        }
    }
}

fn print_help() {
    let text = "\
upload-e2e — Validation campaign for the conditions upload service

USAGE:
    upload-e2e <SUBCOMMAND> [OPTIONS]

SUBCOMMANDS:
    run                 Execute the validation campaign
    report              Re-render report.md from a previous results.json

RUN OPTIONS:
    --db <PATH>             Conditions store to assert against (required)
    --timetype <TYPE>       IOV time representation: run, lumi, time (default: run)
    --v2                    Exercise the successor upload tool
    --compare               Run both tools and diff the resulting tags
    --output <DIR>          Output directory for staging, logs, and reports
    --netrc <PATH>          Netrc consumed by the successor tool (default: .netrc)
    --auth <PATH>           Auth directory for the original tool (default: .)
    --server <URL>          Upload server URL for the successor tool
    --query-tool <CMD>      Conditions query CLI (default: conddb)
    --v1-command <CMD>      Original upload tool (default: uploadConditions.py)
    --v2-command <CMD>      Successor upload tool (default: uploadConditions_v2.py)
    --delay-ms <N>          Post-upload delay in milliseconds (default: 2000)
    --json                  Print results as JSON instead of markdown

REPORT OPTIONS:
    --output <DIR>          Directory holding results.json
    --json                  Print the raw results.json instead of markdown

OPTIONS:
    -h, --help              Show this help message
";
    let _ = io::stdout().write_all(text.as_bytes());
}

#[derive(Debug)]
struct RunOptions {
    db: Option<PathBuf>,
    timetype: TimeType,
    mode: TestMode,
    output: PathBuf,
    netrc: PathBuf,
    auth: PathBuf,
    server: Option<String>,
    query_tool: String,
    v1_command: String,
    v2_command: String,
    delay_ms: u64,
    json: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            db: None,
            timetype: TimeType::Run,
            mode: TestMode::V1,
            output: PathBuf::from(format!("upload-e2e-runs/{timestamp}")),
            netrc: PathBuf::from(".netrc"),
            auth: PathBuf::from("."),
            server: None,
            query_tool: "conddb".to_owned(),
            v1_command: "uploadConditions.py".to_owned(),
            v2_command: "uploadConditions_v2.py".to_owned(),
            delay_ms: 2000,
            json: false,
        }
    }
}

#[allow(clippy::too_many_lines)]
fn parse_run_options(argv: &[String]) -> Result<RunOptions, String> {
    let mut opts = RunOptions::default();
    let mut compare = false;
    let mut v2 = false;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--db" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--db requires a path argument")?;
                opts.db = Some(PathBuf::from(value));
            }
            "--timetype" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--timetype requires an argument")?;
                opts.timetype = TimeType::parse(value)
                    .ok_or_else(|| format!("invalid timetype `{value}`"))?;
            }
            "--v2" => v2 = true,
            "--compare" => compare = true,
            "--output" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--output requires a directory argument")?;
                opts.output = PathBuf::from(value);
            }
            "--netrc" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--netrc requires a path argument")?;
                opts.netrc = PathBuf::from(value);
            }
            "--auth" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--auth requires a path argument")?;
                opts.auth = PathBuf::from(value);
            }
            "--server" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--server requires a URL argument")?;
                opts.server = Some(value.clone());
            }
            "--query-tool" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--query-tool requires an argument")?;
                opts.query_tool = value.clone();
            }
            "--v1-command" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--v1-command requires an argument")?;
                opts.v1_command = value.clone();
            }
            "--v2-command" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--v2-command requires an argument")?;
                opts.v2_command = value.clone();
            }
            "--delay-ms" => {
                i += 1;
                let value = argv
                    .get(i)
                    .ok_or("--delay-ms requires an integer argument")?;
                opts.delay_ms = value
                    .parse()
                    .map_err(|_| format!("invalid integer for --delay-ms: `{value}`"))?;
            }
            "--json" => opts.json = true,
            other => return Err(format!("unknown option `{other}`")),
        }
        i += 1;
    }

    if compare && v2 {
        return Err("--v2 and --compare are mutually exclusive".to_owned());
    }
    opts.mode = if compare {
        TestMode::Compare
    } else if v2 {
        TestMode::V2
    } else {
        TestMode::V1
    };
    Ok(opts)
}

fn cmd_run(argv: &[String]) -> i32 {
    let opts = match parse_run_options(argv) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("error: {message}");
            return 2;
        }
    };
    let Some(db_path) = opts.db.clone() else {
        eprintln!("error: --db is required");
        return 2;
    };

    if let Err(e) = std::fs::create_dir_all(&opts.output) {
        eprintln!("error: could not create output dir {}: {e}", opts.output.display());
        return 1;
    }

    let mut settings = ServiceSettings::default();
    if let Some(server) = &opts.server {
        settings.server_url.clone_from(server);
    }
    settings.post_upload_delay = Duration::from_millis(opts.delay_ms);

    // The successor tool authenticates via netrc; fail before the first
    // upload rather than 37 uploads in.
    if opts.mode != TestMode::V1 {
        if let Err(e) = netrc::require_entry(&opts.netrc, &settings.netrc_machine) {
            eprintln!("error: {e}");
            return 1;
        }
    }

    let db = match CondDb::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("error: cannot open conditions store: {e}");
            return 1;
        }
    };

    let log_file = opts.output.join(&settings.log_file_name);
    let uploader = ProcessUploader::new(UploadToolConfig {
        v1_command: opts.v1_command.clone(),
        v1_auth_path: opts.auth.clone(),
        v2_command: opts.v2_command.clone(),
        server_url: settings.server_url.clone(),
        netrc: opts.netrc.clone(),
        post_upload_delay: settings.post_upload_delay,
        log_file: log_file.clone(),
    });
    let snapshots = ToolSnapshotProvider::new(
        QueryTool::new(QueryToolConfig {
            command: opts.query_tool.clone(),
        }),
        opts.output.clone(),
    );

    let mut driver = ValidationDriver::new(
        db,
        uploader,
        snapshots,
        DriverConfig {
            settings,
            mode: opts.mode,
            workdir: opts.output.clone(),
            log_file,
        },
    );

    let campaign = driver.run_campaign(opts.timetype);
    let report = driver.into_report(opts.timetype);
    if let Err(e) = report.write_files(&opts.output) {
        eprintln!("warning: could not write report files: {e}");
    }

    if opts.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("error: {e}"),
        }
    } else {
        print!("{}", report.render_markdown());
    }
    println!("Done. Errors: {}", report.summary.errors);

    match campaign {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn cmd_report(argv: &[String]) -> i32 {
    let mut output = PathBuf::from(".");
    let mut json = false;

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--output" => {
                i += 1;
                let Some(value) = argv.get(i) else {
                    eprintln!("error: --output requires a directory argument");
                    return 2;
                };
                output = PathBuf::from(value);
            }
            "--json" => json = true,
            other => {
                eprintln!("error: unknown option `{other}`");
                return 2;
            }
        }
        i += 1;
    }

    let report = match condupload_e2e::report::load_results(&output) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("error: could not load results.json from {}: {e}", output.display());
            eprintln!("hint: run a campaign first, e.g. `upload-e2e run --db conditions.db`");
            return 1;
        }
    };

    let markdown = report.render_markdown();
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("error: {e}");
                return 1;
            }
        }
    } else {
        print!("{markdown}");
    }

    if let Err(e) = std::fs::write(output.join("report.md"), &markdown) {
        eprintln!("warning: could not write report.md: {e}");
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use condupload_e2e::report::{StepRecord, ValidationReport};

    fn run_with(args: &[&str]) -> i32 {
        let os_args: Vec<OsString> = args.iter().map(OsString::from).collect();
        run_cli(os_args)
    }

    #[test]
    fn help_exits_zero() {
        assert_eq!(run_with(&["upload-e2e", "--help"]), 0);
        assert_eq!(run_with(&["upload-e2e", "-h"]), 0);
    }

    #[test]
    fn no_subcommand_exits_two() {
        assert_eq!(run_with(&["upload-e2e"]), 2);
    }

    #[test]
    fn unknown_subcommand_exits_two() {
        assert_eq!(run_with(&["upload-e2e", "frobnicate"]), 2);
    }

    #[test]
    fn run_requires_db() {
        assert_eq!(run_with(&["upload-e2e", "run"]), 2);
    }

    #[test]
    fn run_rejects_bad_timetype() {
        assert_eq!(
            run_with(&["upload-e2e", "run", "--db", "x.db", "--timetype", "hash"]),
            2
        );
    }

    #[test]
    fn run_rejects_conflicting_modes() {
        assert_eq!(
            run_with(&["upload-e2e", "run", "--db", "x.db", "--v2", "--compare"]),
            2
        );
    }

    #[test]
    fn parse_run_options_defaults() {
        let opts = parse_run_options(&[]).unwrap();
        assert_eq!(opts.timetype, TimeType::Run);
        assert_eq!(opts.mode, TestMode::V1);
        assert_eq!(opts.delay_ms, 2000);
        assert!(opts.db.is_none());
    }

    #[test]
    fn parse_run_options_modes() {
        let argv: Vec<String> = ["--db", "c.db", "--compare"]
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let opts = parse_run_options(&argv).unwrap();
        assert_eq!(opts.mode, TestMode::Compare);

        let argv: Vec<String> = ["--v2"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(parse_run_options(&argv).unwrap().mode, TestMode::V2);
    }

    #[test]
    fn report_without_results_exits_one() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().to_str().unwrap();
        assert_eq!(run_with(&["upload-e2e", "report", "--output", out]), 1);
    }

    #[test]
    fn report_renders_previous_results() {
        let dir = tempfile::tempdir().unwrap();
        let report = ValidationReport::new(
            "run-7".to_owned(),
            "run",
            "v1",
            0,
            10,
            0,
            vec![StepRecord {
                id: 1,
                tag: "t_any".to_owned(),
                sync: "any".to_owned(),
                target_since: Some(200_000),
                expected_success: true,
                action: "CREATE".to_owned(),
                passed: true,
                skipped: false,
                inserted_since: Some(200_000),
                detail: "inserted expected since".to_owned(),
                duration_ms: 3,
            }],
        );
        report.write_files(dir.path()).unwrap();

        let out = dir.path().to_str().unwrap();
        assert_eq!(run_with(&["upload-e2e", "report", "--output", out]), 0);
        let md = std::fs::read_to_string(dir.path().join("report.md")).unwrap();
        assert!(md.contains("run-7"));
    }
}
