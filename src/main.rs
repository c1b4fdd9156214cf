//! Purpose: `dockerdb-reader` CLI entry point.
//! Role: Binary crate root; parses args, opens the database, prints the JSON dump on stdout.
//! Invariants: stdout carries only the JSON document (or the missing-file message).
//! Invariants: Non-interactive errors are emitted as JSON on stderr; logs go to stderr.
//! Invariants: Process exit code is derived from `to_exit_code`.
//! Invariants: The database handle is closed exactly once; close failures are fatal.
#![allow(clippy::result_large_err)]
use std::ffi::OsString;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum, ValueHint, error::ErrorKind as ClapErrorKind};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod color_json;

use color_json::colorize_dump;
use dockerdb_reader::core::db::Db;
use dockerdb_reader::core::error::{Error, ErrorKind, to_exit_code};
use dockerdb_reader::dump::{Dump, ReadPolicy, dump_database, render};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run(std::env::args_os()) {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run<I>(args: I) -> Result<RunOutcome, (Error, ColorMode)>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Io)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                return Ok(RunOutcome::with_code(0));
            }
            ClapErrorKind::MissingRequiredArgument => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message("missing argument: the path of a database file is required")
                        .with_hint("Try `dockerdb-reader /var/lib/docker/network/files/local-kv.db`."),
                    ColorMode::Auto,
                ));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `dockerdb-reader --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    init_tracing();
    if !cli.extra.is_empty() {
        debug!(count = cli.extra.len(), "ignoring arguments after the database path");
    }
    let color_mode = cli.color;
    let policy = if cli.strict {
        ReadPolicy::Strict
    } else {
        ReadPolicy::Lenient
    };

    dump_path(&cli.path, policy, color_mode)
        .map_err(add_corrupt_hint)
        .map_err(add_io_hint)
        .map_err(add_internal_hint)
        .map_err(|err| (err, color_mode))
}

#[derive(Parser)]
#[command(
    name = "dockerdb-reader",
    version,
    about = "Dump a Docker bolt metadata database as JSON",
    long_about = None,
    after_help = r#"EXAMPLES
  $ dockerdb-reader /var/lib/docker/network/files/local-kv.db
  $ dockerdb-reader --strict /var/lib/docker/volumes/metadata.db | jq 'keys'

Each bucket becomes a JSON object mapping record keys to their values, with
leading framing bytes removed. Set RUST_LOG=debug for read diagnostics on stderr."#
)]
struct Cli {
    #[arg(help = "Path of the bolt database file", value_hint = ValueHint::FilePath)]
    path: PathBuf,
    #[arg(
        long,
        help = "Fail with an error instead of printing nothing when a read fails mid-walk"
    )]
    strict: bool,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics and JSON output: auto|always|never"
    )]
    color: ColorMode,
    /// Anything after the path is accepted and ignored.
    #[arg(hide = true)]
    extra: Vec<OsString>,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn dump_path(path: &Path, policy: ReadPolicy, color_mode: ColorMode) -> Result<RunOutcome, Error> {
    // Checked up front so a missing path is reported, never created.
    if std::fs::metadata(path).is_err_and(|err| err.kind() == io::ErrorKind::NotFound) {
        println!("stat {}: no such file or directory", path.display());
        return Ok(RunOutcome::ok());
    }

    let db = Db::open(path)?;
    let dumped = dump_database(&db, policy);
    let emitted = match &dumped {
        Ok(dump) => emit_dump(dump.as_ref(), color_mode),
        Err(_) => Ok(()),
    };
    let closed = db.close();

    dumped?;
    emitted?;
    closed?;
    Ok(RunOutcome::ok())
}

fn emit_dump(dump: Option<&Dump>, color_mode: ColorMode) -> Result<(), Error> {
    let mut stdout = io::stdout().lock();
    let use_color = color_mode.use_color(stdout.is_terminal());
    let text = match dump {
        Some(dump) if use_color => colorize_dump(dump, true),
        _ => render(dump)?,
    };
    if text.is_empty() {
        debug!("no document to emit");
        return Ok(());
    }
    stdout
        .write_all(text.as_bytes())
        .and_then(|_| stdout.flush())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write output")
                .with_source(err)
        })
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let value = error_json(err);
    let json = serde_json::to_string(&value).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Corrupt => "corrupt data".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(page) = err.page() {
        inner.insert("page".to_string(), json!(page));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = Vec::new();
    lines.push(format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    ));

    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    if let Some(path) = err.path() {
        lines.push(format!(
            "{} {}",
            colorize_label("path:", use_color, AnsiColor::Yellow),
            path.display()
        ));
    }
    if let Some(page) = err.page() {
        lines.push(format!(
            "{} {page}",
            colorize_label("page:", use_color, AnsiColor::Yellow)
        ));
    }

    let causes = error_causes(err);
    if let Some(cause) = causes.first() {
        lines.push(format!(
            "{} {cause}",
            colorize_label("caused by:", use_color, AnsiColor::Yellow)
        ));
    }

    lines.join("\n")
}

fn add_io_hint(err: Error) -> Error {
    if err.hint().is_some() {
        return err;
    }
    match err.kind() {
        ErrorKind::Permission => {
            err.with_hint("Permission denied. Docker's databases are usually root-owned; retry with sudo.")
        }
        ErrorKind::Busy => err.with_hint(
            "Another process holds the database lock (is dockerd running?). Stop it or inspect a copy of the file.",
        ),
        ErrorKind::Io => err.with_hint("I/O error. Check the path and filesystem."),
        _ => err,
    }
}

fn add_corrupt_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Corrupt || err.hint().is_some() {
        return err;
    }
    err.with_hint("The file is not a bolt database or is damaged.")
}

fn add_internal_hint(err: Error) -> Error {
    if err.kind() != ErrorKind::Internal || err.hint().is_some() {
        return err;
    }
    err.with_hint(
        "Unexpected internal failure. Retry with RUST_BACKTRACE=1 and share command/context if it persists.",
    )
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

#[cfg(test)]
mod tests {
    use super::{ColorMode, add_corrupt_hint, add_io_hint, error_json, error_text, run};
    use dockerdb_reader::core::error::{Error, ErrorKind};
    use dockerdb_reader::core::fixture::FixtureBuilder;
    use std::ffi::OsString;

    fn args(list: &[&str]) -> Vec<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn missing_path_is_a_usage_error() {
        let (err, _) = run(args(&["dockerdb-reader"])).err().expect("usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.message().unwrap().contains("missing argument"));
    }

    #[test]
    fn unknown_flag_is_a_usage_error() {
        let (err, _) = run(args(&["dockerdb-reader", "--bogus", "x.db"]))
            .err()
            .expect("usage error");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(err.hint().unwrap().contains("--help"));
    }

    #[test]
    fn arguments_after_the_path_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("local-kv.db");
        FixtureBuilder::new()
            .bucket("config", [("version", "v1.0")])
            .write(&path)
            .expect("write");
        let path = path.to_str().expect("utf-8 path");

        let outcome = run(args(&["dockerdb-reader", path, "extra", "more"]))
            .map_err(|(err, _)| err)
            .expect("dump");
        assert_eq!(outcome.exit_code, 0);
        let outcome = run(args(&["dockerdb-reader", "--color", "never", path, "extra"]))
            .map_err(|(err, _)| err)
            .expect("dump");
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn hints_attach_by_kind() {
        let busy = add_io_hint(Error::new(ErrorKind::Busy));
        assert!(busy.hint().unwrap().contains("dockerd"));
        let corrupt = add_corrupt_hint(Error::new(ErrorKind::Corrupt));
        assert!(corrupt.hint().unwrap().contains("bolt"));
        let kept = add_io_hint(Error::new(ErrorKind::Io).with_hint("custom"));
        assert_eq!(kept.hint(), Some("custom"));
    }

    #[test]
    fn error_json_carries_context() {
        let err = Error::new(ErrorKind::Corrupt)
            .with_message("checksum error")
            .with_path("/tmp/local-kv.db")
            .with_page(3)
            .with_source(std::io::Error::other("boom"));
        let value = error_json(&err);
        let inner = &value["error"];
        assert_eq!(inner["kind"], "Corrupt");
        assert_eq!(inner["message"], "checksum error");
        assert_eq!(inner["path"], "/tmp/local-kv.db");
        assert_eq!(inner["page"], 3);
        assert_eq!(inner["causes"][0], "boom");
    }

    #[test]
    fn error_text_is_plain_without_color() {
        let err = Error::new(ErrorKind::Busy)
            .with_message("database is locked")
            .with_hint("stop dockerd");
        let text = error_text(&err, false);
        assert_eq!(text, "error: database is locked\nhint: stop dockerd");
        assert!(!text.contains('\u{1b}'));
        assert!(!ColorMode::Never.use_color(true));
    }
}
