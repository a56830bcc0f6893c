//! CLI binary for auraddx.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ConverterConfig`, prints results, and turns failures into the
//! documented exit codes.

use anyhow::{Context, Result};
use auraddx::error::{EXIT_CONVERSION_ERROR, EXIT_SUCCESS};
use auraddx::format::descriptors;
use auraddx::{
    ArtifactPattern, ConversionRequest, ConvertError, ConverterConfig, ErrorChannel, ErrorKind,
    FormatConverter, FormatTag, PayloadSource, ProvisionError, Sweeper, ViewerSession,
};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Convert a DDX texture to PNG next to it
  auraddx convert photo.ddx

  # Convert a batch to TGA into one directory, four at a time
  auraddx convert -f tga -o out/ textures/*.dds -c 4

  # Show a picture until Ctrl-C, then reclaim its temporary PNG
  auraddx open photo.ddx

  # Reclaim leftover artifacts in the temp root
  auraddx sweep

  # Extract the converter and print its checksum
  auraddx provision

EXIT CODES:
  0  success
  2  invalid argument (unsupported format, missing input)
  3  conversion error (converter failed or produced nothing)
  4  missing dependency (converter could not be provisioned)

ENVIRONMENT VARIABLES:
  AURADDX_TEMP_DIR   Temp root holding the converter and artifacts
  TEXCONV_PATH       Use an existing texconv in place (never written or deleted)
  AURADDX_PAYLOAD    Copy this texconv into the temp root on first use
  RUST_LOG           Override the log filter (e.g. auraddx=debug)
"#;

/// Convert DDX/DDS textures through texconv and reclaim the leftovers.
#[derive(Parser, Debug)]
#[command(
    name = "auraddx",
    version,
    about = "Convert DDX/DDS textures through texconv and reclaim the leftovers",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory holding the converter and generated artifacts.
    #[arg(long, global = true, env = "AURADDX_TEMP_DIR")]
    temp_dir: Option<PathBuf>,

    /// Existing texconv executable, used in place.
    #[arg(long, global = true, env = "TEXCONV_PATH", conflicts_with = "payload")]
    converter: Option<PathBuf>,

    /// texconv executable to copy into the temp root on first use.
    #[arg(long, global = true, env = "AURADDX_PAYLOAD")]
    payload: Option<PathBuf>,

    /// Keep a provisioned converter on exit instead of deleting it.
    #[arg(long, global = true, env = "AURADDX_KEEP_CONVERTER")]
    keep_converter: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "AURADDX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "AURADDX_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert one or more pictures.
    Convert(ConvertArgs),
    /// Delete artifacts nobody holds open.
    Sweep(SweepArgs),
    /// List the supported formats.
    Formats {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Make sure the converter is present and print its path and SHA-256.
    Provision,
    /// Show a DDX or PNG picture until Ctrl-C.
    Open {
        /// Picture to open.
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Source pictures.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory. Default: next to each input.
    #[arg(short, long, env = "AURADDX_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Target format (png, tga, dds, ...).
    #[arg(short, long, env = "AURADDX_FORMAT", default_value = "png", value_parser = parse_format)]
    format: FormatTag,

    /// Number of concurrent conversions.
    #[arg(short, long, env = "AURADDX_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Output structured JSON instead of status lines.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "AURADDX_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct SweepArgs {
    /// Directory to sweep. Default: the temp root.
    #[arg(long)]
    dir: Option<PathBuf>,

    /// File-name glob. Default: *.png.
    #[arg(long)]
    pattern: Option<String>,

    /// Output the report as JSON.
    #[arg(long)]
    json: bool,
}

fn parse_format(s: &str) -> std::result::Result<FormatTag, String> {
    let tag: FormatTag = s.parse().map_err(|e: auraddx::UnknownFormat| e.to_string())?;
    if !auraddx::format::is_supported(tag) {
        return Err(format!("{tag} can only be converted from, not to"));
    }
    Ok(tag)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.global.verbose {
        "debug"
    } else if cli.global.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", red("✘"));
            ExitCode::from(exit_code_for(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli.global, matches!(cli.command, Command::Provision))?;
    match cli.command {
        Command::Convert(args) => run_convert(config, args, cli.global.quiet).await,
        Command::Sweep(args) => run_sweep(config, args, cli.global.quiet).await,
        Command::Formats { json } => run_formats(json),
        Command::Provision => run_provision(config).await,
        Command::Open { path } => run_open(config, &path).await,
    }
}

/// Map global flags to `ConverterConfig`.
fn build_config(global: &GlobalArgs, keep_converter: bool) -> Result<ConverterConfig> {
    let mut builder = ConverterConfig::builder()
        .remove_executable_on_drop(!(keep_converter || global.keep_converter));
    if let Some(ref dir) = global.temp_dir {
        builder = builder.temp_root(dir);
    }
    if let Some(ref exe) = global.converter {
        builder = builder.payload(PayloadSource::InPlace(exe.clone()));
    } else if let Some(ref file) = global.payload {
        builder = builder.payload(PayloadSource::File(file.clone()));
    }
    builder.build().context("Invalid configuration")
}

// ── convert ──────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct JsonOutcome {
    source: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    artifact: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonError>,
}

#[derive(Serialize)]
struct JsonError {
    kind: ErrorKind,
    message: String,
}

async fn run_convert(config: ConverterConfig, args: ConvertArgs, quiet: bool) -> Result<ExitCode> {
    let events = ErrorChannel::new(config.channel_capacity);
    let converter = FormatConverter::new(Arc::new(config.provisioner()), events.clone());

    let requests: Vec<ConversionRequest> = args
        .inputs
        .iter()
        .map(|input| {
            let out = output_dir_for(input, args.output_dir.as_deref());
            ConversionRequest::new(input, out, args.format)
        })
        .collect();
    let total = requests.len();

    let bar = if !quiet && !args.json && !args.no_progress && total > 1 {
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len}  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    } else {
        ProgressBar::hidden()
    };

    // Process and postcondition failures arrive here, not through the loop below.
    let printer = {
        let bar = bar.clone();
        let show = !quiet && !args.json;
        let stream = events.stream();
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(notice) = stream.next().await {
                if show {
                    bar.suspend(|| {
                        eprintln!(
                            "  {} {}  {}",
                            red("✗"),
                            notice.source.display(),
                            red(notice.message.trim_end())
                        )
                    });
                }
            }
        })
    };

    let mut outcomes: Vec<Option<JsonOutcome>> = (0..total).map(|_| None).collect();
    let mut first_failure: Option<(usize, u8)> = None;
    let mut succeeded = 0usize;

    {
        let results = converter.convert_all(requests, args.concurrency);
        futures::pin_mut!(results);
        while let Some((idx, result)) = results.next().await {
            let source = args.inputs[idx].clone();
            let outcome = match result {
                Ok(artifact) => {
                    succeeded += 1;
                    if !quiet && !args.json {
                        bar.suspend(|| {
                            eprintln!(
                                "  {} {}  →  {}  {}",
                                green("✓"),
                                source.display(),
                                bold(&artifact.path.display().to_string()),
                                dim(&format!("{}ms", artifact.duration_ms)),
                            )
                        });
                    }
                    JsonOutcome {
                        source,
                        artifact: Some(artifact.path),
                        error: None,
                    }
                }
                Err(e) => {
                    if first_failure.map_or(true, |(i, _)| idx < i) {
                        first_failure = Some((idx, e.exit_code()));
                    }
                    if !e.kind().is_announced() && !quiet && !args.json {
                        bar.suspend(|| {
                            eprintln!("  {} {}  {}", red("✗"), source.display(), red(&e.to_string()))
                        });
                    }
                    JsonOutcome {
                        source,
                        artifact: None,
                        error: Some(JsonError {
                            kind: e.kind(),
                            message: e.to_string(),
                        }),
                    }
                }
            };
            outcomes[idx] = Some(outcome);
            bar.inc(1);
        }
    }
    bar.finish_and_clear();

    // Closing every sender ends the printer once it has drained.
    drop(converter);
    drop(events);
    printer.await.context("Failure printer panicked")?;

    if args.json {
        let outcomes: Vec<JsonOutcome> = outcomes.into_iter().flatten().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&outcomes).context("Failed to serialise results")?
        );
    } else if !quiet && total > 1 {
        let failed = total - succeeded;
        eprintln!(
            "{} {}/{} converted{}",
            if failed == 0 { green("✔") } else { cyan("⚠") },
            bold(&succeeded.to_string()),
            total,
            if failed == 0 {
                String::new()
            } else {
                format!("  ({} failed)", red(&failed.to_string()))
            }
        );
    }

    Ok(ExitCode::from(
        first_failure.map_or(EXIT_SUCCESS, |(_, code)| code),
    ))
}

/// `--output-dir` if given, else the input's own directory. A bare file
/// name has an empty parent, which means the working directory.
fn output_dir_for(input: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| {
            input
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
        })
        .unwrap_or_else(|| PathBuf::from("."))
}

// ── sweep ────────────────────────────────────────────────────────────────────

async fn run_sweep(config: ConverterConfig, args: SweepArgs, quiet: bool) -> Result<ExitCode> {
    let dir = args.dir.unwrap_or_else(|| config.temp_root.clone());
    let pattern = match args.pattern {
        Some(ref p) => ArtifactPattern::new(p).context("Invalid --pattern")?,
        None => config.artifact_pattern.clone(),
    };

    let report = Sweeper::new()
        .protect(config.executable_path())
        .sweep(&dir, &pattern)
        .await;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if !quiet {
        for p in &report.deleted {
            println!("  {} {}", green("deleted"), p.display());
        }
        for p in &report.in_use {
            println!("  {} {}", cyan("in use "), p.display());
        }
        for e in &report.failed {
            println!("  {} {}", red("failed "), e);
        }
        println!(
            "{} {} deleted, {} in use, {} failed  {}",
            if report.is_clean() { green("✔") } else { cyan("⚠") },
            report.deleted.len(),
            report.in_use.len(),
            report.failed.len(),
            dim(&format!("{} in {}", pattern, dir.display())),
        );
    }
    Ok(ExitCode::from(EXIT_SUCCESS))
}

// ── formats ──────────────────────────────────────────────────────────────────

fn run_formats(json: bool) -> Result<ExitCode> {
    if json {
        let table: Vec<_> = descriptors().collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&table).context("Failed to serialise formats")?
        );
    } else {
        println!("{:<6} {:<6} {:<7} {}", "TAG", "EXT", "SOURCE", "TARGET");
        for d in descriptors() {
            println!(
                "{:<6} {:<6} {:<7} {}",
                d.tag.to_string(),
                d.extension,
                if d.source_eligible { "yes" } else { "no" },
                if d.target_eligible { "yes" } else { "no" },
            );
        }
    }
    Ok(ExitCode::from(EXIT_SUCCESS))
}

// ── provision ────────────────────────────────────────────────────────────────

async fn run_provision(config: ConverterConfig) -> Result<ExitCode> {
    let provisioner = config.provisioner();
    let exe = tokio::task::spawn_blocking(move || provisioner.ensure_ready().cloned())
        .await
        .context("Provisioning task panicked")??;
    println!("{}  {}", exe.path.display(), dim(&exe.sha256));
    Ok(ExitCode::from(EXIT_SUCCESS))
}

// ── open ─────────────────────────────────────────────────────────────────────

async fn run_open(config: ConverterConfig, path: &Path) -> Result<ExitCode> {
    let mut session = ViewerSession::new(Arc::new(config));
    let shown = session
        .open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    println!("{}", shown.path().display());
    eprintln!("{}", dim("Holding the picture open; press Ctrl-C to close."));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let report = session.close().await;
    eprintln!(
        "{} closed, {} artifact(s) reclaimed",
        green("✔"),
        report.deleted.len()
    );
    Ok(ExitCode::from(EXIT_SUCCESS))
}

/// Exit code for a top-level failure, following the library's taxonomy.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    for cause in e.chain() {
        if let Some(ce) = cause.downcast_ref::<ConvertError>() {
            return ce.exit_code();
        }
        if cause.downcast_ref::<ProvisionError>().is_some() {
            return ErrorKind::Configuration.exit_code();
        }
    }
    EXIT_CONVERSION_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_input_converts_into_working_directory() {
        assert_eq!(output_dir_for(Path::new("photo.ddx"), None), PathBuf::from("."));
        assert_eq!(
            output_dir_for(Path::new("textures/photo.ddx"), None),
            PathBuf::from("textures")
        );
        assert_eq!(
            output_dir_for(Path::new("photo.ddx"), Some(Path::new("out"))),
            PathBuf::from("out")
        );
    }

    #[test]
    fn ddx_is_not_a_cli_target() {
        assert!(parse_format("ddx").is_err());
        assert_eq!(parse_format("TGA"), Ok(FormatTag::Tga));
    }
}
