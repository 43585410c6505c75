// vim: tw=80
//! `fwup-rs` CLI front-end: mode selection, archive/output/task wiring, and
//! framed diagnostics (spec §6, SPEC_FULL §4.11-§4.12).

mod actions;
mod archive;
mod block;
mod config;
mod create;
mod device;
mod error;
mod fat;
mod hash;
mod mbr;
mod pad;
mod progress;
mod sparse;
mod stream;
mod task;
mod uboot;

use std::{
    fs::OpenOptions,
    io::BufReader,
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use log::{error, info};

use crate::{
    block::BlockCache,
    device::FramedWriter,
    error::{FwupError, Result},
    task::ApplyOutcome,
};

/// Firmware-image assembly and application engine for embedded Linux
/// devices. Exactly one mode flag selects the operation.
#[derive(Parser, Debug)]
#[command(name = "fwup", version, about)]
struct Cli {
    /// Create an archive from `-c <config>`, writing it to `-o`/`-i`.
    #[arg(long)]
    create: bool,

    /// Apply an archive (`-i`) to the output device/file (`-o`, or `-d`
    /// if given) by running task `-t`.
    #[arg(long)]
    apply: bool,

    /// Verify that the archive applies cleanly without touching the
    /// target: runs the apply driver against an in-memory sink.
    #[arg(long)]
    verify: bool,

    /// List the resource names referenced by the archive's manifest.
    #[arg(long)]
    list: bool,

    /// Print the archive manifest's `meta-*` key/value pairs.
    #[arg(long)]
    metadata: bool,

    /// Archive path: read for apply/verify/list/metadata, written for
    /// create (unless `-o` is also given, in which case `-o` wins).
    #[arg(short = 'i', long = "input")]
    input: Option<PathBuf>,

    /// Output path: archive destination for create, target device/file
    /// for apply.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Apply target, when it differs from `-o` (e.g. a whole block
    /// device rather than a staging file).
    #[arg(short = 'd', long = "device")]
    device: Option<PathBuf>,

    /// Task name to run in apply/verify mode.
    #[arg(short = 't', long = "task")]
    task: Option<String>,

    /// Source configuration for create mode.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Frame diagnostics and progress on stderr as length-prefixed
    /// records instead of plain text (spec §6, §4.12).
    #[arg(long)]
    framed: bool,

    /// Permit `path_write`, `pipe_write`, and `execute` actions, which
    /// touch the host outside the target device (spec §6 "Process-wide
    /// state").
    #[arg(long = "unsafe")]
    unsafe_mode: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let modes = [cli.create, cli.apply, cli.verify, cli.list, cli.metadata]
        .iter()
        .filter(|b| **b)
        .count();
    if modes != 1 {
        return Err(FwupError::validation(
            "fwup",
            "exactly one of --create/--apply/--verify/--list/--metadata is required",
        ));
    }

    if cli.create {
        return run_create_mode(cli);
    }
    if cli.list {
        return run_list_mode(cli);
    }
    if cli.metadata {
        return run_metadata_mode(cli);
    }
    run_apply_mode(cli, cli.verify)
}

fn archive_path(cli: &Cli) -> Result<&PathBuf> {
    cli.input
        .as_ref()
        .or(cli.output.as_ref())
        .ok_or_else(|| FwupError::validation("fwup", "an archive path (-i) is required"))
}

fn run_create_mode(cli: &Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .as_ref()
        .ok_or_else(|| FwupError::validation("fwup", "--create requires -c <config>"))?;
    let out_path = cli
        .output
        .as_ref()
        .or(cli.input.as_ref())
        .ok_or_else(|| FwupError::validation("fwup", "--create requires -o <archive>"))?;
    let out = OpenOptions::new().write(true).create(true).truncate(true).open(out_path)?;
    create::run_create(config_path, out)?;
    info!("created archive {}", out_path.display());
    Ok(ExitCode::SUCCESS)
}

fn run_list_mode(cli: &Cli) -> Result<ExitCode> {
    let path = archive_path(cli)?;
    let file = std::fs::File::open(path)?;
    let mut reader = archive::ArchiveReader::new(BufReader::new(file));
    let (manifest, _entries) = reader.read_manifest_then_entries()?;
    let config = config::Config::parse(&manifest)?;
    for fr in config.sections("file-resource") {
        if let Some(name) = &fr.name {
            println!("{name}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_metadata_mode(cli: &Cli) -> Result<ExitCode> {
    let path = archive_path(cli)?;
    let file = std::fs::File::open(path)?;
    let mut reader = archive::ArchiveReader::new(BufReader::new(file));
    let (manifest, _entries) = reader.read_manifest_then_entries()?;
    let config = config::Config::parse(&manifest)?;
    for (key, value) in config.metadata() {
        println!("{key}=\"{value}\"");
    }
    Ok(ExitCode::SUCCESS)
}

fn run_apply_mode(cli: &Cli, verify_only: bool) -> Result<ExitCode> {
    let archive = cli
        .input
        .as_ref()
        .ok_or_else(|| FwupError::validation("fwup", "-i <archive> is required"))?;
    let task_name = cli
        .task
        .as_ref()
        .ok_or_else(|| FwupError::validation("fwup", "-t <task> is required"))?;

    let archive_file = std::fs::File::open(archive)?;
    let reader = BufReader::new(archive_file);

    let stderr = std::io::stderr();
    let mut diag = FramedWriter::new(stderr.lock(), cli.framed);
    let mut config_text = None;

    let outcome = if verify_only {
        let mut cache = BlockCache::new(block::VerifySink);
        task::run_apply(
            reader,
            &mut cache,
            &mut config_text,
            task_name,
            cli.unsafe_mode,
            |msg| diag.message(msg),
            |pct| diag.progress(pct),
        )?
    } else {
        let target = cli
            .device
            .as_ref()
            .or(cli.output.as_ref())
            .ok_or_else(|| FwupError::validation("fwup", "-o <output> or -d <device> is required"))?;
        let sink = OpenOptions::new().read(true).write(true).create(true).open(target)?;
        let mut cache = BlockCache::new(sink);
        if device::is_block_device(cache.sink_mut()).unwrap_or(false) {
            let size = device::block_device_size(cache.sink_mut())?;
            cache.set_max_size(size);
        }
        task::run_apply(
            reader,
            &mut cache,
            &mut config_text,
            task_name,
            cli.unsafe_mode,
            |msg| diag.message(msg),
            |pct| diag.progress(pct),
        )?
    };

    match outcome {
        ApplyOutcome::Completed => {
            info!("task `{task_name}` completed");
            Ok(ExitCode::SUCCESS)
        }
        ApplyOutcome::PreconditionsFailed => {
            error!("task `{task_name}` preconditions failed");
            Ok(ExitCode::from(2))
        }
    }
}
