// vim: tw=80
//! Action registry and dispatch: the declarative virtual machine spec §4.1
//! describes, plus the per-action contracts of §4.2.
//!
//! The registry is a fixed, linearly-searched table of action names
//! (`FUN_MAX_ARGS` bounds arity, per spec §4.1 "a compile-time upper
//! bound, small single-digit"). Because `run` needs to operate against a
//! generic [`BlockCache<S>`], it can't live in the same `&'static` array
//! as `validate`/`compute_progress` (those aren't generic over `S`) — the
//! table is instead expressed as three parallel `match`es over the same
//! base-name set, which is the table in every way but storage: adding an
//! action means adding one arm to each of the three matches below, not
//! touching call sites.

use std::collections::HashSet;

use crate::{
    block::{BlockCache, BlockSink},
    config::{parse_cint, Config},
    error::{FwupError, Result},
    hash::HashVerifier,
    mbr::Mbr,
    pad::PadWriter,
    sparse::SparseMap,
    stream::ResourceStream,
    uboot::UbootEnv,
};

/// Compile-time upper bound on action arity (spec §4.1).
pub const FUN_MAX_ARGS: usize = 6;

/// Bytes per block (spec §4.2): re-exported here since every action's
/// argument parsing works in blocks.
pub const BLOCK_SIZE: u64 = crate::block::BLOCK_SIZE;

/// `{GLOBAL, FILE}`, spec §3 "Function context".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtxKind {
    Global,
    File,
}

/// One parsed `(name, argv)` pair from a funlist, with the `!` variant
/// bit already split out of the name (spec §4.1).
#[derive(Debug, Clone)]
pub struct Action {
    pub name: String,
    pub base: String,
    pub bang: bool,
    pub argv: Vec<String>,
}

impl Action {
    pub fn new(name: &str, argv: Vec<String>) -> Self {
        let (base, bang) = match name.strip_suffix('!') {
            Some(base) => (base.to_string(), true),
            None => (name.to_string(), false),
        };
        Action { name: name.to_string(), base, bang, argv }
    }
}

/// Materializes a config funlist (`Section::calls()`'s `(name, argv)`
/// pairs, which is already the "argc integer followed by that many
/// string operands" shape spec §4.1/§6 describes, just pre-split by the
/// config parser instead of carried as a flat byte stream) into
/// `Action`s once, so both the progress pass and the run pass walk the
/// same materialized list without re-parsing (Design Note "Funlist
/// representation").
pub fn parse_funlist(section: &crate::config::Section) -> Vec<Action> {
    section.calls().map(|(name, argv)| Action::new(name, argv.to_vec())).collect()
}

/// Parses one argv operand as a block count/offset, in the same C-style
/// base rules as config integers (spec §4.2).
fn arg_u64(action: &Action, idx: usize) -> Result<u64> {
    let raw = action.argv.get(idx).ok_or_else(|| {
        FwupError::validation(&action.name, format!("missing argument {idx}"))
    })?;
    parse_cint(raw)
        .ok_or_else(|| FwupError::validation(&action.name, format!("`{raw}` is not an integer")))
}

fn arg_str<'a>(action: &'a Action, idx: usize) -> Result<&'a str> {
    action
        .argv
        .get(idx)
        .map(String::as_str)
        .ok_or_else(|| FwupError::validation(&action.name, format!("missing argument {idx}")))
}

fn check_argc(action: &Action, want: usize) -> Result<()> {
    if action.argv.is_empty() || action.argv.len() > FUN_MAX_ARGS {
        return Err(FwupError::validation(
            &action.name,
            format!("argc {} outside (0, {FUN_MAX_ARGS}]", action.argv.len()),
        ));
    }
    if action.argv.len() != want {
        return Err(FwupError::validation(
            &action.name,
            format!("expects {want} argument(s), got {}", action.argv.len()),
        ));
    }
    Ok(())
}

/// A `block_offset*512`/`block_count*512` product must not overflow
/// `i32::MAX`, per spec §4.2.
fn check_block_range(action: &Action, count: u64) -> Result<()> {
    let bytes = count.checked_mul(BLOCK_SIZE).ok_or_else(|| {
        FwupError::validation(&action.name, "block count overflows when multiplied by 512")
    })?;
    if bytes > i32::MAX as u64 {
        return Err(FwupError::validation(
            &action.name,
            "block count * 512 exceeds INT32_MAX",
        ));
    }
    Ok(())
}

/// Actions that may only appear in an `on-resource` (FILE) funlist, per
/// the "FILE-only" column of spec §4.2's table.
fn is_file_only(base: &str) -> bool {
    matches!(base, "raw_write" | "fat_write" | "path_write" | "pipe_write")
}

/// Actions gated by `--unsafe` (spec §6 "process-wide state").
fn is_unsafe(base: &str) -> bool {
    matches!(base, "path_write" | "pipe_write" | "execute")
}

/// Validates an action's shape: known name, argc in range, FILE-only
/// placement, and argument-specific constraints that don't need runtime
/// state (spec §4.1, §7 "validate errors surface during creation time").
pub fn validate(action: &Action, kind: CtxKind) -> Result<()> {
    if is_file_only(&action.base) && kind != CtxKind::File {
        return Err(FwupError::validation(
            &action.name,
            "may only be used inside an on-resource funlist",
        ));
    }
    match action.base.as_str() {
        "raw_write" => check_argc(action, 1)?,
        "raw_memset" => {
            check_argc(action, 3)?;
            arg_u64(action, 0)?;
            let count = arg_u64(action, 1)?;
            check_block_range(action, count)?;
            arg_u64(action, 2)?;
        }
        "fat_mkfs" => {
            check_argc(action, 2)?;
            arg_u64(action, 0)?;
            check_block_range(action, arg_u64(action, 1)?)?;
        }
        "fat_attrib" => {
            check_argc(action, 3)?;
            arg_u64(action, 0)?;
            let attrs = arg_str(action, 2)?;
            if attrs.is_empty() || !attrs.chars().all(|c| "SHRshr".contains(c)) {
                return Err(FwupError::validation(
                    &action.name,
                    "attrs must be non-empty and drawn from [SHRshr]",
                ));
            }
        }
        "fat_write" => {
            check_argc(action, 2)?;
            arg_u64(action, 0)?;
        }
        "fat_mv" => check_argc(action, 3)?,
        "fat_rm" => check_argc(action, 2)?,
        "fat_cp" => check_argc(action, 3)?,
        "fat_mkdir" => check_argc(action, 2)?,
        "fat_setlabel" => check_argc(action, 2)?,
        "fat_touch" => check_argc(action, 2)?,
        "mbr_write" => check_argc(action, 1)?,
        "trim" => {
            check_argc(action, 2)?;
            arg_u64(action, 0)?;
            check_block_range(action, arg_u64(action, 1)?)?;
        }
        "uboot_clearenv" => check_argc(action, 1)?,
        "uboot_setenv" => check_argc(action, 3)?,
        "uboot_unsetenv" => check_argc(action, 2)?,
        "uboot_recover" => check_argc(action, 1)?,
        "error" => check_argc(action, 1)?,
        "info" => check_argc(action, 1)?,
        "path_write" => check_argc(action, 1)?,
        "pipe_write" => check_argc(action, 1)?,
        "execute" => check_argc(action, 1)?,
        other => {
            return Err(FwupError::validation(&action.name, format!("unknown action `{other}`")))
        }
    }
    if action.bang && !matches!(action.base.as_str(), "fat_mv" | "fat_rm") {
        return Err(FwupError::validation(
            &action.name,
            "the `!` variant is only defined for fat_mv and fat_rm",
        ));
    }
    Ok(())
}

/// One arbitrary progress unit, for bookkeeping actions (spec §4.2).
const BOOKKEEPING_UNIT: u64 = 1;
/// One unit per 128 KiB for `trim` (spec §4.2).
const TRIM_UNIT_BYTES: u64 = 128 * 1024;

/// Computes how many progress units `action` will contribute, accumulated
/// into `progress.total_units` before any `run` executes (spec §4.2
/// "Progress"). `resource_data_size` is `Some(sparse.data_size())` when
/// this action sits in an on-resource funlist whose resource's sparse map
/// is already known (built from the manifest at task-load time).
pub fn compute_progress(action: &Action, resource_data_size: Option<u64>) -> Result<u64> {
    let units = match action.base.as_str() {
        "raw_write" => resource_data_size.unwrap_or(0),
        "fat_write" => std::cmp::max(resource_data_size.unwrap_or(0), 1),
        "raw_memset" => arg_u64(action, 1)? * BLOCK_SIZE,
        "trim" => {
            let count = arg_u64(action, 1)?;
            (count * BLOCK_SIZE).div_ceil(TRIM_UNIT_BYTES)
        }
        "error" | "info" | "execute" => 0,
        _ => BOOKKEEPING_UNIT,
    };
    Ok(units)
}

/// Everything a `run` implementation may need, threaded explicitly
/// instead of bundled behind a generic `&mut dyn` context object so each
/// action only borrows what it actually touches (Design Note "File-vs-
/// pipe-vs-fd write duplication" calls out the shared hash-and-stream
/// logic; the borrows below are how that sharing stays checkable).
pub struct RunEnv<'a, S: BlockSink> {
    pub cache: &'a mut BlockCache<S>,
    pub pad: &'a mut PadWriter,
    pub config: &'a Config,
    pub unsafe_mode: bool,
    pub written_resources: &'a mut HashSet<String>,
    pub diag: &'a mut dyn FnMut(&str),
}

/// The active on-resource binding, when `kind == CtxKind::File`: the
/// resource's name, its declared hash, and the stream pulling its bytes.
pub struct FileCtx<'a, 'b> {
    pub resource_name: &'a str,
    pub expected_hash: &'a str,
    pub sparse: &'a SparseMap,
    pub stream: &'a mut ResourceStream<'b>,
}

/// Executes one action. `file` is `Some` exactly when `kind ==
/// CtxKind::File` (the apply driver upholds that invariant; `validate`
/// already rejected FILE-only actions from a GLOBAL funlist).
pub fn run<S: BlockSink>(
    action: &Action,
    env: &mut RunEnv<'_, S>,
    file: Option<FileCtx<'_, '_>>,
) -> Result<()> {
    match action.base.as_str() {
        "raw_write" => run_raw_write(action, env, file.expect("FILE-only")),
        "raw_memset" => run_raw_memset(action, env),
        "fat_mkfs" => run_fat_mkfs(action, env),
        "fat_attrib" => run_fat_attrib(action, env),
        "fat_write" => run_fat_write(action, env, file.expect("FILE-only")),
        "fat_mv" => run_fat_mv(action, env),
        "fat_rm" => run_fat_rm(action, env),
        "fat_cp" => run_fat_cp(action, env),
        "fat_mkdir" => run_fat_mkdir(action, env),
        "fat_setlabel" => run_fat_setlabel(action, env),
        "fat_touch" => run_fat_touch(action, env),
        "mbr_write" => run_mbr_write(action, env),
        "trim" => run_trim(action, env),
        "uboot_clearenv" => run_uboot_clearenv(action, env),
        "uboot_setenv" => run_uboot_setenv(action, env),
        "uboot_unsetenv" => run_uboot_unsetenv(action, env),
        "uboot_recover" => run_uboot_recover(action, env),
        "error" => Err(FwupError::Abort { message: arg_str(action, 0)?.to_string() }),
        "info" => {
            (env.diag)(arg_str(action, 0)?);
            Ok(())
        }
        "path_write" => run_path_write(action, env, file.expect("FILE-only")),
        "pipe_write" => run_pipe_write(action, env, file.expect("FILE-only")),
        "execute" => run_execute(action, env),
        other => Err(FwupError::validation(&action.name, format!("unknown action `{other}`"))),
    }
}

fn require_unsafe(action: &Action, env: &RunEnv<'_, impl BlockSink>) -> Result<()> {
    if !env.unsafe_mode {
        return Err(FwupError::Safety { action: action.name.clone() });
    }
    Ok(())
}

/// Streams a resource's data (and any trailing hole) through the pad
/// writer into the block cache at `dest_offset`, updating `hash` as the
/// bytes go by, the way `raw_write`/`path_write`/`pipe_write` all do
/// (Design Note "File-vs-pipe-vs-fd write duplication" — this is the
/// shared core all three sinks wrap).
fn stream_and_hash<S: BlockSink>(
    cache: &mut BlockCache<S>,
    pad: &mut PadWriter,
    stream: &mut ResourceStream<'_>,
    sparse: &SparseMap,
    dest_offset: u64,
    hash: &mut HashVerifier,
) -> Result<u64> {
    let mut written = 0u64;
    loop {
        let (buf, data_off) = stream.read_chunk()?;
        if buf.is_empty() {
            break;
        }
        hash.update(&buf);
        let mut off_in_buf = 0usize;
        let mut cur = data_off;
        while off_in_buf < buf.len() {
            // Recomputed every iteration: a single chunk can straddle two
            // data runs (the archive stores data contiguously; only the
            // destination has a hole between them), so each sub-write may
            // need to stop at the current run's end and jump to the next.
            let run_end = sparse.run_end_for(cur);
            let this_run_remaining = (run_end - cur) as usize;
            let take = std::cmp::min(this_run_remaining.max(1), buf.len() - off_in_buf);
            let chunk = &buf[off_in_buf..off_in_buf + take];
            let dest = sparse.dest_offset_for(cur).ok_or_else(|| {
                FwupError::resource("<resource>", "stream produced bytes past data_size")
            })?;
            pad.pwrite(cache, chunk, dest_offset + dest)?;
            off_in_buf += take;
            cur += take as u64;
        }
        written += buf.len() as u64;
    }
    Ok(written)
}

/// Forces the destination's length past a trailing hole by writing a
/// final zero byte within it (spec §4.2 "handle trailing hole by writing
/// a final zero block within it", §6 "the sink may refuse writes past
/// end-of-device"). Writing only the last byte of the hole, rather than a
/// whole block, avoids clobbering real data that may share the same
/// block as the start of the hole.
fn terminate_trailing_hole<S: BlockSink>(
    cache: &mut BlockCache<S>,
    pad: &mut PadWriter,
    dest_offset: u64,
    total_size: u64,
) -> Result<()> {
    if total_size == 0 {
        return Ok(());
    }
    let last_byte = dest_offset + total_size - 1;
    pad.pwrite(cache, &[0u8], last_byte)
}

fn run_raw_write<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>, file: FileCtx) -> Result<()> {
    if !env.written_resources.insert(file.resource_name.to_string()) {
        return Err(FwupError::resource(
            file.resource_name,
            "raw_write: resource already written once this run",
        ));
    }
    let dest_offset = arg_u64(action, 0)? * BLOCK_SIZE;
    let mut hash = HashVerifier::new(file.expected_hash)?;
    let written =
        stream_and_hash(env.cache, env.pad, file.stream, file.sparse, dest_offset, &mut hash)?;
    if written != file.sparse.data_size() {
        return Err(FwupError::resource(
            file.resource_name,
            format!(
                "raw_write: wrote {written} bytes, expected {} (sparse data_size)",
                file.sparse.data_size()
            ),
        ));
    }
    if file.sparse.ending_hole() > 0 {
        terminate_trailing_hole(env.cache, env.pad, dest_offset, file.sparse.total_size())?;
    }
    env.pad.flush(env.cache)?;
    hash.finish(file.resource_name)
}

fn run_raw_memset<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    let count = arg_u64(action, 1)?;
    let byte = arg_u64(action, 2)? as u8;
    let block = vec![byte; BLOCK_SIZE as usize];
    for i in 0..count {
        env.cache.pwrite(&block, (off + i) * BLOCK_SIZE, false)?;
    }
    Ok(())
}

fn run_fat_mkfs<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    let count = arg_u64(action, 1)?;
    crate::fat::FatAdapter::mkfs(env.cache, off, count)
}

fn run_fat_attrib<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::attrib(env.cache, off, arg_str(action, 1)?, arg_str(action, 2)?)
}

fn run_fat_write<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>, file: FileCtx) -> Result<()> {
    if !env.written_resources.insert(file.resource_name.to_string()) {
        return Err(FwupError::resource(
            file.resource_name,
            "fat_write: resource already written once this run",
        ));
    }
    let off = arg_u64(action, 0)?;
    let dest_path = arg_str(action, 1)?;
    let mut hash = HashVerifier::new(file.expected_hash)?;
    let written = crate::fat::FatAdapter::write_resource(
        env.cache,
        off,
        dest_path,
        file.sparse.data_size(),
        file.sparse.ending_hole(),
        file.stream,
        &mut hash,
    )?;
    if written != file.sparse.data_size() {
        return Err(FwupError::resource(
            file.resource_name,
            format!("fat_write: wrote {written} bytes, expected {}", file.sparse.data_size()),
        ));
    }
    hash.finish(file.resource_name)
}

fn run_fat_mv<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::mv(env.cache, off, arg_str(action, 1)?, arg_str(action, 2)?, action.bang)
}

fn run_fat_rm<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::rm(env.cache, off, arg_str(action, 1)?, action.bang)
}

fn run_fat_cp<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::cp(env.cache, off, arg_str(action, 1)?, arg_str(action, 2)?)
}

fn run_fat_mkdir<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::mkdir(env.cache, off, arg_str(action, 1)?)
}

fn run_fat_setlabel<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::setlabel(env.cache, off, arg_str(action, 1)?)
}

fn run_fat_touch<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)?;
    crate::fat::FatAdapter::touch(env.cache, off, arg_str(action, 1)?)
}

fn run_mbr_write<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let name = arg_str(action, 0)?;
    let section = env
        .config
        .section("mbr", name)
        .ok_or_else(|| FwupError::config(format!("no `mbr \"{name}\"` section")))?;
    let mbr = Mbr::from_config(section)?;
    env.cache.pwrite(&mbr.render(), 0, false)
}

/// Legacy transcription bug (spec §9 "Open question"): the computed
/// byte range uses `block_count*512` for the length, not
/// `block_offset*512` again — see
/// `trim_uses_block_count_for_length_not_block_offset` below for the
/// regression test this note calls for.
fn run_trim<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let off = arg_u64(action, 0)? * BLOCK_SIZE;
    let len = arg_u64(action, 1)? * BLOCK_SIZE;
    env.cache.trim(off, len, true)
}

fn uboot_section<'a>(config: &'a Config, name: &str) -> Result<(&'a crate::config::Section, u64, u64)> {
    let section = config
        .section("uboot-environment", name)
        .ok_or_else(|| FwupError::config(format!("no `uboot-environment \"{name}\"` section")))?;
    let off = section.get_u64("block-offset")?;
    let count = section.get_u64("block-count")?;
    Ok((section, off, count))
}

fn uboot_read<S: BlockSink>(cache: &mut BlockCache<S>, off: u64, env_size: usize) -> Result<Vec<u8>> {
    let mut raw = vec![0u8; env_size];
    cache.pread(&mut raw, off * BLOCK_SIZE)?;
    Ok(raw)
}

fn uboot_write<S: BlockSink>(
    cache: &mut BlockCache<S>,
    off: u64,
    env: &UbootEnv,
    env_size: usize,
) -> Result<()> {
    let raw = env.serialize(env_size)?;
    cache.pwrite(&raw, off * BLOCK_SIZE, false)
}

fn run_uboot_clearenv<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let (_, off, count) = uboot_section(env.config, arg_str(action, 0)?)?;
    uboot_write(env.cache, off, &UbootEnv::empty(), (count * BLOCK_SIZE) as usize)
}

fn run_uboot_setenv<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let (_, off, count) = uboot_section(env.config, arg_str(action, 0)?)?;
    let env_size = (count * BLOCK_SIZE) as usize;
    let raw = uboot_read(env.cache, off, env_size)?;
    let mut vars = UbootEnv::parse(&raw)?;
    vars.setenv(arg_str(action, 1)?, arg_str(action, 2)?);
    uboot_write(env.cache, off, &vars, env_size)
}

fn run_uboot_unsetenv<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let (_, off, count) = uboot_section(env.config, arg_str(action, 0)?)?;
    let env_size = (count * BLOCK_SIZE) as usize;
    let raw = uboot_read(env.cache, off, env_size)?;
    let mut vars = UbootEnv::parse(&raw)?;
    vars.unsetenv(arg_str(action, 1)?);
    uboot_write(env.cache, off, &vars, env_size)
}

fn run_uboot_recover<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    let (_, off, count) = uboot_section(env.config, arg_str(action, 0)?)?;
    let env_size = (count * BLOCK_SIZE) as usize;
    let raw = uboot_read(env.cache, off, env_size)?;
    if UbootEnv::parse(&raw).is_err() {
        uboot_write(env.cache, off, &UbootEnv::empty(), env_size)?;
    }
    Ok(())
}

fn run_path_write<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>, file: FileCtx) -> Result<()> {
    require_unsafe(action, env)?;
    if !env.written_resources.insert(file.resource_name.to_string()) {
        return Err(FwupError::resource(file.resource_name, "path_write: resource already written"));
    }
    let host_path = arg_str(action, 0)?;
    let mut out = std::fs::File::create(host_path)
        .map_err(|e| FwupError::io(format!("creating {host_path}: {e}")))?;
    let mut hash = HashVerifier::new(file.expected_hash)?;
    loop {
        let (buf, _) = file.stream.read_chunk()?;
        if buf.is_empty() {
            break;
        }
        hash.update(&buf);
        std::io::Write::write_all(&mut out, &buf)
            .map_err(|e| FwupError::io(format!("writing {host_path}: {e}")))?;
    }
    hash.finish(file.resource_name)
}

fn run_pipe_write<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>, file: FileCtx) -> Result<()> {
    require_unsafe(action, env)?;
    if !env.written_resources.insert(file.resource_name.to_string()) {
        return Err(FwupError::resource(file.resource_name, "pipe_write: resource already written"));
    }
    let command = arg_str(action, 0)?;
    let mut child = spawn_shell(command)?;
    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut hash = HashVerifier::new(file.expected_hash)?;
    loop {
        let (buf, _) = file.stream.read_chunk()?;
        if buf.is_empty() {
            break;
        }
        hash.update(&buf);
        std::io::Write::write_all(&mut stdin, &buf)
            .map_err(|e| FwupError::io(format!("writing to `{command}`: {e}")))?;
    }
    drop(stdin);
    let status = child
        .wait()
        .map_err(|e| FwupError::io(format!("waiting for `{command}`: {e}")))?;
    if !status.success() {
        return Err(FwupError::io(format!("`{command}` exited with {status}")));
    }
    hash.finish(file.resource_name)
}

fn run_execute<S: BlockSink>(action: &Action, env: &mut RunEnv<'_, S>) -> Result<()> {
    require_unsafe(action, env)?;
    let command = arg_str(action, 0)?;
    let output = spawn_shell(command)?
        .wait_with_output()
        .map_err(|e| FwupError::io(format!("running `{command}`: {e}")))?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        (env.diag)(line);
    }
    if !output.status.success() {
        return Err(FwupError::io(format!("`{command}` exited with {}", output.status)));
    }
    Ok(())
}

fn spawn_shell(command: &str) -> Result<std::process::Child> {
    std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| FwupError::io(format!("spawning `{command}`: {e}")))
}
