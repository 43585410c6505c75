// vim: tw=80
//! Task/apply driver (spec §4.8): binds a task's `on-init`/`on-resource`/
//! `on-finish` funlists, walks the archive once computing progress, then
//! once more actually executing, and flushes the block cache at the end.

use std::collections::{HashMap, HashSet};

use crate::{
    actions::{self, Action, CtxKind, FileCtx, RunEnv},
    archive::{header_of, ArchiveReader},
    block::{BlockCache, BlockSink},
    config::Config,
    error::{FwupError, Result},
    hash::HashVerifier,
    mbr::Mbr,
    pad::PadWriter,
    progress::Progress,
    sparse::SparseMap,
    stream::ResourceStream,
};

/// One resource's binding within a task: the funlist that fires when its
/// archive entry is read, the progress unit precomputed for each of that
/// funlist's actions, and the manifest data needed to verify it.
struct ResourceBinding {
    actions: Vec<Action>,
    units: Vec<u64>,
    sparse: SparseMap,
    hash: String,
}

pub struct Task {
    pub name: String,
    on_init: Vec<Action>,
    on_init_units: Vec<u64>,
    on_finish: Vec<Action>,
    on_finish_units: Vec<u64>,
    resources: HashMap<String, ResourceBinding>,
    optional_resources: HashSet<String>,
    require_partition_offsets: Vec<(usize, u64)>,
}

/// Whether `run_apply` actually ran the task or stopped short because its
/// preconditions failed — exit code 2 vs. the task's own success/failure
/// (spec §6 "Exit codes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Completed,
    PreconditionsFailed,
}

impl Task {
    /// Loads and fully validates a task by name: every action in every
    /// funlist is shape-checked before any of them run (spec §7
    /// "validate errors surface during creation time").
    pub fn load(config: &Config, name: &str) -> Result<Self> {
        let section = config
            .section("task", name)
            .ok_or_else(|| FwupError::config(format!("no `task \"{name}\"` section")))?;

        let mut on_init = Vec::new();
        for child in section.children("on-init") {
            on_init.extend(actions::parse_funlist(child));
        }
        let mut on_finish = Vec::new();
        for child in section.children("on-finish") {
            on_finish.extend(actions::parse_funlist(child));
        }
        for a in on_init.iter().chain(on_finish.iter()) {
            actions::validate(a, CtxKind::Global)?;
        }
        let on_init_units =
            on_init.iter().map(|a| actions::compute_progress(a, None)).collect::<Result<_>>()?;
        let on_finish_units =
            on_finish.iter().map(|a| actions::compute_progress(a, None)).collect::<Result<_>>()?;

        let mut optional_resources = HashSet::new();
        let mut require_partition_offsets = Vec::new();
        for (call_name, argv) in section.calls() {
            match call_name {
                "on-resource-optional" => {
                    let rname = argv.first().ok_or_else(|| {
                        FwupError::config("on-resource-optional needs a resource name")
                    })?;
                    optional_resources.insert(rname.clone());
                }
                "require-partition-offset" => {
                    let idx = argv
                        .first()
                        .and_then(|s| crate::config::parse_cint(s))
                        .ok_or_else(|| {
                            FwupError::config("require-partition-offset needs a partition index")
                        })? as usize;
                    let off = argv
                        .get(1)
                        .and_then(|s| crate::config::parse_cint(s))
                        .ok_or_else(|| {
                            FwupError::config("require-partition-offset needs a block offset")
                        })?;
                    require_partition_offsets.push((idx, off));
                }
                other => {
                    return Err(FwupError::config(format!(
                        "task `{name}`: unknown predicate `{other}`"
                    )))
                }
            }
        }

        let mut resources = HashMap::new();
        for child in section.children("on-resource") {
            let rname = child
                .name
                .clone()
                .ok_or_else(|| FwupError::config("on-resource needs a resource name"))?;
            let resource_section = config.section("file-resource", &rname).ok_or_else(|| {
                FwupError::config(format!("task `{name}`: no `file-resource \"{rname}\"`"))
            })?;
            let sparse = SparseMap::from_config(resource_section)?;
            let hash = resource_section
                .get("blake2b-256")
                .ok_or_else(|| {
                    FwupError::config(format!("file-resource `{rname}` has no blake2b-256"))
                })?
                .to_string();
            // Validates the hash's shape (64 hex chars) up front rather
            // than at first use deep inside `run`.
            HashVerifier::new(&hash)?;

            let list = actions::parse_funlist(child);
            for a in &list {
                actions::validate(a, CtxKind::File)?;
            }
            let units = list
                .iter()
                .map(|a| actions::compute_progress(a, Some(sparse.data_size())))
                .collect::<Result<Vec<u64>>>()?;
            resources
                .entry(rname)
                .and_modify(|b: &mut ResourceBinding| {
                    b.actions.extend(list.clone());
                    b.units.extend(units.clone());
                })
                .or_insert(ResourceBinding { actions: list, units, sparse, hash });
        }

        Ok(Task {
            name: name.to_string(),
            on_init,
            on_init_units,
            on_finish,
            on_finish_units,
            resources,
            optional_resources,
            require_partition_offsets,
        })
    }

    /// Spec §4.8 step 1: "evaluate all require-* predicates; skip tasks
    /// that fail." `require-partition-offset(idx, offset)` reads the
    /// *existing* MBR already on the target device (if any) and requires
    /// partition `idx`'s block offset to match — the mechanism a real
    /// firmware image uses to pick between its A and B update slots.
    pub fn preconditions_hold<S: BlockSink>(&self, cache: &mut BlockCache<S>) -> Result<bool> {
        if self.require_partition_offsets.is_empty() {
            return Ok(true);
        }
        let mut raw = [0u8; 512];
        if cache.pread(&mut raw, 0).is_err() {
            return Ok(false);
        }
        for (idx, expected) in &self.require_partition_offsets {
            match Mbr::partition(&raw, *idx) {
                Ok(part) if part.block_offset as u64 == *expected => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn total_units(&self) -> u64 {
        let init: u64 = self.on_init_units.iter().sum();
        let finish: u64 = self.on_finish_units.iter().sum();
        let resources: u64 = self.resources.values().map(|b| b.units.iter().sum::<u64>()).sum();
        init + finish + resources
    }
}

/// Runs `task_name` against `output`, streaming `archive` entries through
/// whichever on-resource funlist each binds to (spec §4.8).
pub fn run_apply<S: BlockSink, R: std::io::Read>(
    archive_reader: R,
    output: &mut BlockCache<S>,
    config_text_out: &mut Option<String>,
    task_name: &str,
    unsafe_mode: bool,
    mut diag: impl FnMut(&str),
    mut progress_cb: impl FnMut(u8),
) -> Result<ApplyOutcome> {
    let mut archive = ArchiveReader::new(archive_reader);
    let (manifest_text, mut entries) = archive.read_manifest_then_entries()?;
    let config = Config::parse(&manifest_text)?;
    if let Some(slot) = config_text_out.as_mut() {
        *slot = manifest_text.clone();
    }
    let task = Task::load(&config, task_name)?;

    if !task.preconditions_hold(output)? {
        return Ok(ApplyOutcome::PreconditionsFailed);
    }

    let mut progress = Progress::new();
    progress.add_total(task.total_units());

    let mut pad = PadWriter::new();
    let mut written_resources = HashSet::new();

    for (action, units) in task.on_init.iter().zip(&task.on_init_units) {
        run_one(action, output, &mut pad, &config, unsafe_mode, &mut written_resources, &mut diag, None)?;
        progress.advance(*units, &mut progress_cb);
    }

    let mut remaining: HashSet<String> = task.resources.keys().cloned().collect();
    for entry in &mut entries {
        let mut entry = entry.map_err(|e| FwupError::io(format!("reading archive entry: {e}")))?;
        let header = header_of(&entry)?;
        let Some(binding) = task.resources.get(&header.name) else {
            continue; // unbound data entries are skipped (spec §4.8 step 4)
        };
        remaining.remove(&header.name);
        let mut stream = ResourceStream::new(&mut entry, binding.sparse.data_size());
        for (action, units) in binding.actions.iter().zip(&binding.units) {
            let file = FileCtx {
                resource_name: &header.name,
                expected_hash: &binding.hash,
                sparse: &binding.sparse,
                stream: &mut stream,
            };
            run_one(
                action,
                output,
                &mut pad,
                &config,
                unsafe_mode,
                &mut written_resources,
                &mut diag,
                Some(file),
            )?;
            progress.advance(*units, &mut progress_cb);
        }
    }

    for name in remaining {
        if !task.optional_resources.contains(&name) {
            return Err(FwupError::resource(
                &name,
                "referenced by task but missing from archive",
            ));
        }
    }

    for (action, units) in task.on_finish.iter().zip(&task.on_finish_units) {
        run_one(action, output, &mut pad, &config, unsafe_mode, &mut written_resources, &mut diag, None)?;
        progress.advance(*units, &mut progress_cb);
    }

    output.flush()?;
    Ok(ApplyOutcome::Completed)
}

#[allow(clippy::too_many_arguments)]
fn run_one<S: BlockSink>(
    action: &Action,
    cache: &mut BlockCache<S>,
    pad: &mut PadWriter,
    config: &Config,
    unsafe_mode: bool,
    written_resources: &mut HashSet<String>,
    diag: &mut impl FnMut(&str),
    file: Option<FileCtx<'_, '_>>,
) -> Result<()> {
    let mut env =
        RunEnv { cache, pad, config, unsafe_mode, written_resources, diag };
    actions::run(action, &mut env, file)
}
