use std::collections::{BTreeMap, BTreeSet};

use deltabak_fs::{path, Handler, ListOptions};
use futures_util::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use crate::config::CleanVmOptions;
use crate::locks::ChainLocks;
use crate::merge::{merge_chain, Chain, MergeJob, MergeOptions, MergeOutcome};
use crate::merge_state::{self, parent_of_state, MergeState};
use crate::metadata::BackupMetadata;
use crate::report::{CleanVmReport, Finding, ItemOutcome, LogFn, Reporter};
use crate::walker::{list_vhds, walk_vhds, ChainWalk, WalkOptions};
use crate::xva::{check_xva, XvaCheck};
use crate::{ChainError, Result};

/// Bookkeeping of one pass: the report being built and what was deleted so far.
struct Pass<'a> {
    handler: &'a dyn Handler,
    remove: bool,
    reporter: Reporter<'a>,
    deleted: BTreeSet<String>,
}

impl<'a> Pass<'a> {
    /// Record `finding` and delete `target` if the policy allows it.
    async fn dispose(&mut self, finding: Finding, target: &str) {
        let outcome = if self.remove {
            match self.handler.unlink_if_exists(target).await {
                Ok(_) => {
                    self.deleted.insert(target.to_string());
                    ItemOutcome::Deleted
                }
                Err(err) => ItemOutcome::Failed {
                    error: err.to_string(),
                },
            }
        } else {
            ItemOutcome::Reported
        };
        self.reporter.record(finding, outcome);
    }

    fn keep(&mut self, finding: Finding) {
        self.reporter.record(finding, ItemOutcome::Kept);
    }

    fn report(&mut self, finding: Finding) {
        self.reporter.record(finding, ItemOutcome::Reported);
    }

    fn fail(&mut self, finding: Finding, err: &ChainError) {
        self.reporter.record(
            finding,
            ItemOutcome::Failed {
                error: err.to_string(),
            },
        );
    }
}

/// Unused VHDs split into chains worth merging and files nothing depends on.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct UnusedPlan {
    /// Root to leaf, ending with a disk that must be kept.
    pub(crate) chains: Vec<Vec<String>>,
    pub(crate) delete: Vec<String>,
}

/// Where following an unused VHD down its children ends.
enum Tail {
    /// At a used disk: the walked disks are a chain ending with it.
    Used(Vec<String>),
    /// Nothing below needs the walked disks.
    Unneeded,
    /// In a branch: the walked disks are left alone.
    Branch,
}

/// Follow each unused VHD down its children until a disk that has to stay. Reaching a used
/// disk makes the walked disks a chain to merge; reaching nothing lets them all go. Anything
/// leading into a branch is neither merged nor deleted.
pub(crate) fn plan_unused(walk: &ChainWalk, unused: &BTreeSet<String>) -> UnusedPlan {
    let in_branch = |vhd: &str| walk.branched.contains(vhd) || walk.is_branch_parent(vhd);
    let mut to_check = unused.clone();
    let mut pending: BTreeMap<String, Tail> = BTreeMap::new();
    let mut plan = UnusedPlan::default();

    while let Some(start) = to_check.pop_first() {
        let mut walked: Vec<String> = Vec::new();
        let mut current = start.clone();
        let tail = loop {
            if let Some(computed) = pending.remove(&current) {
                break computed;
            }
            if in_branch(&current) {
                break Tail::Branch;
            }
            if !unused.contains(&current) {
                break Tail::Used(vec![current]);
            }
            to_check.remove(&current);
            walked.push(current.clone());
            match walk.children.get(&current) {
                Some(child) => current = child.clone(),
                None => break Tail::Unneeded,
            }
        };
        let tail = match tail {
            Tail::Used(tail) => {
                walked.extend(tail);
                Tail::Used(walked)
            }
            Tail::Unneeded => {
                plan.delete.extend(walked);
                Tail::Unneeded
            }
            Tail::Branch => {
                for vhd in &walked {
                    debug!(path = %vhd, "unused VHD leads into a branch, left alone");
                }
                Tail::Branch
            }
        };
        pending.insert(start, tail);
    }

    plan.chains = pending
        .into_values()
        .filter_map(|tail| match tail {
            Tail::Used(chain) if chain.len() >= 2 => Some(chain),
            _ => None,
        })
        .collect();
    plan.delete.sort();
    plan
}

/// Reconcile the backups of one VM.
///
/// Every artifact under `vm_dir` is classified and, as far as `options` allow, broken,
/// orphaned and unused files are deleted and unused chains merged. Per-artifact failures are
/// reported and do not stop the pass; only failing to list the directory does.
pub async fn clean_vm(
    handler: &dyn Handler,
    vm_dir: &str,
    options: &CleanVmOptions,
    locks: &ChainLocks,
    on_log: Option<&LogFn<'_>>,
) -> Result<CleanVmReport> {
    let vm_dir = path::normalize(vm_dir);
    info!(vm_dir = %vm_dir, remove = options.remove, merge = options.merge, "cleaning VM backups");
    let mut pass = Pass {
        handler,
        remove: options.remove,
        reporter: Reporter::new(on_log),
        deleted: BTreeSet::new(),
    };

    let listing = list_vhds(handler, &vm_dir).await?;
    let walk = walk_vhds(
        handler,
        &listing.vhds,
        WalkOptions {
            concurrency: options.concurrency,
            check_secondary_footer: true,
        },
    )
    .await?;
    let entries = match handler.list(&vm_dir, ListOptions::prepend_dir()).await {
        Ok(entries) => entries,
        Err(err) if err.is_not_found() => Vec::new(),
        Err(err) => return Err(err.into()),
    };
    let xvas: BTreeSet<String> = entries
        .iter()
        .filter(|entry| entry.ends_with(".xva"))
        .cloned()
        .collect();
    let checksums: Vec<&String> = entries
        .iter()
        .filter(|entry| entry.ends_with(".xva.checksum"))
        .collect();
    let metadata_files: Vec<&String> = entries
        .iter()
        .filter(|entry| entry.ends_with(".json") && !path::basename(entry).starts_with('.'))
        .collect();
    let merge_states = load_merge_states(&mut pass, &listing.merge_states).await;

    // Broken files, unless an interrupted merge explains the damage.
    for (vhd, err) in &walk.broken {
        match merge_states.get(vhd) {
            Some((_, state)) => pass.keep(Finding::PartialMerge {
                parent: vhd.clone(),
                child: state.child.clone(),
                error: err.to_string(),
            }),
            None => {
                let finding = Finding::BrokenVhd {
                    path: vhd.clone(),
                    error: err.to_string(),
                };
                pass.dispose(finding, vhd).await;
            }
        }
    }
    for (vhd, err) in &walk.unreadable {
        pass.keep(Finding::UnreadableVhd {
            path: vhd.clone(),
            error: err.to_string(),
        });
    }
    for branch in &walk.branches {
        pass.keep(Finding::MultipleChildren {
            parent: branch.parent.clone(),
            child1: branch.child1.clone(),
            child2: branch.child2.clone(),
        });
    }

    for (vhd, parent) in &walk.orphans {
        let finding = Finding::OrphanVhd {
            path: vhd.clone(),
            parent: parent.clone(),
        };
        // Children of a parent damaged mid-merge still hold the only copy of their data.
        let below_partial_merge = merge_states.contains_key(missing_ancestor(&walk, vhd));
        if walk.branched.contains(vhd) || below_partial_merge {
            pass.keep(finding);
        } else {
            pass.dispose(finding, vhd).await;
        }
    }
    let vhds = walk.usable();

    for xva in &xvas {
        match check_xva(handler, xva).await {
            Ok(XvaCheck::Invalid(reason)) => pass.report(Finding::InvalidXva {
                path: xva.clone(),
                reason: reason.to_string(),
            }),
            Ok(_) => {}
            Err(err) if err.is_not_found() => {}
            Err(err) => pass.fail(
                Finding::InvalidXva {
                    path: xva.clone(),
                    reason: "unreadable".to_string(),
                },
                &err,
            ),
        }
    }

    // Unreadable VHDs may be fine; metadata pointing at them is not considered incomplete.
    let known_vhds: BTreeSet<String> = vhds
        .iter()
        .chain(walk.unreadable.keys())
        .cloned()
        .collect();
    let mut used_vhds: BTreeSet<String> = BTreeSet::new();
    let mut used_xvas: BTreeSet<String> = BTreeSet::new();
    for json in metadata_files {
        let raw = match handler.read_file(json).await {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => continue,
            Err(err) => {
                let err = ChainError::from(err);
                let finding = Finding::InvalidMetadata {
                    path: json.clone(),
                    error: err.to_string(),
                };
                pass.fail(finding, &err);
                continue;
            }
        };
        let metadata = match BackupMetadata::parse(json, &raw) {
            Ok(metadata) => metadata,
            Err(err) => {
                pass.keep(Finding::InvalidMetadata {
                    path: json.clone(),
                    error: err.to_string(),
                });
                continue;
            }
        };
        let linked = metadata.linked_files(&vm_dir);
        let (known, used) = match metadata {
            BackupMetadata::Full { .. } => (&xvas, &mut used_xvas),
            BackupMetadata::Delta { .. } => (&known_vhds, &mut used_vhds),
        };
        let missing: Vec<String> = linked
            .iter()
            .filter(|file| !known.contains(*file))
            .cloned()
            .collect();
        if missing.is_empty() {
            used.extend(linked);
        } else {
            let finding = Finding::IncompleteMetadata {
                path: json.clone(),
                missing,
            };
            pass.dispose(finding, json).await;
        }
    }

    // An unreadable disk hides its parent link, so nothing around it can be proven unused.
    let blind_dirs: BTreeSet<String> = walk
        .unreadable
        .keys()
        .map(|vhd| path::dirname(vhd))
        .collect();
    for dir in &blind_dirs {
        warn!(dir = %dir, "unreadable VHD in directory, skipping unused VHD cleanup there");
    }
    let unused: BTreeSet<String> = vhds
        .difference(&used_vhds)
        .filter(|vhd| !blind_dirs.contains(&path::dirname(vhd)))
        .cloned()
        .collect();
    let plan = plan_unused(&walk, &unused);
    for vhd in &plan.delete {
        pass.dispose(Finding::UnusedVhd { path: vhd.clone() }, vhd).await;
    }
    merge_unused_chains(&mut pass, plan.chains, options, locks).await;

    for xva in xvas.difference(&used_xvas) {
        pass.dispose(Finding::UnusedXva { path: xva.clone() }, xva)
            .await;
        if pass.remove {
            let checksum = format!("{xva}.checksum");
            if let Err(err) = handler.unlink_if_exists(&checksum).await {
                pass.fail(Finding::OrphanChecksum { path: checksum }, &ChainError::from(err));
            }
        }
    }
    for checksum in checksums {
        let Some(xva) = checksum.strip_suffix(".checksum") else {
            continue;
        };
        if !xvas.contains(xva) {
            pass.dispose(
                Finding::OrphanChecksum {
                    path: checksum.clone(),
                },
                checksum,
            )
            .await;
        }
    }

    settle_merge_states(&mut pass, &walk, &merge_states).await;

    let report = pass.reporter.finish();
    info!(vm_dir = %vm_dir, findings = report.entries.len(), "VM backups cleaned");
    Ok(report)
}

/// First ancestor of an orphan that is not itself an orphan: the missing or broken file the
/// orphan chain hangs from.
fn missing_ancestor<'w>(walk: &'w ChainWalk, orphan: &'w str) -> &'w str {
    let mut seen = BTreeSet::new();
    let mut current = orphan;
    while let Some(parent) = walk.orphans.get(current) {
        if !seen.insert(current) {
            break;
        }
        current = parent.as_str();
    }
    current
}

/// Parent path to (sidecar path, state) for every readable merge state.
async fn load_merge_states(
    pass: &mut Pass<'_>,
    state_files: &[String],
) -> BTreeMap<String, (String, MergeState)> {
    let mut states = BTreeMap::new();
    for state_file in state_files {
        let Some(parent) = parent_of_state(state_file) else {
            continue;
        };
        match merge_state::load(pass.handler, &parent).await {
            Ok(Some(state)) => {
                states.insert(parent, (state_file.clone(), state));
            }
            Ok(None) => {}
            Err(ChainError::InvalidMergeState { source, .. }) => {
                let finding = Finding::InvalidMergeState {
                    path: state_file.clone(),
                    error: source.to_string(),
                };
                pass.dispose(finding, state_file).await;
            }
            Err(err) => pass.fail(
                Finding::InvalidMergeState {
                    path: state_file.clone(),
                    error: "unreadable".to_string(),
                },
                &err,
            ),
        }
    }
    states
}

async fn merge_unused_chains(
    pass: &mut Pass<'_>,
    chains: Vec<Vec<String>>,
    options: &CleanVmOptions,
    locks: &ChainLocks,
) {
    let jobs: Vec<MergeJob> = chains
        .into_iter()
        .filter_map(|paths| Chain::from_root(paths).ok())
        .map(|chain| MergeJob {
            chain,
            remove: options.remove,
            merge: options.merge,
        })
        .collect();
    let handler = pass.handler;
    let merge_options = MergeOptions {
        progress_interval: options.progress_interval(),
        on_progress: None,
    };
    let mut results: Vec<(MergeJob, Result<MergeOutcome>)> = stream::iter(jobs)
        .map(|job| async move {
            let result = merge_chain(handler, &job, locks, merge_options).await;
            (job, result)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    results.sort_by(|a, b| a.0.chain.root().cmp(b.0.chain.root()));

    for (job, result) in results {
        let root = job.chain.root().to_string();
        let child = job.chain.nearest_child().to_string();
        for skipped in job.chain.skipped() {
            pass.keep(Finding::GenerationSkipped {
                path: skipped.clone(),
                root: root.clone(),
            });
        }
        let finding = Finding::MergeNeeded {
            parent: root.clone(),
            child: child.clone(),
        };
        match result {
            Ok(MergeOutcome {
                summary: Some(summary),
                renamed,
                ..
            }) => pass.reporter.record(
                finding,
                ItemOutcome::Merged {
                    merged_bytes: summary.merged_bytes,
                    renamed,
                },
            ),
            Ok(_) => pass.report(finding),
            Err(err) => {
                warn!(parent = %root, child = %child, error = %err, "merge failed");
                pass.fail(finding, &err);
                if let ChainError::PartialMerge { source, .. } = &err {
                    pass.keep(Finding::PartialMerge {
                        parent: root,
                        child,
                        error: source.to_string(),
                    });
                }
            }
        }
    }
}

/// Report merge states still on the remote and drop the ones whose parent is gone.
async fn settle_merge_states(
    pass: &mut Pass<'_>,
    walk: &ChainWalk,
    states: &BTreeMap<String, (String, MergeState)>,
) {
    for (parent, (state_file, state)) in states {
        // Already reported with the broken files.
        if walk.broken.contains_key(parent) {
            continue;
        }
        // Finished and renamed during this pass.
        match pass.handler.exists(state_file).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(err) => {
                let finding = Finding::InvalidMergeState {
                    path: state_file.clone(),
                    error: "unreadable".to_string(),
                };
                pass.fail(finding, &ChainError::from(err));
                continue;
            }
        }
        let parent_gone = pass.deleted.contains(parent)
            || !(walk.valid.contains(parent) || walk.unreadable.contains_key(parent));
        if parent_gone {
            pass.dispose(
                Finding::StaleMergeState {
                    path: state_file.clone(),
                },
                state_file,
            )
            .await;
        } else if walk.valid.contains(&state.child) && !pass.deleted.contains(&state.child) {
            pass.keep(Finding::InterruptedMerge {
                parent: parent.clone(),
                child: state.child.clone(),
                current_block: state.current_block,
                total_blocks: state.total_blocks,
            });
        } else {
            pass.keep(Finding::PartialMerge {
                parent: parent.clone(),
                child: state.child.clone(),
                error: "child is missing or invalid".to_string(),
            });
        }
    }
}
