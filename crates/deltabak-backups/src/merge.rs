use std::time::Duration;

use deltabak_fs::{path, BoxedFile, Handler, OpenMode};
use deltabak_vhd::{open_vhd_with, DiskType, OpenOptions, VhdFile};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_PROGRESS_INTERVAL_SECS;
use crate::locks::ChainLocks;
use crate::merge_state::{self, MergeState};
use crate::{ChainError, Result};

/// Linear chain of VHDs, leaf first and root last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    paths: Vec<String>,
}

impl Chain {
    /// `paths` ordered leaf to root; each entry is the child of the next one.
    pub fn new(paths: Vec<String>) -> Result<Self> {
        if paths.len() < 2 {
            return Err(ChainError::ChainTooShort);
        }
        Ok(Self {
            paths: paths.iter().map(|p| path::normalize(p)).collect(),
        })
    }

    /// Same as [`Chain::new`] with `paths` ordered root to leaf.
    pub fn from_root(mut paths: Vec<String>) -> Result<Self> {
        paths.reverse();
        Self::new(paths)
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    pub fn leaf(&self) -> &str {
        &self.paths[0]
    }

    pub fn root(&self) -> &str {
        &self.paths[self.paths.len() - 1]
    }

    /// The child a merge folds into the root.
    pub fn nearest_child(&self) -> &str {
        &self.paths[self.paths.len() - 2]
    }

    /// Generations past the nearest child. They are left alone by a merge.
    pub fn skipped(&self) -> &[String] {
        &self.paths[..self.paths.len() - 2]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub chain: Chain,
    /// Rename the merged root over its child, replacing the child file.
    pub remove: bool,
    /// Without it the job only describes what would be merged.
    pub merge: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeProgress {
    pub parent: String,
    pub child: String,
    pub done: u32,
    pub total: u32,
    pub merged_bytes: u64,
}

pub type ProgressFn<'a> = dyn Fn(&MergeProgress) + Send + Sync + 'a;

#[derive(Clone, Copy)]
pub struct MergeOptions<'a> {
    /// Minimum time between two progress reports (and merge-state saves).
    pub progress_interval: Duration,
    pub on_progress: Option<&'a ProgressFn<'a>>,
}

impl Default for MergeOptions<'_> {
    fn default() -> Self {
        Self {
            progress_interval: Duration::from_secs(DEFAULT_PROGRESS_INTERVAL_SECS),
            on_progress: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged_bytes: u64,
    /// Allocated blocks of the child.
    pub blocks: u32,
    /// Block index an interrupted merge was resumed from.
    pub resumed_at: Option<u32>,
    /// The parent had already taken the child's identity; nothing was written.
    pub already_merged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub parent: String,
    pub child: String,
    /// `None` when the job did not allow merging.
    pub summary: Option<MergeSummary>,
    pub renamed: bool,
    pub skipped: Vec<String>,
}

type Vhd = VhdFile<BoxedFile>;

async fn open_checked(handler: &dyn Handler, vhd_path: &str, mode: OpenMode) -> Result<Vhd> {
    let options = OpenOptions {
        check_secondary_footer: true,
    };
    open_vhd_with(handler, vhd_path, mode, options)
        .await
        .map_err(|source| {
            if source.is_corrupt() {
                ChainError::CorruptFormat {
                    path: vhd_path.to_string(),
                    source,
                }
            } else {
                source.into()
            }
        })
}

fn mismatch(parent: &str, child: &str, reason: &'static str) -> ChainError {
    ChainError::ParentMismatch {
        parent: parent.to_string(),
        child: child.to_string(),
        reason,
    }
}

/// Open both disks and check they can be merged at all. The parent is validated with both
/// footer copies, so a parent left damaged by an earlier failure is never written again.
async fn open_pair(handler: &dyn Handler, parent_path: &str, child_path: &str) -> Result<(Vhd, Vhd)> {
    let parent = open_checked(handler, parent_path, OpenMode::ReadWrite).await?;
    let child = open_checked(handler, child_path, OpenMode::Read).await?;

    if child.disk_type() != DiskType::Differencing {
        return Err(mismatch(parent_path, child_path, "child is not a differencing disk"));
    }
    if !parent.disk_type().is_sparse() {
        return Err(mismatch(parent_path, child_path, "parent is not a dynamic disk"));
    }
    if parent.block_size()? != child.block_size()? {
        return Err(mismatch(parent_path, child_path, "block sizes differ"));
    }
    Ok((parent, child))
}

struct Merger<'a> {
    handler: &'a dyn Handler,
    parent_path: &'a str,
    child_path: &'a str,
    options: MergeOptions<'a>,
}

impl Merger<'_> {
    fn partial(&self, source: impl Into<ChainError>) -> ChainError {
        ChainError::PartialMerge {
            parent: self.parent_path.to_string(),
            child: self.child_path.to_string(),
            source: Box::new(source.into()),
        }
    }

    fn report(&self, state: &MergeState) {
        info!(
            parent = %self.parent_path,
            child = %self.child_path,
            done = state.current_block,
            total = state.total_blocks,
            "merge progress"
        );
        if let Some(on_progress) = self.options.on_progress {
            on_progress(&MergeProgress {
                parent: self.parent_path.to_string(),
                child: self.child_path.to_string(),
                done: state.current_block,
                total: state.total_blocks,
                merged_bytes: state.merged_data_size,
            });
        }
    }

    /// Overlay every allocated child block onto the parent, resuming from a saved state.
    async fn overlay(&self, parent: &mut Vhd, child: &mut Vhd) -> Result<MergeSummary> {
        let parent_uuid = parent.footer().uuid;
        let child_uuid = child.footer().uuid;
        if parent_uuid == child_uuid {
            info!(parent = %self.parent_path, child = %self.child_path, "child already merged");
            return Ok(MergeSummary {
                already_merged: true,
                ..MergeSummary::default()
            });
        }
        let header = child
            .header()
            .ok_or_else(|| mismatch(self.parent_path, self.child_path, "child is not a differencing disk"))?;
        if header.parent_uuid != parent_uuid {
            return Err(mismatch(
                self.parent_path,
                self.child_path,
                "child does not reference this parent",
            ));
        }
        let entries = header.max_table_entries;

        let blocks = child.allocated_blocks();
        let total = blocks.len() as u32;
        let fresh = MergeState::new(self.parent_path, self.child_path, &parent_uuid, &child_uuid, total);
        let mut state = match merge_state::load(self.handler, self.parent_path).await? {
            Some(saved)
                if saved.matches(&parent_uuid, &child_uuid)
                    && saved.child == fresh.child
                    && saved.total_blocks == total =>
            {
                info!(parent = %self.parent_path, block = saved.current_block, "resuming merge");
                saved
            }
            Some(_) => {
                warn!(parent = %self.parent_path, "ignoring merge state of another merge");
                fresh
            }
            None => fresh,
        };
        let resumed_at = (state.current_block > 0).then_some(state.current_block);
        merge_state::save(self.handler, &state).await?;

        parent
            .ensure_bat_size(entries)
            .await
            .map_err(|err| self.partial(err))?;

        let mut last_report = Instant::now();
        let start = state.current_block as usize;
        for (index, &block) in blocks.iter().enumerate().skip(start) {
            let merged = parent
                .coalesce_block(child, block)
                .await
                .map_err(|err| self.partial(err))?;
            state.current_block = index as u32 + 1;
            state.merged_data_size += merged;

            if last_report.elapsed() >= self.options.progress_interval {
                // The saved state must never claim blocks that are not durable yet.
                parent.sync().await.map_err(|err| self.partial(err))?;
                merge_state::save(self.handler, &state)
                    .await
                    .map_err(|err| self.partial(err))?;
                self.report(&state);
                last_report = Instant::now();
            }
        }

        parent.sync().await.map_err(|err| self.partial(err))?;
        merge_state::save(self.handler, &state)
            .await
            .map_err(|err| self.partial(err))?;
        self.report(&state);

        Ok(MergeSummary {
            merged_bytes: state.merged_data_size,
            blocks: total,
            resumed_at,
            already_merged: false,
        })
    }

    /// Make the parent the merged image of the child: same size, geometry and identity.
    async fn take_identity(&self, parent: &mut Vhd, child: &Vhd) -> Result<()> {
        let footer = child.footer().clone();
        parent.footer_mut().assume_identity_of(&footer);
        parent
            .write_footer(false)
            .await
            .map_err(|err| self.partial(err))?;
        parent.sync().await.map_err(|err| self.partial(err))?;
        Ok(())
    }
}

/// Overlay `child`'s data onto `parent` without changing the parent's identity.
///
/// Reading through the child gives the same content before and after, so the chain stays
/// usable. The merge state is kept, marking the overlay as complete for a later
/// [`merge_vhd`].
pub async fn coalesce_vhd(
    handler: &dyn Handler,
    parent_path: &str,
    child_path: &str,
    options: MergeOptions<'_>,
) -> Result<MergeSummary> {
    let (mut parent, mut child) = open_pair(handler, parent_path, child_path).await?;
    let merger = Merger {
        handler,
        parent_path,
        child_path,
        options,
    };
    merger.overlay(&mut parent, &mut child).await
}

/// Merge `child` into `parent`: overlay its valid sectors, then copy its size, geometry,
/// timestamp and uuid into the parent footer.
///
/// On failure past the first write the parent may be partially modified and
/// [`ChainError::PartialMerge`] is returned; the merge state left next to the parent lets
/// the next call resume.
pub async fn merge_vhd(
    handler: &dyn Handler,
    parent_path: &str,
    child_path: &str,
    options: MergeOptions<'_>,
) -> Result<MergeSummary> {
    let (mut parent, mut child) = open_pair(handler, parent_path, child_path).await?;
    let merger = Merger {
        handler,
        parent_path,
        child_path,
        options,
    };
    let summary = merger.overlay(&mut parent, &mut child).await?;
    if !summary.already_merged {
        merger.take_identity(&mut parent, &child).await?;
    }
    merge_state::remove(handler, parent_path).await?;
    info!(
        parent = %parent_path,
        child = %child_path,
        merged_bytes = summary.merged_bytes,
        blocks = summary.blocks,
        "merged VHD"
    );
    Ok(summary)
}

/// Merge the nearest child of a chain into its root, serialized per root by `locks`.
///
/// With `remove` the merged root then replaces the child file. Without it the root only
/// receives the child's data; its identity and file name change on a later pass that has
/// `remove`.
pub async fn merge_chain(
    handler: &dyn Handler,
    job: &MergeJob,
    locks: &ChainLocks,
    options: MergeOptions<'_>,
) -> Result<MergeOutcome> {
    let root = job.chain.root();
    let child = job.chain.nearest_child();
    let mut outcome = MergeOutcome {
        parent: root.to_string(),
        child: child.to_string(),
        summary: None,
        renamed: false,
        skipped: job.chain.skipped().to_vec(),
    };
    for skipped in &outcome.skipped {
        debug!(path = %skipped, root = %root, "only the nearest child is merged");
    }
    if !job.merge {
        return Ok(outcome);
    }

    let _guard = locks.lock(root).await;
    if job.remove {
        let summary = merge_vhd(handler, root, child, options).await?;
        handler.rename(root, child).await?;
        info!(from = %root, to = %child, "renamed merged VHD");
        outcome.summary = Some(summary);
        outcome.renamed = true;
    } else {
        outcome.summary = Some(coalesce_vhd(handler, root, child, options).await?);
    }
    Ok(outcome)
}
