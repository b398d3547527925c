use serde::Serialize;
use tracing::{info, warn};

/// Callback receiving every report entry as soon as it is recorded.
pub type LogFn<'a> = dyn Fn(&ReportEntry) + Send + Sync + 'a;

/// Something a reconciliation pass noticed about one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Finding {
    /// Failed format validation (cookie, checksum, layout).
    BrokenVhd { path: String, error: String },
    /// Could not be opened for another reason; left alone.
    UnreadableVhd { path: String, error: String },
    /// Its parent is missing, broken or itself orphaned.
    OrphanVhd { path: String, parent: String },
    MultipleChildren {
        parent: String,
        child1: String,
        child2: String,
    },
    InvalidXva { path: String, reason: String },
    /// Backup metadata referencing files that are gone.
    IncompleteMetadata { path: String, missing: Vec<String> },
    InvalidMetadata { path: String, error: String },
    /// Not referenced by any metadata and no used descendant depends on it.
    UnusedVhd { path: String },
    /// Unused parent coalesced into its child.
    MergeNeeded { parent: String, child: String },
    /// Generation left in place because only the nearest child is merged per pass.
    GenerationSkipped { path: String, root: String },
    PartialMerge {
        parent: String,
        child: String,
        error: String,
    },
    InterruptedMerge {
        parent: String,
        child: String,
        current_block: u32,
        total_blocks: u32,
    },
    UnusedXva { path: String },
    OrphanChecksum { path: String },
    StaleMergeState { path: String },
    InvalidMergeState { path: String, error: String },
}

impl Finding {
    pub fn message(&self) -> &'static str {
        match self {
            Finding::BrokenVhd { .. } => "VHD check error",
            Finding::UnreadableVhd { .. } => "VHD could not be opened",
            Finding::OrphanVhd { .. } => "orphan VHD",
            Finding::MultipleChildren { .. } => "VHD has multiple children",
            Finding::InvalidXva { .. } => "invalid XVA",
            Finding::IncompleteMetadata { .. } => "some files referenced by backup metadata are missing",
            Finding::InvalidMetadata { .. } => "backup metadata could not be parsed",
            Finding::UnusedVhd { .. } => "unused VHD",
            Finding::MergeNeeded { .. } => "VHD chain needs merging",
            Finding::GenerationSkipped { .. } => "VHD generation skipped, only one child is merged per pass",
            Finding::PartialMerge { .. } => "VHD merge stopped partway",
            Finding::InterruptedMerge { .. } => "interrupted VHD merge found",
            Finding::UnusedXva { .. } => "unused XVA",
            Finding::OrphanChecksum { .. } => "unused XVA checksum",
            Finding::StaleMergeState { .. } => "stale merge state",
            Finding::InvalidMergeState { .. } => "merge state could not be parsed",
        }
    }

    /// Whether the finding points at damage rather than routine cleanup.
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            Finding::BrokenVhd { .. }
                | Finding::UnreadableVhd { .. }
                | Finding::OrphanVhd { .. }
                | Finding::MultipleChildren { .. }
                | Finding::InvalidXva { .. }
                | Finding::IncompleteMetadata { .. }
                | Finding::InvalidMetadata { .. }
                | Finding::PartialMerge { .. }
                | Finding::InvalidMergeState { .. }
        )
    }
}

/// What the pass did about a finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ItemOutcome {
    /// Policy did not allow acting on it.
    Reported,
    /// Deliberately left in place.
    Kept,
    Deleted,
    Merged { merged_bytes: u64, renamed: bool },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub finding: Finding,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Findings of one [`crate::clean_vm`] pass, in the order they were recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanVmReport {
    pub entries: Vec<ReportEntry>,
}

impl CleanVmReport {
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.entries.iter().map(|entry| &entry.finding)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.outcome, ItemOutcome::Failed { .. }))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) struct Reporter<'a> {
    report: CleanVmReport,
    on_log: Option<&'a LogFn<'a>>,
}

impl<'a> Reporter<'a> {
    pub(crate) fn new(on_log: Option<&'a LogFn<'a>>) -> Self {
        Self {
            report: CleanVmReport::default(),
            on_log,
        }
    }

    pub(crate) fn record(&mut self, finding: Finding, outcome: ItemOutcome) {
        let entry = ReportEntry { finding, outcome };
        if entry.finding.is_problem() || matches!(entry.outcome, ItemOutcome::Failed { .. }) {
            warn!(finding = ?entry.finding, outcome = ?entry.outcome, "{}", entry.finding.message());
        } else {
            info!(finding = ?entry.finding, outcome = ?entry.outcome, "{}", entry.finding.message());
        }
        if let Some(on_log) = self.on_log {
            on_log(&entry);
        }
        self.report.entries.push(entry);
    }

    pub(crate) fn finish(self) -> CleanVmReport {
        self.report
    }
}
