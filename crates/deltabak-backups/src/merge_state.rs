use deltabak_fs::{path, Handler};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{ChainError, Result};

const STATE_SUFFIX: &str = ".merge.json";

/// Progress of a merge, persisted next to the parent so an interrupted merge can be resumed
/// or at least recognised by the next pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeState {
    pub parent: String,
    pub child: String,
    pub parent_uuid: String,
    pub child_uuid: String,
    /// Index into the child's allocated blocks of the next block to merge.
    pub current_block: u32,
    pub total_blocks: u32,
    pub merged_data_size: u64,
}

impl MergeState {
    pub fn new(parent: &str, child: &str, parent_uuid: &[u8; 16], child_uuid: &[u8; 16], total_blocks: u32) -> Self {
        Self {
            parent: path::normalize(parent),
            child: path::normalize(child),
            parent_uuid: format_uuid(parent_uuid),
            child_uuid: format_uuid(child_uuid),
            current_block: 0,
            total_blocks,
            merged_data_size: 0,
        }
    }

    /// Whether this state describes merging `child_uuid` into the disk currently identified by
    /// `parent_uuid`.
    pub fn matches(&self, parent_uuid: &[u8; 16], child_uuid: &[u8; 16]) -> bool {
        self.parent_uuid == format_uuid(parent_uuid) && self.child_uuid == format_uuid(child_uuid)
    }
}

pub fn format_uuid(uuid: &[u8; 16]) -> String {
    Uuid::from_bytes(*uuid).to_string()
}

/// `<dir>/.<parent name>.merge.json`
pub fn state_path(parent: &str) -> String {
    path::join(
        &path::dirname(parent),
        &format!(".{}{STATE_SUFFIX}", path::basename(parent)),
    )
}

/// Parent path a state file belongs to, if `state_file` is named like one.
pub fn parent_of_state(state_file: &str) -> Option<String> {
    let name = path::basename(state_file);
    let parent_name = name.strip_prefix('.')?.strip_suffix(STATE_SUFFIX)?;
    if parent_name.is_empty() {
        return None;
    }
    Some(path::join(&path::dirname(state_file), parent_name))
}

pub fn is_state_file(name: &str) -> bool {
    parent_of_state(name).is_some()
}

pub async fn load(handler: &dyn Handler, parent: &str) -> Result<Option<MergeState>> {
    let state_path = state_path(parent);
    let raw = match handler.read_file(&state_path).await {
        Ok(raw) => raw,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|source| ChainError::InvalidMergeState {
            path: state_path,
            source,
        })
}

/// Write through a temporary file and rename, so a crash never leaves a truncated state.
pub async fn save(handler: &dyn Handler, state: &MergeState) -> Result<()> {
    let state_path = state_path(&state.parent);
    let tmp = format!("{state_path}.tmp");
    let raw = serde_json::to_vec(state).map_err(|source| ChainError::InvalidMergeState {
        path: state_path.clone(),
        source,
    })?;
    handler.output_file(&tmp, &raw).await?;
    handler.rename(&tmp, &state_path).await?;
    debug!(path = %state_path, current_block = state.current_block, "saved merge state");
    Ok(())
}

pub async fn remove(handler: &dyn Handler, parent: &str) -> Result<bool> {
    Ok(handler.unlink_if_exists(&state_path(parent)).await?)
}
