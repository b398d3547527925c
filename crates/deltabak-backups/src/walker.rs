use std::collections::{BTreeMap, BTreeSet, HashSet};

use deltabak_fs::{path, Handler, ListOptions, OpenMode};
use deltabak_vhd::{open_vhd_with, DiskType, OpenOptions, VhdError};
use futures_util::stream::{self, StreamExt};
use tracing::debug;

use crate::config::DEFAULT_CONCURRENCY;
use crate::merge::Chain;
use crate::merge_state::is_state_file;
use crate::{ChainError, Result};

/// Files found under `<vm_dir>/vdis/<job>/<vdi>/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhdListing {
    pub vhds: Vec<String>,
    /// Merge-state sidecars left by merges that did not finish.
    pub merge_states: Vec<String>,
}

/// List every VHD and merge-state sidecar of a VM backup directory.
///
/// A missing `vdis` tree yields an empty listing.
pub async fn list_vhds(handler: &dyn Handler, vm_dir: &str) -> Result<VhdListing> {
    let mut listing = VhdListing::default();
    let vdis_dir = path::join(vm_dir, "vdis");
    for job in list_dir(handler, &vdis_dir).await? {
        for vdi in list_dir(handler, &job).await? {
            for entry in list_dir(handler, &vdi).await? {
                if entry.ends_with(".vhd") {
                    listing.vhds.push(entry);
                } else if is_state_file(&entry) {
                    listing.merge_states.push(entry);
                }
            }
        }
    }
    Ok(listing)
}

async fn list_dir(handler: &dyn Handler, dir: &str) -> Result<Vec<String>> {
    match handler.list(dir, ListOptions::prepend_dir()).await {
        Ok(entries) => Ok(entries),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub concurrency: usize,
    /// Also require the trailing footer to match the leading copy.
    pub check_secondary_footer: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            check_secondary_footer: true,
        }
    }
}

/// Second (or later) child found for a parent that already has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub parent: String,
    pub child1: String,
    pub child2: String,
}

impl Branch {
    pub fn to_error(&self) -> ChainError {
        ChainError::MultipleChildren {
            parent: self.parent.clone(),
            child1: self.child1.clone(),
            child2: self.child2.clone(),
        }
    }
}

/// One VHD with its links, as seen by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub path: String,
    pub parent: Option<String>,
    /// First child only; see [`ChainWalk::branches`] for the others.
    pub child: Option<String>,
}

/// Adjacency snapshot of one walk. Nothing here is kept between walks.
#[derive(Debug, Default)]
pub struct ChainWalk {
    /// Every file that opened and validated.
    pub valid: BTreeSet<String>,
    /// Differencing child to resolved parent path.
    pub parents: BTreeMap<String, String>,
    /// Parent to its first child.
    pub children: BTreeMap<String, String>,
    /// Files failing format validation.
    pub broken: BTreeMap<String, VhdError>,
    /// Files that could not be opened for another reason (I/O, unsupported features).
    pub unreadable: BTreeMap<String, VhdError>,
    /// Orphan to the parent path it points at.
    pub orphans: BTreeMap<String, String>,
    pub branches: Vec<Branch>,
    /// Every child taking part in a branch.
    pub branched: BTreeSet<String>,
}

impl ChainWalk {
    pub fn node(&self, path: &str) -> Option<ChainNode> {
        self.valid.contains(path).then(|| ChainNode {
            path: path.to_string(),
            parent: self.parents.get(path).cloned(),
            child: self.children.get(path).cloned(),
        })
    }

    pub fn is_branch_parent(&self, path: &str) -> bool {
        self.branches.iter().any(|branch| branch.parent == path)
    }

    /// Chain from `leaf` up to its root, following resolved parents.
    pub fn chain_from(&self, leaf: &str) -> Result<Chain> {
        let mut paths = vec![path::normalize(leaf)];
        loop {
            let child = &paths[paths.len() - 1];
            let Some(parent) = self.parents.get(child) else {
                break;
            };
            if !self.valid.contains(parent) || paths.contains(parent) {
                return Err(ChainError::MissingParent {
                    child: child.clone(),
                    parent: parent.clone(),
                });
            }
            paths.push(parent.clone());
        }
        Chain::new(paths)
    }

    /// Valid files that are not orphans.
    pub fn usable(&self) -> BTreeSet<String> {
        self.valid
            .iter()
            .filter(|path| !self.orphans.contains_key(*path))
            .cloned()
            .collect()
    }
}

enum Opened {
    Valid { parent: Option<String> },
    Broken(VhdError),
    Unreadable(VhdError),
    Gone,
}

async fn open_one(handler: &dyn Handler, vhd_path: &str, options: OpenOptions) -> Opened {
    match open_vhd_with(handler, vhd_path, OpenMode::Read, options).await {
        Ok(vhd) => {
            let parent = match (vhd.disk_type(), vhd.header()) {
                (DiskType::Differencing, Some(header)) => Some(path::resolve(
                    &path::dirname(vhd_path),
                    &header.parent_unicode_name,
                )),
                _ => None,
            };
            Opened::Valid { parent }
        }
        Err(err) if err.is_not_found() => Opened::Gone,
        Err(err) if err.is_corrupt() => Opened::Broken(err),
        Err(err) => Opened::Unreadable(err),
    }
}

/// Open every candidate and build the chain adjacency. Never mutates the remote.
pub async fn walk_vhds(
    handler: &dyn Handler,
    paths: &[String],
    options: WalkOptions,
) -> Result<ChainWalk> {
    let open_options = OpenOptions {
        check_secondary_footer: options.check_secondary_footer,
    };
    let mut opened: Vec<(String, Opened)> = stream::iter(paths.iter().map(|p| path::normalize(p)))
        .map(|vhd_path| async move {
            let opened = open_one(handler, &vhd_path, open_options).await;
            (vhd_path, opened)
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    opened.sort_by(|a, b| a.0.cmp(&b.0));

    let mut walk = ChainWalk::default();
    for (vhd_path, opened) in opened {
        match opened {
            Opened::Valid { parent } => {
                walk.valid.insert(vhd_path.clone());
                if let Some(parent) = parent {
                    walk.parents.insert(vhd_path, parent);
                }
            }
            Opened::Broken(err) => {
                debug!(path = %vhd_path, error = %err, "VHD check error");
                walk.broken.insert(vhd_path, err);
            }
            Opened::Unreadable(err) => {
                debug!(path = %vhd_path, error = %err, "VHD could not be opened");
                walk.unreadable.insert(vhd_path, err);
            }
            Opened::Gone => debug!(path = %vhd_path, "VHD disappeared during walk"),
        }
    }

    for (child, parent) in &walk.parents {
        match walk.children.get(parent) {
            Some(first) => {
                let branch = Branch {
                    parent: parent.clone(),
                    child1: first.clone(),
                    child2: child.clone(),
                };
                debug!(error = %branch.to_error(), "branch in VHD chain");
                walk.branched.insert(branch.child1.clone());
                walk.branched.insert(branch.child2.clone());
                walk.branches.push(branch);
            }
            None => {
                walk.children.insert(parent.clone(), child.clone());
            }
        }
    }

    walk.orphans = find_orphans(&walk);
    Ok(walk)
}

/// A differencing file is an orphan when its parent is neither valid nor unreadable, or is
/// itself an orphan. Files in a parent cycle are all orphans.
fn find_orphans(walk: &ChainWalk) -> BTreeMap<String, String> {
    let present = |path: &str| walk.valid.contains(path) || walk.unreadable.contains_key(path);
    let mut verdicts: BTreeMap<&str, bool> = BTreeMap::new();

    for start in walk.parents.keys() {
        let mut climbed: Vec<&str> = Vec::new();
        let mut on_path: HashSet<&str> = HashSet::new();
        let mut current = start.as_str();
        let orphan = loop {
            if let Some(verdict) = verdicts.get(current) {
                break *verdict;
            }
            match walk.parents.get(current) {
                Some(parent) => {
                    if !on_path.insert(current) {
                        break true;
                    }
                    climbed.push(current);
                    current = parent.as_str();
                }
                None => break !present(current),
            }
        };
        for node in climbed {
            verdicts.insert(node, orphan);
        }
    }

    verdicts
        .into_iter()
        .filter(|(_, orphan)| *orphan)
        .filter_map(|(child, _)| {
            walk.parents
                .get(child)
                .map(|parent| (child.to_string(), parent.clone()))
        })
        .collect()
}
