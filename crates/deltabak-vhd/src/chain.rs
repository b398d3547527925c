use std::collections::HashSet;

use deltabak_fs::{path, BoxedFile, FileHandle, Handler, OpenMode};

use crate::util::checked_range;
use crate::{open_vhd, DiskType, Result, VhdError, VhdFile};

/// Read-through view of a leaf disk and all of its ancestors.
///
/// Each sector reads from the nearest disk (leaf first) whose bitmap marks it valid; sectors
/// no disk holds read as zero, and a fixed root serves everything underneath.
pub struct VhdChain<F> {
    /// Leaf first, root last.
    disks: Vec<VhdFile<F>>,
}

impl<F: FileHandle> VhdChain<F> {
    /// `disks` must be ordered leaf to root, each disk the parent of the previous one.
    pub fn new(disks: Vec<VhdFile<F>>) -> Result<Self> {
        let root = disks
            .last()
            .ok_or(VhdError::InvalidArgument("empty vhd chain"))?;
        if root.disk_type() == DiskType::Differencing {
            return Err(VhdError::InvalidArgument("vhd chain root has a parent"));
        }
        for pair in disks.windows(2) {
            let (child, parent) = (&pair[0], &pair[1]);
            let linked = child.disk_type() == DiskType::Differencing
                && child
                    .header()
                    .is_some_and(|header| header.parent_uuid == parent.footer().uuid);
            if !linked {
                return Err(VhdError::InvalidArgument("vhd chain link mismatch"));
            }
        }
        Ok(Self { disks })
    }

    pub fn len(&self) -> usize {
        self.disks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    pub fn disks(&self) -> &[VhdFile<F>] {
        &self.disks
    }

    /// Virtual size, as declared by the leaf.
    pub fn capacity(&self) -> u64 {
        self.disks.first().map_or(0, |leaf| leaf.capacity())
    }

    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity())?;
        buf.fill(0);
        for disk in self.disks.iter_mut().rev() {
            let capacity = disk.capacity();
            if offset >= capacity {
                continue;
            }
            let len = buf.len().min((capacity - offset) as usize);
            disk.overlay_at(offset, &mut buf[..len]).await?;
        }
        Ok(())
    }

    pub fn into_disks(self) -> Vec<VhdFile<F>> {
        self.disks
    }
}

impl VhdChain<BoxedFile> {
    /// Open `leaf` and follow parent names up to the root.
    pub async fn open(handler: &dyn Handler, leaf: &str) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut disks = Vec::new();
        let mut current = path::normalize(leaf);
        loop {
            if !seen.insert(current.clone()) {
                return Err(VhdError::CorruptFormat("vhd chain loops"));
            }
            let disk = open_vhd(handler, &current, OpenMode::Read).await?;
            let parent = match (disk.disk_type(), disk.header()) {
                (DiskType::Differencing, Some(header)) => Some(path::resolve(
                    &path::dirname(&current),
                    &header.parent_unicode_name,
                )),
                _ => None,
            };
            disks.push(disk);
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        Self::new(disks)
    }
}
