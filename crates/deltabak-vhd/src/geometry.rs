use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DiskGeometry, SECTOR_SIZE};

/// 2000-01-01T00:00:00Z as a UNIX timestamp.
const VHD_EPOCH: u64 = 946_684_800;

const MAX_TOTAL_SECTORS: u64 = 65535 * 16 * 255;

/// CHS geometry for a disk of `size` bytes (VHD specification, appendix "CHS calculation").
pub fn compute_geometry(size: u64) -> DiskGeometry {
    let total_sectors = (size / SECTOR_SIZE as u64).min(MAX_TOTAL_SECTORS);
    if total_sectors == 0 {
        return DiskGeometry::default();
    }

    let (sectors_per_track, heads, cylinder_times_heads) = if total_sectors >= 65535 * 16 * 63 {
        (255u64, 16u64, total_sectors / 255)
    } else {
        let mut spt = 17u64;
        let mut cth = total_sectors / spt;
        let mut heads = cth.div_ceil(1024).max(4);

        if cth >= heads * 1024 || heads > 16 {
            spt = 31;
            heads = 16;
            cth = total_sectors / spt;
        }
        if cth >= heads * 1024 {
            spt = 63;
            heads = 16;
            cth = total_sectors / spt;
        }
        (spt, heads, cth)
    };

    DiskGeometry {
        cylinders: (cylinder_times_heads / heads) as u16,
        heads: heads as u8,
        sectors_per_track: sectors_per_track as u8,
    }
}

/// Current time in VHD timestamp units (seconds since 2000-01-01T00:00:00Z).
pub fn timestamp_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(VHD_EPOCH);
    unix.saturating_sub(VHD_EPOCH) as u32
}
