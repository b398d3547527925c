//! Per-block sector bitmaps. Bit 7 of byte 0 is sector 0 of the block.

pub fn test_bit(bitmap: &[u8], sector: u32) -> bool {
    let byte = (sector / 8) as usize;
    byte < bitmap.len() && bitmap[byte] & (0x80 >> (sector % 8)) != 0
}

pub(crate) fn set_bit(bitmap: &mut [u8], sector: u32) {
    let byte = (sector / 8) as usize;
    bitmap[byte] |= 0x80 >> (sector % 8);
}

pub(crate) fn set_range(bitmap: &mut [u8], begin: u32, end: u32) {
    for sector in begin..end {
        set_bit(bitmap, sector);
    }
}

pub(crate) fn range_bitmap(bitmap_size: usize, begin: u32, end: u32) -> Vec<u8> {
    let mut bitmap = vec![0u8; bitmap_size];
    set_range(&mut bitmap, begin, end);
    bitmap
}

/// Maximal runs `[begin, end)` of set bits among the first `sectors` bits.
pub fn sector_runs(bitmap: &[u8], sectors: u32) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut sector = 0;
    while sector < sectors {
        if !test_bit(bitmap, sector) {
            sector += 1;
            continue;
        }
        let begin = sector;
        while sector < sectors && test_bit(bitmap, sector) {
            sector += 1;
        }
        runs.push((begin, sector));
    }
    runs
}

/// Length in sectors of the run starting at `sector` whose bits all equal `value`, capped at
/// `limit` sectors.
pub(crate) fn run_len(bitmap: &[u8], sector: u32, limit: u32, value: bool) -> u32 {
    let mut end = sector;
    while end < limit && test_bit(bitmap, end) == value {
        end += 1;
    }
    end - sector
}
