use crate::{Result, VhdError, SECTOR_SIZE};

pub fn align_up_u64(value: u64, alignment: u64) -> Result<u64> {
    if alignment == 0 {
        return Err(VhdError::OffsetOverflow);
    }
    let rem = value % alignment;
    if rem == 0 {
        return Ok(value);
    }
    value
        .checked_add(alignment - rem)
        .ok_or(VhdError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(VhdError::OffsetOverflow)?;
    if end > capacity {
        return Err(VhdError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

pub fn sectors_to_bytes(sectors: u64) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(VhdError::OffsetOverflow)
}

/// On-disk size of a BAT holding `entries` entries (padded to a sector).
pub fn bat_size(entries: u32) -> Result<u64> {
    align_up_u64(entries as u64 * 4, SECTOR_SIZE as u64)
}

/// One's complement of the byte sum, skipping the 4-byte checksum field at `checksum_at`.
pub fn checksum(raw: &[u8], checksum_at: usize) -> u32 {
    let mut sum: u32 = 0;
    for (i, b) in raw.iter().enumerate() {
        if (checksum_at..checksum_at + 4).contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(*b as u32);
    }
    !sum
}

pub fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

pub fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn be_u64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}
