use crate::util::{be_u32, be_u64, checksum, put_u32, put_u64};
use crate::{Result, VhdError, HEADER_SIZE, SECTOR_SIZE};

pub(crate) const HEADER_COOKIE: [u8; 8] = *b"cxsparse";
pub(crate) const HEADER_VERSION: u32 = 0x0001_0000;
const CHECKSUM_OFFSET: usize = 36;
const PARENT_NAME_OFFSET: usize = 64;
const PARENT_NAME_SIZE: usize = 512;
const LOCATORS_OFFSET: usize = 576;
const LOCATOR_SIZE: usize = 24;
const LOCATOR_COUNT: usize = 8;

/// One of the eight parent locator slots of a differencing disk.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ParentLocator {
    pub platform_code: u32,
    pub platform_data_space: u32,
    pub platform_data_length: u32,
    pub platform_data_offset: u64,
}

/// The 1024-byte dynamic disk header (`cxsparse`) of dynamic and differencing disks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_uuid: [u8; 16],
    pub parent_timestamp: u32,
    /// Path of the parent, relative to the directory of this disk. Empty for dynamic disks.
    pub parent_unicode_name: String,
    pub parent_locators: [ParentLocator; LOCATOR_COUNT],
    raw: [u8; HEADER_SIZE],
}

impl Header {
    pub(crate) fn new(table_offset: u64, max_table_entries: u32, block_size: u32) -> Self {
        let mut raw = [0u8; HEADER_SIZE];
        raw[..8].copy_from_slice(&HEADER_COOKIE);
        let mut header = Self {
            data_offset: u64::MAX,
            table_offset,
            header_version: HEADER_VERSION,
            max_table_entries,
            block_size,
            checksum: 0,
            parent_uuid: [0u8; 16],
            parent_timestamp: 0,
            parent_unicode_name: String::new(),
            parent_locators: [ParentLocator::default(); LOCATOR_COUNT],
            raw,
        };
        header.checksum = header.compute_checksum();
        header
    }

    pub fn parse(raw: &[u8; HEADER_SIZE]) -> Result<Self> {
        if raw[..8] != HEADER_COOKIE {
            return Err(VhdError::CorruptFormat("vhd dynamic header cookie mismatch"));
        }

        let expected = be_u32(&raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        if expected != checksum(raw, CHECKSUM_OFFSET) {
            return Err(VhdError::CorruptFormat("vhd dynamic header checksum mismatch"));
        }

        let table_offset = be_u64(&raw[16..24]);
        let max_table_entries = be_u32(&raw[28..32]);
        let block_size = be_u32(&raw[32..36]);

        if !table_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd bat offset misaligned"));
        }
        if max_table_entries == 0 {
            return Err(VhdError::CorruptFormat("vhd max_table_entries is zero"));
        }
        if block_size == 0 || !(block_size as u64).is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd block_size invalid"));
        }

        let mut parent_uuid = [0u8; 16];
        parent_uuid.copy_from_slice(&raw[40..56]);

        let mut parent_locators = [ParentLocator::default(); LOCATOR_COUNT];
        for (i, locator) in parent_locators.iter_mut().enumerate() {
            let at = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            *locator = ParentLocator {
                platform_code: be_u32(&raw[at..at + 4]),
                platform_data_space: be_u32(&raw[at + 4..at + 8]),
                platform_data_length: be_u32(&raw[at + 8..at + 12]),
                platform_data_offset: be_u64(&raw[at + 16..at + 24]),
            };
        }

        Ok(Self {
            data_offset: be_u64(&raw[8..16]),
            table_offset,
            header_version: be_u32(&raw[24..28]),
            max_table_entries,
            block_size,
            checksum: expected,
            parent_uuid,
            parent_timestamp: be_u32(&raw[56..60]),
            parent_unicode_name: decode_parent_name(
                &raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_SIZE],
            )?,
            parent_locators,
            raw: *raw,
        })
    }

    fn encode_fields(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut raw = self.raw;
        raw[..8].copy_from_slice(&HEADER_COOKIE);
        put_u64(&mut raw, 8, self.data_offset);
        put_u64(&mut raw, 16, self.table_offset);
        put_u32(&mut raw, 24, self.header_version);
        put_u32(&mut raw, 28, self.max_table_entries);
        put_u32(&mut raw, 32, self.block_size);
        raw[40..56].copy_from_slice(&self.parent_uuid);
        put_u32(&mut raw, 56, self.parent_timestamp);
        encode_parent_name(
            &self.parent_unicode_name,
            &mut raw[PARENT_NAME_OFFSET..PARENT_NAME_OFFSET + PARENT_NAME_SIZE],
        )?;
        for (i, locator) in self.parent_locators.iter().enumerate() {
            let at = LOCATORS_OFFSET + i * LOCATOR_SIZE;
            put_u32(&mut raw, at, locator.platform_code);
            put_u32(&mut raw, at + 4, locator.platform_data_space);
            put_u32(&mut raw, at + 8, locator.platform_data_length);
            put_u64(&mut raw, at + 16, locator.platform_data_offset);
        }
        Ok(raw)
    }

    pub fn compute_checksum(&self) -> u32 {
        // Only an over-long parent name can fail to encode; such a header is never written.
        match self.encode_fields() {
            Ok(raw) => checksum(&raw, CHECKSUM_OFFSET),
            Err(_) => 0,
        }
    }

    /// Encode the header, refreshing [`Header::checksum`] first.
    pub fn to_bytes(&mut self) -> Result<[u8; HEADER_SIZE]> {
        let mut raw = self.encode_fields()?;
        self.checksum = checksum(&raw, CHECKSUM_OFFSET);
        put_u32(&mut raw, CHECKSUM_OFFSET, self.checksum);
        self.raw = raw;
        Ok(raw)
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.block_size / SECTOR_SIZE as u32
    }

    /// Size of the sector bitmap preceding each block, padded to a sector.
    pub fn bitmap_size(&self) -> u64 {
        let bytes = (self.sectors_per_block() as u64).div_ceil(8);
        bytes.div_ceil(SECTOR_SIZE as u64) * SECTOR_SIZE as u64
    }

    /// Bitmap plus data.
    pub fn full_block_size(&self) -> u64 {
        self.bitmap_size() + self.block_size as u64
    }
}

fn decode_parent_name(raw: &[u8]) -> Result<String> {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16(&units).map_err(|_| VhdError::CorruptFormat("vhd parent name is not utf-16"))
}

fn encode_parent_name(name: &str, out: &mut [u8]) -> Result<()> {
    out.fill(0);
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() * 2 > out.len() {
        return Err(VhdError::InvalidArgument("vhd parent name too long"));
    }
    for (i, unit) in units.iter().enumerate() {
        out[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_name_roundtrips_as_utf16_be() {
        let mut header = Header::new(1536, 4, 2 * 1024 * 1024);
        header.parent_unicode_name = "../base/20240101T000000Z.vhd".to_string();
        let raw = header.to_bytes().unwrap();
        assert_eq!(&raw[64..68], &[0, b'.', 0, b'.']);

        let parsed = Header::parse(&raw).unwrap();
        assert_eq!(parsed.parent_unicode_name, "../base/20240101T000000Z.vhd");
        assert_eq!(parsed.max_table_entries, 4);
    }

    #[test]
    fn overlong_parent_name_is_rejected() {
        let mut header = Header::new(1536, 4, 2 * 1024 * 1024);
        header.parent_unicode_name = "x".repeat(257);
        assert!(matches!(
            header.to_bytes(),
            Err(VhdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn block_geometry() {
        let header = Header::new(1536, 4, 2 * 1024 * 1024);
        assert_eq!(header.sectors_per_block(), 4096);
        assert_eq!(header.bitmap_size(), 512);
        assert_eq!(header.full_block_size(), 512 + 2 * 1024 * 1024);

        let small = Header::new(1536, 4, 16 * 1024);
        assert_eq!(small.sectors_per_block(), 32);
        assert_eq!(small.bitmap_size(), 512);
    }

    #[test]
    fn rejects_corrupted_header() {
        let mut header = Header::new(1536, 4, 2 * 1024 * 1024);
        let mut raw = header.to_bytes().unwrap();
        raw[30] ^= 0xFF;
        assert!(matches!(
            Header::parse(&raw),
            Err(VhdError::CorruptFormat("vhd dynamic header checksum mismatch"))
        ));
    }
}
