use crate::util::{be_u16, be_u32, be_u64, checksum, put_u16, put_u32, put_u64};
use crate::{Result, VhdError, FOOTER_SIZE, SECTOR_SIZE};

pub(crate) const FOOTER_COOKIE: [u8; 8] = *b"conectix";
pub(crate) const FILE_FORMAT_VERSION: u32 = 0x0001_0000;
const CHECKSUM_OFFSET: usize = 64;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

impl DiskType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(Self::Fixed),
            3 => Some(Self::Dynamic),
            4 => Some(Self::Differencing),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Fixed => 2,
            Self::Dynamic => 3,
            Self::Differencing => 4,
        }
    }

    /// Dynamic and differencing disks share the sparse layout (header + BAT + blocks).
    pub fn is_sparse(self) -> bool {
        !matches!(self, Self::Fixed)
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

/// The 512-byte VHD footer (also copied at offset 0 of sparse disks).
///
/// Reserved bytes are kept as read so that re-encoding an unmodified footer reproduces the
/// exact on-disk bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footer {
    pub features: u32,
    pub file_format_version: u32,
    /// Offset of the dynamic header; `u64::MAX` for fixed disks.
    pub data_offset: u64,
    /// Seconds since 2000-01-01T00:00:00Z.
    pub timestamp: u32,
    pub creator_application: [u8; 4],
    pub creator_version: u32,
    pub creator_host_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    pub disk_type: DiskType,
    pub checksum: u32,
    pub uuid: [u8; 16],
    pub saved_state: u8,
    raw: [u8; FOOTER_SIZE],
}

impl Footer {
    pub(crate) fn new(
        disk_type: DiskType,
        size: u64,
        data_offset: u64,
        uuid: [u8; 16],
        timestamp: u32,
        geometry: DiskGeometry,
    ) -> Self {
        let mut raw = [0u8; FOOTER_SIZE];
        raw[..8].copy_from_slice(&FOOTER_COOKIE);
        let mut footer = Self {
            features: 2,
            file_format_version: FILE_FORMAT_VERSION,
            data_offset,
            timestamp,
            creator_application: *b"dbak",
            creator_version: 0x0001_0000,
            // "Wi2k"
            creator_host_os: 0x5769_326B,
            original_size: size,
            current_size: size,
            geometry,
            disk_type,
            checksum: 0,
            uuid,
            saved_state: 0,
            raw,
        };
        footer.checksum = footer.compute_checksum();
        footer
    }

    pub fn parse(raw: &[u8; FOOTER_SIZE]) -> Result<Self> {
        if raw[..8] != FOOTER_COOKIE {
            return Err(VhdError::CorruptFormat("vhd footer cookie mismatch"));
        }

        let expected = be_u32(&raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4]);
        if expected != checksum(raw, CHECKSUM_OFFSET) {
            return Err(VhdError::CorruptFormat("vhd footer checksum mismatch"));
        }

        let disk_type = DiskType::from_u32(be_u32(&raw[60..64]))
            .ok_or(VhdError::CorruptFormat("vhd disk type"))?;

        let current_size = be_u64(&raw[48..56]);
        if current_size == 0 || !current_size.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd current_size invalid"));
        }

        let mut creator_application = [0u8; 4];
        creator_application.copy_from_slice(&raw[28..32]);
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&raw[68..84]);

        Ok(Self {
            features: be_u32(&raw[8..12]),
            file_format_version: be_u32(&raw[12..16]),
            data_offset: be_u64(&raw[16..24]),
            timestamp: be_u32(&raw[24..28]),
            creator_application,
            creator_version: be_u32(&raw[32..36]),
            creator_host_os: be_u32(&raw[36..40]),
            original_size: be_u64(&raw[40..48]),
            current_size,
            geometry: DiskGeometry {
                cylinders: be_u16(&raw[56..58]),
                heads: raw[58],
                sectors_per_track: raw[59],
            },
            disk_type,
            checksum: expected,
            uuid,
            saved_state: raw[84],
            raw: *raw,
        })
    }

    fn encode_fields(&self) -> [u8; FOOTER_SIZE] {
        let mut raw = self.raw;
        raw[..8].copy_from_slice(&FOOTER_COOKIE);
        put_u32(&mut raw, 8, self.features);
        put_u32(&mut raw, 12, self.file_format_version);
        put_u64(&mut raw, 16, self.data_offset);
        put_u32(&mut raw, 24, self.timestamp);
        raw[28..32].copy_from_slice(&self.creator_application);
        put_u32(&mut raw, 32, self.creator_version);
        put_u32(&mut raw, 36, self.creator_host_os);
        put_u64(&mut raw, 40, self.original_size);
        put_u64(&mut raw, 48, self.current_size);
        put_u16(&mut raw, 56, self.geometry.cylinders);
        raw[58] = self.geometry.heads;
        raw[59] = self.geometry.sectors_per_track;
        put_u32(&mut raw, 60, self.disk_type.as_u32());
        raw[68..84].copy_from_slice(&self.uuid);
        raw[84] = self.saved_state;
        raw
    }

    pub fn compute_checksum(&self) -> u32 {
        checksum(&self.encode_fields(), CHECKSUM_OFFSET)
    }

    /// Encode the footer, refreshing [`Footer::checksum`] first.
    pub fn to_bytes(&mut self) -> [u8; FOOTER_SIZE] {
        let mut raw = self.encode_fields();
        self.checksum = checksum(&raw, CHECKSUM_OFFSET);
        put_u32(&mut raw, CHECKSUM_OFFSET, self.checksum);
        self.raw = raw;
        raw
    }

    /// Copy the identity of another disk (size, geometry, timestamp, uuid). Used when a parent
    /// absorbs its child during a merge.
    pub fn assume_identity_of(&mut self, other: &Footer) {
        self.current_size = other.current_size;
        self.original_size = other.original_size;
        self.geometry = other.geometry;
        self.timestamp = other.timestamp;
        self.uuid = other.uuid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Footer {
        Footer::new(
            DiskType::Dynamic,
            64 * 1024,
            512,
            [7u8; 16],
            1234,
            DiskGeometry {
                cylinders: 4,
                heads: 4,
                sectors_per_track: 17,
            },
        )
    }

    #[test]
    fn encode_parse_reproduces_bytes() {
        let mut footer = sample();
        let raw = footer.to_bytes();
        let mut parsed = Footer::parse(&raw).unwrap();
        assert_eq!(parsed.uuid, [7u8; 16]);
        assert_eq!(parsed.disk_type, DiskType::Dynamic);
        assert_eq!(parsed.to_bytes(), raw);
    }

    #[test]
    fn reserved_bytes_survive_reencoding() {
        let mut footer = sample();
        let mut raw = footer.to_bytes();
        raw[200] = 0xAB;
        let sum = checksum(&raw, CHECKSUM_OFFSET);
        raw[64..68].copy_from_slice(&sum.to_be_bytes());

        let mut parsed = Footer::parse(&raw).unwrap();
        assert_eq!(parsed.to_bytes(), raw);
    }

    #[test]
    fn rejects_bad_cookie_and_checksum() {
        let mut footer = sample();
        let raw = footer.to_bytes();

        let mut bad_cookie = raw;
        bad_cookie[0] = b'x';
        assert!(matches!(
            Footer::parse(&bad_cookie),
            Err(VhdError::CorruptFormat("vhd footer cookie mismatch"))
        ));

        let mut bad_sum = raw;
        bad_sum[100] ^= 1;
        assert!(matches!(
            Footer::parse(&bad_sum),
            Err(VhdError::CorruptFormat("vhd footer checksum mismatch"))
        ));
    }
}
