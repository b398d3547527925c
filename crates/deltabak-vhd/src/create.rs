use deltabak_fs::FileHandle;
use tracing::debug;
use uuid::Uuid;

use crate::util::bat_size;
use crate::{
    compute_geometry, timestamp_now, DiskType, Footer, Header, Result, VhdError, VhdFile,
    DEFAULT_BLOCK_SIZE, FOOTER_SIZE, HEADER_SIZE, SECTOR_SIZE,
};

/// Parameters of a new disk.
#[derive(Clone, Copy, Debug)]
pub struct CreateOptions {
    /// Virtual size in bytes; a non-zero multiple of 512.
    pub size: u64,
    pub block_size: u32,
    /// Random when unset.
    pub uuid: Option<[u8; 16]>,
    /// Current time when unset.
    pub timestamp: Option<u32>,
}

impl CreateOptions {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            uuid: None,
            timestamp: None,
        }
    }

    fn footer(&self, disk_type: DiskType, data_offset: u64) -> Footer {
        Footer::new(
            disk_type,
            self.size,
            data_offset,
            self.uuid.unwrap_or_else(|| *Uuid::new_v4().as_bytes()),
            self.timestamp.unwrap_or_else(timestamp_now),
            compute_geometry(self.size),
        )
    }
}

fn check_size(size: u64) -> Result<()> {
    if size == 0 || !size.is_multiple_of(SECTOR_SIZE as u64) {
        return Err(VhdError::InvalidArgument("disk size must be a non-zero multiple of 512"));
    }
    Ok(())
}

/// Write an empty dynamic disk into `file`, replacing its content.
///
/// Layout: footer copy, dynamic header, BAT, footer.
pub async fn create_dynamic<F: FileHandle>(mut file: F, options: CreateOptions) -> Result<VhdFile<F>> {
    check_size(options.size)?;
    if options.block_size == 0 || !(options.block_size as u64).is_multiple_of(SECTOR_SIZE as u64) {
        return Err(VhdError::InvalidArgument("block size must be a non-zero multiple of 512"));
    }
    let entries = u32::try_from(options.size.div_ceil(options.block_size as u64))
        .map_err(|_| VhdError::InvalidArgument("disk too large for block size"))?;

    let header_offset = FOOTER_SIZE as u64;
    let table_offset = header_offset + HEADER_SIZE as u64;
    let table_bytes = bat_size(entries)?;

    let mut footer = options.footer(DiskType::Dynamic, header_offset);
    let mut header = Header::new(table_offset, entries, options.block_size);
    let raw_footer = footer.to_bytes();

    file.set_len(0).await?;
    file.write_at(0, &raw_footer).await?;
    file.write_at(header_offset, &header.to_bytes()?).await?;
    file.write_at(table_offset, &vec![0xFFu8; table_bytes as usize])
        .await?;
    file.write_at(table_offset + table_bytes, &raw_footer).await?;

    debug!(size = options.size, block_size = options.block_size, "created dynamic vhd");
    VhdFile::open(file).await
}

/// Write a zero-filled fixed disk into `file`, replacing its content.
pub async fn create_fixed<F: FileHandle>(mut file: F, options: CreateOptions) -> Result<VhdFile<F>> {
    check_size(options.size)?;
    let mut footer = options.footer(DiskType::Fixed, u64::MAX);

    file.set_len(0).await?;
    file.set_len(options.size).await?;
    file.write_at(options.size, &footer.to_bytes()).await?;

    debug!(size = options.size, "created fixed vhd");
    VhdFile::open(file).await
}

impl<F: FileHandle> VhdFile<F> {
    /// Turn this sparse disk into a differencing child of the disk described by `parent`.
    ///
    /// `parent_name` is the parent's path relative to this disk's directory.
    pub async fn set_parent(&mut self, parent: &Footer, parent_name: &str) -> Result<()> {
        if parent_name.is_empty() {
            return Err(VhdError::InvalidArgument("empty parent name"));
        }
        let header = self
            .header
            .as_mut()
            .ok_or(VhdError::Unsupported("vhd is not dynamic"))?;
        header.parent_uuid = parent.uuid;
        header.parent_timestamp = parent.timestamp;
        header.parent_unicode_name = parent_name.to_string();
        self.write_header().await?;

        self.footer.disk_type = DiskType::Differencing;
        self.write_footer(false).await
    }
}

#[cfg(test)]
mod tests {
    use deltabak_fs::MemFile;

    use super::*;

    #[tokio::test]
    async fn dynamic_layout() {
        let mut options = CreateOptions::new(10 * 1024 * 1024);
        options.uuid = Some([3u8; 16]);
        let vhd = create_dynamic(MemFile::detached(), options).await.unwrap();

        assert_eq!(vhd.disk_type(), DiskType::Dynamic);
        assert_eq!(vhd.footer().uuid, [3u8; 16]);
        assert_eq!(vhd.bat().len(), 5);
        assert_eq!(vhd.end_of_data(), 2048);

        let raw = vhd.into_inner().contents();
        assert_eq!(raw.len(), 2560);
        assert_eq!(&raw[..8], b"conectix");
        assert_eq!(&raw[512..520], b"cxsparse");
        assert!(raw[1536..2048].iter().all(|b| *b == 0xFF));
        assert_eq!(raw[..512], raw[2048..]);
    }

    #[tokio::test]
    async fn fixed_disk_reads_back_zeroes() {
        let mut vhd = create_fixed(MemFile::detached(), CreateOptions::new(64 * 1024))
            .await
            .unwrap();
        assert!(vhd.header().is_none());
        vhd.write_data(2, &[5u8; 512]).await.unwrap();

        let mut buf = vec![0xFFu8; 2048];
        vhd.read_at(0, &mut buf).await.unwrap();
        assert!(buf[..1024].iter().all(|b| *b == 0));
        assert!(buf[1024..1536].iter().all(|b| *b == 5));
        assert!(buf[1536..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn set_parent_makes_a_differencing_disk() {
        let parent = create_dynamic(MemFile::detached(), CreateOptions::new(1024 * 1024))
            .await
            .unwrap();
        let mut child = create_dynamic(MemFile::detached(), CreateOptions::new(1024 * 1024))
            .await
            .unwrap();
        child
            .set_parent(parent.footer(), "parent.vhd")
            .await
            .unwrap();

        let reopened = VhdFile::open(child.into_inner()).await.unwrap();
        assert_eq!(reopened.disk_type(), DiskType::Differencing);
        let header = reopened.header().unwrap();
        assert_eq!(header.parent_uuid, parent.footer().uuid);
        assert_eq!(header.parent_unicode_name, "parent.vhd");
    }

    #[tokio::test]
    async fn rejects_unaligned_size() {
        assert!(matches!(
            create_dynamic(MemFile::detached(), CreateOptions::new(1000)).await,
            Err(VhdError::InvalidArgument(_))
        ));
    }
}
