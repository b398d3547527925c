use std::num::NonZeroUsize;

use deltabak_fs::{BoxedFile, FileHandle, FsError, Handler, OpenMode};
use lru::LruCache;
use tracing::warn;

use crate::bitmap::{run_len, test_bit};
use crate::util::{align_up_u64, bat_size, be_u32, checked_range, sectors_to_bytes};
use crate::{
    DiskType, Footer, Header, Result, VhdError, BLOCK_UNUSED, FOOTER_SIZE, HEADER_SIZE,
    SECTOR_SIZE,
};

// Hard caps to avoid absurd allocations from untrusted images.
pub(crate) const MAX_BAT_BYTES: u64 = 128 * 1024 * 1024; // 128 MiB
const MAX_BITMAP_BYTES: u64 = 32 * 1024 * 1024; // 32 MiB
const MAX_BLOCK_BYTES: u64 = 64 * 1024 * 1024; // 64 MiB

// Bound bitmap caching when walking large fully-allocated disks.
const BITMAP_CACHE_BUDGET_BYTES: u64 = 16 * 1024 * 1024; // 16 MiB

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    /// Also require the trailing footer of a sparse disk to match its leading copy.
    pub check_secondary_footer: bool,
}

/// One block of a sparse disk: its sector bitmap and `block_size` bytes of data.
///
/// Sectors whose bitmap bit is clear hold unspecified bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub id: u32,
    pub bitmap: Vec<u8>,
    pub data: Vec<u8>,
}

/// An open VHD (fixed, dynamic or differencing).
pub struct VhdFile<F> {
    pub(crate) file: F,
    pub(crate) footer: Footer,
    pub(crate) header: Option<Header>,
    pub(crate) bat: Vec<u32>,
    pub(crate) bitmap_cache: LruCache<u32, Vec<u8>>,
    /// First byte past the last block (or past the metadata when no block is allocated).
    pub(crate) end_of_data: u64,
}

impl<F: FileHandle> VhdFile<F> {
    pub async fn open(file: F) -> Result<Self> {
        Self::open_with(file, OpenOptions::default()).await
    }

    pub async fn open_with(mut file: F, options: OpenOptions) -> Result<Self> {
        let len = file.len().await?;
        if len < SECTOR_SIZE as u64 {
            return Err(VhdError::CorruptFormat("vhd file too small"));
        }
        if !len.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd file length misaligned"));
        }

        let footer = read_footers(&mut file, len, options).await?;

        if footer.disk_type == DiskType::Fixed {
            let required_len = footer
                .current_size
                .checked_add(FOOTER_SIZE as u64)
                .ok_or(VhdError::CorruptFormat("vhd current_size overflow"))?;
            if len < required_len {
                return Err(VhdError::CorruptFormat("vhd fixed disk truncated"));
            }
            return Ok(Self {
                file,
                footer,
                header: None,
                bat: Vec::new(),
                bitmap_cache: LruCache::new(NonZeroUsize::MIN),
                end_of_data: required_len - FOOTER_SIZE as u64,
            });
        }

        if footer.data_offset == u64::MAX {
            return Err(VhdError::CorruptFormat("vhd dynamic header offset invalid"));
        }
        if !footer.data_offset.is_multiple_of(SECTOR_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd dynamic header offset misaligned"));
        }
        if footer.data_offset < FOOTER_SIZE as u64 {
            return Err(VhdError::CorruptFormat("vhd dynamic header overlaps footer copy"));
        }
        let footer_offset = len - FOOTER_SIZE as u64;
        let header_end = footer
            .data_offset
            .checked_add(HEADER_SIZE as u64)
            .ok_or(VhdError::OffsetOverflow)?;
        if header_end > footer_offset {
            return Err(VhdError::CorruptFormat("vhd dynamic header truncated"));
        }

        let mut raw_header = [0u8; HEADER_SIZE];
        read_or_corrupt(
            &mut file,
            footer.data_offset,
            &mut raw_header,
            "vhd dynamic header truncated",
        )
        .await?;
        let header = Header::parse(&raw_header)?;

        if footer.disk_type == DiskType::Differencing && header.parent_unicode_name.is_empty() {
            return Err(VhdError::CorruptFormat(
                "vhd differencing disk without parent name",
            ));
        }

        let required_entries = footer.current_size.div_ceil(header.block_size as u64);
        if (header.max_table_entries as u64) < required_entries {
            return Err(VhdError::CorruptFormat("vhd bat too small"));
        }

        let bat_bytes = bat_size(header.max_table_entries)?;
        if bat_bytes > MAX_BAT_BYTES {
            return Err(VhdError::Unsupported("vhd bat too large"));
        }
        if header.table_offset < FOOTER_SIZE as u64 {
            return Err(VhdError::CorruptFormat("vhd bat overlaps footer copy"));
        }
        let bat_end = header
            .table_offset
            .checked_add(bat_bytes)
            .ok_or(VhdError::OffsetOverflow)?;
        if bat_end > footer_offset {
            return Err(VhdError::CorruptFormat("vhd bat truncated"));
        }
        if header.table_offset < header_end && footer.data_offset < bat_end {
            return Err(VhdError::CorruptFormat("vhd bat overlaps dynamic header"));
        }
        if header.bitmap_size() > MAX_BITMAP_BYTES {
            return Err(VhdError::Unsupported("vhd bitmap too large"));
        }
        if header.block_size as u64 > MAX_BLOCK_BYTES {
            return Err(VhdError::Unsupported("vhd block size too large"));
        }

        let mut bat_buf = vec![0u8; header.max_table_entries as usize * 4];
        read_or_corrupt(&mut file, header.table_offset, &mut bat_buf, "vhd bat truncated").await?;
        let bat: Vec<u32> = bat_buf.chunks_exact(4).map(be_u32).collect();

        let cap_entries = (BITMAP_CACHE_BUDGET_BYTES / header.bitmap_size()).max(1) as usize;
        let cap = NonZeroUsize::new(cap_entries).ok_or(VhdError::InvalidArgument("vhd cache"))?;

        let mut end_of_data = end_of_headers(&footer, &header)?;
        for &entry in bat.iter().filter(|entry| **entry != BLOCK_UNUSED) {
            let block_end = sectors_to_bytes(entry as u64)?
                .checked_add(header.full_block_size())
                .ok_or(VhdError::OffsetOverflow)?;
            end_of_data = end_of_data.max(block_end);
        }

        Ok(Self {
            file,
            footer,
            header: Some(header),
            bat,
            bitmap_cache: LruCache::new(cap),
            end_of_data,
        })
    }

    pub fn footer(&self) -> &Footer {
        &self.footer
    }

    pub fn footer_mut(&mut self) -> &mut Footer {
        &mut self.footer
    }

    /// Dynamic header; `None` for fixed disks.
    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn header_mut(&mut self) -> Option<&mut Header> {
        self.header.as_mut()
    }

    pub fn disk_type(&self) -> DiskType {
        self.footer.disk_type
    }

    pub fn capacity(&self) -> u64 {
        self.footer.current_size
    }

    pub fn bat(&self) -> &[u32] {
        &self.bat
    }

    pub fn into_inner(self) -> F {
        self.file
    }

    pub async fn sync(&mut self) -> Result<()> {
        Ok(self.file.sync_all().await?)
    }

    pub(crate) fn sparse(&self) -> Result<&Header> {
        self.header
            .as_ref()
            .ok_or(VhdError::Unsupported("vhd is not dynamic"))
    }

    pub fn block_size(&self) -> Result<u32> {
        Ok(self.sparse()?.block_size)
    }

    pub fn sectors_per_block(&self) -> Result<u32> {
        Ok(self.sparse()?.sectors_per_block())
    }

    pub fn bitmap_size(&self) -> Result<u64> {
        Ok(self.sparse()?.bitmap_size())
    }

    pub fn full_block_size(&self) -> Result<u64> {
        Ok(self.sparse()?.full_block_size())
    }

    pub fn contains_block(&self, block: u32) -> bool {
        self.bat
            .get(block as usize)
            .is_some_and(|entry| *entry != BLOCK_UNUSED)
    }

    /// Ids of every allocated block, in logical order.
    pub fn allocated_blocks(&self) -> Vec<u32> {
        self.bat
            .iter()
            .enumerate()
            .filter(|(_, entry)| **entry != BLOCK_UNUSED)
            .map(|(id, _)| id as u32)
            .collect()
    }

    /// First byte after the footer copy, dynamic header, BAT and parent locators.
    pub fn end_of_headers(&self) -> Result<u64> {
        end_of_headers(&self.footer, self.sparse()?)
    }

    pub fn end_of_data(&self) -> u64 {
        self.end_of_data
    }

    /// Byte offset of `block` (its bitmap) in the file.
    pub(crate) fn block_offset(&self, block: u32) -> Result<u64> {
        match self.bat.get(block as usize) {
            Some(&entry) if entry != BLOCK_UNUSED => sectors_to_bytes(entry as u64),
            _ => Err(VhdError::BlockNotAllocated(block)),
        }
    }

    pub(crate) async fn validate_block_bounds(&mut self, block_start: u64) -> Result<()> {
        let full_block_size = self.full_block_size()?;
        if block_start < self.end_of_headers()? {
            return Err(VhdError::CorruptFormat("vhd block overlaps metadata"));
        }
        let file_len = self.file.len().await?;
        let block_end = block_start
            .checked_add(full_block_size)
            .ok_or(VhdError::OffsetOverflow)?;
        if block_end > file_len.saturating_sub(FOOTER_SIZE as u64) {
            return Err(VhdError::CorruptFormat("vhd block overlaps footer"));
        }
        Ok(())
    }

    pub async fn read_block_bitmap(&mut self, block: u32) -> Result<Vec<u8>> {
        if let Some(bitmap) = self.bitmap_cache.get(&block) {
            return Ok(bitmap.clone());
        }
        let block_start = self.block_offset(block)?;
        self.validate_block_bounds(block_start).await?;
        let mut bitmap = vec![0u8; self.bitmap_size()? as usize];
        read_or_corrupt(
            &mut self.file,
            block_start,
            &mut bitmap,
            "vhd block bitmap truncated",
        )
        .await?;
        self.bitmap_cache.put(block, bitmap.clone());
        Ok(bitmap)
    }

    /// Bitmap and data of `block`, or `None` when the block was never written.
    pub async fn read_block(&mut self, block: u32) -> Result<Option<Block>> {
        if !self.contains_block(block) {
            return Ok(None);
        }
        let bitmap = self.read_block_bitmap(block).await?;
        let data_start = self
            .block_offset(block)?
            .checked_add(self.bitmap_size()?)
            .ok_or(VhdError::OffsetOverflow)?;
        let mut data = vec![0u8; self.block_size()? as usize];
        read_or_corrupt(&mut self.file, data_start, &mut data, "vhd block data truncated").await?;
        Ok(Some(Block {
            id: block,
            bitmap,
            data,
        }))
    }

    /// Read the virtual content stored in this file alone. Sectors this file does not hold
    /// read as zero.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.header.is_some() {
            buf.fill(0);
        }
        self.overlay_at(offset, buf).await
    }

    /// Copy into `buf` only the sectors this file holds, leaving the others untouched.
    ///
    /// Applying `overlay_at` from the root of a chain to its leaf yields the leaf's view.
    pub async fn overlay_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.capacity())?;

        if self.header.is_none() {
            return read_or_corrupt(&mut self.file, offset, buf, "vhd fixed disk truncated").await;
        }

        let block_size = self.block_size()? as u64;
        let sectors_per_block = self.sectors_per_block()?;
        let bitmap_size = self.bitmap_size()?;

        let mut pos = 0usize;
        while pos < buf.len() {
            let abs = offset + pos as u64;
            let block = u32::try_from(abs / block_size).map_err(|_| VhdError::OffsetOverflow)?;
            let within = abs % block_size;
            let chunk = (buf.len() - pos).min((block_size - within) as usize);

            if self.contains_block(block) {
                let bitmap = self.read_block_bitmap(block).await?;
                let data_start = self.block_offset(block)? + bitmap_size;

                let mut done = 0usize;
                while done < chunk {
                    let byte_in_block = within + done as u64;
                    let sector = (byte_in_block / SECTOR_SIZE as u64) as u32;
                    let valid = test_bit(&bitmap, sector);
                    let run = run_len(&bitmap, sector, sectors_per_block, valid).max(1);
                    let run_end = sectors_to_bytes((sector + run) as u64)?;
                    let len = ((run_end - byte_in_block) as usize).min(chunk - done);
                    if valid {
                        let dst = &mut buf[pos + done..pos + done + len];
                        read_or_corrupt(
                            &mut self.file,
                            data_start + byte_in_block,
                            dst,
                            "vhd block data truncated",
                        )
                        .await?;
                    }
                    done += len;
                }
            }

            pos += chunk;
        }
        Ok(())
    }
}

/// Open the VHD at `path` through `handler`.
///
/// A missing file is reported as not found in every mode; [`OpenMode::ReadWrite`] never
/// creates it.
pub async fn open_vhd(
    handler: &dyn Handler,
    path: &str,
    mode: OpenMode,
) -> Result<VhdFile<BoxedFile>> {
    open_vhd_with(handler, path, mode, OpenOptions::default()).await
}

pub async fn open_vhd_with(
    handler: &dyn Handler,
    path: &str,
    mode: OpenMode,
    options: OpenOptions,
) -> Result<VhdFile<BoxedFile>> {
    if mode == OpenMode::ReadWrite {
        handler.get_size(path).await?;
    }
    let file = handler.open_file(path, mode).await?;
    VhdFile::open_with(file, options).await
}

async fn read_footers<F: FileHandle>(file: &mut F, len: u64, options: OpenOptions) -> Result<Footer> {
    let mut raw = [0u8; FOOTER_SIZE];
    read_or_corrupt(file, len - FOOTER_SIZE as u64, &mut raw, "vhd footer truncated").await?;
    let trailing = Footer::parse(&raw);

    read_or_corrupt(file, 0, &mut raw, "vhd footer truncated").await?;
    let leading = Footer::parse(&raw);

    match (leading, trailing) {
        // The first sector of a fixed disk is guest data, even when it looks like a footer.
        (Ok(leading), Ok(trailing)) if leading.disk_type.is_sparse() => {
            if options.check_secondary_footer && leading != trailing {
                return Err(VhdError::CorruptFormat("vhd trailing footer mismatch"));
            }
            Ok(leading)
        }
        (Ok(leading), Err(err)) if leading.disk_type.is_sparse() => {
            if options.check_secondary_footer {
                return Err(err);
            }
            Ok(leading)
        }
        (_, Ok(trailing)) => {
            if trailing.disk_type.is_sparse() {
                warn!("vhd leading footer unreadable, using trailing copy");
            }
            Ok(trailing)
        }
        (_, Err(err)) => Err(err),
    }
}

pub(crate) fn end_of_headers(footer: &Footer, header: &Header) -> Result<u64> {
    let mut end = (FOOTER_SIZE as u64).max(
        footer
            .data_offset
            .checked_add(HEADER_SIZE as u64)
            .ok_or(VhdError::OffsetOverflow)?,
    );
    let bat_end = header
        .table_offset
        .checked_add(bat_size(header.max_table_entries)?)
        .ok_or(VhdError::OffsetOverflow)?;
    end = end.max(bat_end);

    for locator in header.parent_locators.iter().filter(|l| l.platform_code != 0) {
        let locator_end = locator
            .platform_data_offset
            .checked_add(sectors_to_bytes(locator.platform_data_space as u64)?)
            .ok_or(VhdError::OffsetOverflow)?;
        end = end.max(locator_end);
    }
    align_up_u64(end, SECTOR_SIZE as u64)
}

pub(crate) async fn read_or_corrupt<F: FileHandle + ?Sized>(
    file: &mut F,
    offset: u64,
    buf: &mut [u8],
    ctx: &'static str,
) -> Result<()> {
    match file.read_at(offset, buf).await {
        Ok(()) => Ok(()),
        Err(FsError::OutOfBounds { .. }) => Err(VhdError::CorruptFormat(ctx)),
        Err(err) => Err(err.into()),
    }
}
