//! Mutating operations on sparse disks.
//!
//! Every step leaves a file that opens cleanly: block data is written before the bitmap bits
//! that mark it valid, and the trailing footer is moved past any newly allocated space right
//! after the BAT entry pointing to it.

use deltabak_fs::FileHandle;
use tracing::debug;

use crate::bitmap::{sector_runs, set_range};
use crate::util::{align_up_u64, bat_size, checked_range, sectors_to_bytes};
use crate::vhd::{read_or_corrupt, MAX_BAT_BYTES};
use crate::{Result, VhdError, VhdFile, BLOCK_UNUSED, HEADER_SIZE, SECTOR_SIZE};

const ZERO_CHUNK: usize = 1024 * 1024;

impl<F: FileHandle> VhdFile<F> {
    async fn set_bat_entry(&mut self, block: u32, sector: u32) -> Result<()> {
        let table_offset = self.sparse()?.table_offset;
        let slot = self
            .bat
            .get_mut(block as usize)
            .ok_or(VhdError::InvalidArgument("block index beyond bat"))?;
        *slot = sector;
        self.file
            .write_at(table_offset + block as u64 * 4, &sector.to_be_bytes())
            .await?;
        Ok(())
    }

    async fn zero_range(&mut self, start: u64, end: u64) -> Result<()> {
        let zeros = vec![0u8; ZERO_CHUNK.min((end - start) as usize)];
        let mut pos = start;
        while pos < end {
            let len = zeros.len().min((end - pos) as usize);
            self.file.write_at(pos, &zeros[..len]).await?;
            pos += len as u64;
        }
        Ok(())
    }

    /// Allocate `block` at the end of data with an empty bitmap and return its byte offset.
    /// An already allocated block is returned as is.
    pub async fn create_block(&mut self, block: u32) -> Result<u64> {
        if block as usize >= self.bat.len() {
            return Err(VhdError::InvalidArgument("block index beyond bat"));
        }
        if self.contains_block(block) {
            return self.block_offset(block);
        }

        let bitmap_size = self.bitmap_size()?;
        let full_block_size = self.full_block_size()?;
        let offset = align_up_u64(self.end_of_data, SECTOR_SIZE as u64)?;
        let sector = u32::try_from(offset / SECTOR_SIZE as u64)
            .ok()
            .filter(|sector| *sector != BLOCK_UNUSED)
            .ok_or(VhdError::OffsetOverflow)?;
        let end = offset
            .checked_add(full_block_size)
            .ok_or(VhdError::OffsetOverflow)?;

        // Whatever lies there (usually the trailing footer) must not be taken for a bitmap.
        let len = self.file.len().await?;
        if len > offset {
            self.zero_range(offset, len.min(end)).await?;
        }
        if len < end {
            self.file.set_len(end).await?;
        }

        self.set_bat_entry(block, sector).await?;
        self.end_of_data = self.end_of_data.max(end);
        self.bitmap_cache.put(block, vec![0u8; bitmap_size as usize]);
        self.write_footer(true).await?;

        debug!(block, offset, "allocated vhd block");
        Ok(offset)
    }

    async fn ensure_block(&mut self, block: u32) -> Result<u64> {
        if self.contains_block(block) {
            let offset = self.block_offset(block)?;
            self.validate_block_bounds(offset).await?;
            Ok(offset)
        } else {
            self.create_block(block).await
        }
    }

    pub async fn write_block_bitmap(&mut self, block: u32, bitmap: &[u8]) -> Result<()> {
        if bitmap.len() as u64 != self.bitmap_size()? {
            return Err(VhdError::InvalidArgument("bitmap size mismatch"));
        }
        let offset = self.block_offset(block)?;
        self.file.write_at(offset, bitmap).await?;
        self.bitmap_cache.put(block, bitmap.to_vec());
        Ok(())
    }

    /// Write the given sector runs of `data` (a whole block) and mark them valid.
    async fn write_runs(&mut self, block: u32, data: &[u8], runs: &[(u32, u32)]) -> Result<u64> {
        if runs.is_empty() {
            return Ok(0);
        }
        let bitmap_size = self.bitmap_size()?;
        let block_start = self.ensure_block(block).await?;

        let mut written = 0u64;
        for &(begin, end) in runs {
            let from = begin as usize * SECTOR_SIZE;
            let to = end as usize * SECTOR_SIZE;
            self.file
                .write_at(block_start + bitmap_size + from as u64, &data[from..to])
                .await?;
            written += (to - from) as u64;
        }

        let mut bitmap = self.read_block_bitmap(block).await?;
        for &(begin, end) in runs {
            set_range(&mut bitmap, begin, end);
        }
        self.write_block_bitmap(block, &bitmap).await?;
        Ok(written)
    }

    /// Write sectors `[begin, end)` of `block` from `data`, which holds the whole block.
    /// Other sectors of the block keep their content and validity.
    pub async fn write_block_sectors(
        &mut self,
        block: u32,
        data: &[u8],
        begin: u32,
        end: u32,
    ) -> Result<()> {
        if data.len() as u64 != self.block_size()? as u64 {
            return Err(VhdError::InvalidArgument("block data size mismatch"));
        }
        if begin > end || end > self.sectors_per_block()? {
            return Err(VhdError::InvalidArgument("sector range beyond block"));
        }
        if begin < end {
            self.write_runs(block, data, &[(begin, end)]).await?;
        }
        Ok(())
    }

    /// Write the sectors marked in `bitmap` and add them to the block's bitmap. Sectors not
    /// marked are left untouched on disk. Returns the number of bytes written.
    pub async fn write_block(&mut self, block: u32, bitmap: &[u8], data: &[u8]) -> Result<u64> {
        let sectors_per_block = self.sectors_per_block()?;
        if data.len() as u64 != self.block_size()? as u64 {
            return Err(VhdError::InvalidArgument("block data size mismatch"));
        }
        if (bitmap.len() as u64) * 8 < sectors_per_block as u64 {
            return Err(VhdError::InvalidArgument("bitmap size mismatch"));
        }
        let runs = sector_runs(bitmap, sectors_per_block);
        self.write_runs(block, data, &runs).await
    }

    /// Overlay the valid sectors of `child`'s `block` onto this disk. Returns the number of
    /// bytes merged.
    pub async fn coalesce_block<G: FileHandle>(
        &mut self,
        child: &mut VhdFile<G>,
        block: u32,
    ) -> Result<u64> {
        if child.block_size()? != self.block_size()? {
            return Err(VhdError::InvalidArgument("block size mismatch"));
        }
        match child.read_block(block).await? {
            Some(child_block) => {
                self.write_block(block, &child_block.bitmap, &child_block.data)
                    .await
            }
            None => Ok(0),
        }
    }

    /// Write `buf` at `sector_offset`, splitting it over the blocks it touches.
    ///
    /// Sectors outside the written range keep their content and validity. A trailing partial
    /// sector keeps its previous bytes past the end of `buf`.
    pub async fn write_data(&mut self, sector_offset: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let offset = sectors_to_bytes(sector_offset)?;
        checked_range(offset, buf.len(), self.capacity())?;

        if self.header.is_none() {
            self.file.write_at(offset, buf).await?;
            return Ok(());
        }

        let sectors_per_block = self.sectors_per_block()? as u64;
        let block_size = self.block_size()? as usize;
        let end_sector = sector_offset + (buf.len() as u64).div_ceil(SECTOR_SIZE as u64);
        let first_block = sector_offset / sectors_per_block;
        let last_block = (end_sector - 1) / sectors_per_block;

        let entries = u32::try_from(last_block + 1).map_err(|_| VhdError::OffsetOverflow)?;
        self.ensure_bat_size(entries).await?;

        let mut data = vec![0u8; block_size];
        for block in first_block..=last_block {
            let block_first = block * sectors_per_block;
            let begin = sector_offset.max(block_first) - block_first;
            let end = end_sector.min(block_first + sectors_per_block) - block_first;

            let start_in_buf = ((block_first + begin - sector_offset) as usize) * SECTOR_SIZE;
            let end_in_buf = (((block_first + end - sector_offset) as usize) * SECTOR_SIZE)
                .min(buf.len());
            let from = begin as usize * SECTOR_SIZE;
            let copied = end_in_buf - start_in_buf;
            data[from..from + copied].copy_from_slice(&buf[start_in_buf..end_in_buf]);

            let to = end as usize * SECTOR_SIZE;
            if from + copied < to {
                let tail_start = to - SECTOR_SIZE;
                let keep_from = from + copied - tail_start;
                let mut existing = [0u8; SECTOR_SIZE];
                self.read_at(
                    block * block_size as u64 + tail_start as u64,
                    &mut existing,
                )
                .await?;
                data[from + copied..to].copy_from_slice(&existing[keep_from..]);
            }

            self.write_block_sectors(block as u32, &data, begin as u32, end as u32)
                .await?;
        }

        self.write_footer(false).await
    }

    /// Grow the BAT to `entries` entries, moving the first data blocks out of the way when the
    /// grown table would overlap them.
    pub async fn ensure_bat_size(&mut self, entries: u32) -> Result<()> {
        let header = self.sparse()?.clone();
        let old_entries = header.max_table_entries;
        if old_entries >= entries {
            return Ok(());
        }

        let new_bytes = bat_size(entries)?;
        if new_bytes > MAX_BAT_BYTES {
            return Err(VhdError::Unsupported("vhd bat too large"));
        }
        let new_end = header
            .table_offset
            .checked_add(new_bytes)
            .ok_or(VhdError::OffsetOverflow)?;

        let data_offset = self.footer.data_offset;
        if data_offset >= header.table_offset && data_offset < new_end {
            return Err(VhdError::Unsupported("vhd dynamic header follows the bat"));
        }
        let locator_in_the_way = header.parent_locators.iter().any(|locator| {
            locator.platform_code != 0
                && locator.platform_data_offset >= header.table_offset
                && locator.platform_data_offset < new_end
        });
        if locator_in_the_way {
            return Err(VhdError::Unsupported("vhd parent locator follows the bat"));
        }

        self.free_first_block_space(new_end).await?;

        let tail_start = old_entries as u64 * 4;
        let tail = vec![0xFFu8; (new_bytes - tail_start) as usize];
        self.file
            .write_at(header.table_offset + tail_start, &tail)
            .await?;
        self.bat.resize(entries as usize, BLOCK_UNUSED);
        if let Some(header) = self.header.as_mut() {
            header.max_table_entries = entries;
        }
        self.end_of_data = self.end_of_data.max(new_end);

        self.write_header().await?;
        self.write_footer(true).await?;
        debug!(from = old_entries, to = entries, "grew vhd bat");
        Ok(())
    }

    fn first_and_last_blocks(&self) -> Option<(u32, u32, u32)> {
        let mut found: Option<(u32, u32, u32)> = None;
        for (id, &sector) in self.bat.iter().enumerate() {
            if sector == BLOCK_UNUSED {
                continue;
            }
            found = Some(match found {
                None => (id as u32, sector, sector),
                Some((first, first_sector, last_sector)) if sector < first_sector => {
                    (id as u32, sector, last_sector)
                }
                Some((first, first_sector, last_sector)) => {
                    (first, first_sector, last_sector.max(sector))
                }
            });
        }
        found
    }

    /// Move the earliest blocks past the last one until no block starts before `required_end`.
    pub async fn free_first_block_space(&mut self, required_end: u64) -> Result<()> {
        let full_block_size = self.full_block_size()?;
        let min_offset = align_up_u64(required_end, SECTOR_SIZE as u64)?;

        while let Some((first, first_sector, last_sector)) = self.first_and_last_blocks() {
            let first_offset = sectors_to_bytes(first_sector as u64)?;
            if first_offset >= required_end {
                break;
            }
            let last_end = sectors_to_bytes(last_sector as u64)?
                .checked_add(full_block_size)
                .ok_or(VhdError::OffsetOverflow)?;
            let new_offset = last_end.max(min_offset);
            let new_sector = u32::try_from(new_offset / SECTOR_SIZE as u64)
                .ok()
                .filter(|sector| *sector != BLOCK_UNUSED)
                .ok_or(VhdError::OffsetOverflow)?;

            let mut raw = vec![0u8; full_block_size as usize];
            read_or_corrupt(&mut self.file, first_offset, &mut raw, "vhd block truncated").await?;
            self.file.write_at(new_offset, &raw).await?;
            self.set_bat_entry(first, new_sector).await?;
            self.end_of_data = self.end_of_data.max(new_offset + full_block_size);
            self.write_footer(true).await?;

            debug!(
                block = first,
                from = first_offset,
                to = new_offset,
                "moved vhd block"
            );
        }
        Ok(())
    }

    /// Refresh the footer checksum and write it at the end of data (truncating the file right
    /// after it) and, unless `only_end`, at offset 0.
    pub async fn write_footer(&mut self, only_end: bool) -> Result<()> {
        let raw = self.footer.to_bytes();
        if self.header.is_none() {
            self.file.write_at(self.footer.current_size, &raw).await?;
            return Ok(());
        }

        let end = align_up_u64(self.end_of_data, SECTOR_SIZE as u64)?;
        self.file.write_at(end, &raw).await?;
        self.file.set_len(end + raw.len() as u64).await?;
        if !only_end {
            self.file.write_at(0, &raw).await?;
        }
        Ok(())
    }

    pub async fn write_header(&mut self) -> Result<()> {
        let at = self.footer.data_offset;
        let header = self
            .header
            .as_mut()
            .ok_or(VhdError::Unsupported("vhd is not dynamic"))?;
        let raw = header.to_bytes()?;
        debug_assert_eq!(raw.len(), HEADER_SIZE);
        self.file.write_at(at, &raw).await?;
        Ok(())
    }
}
