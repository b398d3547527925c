use deltabak_fs::{FileHandle, Handler, OpenMode};

use crate::Result;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const TAR_BLOCK: u64 = 512;
/// A tar archive ends with two zero-filled records.
const TAR_TRAILER: u64 = 2 * TAR_BLOCK;

/// Result of the format-level sanity check of a full backup archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XvaCheck {
    Gzip,
    Zstd,
    Tar,
    Invalid(&'static str),
}

impl XvaCheck {
    pub fn is_valid(self) -> bool {
        !matches!(self, XvaCheck::Invalid(_))
    }
}

/// Check that `path` looks like a complete XVA.
///
/// Compressed archives are only recognised by their magic; an uncompressed archive must be a
/// whole number of tar records ending with the tar trailer.
pub async fn check_xva(handler: &dyn Handler, path: &str) -> Result<XvaCheck> {
    let size = handler.get_size(path).await?;
    let mut file = handler.open_file(path, OpenMode::Read).await?;

    let mut magic = [0u8; 4];
    let head = magic.len().min(size as usize);
    file.read_at(0, &mut magic[..head]).await?;
    if head >= GZIP_MAGIC.len() && magic[..2] == GZIP_MAGIC {
        return Ok(XvaCheck::Gzip);
    }
    if head == ZSTD_MAGIC.len() && magic == ZSTD_MAGIC {
        return Ok(XvaCheck::Zstd);
    }

    if size <= TAR_TRAILER {
        return Ok(XvaCheck::Invalid("file too small"));
    }
    if size % TAR_BLOCK != 0 {
        return Ok(XvaCheck::Invalid("size is not a multiple of 512"));
    }
    let mut trailer = [0u8; TAR_TRAILER as usize];
    file.read_at(size - TAR_TRAILER, &mut trailer).await?;
    if trailer.iter().any(|b| *b != 0) {
        return Ok(XvaCheck::Invalid("missing tar trailer"));
    }
    Ok(XvaCheck::Tar)
}
