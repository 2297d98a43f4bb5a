//! Owner-only file persistence.
//!
//! Everything grantkeeper writes to disk (token file, CA and leaf PEMs) goes
//! through [`write_private`]: the bytes land in a temporary file in the target
//! directory and are renamed over the destination, so readers see either the
//! old file or the new one, never a partial write.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

/// Permission bits for files holding secrets.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Permission bits for directories holding secrets.
pub const PRIVATE_DIR_MODE: u32 = 0o700;

/// Atomically replace `path` with `contents`, readable only by the owner.
pub fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    create_private_dir(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".grantkeeper-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    set_mode(tmp.path(), PRIVATE_FILE_MODE)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Create `dir` (and parents) if missing. New directories are owner-only.
pub fn create_private_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(PRIVATE_DIR_MODE)
            .create(dir)
    }
    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

/// Reset the permission bits of `path` to `mode` if they drifted.
///
/// Returns `true` when a repair was made.
pub fn repair_mode(path: &Path, mode: u32) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let current = fs::metadata(path)?.permissions().mode() & 0o777;
        if current != mode {
            set_mode(path, mode)?;
            return Ok(true);
        }
        Ok(false)
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(false)
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}
