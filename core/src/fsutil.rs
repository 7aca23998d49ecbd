//! Atomic, permission-aware file writes shared by the secret store, the
//! rendered artifacts and the environment contract

use crate::Result;
use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Owner read/write only
pub const MODE_SECRET: u32 = 0o600;
/// World readable, for non-secret config and unit files
pub const MODE_PUBLIC: u32 = 0o644;
pub const MODE_PRIVATE_DIR: u32 = 0o700;

/// Create `dir` (and parents) and pin its mode
pub fn ensure_dir(dir: &Path, mode: u32) -> Result<()> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, Permissions::from_mode(mode))?;
    Ok(())
}

/// Write `content` to `path` so that readers see either the old file or the
/// complete new one. The temp file lives in the target directory, gets its
/// final mode before any byte is written, and is fsync'd before the rename.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .tempfile_in(parent)?;
    tmp.as_file()
        .set_permissions(Permissions::from_mode(mode))?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Atomically write `content` unless the file already holds exactly that.
/// The mode is enforced either way. Returns whether the content changed.
pub fn write_if_changed(path: &Path, content: &[u8], mode: u32) -> Result<bool> {
    if let Ok(existing) = fs::read(path) {
        if existing == content {
            let current = fs::metadata(path)?.permissions().mode() & 0o777;
            if current != mode {
                fs::set_permissions(path, Permissions::from_mode(mode))?;
            }
            return Ok(false);
        }
    }
    write_atomic(path, content, mode)?;
    Ok(true)
}

pub fn file_mode(path: &Path) -> Result<u32> {
    Ok(fs::metadata(path)?.permissions().mode() & 0o777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_sets_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/secret");
        write_atomic(&path, b"value", MODE_SECRET).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "value");
        assert_eq!(file_mode(&path).unwrap(), 0o600);
    }

    #[test]
    fn test_write_if_changed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf");
        assert!(write_if_changed(&path, b"a=1\n", MODE_PUBLIC).unwrap());
        assert!(!write_if_changed(&path, b"a=1\n", MODE_PUBLIC).unwrap());
        assert!(write_if_changed(&path, b"a=2\n", MODE_PUBLIC).unwrap());

        // Mode drift is repaired without counting as a content change
        fs::set_permissions(&path, Permissions::from_mode(0o666)).unwrap();
        assert!(!write_if_changed(&path, b"a=2\n", MODE_PUBLIC).unwrap());
        assert_eq!(file_mode(&path).unwrap(), 0o644);
    }

    #[test]
    fn test_no_temp_files_left() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"one", MODE_SECRET).unwrap();
        write_atomic(&path, b"two", MODE_SECRET).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["file".to_string()]);
    }
}
