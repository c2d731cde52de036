//! Crash-safe file persistence.
//!
//! State files (cache index, instance snapshot) are rewritten with
//! write-temp-then-rename so readers only ever see a complete document.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

/// Write `contents` to `path` atomically.
///
/// The temp file lives next to the target so the final rename stays on one
/// filesystem. It is fsynced before the rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &data)
}

/// Total size in bytes of every regular file under `path`.
///
/// Symlinks are followed, so snapshot trees whose files link into a blob
/// store count the blob sizes. A single file returns its own length; a
/// missing path returns 0.
pub fn directory_size(path: &Path) -> std::io::Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let mut total = 0;
    for entry in WalkDir::new(path).follow_links(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(std::io::Error::from)?.len();
        }
    }
    Ok(total)
}

/// Recursively copy `src` into `dst`, creating `dst` if needed.
///
/// Symlinks are resolved, so the copy holds real files.
pub fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<u64> {
    std::fs::create_dir_all(dst)?;
    if src.is_file() {
        let name = src
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
        return std::fs::copy(src, dst.join(name));
    }

    let mut copied = 0;
    for entry in WalkDir::new(src).follow_links(true).min_depth(1) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            copied += std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{}.tmp-{}", name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &serde_json::json!({"instances": []})).unwrap();
        let back: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(back["instances"], serde_json::json!([]));
    }

    #[test]
    fn sizes_and_copies_trees() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("shards")).unwrap();
        std::fs::write(src.join("config.json"), vec![0u8; 10]).unwrap();
        std::fs::write(src.join("shards").join("a.safetensors"), vec![0u8; 90]).unwrap();

        assert_eq!(directory_size(&src).unwrap(), 100);
        assert_eq!(directory_size(&dir.path().join("missing")).unwrap(), 0);

        let dst = dir.path().join("dst");
        assert_eq!(copy_tree(&src, &dst).unwrap(), 100);
        assert_eq!(directory_size(&dst).unwrap(), 100);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_blobs_count_at_full_size() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = dir.path().join("blobs");
        let snapshot = dir.path().join("snapshots").join("main");
        std::fs::create_dir_all(&blobs).unwrap();
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(blobs.join("abc123"), vec![0u8; 4096]).unwrap();
        std::os::unix::fs::symlink(blobs.join("abc123"), snapshot.join("model.safetensors"))
            .unwrap();

        assert_eq!(directory_size(&snapshot).unwrap(), 4096);

        let dst = dir.path().join("copy");
        assert_eq!(copy_tree(&snapshot, &dst).unwrap(), 4096);
        let copied = dst.join("model.safetensors");
        assert!(!std::fs::symlink_metadata(&copied).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::metadata(&copied).unwrap().len(), 4096);
    }
}
