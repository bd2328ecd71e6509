//! Content hashing of template directories.

use super::IgnoreList;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Hash every non-ignored file under `dir`: relative path and contents, in a
/// stable (sorted) order. Blocking; call from `spawn_blocking`.
pub fn hash_directory(dir: &Path, ignore: &IgnoreList) -> std::io::Result<String> {
    let mut files = Vec::new();
    collect_files(dir, dir, ignore, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    for rel in files {
        let contents = std::fs::read(dir.join(&rel))?;
        hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update([0u8]);
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Relative paths of every non-ignored regular file under `dir`.
pub(crate) fn collect_files(
    root: &Path,
    dir: &Path,
    ignore: &IgnoreList,
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let rel = match path.strip_prefix(root) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        if ignore.is_ignored(&rel) {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, ignore, out)?;
        } else if file_type.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn hash_changes_with_content_but_not_with_ignored_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        let ignore = IgnoreList::new(["*.log"]);

        let first = hash_directory(dir.path(), &ignore).unwrap();
        fs::write(dir.path().join("server.log"), "noise").unwrap();
        assert_eq!(first, hash_directory(dir.path(), &ignore).unwrap());

        fs::write(dir.path().join("Dockerfile"), "FROM debian\n").unwrap();
        assert_ne!(first, hash_directory(dir.path(), &ignore).unwrap());
    }

    #[test]
    fn renaming_a_file_changes_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("conf")).unwrap();
        fs::write(dir.path().join("conf/a.cfg"), "x=1").unwrap();
        let ignore = IgnoreList::default();
        let before = hash_directory(dir.path(), &ignore).unwrap();

        fs::rename(dir.path().join("conf/a.cfg"), dir.path().join("conf/b.cfg")).unwrap();
        assert_ne!(before, hash_directory(dir.path(), &ignore).unwrap());
    }
}
