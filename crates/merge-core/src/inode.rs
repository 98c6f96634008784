use std::collections::BTreeMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

/// The underlying storage object a digest group's dentries resolve to, keyed by `(dev, ino)`.
pub struct Object {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub nlink: u64,
    pub dentries: Vec<PathBuf>,
    pub visited: bool,
    pub readonly: bool,
}

impl Object {
    /// Link count minus dentries observed in the current digest group: a proxy for "this object
    /// has references outside this group", making it a safer link target.
    pub fn missing_refs(&self) -> u64 {
        self.nlink.saturating_sub(self.dentries.len() as u64)
    }
}

pub type ObjectKey = (u64, u64);
pub type ObjectSet = BTreeMap<ObjectKey, Object>;

/// Resolves every dentry in a digest group to its underlying object, grouping dentries that
/// share `(dev, ino)`. Zero-size objects and entries that no longer exist are skipped.
///
/// Resolution follows symlinks (`stat`, not `lstat`), matching the original's merge-time
/// resolution in `scan_inodes.c`/`make_hardlinks.c`: a dentry that has become a symlink since it
/// was scanned is still resolved through to its target rather than dropped. Only the resolved
/// target being a regular file is required; non-regular targets (directories, devices, sockets)
/// are skipped with a diagnostic.
pub fn aggregate(dentries: &[PathBuf]) -> ObjectSet {
    let mut set = ObjectSet::new();
    for path in dentries {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("stat {}: {}", path.display(), e);
                continue;
            }
        };
        if !meta.is_file() {
            log::debug!("{}: not a regular file, skipping", path.display());
            continue;
        }
        if meta.size() == 0 {
            log::debug!("{}: zero-size, skipping", path.display());
            continue;
        }
        let key = (meta.dev(), meta.ino());
        match set.get_mut(&key) {
            Some(obj) => obj.dentries.push(path.clone()),
            None => {
                set.insert(
                    key,
                    Object {
                        dev: meta.dev(),
                        ino: meta.ino(),
                        mode: meta.mode(),
                        uid: meta.uid(),
                        gid: meta.gid(),
                        size: meta.size(),
                        nlink: meta.nlink(),
                        dentries: vec![path.clone()],
                        visited: false,
                        readonly: false,
                    },
                );
            }
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn separate_files_are_separate_objects() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::write(&b, b"hello").unwrap();
        let set = aggregate(&[a, b]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn hard_linked_paths_share_one_object() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"hello").unwrap();
        std::fs::hard_link(&a, &b).unwrap();
        let set = aggregate(&[a, b]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.values().next().unwrap().dentries.len(), 2);
    }

    #[test]
    fn zero_size_file_excluded() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("empty");
        std::fs::File::create(&a).unwrap().flush().unwrap();
        let set = aggregate(&[a]);
        assert!(set.is_empty());
    }

    #[test]
    fn missing_path_is_skipped() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone");
        let set = aggregate(&[missing]);
        assert!(set.is_empty());
    }

    #[test]
    fn dentry_that_became_a_symlink_resolves_through_to_its_target() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        std::fs::write(&target, b"hello").unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let set = aggregate(&[target.clone(), link]);
        assert_eq!(set.len(), 1, "symlink should resolve to the same object as its target");
        assert_eq!(set.values().next().unwrap().dentries.len(), 2);
    }
}
