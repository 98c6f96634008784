use crate::error::MergeError;
use crate::inode::{Object, ObjectKey};
use crate::segment::SegmentPolicy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".merge-tmp-";
const TEMP_SUFFIX_LEN: usize = 24;

/// Two objects are link-equivalent when they agree on everything a hard link would otherwise
/// have to preserve: device, mode, ownership, and size.
pub struct LinkingPolicy {
    linked_pairs: usize,
}

impl LinkingPolicy {
    pub fn new() -> Self {
        LinkingPolicy { linked_pairs: 0 }
    }

    pub fn linked_pairs(&self) -> usize {
        self.linked_pairs
    }
}

impl Default for LinkingPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentPolicy for LinkingPolicy {
    fn equiv(&self, a: &Object, b: &Object) -> bool {
        a.dev == b.dev && a.mode == b.mode && a.uid == b.uid && a.gid == b.gid && a.size == b.size
    }

    fn better_leader(&self, a: &Object, b: &Object) -> bool {
        match a.missing_refs().cmp(&b.missing_refs()) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => match a.nlink.cmp(&b.nlink) {
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Equal => a.ino < b.ino,
            },
        }
    }

    fn found_equiv(&mut self, _leader_key: ObjectKey, leader: &mut Object, x: &mut Object) {
        let Some(leader_path) = leader.dentries.first().cloned() else {
            return;
        };
        let dentries = std::mem::take(&mut x.dentries);
        for dentry in dentries {
            match link_one(&leader_path, &dentry) {
                Ok(()) => {
                    self.linked_pairs += 1;
                    leader.dentries.push(dentry);
                }
                Err(e) => {
                    log::warn!("linking {} -> {}: {}", dentry.display(), leader_path.display(), e);
                }
            }
        }
    }
}

/// Replaces `dest` with a hard link to `src`, via link-then-rename so `dest` is never briefly
/// missing: link `src` to a randomized temp name beside `dest`, then rename the temp over `dest`.
///
/// If the post-rename cleanup unlink of the temp name *succeeds*, the rename did not consume it
/// as expected and the on-disk topology no longer matches this function's assumptions; that is
/// treated as a programming-level invariant violation, not a recoverable I/O error.
fn link_one(src: &Path, dest: &Path) -> Result<(), MergeError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let temp = temp_name(parent);

    std::fs::hard_link(src, &temp).map_err(|e| MergeError::io(&temp, e))?;

    match std::fs::rename(&temp, dest) {
        Ok(()) => {
            if std::fs::remove_file(&temp).is_ok() {
                panic!(
                    "unexpected topology: temp link {} survived rename onto {}",
                    temp.display(),
                    dest.display()
                );
            }
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            Err(MergeError::io(dest, e))
        }
    }
}

fn temp_name(dir: &Path) -> PathBuf {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TEMP_SUFFIX_LEN)
        .map(char::from)
        .collect();
    dir.join(format!("{TEMP_PREFIX}{suffix}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::aggregate;
    use crate::segment::segment;
    use std::os::unix::fs::MetadataExt;
    use tempfile::tempdir;

    #[test]
    fn three_identical_files_coalesce_to_one_object() {
        let dir = tempdir().unwrap();
        let paths: Vec<PathBuf> = ["x", "y", "z"]
            .iter()
            .map(|name| {
                let p = dir.path().join(name);
                std::fs::write(&p, b"TEST").unwrap();
                p
            })
            .collect();

        let mut set = aggregate(&paths);
        assert_eq!(set.len(), 3);

        let mut policy = LinkingPolicy::new();
        segment(&mut set, &mut policy);
        assert_eq!(policy.linked_pairs(), 2);

        let metas: Vec<_> = paths
            .iter()
            .map(|p| std::fs::metadata(p).unwrap())
            .collect();
        let inos: std::collections::HashSet<u64> =
            metas.iter().map(std::os::unix::fs::MetadataExt::ino).collect();
        assert_eq!(inos.len(), 1, "all paths should resolve to one object");
        assert_eq!(metas[0].nlink(), 3);
    }

    #[test]
    fn mixed_uid_objects_are_not_equivalent() {
        let obj_a = Object {
            dev: 1,
            ino: 1,
            mode: 0o644,
            uid: 1000,
            gid: 0,
            size: 4,
            nlink: 1,
            dentries: vec![PathBuf::from("/a")],
            visited: false,
            readonly: false,
        };
        let obj_b = Object {
            dev: 1,
            ino: 2,
            mode: 0o644,
            uid: 1001,
            gid: 0,
            size: 4,
            nlink: 1,
            dentries: vec![PathBuf::from("/b")],
            visited: false,
            readonly: false,
        };
        let policy = LinkingPolicy::new();
        assert!(!policy.equiv(&obj_a, &obj_b));
    }
}
