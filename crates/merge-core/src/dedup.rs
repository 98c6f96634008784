use crate::error::MergeError;
use crate::extents::ExtentMap;
use crate::inode::{Object, ObjectKey};
use crate::segment::SegmentPolicy;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;

const FIDEDUPERANGE: libc::c_ulong = 0xC038_3009;
const FILE_DEDUPE_RANGE_SAME: u32 = 0;
const FILE_DEDUPE_RANGE_DIFFERS: u32 = 1;

#[repr(C)]
struct FileDedupeRangeInfo {
    dest_fd: i64,
    dest_offset: u64,
    bytes_deduped: u64,
    status: i32,
    reserved: u32,
}

#[repr(C)]
struct FileDedupeRange {
    src_offset: u64,
    src_length: u64,
    dest_count: u16,
    reserved1: u16,
    reserved2: u32,
    info: [FileDedupeRangeInfo; 1],
}

/// Two objects are dedup-equivalent when they live on the same device — `FIDEDUPERANGE` cannot
/// share storage across filesystems.
pub struct DedupPolicy {
    opened: HashMap<ObjectKey, File>,
    readonly_used: bool,
    deduped_pairs: usize,
}

impl DedupPolicy {
    pub fn new() -> Self {
        DedupPolicy { opened: HashMap::new(), readonly_used: false, deduped_pairs: 0 }
    }

    pub fn deduped_pairs(&self) -> usize {
        self.deduped_pairs
    }

    /// Opens one dentry of `obj` read-write; on `EACCES`, retries read-only at most once per
    /// digest group and marks the object read-only. Must be called before `segment()` runs this
    /// policy, once per object in the group.
    pub fn open(&mut self, obj: &mut Object) -> Result<(), MergeError> {
        let Some(path) = obj.dentries.first() else {
            return Ok(());
        };
        match OpenOptions::new().read(true).write(true).open(path) {
            Ok(f) => {
                self.opened.insert((obj.dev, obj.ino), f);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied && !self.readonly_used => {
                let f = OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map_err(|e| MergeError::io(path, e))?;
                self.readonly_used = true;
                obj.readonly = true;
                self.opened.insert((obj.dev, obj.ino), f);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(MergeError::Permission { path: path.clone() })
            }
            Err(e) => Err(MergeError::io(path, e)),
        }
    }

    fn extent_map(&self, key: ObjectKey, size: u64, path: &Path) -> Result<ExtentMap, MergeError> {
        let file = self.opened.get(&key).expect("object opened before extent_map");
        ExtentMap::build(file.as_raw_fd(), size, path)
    }
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentPolicy for DedupPolicy {
    fn equiv(&self, a: &Object, b: &Object) -> bool {
        a.dev == b.dev
    }

    fn better_leader(&self, a: &Object, b: &Object) -> bool {
        match (a.readonly, b.readonly) {
            (false, true) => true,
            (true, false) => false,
            _ => a.ino < b.ino,
        }
    }

    fn can_pair(&self, leader: &Object, x: &Object) -> bool {
        if x.readonly {
            // at most one read-only object may participate, and it is never a dedup
            // destination
            return false;
        }
        let leader_path = match leader.dentries.first() {
            Some(p) => p,
            None => return false,
        };
        let x_path = match x.dentries.first() {
            Some(p) => p,
            None => return false,
        };
        let leader_map = match self.extent_map((leader.dev, leader.ino), leader.size, leader_path) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("extent map for {}: {}", leader_path.display(), e);
                return false;
            }
        };
        let x_map = match self.extent_map((x.dev, x.ino), leader.size, x_path) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("extent map for {}: {}", x_path.display(), e);
                return false;
            }
        };
        leader_map.differs(&x_map, leader.size)
    }

    fn found_equiv(&mut self, _leader_key: ObjectKey, leader: &mut Object, x: &mut Object) {
        let (Some(leader_path), Some(x_path)) = (leader.dentries.first().cloned(), x.dentries.first().cloned())
        else {
            return;
        };
        let leader_fd = match self.opened.get(&(leader.dev, leader.ino)) {
            Some(f) => f.as_raw_fd(),
            None => return,
        };
        let x_fd = match self.opened.get(&(x.dev, x.ino)) {
            Some(f) => f.as_raw_fd(),
            None => return,
        };
        match dedup_range(leader_fd, x_fd, leader.size) {
            Ok(()) => self.deduped_pairs += 1,
            Err(MergeError::Corruption { .. }) => {
                log::error!(
                    "{} and {} share a digest but FIDEDUPERANGE reports DIFFERS; abandoning this pair",
                    leader_path.display(),
                    x_path.display()
                );
            }
            Err(e) => log::warn!("dedup {} against {}: {}", x_path.display(), leader_path.display(), e),
        }
    }
}

/// Issues `FIDEDUPERANGE` in a loop until `size` bytes are covered or an abort condition (status
/// other than SAME, zero bytes reported, or an ioctl error) is hit.
fn dedup_range(src_fd: i32, dest_fd: i32, size: u64) -> Result<(), MergeError> {
    let mut offset = 0u64;
    while offset < size {
        let mut range = FileDedupeRange {
            src_offset: offset,
            src_length: size - offset,
            dest_count: 1,
            reserved1: 0,
            reserved2: 0,
            info: [FileDedupeRangeInfo {
                dest_fd: dest_fd as i64,
                dest_offset: offset,
                bytes_deduped: 0,
                status: 0,
                reserved: 0,
            }],
        };

        let rc = unsafe { libc::ioctl(src_fd, FIDEDUPERANGE, &mut range as *mut FileDedupeRange) };
        if rc < 0 {
            return Err(MergeError::io("<dedup fd>", std::io::Error::last_os_error()));
        }

        let status = range.info[0].status as u32;
        if status == FILE_DEDUPE_RANGE_DIFFERS {
            return Err(MergeError::Corruption { path: "<dedup fd>".into() });
        }
        if status != FILE_DEDUPE_RANGE_SAME {
            return Err(MergeError::io(
                "<dedup fd>",
                std::io::Error::other(format!("unexpected dedup status {status}")),
            ));
        }
        if range.info[0].bytes_deduped == 0 {
            return Err(MergeError::io("<dedup fd>", std::io::Error::other("zero bytes deduped")));
        }
        offset += range.info[0].bytes_deduped;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn better_leader_prefers_writable() {
        let policy = DedupPolicy::new();
        let writable = test_obj(1, false);
        let readonly = test_obj(2, true);
        assert!(policy.better_leader(&writable, &readonly));
        assert!(!policy.better_leader(&readonly, &writable));
    }

    #[test]
    fn better_leader_ties_break_on_lower_ino() {
        let policy = DedupPolicy::new();
        let a = test_obj(1, false);
        let b = test_obj(2, false);
        assert!(policy.better_leader(&a, &b));
        assert!(!policy.better_leader(&b, &a));
    }

    fn test_obj(ino: u64, readonly: bool) -> Object {
        Object {
            dev: 1,
            ino,
            mode: 0o644,
            uid: 0,
            gid: 0,
            size: 100,
            nlink: 1,
            dentries: vec![],
            visited: false,
            readonly,
        }
    }
}
