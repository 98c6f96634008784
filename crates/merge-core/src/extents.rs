use crate::error::MergeError;
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::path::Path;

/// Extents are queried in batches of this size, matching the original's `EXTENTS_BATCH`.
const EXTENTS_BATCH: usize = 16384;

const FIEMAP_EXTENT_LAST: u32 = 0x0001;
const FIEMAP_EXTENT_UNKNOWN: u32 = 0x0002;
const FS_IOC_FIEMAP: libc::c_ulong = 0xC020_660B;

#[repr(C)]
#[derive(Clone, Copy)]
struct FiemapExtent {
    fe_logical: u64,
    fe_physical: u64,
    fe_length: u64,
    fe_reserved64: [u64; 2],
    fe_flags: u32,
    fe_reserved: [u32; 3],
}

#[repr(C)]
struct FiemapHeader {
    fm_start: u64,
    fm_length: u64,
    fm_flags: u32,
    fm_mapped_extents: u32,
    fm_extent_count: u32,
    fm_reserved: u32,
}

/// A contiguous logical run backed by contiguous physical storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub physical: u64,
    pub length: u64,
}

/// Logical-offset-keyed extent map for one open file. Adjacent extents that are contiguous in
/// both logical and physical space are merged into one entry as they are built.
#[derive(Default, Debug, Clone)]
pub struct ExtentMap(pub BTreeMap<u64, Extent>);

impl ExtentMap {
    /// Queries `FS_IOC_FIEMAP` from offset 0 to `size`, merging contiguous extents and skipping
    /// ones flagged `FIEMAP_EXTENT_UNKNOWN`, stopping at the extent flagged `FIEMAP_EXTENT_LAST`.
    pub fn build(fd: RawFd, size: u64, path: &Path) -> Result<ExtentMap, MergeError> {
        let mut map = BTreeMap::new();
        let mut start = 0u64;
        let mut buf: Vec<FiemapExtent> = vec![
            FiemapExtent {
                fe_logical: 0,
                fe_physical: 0,
                fe_length: 0,
                fe_reserved64: [0; 2],
                fe_flags: 0,
                fe_reserved: [0; 3],
            };
            EXTENTS_BATCH
        ];

        'outer: while start < size {
            let mut header = FiemapHeader {
                fm_start: start,
                fm_length: size - start,
                fm_flags: 0,
                fm_mapped_extents: 0,
                fm_extent_count: EXTENTS_BATCH as u32,
                fm_reserved: 0,
            };

            let rc = unsafe {
                fiemap_ioctl(fd, &mut header, buf.as_mut_ptr())
            };
            if rc < 0 {
                return Err(MergeError::io(path, std::io::Error::last_os_error()));
            }

            if header.fm_mapped_extents == 0 {
                break;
            }

            for fe in &buf[..header.fm_mapped_extents as usize] {
                start = fe.fe_logical + fe.fe_length;
                if fe.fe_flags & FIEMAP_EXTENT_UNKNOWN != 0 {
                    if fe.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                        break 'outer;
                    }
                    continue;
                }
                insert_merging(&mut map, Extent {
                    logical: fe.fe_logical,
                    physical: fe.fe_physical,
                    length: fe.fe_length,
                });
                if fe.fe_flags & FIEMAP_EXTENT_LAST != 0 {
                    break 'outer;
                }
            }
        }

        Ok(ExtentMap(map))
    }

    /// Looks up the extent covering `offset`, if any.
    pub fn find(&self, offset: u64) -> Option<&Extent> {
        self.0
            .range(..=offset)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| offset < e.logical + e.length)
    }

    /// True iff `self` and `other` disagree anywhere over `[0, len)` — either one has a gap the
    /// other doesn't, or their physical backing differs at some logical offset.
    pub fn differs(&self, other: &ExtentMap, len: u64) -> bool {
        let mut offset = 0u64;
        while offset < len {
            let a = self.find(offset);
            let b = other.find(offset);
            match (a, b) {
                (None, None) => return true, // neither has this range mapped: not proven equal
                (Some(_), None) | (None, Some(_)) => return true,
                (Some(ea), Some(eb)) => {
                    let a_off = offset - ea.logical;
                    let b_off = offset - eb.logical;
                    if ea.physical + a_off != eb.physical + b_off {
                        return true;
                    }
                    let a_remaining = ea.length - a_off;
                    let b_remaining = eb.length - b_off;
                    offset += a_remaining.min(b_remaining);
                }
            }
        }
        false
    }
}

fn insert_merging(map: &mut BTreeMap<u64, Extent>, extent: Extent) {
    if let Some((_, last)) = map.iter_mut().next_back() {
        if last.logical + last.length == extent.logical && last.physical + last.length == extent.physical {
            last.length += extent.length;
            return;
        }
    }
    map.insert(extent.logical, extent);
}

unsafe fn fiemap_ioctl(fd: RawFd, header: *mut FiemapHeader, extents: *mut FiemapExtent) -> libc::c_int {
    // The kernel ABI represents `struct fiemap` followed inline by `fm_extent_count` entries of
    // `struct fiemap_extent`; we allocate the header and extent buffer separately and splice them
    // through a raw request buffer sized to match.
    let total = std::mem::size_of::<FiemapHeader>() + EXTENTS_BATCH * std::mem::size_of::<FiemapExtent>();
    let mut raw = vec![0u8; total];
    std::ptr::copy_nonoverlapping(header as *const u8, raw.as_mut_ptr(), std::mem::size_of::<FiemapHeader>());
    let rc = libc::ioctl(fd, FS_IOC_FIEMAP, raw.as_mut_ptr());
    std::ptr::copy_nonoverlapping(raw.as_ptr(), header as *mut u8, std::mem::size_of::<FiemapHeader>());
    std::ptr::copy_nonoverlapping(
        raw.as_ptr().add(std::mem::size_of::<FiemapHeader>()),
        extents as *mut u8,
        EXTENTS_BATCH * std::mem::size_of::<FiemapExtent>(),
    );
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_contiguous_extents() {
        let mut map = BTreeMap::new();
        insert_merging(&mut map, Extent { logical: 0, physical: 1000, length: 100 });
        insert_merging(&mut map, Extent { logical: 100, physical: 1100, length: 50 });
        assert_eq!(map.len(), 1);
        assert_eq!(map[&0].length, 150);
    }

    #[test]
    fn does_not_merge_discontiguous_physical() {
        let mut map = BTreeMap::new();
        insert_merging(&mut map, Extent { logical: 0, physical: 1000, length: 100 });
        insert_merging(&mut map, Extent { logical: 100, physical: 5000, length: 50 });
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn differs_detects_unmapped_range() {
        let a = ExtentMap(BTreeMap::new());
        let b = ExtentMap(BTreeMap::new());
        assert!(a.differs(&b, 10));
    }

    #[test]
    fn differs_false_for_identical_mapping() {
        let mut m = BTreeMap::new();
        m.insert(0, Extent { logical: 0, physical: 500, length: 100 });
        let a = ExtentMap(m.clone());
        let b = ExtentMap(m);
        assert!(!a.differs(&b, 100));
    }
}
