use std::collections::BTreeMap;
use std::os::unix::fs::{DirEntryExt, FileTypeExt, MetadataExt};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Worker pool size for the I/O-bound directory walk. Matches the original's fixed 128-thread
/// pool, chosen for I/O concurrency rather than CPU parallelism.
pub const WALK_THREADS: usize = 128;

/// Matches the walker's stack sizing; hash workers size theirs the same way in `hash.rs`.
const WALK_STACK_SIZE: usize = 2 * 1024 * 1024;

/// A regular file discovered by the walk, carrying the inode captured during the same `readdir`
/// pass that found it (avoiding a second, racy `stat` later just to re-learn it).
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub path: PathBuf,
    pub ino: u64,
}

/// A path of child indices from the root of the discovery tree down to one slot. Reserved for a
/// directory at discovery time, before that directory has itself been scanned.
type Position = Vec<u32>;

enum Slot {
    File(FileRecord),
    /// A subdirectory's reserved position in the output order. `None` until scanned.
    Dir(Option<Vec<Slot>>),
}

struct PendingDir {
    path: PathBuf,
    position: Position,
}

struct SharedState {
    /// The full discovery tree, indexed by `Position`. Each directory's children occupy a
    /// contiguous, name-sorted run reserved the moment that directory is enumerated by its
    /// parent — not when the child itself finishes scanning — so the final flattened order is
    /// the tree's pre-order regardless of which worker finishes which subdirectory first.
    tree: Vec<Slot>,
    dirs: BTreeMap<(u64, u64), PendingDir>,
    scanning: usize,
    next_disambiguator: u64,
    last_picked: (u64, u64),
}

/// Concurrently walks `roots`, returning a list of regular files in depth-first, name-sorted
/// order. Coordination mirrors the original: one mutex/condvar pair guards a `BTreeMap` of
/// pending directories keyed by `(inode, disambiguator)` plus a count of currently-scanning
/// workers; workers pick the next directory whose key is greater than the last one picked,
/// wrapping around, which approximates elevator-ordered traversal when multiple workers pull
/// from the same tree concurrently. The disambiguator only breaks ties between directories that
/// happen to share an inode number (e.g. across filesystems); ordering is primarily by inode, for
/// the same seek-friendliness reason as the original.
///
/// Crucially, a directory's position in the *output* is fixed the instant its parent enumerates
/// it (see `Position`/`Slot`), independent of real-time scan-completion order — only the
/// scheduling order of *which* directory a worker picks up next is left to the elevator
/// heuristic.
pub fn walk(roots: &[PathBuf]) -> Vec<FileRecord> {
    let state = Arc::new(Mutex::new(SharedState {
        tree: Vec::new(),
        dirs: BTreeMap::new(),
        scanning: 0,
        next_disambiguator: 0,
        last_picked: (0, 0),
    }));
    let cond = Arc::new(Condvar::new());

    {
        let mut s = state.lock().unwrap();
        for root in roots {
            let ino = std::fs::metadata(root).map(|m| m.ino()).unwrap_or(0);
            let idx = s.tree.len() as u32;
            s.tree.push(Slot::Dir(None));
            let disambiguator = s.next_disambiguator;
            s.next_disambiguator += 1;
            s.dirs.insert((ino, disambiguator), PendingDir { path: root.clone(), position: vec![idx] });
        }
    }

    thread::scope(|scope| {
        for _ in 0..WALK_THREADS {
            let state = Arc::clone(&state);
            let cond = Arc::clone(&cond);
            thread::Builder::new()
                .stack_size(WALK_STACK_SIZE)
                .spawn_scoped(scope, move || scan_thread(state, cond))
                .expect("spawn walk worker");
        }
    });

    let s = state.lock().unwrap();
    let mut files = Vec::new();
    flatten(&s.tree, &mut files);
    files
}

/// Walks the discovery tree in index order, collecting every resolved file. A `Dir(None)` slot
/// (a directory that was reserved but never scanned, e.g. a permission error mid-walk) simply
/// contributes no files.
fn flatten(slots: &[Slot], out: &mut Vec<FileRecord>) {
    for slot in slots {
        match slot {
            Slot::File(f) => out.push(f.clone()),
            Slot::Dir(Some(children)) => flatten(children, out),
            Slot::Dir(None) => {}
        }
    }
}

/// Writes `children` into the tree slot reserved at `position`, recursing through already-scanned
/// ancestor directories (an ancestor is always scanned, and its slot populated, before any of its
/// descendants can be discovered and reserved).
fn splice_at(tree: &mut [Slot], position: &[u32], children: Vec<Slot>) {
    let idx = position[0] as usize;
    if position.len() == 1 {
        tree[idx] = Slot::Dir(Some(children));
        return;
    }
    match &mut tree[idx] {
        Slot::Dir(Some(sub)) => splice_at(sub, &position[1..], children),
        _ => unreachable!("walk: position path resolves through an unscanned directory"),
    }
}

fn scan_thread(state: Arc<Mutex<SharedState>>, cond: Arc<Condvar>) {
    loop {
        let mut s = state.lock().unwrap();
        loop {
            if !s.dirs.is_empty() {
                break;
            }
            if s.scanning == 0 {
                return;
            }
            s = cond.wait(s).unwrap();
        }

        let key = pick_dir_key(&s.dirs, s.last_picked);
        let dir = s.dirs.remove(&key).unwrap();
        s.last_picked = key;
        s.scanning += 1;
        drop(s);

        let (children, pending_subdirs) = scan_one_dir(&dir.path, &dir.position);

        let mut s = state.lock().unwrap();
        splice_at(&mut s.tree, &dir.position, children);
        for (ino, path, position) in pending_subdirs {
            let disambiguator = s.next_disambiguator;
            s.next_disambiguator += 1;
            s.dirs.insert((ino, disambiguator), PendingDir { path, position });
        }
        s.scanning -= 1;
        drop(s);
        cond.notify_all();
    }
}

/// Picks the smallest key strictly greater than `last`, wrapping around to the smallest overall
/// key if none exists — an elevator-style traversal order across concurrent workers.
fn pick_dir_key(dirs: &BTreeMap<(u64, u64), PendingDir>, last: (u64, u64)) -> (u64, u64) {
    dirs.range((std::ops::Bound::Excluded(last), std::ops::Bound::Unbounded))
        .next()
        .or_else(|| dirs.iter().next())
        .map(|(&k, _)| k)
        .expect("pick_dir_key called on empty dirs set")
}

/// Enumerates one directory, returning its children in name-sorted order (files resolved
/// immediately, subdirectories reserved as `Slot::Dir(None)` placeholders at their final
/// position) plus the list of subdirectories still needing a scan.
fn scan_one_dir(dir: &PathBuf, position: &[u32]) -> (Vec<Slot>, Vec<(u64, PathBuf, Position)>) {
    let mut entries: Vec<std::fs::DirEntry> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(Result::ok).collect(),
        Err(e) => {
            log::warn!("readdir {}: {}", dir.display(), e);
            return (Vec::new(), Vec::new());
        }
    };
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let mut children = Vec::with_capacity(entries.len());
    let mut pending = Vec::new();
    for entry in entries {
        let ino = entry.ino();
        let file_type = match entry.file_type() {
            Ok(ft) => ft,
            Err(e) => {
                log::warn!("{}: {}", entry.path().display(), e);
                continue;
            }
        };
        if file_type.is_dir() {
            let idx = children.len() as u32;
            children.push(Slot::Dir(None));
            let mut child_position = position.to_vec();
            child_position.push(idx);
            pending.push((ino, entry.path(), child_position));
        } else if file_type.is_file() {
            children.push(Slot::File(FileRecord { path: entry.path(), ino }));
        } else if file_type.is_symlink() || file_type.is_socket() || file_type.is_fifo() {
            log::debug!("{}: not a regular file or directory, skipping", entry.path().display());
        }
    }
    (children, pending)
}
