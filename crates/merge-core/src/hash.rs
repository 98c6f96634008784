use crate::digest::{hash_reader, Digest};
use crate::pregroup::{HashState, PregroupedFile};
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;

const XATTR_NAME: &str = "user.sha512\0";

/// Matches the walker's stack sizing (`walk::WALK_THREADS`'s workers) per SPEC_FULL.md §4.9.
const HASH_STACK_SIZE: usize = 2 * 1024 * 1024;

struct Cursors {
    files: Vec<PregroupedFile>,
    digests: Vec<Option<Digest>>,
    prehash: usize,
    preprint: usize,
}

/// Hashes every `Pending` file in `files` (in parallel, order-independent) and prints one
/// `digest  path` line per `Ok` or resolved `Backref` file to `out`, in the *original* list order.
///
/// Uses `2 * available_parallelism()` worker threads, matching the original's
/// `2 * sysconf(_SC_NPROCESSORS_ONLN)` pool size: this workload interleaves file I/O and CPU
/// hashing, so oversubscribing the CPU count keeps both busy. Two cursors under one mutex let
/// hashing run out of order while printing stays strictly in order: `prehash` hands out the next
/// file to hash; `preprint` only advances once every file up to it has left the `Pending` state.
pub fn hash_chain<W: Write + Send>(files: Vec<PregroupedFile>, cache: bool, out: &mut W) {
    let n = files.len();
    let digests = vec![None; n];
    let state = Arc::new(Mutex::new(Cursors { files, digests, prehash: 0, preprint: 0 }));
    let out = Arc::new(Mutex::new(out));

    let n_threads = 2 * thread::available_parallelism().map(|p| p.get()).unwrap_or(1);
    thread::scope(|scope| {
        for _ in 0..n_threads {
            let state = Arc::clone(&state);
            let out = Arc::clone(&out);
            thread::Builder::new()
                .stack_size(HASH_STACK_SIZE)
                .spawn_scoped(scope, move || hash_worker(state, out, cache))
                .expect("spawn hash worker");
        }
    });
}

fn hash_worker<W: Write + Send>(state: Arc<Mutex<Cursors>>, out: Arc<Mutex<&mut W>>, cache: bool) {
    loop {
        let idx = {
            let mut s = state.lock().unwrap();
            if s.prehash >= s.files.len() {
                break;
            }
            let idx = s.prehash;
            s.prehash += 1;
            idx
        };

        let needs_hash = {
            let s = state.lock().unwrap();
            matches!(s.files[idx].state, HashState::Pending)
        };

        if needs_hash {
            let path = {
                let s = state.lock().unwrap();
                s.files[idx].record.path.clone()
            };
            let result = hash_file(&path, cache);
            let mut s = state.lock().unwrap();
            match result {
                Ok(d) => {
                    s.digests[idx] = Some(d);
                    s.files[idx].state = HashState::Ok;
                }
                Err(e) => {
                    log::warn!("hashing {}: {}", path.display(), e);
                    s.files[idx].state = HashState::Failed;
                }
            }
        }

        advance_preprint(&state, &out);
    }
    // Drain any remaining lines a slower worker left ready once everyone has finished hashing.
    advance_preprint(&state, &out);
}

fn advance_preprint<W: Write + Send>(state: &Arc<Mutex<Cursors>>, out: &Arc<Mutex<&mut W>>) {
    let mut s = state.lock().unwrap();
    let mut wrote = false;
    while s.preprint < s.files.len() {
        let idx = s.preprint;
        let pending = matches!(s.files[idx].state, HashState::Pending);
        if pending {
            break;
        }
        let digest = resolve_digest(&s, idx);
        if let Some(d) = digest {
            let path = &s.files[idx].record.path;
            let mut out = out.lock().unwrap();
            let _ = writeln!(out, "{d}  {}", path.display());
            wrote = true;
        }
        s.preprint += 1;
    }
    if wrote {
        let mut out = out.lock().unwrap();
        let _ = out.flush();
    }
}

fn resolve_digest(cursors: &Cursors, idx: usize) -> Option<Digest> {
    match &cursors.files[idx].state {
        HashState::Ok => cursors.digests[idx],
        HashState::Backref(target) => resolve_digest(cursors, *target),
        HashState::Pending | HashState::Failed => None,
    }
}

/// Hashes one file, consulting (and maintaining) the `user.sha512` xattr cache when `cache` is
/// set. The cache record is `mtime_sec (8 BE bytes) || mtime_nsec (4 BE bytes) || digest (64
/// bytes)`. A cache hit requires both time fields to match exactly; after hashing, the record is
/// rewritten only if the mtime observed before reading still matches after, so a file mutated
/// mid-hash is never cached with a stale digest.
fn hash_file(path: &Path, cache: bool) -> std::io::Result<Digest> {
    let file = std::fs::File::open(path)?;

    if cache {
        let meta_before = file.metadata()?;
        if let Some(d) = read_cached(&file, &meta_before) {
            return Ok(d);
        }
        let digest = hash_reader(&file)?;
        let meta_after = file.metadata()?;
        if meta_before.mtime() == meta_after.mtime() && meta_before.mtime_nsec() == meta_after.mtime_nsec() {
            write_cached(&file, &meta_after, &digest);
        }
        return Ok(digest);
    }

    hash_reader(&file)
}

fn read_cached(file: &std::fs::File, meta: &std::fs::Metadata) -> Option<Digest> {
    let mut buf = [0u8; 12 + crate::digest::DIGEST_LEN];
    let n = unsafe {
        libc::fgetxattr(
            std::os::unix::io::AsRawFd::as_raw_fd(file),
            XATTR_NAME.as_ptr() as *const libc::c_char,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    };
    if n != buf.len() as isize {
        return None;
    }
    let stored_sec = u64::from_be_bytes(buf[0..8].try_into().unwrap());
    let stored_nsec = u32::from_be_bytes(buf[8..12].try_into().unwrap());
    if stored_sec != meta.mtime() as u64 || stored_nsec != meta.mtime_nsec() as u32 {
        return None;
    }
    let mut bytes = [0u8; crate::digest::DIGEST_LEN];
    bytes.copy_from_slice(&buf[12..]);
    Some(Digest(bytes))
}

fn write_cached(file: &std::fs::File, meta: &std::fs::Metadata, digest: &Digest) {
    let mut buf = [0u8; 12 + crate::digest::DIGEST_LEN];
    buf[0..8].copy_from_slice(&(meta.mtime() as u64).to_be_bytes());
    buf[8..12].copy_from_slice(&(meta.mtime_nsec() as u32).to_be_bytes());
    buf[12..].copy_from_slice(&digest.0);
    let rc = unsafe {
        libc::fsetxattr(
            std::os::unix::io::AsRawFd::as_raw_fd(file),
            XATTR_NAME.as_ptr() as *const libc::c_char,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
        )
    };
    if rc != 0 {
        log::debug!("fsetxattr failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walk::FileRecord;
    use tempfile::tempdir;

    fn pending(path: std::path::PathBuf) -> PregroupedFile {
        let ino = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&path).unwrap());
        PregroupedFile { record: FileRecord { path, ino }, state: HashState::Pending }
    }

    #[test]
    fn output_order_matches_input_order() {
        let dir = tempdir().unwrap();
        let mut files = Vec::new();
        for i in 0..20u64 {
            let p = dir.path().join(format!("{i:03}"));
            std::fs::write(&p, format!("contents-{i}")).unwrap();
            files.push(pending(p));
        }
        let mut out = Vec::new();
        hash_chain(files, false, &mut out);
        let text = String::from_utf8(out).unwrap();
        let paths: Vec<&str> = text.lines().map(|l| l.split("  ").nth(1).unwrap()).collect();
        let expected: Vec<String> = (0..20u64)
            .map(|i| dir.path().join(format!("{i:03}")).display().to_string())
            .collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn backref_reuses_leader_digest() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::write(&a, b"shared").unwrap();
        let mut files = vec![pending(a)];
        files[0].state = HashState::Ok;
        let mut cursors = Cursors {
            files,
            digests: vec![Some(crate::digest::hash_reader("shared".as_bytes()).unwrap())],
            prehash: 1,
            preprint: 0,
        };
        let b = dir.path().join("b");
        std::fs::write(&b, b"shared").unwrap();
        let ino = std::os::unix::fs::MetadataExt::ino(&std::fs::metadata(&b).unwrap());
        cursors.files.push(PregroupedFile {
            record: FileRecord { path: b, ino },
            state: HashState::Backref(0),
        });
        cursors.digests.push(None);
        let resolved = resolve_digest(&cursors, 1);
        assert_eq!(resolved, cursors.digests[0]);
    }
}
