use crate::walk::FileRecord;
use std::collections::HashMap;

/// Per-file hashing state, assigned during pre-grouping and updated by the hash pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashState {
    /// Needs to be hashed; the index of the `Backref` entries (if any) pointing at it are not
    /// tracked here — callers resolve `Backref -> Pending` by following `backref_of`.
    Pending,
    /// Shares an object with the file at this index in the same file list; reuses its digest.
    Backref(usize),
    Ok,
    Failed,
}

/// One entry in the pre-grouped file list: the original record plus its hashing state.
pub struct PregroupedFile {
    pub record: FileRecord,
    pub state: HashState,
}

/// Scans `files` once, keyed by the inode the walk already captured for each entry: the first
/// file seen for a given inode is marked `Pending`; every subsequent file sharing that inode is
/// marked `Backref` pointing at the first sighting's index. Ensures a single physical object is
/// hashed at most once per scan, without a second `stat` call (the walk's own `readdir` pass
/// already resolved each entry's inode, and re-stating here would both be redundant and open a
/// TOCTOU window between the walk and the hash pipeline).
pub fn pregroup(files: Vec<FileRecord>) -> Vec<PregroupedFile> {
    let mut first_seen: HashMap<u64, usize> = HashMap::new();
    let mut out = Vec::with_capacity(files.len());

    for (idx, record) in files.into_iter().enumerate() {
        let state = match first_seen.get(&record.ino) {
            Some(&first_idx) => HashState::Backref(first_idx),
            None => {
                first_seen.insert(record.ino, idx);
                HashState::Pending
            }
        };
        out.push(PregroupedFile { record, state });
    }

    out
}
