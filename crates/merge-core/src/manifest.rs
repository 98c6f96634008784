use crate::digest::{Digest, DIGEST_HEX_LEN};
use crate::error::MergeError;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Two literal ASCII space separators follow the hex digest column.
const SEPARATOR: &[u8] = b"  ";
/// Shortest possible valid line: digest + separator + a one-byte path.
const MIN_LINE_LEN: usize = DIGEST_HEX_LEN + SEPARATOR.len() + 1;

/// Digest -> dentries observed so far, in first-seen order.
///
/// A digest seen exactly once is not useful for coalescing, so it is tracked in a side table
/// (`singletons`) and only promoted into `groups` on its second sighting. This keeps memory
/// proportional to the number of *duplicated* files rather than the number of files scanned.
#[derive(Default)]
pub struct Manifest {
    groups: HashMap<Digest, Vec<PathBuf>>,
    singletons: HashMap<Digest, PathBuf>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &HashMap<Digest, Vec<PathBuf>> {
        &self.groups
    }

    pub fn into_groups(self) -> HashMap<Digest, Vec<PathBuf>> {
        self.groups
    }

    /// Reads one manifest file, appending to this manifest's in-memory index.
    ///
    /// The path column is an opaque byte string (Linux filenames need not be valid UTF-8), so
    /// lines are read and parsed as raw bytes rather than through a UTF-8-validating line
    /// iterator. A malformed line — too short, a bad separator, non-hex digest characters — is
    /// reported via `log::warn!` and skipped; it does not abort ingestion. Only an I/O failure
    /// opening or reading the file itself is propagated.
    pub fn read_file(&mut self, path: &Path) -> Result<(), MergeError> {
        let file = std::fs::File::open(path).map_err(|e| MergeError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let mut line_no = 0usize;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).map_err(|e| MergeError::io(path, e))?;
            if n == 0 {
                break;
            }
            line_no += 1;
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            match parse_line(&buf) {
                Some((digest, dentry)) => self.record(digest, dentry),
                None => {
                    let err = MergeError::Parse {
                        path: path.to_path_buf(),
                        line_no,
                        reason: "malformed manifest line".to_string(),
                    };
                    log::warn!("{err}, skipping");
                }
            }
        }
        Ok(())
    }

    fn record(&mut self, digest: Digest, dentry: PathBuf) {
        if let Some(group) = self.groups.get_mut(&digest) {
            group.push(dentry);
            return;
        }
        if let Some(first) = self.singletons.remove(&digest) {
            self.groups.insert(digest, vec![first, dentry]);
            return;
        }
        self.singletons.insert(digest, dentry);
    }
}

fn parse_line(line: &[u8]) -> Option<(Digest, PathBuf)> {
    if line.len() < MIN_LINE_LEN {
        return None;
    }
    let digest_hex = std::str::from_utf8(&line[..DIGEST_HEX_LEN]).ok()?;
    let sep = &line[DIGEST_HEX_LEN..DIGEST_HEX_LEN + SEPARATOR.len()];
    if sep != SEPARATOR {
        return None;
    }
    let path_bytes = &line[DIGEST_HEX_LEN + SEPARATOR.len()..];
    if path_bytes.is_empty() {
        return None;
    }
    let digest = Digest::from_hex(digest_hex)?;
    let path = PathBuf::from(OsStr::from_bytes(path_bytes));
    Some((digest, path))
}
