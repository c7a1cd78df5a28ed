//! Input file set shared by reader producers, plus the in-flight ledger
//! used for exactly-once accounting of framed blocks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{Result, TransferError};

/// Identifies one claimed block of one source file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub file: usize,
    pub block: u64,
}

/// A batch of framed records traveling through the import ring. Carries
/// the block it was framed from so consumers can settle the ledger.
#[derive(Default)]
pub struct LineBatch {
    pub lines: Vec<String>,
    pub block: Option<BlockRef>,
}

impl LineBatch {
    /// Recycle the event in place with fresh content.
    pub fn refill(&mut self, lines: Vec<String>, block: Option<BlockRef>) {
        self.lines = lines;
        self.block = block;
    }
}

/// A chunk of encoded output bytes traveling through the export ring.
#[derive(Default)]
pub struct ExportEvent {
    pub data: Vec<u8>,
}

/// The set of input files for one run. Producers cooperatively claim
/// blocks with per-file atomic cursors; no two producers ever read the
/// same block.
pub struct SourceFileSet {
    files: Vec<PathBuf>,
    lengths: Vec<u64>,
    current: AtomicUsize,
    cursors: Vec<AtomicU64>,
    done: Vec<AtomicBool>,
}

impl SourceFileSet {
    /// Stat every file up front so readers can detect end-of-file without
    /// an extra read.
    pub fn open(files: Vec<PathBuf>) -> Result<Self> {
        if files.is_empty() {
            return Err(TransferError::config("no input files to read"));
        }
        let mut lengths = Vec::with_capacity(files.len());
        for file in &files {
            let meta = std::fs::metadata(file).map_err(|e| TransferError::io(file, e))?;
            lengths.push(meta.len());
        }
        let cursors = files.iter().map(|_| AtomicU64::new(0)).collect();
        let done = files.iter().map(|_| AtomicBool::new(false)).collect();
        Ok(Self {
            files,
            lengths,
            current: AtomicUsize::new(0),
            cursors,
            done,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn path(&self, file: usize) -> &Path {
        &self.files[file]
    }

    #[must_use]
    pub fn file_len(&self, file: usize) -> u64 {
        self.lengths[file]
    }

    /// Claim the next unread block of the first unfinished file. Returns
    /// `None` once every file is exhausted.
    pub fn claim_block(&self) -> Option<BlockRef> {
        loop {
            let file = self.current.load(Ordering::Acquire);
            if file >= self.files.len() {
                return None;
            }
            if self.done[file].load(Ordering::Acquire) {
                self.advance_past(file);
                continue;
            }
            let block = self.cursors[file].fetch_add(1, Ordering::AcqRel);
            return Some(BlockRef { file, block });
        }
    }

    /// Mark a file exhausted. Claims already handed out for positions past
    /// the end read zero bytes and settle as empty passes.
    pub fn mark_done(&self, file: usize) {
        self.done[file].store(true, Ordering::Release);
        self.advance_past(file);
    }

    fn advance_past(&self, file: usize) {
        let _ = self.current.compare_exchange(
            file,
            file + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Per-block in-flight counters.
///
/// A block's counter is incremented once when claimed, once per batch
/// published from it, decremented once when the producer finishes the
/// pass, and decremented once per batch a consumer completes. A block is
/// settled exactly when its counter returns to zero, which happens only
/// after every framed record has been durably handled.
pub struct BlockLedger {
    files: Vec<Mutex<HashMap<u64, Arc<AtomicI64>>>>,
}

impl BlockLedger {
    #[must_use]
    pub fn new(file_count: usize) -> Self {
        Self {
            files: (0..file_count).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Record the claim of a block and return its counter for the pass.
    pub fn begin_block(&self, block: BlockRef) -> Arc<AtomicI64> {
        let mut map = self.files[block.file].lock().unwrap();
        let counter = map
            .entry(block.block)
            .or_insert_with(|| Arc::new(AtomicI64::new(0)));
        counter.fetch_add(1, Ordering::SeqCst);
        Arc::clone(counter)
    }

    /// A consumer finished one batch framed from `block`.
    pub fn note_consumed(&self, block: BlockRef) {
        let map = self.files[block.file].lock().unwrap();
        if let Some(counter) = map.get(&block.block) {
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True once every counter of the file has returned to zero.
    #[must_use]
    pub fn file_settled(&self, file: usize) -> bool {
        let map = self.files[file].lock().unwrap();
        map.values().all(|c| c.load(Ordering::SeqCst) == 0)
    }

    #[must_use]
    pub fn all_settled(&self) -> bool {
        (0..self.files.len()).all(|file| self.file_settled(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_temp_file;

    #[test]
    fn claims_cover_every_block_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_temp_file(dir.path(), "a.csv", b"1\n2\n");
        let b = write_temp_file(dir.path(), "b.csv", b"3\n");
        let set = SourceFileSet::open(vec![a, b]).unwrap();

        let first = set.claim_block().unwrap();
        let second = set.claim_block().unwrap();
        assert_eq!(first, BlockRef { file: 0, block: 0 });
        assert_eq!(second, BlockRef { file: 0, block: 1 });

        set.mark_done(0);
        let third = set.claim_block().unwrap();
        assert_eq!(third.file, 1);
        set.mark_done(1);
        assert!(set.claim_block().is_none());
    }

    #[test]
    fn ledger_settles_only_after_claim_publishes_and_consumes_balance() {
        let ledger = BlockLedger::new(1);
        let block = BlockRef { file: 0, block: 0 };

        let counter = ledger.begin_block(block);
        counter.fetch_add(2, Ordering::SeqCst); // two published batches
        counter.fetch_sub(1, Ordering::SeqCst); // pass finished
        assert!(!ledger.file_settled(0));

        ledger.note_consumed(block);
        assert!(!ledger.file_settled(0));
        ledger.note_consumed(block);
        assert!(ledger.file_settled(0));
        assert!(ledger.all_settled());
    }
}
