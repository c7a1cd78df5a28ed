//! Chunked, cooperative file reader producing framed record batches.
//!
//! Each producer repeatedly claims a block of the current file, seeks to
//! `block * block_size`, and reads `block_size + READ_PADDING` bytes. The
//! padding lets a record that straddles the block boundary be framed by
//! the same pass; the claimant of the *next* block skips its partial first
//! line in exchange. A record whose start falls strictly past the block
//! boundary is left to the next claimant.
//!
//! Every claim, publish, and pass completion is tracked in the
//! [`BlockLedger`] so the orchestrator can tell when a file's records have
//! all been durably handled.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tracing::info;

use crate::config::READ_PADDING;
use crate::context::{ProducerContext, SharedProgress};
use crate::error::{Result, TransferError};
use crate::pipeline::{RingBuffer, halted_as_error, publish_counted};
use crate::source::{BlockLedger, BlockRef, LineBatch, SourceFileSet};
use crate::transform::BlockTransform;

/// One file-reader producer. Several readers share the same
/// [`SourceFileSet`] and cooperate through its atomic block cursors.
pub struct BlockReader {
    files: Arc<SourceFileSet>,
    ledger: Arc<BlockLedger>,
    ring: Arc<RingBuffer<LineBatch>>,
    shared: Arc<SharedProgress>,
    ctx: ProducerContext,
    transform: Option<Arc<dyn BlockTransform>>,
    open_file: Option<(usize, File)>,
    buffered: Vec<String>,
    current: Option<(BlockRef, Arc<AtomicI64>)>,
}

impl BlockReader {
    pub fn new(
        files: Arc<SourceFileSet>,
        ledger: Arc<BlockLedger>,
        ring: Arc<RingBuffer<LineBatch>>,
        shared: Arc<SharedProgress>,
        ctx: ProducerContext,
        transform: Option<Arc<dyn BlockTransform>>,
    ) -> Self {
        Self {
            files,
            ledger,
            ring,
            shared,
            ctx,
            transform,
            open_file: None,
            buffered: Vec::with_capacity(ctx.batch_size),
            current: None,
        }
    }

    /// Read until the file set is exhausted, then flush the tail batch.
    pub fn run(&mut self) -> Result<()> {
        while let Some(block) = self.files.claim_block() {
            let counter = self.ledger.begin_block(block);
            let pos = block.block * self.ctx.block_size as u64;
            if pos >= self.files.file_len(block.file) {
                // Claim past EOF: undo it and retire the file.
                counter.fetch_sub(1, Ordering::SeqCst);
                info!(path = %self.files.path(block.file).display(), "file exhausted");
                self.files.mark_done(block.file);
                continue;
            }
            self.current = Some((block, counter));
            self.read_block(block, pos)?;
            if let Some((_, counter)) = &self.current {
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        }
        if !self.buffered.is_empty() {
            self.emit_buffer()?;
        }
        Ok(())
    }

    fn read_block(&mut self, block: BlockRef, pos: u64) -> Result<()> {
        let raw = self.seek_and_read(block.file, pos)?;
        // A short read means this block reaches end-of-file.
        let eof = raw.len() < self.ctx.block_size + READ_PADDING;
        let buf = match &self.transform {
            Some(transform) => transform
                .decode(&raw)
                .map_err(|e| TransferError::io(self.files.path(block.file), e))?,
            None => raw,
        };

        let block_size = self.ctx.block_size;
        let mut skip_first = pos != 0;
        let mut cur_pos = 0usize;
        let mut reading = 0usize;
        while reading < buf.len() {
            if buf[reading] == b'\n' {
                if skip_first {
                    skip_first = false;
                } else if pos == 0 && cur_pos == 0 && self.ctx.with_header {
                    // Header record of the first block is dropped.
                } else {
                    self.handle_record(&buf[cur_pos..reading], pos == 0)?;
                }
                cur_pos = reading + 1;
                if cur_pos > block_size {
                    // Next record starts in the padding; it belongs to the
                    // claimant of the following block.
                    return Ok(());
                }
            }
            reading += 1;
        }
        // A trailing record without '\n' belongs to the block containing
        // its start, even when its end runs into the padding. A pending
        // skip_first means the start lies before this block, so a later
        // claim of this range must not re-emit it.
        if eof
            && !skip_first
            && cur_pos < buf.len()
            && !(pos == 0 && cur_pos == 0 && self.ctx.with_header)
        {
            self.handle_record(&buf[cur_pos..], pos == 0)?;
        }
        Ok(())
    }

    fn seek_and_read(&mut self, file: usize, pos: u64) -> Result<Vec<u8>> {
        let path = self.files.path(file).to_path_buf();
        let handle = match &mut self.open_file {
            Some((cached, handle)) if *cached == file => handle,
            slot => {
                let handle = File::open(&path).map_err(|e| TransferError::io(&path, e))?;
                &mut slot.insert((file, handle)).1
            }
        };
        handle
            .seek(SeekFrom::Start(pos))
            .map_err(|e| TransferError::io(&path, e))?;
        let mut buf = vec![0u8; self.ctx.block_size + READ_PADDING];
        let mut filled = 0;
        while filled < buf.len() {
            let n = handle
                .read(&mut buf[filled..])
                .map_err(|e| TransferError::io(&path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Normalize one framed record and append it to the batch buffer.
    fn handle_record(&mut self, bytes: &[u8], first_block: bool) -> Result<()> {
        let mut bytes = bytes;
        if bytes.last() == Some(&b'\r') {
            bytes = &bytes[..bytes.len() - 1];
        }
        if first_block && self.ctx.charset.is_utf() && bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
            bytes = &bytes[3..];
        }
        while bytes.last().is_some_and(|b| *b <= b' ') {
            bytes = &bytes[..bytes.len() - 1];
        }
        if bytes.is_empty() {
            return Ok(());
        }
        let line = match self.ctx.charset {
            crate::config::Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            crate::config::Charset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        };
        self.buffered.push(line);
        if self.buffered.len() >= self.ctx.batch_size {
            self.emit_buffer()?;
        }
        Ok(())
    }

    /// Publish the buffered records as one batch, attributed to the block
    /// being read at publish time.
    fn emit_buffer(&mut self) -> Result<()> {
        let lines = std::mem::replace(&mut self.buffered, Vec::with_capacity(self.ctx.batch_size));
        let block = self.current.as_ref().map(|(block, counter)| {
            counter.fetch_add(1, Ordering::SeqCst);
            *block
        });
        publish_counted(&self.ring, &self.shared, |event| event.refill(lines, block))
            .map_err(|_| halted_as_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SharedProgress;

    fn run_readers(
        input: &[u8],
        block_size: usize,
        batch_size: usize,
        producers: usize,
        with_header: bool,
    ) -> Vec<String> {
        let dir = tempfile::tempdir().unwrap();
        let path = crate::testing::write_temp_file(dir.path(), "input.csv", input);
        let files = Arc::new(SourceFileSet::open(vec![path]).unwrap());
        let ledger = Arc::new(BlockLedger::new(1));
        let ring = Arc::new(RingBuffer::with_capacity(64, LineBatch::default));
        let shared = Arc::new(SharedProgress::new(producers));
        let ctx = ProducerContext {
            block_size,
            batch_size,
            charset: crate::config::Charset::Utf8,
            with_header,
        };

        std::thread::scope(|scope| {
            for _ in 0..producers {
                let mut reader = BlockReader::new(
                    Arc::clone(&files),
                    Arc::clone(&ledger),
                    Arc::clone(&ring),
                    Arc::clone(&shared),
                    ctx,
                    None,
                );
                scope.spawn(move || reader.run().unwrap());
            }
        });

        let mut lines = Vec::new();
        while let Some(batch) = ring.try_consume(|event| {
            (std::mem::take(&mut event.lines), event.block)
        }) {
            let (batch_lines, block) = batch;
            lines.extend(batch_lines);
            if let Some(block) = block {
                ledger.note_consumed(block);
            }
            shared.note_drained();
        }
        assert!(ledger.all_settled());
        assert_eq!(shared.in_flight(), 0);
        lines
    }

    #[test]
    fn small_blocks_reassemble_every_record() {
        let input = b"alpha,1\nbeta,22\ngamma,333\ndelta,4444\nepsilon,5\n";
        for block_size in [4, 7, 16, 64] {
            for producers in [1, 2, 4] {
                let mut lines = run_readers(input, block_size, 2, producers, false);
                lines.sort();
                assert_eq!(
                    lines,
                    vec!["alpha,1", "beta,22", "delta,4444", "epsilon,5", "gamma,333"],
                    "block_size={block_size} producers={producers}"
                );
            }
        }
    }

    #[test]
    fn header_is_skipped_only_in_first_block() {
        let input = b"id,name\n1,a\n2,b\n";
        let mut lines = run_readers(input, 6, 10, 1, true);
        lines.sort();
        assert_eq!(lines, vec!["1,a", "2,b"]);
    }

    #[test]
    fn crlf_bom_and_blank_lines_are_normalized() {
        let mut input = vec![0xEF, 0xBB, 0xBF];
        input.extend_from_slice(b"first,1\r\n\r\nsecond,2\r\n   \nthird,3");
        let mut lines = run_readers(&input, 1024, 10, 1, false);
        lines.sort();
        assert_eq!(lines, vec!["first,1", "second,2", "third,3"]);
    }

    #[test]
    fn trailing_record_without_newline_is_kept_once() {
        let input = b"a,1\nb,2\nc,3";
        for block_size in [2, 5, 100] {
            let mut lines = run_readers(input, block_size, 1, 2, false);
            lines.sort();
            assert_eq!(lines, vec!["a,1", "b,2", "c,3"], "block_size={block_size}");
        }
    }

    #[test]
    fn trailing_record_spanning_whole_blocks_is_kept_whole() {
        let input = b"id,1\nlong-tail-record";
        for block_size in [2, 4, 7] {
            for producers in [1, 2, 4] {
                let mut lines = run_readers(input, block_size, 2, producers, false);
                lines.sort();
                assert_eq!(
                    lines,
                    vec!["id,1", "long-tail-record"],
                    "block_size={block_size} producers={producers}"
                );
            }
        }
    }
}
