//! `Write` decorator that feeds buffered output through a [`FlushStage`].

use std::io::{self, Write};

use super::{FlushOutcome, FlushStage};

/// Buffers writes to the stage's flush threshold and lets the stage decide
/// what each flushed chunk becomes.
///
/// Once a chunk has been suppressed the program is considered to be
/// terminating: the replacement is written and everything after it is
/// discarded. Call [`finish`](Self::finish) to flush the tail; pending bytes
/// are lost if the interposer is simply dropped.
#[derive(Debug)]
pub struct OutputInterposer<W: Write, S: FlushStage> {
    inner: W,
    stage: S,
    buffer: Vec<u8>,
    suppressed: bool,
}

impl<W: Write, S: FlushStage> OutputInterposer<W, S> {
    pub fn new(inner: W, stage: S) -> Self {
        let capacity = stage.flush_threshold();
        Self {
            inner,
            stage,
            buffer: Vec::with_capacity(capacity),
            suppressed: false,
        }
    }

    /// Returns true once a chunk has been replaced.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed
    }

    /// Bytes waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    pub fn stage_mut(&mut self) -> &mut S {
        &mut self.stage
    }

    /// Flushes the remaining buffer through the stage and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush()?;
        Ok(self.inner)
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let capacity = self.stage.flush_threshold();
        let chunk = std::mem::replace(&mut self.buffer, Vec::with_capacity(capacity));
        if self.suppressed {
            return Ok(());
        }

        match self.stage.on_flush(&chunk) {
            FlushOutcome::Forward => self.inner.write_all(&chunk),
            FlushOutcome::Suppress(replacement) => {
                self.suppressed = true;
                self.inner.write_all(&replacement)
            }
        }
    }
}

impl<W: Write, S: FlushStage> Write for OutputInterposer<W, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.suppressed {
            return Ok(buf.len());
        }
        self.buffer.extend_from_slice(buf);
        if self.buffer.len() >= self.stage.flush_threshold() {
            self.flush_buffer()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records chunks and suppresses any chunk containing `STOP`.
    struct Recorder {
        threshold: usize,
        chunks: Vec<Vec<u8>>,
    }

    impl FlushStage for Recorder {
        fn flush_threshold(&self) -> usize {
            self.threshold
        }

        fn on_flush(&mut self, chunk: &[u8]) -> FlushOutcome {
            self.chunks.push(chunk.to_vec());
            if chunk.windows(4).any(|w| w == b"STOP") {
                FlushOutcome::Suppress(b"<error page>".to_vec())
            } else {
                FlushOutcome::Forward
            }
        }
    }

    fn recorder(threshold: usize) -> Recorder {
        Recorder {
            threshold,
            chunks: Vec::new(),
        }
    }

    #[test]
    fn test_clean_output_is_forwarded_byte_for_byte() {
        let mut interposer = OutputInterposer::new(Vec::new(), recorder(8));
        interposer.write_all(b"hello ").unwrap();
        interposer.write_all(b"world, this is fine").unwrap();
        let out = interposer.finish().unwrap();
        assert_eq!(out, b"hello world, this is fine");
    }

    #[test]
    fn test_flushes_at_threshold() {
        let mut stage = recorder(4);
        let mut interposer = OutputInterposer::new(Vec::new(), &mut stage);
        interposer.write_all(b"ab").unwrap();
        assert_eq!(interposer.pending(), 2);
        interposer.write_all(b"cd").unwrap();
        assert_eq!(interposer.pending(), 0);
        interposer.write_all(b"e").unwrap();
        interposer.finish().unwrap();
        assert_eq!(stage.chunks, vec![b"abcd".to_vec(), b"e".to_vec()]);
    }

    #[test]
    fn test_suppression_replaces_chunk_and_discards_rest() {
        let mut interposer = OutputInterposer::new(Vec::new(), recorder(4));
        interposer.write_all(b"ok..").unwrap();
        interposer.write_all(b"STOP").unwrap();
        assert!(interposer.is_suppressed());
        interposer.write_all(b"trailing output").unwrap();
        let out = interposer.finish().unwrap();
        assert_eq!(out, b"ok..<error page>");
    }

    #[test]
    fn test_oversized_write_is_one_chunk() {
        let mut stage = recorder(4);
        let mut interposer = OutputInterposer::new(Vec::new(), &mut stage);
        interposer.write_all(b"a long line that STOPs here").unwrap();
        assert!(interposer.is_suppressed());
        assert_eq!(interposer.pending(), 0);
        let out = interposer.finish().unwrap();
        assert_eq!(out, b"<error page>");
        assert_eq!(stage.chunks, vec![b"a long line that STOPs here".to_vec()]);
    }

    #[test]
    fn test_split_marker_across_chunks_is_not_seen() {
        let mut interposer = OutputInterposer::new(Vec::new(), recorder(4));
        interposer.write_all(b"xxST").unwrap();
        interposer.write_all(b"OPyy").unwrap();
        let out = interposer.finish().unwrap();
        assert_eq!(out, b"xxSTOPyy");
    }
}
