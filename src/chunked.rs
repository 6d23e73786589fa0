//! Splits a byte stream into fixed-size frames.
//!
//! Each file is read once, front to back, and handed to the envoy as a
//! sequence of same-sized blocks (the last one possibly shorter). This keeps
//! memory use bounded regardless of file size and gives every block a stable
//! ordinal for its key.

use std::io::Read;

/// Default block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Reads fixed-size frames from an underlying reader until it is exhausted.
///
/// ```no_run
/// # use crate::chunked::ChunkedReader;
/// # use std::fs::File;
/// # fn example() -> std::io::Result<()> {
/// let file = File::open("big.bin")?;
/// for frame in ChunkedReader::new(file, 1024 * 1024) {
///     let frame = frame?;
///     // frame.len() == 1 MiB, except possibly the last one
/// }
/// # Ok(())
/// # }
/// ```
pub struct ChunkedReader<R: Read> {
    inner: R,
    block_size: usize,
    done: bool,
}

impl<R: Read> ChunkedReader<R> {
    pub fn new(inner: R, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be nonzero");
        Self {
            inner,
            block_size,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkedReader<R> {
    type Item = std::io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.block_size];
        let mut filled = 0;

        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }

        if filled == 0 {
            self.done = true;
            return None;
        }

        buf.truncate(filled);
        if filled < self.block_size {
            self.done = true;
        }
        Some(Ok(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_into_even_frames() {
        let data = vec![0u8; 30];
        let frames: Vec<_> = ChunkedReader::new(Cursor::new(data), 10)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == 10));
    }

    #[test]
    fn last_frame_is_short() {
        let data = vec![1u8; 25];
        let frames: Vec<_> = ChunkedReader::new(Cursor::new(data), 10)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 10);
        assert_eq!(frames[1].len(), 10);
        assert_eq!(frames[2].len(), 5);
    }

    #[test]
    fn empty_input_yields_no_frames() {
        let frames: Vec<_> = ChunkedReader::new(Cursor::new(Vec::new()), 10)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn single_short_frame() {
        let data = vec![9u8; 3];
        let frames: Vec<_> = ChunkedReader::new(Cursor::new(data), 10)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(frames, vec![vec![9u8; 3]]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_frame() {
        let data = vec![0u8; 20];
        let frames: Vec<_> = ChunkedReader::new(Cursor::new(data), 10)
            .collect::<std::io::Result<_>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
    }
}
