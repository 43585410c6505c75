// vim: tw=80
//! Resource stream: yields `(buffer, data_offset)` chunks of a named
//! resource's data while the archive is read linearly (spec §3, §4.5).
//!
//! The stream is single-pass and finite. Calling the reader after EOF
//! yields a zero-length buffer, which is the sole termination signal.

use std::io::Read;

use crate::error::{FwupError, Result};

/// Bound on how much is pulled from the archive reader per chunk, keeping
/// memory use independent of resource size (spec §5).
const CHUNK_SIZE: usize = 64 * 1024;

pub struct ResourceStream<'a> {
    inner: &'a mut dyn Read,
    data_size: u64,
    consumed: u64,
}

impl<'a> ResourceStream<'a> {
    pub fn new(inner: &'a mut dyn Read, data_size: u64) -> Self {
        ResourceStream { inner, data_size, consumed: 0 }
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Reads the next chunk. Returns `(buf, data_offset)`; `buf` is empty
    /// exactly once, at EOF, and never again afterwards.
    pub fn read_chunk(&mut self) -> Result<(Vec<u8>, u64)> {
        let remaining = self.data_size - self.consumed;
        if remaining == 0 {
            return Ok((Vec::new(), self.consumed));
        }
        let want = std::cmp::min(CHUNK_SIZE as u64, remaining) as usize;
        let mut buf = vec![0u8; want];
        let mut got = 0usize;
        while got < want {
            let n = self
                .inner
                .read(&mut buf[got..])
                .map_err(|e| FwupError::io(format!("reading resource stream: {e}")))?;
            if n == 0 {
                return Err(FwupError::resource(
                    "<stream>",
                    format!(
                        "stream underrun: expected {want} bytes, got {got} \
                         before EOF"
                    ),
                ));
            }
            got += n;
        }
        let off = self.consumed;
        self.consumed += got as u64;
        Ok((buf, off))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn yields_all_bytes_then_terminates() {
        let data = vec![7u8; 200 * 1024];
        let mut cursor = Cursor::new(data.clone());
        let mut stream = ResourceStream::new(&mut cursor, data.len() as u64);
        let mut got = Vec::new();
        loop {
            let (buf, off) = stream.read_chunk().unwrap();
            if buf.is_empty() {
                break;
            }
            assert_eq!(off, got.len() as u64);
            got.extend_from_slice(&buf);
        }
        assert_eq!(got, data);
        // Calling again after EOF still yields empty, not an error.
        let (buf, _) = stream.read_chunk().unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn underrun_is_an_error() {
        let data = vec![1u8; 10];
        let mut cursor = Cursor::new(data);
        let mut stream = ResourceStream::new(&mut cursor, 100);
        assert!(stream.read_chunk().is_err());
    }
}
