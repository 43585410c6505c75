// vim: tw=80
//! Block cache: an in-memory write-back cache and pread/pwrite layer over
//! the output device (spec §3 "Block cache entry", §4.3).
//!
//! The cache is the only path to the output device: every action reaches
//! it directly or indirectly (through the pad-to-block writer, the FAT
//! adapter, or the U-Boot env codec). Each 512-byte block has exactly one
//! owner at any instant (§5) because the whole crate is single-threaded
//! and the apply driver holds the only `&mut BlockCache`.

use std::collections::{BTreeSet, HashMap};

use crate::error::{FwupError, Result};

/// Bytes per addressable block (spec §4.2).
pub const BLOCK_SIZE: u64 = 512;

/// Capability the block cache writes through to. Implemented for
/// `std::fs::File` in production; tests use an in-memory `Vec<u8>`-backed
/// sink that upholds the same contract.
pub trait BlockSink {
    fn pread_raw(&mut self, buf: &mut [u8], off: u64) -> std::io::Result<usize>;
    fn pwrite_raw(&mut self, buf: &[u8], off: u64) -> std::io::Result<usize>;
    /// Hard discard: tell the device the range will never be read again.
    /// Sinks that can't support this (plain files) may no-op.
    fn trim_raw(&mut self, off: u64, len: u64) -> std::io::Result<()>;
}

#[derive(Clone, Copy)]
struct Entry {
    data: [u8; BLOCK_SIZE as usize],
    dirty: bool,
}

/// Direct-mapped write-back cache of 512-byte blocks.
pub struct BlockCache<S: BlockSink> {
    sink: S,
    blocks: HashMap<u64, Entry>,
    dirty: BTreeSet<u64>,
    /// Hard upper bound on addressable bytes, when the sink is a whole
    /// block device whose size the config's partition table must stay
    /// within (`None` for a regular file, which may grow). Set via
    /// [`BlockCache::set_max_size`]; checked in [`BlockCache::pwrite`].
    max_size: Option<u64>,
}

impl<S: BlockSink> BlockCache<S> {
    pub fn new(sink: S) -> Self {
        BlockCache { sink, blocks: HashMap::new(), dirty: BTreeSet::new(), max_size: None }
    }

    pub fn into_inner(self) -> S {
        self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Bounds every subsequent [`BlockCache::pwrite`] to `[0, max_size)`,
    /// the way a whole block device (queried via
    /// [`crate::device::block_device_size`]) refuses writes past its end
    /// (spec §6 "the sink may refuse writes past end-of-device").
    pub fn set_max_size(&mut self, max_size: u64) {
        self.max_size = Some(max_size);
    }

    fn load(&mut self, idx: u64) -> Result<Entry> {
        if let Some(e) = self.blocks.get(&idx) {
            return Ok(*e);
        }
        let mut data = [0u8; BLOCK_SIZE as usize];
        let n = self
            .sink
            .pread_raw(&mut data, idx * BLOCK_SIZE)
            .map_err(|e| FwupError::io(format!("reading block {idx}: {e}")))?;
        // Short/absent reads (e.g. past current EOF on a sparse file) are
        // treated as a block of zeros, not an error: the destination may
        // simply not have been written yet.
        if n < data.len() {
            data[n..].fill(0);
        }
        let e = Entry { data, dirty: false };
        self.blocks.insert(idx, e);
        Ok(e)
    }

    /// Reads `len` bytes starting at byte offset `off`, satisfied from
    /// cached entries where possible and falling back to device I/O.
    pub fn pread(&mut self, buf: &mut [u8], off: u64) -> Result<()> {
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(());
        }
        let mut remaining = buf;
        let mut cur = off;
        while !remaining.is_empty() {
            let idx = cur / BLOCK_SIZE;
            let in_block = (cur % BLOCK_SIZE) as usize;
            let n = std::cmp::min(remaining.len(), BLOCK_SIZE as usize - in_block);
            let entry = self.load(idx)?;
            remaining[..n].copy_from_slice(&entry.data[in_block..in_block + n]);
            remaining = &mut remaining[n..];
            cur += n as u64;
        }
        Ok(())
    }

    /// Writes `buf` at byte offset `off`. Partial-block updates are
    /// read-modify-write; full-block updates overwrite outright.
    /// `streamed` marks bulk resource-stream traffic, which is flushed
    /// through immediately to cap memory use; metadata writes
    /// (`streamed = false`) are held dirty until [`BlockCache::flush`].
    pub fn pwrite(&mut self, buf: &[u8], off: u64, streamed: bool) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if let Some(max_size) = self.max_size {
            let end = off
                .checked_add(buf.len() as u64)
                .ok_or_else(|| FwupError::io(format!("write at offset {off} overflows")))?;
            if end > max_size {
                return Err(FwupError::io(format!(
                    "write [{off}, {end}) runs past end of device ({max_size} bytes)"
                )));
            }
        }
        let mut remaining = buf;
        let mut cur = off;
        while !remaining.is_empty() {
            let idx = cur / BLOCK_SIZE;
            let in_block = (cur % BLOCK_SIZE) as usize;
            let n = std::cmp::min(remaining.len(), BLOCK_SIZE as usize - in_block);
            let full_block = in_block == 0 && n == BLOCK_SIZE as usize;
            let mut entry = if full_block {
                Entry { data: [0u8; BLOCK_SIZE as usize], dirty: true }
            } else {
                self.load(idx)?
            };
            entry.data[in_block..in_block + n].copy_from_slice(&remaining[..n]);
            entry.dirty = true;
            self.blocks.insert(idx, entry);
            if streamed {
                self.write_back(idx)?;
            } else {
                self.dirty.insert(idx);
            }
            remaining = &remaining[n..];
            cur += n as u64;
        }
        Ok(())
    }

    fn write_back(&mut self, idx: u64) -> Result<()> {
        let entry = self.blocks.get_mut(&idx).expect("block must be cached before write-back");
        if !entry.dirty {
            return Ok(());
        }
        self.sink
            .pwrite_raw(&entry.data, idx * BLOCK_SIZE)
            .map_err(|e| FwupError::io(format!("writing block {idx}: {e}")))?;
        entry.dirty = false;
        self.dirty.remove(&idx);
        Ok(())
    }

    /// Issues a trim/discard over `[off, off+len)`: invalidates covering
    /// cache entries, and forwards to the device when `hard` is set.
    pub fn trim(&mut self, off: u64, len: u64, hard: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let first = off / BLOCK_SIZE;
        let last = (off + len - 1) / BLOCK_SIZE;
        for idx in first..=last {
            self.blocks.remove(&idx);
            self.dirty.remove(&idx);
        }
        if hard {
            self.sink
                .trim_raw(off, len)
                .map_err(|e| FwupError::io(format!("trimming [{off}, {}): {e}", off + len)))?;
        }
        Ok(())
    }

    /// Writes back all dirty blocks in ascending offset order.
    pub fn flush(&mut self) -> Result<()> {
        let dirty: Vec<u64> = self.dirty.iter().copied().collect();
        for idx in dirty {
            self.write_back(idx)?;
        }
        Ok(())
    }
}

/// Sink for `--verify` mode: reads back as all-zeros and discards every
/// write, so a task can be run end-to-end (hash checks, FAT/MBR/U-Boot
/// codecs, progress accounting) without touching any real device or
/// staging file (spec §6 CLI mode `verify`).
pub struct VerifySink;

impl BlockSink for VerifySink {
    fn pread_raw(&mut self, buf: &mut [u8], _off: u64) -> std::io::Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn pwrite_raw(&mut self, buf: &[u8], _off: u64) -> std::io::Result<usize> {
        Ok(buf.len())
    }

    fn trim_raw(&mut self, _off: u64, _len: u64) -> std::io::Result<()> {
        Ok(())
    }
}

/// In-memory sink for unit tests: a growable byte buffer standing in for a
/// target device or regular file.
#[cfg(test)]
pub struct MemSink {
    pub data: Vec<u8>,
}

#[cfg(test)]
impl MemSink {
    pub fn new(len: usize) -> Self {
        MemSink { data: vec![0u8; len] }
    }
}

#[cfg(test)]
impl BlockSink for MemSink {
    fn pread_raw(&mut self, buf: &mut [u8], off: u64) -> std::io::Result<usize> {
        let off = off as usize;
        if off >= self.data.len() {
            return Ok(0);
        }
        let n = std::cmp::min(buf.len(), self.data.len() - off);
        buf[..n].copy_from_slice(&self.data[off..off + n]);
        Ok(n)
    }

    fn pwrite_raw(&mut self, buf: &[u8], off: u64) -> std::io::Result<usize> {
        let off = off as usize;
        if off + buf.len() > self.data.len() {
            self.data.resize(off + buf.len(), 0);
        }
        self.data[off..off + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn trim_raw(&mut self, off: u64, len: u64) -> std::io::Result<()> {
        let off = off as usize;
        let len = len as usize;
        if off < self.data.len() {
            let end = std::cmp::min(off + len, self.data.len());
            self.data[off..end].fill(0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwrite_then_pread_round_trips() {
        let mut cache = BlockCache::new(MemSink::new(4096));
        let payload = vec![0xABu8; 300];
        cache.pwrite(&payload, 513, false).unwrap();
        let mut out = vec![0u8; 300];
        cache.pread(&mut out, 513).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn flush_writes_dirty_blocks_in_order() {
        let mut cache = BlockCache::new(MemSink::new(4096));
        cache.pwrite(&[1u8; 512], 1024, false).unwrap();
        cache.pwrite(&[2u8; 512], 0, false).unwrap();
        cache.flush().unwrap();
        let sink = cache.into_inner();
        assert_eq!(&sink.data[0..512], &[2u8; 512][..]);
        assert_eq!(&sink.data[1024..1536], &[1u8; 512][..]);
    }

    #[test]
    fn streamed_write_goes_straight_to_device() {
        let mut cache = BlockCache::new(MemSink::new(4096));
        cache.pwrite(&[9u8; 512], 0, true).unwrap();
        // No flush() call, yet the streamed write already landed.
        assert_eq!(&cache.sink_mut().data[0..512], &[9u8; 512][..]);
    }

    #[test]
    fn partial_block_write_is_read_modify_write() {
        let mut cache = BlockCache::new(MemSink::new(512));
        cache.pwrite(&[0xFFu8; 512], 0, false).unwrap();
        cache.flush().unwrap();
        cache.pwrite(&[0x11, 0x22], 4, false).unwrap();
        cache.flush().unwrap();
        let sink = cache.into_inner();
        assert_eq!(sink.data[0], 0xFF);
        assert_eq!(sink.data[4], 0x11);
        assert_eq!(sink.data[5], 0x22);
        assert_eq!(sink.data[6], 0xFF);
    }

    #[test]
    fn pwrite_past_max_size_is_refused() {
        let mut cache = BlockCache::new(MemSink::new(1024));
        cache.set_max_size(1024);
        assert!(cache.pwrite(&[1u8; 512], 0, false).is_ok());
        let err = cache.pwrite(&[1u8; 512], 768, false).unwrap_err();
        assert!(err.to_string().contains("end of device"));
    }

    #[test]
    fn trim_invalidates_cached_entries() {
        let mut cache = BlockCache::new(MemSink::new(1024));
        cache.pwrite(&[7u8; 512], 0, false).unwrap();
        cache.trim(0, 512, true).unwrap();
        let mut out = [0u8; 512];
        cache.pread(&mut out, 0).unwrap();
        assert_eq!(out, [0u8; 512]);
    }
}
