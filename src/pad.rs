// vim: tw=80
//! Pad-to-block writer: buffers non-aligned writes so the block cache
//! always sees block-aligned requests for resource streams (spec §4.4).

use crate::{
    block::{BlockCache, BlockSink, BLOCK_SIZE},
    error::Result,
};

pub struct PadWriter {
    /// Byte offset at which the next unflushed partial block begins, and
    /// its contents so far.
    partial: Option<(u64, Vec<u8>)>,
}

impl PadWriter {
    pub fn new() -> Self {
        PadWriter { partial: None }
    }

    /// Writes `buf` (the next contiguous chunk of a resource stream) at
    /// destination offset `off`, splitting it into a maybe-partial prefix,
    /// full-block middle, and maybe-partial suffix.
    pub fn pwrite<S: BlockSink>(
        &mut self,
        cache: &mut BlockCache<S>,
        buf: &[u8],
        off: u64,
    ) -> Result<()> {
        let mut buf = buf;
        let mut off = off;

        if let Some((pstart, mut pbuf)) = self.partial.take() {
            let expected_off = pstart + pbuf.len() as u64;
            if off == expected_off {
                let need = BLOCK_SIZE as usize - pbuf.len();
                let take = std::cmp::min(need, buf.len());
                pbuf.extend_from_slice(&buf[..take]);
                buf = &buf[take..];
                off += take as u64;
                if pbuf.len() == BLOCK_SIZE as usize {
                    cache.pwrite(&pbuf, pstart, true)?;
                } else {
                    self.partial = Some((pstart, pbuf));
                    return Ok(());
                }
            } else {
                // Stream jumped elsewhere (e.g. the action is used
                // non-contiguously); flush what we have first.
                self.flush_into(cache, pstart, &pbuf)?;
            }
        }

        if buf.is_empty() {
            return Ok(());
        }

        let prefix_len = (off % BLOCK_SIZE) as usize;
        if prefix_len != 0 {
            let take = std::cmp::min(BLOCK_SIZE as usize - prefix_len, buf.len());
            let block_start = off - prefix_len as u64;
            if prefix_len + take == BLOCK_SIZE as usize {
                let mut full = vec![0u8; BLOCK_SIZE as usize];
                cache.pread(&mut full[..prefix_len], block_start)?;
                full[prefix_len..].copy_from_slice(&buf[..take]);
                cache.pwrite(&full, block_start, true)?;
            } else {
                self.partial = Some((block_start, {
                    let mut v = vec![0u8; prefix_len];
                    cache.pread(&mut v, block_start)?;
                    v.extend_from_slice(&buf[..take]);
                    v
                }));
                return Ok(());
            }
            buf = &buf[take..];
            off += take as u64;
        }

        let whole_blocks = buf.len() / BLOCK_SIZE as usize;
        let whole_len = whole_blocks * BLOCK_SIZE as usize;
        if whole_len > 0 {
            cache.pwrite(&buf[..whole_len], off, true)?;
            buf = &buf[whole_len..];
            off += whole_len as u64;
        }

        if !buf.is_empty() {
            self.partial = Some((off, buf.to_vec()));
        }
        Ok(())
    }

    fn flush_into<S: BlockSink>(
        &mut self,
        cache: &mut BlockCache<S>,
        start: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut padded = data.to_vec();
        padded.resize(BLOCK_SIZE as usize, 0);
        cache.pwrite(&padded, start, true)
    }

    /// Writes any remaining partial block, zero-padding to 512 bytes.
    pub fn flush<S: BlockSink>(&mut self, cache: &mut BlockCache<S>) -> Result<()> {
        if let Some((start, data)) = self.partial.take() {
            self.flush_into(cache, start, &data)?;
        }
        Ok(())
    }
}

impl Default for PadWriter {
    fn default() -> Self {
        Self::new()
    }
}
