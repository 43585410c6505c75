// vim: tw=80
//! Output sink and host glue: a `BlockSink` over a regular file or block
//! device, block-device size discovery, trim/discard, and the framed
//! diagnostic writer used when `--framed` is passed (spec §6 "Output
//! sink", SPEC_FULL §4.12-4.13).

use std::{
    fs::File,
    io::Write,
    os::fd::AsRawFd,
    os::unix::fs::FileExt,
};

use crate::{
    block::BlockSink,
    error::{FwupError, Result},
};

/// `BLKGETSIZE64`, from `linux/fs.h`: `_IOR(0x12, 114, size_t)`.
nix::ioctl_read!(ioctl_blkgetsize64, 0x12, 114, u64);

impl BlockSink for File {
    fn pread_raw(&mut self, buf: &mut [u8], off: u64) -> std::io::Result<usize> {
        self.read_at(buf, off)
    }

    fn pwrite_raw(&mut self, buf: &[u8], off: u64) -> std::io::Result<usize> {
        self.write_at(buf, off)
    }

    fn trim_raw(&mut self, off: u64, len: u64) -> std::io::Result<()> {
        if is_block_device(self).unwrap_or(false) {
            blkdiscard(self, off, len)
        } else {
            punch_hole(self, off, len)
        }
    }
}

/// Whether `file` is a whole block device rather than a regular file.
/// Checked by the apply driver to decide whether to bound the block
/// cache to [`block_device_size`] (spec §6 "the sink may refuse writes
/// past end-of-device").
pub fn is_block_device(file: &File) -> std::io::Result<bool> {
    use std::os::unix::fs::FileTypeExt;
    Ok(file.metadata()?.file_type().is_block_device())
}

/// Returns the size in bytes of a block device opened as `file`. Used at
/// startup when the output is a whole device rather than a regular file,
/// whose size the config's partition table must stay within.
pub fn block_device_size(file: &File) -> Result<u64> {
    let fd = file.as_raw_fd();
    let mut size: u64 = 0;
    unsafe {
        ioctl_blkgetsize64(fd, &mut size)
            .map_err(|e| FwupError::io(format!("BLKGETSIZE64 ioctl: {e}")))?;
    }
    Ok(size)
}

/// Hard discard over `[off, off+len)`. Block devices get `BLKDISCARD`;
/// regular files get `fallocate(FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE)`.
fn punch_hole(file: &File, off: u64, len: u64) -> std::io::Result<()> {
    nix::fcntl::fallocate(
        file.as_raw_fd(),
        nix::fcntl::FallocateFlags::FALLOC_FL_PUNCH_HOLE
            | nix::fcntl::FallocateFlags::FALLOC_FL_KEEP_SIZE,
        off as libc::off_t,
        len as libc::off_t,
    )
    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

nix::ioctl_write_ptr!(ioctl_blkdiscard, 0x12, 119, [u64; 2]);

fn blkdiscard(file: &File, off: u64, len: u64) -> std::io::Result<()> {
    let range: [u64; 2] = [off, len];
    let fd = file.as_raw_fd();
    unsafe { ioctl_blkdiscard(fd, &range) }
        .map(|_| ())
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

/// Wraps a diagnostic sink (stderr by default) to frame every message as
/// `\xFA\xFB<u16 len LE><bytes>` and every progress update as
/// `\xFA\xFC<u16 percent LE>`, per the `--framed` CLI flag (spec §6, §7
/// "Diagnostics go to the framed stderr channel").
pub struct FramedWriter<W: Write> {
    inner: W,
    framed: bool,
}

impl<W: Write> FramedWriter<W> {
    pub fn new(inner: W, framed: bool) -> Self {
        FramedWriter { inner, framed }
    }

    pub fn message(&mut self, text: &str) {
        if self.framed {
            let bytes = text.as_bytes();
            let len = std::cmp::min(bytes.len(), u16::MAX as usize) as u16;
            let _ = self.inner.write_all(&[0xFA, 0xFB]);
            let _ = self.inner.write_all(&len.to_le_bytes());
            let _ = self.inner.write_all(&bytes[..len as usize]);
        } else {
            let _ = writeln!(self.inner, "{text}");
        }
    }

    pub fn progress(&mut self, percent: u8) {
        if self.framed {
            let _ = self.inner.write_all(&[0xFA, 0xFC]);
            let _ = self.inner.write_all(&(percent as u16).to_le_bytes());
        } else {
            let _ = writeln!(self.inner, "{percent}%");
        }
    }
}
