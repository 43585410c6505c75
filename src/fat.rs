// vim: tw=80
//! FAT adapter: a thin façade over the `fatfs` crate exposing the
//! mkfs/pwrite/mv/rm/cp/mkdir/touch/setlabel/attrib surface spec §4.7
//! names, all addressed as a block offset within the output device with
//! the filesystem's own superblock implying its size (spec §3 "FAT
//! volume handle").
//!
//! `fatfs` never sees a file handle: [`CacheIo`] implements its I/O
//! traits directly against the block cache, so every FAT read/write is a
//! block-cache operation, same as every other action.

use std::io::SeekFrom;

use fatfs::{Dir, FileSystem, FormatVolumeOptions, FsOptions, Write as _};

use crate::{
    block::{BlockCache, BlockSink},
    error::{FwupError, Result},
    hash::HashVerifier,
    stream::ResourceStream,
};

#[derive(Debug)]
pub struct FatIoError(String);

impl std::fmt::Display for FatIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fatfs::IoError for FatIoError {
    fn is_interrupted(&self) -> bool {
        false
    }

    fn new_unexpected_eof_error() -> Self {
        FatIoError("unexpected end of FAT volume".into())
    }

    fn new_write_zero_error() -> Self {
        FatIoError("write returned zero bytes".into())
    }
}

fn fat_err<E: std::fmt::Debug>(e: fatfs::Error<E>) -> FwupError {
    FwupError::io(format!("FAT error: {e:?}"))
}

/// Exposes a `[block_offset*512, (block_offset+block_count)*512)` window
/// of the block cache as a `Read + Write + Seek` byte stream, which is
/// all `fatfs` needs from its storage parameter.
pub struct CacheIo<'a, S: BlockSink> {
    cache: &'a mut BlockCache<S>,
    base: u64,
    /// `Some(len)` for `mkfs`, which needs `Seek::End` to report the
    /// volume's true size so `fatfs` can pick a FAT type; `None` for
    /// every other action, which only ever opens an *existing* volume and
    /// trusts the BPB's own size fields the way `fatfs` itself does.
    len: Option<u64>,
    pos: u64,
}

impl<'a, S: BlockSink> CacheIo<'a, S> {
    pub fn new(cache: &'a mut BlockCache<S>, block_offset: u64, block_count: u64) -> Self {
        CacheIo { cache, base: block_offset * 512, len: Some(block_count * 512), pos: 0 }
    }

    pub fn open_ended(cache: &'a mut BlockCache<S>, block_offset: u64) -> Self {
        CacheIo { cache, base: block_offset * 512, len: None, pos: 0 }
    }

    fn remaining(&self) -> u64 {
        match self.len {
            Some(len) => len.saturating_sub(self.pos),
            None => u64::MAX - self.pos,
        }
    }
}

impl<'a, S: BlockSink> fatfs::IoBase for CacheIo<'a, S> {
    type Error = FatIoError;
}

impl<'a, S: BlockSink> fatfs::Read for CacheIo<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> std::result::Result<usize, Self::Error> {
        let n = std::cmp::min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.cache
            .pread(&mut buf[..n], self.base + self.pos)
            .map_err(|e| FatIoError(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<'a, S: BlockSink> fatfs::Write for CacheIo<'a, S> {
    fn write(&mut self, buf: &[u8]) -> std::result::Result<usize, Self::Error> {
        let n = std::cmp::min(buf.len() as u64, self.remaining()) as usize;
        if n == 0 {
            return Err(FatIoError::new_write_zero_error());
        }
        self.cache
            .pwrite(&buf[..n], self.base + self.pos, false)
            .map_err(|e| FatIoError(e.to_string()))?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::result::Result<(), Self::Error> {
        Ok(())
    }
}

impl<'a, S: BlockSink> fatfs::Seek for CacheIo<'a, S> {
    fn seek(&mut self, pos: SeekFrom) -> std::result::Result<u64, Self::Error> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(delta) => {
                let len = self.len.ok_or_else(|| {
                    FatIoError("seek from end on an open-ended FAT volume".into())
                })?;
                len as i64 + delta
            }
            SeekFrom::Current(delta) => self.pos as i64 + delta,
        };
        if new_pos < 0 {
            return Err(FatIoError("seek before start of FAT volume".into()));
        }
        self.pos = new_pos as u64;
        Ok(self.pos)
    }
}

pub struct FatAdapter;

impl FatAdapter {
    pub fn mkfs<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        block_count: u64,
    ) -> Result<()> {
        let io = CacheIo::new(cache, block_offset, block_count);
        fatfs::format_volume(io, FormatVolumeOptions::new()).map_err(fat_err)
    }

    fn open<'a, S: BlockSink>(
        cache: &'a mut BlockCache<S>,
        block_offset: u64,
    ) -> Result<FileSystem<CacheIo<'a, S>>> {
        let io = CacheIo::open_ended(cache, block_offset);
        FileSystem::new(io, FsOptions::new()).map_err(fat_err)
    }

    /// Truncate-then-stream a resource into a FAT file, verifying its
    /// hash as the bytes land (spec §4.2 `fat_write`). Returns the
    /// number of data bytes written (at least 1, for the zero-length
    /// "report one progress unit" case).
    pub fn write_resource<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        dest_path: &str,
        sparse_data_size: u64,
        ending_hole: u64,
        stream: &mut ResourceStream,
        hash: &mut HashVerifier,
    ) -> Result<u64> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (dir, name) = split_path(&root, dest_path)?;
        let mut file = dir.create_file(name).map_err(fat_err)?;
        file.truncate().map_err(fat_err)?;
        let mut written = 0u64;
        loop {
            let (buf, _off) = stream.read_chunk()?;
            if buf.is_empty() {
                break;
            }
            hash.update(&buf);
            file.write_all(&buf).map_err(fat_err)?;
            written += buf.len() as u64;
        }
        if ending_hole > 0 {
            let zeros = vec![0u8; std::cmp::min(ending_hole, 64 * 1024) as usize];
            let mut remaining = ending_hole;
            while remaining > 0 {
                let n = std::cmp::min(remaining, zeros.len() as u64) as usize;
                file.write_all(&zeros[..n]).map_err(fat_err)?;
                remaining -= n as u64;
            }
        }
        debug_assert_eq!(written, sparse_data_size);
        Ok(written)
    }

    pub fn mv<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        old: &str,
        new: &str,
        force: bool,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (old_dir, old_name) = split_path(&root, old)?;
        if old_dir.open_file(old_name).is_err() && old_dir.open_dir(old_name).is_err() {
            return Err(FwupError::resource(old, "fat_mv: source does not exist"));
        }
        let (new_dir, new_name) = split_path(&root, new)?;
        if !force && (new_dir.open_file(new_name).is_ok() || new_dir.open_dir(new_name).is_ok()) {
            return Err(FwupError::resource(new, "fat_mv: destination exists (use fat_mv!)"));
        }
        old_dir.rename(old_name, &new_dir, new_name).map_err(fat_err)
    }

    pub fn rm<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        path: &str,
        strict: bool,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (dir, name) = split_path(&root, path)?;
        match dir.remove(name) {
            Ok(()) => Ok(()),
            Err(_) if !strict => Ok(()),
            Err(e) => Err(FwupError::resource(path, format!("fat_rm!: {e:?}"))),
        }
    }

    pub fn cp<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        from: &str,
        to: &str,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (from_dir, from_name) = split_path(&root, from)?;
        let mut src = from_dir.open_file(from_name).map_err(fat_err)?;
        let (to_dir, to_name) = split_path(&root, to)?;
        let mut dst = to_dir.create_file(to_name).map_err(fat_err)?;
        dst.truncate().map_err(fat_err)?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = fatfs::Read::read(&mut src, &mut buf).map_err(fat_err)?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).map_err(fat_err)?;
        }
        Ok(())
    }

    pub fn mkdir<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        path: &str,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (dir, name) = split_path(&root, path)?;
        dir.create_dir(name).map_err(fat_err)?;
        Ok(())
    }

    pub fn touch<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        path: &str,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        let root = fs.root_dir();
        let (dir, name) = split_path(&root, path)?;
        if dir.open_file(name).is_err() {
            dir.create_file(name).map_err(fat_err)?;
        }
        Ok(())
    }

    pub fn setlabel<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        label: &str,
    ) -> Result<()> {
        let fs = Self::open(cache, block_offset)?;
        fs.set_volume_label(label).map_err(fat_err)
    }

    /// Sets S/H/R attributes on a *root-directory* entry by patching its
    /// raw 32-byte short directory entry directly: `fatfs` does not
    /// expose attribute mutation, so this walks the FAT12/16/32 root
    /// directory region by hand (spec §4.2 `fat_attrib`).
    pub fn attrib<S: BlockSink>(
        cache: &mut BlockCache<S>,
        block_offset: u64,
        path: &str,
        attrs: &str,
    ) -> Result<()> {
        let mut mask = 0u8;
        for c in attrs.chars() {
            mask |= match c {
                'S' | 's' => 0x04, // FILE_ATTRIBUTE_SYSTEM
                'H' | 'h' => 0x02, // FILE_ATTRIBUTE_HIDDEN
                'R' | 'r' => 0x01, // FILE_ATTRIBUTE_READONLY
                other => {
                    return Err(FwupError::validation(
                        "fat_attrib",
                        format!("invalid attribute character '{other}', expected [SHRshr]"),
                    ))
                }
            };
        }
        let name = path.trim_start_matches('/');
        if name.contains('/') {
            return Err(FwupError::validation(
                "fat_attrib",
                "only top-level (root directory) paths are supported",
            ));
        }
        let short = to_short_name(name)?;
        RawFatRoot::open(cache, block_offset)?.set_attrs(&short, mask)
    }
}

fn split_path<'a, S: BlockSink>(
    root: &Dir<'a, CacheIo<'a, S>>,
    path: &'a str,
) -> Result<(Dir<'a, CacheIo<'a, S>>, &'a str)> {
    let trimmed = path.trim_start_matches('/');
    match trimmed.rsplit_once('/') {
        None => Ok((root.clone(), trimmed)),
        Some((dirs, name)) => {
            let mut dir = root.clone();
            for component in dirs.split('/').filter(|c| !c.is_empty()) {
                dir = dir.open_dir(component).map_err(fat_err)?;
            }
            Ok((dir, name))
        }
    }
}

/// Encodes a plain filename as an 8.3 short name (`NAME.EXT` -> 11 bytes,
/// space-padded, uppercased). Long file names are out of scope for
/// `fat_attrib`'s raw directory-entry patch.
fn to_short_name(name: &str) -> Result<[u8; 11]> {
    let (base, ext) = name.rsplit_once('.').unwrap_or((name, ""));
    if base.len() > 8 || ext.len() > 3 {
        return Err(FwupError::validation(
            "fat_attrib",
            format!("`{name}` is not a valid 8.3 short name"),
        ));
    }
    let mut out = [b' '; 11];
    for (i, b) in base.as_bytes().iter().enumerate() {
        out[i] = b.to_ascii_uppercase();
    }
    for (i, b) in ext.as_bytes().iter().enumerate() {
        out[8 + i] = b.to_ascii_uppercase();
    }
    Ok(out)
}

/// A minimal FAT12/16/32 boot-sector and root-directory reader, used only
/// to implement `fat_attrib` (grounded in the standard FAT BPB layout,
/// the same structure every FAT driver in the reference corpus parses).
struct RawFatRoot<'a, S: BlockSink> {
    cache: &'a mut BlockCache<S>,
    part_base: u64,
    root_dir_start_byte: u64,
    root_dir_len_bytes: u64,
}

impl<'a, S: BlockSink> RawFatRoot<'a, S> {
    fn open(cache: &'a mut BlockCache<S>, block_offset: u64) -> Result<Self> {
        let part_base = block_offset * 512;
        let mut bpb = [0u8; 512];
        cache.pread(&mut bpb, part_base)?;
        let bytes_per_sector = u16::from_le_bytes([bpb[11], bpb[12]]) as u32;
        let sectors_per_cluster = bpb[13] as u32;
        let reserved_sectors = u16::from_le_bytes([bpb[14], bpb[15]]) as u32;
        let num_fats = bpb[16] as u32;
        let root_entries = u16::from_le_bytes([bpb[17], bpb[18]]) as u32;
        let fat_size16 = u16::from_le_bytes([bpb[22], bpb[23]]) as u32;
        let fat_size32 = u32::from_le_bytes([bpb[36], bpb[37], bpb[38], bpb[39]]);
        let fat_size = if fat_size16 != 0 { fat_size16 } else { fat_size32 };
        let _ = sectors_per_cluster;

        if root_entries == 0 {
            return Err(FwupError::format(
                "fat_attrib: FAT32 root directories are not supported (only FAT12/16)",
            ));
        }
        let root_dir_start_sector = reserved_sectors + num_fats * fat_size;
        let root_dir_len_bytes = (root_entries * 32) as u64;
        Ok(RawFatRoot {
            cache,
            part_base,
            root_dir_start_byte: root_dir_start_sector as u64 * bytes_per_sector as u64,
            root_dir_len_bytes,
        })
    }

    fn set_attrs(&mut self, short_name: &[u8; 11], mask: u8) -> Result<()> {
        let mut entry = [0u8; 32];
        let mut offset = 0u64;
        while offset < self.root_dir_len_bytes {
            let abs = self.part_base + self.root_dir_start_byte + offset;
            self.cache.pread(&mut entry, abs)?;
            if entry[0] == 0x00 {
                break; // end of directory
            }
            if entry[0] != 0xE5 && entry[11] != 0x0F && &entry[0..11] == short_name {
                entry[11] = (entry[11] & !0x07) | mask;
                self.cache.pwrite(&entry, abs, false)?;
                return Ok(());
            }
            offset += 32;
        }
        Err(FwupError::resource(
            String::from_utf8_lossy(short_name).trim_end(),
            "fat_attrib: no such root-directory entry",
        ))
    }
}
