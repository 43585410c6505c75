// vim: tw=80
//! Archive reader/writer: a thin wrapper over the `tar` crate exposing the
//! streaming entry surface the core consumes (spec §6 "Archive surface",
//! SPEC_FULL §4.10).
//!
//! By convention the manifest (the stringified configuration) is the
//! first entry, named `meta.conf`; every entry after it is a resource
//! payload named after its `file-resource` section.

use std::io::{Read, Write};

use crate::error::{FwupError, Result};

pub const MANIFEST_ENTRY_NAME: &str = "meta.conf";

/// One entry's header, read before any of its data.
pub struct EntryHeader {
    pub name: String,
    pub total_size: u64,
}

pub fn header_of<R: Read>(entry: &tar::Entry<'_, R>) -> Result<EntryHeader> {
    let name = entry
        .path()
        .map_err(|e| FwupError::io(format!("decoding archive entry name: {e}")))?
        .to_string_lossy()
        .into_owned();
    Ok(EntryHeader { name, total_size: entry.header().size().unwrap_or(0) })
}

pub struct ArchiveReader<R: Read> {
    inner: tar::Archive<R>,
}

impl<R: Read> ArchiveReader<R> {
    pub fn new(inner: R) -> Self {
        ArchiveReader { inner: tar::Archive::new(inner) }
    }

    /// Reads and returns the manifest (the archive's first entry, which
    /// must be named [`MANIFEST_ENTRY_NAME`]), then hands back an
    /// iterator over the remaining entries so the caller can bind each
    /// resource to its task funlist and stream it — one forward pass,
    /// the only kind a non-seekable archive reader supports.
    pub fn read_manifest_then_entries(&mut self) -> Result<(String, tar::Entries<'_, R>)> {
        let mut entries = self
            .inner
            .entries()
            .map_err(|e| FwupError::io(format!("reading archive: {e}")))?;
        let mut first = entries
            .next()
            .ok_or_else(|| FwupError::format("archive has no entries (expected manifest)"))?
            .map_err(|e| FwupError::io(format!("reading manifest entry: {e}")))?;
        let header = header_of(&first)?;
        if header.name != MANIFEST_ENTRY_NAME {
            return Err(FwupError::format(format!(
                "expected first archive entry `{MANIFEST_ENTRY_NAME}`, found `{}`",
                header.name
            )));
        }
        let mut manifest = String::new();
        first
            .read_to_string(&mut manifest)
            .map_err(|e| FwupError::io(format!("reading manifest: {e}")))?;
        Ok((manifest, entries))
    }
}

/// Streaming writer, used by the `create` CLI mode: appends the manifest
/// first, then each resource's bytes in config order.
pub struct ArchiveWriter<W: Write> {
    builder: tar::Builder<W>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        ArchiveWriter { builder: tar::Builder::new(inner) }
    }

    pub fn append_manifest(&mut self, text: &str) -> Result<()> {
        self.append_bytes(MANIFEST_ENTRY_NAME, text.as_bytes())
    }

    pub fn append_bytes(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        self.builder
            .append_data(&mut header, name, data)
            .map_err(|e| FwupError::io(format!("appending `{name}` to archive: {e}")))
    }

    pub fn finish(mut self) -> Result<W> {
        self.builder
            .into_inner()
            .map_err(|e| FwupError::io(format!("finishing archive: {e}")))
    }
}
