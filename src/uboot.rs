// vim: tw=80
//! U-Boot environment codec: the CRC32-prefixed variable table written to
//! a reserved block range (spec §3 "U-Boot environment", §4.6).

use std::collections::BTreeMap;

use crate::error::{FwupError, Result};

/// `{block_offset, env_size, vars}`: an ordered (by key, via `BTreeMap`)
/// variable table, serialized as a 4-byte little-endian CRC32 followed by
/// NUL-separated `name=value` records and `0xFF` padding.
#[derive(Debug, Clone, Default)]
pub struct UbootEnv {
    pub vars: BTreeMap<String, String>,
}

impl UbootEnv {
    pub fn empty() -> Self {
        UbootEnv::default()
    }

    /// Parses a raw environment block. A CRC mismatch or malformed
    /// `name=value` record is `Format` error, per spec §4.6 — callers
    /// that want `uboot_recover`'s tolerant behavior should catch that
    /// and substitute [`UbootEnv::empty`].
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 5 {
            return Err(FwupError::format("U-Boot env block is too small"));
        }
        let stored_crc = u32::from_le_bytes(raw[0..4].try_into().unwrap());
        let body = &raw[4..];
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(FwupError::format(format!(
                "U-Boot env CRC32 mismatch: stored {stored_crc:#010x}, computed {actual_crc:#010x}"
            )));
        }
        let mut vars = BTreeMap::new();
        for record in body.split(|&b| b == 0) {
            if record.is_empty() {
                break;
            }
            let text = std::str::from_utf8(record)
                .map_err(|_| FwupError::format("U-Boot env record is not valid UTF-8"))?;
            let (name, value) = text.split_once('=').ok_or_else(|| {
                FwupError::format(format!("malformed U-Boot env record: {text:?}"))
            })?;
            vars.insert(name.to_string(), value.to_string());
        }
        Ok(UbootEnv { vars })
    }

    /// Serializes into exactly `env_size` bytes: CRC32, then sorted
    /// `name=value\0` records, then `0xFF` padding.
    pub fn serialize(&self, env_size: usize) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(env_size.saturating_sub(4));
        for (name, value) in &self.vars {
            body.extend_from_slice(name.as_bytes());
            body.push(b'=');
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        if body.len() > env_size.saturating_sub(4) {
            return Err(FwupError::format(format!(
                "U-Boot environment overflows {env_size}-byte block"
            )));
        }
        body.resize(env_size - 4, 0xFF);
        let crc = crc32fast::hash(&body);
        let mut out = Vec::with_capacity(env_size);
        out.extend_from_slice(&crc.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn setenv(&mut self, name: &str, value: &str) {
        self.vars.insert(name.to_string(), value.to_string());
    }

    pub fn unsetenv(&mut self, name: &str) {
        self.vars.remove(name);
    }
}
