// vim: tw=80
//! Incremental BLAKE2b-256 over the exact bytes fed to the output (spec
//! §2 "Hash verifier", §4.2 "Hash discipline").

use blake2::{digest::consts::U32, Blake2b, Digest};

use crate::error::{FwupError, Result};

type Blake2b256 = Blake2b<U32>;

pub struct HashVerifier {
    hasher: Blake2b256,
    expected: Option<[u8; 32]>,
}

impl HashVerifier {
    /// `expected` is the manifest's `blake2b-256` hex string for this
    /// resource, if the action context requires one (spec §4.2: every
    /// data-carrying action in a FILE context must carry one).
    pub fn new(expected_hex: &str) -> Result<Self> {
        let expected = parse_hex32(expected_hex)?;
        Ok(HashVerifier { hasher: Blake2b256::new(), expected: Some(expected) })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Consumes the verifier, comparing the accumulated digest against
    /// the expected hash. A mismatch is fatal *after* the final byte has
    /// been written (spec §4.2), never a silent corruption.
    pub fn finish(self, resource: &str) -> Result<()> {
        let digest = self.hasher.finalize();
        let expected = self.expected.expect("HashVerifier always constructed with an expected hash");
        if digest.as_slice() != &expected[..] {
            return Err(FwupError::resource(
                resource,
                format!(
                    "blake2b-256 mismatch: expected {}, computed {}",
                    hex::encode(expected),
                    hex::encode(digest)
                ),
            ));
        }
        Ok(())
    }
}

fn parse_hex32(s: &str) -> Result<[u8; 32]> {
    if s.len() != 64 {
        return Err(FwupError::config(format!(
            "blake2b-256 must be 64 hex characters, got {}",
            s.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        let hi = hex_nibble(s.as_bytes()[i * 2])?;
        let lo = hex_nibble(s.as_bytes()[i * 2 + 1])?;
        *byte = (hi << 4) | lo;
    }
    Ok(out)
}

fn hex_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(FwupError::config("blake2b-256 contains non-hex characters")),
    }
}

/// Minimal hex encoder so the crate doesn't need a `hex` dependency just
/// for error messages.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let mut s = String::with_capacity(64);
        for b in bytes.as_ref() {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}
