use crate::error::Error;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{convert::TryFrom, fmt, str::FromStr};

/// A SHA-1 digest of some content.
///
/// Rendered as 40 lowercase hex characters, which is also its form in block metadata and index
/// nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sha1Digest([u8; 20]);

impl Sha1Digest {
    /// Digest of the empty string.
    pub const NULL: Sha1Digest = Sha1Digest([
        0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60, 0x18,
        0x90, 0xaf, 0xd8, 0x07, 0x09,
    ]);

    pub fn of(bytes: &[u8]) -> Self {
        Self::of_chunks([bytes])
    }

    /// Digest of the concatenation of `chunks`.
    pub fn of_chunks<'a, I: IntoIterator<Item = &'a [u8]>>(chunks: I) -> Self {
        let mut hasher = Sha1Hasher::new();
        for chunk in chunks {
            hasher.update(chunk);
        }
        hasher.finish()
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

/// Incremental digest of a byte stream.
#[derive(Clone, Default)]
pub struct Sha1Hasher(Sha1);

impl Sha1Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finish(self) -> Sha1Digest {
        let mut out = [0u8; 20];
        out.copy_from_slice(&self.0.finalize());
        Sha1Digest(out)
    }
}

impl FromStr for Sha1Digest {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out)
            .map_err(|e| Error::Format(format!("bad sha1 {:?}: {}", s, e)))?;
        Ok(Self(out))
    }
}

impl TryFrom<String> for Sha1Digest {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Sha1Digest> for String {
    fn from(d: Sha1Digest) -> String {
        d.to_hex()
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_digest() {
        assert_eq!(Sha1Digest::of(b""), Sha1Digest::NULL);
        assert_eq!(
            Sha1Digest::NULL.to_string(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[test]
    fn chunks_match_whole() {
        let whole = Sha1Digest::of(b"hello world\n");
        let parts = Sha1Digest::of_chunks([&b"hello "[..], &b"world\n"[..]]);
        assert_eq!(whole, parts);
        let mut hasher = Sha1Hasher::new();
        hasher.update(b"hello");
        hasher.update(b" world\n");
        assert_eq!(hasher.finish(), whole);
    }

    #[test]
    fn parse() {
        let d = Sha1Digest::of(b"abc");
        assert_eq!(d.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(d.to_hex().parse::<Sha1Digest>().unwrap(), d);
        assert!("xyz".parse::<Sha1Digest>().is_err());
        assert!("a9993e36".parse::<Sha1Digest>().is_err());
    }
}
