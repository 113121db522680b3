use crate::digest::Sha1Digest;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{convert::TryFrom, fmt};

/// Separator used when a key is flattened into a single string.
pub const KEY_SEPARATOR: char = '\0';

/// A composite key: an ordered sequence of one or more non-empty strings, compared and hashed as a
/// whole.
///
/// No part may contain NUL (the flattening separator) or a newline (the block metadata line
/// terminator).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Key(Vec<String>);

impl Key {
    pub fn new<I, S>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let parts: Vec<String> = parts.into_iter().map(Into::into).collect();
        Self::try_from(parts)
    }

    /// Parse a key flattened with [`flatten`](Self::flatten).
    pub fn from_flat(flat: &str) -> Result<Self> {
        Self::new(flat.split(KEY_SEPARATOR))
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    /// Number of parts. Always at least one.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The key with its parts joined by NUL.
    pub fn flatten(&self) -> String {
        let mut flat = String::with_capacity(self.0.iter().map(|p| p.len() + 1).sum());
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                flat.push(KEY_SEPARATOR);
            }
            flat.push_str(part);
        }
        flat
    }

    /// All parts but the last. Keys of length one share the empty prefix.
    pub fn prefix(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }

    /// Fail unless this key has exactly `len` parts.
    pub fn check_len(&self, len: usize) -> Result<()> {
        if self.0.len() != len {
            return Err(Error::InvalidKey(format!(
                "{} has {} parts, expected {}",
                self,
                self.0.len(),
                len
            )));
        }
        Ok(())
    }
}

/// Key given to an add call.
///
/// An unnamed key leaves its last part to the store, which names the text after its own
/// digest: `sha1:<hex>`. Content-addressed stores add everything this way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddKey {
    Named(Key),
    Unnamed(Vec<String>),
}

impl AddKey {
    /// A key made of `prefix` followed by the digest of whatever text is added under it.
    pub fn unnamed<I, S>(prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AddKey::Unnamed(prefix.into_iter().map(Into::into).collect())
    }

    /// The full key for a text with digest `sha1`.
    pub fn resolve(self, sha1: Sha1Digest) -> Result<Key> {
        match self {
            AddKey::Named(key) => Ok(key),
            AddKey::Unnamed(mut parts) => {
                parts.push(format!("sha1:{}", sha1));
                Key::try_from(parts)
            }
        }
    }
}

impl From<Key> for AddKey {
    fn from(key: Key) -> Self {
        AddKey::Named(key)
    }
}

impl TryFrom<Vec<String>> for Key {
    type Error = Error;
    fn try_from(parts: Vec<String>) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::InvalidKey("a key needs at least one part".into()));
        }
        for part in parts.iter() {
            if part.is_empty() {
                return Err(Error::InvalidKey(format!("empty part in {:?}", parts)));
            }
            if part.contains(KEY_SEPARATOR) || part.contains('\n') {
                return Err(Error::InvalidKey(format!(
                    "part {:?} contains a NUL or newline",
                    part
                )));
            }
        }
        Ok(Self(parts))
    }
}

impl From<Key> for Vec<String> {
    fn from(key: Key) -> Vec<String> {
        key.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", part)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Key{}", self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn flatten_roundtrip() {
        let key = Key::new(["file-id", "rev-1"]).unwrap();
        assert_eq!(key.flatten(), "file-id\0rev-1");
        assert_eq!(Key::from_flat(&key.flatten()).unwrap(), key);
        assert_eq!(key.prefix(), &["file-id".to_string()]);
        assert_eq!(key.len(), 2);
    }

    #[test]
    fn rejects_bad_parts() {
        assert!(matches!(Key::new(Vec::<String>::new()), Err(Error::InvalidKey(_))));
        assert!(matches!(Key::new(["a", ""]), Err(Error::InvalidKey(_))));
        assert!(matches!(Key::new(["a\nb"]), Err(Error::InvalidKey(_))));
        assert!(matches!(Key::new(["a\0b"]), Err(Error::InvalidKey(_))));
        assert!(Key::from_flat("a\0\0b").is_err());
    }

    #[test]
    fn single_part_prefix() {
        let key = Key::new(["rev"]).unwrap();
        assert!(key.prefix().is_empty());
        assert!(key.check_len(1).is_ok());
        assert!(key.check_len(2).is_err());
    }

    #[test]
    fn serde_validates() {
        let key = Key::new(["a", "b"]).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["a","b"]"#);
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(serde_json::from_str::<Key>(r#"["a",""]"#).is_err());
    }

    #[test]
    fn unnamed_keys() {
        let sha1 = Sha1Digest::of(b"content\n");
        let key = AddKey::unnamed(Vec::<String>::new()).resolve(sha1).unwrap();
        assert_eq!(key.parts(), &[format!("sha1:{}", sha1)]);
        let key = AddKey::unnamed(["dir"]).resolve(sha1).unwrap();
        assert_eq!(key.len(), 2);
        assert_eq!(key.prefix(), &["dir".to_string()]);
        assert!(AddKey::unnamed([""]).resolve(sha1).is_err());

        let named = Key::new(["a"]).unwrap();
        assert_eq!(AddKey::from(named.clone()).resolve(sha1).unwrap(), named);
    }

    #[test]
    fn display() {
        let key = Key::new(["a", "b"]).unwrap();
        assert_eq!(key.to_string(), r#"("a", "b")"#);
    }
}
