use crate::digest::Sha1Digest;
use crate::key::Key;
use crate::reuse::BlockRun;
use std::borrow::Cow;
use std::sync::Arc;

/// The form a record's content is carried in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Fulltext,
    Chunked,
    /// The first record streamed from a stored block.
    GroupBlock,
    /// A later record streamed from the same block as the one before it.
    GroupBlockRef,
    Absent,
}

/// One version of one item, as it moves in and out of a store.
///
/// Parents are `None` when the record comes from (or goes to) a store that doesn't track the
/// ancestry graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    /// Content as a single contiguous buffer.
    Fulltext {
        key: Key,
        parents: Option<Vec<Key>>,
        sha1: Sha1Digest,
        bytes: Vec<u8>,
    },
    /// Content as a sequence of fragments, usually lines.
    Chunked {
        key: Key,
        parents: Option<Vec<Key>>,
        sha1: Sha1Digest,
        chunks: Vec<Vec<u8>>,
    },
    /// Content read out of a stored block, expanded, along with the run of records it was
    /// streamed with. A writer may copy the run's block instead of recompressing the content.
    Grouped {
        key: Key,
        parents: Option<Vec<Key>>,
        sha1: Sha1Digest,
        bytes: Vec<u8>,
        run: Arc<BlockRun>,
        /// Set on the first record of the run.
        first: bool,
    },
    /// A requested key with no content in the store.
    Absent { key: Key },
}

impl Record {
    /// Build a fulltext record, computing its digest.
    pub fn fulltext(key: Key, parents: Option<Vec<Key>>, bytes: Vec<u8>) -> Self {
        let sha1 = Sha1Digest::of(&bytes);
        Record::Fulltext {
            key,
            parents,
            sha1,
            bytes,
        }
    }

    /// Build a chunked record, computing its digest.
    pub fn chunked(key: Key, parents: Option<Vec<Key>>, chunks: Vec<Vec<u8>>) -> Self {
        let sha1 = Sha1Digest::of_chunks(chunks.iter().map(Vec::as_slice));
        Record::Chunked {
            key,
            parents,
            sha1,
            chunks,
        }
    }

    pub fn key(&self) -> &Key {
        match self {
            Record::Fulltext { key, .. }
            | Record::Chunked { key, .. }
            | Record::Grouped { key, .. }
            | Record::Absent { key } => key,
        }
    }

    pub fn parents(&self) -> Option<&[Key]> {
        match self {
            Record::Fulltext { parents, .. }
            | Record::Chunked { parents, .. }
            | Record::Grouped { parents, .. } => parents.as_deref(),
            Record::Absent { .. } => None,
        }
    }

    pub fn sha1(&self) -> Option<Sha1Digest> {
        match self {
            Record::Fulltext { sha1, .. }
            | Record::Chunked { sha1, .. }
            | Record::Grouped { sha1, .. } => Some(*sha1),
            Record::Absent { .. } => None,
        }
    }

    pub fn storage_kind(&self) -> StorageKind {
        match self {
            Record::Fulltext { .. } => StorageKind::Fulltext,
            Record::Chunked { .. } => StorageKind::Chunked,
            Record::Grouped { first: true, .. } => StorageKind::GroupBlock,
            Record::Grouped { first: false, .. } => StorageKind::GroupBlockRef,
            Record::Absent { .. } => StorageKind::Absent,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Record::Absent { .. })
    }

    /// Content as one buffer, borrowed where possible. `None` for absent records.
    pub fn bytes(&self) -> Option<Cow<'_, [u8]>> {
        match self {
            Record::Fulltext { bytes, .. } | Record::Grouped { bytes, .. } => {
                Some(Cow::Borrowed(bytes))
            }
            Record::Chunked { chunks, .. } => Some(Cow::Owned(chunks.concat())),
            Record::Absent { .. } => None,
        }
    }

    /// The run this record was streamed with, if it came out of a stored block.
    pub fn run(&self) -> Option<&Arc<BlockRun>> {
        match self {
            Record::Grouped { run, .. } => Some(run),
            _ => None,
        }
    }

    /// Take the record apart into key, parents, digest and content. Absent records give back
    /// their key instead.
    pub fn into_parts(self) -> Result<(Key, Option<Vec<Key>>, Sha1Digest, Vec<u8>), Key> {
        match self {
            Record::Fulltext {
                key,
                parents,
                sha1,
                bytes,
            }
            | Record::Grouped {
                key,
                parents,
                sha1,
                bytes,
                ..
            } => Ok((key, parents, sha1, bytes)),
            Record::Chunked {
                key,
                parents,
                sha1,
                chunks,
            } => Ok((key, parents, sha1, chunks.concat())),
            Record::Absent { key } => Err(key),
        }
    }

    /// Content split into lines, each keeping its trailing newline.
    pub fn lines(&self) -> Option<Vec<Vec<u8>>> {
        let bytes = self.bytes()?;
        Some(split_lines(&bytes))
    }
}

/// Split `bytes` after every newline. A final line without a newline is kept as-is.
pub fn split_lines(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes
        .split_inclusive(|&b| b == b'\n')
        .map(<[u8]>::to_vec)
        .collect()
}
