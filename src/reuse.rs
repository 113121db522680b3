//! Copying blocks between stores without recompressing them.
//!
//! Records streamed out of a store remember the block they were read from. Consecutive records
//! read from the same block share one [`BlockRun`]. A writer that receives a run whose block is
//! well used writes the block through as it is, and points its index at the records' existing
//! offsets. Runs that only use a little of their block are recompressed record by record instead.

use crate::block::{BlockBuilder, BlockEntry, GroupCompressBlock};
use crate::compressor::GroupCompressor;
use crate::error::{Error, Result};
use crate::key::Key;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Consecutive streamed records that were all read from one block.
pub struct BlockRun {
    pack: Arc<str>,
    offset: u64,
    block: Arc<GroupCompressBlock>,
    keys: Vec<Key>,
}

impl fmt::Debug for BlockRun {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BlockRun")
            .field("pack", &self.pack)
            .field("offset", &self.offset)
            .field("keys", &self.keys)
            .finish()
    }
}

// Two runs are the same if they cover the same keys of the same stored block.
impl PartialEq for BlockRun {
    fn eq(&self, other: &Self) -> bool {
        self.pack == other.pack && self.offset == other.offset && self.keys == other.keys
    }
}

impl Eq for BlockRun {}

/// What to do with a block before handing on only some of its records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compaction {
    /// At least half the content is in use. Keep the block as it is.
    Keep,
    /// The records in use sit near the front. Cut the content after this many bytes.
    Trim(usize),
    /// Recompress only the records in use.
    Rebuild,
}

/// A block holding a run's records, ready to be written to a pack.
#[derive(Clone, Debug)]
pub struct CompactBlock {
    pub bytes: Vec<u8>,
    /// Where each of the run's records lives in `bytes`, as content start and end offsets.
    pub ranges: HashMap<Key, (usize, usize)>,
}

impl BlockRun {
    /// Keys must all be entries of `block`; repeats are dropped.
    pub(crate) fn new(
        pack: Arc<str>,
        offset: u64,
        block: Arc<GroupCompressBlock>,
        keys: Vec<Key>,
    ) -> Self {
        let mut seen = HashSet::with_capacity(keys.len());
        let keys = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        Self {
            pack,
            offset,
            block,
            keys,
        }
    }

    pub fn block(&self) -> &GroupCompressBlock {
        &self.block
    }

    /// Keys streamed from the block, in stream order.
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    /// The pack and offset the block was read from.
    pub fn origin(&self) -> (&str, u64) {
        (&self.pack, self.offset)
    }

    fn entries(&self) -> Result<Vec<&BlockEntry>> {
        self.keys
            .iter()
            .map(|k| {
                self.block.entry(k).ok_or_else(|| {
                    Error::Corruption(format!(
                        "{} was read from block {}+{}, which doesn't hold it",
                        k, self.pack, self.offset
                    ))
                })
            })
            .collect()
    }

    // Content bytes used by the run, and the end of the last record used.
    fn usage(&self) -> Result<(usize, usize)> {
        let mut used = 0;
        let mut last_byte = 0;
        for entry in self.entries()? {
            used += entry.length;
            last_byte = last_byte.max(entry.end());
        }
        Ok((used, last_byte))
    }

    pub fn compaction(&self) -> Result<Compaction> {
        let (used, last_byte) = self.usage()?;
        Ok(if used * 2 >= self.block.content_len() {
            Compaction::Keep
        } else if used * 2 > last_byte {
            Compaction::Trim(last_byte)
        } else {
            Compaction::Rebuild
        })
    }

    /// Whether the block is a fully developed group worth keeping, rather than a loose
    /// collection a new group would compress better.
    ///
    /// A block is well used if the run uses at least three quarters of its content and the
    /// content reaches `full_enough` bytes, or `full_enough_mixed` bytes when the run's keys
    /// have different prefixes. A run of one record never is.
    pub fn is_well_utilized(&self, full_enough: usize, full_enough_mixed: usize) -> Result<bool> {
        if self.keys.len() < 2 {
            return Ok(false);
        }
        let (used, _) = self.usage()?;
        let size = self.block.content_len();
        if used * 4 < size * 3 {
            return Ok(false);
        }
        if size >= full_enough {
            return Ok(true);
        }
        let first = self.keys[0].prefix();
        let mixed = self.keys.iter().any(|k| k.prefix() != first);
        Ok(mixed && size >= full_enough_mixed)
    }

    /// Serialize a block holding the run's records, applying [`compaction`](Self::compaction).
    /// Rebuilt blocks are compressed with or without deltas according to `delta`.
    pub fn compact(&self, delta: bool) -> Result<CompactBlock> {
        let entries = self.entries()?;
        match self.compaction()? {
            Compaction::Keep => Ok(CompactBlock {
                bytes: self.block.raw_bytes().to_vec(),
                ranges: ranges(entries.into_iter()),
            }),
            Compaction::Trim(last_byte) => {
                let content = self.block.ensure_content(last_byte)?;
                let mut builder = BlockBuilder::new();
                for entry in self.block.entries() {
                    if entry.end() <= last_byte && self.keys.contains(&entry.key) {
                        builder.push_entry(
                            entry.key.clone(),
                            entry.kind,
                            entry.sha1,
                            entry.start,
                            entry.length,
                        );
                    }
                }
                tracing::debug!(
                    from = self.block.content_len(),
                    to = last_byte,
                    "trimming block"
                );
                Ok(CompactBlock {
                    bytes: builder.to_bytes(&content[..last_byte])?,
                    ranges: ranges(entries.into_iter()),
                })
            }
            Compaction::Rebuild => {
                let mut compressor = GroupCompressor::new(delta);
                for entry in entries.iter() {
                    let (text, sha1) = self.block.extract(&entry.key)?;
                    compressor.compress(entry.key.clone(), &text, Some(sha1))?;
                }
                let (builder, content) = compressor.flush();
                tracing::debug!(
                    from = self.block.content_len(),
                    to = content.len(),
                    "rebuilt block"
                );
                Ok(CompactBlock {
                    bytes: builder.to_bytes(&content)?,
                    ranges: ranges(builder.entries().iter()),
                })
            }
        }
    }
}

fn ranges<'a>(entries: impl Iterator<Item = &'a BlockEntry>) -> HashMap<Key, (usize, usize)> {
    entries
        .map(|e| (e.key.clone(), (e.start, e.end())))
        .collect()
}
