//! The key index of a store, and the per-pack index files it's loaded from.
//!
//! Each committed pack has one index file holding a node for every key stored in the pack. An
//! index file is a zstd-compressed JSON array of [`IndexNode`]s. Index files are only ever
//! written whole and renamed into place, so a reader sees either all of a pack's nodes or none.

use crate::compress::{zstd_compress, zstd_decompress};
use crate::config::IndexTolerance;
use crate::digest::Sha1Digest;
use crate::error::{Error, Result};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Largest decompressed index file accepted.
pub const MAX_INDEX_FILE_SIZE: usize = 1 << 30;

/// Byte range of one block within its pack file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef {
    pub offset: u64,
    pub len: u64,
}

/// One key's entry in an index file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexNode {
    pub key: Key,
    pub parents: Option<Vec<Key>>,
    pub sha1: Sha1Digest,
    pub block: BlockRef,
    /// Record range within the block's content.
    pub start: usize,
    pub end: usize,
}

/// Where a key's content lives, as held by the in-memory index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub pack: Arc<str>,
    pub parents: Option<Vec<Key>>,
    pub sha1: Sha1Digest,
    pub block: BlockRef,
    pub start: usize,
    pub end: usize,
}

/// How a prospective node relates to what the index already holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Presence {
    Absent,
    /// Present, with the same parents and digest.
    Same,
    /// Present, but disagreeing. Holds a description of the disagreement.
    Conflict(String),
}

/// Compare a prospective key against an existing entry.
pub(crate) fn compare(
    key: &Key,
    parents: Option<&[Key]>,
    sha1: Sha1Digest,
    existing_parents: Option<&[Key]>,
    existing_sha1: Sha1Digest,
) -> Presence {
    if parents != existing_parents {
        Presence::Conflict(format!(
            "{} has parents {:?}, but was already stored with {:?}",
            key, parents, existing_parents
        ))
    } else if sha1 != existing_sha1 {
        Presence::Conflict(format!(
            "{} has sha1 {}, but was already stored with {}",
            key, sha1, existing_sha1
        ))
    } else {
        Presence::Same
    }
}

/// Map from key to location, built from every loaded index file.
#[derive(Debug)]
pub struct PackIndex {
    graph: bool,
    tolerance: IndexTolerance,
    entries: HashMap<Key, IndexEntry>,
    packs: BTreeSet<Arc<str>>,
    problems: Vec<String>,
}

impl PackIndex {
    pub fn new(graph: bool, tolerance: IndexTolerance) -> Self {
        Self {
            graph,
            tolerance,
            entries: HashMap::new(),
            packs: BTreeSet::new(),
            problems: Vec::new(),
        }
    }

    /// Record an inconsistency. Fatal indices turn it into an error; tolerant ones log it and
    /// keep it for [`problems`](Self::problems).
    pub(crate) fn report(&mut self, problem: String) -> Result<()> {
        match self.tolerance {
            IndexTolerance::Fatal => Err(Error::Corruption(problem)),
            IndexTolerance::Tolerant => {
                tracing::warn!(problem = %problem, "index inconsistency");
                self.problems.push(problem);
                Ok(())
            }
        }
    }

    fn check_parents(&self, node: &IndexNode) -> Option<String> {
        match (self.graph, &node.parents) {
            (false, Some(_)) => Some(format!("{}: parents in parentless index", node.key)),
            (true, None) => Some(format!("{}: no parents in graph index", node.key)),
            _ => None,
        }
    }

    /// Add the nodes of a committed pack. A fatal index adds nothing if any node is
    /// inconsistent; a tolerant one skips just the inconsistent nodes.
    pub fn add_records(&mut self, pack: &str, nodes: Vec<IndexNode>) -> Result<()> {
        let mut accepted: HashMap<Key, IndexNode> = HashMap::with_capacity(nodes.len());
        let mut order = Vec::with_capacity(nodes.len());
        let mut problems = Vec::new();
        for node in nodes {
            if let Some(problem) = self.check_parents(&node) {
                problems.push(problem);
                continue;
            }
            if node.start > node.end {
                problems.push(format!(
                    "{}: bad record range {}..{}",
                    node.key, node.start, node.end
                ));
                continue;
            }
            let existing = accepted
                .get(&node.key)
                .map(|n| (n.parents.as_deref(), n.sha1))
                .or_else(|| {
                    self.entries
                        .get(&node.key)
                        .map(|e| (e.parents.as_deref(), e.sha1))
                });
            match existing {
                None => {
                    order.push(node.key.clone());
                    accepted.insert(node.key.clone(), node);
                }
                Some((parents, sha1)) => {
                    if let Presence::Conflict(problem) =
                        compare(&node.key, node.parents.as_deref(), node.sha1, parents, sha1)
                    {
                        problems.push(problem);
                    }
                }
            }
        }
        if self.tolerance == IndexTolerance::Fatal {
            if let Some(problem) = problems.into_iter().next() {
                return Err(Error::Corruption(format!("in pack {}: {}", pack, problem)));
            }
        } else {
            for problem in problems {
                self.report(format!("in pack {}: {}", pack, problem))?;
            }
        }

        let pack: Arc<str> = Arc::from(pack);
        self.packs.insert(pack.clone());
        for key in order {
            if let Some(node) = accepted.remove(&key) {
                self.entries.insert(
                    node.key,
                    IndexEntry {
                        pack: pack.clone(),
                        parents: node.parents,
                        sha1: node.sha1,
                        block: node.block,
                        start: node.start,
                        end: node.end,
                    },
                );
            }
        }
        Ok(())
    }

    /// How a key with the given parents and digest relates to what's already indexed.
    pub fn presence(&self, key: &Key, parents: Option<&[Key]>, sha1: Sha1Digest) -> Presence {
        match self.entries.get(key) {
            None => Presence::Absent,
            Some(e) => compare(key, parents, sha1, e.parents.as_deref(), e.sha1),
        }
    }

    pub fn get(&self, key: &Key) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    pub fn contains_pack(&self, pack: &str) -> bool {
        self.packs.contains(pack)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of all loaded packs, sorted.
    pub fn packs(&self) -> impl Iterator<Item = &str> {
        self.packs.iter().map(|p| &**p)
    }

    /// Inconsistencies reported so far. Always empty for a fatal index.
    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    pub fn tolerance(&self) -> IndexTolerance {
        self.tolerance
    }
}

/// Write `nodes` as an index file at `path`, synced to disk before returning.
pub fn write_index_file(path: &Path, nodes: &[IndexNode], level: i32) -> Result<()> {
    let json = serde_json::to_vec(nodes)?;
    let compressed = zstd_compress(&json, level)?;
    let mut file = File::create(path)?;
    file.write_all(&compressed)?;
    file.sync_all()?;
    Ok(())
}

pub fn read_index_file(path: &Path) -> Result<Vec<IndexNode>> {
    let compressed = fs::read(path)?;
    let json = zstd_decompress(&compressed, MAX_INDEX_FILE_SIZE)?;
    Ok(serde_json::from_slice(&json)?)
}
