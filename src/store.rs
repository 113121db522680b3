//! The pack-based versioned-content store.
//!
//! A store is a directory:
//!
//! - `packs/<name>.pack`: committed pack files, each a concatenation of serialized blocks.
//! - `indices/<name>.gix`: one index file per committed pack.
//! - `upload/`: files belonging to write groups that haven't committed yet.
//!
//! Content is written through a [`PackWriter`]. Nothing it writes is visible to readers until
//! [`PackWriter::end`] has moved the pack and then its index file into place; the index rename
//! is the commit point. Readers only ever consult the index, so they never see partial packs.

use crate::block::GroupCompressBlock;
use crate::compressor::{Compressed, GroupCompressor};
use crate::config::{IndexTolerance, StoreConfig};
use crate::digest::{Sha1Digest, Sha1Hasher};
use crate::error::{Error, Result};
use crate::index::{
    compare, read_index_file, write_index_file, BlockRef, IndexEntry, IndexNode, PackIndex,
    Presence,
};
use crate::key::{AddKey, Key};
use crate::ordering::{sort_gc_optimal, topo_sort, RecordOrder};
use crate::record::Record;
use crate::reuse::BlockRun;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

const PACKS_DIR: &str = "packs";
const INDICES_DIR: &str = "indices";
const UPLOAD_DIR: &str = "upload";
const PACK_SUFFIX: &str = "pack";
const INDEX_SUFFIX: &str = "gix";

type BlockCacheKey = (Arc<str>, u64);

/// A versioned-content store rooted at a directory.
pub struct GroupCompressStore {
    root: PathBuf,
    config: StoreConfig,
    index: RwLock<PackIndex>,
    cache: Mutex<LruCache<BlockCacheKey, Arc<GroupCompressBlock>>>,
    writer_active: AtomicBool,
}

impl std::fmt::Debug for GroupCompressStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("GroupCompressStore")
            .field("root", &self.root)
            .field("config", &self.config)
            .field("keys", &self.index.read().len())
            .finish()
    }
}

/// Outcome of [`GroupCompressStore::check`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckReport {
    /// Keys whose content was read back and verified.
    pub keys_checked: usize,
    /// Every inconsistency found, including those found while loading the index.
    pub problems: Vec<String>,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Outcome of inserting a record stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertSummary {
    /// Records added to the write group.
    pub inserted: usize,
    /// Of the records added, those copied along with their block rather than recompressed.
    pub reused: usize,
    /// Records skipped because the key was already present with the same parents and content.
    pub skipped: usize,
    /// Records skipped because they contradicted what was already present.
    pub problems: Vec<String>,
}

impl GroupCompressStore {
    /// Create the store's directories under `root`, then open it.
    pub fn create(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = root.as_ref();
        for dir in [PACKS_DIR, INDICES_DIR, UPLOAD_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Self::open(root, config)
    }

    /// Open an existing store, loading the index of every committed pack.
    pub fn open(root: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [PACKS_DIR, INDICES_DIR, UPLOAD_DIR] {
            let path = root.join(dir);
            if !path.is_dir() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} is not a store directory", path.display()),
                )));
            }
        }
        let capacity =
            NonZeroUsize::new(config.block_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let store = Self {
            index: RwLock::new(PackIndex::new(config.graph, config.tolerance)),
            cache: Mutex::new(LruCache::new(capacity)),
            writer_active: AtomicBool::new(false),
            root,
            config,
        };
        store.reload()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn pack_path(&self, name: &str) -> PathBuf {
        self.root
            .join(PACKS_DIR)
            .join(name)
            .with_extension(PACK_SUFFIX)
    }

    fn index_path(&self, name: &str) -> PathBuf {
        self.root
            .join(INDICES_DIR)
            .join(name)
            .with_extension(INDEX_SUFFIX)
    }

    /// Load index files committed since the store was opened or last reloaded. Returns how many
    /// packs were added.
    pub fn reload(&self) -> Result<usize> {
        let mut names = Vec::new();
        for dir_entry in fs::read_dir(self.root.join(INDICES_DIR))? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(INDEX_SUFFIX) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        let mut index = self.index.write();
        let mut added = 0;
        for name in names {
            if index.contains_pack(&name) {
                continue;
            }
            let nodes = match read_index_file(&self.index_path(&name)) {
                Ok(nodes) => nodes,
                Err(e) => {
                    index.report(format!("can't read index of pack {}: {}", name, e))?;
                    continue;
                }
            };
            tracing::debug!(pack = %name, keys = nodes.len(), "loading pack index");
            index.add_records(&name, nodes)?;
            added += 1;
        }
        Ok(added)
    }

    /// Open a write group. Only one may be open on a store at a time.
    pub fn start_write_group(&self) -> Result<PackWriter<'_>> {
        if self
            .writer_active
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(Error::WriteGroupActive);
        }
        tracing::debug!(root = %self.root.display(), "write group started");
        Ok(PackWriter::new(self))
    }

    /// Insert a whole record stream in its own write group, committing it at the end. Returns
    /// the summary and the name of the new pack, if anything was written.
    pub fn insert_record_stream<I>(&self, stream: I) -> Result<(InsertSummary, Option<String>)>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        let mut writer = self.start_write_group()?;
        match writer.insert_record_stream(stream) {
            Ok(summary) => {
                let pack = writer.end()?;
                Ok((summary, pack))
            }
            Err(e) => {
                writer.abort()?;
                Err(e)
            }
        }
    }

    /// All committed keys, sorted.
    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.index.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Parents of each key that is present. Keys in a store without a graph map to an empty
    /// list.
    pub fn get_parent_map(&self, keys: &[Key]) -> HashMap<Key, Vec<Key>> {
        let index = self.index.read();
        keys.iter()
            .filter_map(|k| {
                index
                    .get(k)
                    .map(|e| (k.clone(), e.parents.clone().unwrap_or_default()))
            })
            .collect()
    }

    /// Digest of each key that is present.
    pub fn get_sha1s(&self, keys: &[Key]) -> HashMap<Key, Sha1Digest> {
        let index = self.index.read();
        keys.iter()
            .filter_map(|k| index.get(k).map(|e| (k.clone(), e.sha1)))
            .collect()
    }

    /// Stream the records for `keys` in the given order.
    ///
    /// Present keys come out as [`Record::Grouped`], fully expanded, so `include_delta_closure`
    /// has no effect on the content. Keys that aren't present come out as [`Record::Absent`]:
    /// in place for [`RecordOrder::AsRequested`], ahead of everything else for the other
    /// orders.
    ///
    /// A fatal store ends the stream after the first error. A tolerant store logs the error,
    /// yields it in place of that record, and carries on with the rest.
    pub fn get_record_stream(
        &self,
        keys: &[Key],
        order: RecordOrder,
        include_delta_closure: bool,
    ) -> RecordStream<'_> {
        let index = self.index.read();
        let order = match order {
            RecordOrder::Topological if !self.config.graph => RecordOrder::Unordered,
            o => o,
        };
        tracing::debug!(
            keys = keys.len(),
            ?order,
            include_delta_closure,
            "planning record stream"
        );

        let plan: Vec<(Key, Option<IndexEntry>)> = if order == RecordOrder::AsRequested {
            keys.iter()
                .map(|k| (k.clone(), index.get(k).cloned()))
                .collect()
        } else {
            let mut seen = HashSet::with_capacity(keys.len());
            let mut absent = Vec::new();
            let mut present: HashMap<Key, IndexEntry> = HashMap::new();
            for key in keys {
                if !seen.insert(key) {
                    continue;
                }
                match index.get(key) {
                    Some(entry) => {
                        present.insert(key.clone(), entry.clone());
                    }
                    None => absent.push((key.clone(), None)),
                }
            }
            let ordered: Vec<Key> = match order {
                RecordOrder::Topological | RecordOrder::GroupCompress => {
                    let parent_map: HashMap<Key, Vec<Key>> = present
                        .iter()
                        .map(|(k, e)| (k.clone(), e.parents.clone().unwrap_or_default()))
                        .collect();
                    if order == RecordOrder::Topological {
                        topo_sort(&parent_map)
                    } else {
                        sort_gc_optimal(&parent_map)
                    }
                }
                _ => {
                    let mut ks: Vec<&Key> = present.keys().collect();
                    ks.sort_by_key(|k| {
                        let e = &present[*k];
                        (e.pack.clone(), e.block.offset, e.start)
                    });
                    ks.into_iter().cloned().collect()
                }
            };
            absent.extend(ordered.into_iter().map(|k| {
                let entry = present.remove(&k);
                (k, entry)
            }));
            absent
        };

        RecordStream {
            store: self,
            plan,
            pos: 0,
            run: None,
            failed: false,
        }
    }

    fn read_block(&self, pack: &Arc<str>, block: BlockRef) -> Result<Arc<GroupCompressBlock>> {
        let cache_key = (pack.clone(), block.offset);
        if let Some(b) = self.cache.lock().get(&cache_key) {
            return Ok(b.clone());
        }

        let path = self.pack_path(pack);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Corruption(format!(
                    "index refers to missing pack {}",
                    pack
                )))
            }
            Err(e) => return Err(e.into()),
        };
        let len = usize::try_from(block.len)
            .map_err(|_| Error::Corruption(format!("block length {} too large", block.len)))?;
        let mut bytes = vec![0u8; len];
        file.seek(SeekFrom::Start(block.offset))?;
        if let Err(e) = file.read_exact(&mut bytes) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return Err(Error::Corruption(format!(
                    "block at {}+{} runs past the end of pack {}",
                    block.offset, block.len, pack
                )));
            }
            return Err(e.into());
        }
        let parsed = Arc::new(GroupCompressBlock::from_bytes(&bytes)?);
        tracing::debug!(
            pack = %pack,
            offset = block.offset,
            entries = parsed.entries().len(),
            "read block"
        );
        self.cache.lock().put(cache_key, parsed.clone());
        Ok(parsed)
    }

    fn read_record(
        &self,
        key: &Key,
        entry: &IndexEntry,
        run: Arc<BlockRun>,
        first: bool,
    ) -> Result<Record> {
        let block = run.block();
        let Some(block_entry) = block.entry(key) else {
            return Err(Error::Corruption(format!(
                "index puts {} in pack {} at {}, but the block there doesn't hold it",
                key, entry.pack, entry.block.offset
            )));
        };
        if block_entry.start != entry.start || block_entry.end() != entry.end {
            return Err(Error::Corruption(format!(
                "index puts {} at {}..{}, block says {}..{}",
                key,
                entry.start,
                entry.end,
                block_entry.start,
                block_entry.end()
            )));
        }
        let (bytes, sha1) = block.extract(key)?;
        if sha1 != entry.sha1 {
            return Err(Error::Corruption(format!(
                "{} has sha1 {} in its block, {} in the index",
                key, sha1, entry.sha1
            )));
        }
        Ok(Record::Grouped {
            key: key.clone(),
            parents: entry.parents.clone(),
            sha1,
            bytes,
            run,
            first,
        })
    }

    /// Read back and verify every committed record.
    ///
    /// A fatal store fails on the first problem. A tolerant store reports every problem it
    /// finds, along with any found while its index was loaded.
    pub fn check(&self) -> Result<CheckReport> {
        let keys = self.keys();
        let mut report = CheckReport::default();
        for item in self.get_record_stream(&keys, RecordOrder::Unordered, false) {
            match item {
                Ok(_) => report.keys_checked += 1,
                Err(e) => report.problems.push(e.to_string()),
            }
        }
        if self.config.tolerance == IndexTolerance::Fatal {
            if let Some(problem) = report.problems.first() {
                return Err(Error::Corruption(problem.clone()));
            }
        }
        let mut problems = self.index.read().problems().to_vec();
        problems.append(&mut report.problems);
        report.problems = problems;
        tracing::info!(
            keys = report.keys_checked,
            problems = report.problems.len(),
            "store check complete"
        );
        Ok(report)
    }
}

/// Lazily reads the records planned by [`GroupCompressStore::get_record_stream`].
///
/// Consecutive records from one block come out as one [`BlockRun`].
pub struct RecordStream<'a> {
    store: &'a GroupCompressStore,
    plan: Vec<(Key, Option<IndexEntry>)>,
    pos: usize,
    // The current run, and the plan position just past it
    run: Option<(usize, Arc<BlockRun>)>,
    failed: bool,
}

impl RecordStream<'_> {
    /// The run holding plan position `i`, reading its block if `i` starts a new run.
    fn run_at(&mut self, i: usize, entry: &IndexEntry) -> Result<(Arc<BlockRun>, bool)> {
        if let Some((end, ref run)) = self.run {
            if i < end {
                return Ok((run.clone(), false));
            }
        }
        self.run = None;
        let block = self.store.read_block(&entry.pack, entry.block)?;
        let mut end = i + 1;
        let mut keys = vec![self.plan[i].0.clone()];
        while let Some((key, Some(next))) = self.plan.get(end) {
            if next.pack != entry.pack || next.block != entry.block {
                break;
            }
            keys.push(key.clone());
            end += 1;
        }
        let run = Arc::new(BlockRun::new(
            entry.pack.clone(),
            entry.block.offset,
            block,
            keys,
        ));
        self.run = Some((end, run.clone()));
        Ok((run, true))
    }
}

impl<'a> Iterator for RecordStream<'a> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let i = self.pos;
        let (key, entry) = self.plan.get(i)?;
        self.pos += 1;
        let Some(entry) = entry else {
            return Some(Ok(Record::Absent { key: key.clone() }));
        };
        let (key, entry) = (key.clone(), entry.clone());
        let result = self
            .run_at(i, &entry)
            .and_then(|(run, first)| self.store.read_record(&key, &entry, run, first));
        if let Err(ref e) = result {
            match self.store.config.tolerance {
                IndexTolerance::Fatal => self.failed = true,
                IndexTolerance::Tolerant => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable record")
                }
            }
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            (0, Some(0))
        } else {
            (0, Some(self.plan.len() - self.pos))
        }
    }
}

/// A pack file being written in `upload/`.
struct PendingPack {
    path: PathBuf,
    file: File,
    hasher: Sha1Hasher,
    len: u64,
}

/// A record compressed into the open group but not yet flushed to a block.
struct PendingRecord {
    key: Key,
    parents: Option<Vec<Key>>,
    out: Compressed,
}

/// A block copied from an inserted record stream.
struct CopiedBlock {
    block: BlockRef,
    ranges: HashMap<Key, (usize, usize)>,
}

static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

fn upload_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seed = format!(
        "{}-{}-{}",
        std::process::id(),
        nanos,
        UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed)
    );
    Sha1Digest::of(seed.as_bytes()).to_hex()
}

/// An open write group on a store.
///
/// Content added through a writer is invisible to readers until [`end`](Self::end) commits it.
/// Every writer must be ended or aborted; dropping one that wasn't is a bug, and aborts the write
/// group after logging an error.
///
/// If writing a block to the pack fails, the records of that block are gone. The writer then
/// refuses further additions and refuses to commit; it can only be aborted.
pub struct PackWriter<'a> {
    store: &'a GroupCompressStore,
    compressor: GroupCompressor,
    group: Vec<PendingRecord>,
    pack: Option<PendingPack>,
    nodes: Vec<IndexNode>,
    added: HashMap<Key, (Option<Vec<Key>>, Sha1Digest)>,
    // Prefix of the last text added, `None` for single-part keys
    last_prefix: Option<Vec<String>>,
    // Largest text in the open group, and its prefix
    max_fulltext_len: usize,
    max_fulltext_prefix: Option<Vec<String>>,
    failed: Option<String>,
    upload_leftover: Option<PathBuf>,
    committed_pack: Option<PathBuf>,
    finished: bool,
}

impl<'a> PackWriter<'a> {
    fn new(store: &'a GroupCompressStore) -> Self {
        Self {
            store,
            compressor: GroupCompressor::new(store.config.delta),
            group: Vec::new(),
            pack: None,
            nodes: Vec::new(),
            added: HashMap::new(),
            last_prefix: None,
            max_fulltext_len: 0,
            max_fulltext_prefix: None,
            failed: None,
            upload_leftover: None,
            committed_pack: None,
            finished: false,
        }
    }

    fn config(&self) -> &StoreConfig {
        &self.store.config
    }

    fn check_usable(&self) -> Result<()> {
        match self.failed {
            Some(ref why) => Err(Error::WriteGroupFailed(why.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, e: &Error) {
        if self.failed.is_none() {
            tracing::error!(error = %e, "write group lost data and can only be aborted");
            self.failed = Some(e.to_string());
        }
    }

    fn check_key(&self, key: &Key, parents: Option<&[Key]>) -> Result<()> {
        let config = self.config();
        key.check_len(config.key_length)?;
        if let Some(parents) = parents {
            if !config.graph {
                return Err(Error::Corruption(format!(
                    "{}: parents in parentless index",
                    key
                )));
            }
            for parent in parents {
                parent.check_len(config.key_length)?;
            }
        }
        Ok(())
    }

    /// How a key relates to what's committed and what this write group already holds.
    fn presence(&self, key: &Key, parents: Option<&[Key]>, sha1: Sha1Digest) -> Presence {
        if let Some((p, s)) = self.added.get(key) {
            return compare(key, parents, sha1, p.as_deref(), *s);
        }
        self.store.index.read().presence(key, parents, sha1)
    }

    fn normalize_parents(&self, parents: Option<Vec<Key>>) -> Option<Vec<Key>> {
        if self.config().graph {
            Some(parents.unwrap_or_default())
        } else {
            parents
        }
    }

    /// Add a text given as lines to the write group. Returns its digest and length.
    ///
    /// With content checks on, every line but the last must end in its only newline, and the
    /// last may only hold a newline at its end. If `nostore_sha` matches the text's digest,
    /// nothing is stored and [`Error::ExistingContent`] is returned.
    ///
    /// An [`AddKey::Unnamed`] key gets `sha1:<hex digest>` as its last part.
    ///
    /// Re-adding a key that's already present with the same parents and content does nothing.
    pub fn add_lines<K, L>(
        &mut self,
        key: K,
        parents: Option<Vec<Key>>,
        lines: &[L],
        nostore_sha: Option<Sha1Digest>,
    ) -> Result<(Sha1Digest, usize)>
    where
        K: Into<AddKey>,
        L: AsRef<[u8]>,
    {
        self.check_usable()?;
        let text: Vec<u8> = lines.iter().flat_map(|l| l.as_ref().iter().copied()).collect();
        let sha1 = Sha1Digest::of(&text);
        let key: AddKey = key.into();
        let key = key.resolve(sha1)?;
        self.check_key(&key, parents.as_deref())?;
        if self.config().check_content {
            let last = lines.len().saturating_sub(1);
            for (i, line) in lines.iter().enumerate() {
                let line = line.as_ref();
                let newlines = bytecount::count(line, b'\n');
                let ok = if i < last {
                    newlines == 1 && line.last() == Some(&b'\n')
                } else {
                    newlines == 0 || (newlines == 1 && line.last() == Some(&b'\n'))
                };
                if !ok {
                    return Err(Error::InvalidLines { key, line: i });
                }
            }
        }
        if nostore_sha == Some(sha1) {
            return Err(Error::ExistingContent(key));
        }
        let parents = self.normalize_parents(parents);
        match self.presence(&key, parents.as_deref(), sha1) {
            Presence::Absent => (),
            Presence::Same => return Ok((sha1, text.len())),
            Presence::Conflict(problem) => {
                if self.config().tolerance == IndexTolerance::Tolerant {
                    tracing::warn!(problem = %problem, "refusing conflicting add");
                }
                return Err(Error::Corruption(problem));
            }
        }
        self.add_text(key, parents, &text, sha1)?;
        Ok((sha1, text.len()))
    }

    /// Add every record of `stream` to this write group, preserving content and digests.
    ///
    /// Records streamed out of a store arrive in runs sharing a block. When block reuse is on
    /// and a run uses its block well, the block is copied into the pack once and the run's
    /// records keep their place in it. Everything else is recompressed.
    ///
    /// Absent records fail with [`Error::NotFound`], and errors in the stream itself are
    /// passed through. Records already present with identical parents and content are
    /// skipped. Records that contradict what's present fail a fatal store; a tolerant store
    /// logs them, skips them, and lists them in the summary.
    pub fn insert_record_stream<I>(&mut self, stream: I) -> Result<InsertSummary>
    where
        I: IntoIterator<Item = Result<Record>>,
    {
        self.check_usable()?;
        let full_enough = self.config().max_group_size / 4 * 3;
        let full_enough_mixed = self.config().prefix_group_size / 4 * 3;
        let mut summary = InsertSummary::default();
        // The run being copied, and its copy once written
        let mut copying: Option<(Arc<BlockRun>, Option<CopiedBlock>)> = None;
        for item in stream {
            let record = item?;
            let run = record.run().cloned();
            if let Record::Grouped {
                first: true,
                ref run,
                ..
            } = record
            {
                copying = None;
                if self.config().reuse_blocks
                    && run.is_well_utilized(full_enough, full_enough_mixed)?
                {
                    copying = Some((run.clone(), None));
                }
            }
            let (key, parents, sha1, bytes) = record.into_parts().map_err(Error::NotFound)?;
            self.check_key(&key, parents.as_deref())?;
            let actual = Sha1Digest::of(&bytes);
            if actual != sha1 {
                return Err(Error::Corruption(format!(
                    "record {} claims sha1 {}, content has {}",
                    key, sha1, actual
                )));
            }
            let parents = self.normalize_parents(parents);
            match self.presence(&key, parents.as_deref(), sha1) {
                Presence::Absent => {
                    match (copying.as_mut(), run) {
                        (Some((block_run, copy)), Some(run)) if Arc::ptr_eq(block_run, &run) => {
                            let copied = match copy.take() {
                                Some(copied) => copied,
                                None => self.copy_block(block_run)?,
                            };
                            let result = self.add_copied(key, parents, sha1, &copied);
                            *copy = Some(copied);
                            result?;
                            summary.reused += 1;
                        }
                        _ => self.add_text(key, parents, &bytes, sha1)?,
                    }
                    summary.inserted += 1;
                }
                Presence::Same => summary.skipped += 1,
                Presence::Conflict(problem) => match self.config().tolerance {
                    IndexTolerance::Fatal => return Err(Error::Corruption(problem)),
                    IndexTolerance::Tolerant => {
                        tracing::warn!(problem = %problem, "skipping conflicting record");
                        summary.problems.push(problem);
                    }
                },
            }
        }
        tracing::debug!(
            inserted = summary.inserted,
            reused = summary.reused,
            skipped = summary.skipped,
            problems = summary.problems.len(),
            "inserted record stream"
        );
        Ok(summary)
    }

    /// Write the block behind `run` into the pack, compacted to the run's records.
    fn copy_block(&mut self, run: &BlockRun) -> Result<CopiedBlock> {
        let compact = run.compact(self.config().delta)?;
        let block = self.write_block(&compact.bytes)?;
        let (pack, offset) = run.origin();
        tracing::debug!(
            from_pack = pack,
            from_offset = offset,
            keys = run.keys().len(),
            bytes = compact.bytes.len(),
            "copied block"
        );
        Ok(CopiedBlock {
            block,
            ranges: compact.ranges,
        })
    }

    fn add_copied(
        &mut self,
        key: Key,
        parents: Option<Vec<Key>>,
        sha1: Sha1Digest,
        copied: &CopiedBlock,
    ) -> Result<()> {
        let Some(&(start, end)) = copied.ranges.get(&key) else {
            return Err(Error::Corruption(format!(
                "{} isn't in the block it was streamed with",
                key
            )));
        };
        self.added.insert(key.clone(), (parents.clone(), sha1));
        self.nodes.push(IndexNode {
            key,
            parents,
            sha1,
            block: copied.block,
            start,
            end,
        });
        Ok(())
    }

    fn add_text(
        &mut self,
        key: Key,
        parents: Option<Vec<Key>>,
        text: &[u8],
        sha1: Sha1Digest,
    ) -> Result<()> {
        let prefix = (key.len() > 1).then(|| key.prefix().to_vec());
        let soft = prefix.is_some() && prefix == self.last_prefix;
        if self.max_fulltext_len < text.len() {
            self.max_fulltext_len = text.len();
            self.max_fulltext_prefix = prefix.clone();
        }

        let mut out = if soft {
            self.compressor.compress_soft(key.clone(), text, Some(sha1))?
        } else {
            self.compressor.compress(key.clone(), text, Some(sha1))?
        };
        let endpoint = self.compressor.endpoint();
        let config = self.config();
        // A group may grow to twice the size of its largest text before the limits apply
        let start_new_group = if prefix == self.max_fulltext_prefix
            && endpoint < self.max_fulltext_len.saturating_mul(2)
        {
            false
        } else if endpoint > config.max_group_size {
            true
        } else {
            prefix.is_some() && prefix != self.last_prefix && endpoint > config.prefix_group_size
        };
        self.last_prefix = prefix;

        if start_new_group && self.compressor.len() > 1 {
            // Move this text to the start of a new group
            self.compressor.pop_last();
            self.flush_group()?;
            self.max_fulltext_len = text.len();
            out = self.compressor.compress(key.clone(), text, Some(sha1))?;
        }
        self.added.insert(key.clone(), (parents.clone(), sha1));
        self.group.push(PendingRecord { key, parents, out });
        Ok(())
    }

    fn open_pack(&mut self) -> Result<&mut PendingPack> {
        if self.pack.is_none() {
            let path = self
                .store
                .root
                .join(UPLOAD_DIR)
                .join(upload_name())
                .with_extension(PACK_SUFFIX);
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)?;
            self.pack = Some(PendingPack {
                path,
                file,
                hasher: Sha1Hasher::new(),
                len: 0,
            });
        }
        self.pack
            .as_mut()
            .ok_or_else(|| Error::Io(io::Error::new(io::ErrorKind::Other, "pack file not open")))
    }

    /// Append a serialized block to the pack file. Any failure fails the write group.
    fn write_block(&mut self, bytes: &[u8]) -> Result<BlockRef> {
        let result = self.append_to_pack(bytes);
        if let Err(ref e) = result {
            self.fail(e);
        }
        result
    }

    fn append_to_pack(&mut self, bytes: &[u8]) -> Result<BlockRef> {
        let pack = self.open_pack()?;
        pack.file.write_all(bytes)?;
        pack.hasher.update(bytes);
        let block = BlockRef {
            offset: pack.len,
            len: bytes.len() as u64,
        };
        pack.len += bytes.len() as u64;
        Ok(block)
    }

    /// Seal the open group into a block and append it to the pack file.
    fn flush_group(&mut self) -> Result<()> {
        if self.compressor.is_empty() {
            return Ok(());
        }
        let compressor = std::mem::replace(
            &mut self.compressor,
            GroupCompressor::new(self.store.config.delta),
        );
        let group = std::mem::take(&mut self.group);
        let ratio = compressor.ratio();
        let (builder, content) = compressor.flush();
        let bytes = match builder.to_bytes(&content) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        let block = self.write_block(&bytes)?;
        tracing::debug!(
            keys = group.len(),
            content = content.len(),
            bytes = bytes.len(),
            ratio,
            "wrote block"
        );

        self.nodes.extend(group.into_iter().map(|r| IndexNode {
            key: r.key,
            parents: r.parents,
            sha1: r.out.sha1,
            block,
            start: r.out.start,
            end: r.out.end,
        }));
        Ok(())
    }

    /// Commit the write group. Returns the new pack's name, or `None` if nothing was added.
    ///
    /// The pack is synced and moved into `packs/`, then its index is written, synced, and moved
    /// into `indices/`. Only then do readers see the new keys. On failure the write group is
    /// aborted.
    pub fn end(mut self) -> Result<Option<String>> {
        let result = self.commit();
        if result.is_err() {
            self.abort_inner();
        }
        self.finished = true;
        result
    }

    fn commit(&mut self) -> Result<Option<String>> {
        self.check_usable()?;
        self.flush_group()?;
        let Some(pack) = self.pack.take() else {
            return Ok(None);
        };
        let PendingPack {
            path,
            file,
            hasher,
            len,
        } = pack;
        // Keep the path around so an abort can still find the file
        self.upload_leftover = Some(path.clone());
        file.sync_all()?;
        drop(file);

        let name = hasher.finish().to_hex();
        let pack_path = self.store.pack_path(&name);
        if pack_path.exists() {
            // Same name, same bytes. The pack belongs to whoever committed it first.
            fs::remove_file(&path)?;
            tracing::debug!(pack = %name, "pack is already present");
        } else {
            fs::rename(&path, &pack_path)?;
            self.committed_pack = Some(pack_path);
        }
        self.upload_leftover = None;

        let upload_index = self
            .store
            .root
            .join(UPLOAD_DIR)
            .join(&name)
            .with_extension(INDEX_SUFFIX);
        let level = self.config().index_compression_level;
        if let Err(e) = write_index_file(&upload_index, &self.nodes, level) {
            remove_if_present(&upload_index);
            return Err(e);
        }
        let index_path = self.store.index_path(&name);
        if let Err(e) = fs::rename(&upload_index, &index_path) {
            remove_if_present(&upload_index);
            return Err(e.into());
        }
        // The index file is in place: the pack is committed.
        self.committed_pack = None;

        let nodes = std::mem::take(&mut self.nodes);
        let keys = nodes.len();
        self.store.index.write().add_records(&name, nodes)?;
        tracing::info!(pack = %name, keys, bytes = len, "committed pack");
        Ok(Some(name))
    }

    /// Discard everything added to the write group.
    pub fn abort(mut self) -> Result<()> {
        self.abort_inner();
        self.finished = true;
        Ok(())
    }

    // Safe to call any number of times.
    fn abort_inner(&mut self) {
        self.compressor = GroupCompressor::new(self.store.config.delta);
        self.group.clear();
        self.nodes.clear();
        self.added.clear();
        self.last_prefix = None;
        self.max_fulltext_len = 0;
        self.max_fulltext_prefix = None;
        if let Some(pack) = self.pack.take() {
            drop(pack.file);
            remove_if_present(&pack.path);
        }
        if let Some(path) = self.upload_leftover.take() {
            remove_if_present(&path);
        }
        if let Some(path) = self.committed_pack.take() {
            remove_if_present(&path);
        }
        tracing::debug!(root = %self.store.root.display(), "write group aborted");
    }

    /// Number of texts added so far.
    pub fn len(&self) -> usize {
        self.added.len()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => (),
        Err(e) if e.kind() == io::ErrorKind::NotFound => (),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "couldn't remove file"),
    }
}

impl Drop for PackWriter<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::error!(
                root = %self.store.root.display(),
                "write group dropped without end() or abort(), aborting it"
            );
            self.abort_inner();
        }
        self.store.writer_active.store(false, Ordering::Release);
        if !self.finished && !std::thread::panicking() {
            debug_assert!(false, "PackWriter dropped without end() or abort()");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::record::StorageKind;

    fn k(s: &str) -> Key {
        Key::new([s]).unwrap()
    }

    fn k2(a: &str, b: &str) -> Key {
        Key::new([a, b]).unwrap()
    }

    fn dir_len(store: &GroupCompressStore, dir: &str) -> usize {
        fs::read_dir(store.root().join(dir)).unwrap().count()
    }

    fn read_all(store: &GroupCompressStore, keys: &[Key], order: RecordOrder) -> Vec<Record> {
        store
            .get_record_stream(keys, order, false)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn bytes_of(record: &Record) -> Vec<u8> {
        record.bytes().unwrap().into_owned()
    }

    type Parts = (Key, Option<Vec<Key>>, Sha1Digest, Vec<u8>);

    fn contents(records: Vec<Record>) -> Vec<Parts> {
        records
            .into_iter()
            .map(|r| r.into_parts().unwrap())
            .collect()
    }

    fn entry_of(store: &GroupCompressStore, key: &Key) -> IndexEntry {
        store.index.read().get(key).cloned().unwrap()
    }

    /// Store `a`, `b`, `c` as a chain, each the child of the one before.
    fn chain(store: &GroupCompressStore) -> String {
        let mut writer = store.start_write_group().unwrap();
        writer
            .add_lines(k("a"), Some(vec![]), &["common line one\n", "alpha\n"], None)
            .unwrap();
        writer
            .add_lines(k("b"), Some(vec![k("a")]), &["common line one\n", "beta\n"], None)
            .unwrap();
        writer
            .add_lines(k("c"), Some(vec![k("b")]), &["common line one\n", "gamma\n"], None)
            .unwrap();
        writer.end().unwrap().unwrap()
    }

    #[test]
    fn add_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let (sha1, len) = writer
            .add_lines(k("a"), Some(vec![]), &["hello\n", "world\n"], None)
            .unwrap();
        assert_eq!(sha1, Sha1Digest::of(b"hello\nworld\n"));
        assert_eq!(len, 12);
        writer
            .add_lines(k("b"), Some(vec![k("a")]), &["hello\n", "there\n"], None)
            .unwrap();
        assert_eq!(writer.len(), 2);
        // Nothing is visible before the write group ends
        assert!(store.keys().is_empty());
        let pack = writer.end().unwrap().unwrap();

        assert_eq!(store.keys(), vec![k("a"), k("b")]);
        assert!(store.pack_path(&pack).is_file());
        assert!(store.index_path(&pack).is_file());
        assert_eq!(dir_len(&store, UPLOAD_DIR), 0);

        let records = read_all(&store, &[k("b"), k("a")], RecordOrder::AsRequested);
        assert_eq!(records[0].key(), &k("b"));
        assert_eq!(bytes_of(&records[0]), b"hello\nthere\n");
        assert_eq!(records[0].parents(), Some(&[k("a")][..]));
        assert_eq!(bytes_of(&records[1]), b"hello\nworld\n");
        assert_eq!(records[1].sha1(), Some(sha1));

        let parents = store.get_parent_map(&[k("a"), k("b"), k("z")]);
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[&k("b")], vec![k("a")]);
        assert_eq!(store.get_sha1s(&[k("a")])[&k("a")], sha1);
    }

    #[test]
    fn as_requested_with_repeats_and_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        let keys = [k("c"), k("x"), k("a"), k("c")];
        let records = read_all(&store, &keys, RecordOrder::AsRequested);
        let got: Vec<&Key> = records.iter().map(Record::key).collect();
        assert_eq!(got, keys.iter().collect::<Vec<_>>());
        assert!(records[1].is_absent());
        assert_eq!(bytes_of(&records[0]), bytes_of(&records[3]));
    }

    #[test]
    fn orders() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        let keys = [k("c"), k("a"), k("x"), k("b"), k("a")];
        let order_of = |order| -> Vec<Key> {
            read_all(&store, &keys, order)
                .iter()
                .map(|r| r.key().clone())
                .collect()
        };
        assert_eq!(
            order_of(RecordOrder::Topological),
            vec![k("x"), k("a"), k("b"), k("c")]
        );
        assert_eq!(
            order_of(RecordOrder::GroupCompress),
            vec![k("x"), k("c"), k("b"), k("a")]
        );
        assert_eq!(
            order_of(RecordOrder::Unordered),
            vec![k("x"), k("a"), k("b"), k("c")]
        );
    }

    #[test]
    fn abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let mut writer = store.start_write_group().unwrap();
        writer
            .add_lines(k("a"), Some(vec![]), &["text\n"], None)
            .unwrap();
        writer.flush_group().unwrap();
        assert_eq!(dir_len(&store, UPLOAD_DIR), 1);
        writer.abort().unwrap();
        assert_eq!(dir_len(&store, UPLOAD_DIR), 0);
        assert_eq!(dir_len(&store, PACKS_DIR), 0);
        assert_eq!(dir_len(&store, INDICES_DIR), 0);
        assert!(store.keys().is_empty());

        // The write group is released
        let writer = store.start_write_group().unwrap();
        assert_eq!(writer.end().unwrap(), None);
    }

    #[test]
    fn one_writer_at_a_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let writer = store.start_write_group().unwrap();
        assert!(matches!(
            store.start_write_group(),
            Err(Error::WriteGroupActive)
        ));
        writer.abort().unwrap();
        store.start_write_group().unwrap().abort().unwrap();
    }

    #[test]
    fn reopen_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let other = GroupCompressStore::open(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        assert!(other.keys().is_empty());
        assert_eq!(other.reload().unwrap(), 1);
        assert_eq!(other.reload().unwrap(), 0);
        assert_eq!(other.keys(), store.keys());
        drop(other);

        let reopened = GroupCompressStore::open(dir.path(), StoreConfig::new()).unwrap();
        let records = read_all(&reopened, &[k("b")], RecordOrder::Unordered);
        assert_eq!(bytes_of(&records[0]), b"common line one\nbeta\n");

        let missing = dir.path().join("nothing-here");
        assert!(GroupCompressStore::open(&missing, StoreConfig::new()).is_err());
    }

    #[test]
    fn nostore_sha() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let err = writer
            .add_lines(k("a"), Some(vec![]), &["x\n"], Some(Sha1Digest::of(b"x\n")))
            .unwrap_err();
        assert!(matches!(err, Error::ExistingContent(_)));
        assert!(writer.is_empty());
        writer
            .add_lines(k("a"), Some(vec![]), &["x\n"], Some(Sha1Digest::of(b"y\n")))
            .unwrap();
        writer.end().unwrap();
    }

    #[test]
    fn invalid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let err = writer
            .add_lines(k("a"), Some(vec![]), &["one\ntwo\n"], None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLines { line: 0, .. }));
        let err = writer
            .add_lines(k("a"), Some(vec![]), &["one\n", "two", "three\n"], None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLines { line: 1, .. }));
        writer
            .add_lines(k("a"), Some(vec![]), &["one\n", "no newline"], None)
            .unwrap();
        let empty: [&[u8]; 0] = [];
        writer.add_lines(k("b"), Some(vec![]), &empty, None).unwrap();
        writer.end().unwrap();
        let records = read_all(&store, &[k("a"), k("b")], RecordOrder::AsRequested);
        assert_eq!(bytes_of(&records[0]), b"one\nno newline");
        assert!(bytes_of(&records[1]).is_empty());
    }

    #[test]
    fn bad_keys_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().graph(false).key_length(2);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let err = writer.add_lines(k("a"), None, &["x\n"], None).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
        let err = writer
            .add_lines(k2("f", "a"), Some(vec![]), &["x\n"], None)
            .unwrap_err();
        assert!(err.is_corruption());
        writer.add_lines(k2("f", "a"), None, &["x\n"], None).unwrap();
        writer.end().unwrap();
        assert_eq!(store.get_parent_map(&[k2("f", "a")])[&k2("f", "a")], Vec::<Key>::new());
        let records = read_all(&store, &[k2("f", "a")], RecordOrder::Unordered);
        assert_eq!(records[0].parents(), None);
    }

    #[test]
    fn readding_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        let mut writer = store.start_write_group().unwrap();
        writer
            .add_lines(k("a"), Some(vec![]), &["common line one\n", "alpha\n"], None)
            .unwrap();
        assert!(writer.is_empty());
        let err = writer
            .add_lines(k("a"), Some(vec![]), &["something else\n"], None)
            .unwrap_err();
        assert!(err.is_corruption());
        let err = writer
            .add_lines(k("a"), Some(vec![k("c")]), &["common line one\n", "alpha\n"], None)
            .unwrap_err();
        assert!(err.is_corruption());
        writer.add_lines(k("d"), Some(vec![]), &["d\n"], None).unwrap();
        writer.add_lines(k("d"), Some(vec![]), &["d\n"], None).unwrap();
        assert_eq!(writer.len(), 1);
        assert!(writer.end().unwrap().is_some());
        assert_eq!(store.keys().len(), 4);
    }

    #[test]
    fn large_groups_split() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().max_group_size(100);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let texts: Vec<String> = (0..5)
            .map(|i| format!("text number {} with enough unique filler {}\n", i, i * 7919))
            .collect();
        for (i, text) in texts.iter().enumerate() {
            writer
                .add_lines(k(&format!("t{}", i)), Some(vec![]), &[text.as_str()], None)
                .unwrap();
        }
        writer.end().unwrap();

        let keys: Vec<Key> = (0..5).map(|i| k(&format!("t{}", i))).collect();
        let blocks: HashSet<u64> = keys
            .iter()
            .map(|key| entry_of(&store, key).block.offset)
            .collect();
        assert!(blocks.len() > 1);
        let records = read_all(&store, &keys, RecordOrder::AsRequested);
        for (record, text) in records.iter().zip(texts.iter()) {
            assert_eq!(bytes_of(record), text.as_bytes());
        }
    }

    #[test]
    fn prefix_soft_compression() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().key_length(2);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let base: String = (0..40).map(|i| format!("line {} of the file\n", i)).collect();
        let mut writer = store.start_write_group().unwrap();
        writer
            .add_lines(k2("file", "r1"), Some(vec![]), &[base.as_str()], None)
            .unwrap_err();
        let lines: Vec<&str> = base.split_inclusive('\n').collect();
        writer
            .add_lines(k2("file", "r1"), Some(vec![]), &lines[..], None)
            .unwrap();
        let mut changed = lines.clone();
        changed.push("one more line\n");
        writer
            .add_lines(k2("file", "r2"), Some(vec![k2("file", "r1")]), &changed[..], None)
            .unwrap();
        writer.end().unwrap();
        let records = read_all(
            &store,
            &[k2("file", "r2"), k2("file", "r1")],
            RecordOrder::AsRequested,
        );
        assert_eq!(bytes_of(&records[0]), changed.concat().as_bytes());
        assert_eq!(bytes_of(&records[1]), base.as_bytes());
    }

    #[test]
    fn repack_into_another_store() {
        let dir = tempfile::tempdir().unwrap();
        let source = GroupCompressStore::create(dir.path().join("a"), StoreConfig::new()).unwrap();
        let target = GroupCompressStore::create(dir.path().join("b"), StoreConfig::new()).unwrap();
        chain(&source);

        let keys = source.keys();
        let (summary, pack) = target
            .insert_record_stream(source.get_record_stream(&keys, RecordOrder::GroupCompress, true))
            .unwrap();
        assert_eq!(summary.inserted, 3);
        assert!(pack.is_some());
        assert_eq!(target.keys(), keys);
        assert_eq!(target.get_parent_map(&keys), source.get_parent_map(&keys));

        let requested = [k("b"), k("a"), k("b")];
        let before = read_all(&source, &requested, RecordOrder::AsRequested);
        let after = read_all(&target, &requested, RecordOrder::AsRequested);
        assert_eq!(contents(before), contents(after));

        // A second pass finds everything present already
        let (summary, pack) = target
            .insert_record_stream(source.get_record_stream(&keys, RecordOrder::Unordered, false))
            .unwrap();
        assert_eq!(summary.skipped, 3);
        assert_eq!(pack, None);
    }

    #[test]
    fn insert_stream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);

        let absent = vec![Ok(Record::Absent { key: k("z") })];
        assert!(store.insert_record_stream(absent).unwrap_err().is_not_found());

        let lying = vec![Ok(Record::Fulltext {
            key: k("z"),
            parents: Some(vec![]),
            sha1: Sha1Digest::NULL,
            bytes: b"not empty".to_vec(),
        })];
        assert!(store.insert_record_stream(lying).unwrap_err().is_corruption());

        let conflict = vec![
            Ok(Record::fulltext(k("y"), Some(vec![]), b"y\n".to_vec())),
            Ok(Record::fulltext(k("a"), Some(vec![]), b"changed\n".to_vec())),
        ];
        assert!(store.insert_record_stream(conflict).unwrap_err().is_corruption());
        // The failed write group left nothing behind
        assert!(!store.keys().contains(&k("y")));
        assert_eq!(dir_len(&store, UPLOAD_DIR), 0);

        let chunked = vec![Ok(Record::chunked(
            k("w"),
            None,
            vec![b"first ".to_vec(), b"second\n".to_vec()],
        ))];
        let (summary, _) = store.insert_record_stream(chunked).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.get_parent_map(&[k("w")])[&k("w")], Vec::<Key>::new());
    }

    #[test]
    fn tolerant_insert_skips_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().tolerance(IndexTolerance::Tolerant);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        chain(&store);
        let stream = vec![
            Ok(Record::fulltext(k("y"), Some(vec![]), b"y\n".to_vec())),
            Ok(Record::fulltext(k("a"), Some(vec![]), b"changed\n".to_vec())),
        ];
        let (summary, _) = store.insert_record_stream(stream).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.problems.len(), 1);
        assert!(store.keys().contains(&k("y")));
    }

    fn split_packs(tolerance: IndexTolerance) -> (tempfile::TempDir, GroupCompressStore, String) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().tolerance(tolerance);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("a"), Some(vec![]), &["a\n"], None).unwrap();
        let first = writer.end().unwrap().unwrap();
        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("b"), Some(vec![]), &["b\n"], None).unwrap();
        writer.end().unwrap();
        fs::remove_file(store.pack_path(&first)).unwrap();
        (dir, store, first)
    }

    #[test]
    fn missing_pack_fatal() {
        let (_dir, store, _) = split_packs(IndexTolerance::Fatal);
        let mut stream = store.get_record_stream(&[k("a"), k("b")], RecordOrder::AsRequested, false);
        assert!(stream.next().unwrap().unwrap_err().is_corruption());
        assert!(stream.next().is_none());
        assert!(store.check().unwrap_err().is_corruption());
    }

    #[test]
    fn missing_pack_tolerant() {
        let (_dir, store, _) = split_packs(IndexTolerance::Tolerant);
        let results: Vec<Result<Record>> = store
            .get_record_stream(&[k("a"), k("b")], RecordOrder::AsRequested, false)
            .collect();
        assert!(results[0].as_ref().unwrap_err().is_corruption());
        assert_eq!(bytes_of(results[1].as_ref().unwrap()), b"b\n");

        let report = store.check().unwrap();
        assert_eq!(report.keys_checked, 1);
        assert_eq!(report.problems.len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn check_clean_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        let report = store.check().unwrap();
        assert_eq!(report.keys_checked, 3);
        assert!(report.is_clean());
    }

    #[test]
    fn unreadable_index_file() {
        let dir = tempfile::tempdir().unwrap();
        GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        fs::write(dir.path().join(INDICES_DIR).join("junk.gix"), b"junk").unwrap();
        assert!(GroupCompressStore::open(dir.path(), StoreConfig::new()).is_err());

        let config = StoreConfig::new().tolerance(IndexTolerance::Tolerant);
        let store = GroupCompressStore::open(dir.path(), config).unwrap();
        assert!(store.keys().is_empty());
        assert_eq!(store.check().unwrap().problems.len(), 1);
    }

    #[test]
    fn records_stream_in_block_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        chain(&store);
        let records = read_all(&store, &[k("a"), k("b"), k("c")], RecordOrder::GroupCompress);
        let kinds: Vec<StorageKind> = records.iter().map(Record::storage_kind).collect();
        assert_eq!(
            kinds,
            vec![
                StorageKind::GroupBlock,
                StorageKind::GroupBlockRef,
                StorageKind::GroupBlockRef
            ]
        );
        let run = records[0].run().unwrap();
        assert!(Arc::ptr_eq(run, records[2].run().unwrap()));
        assert_eq!(run.keys(), &[k("c"), k("b"), k("a")]);

        // An absent key ends a run
        let records = read_all(&store, &[k("a"), k("x"), k("b")], RecordOrder::AsRequested);
        let kinds: Vec<StorageKind> = records.iter().map(Record::storage_kind).collect();
        assert_eq!(
            kinds,
            vec![
                StorageKind::GroupBlock,
                StorageKind::Absent,
                StorageKind::GroupBlock
            ]
        );
    }

    #[test]
    fn well_used_blocks_are_copied() {
        let dir = tempfile::tempdir().unwrap();
        let source = GroupCompressStore::create(dir.path().join("a"), StoreConfig::new()).unwrap();
        let source_pack = chain(&source);
        // Small enough that the chain's block counts as a full one
        let config = StoreConfig::new().max_group_size(8);
        let target = GroupCompressStore::create(dir.path().join("b"), config).unwrap();

        let keys = source.keys();
        let (summary, pack) = target
            .insert_record_stream(source.get_record_stream(&keys, RecordOrder::GroupCompress, false))
            .unwrap();
        assert_eq!(summary.inserted, 3);
        assert_eq!(summary.reused, 3);
        let pack = pack.unwrap();
        assert_eq!(
            fs::read(target.pack_path(&pack)).unwrap(),
            fs::read(source.pack_path(&source_pack)).unwrap()
        );
        for key in keys.iter() {
            let (from, to) = (entry_of(&source, key), entry_of(&target, key));
            assert_eq!((from.block, from.start, from.end), (to.block, to.start, to.end));
        }
        assert_eq!(
            contents(read_all(&target, &keys, RecordOrder::AsRequested)),
            contents(read_all(&source, &keys, RecordOrder::AsRequested))
        );
        assert!(target.check().unwrap().is_clean());
    }

    #[test]
    fn blocks_are_recompressed_otherwise() {
        let dir = tempfile::tempdir().unwrap();
        let source = GroupCompressStore::create(dir.path().join("a"), StoreConfig::new()).unwrap();
        chain(&source);
        let keys = source.keys();

        // Reuse turned off
        let config = StoreConfig::new().max_group_size(8).reuse_blocks(false);
        let target = GroupCompressStore::create(dir.path().join("b"), config).unwrap();
        let (summary, _) = target
            .insert_record_stream(source.get_record_stream(&keys, RecordOrder::GroupCompress, false))
            .unwrap();
        assert_eq!((summary.inserted, summary.reused), (3, 0));

        // A run of one record
        let config = StoreConfig::new().max_group_size(8);
        let target = GroupCompressStore::create(dir.path().join("c"), config).unwrap();
        let (summary, _) = target
            .insert_record_stream(source.get_record_stream(&[k("a")], RecordOrder::AsRequested, false))
            .unwrap();
        assert_eq!((summary.inserted, summary.reused), (1, 0));

        // A run using little of a large block
        let big: String = (0..50).map(|i| format!("unrelated line {}\n", i * 31)).collect();
        let mut writer = source.start_write_group().unwrap();
        writer.add_lines(k("d"), Some(vec![]), &["d1\n"], None).unwrap();
        writer.add_lines(k("e"), Some(vec![]), &["e1\n"], None).unwrap();
        let big_lines: Vec<&str> = big.split_inclusive('\n').collect();
        writer.add_lines(k("f"), Some(vec![]), &big_lines[..], None).unwrap();
        writer.end().unwrap();
        let (summary, _) = target
            .insert_record_stream(source.get_record_stream(
                &[k("d"), k("e")],
                RecordOrder::AsRequested,
                false,
            ))
            .unwrap();
        assert_eq!((summary.inserted, summary.reused), (2, 0));
        let records = read_all(&target, &[k("d"), k("e")], RecordOrder::AsRequested);
        assert_eq!(bytes_of(&records[1]), b"e1\n");
    }

    #[test]
    fn content_addressed_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new().graph(false)).unwrap();
        let mut writer = store.start_write_group().unwrap();
        let (sha1, len) = writer
            .add_lines(AddKey::unnamed(Vec::<String>::new()), None, &["chk content\n"], None)
            .unwrap();
        assert_eq!(len, 12);
        // The same content names the same key, so adding it again does nothing
        writer
            .add_lines(AddKey::unnamed(Vec::<String>::new()), None, &["chk content\n"], None)
            .unwrap();
        assert_eq!(writer.len(), 1);
        writer.end().unwrap();

        let key = Key::new([format!("sha1:{}", sha1)]).unwrap();
        assert_eq!(store.keys(), vec![key.clone()]);
        let records = read_all(&store, &[key], RecordOrder::AsRequested);
        assert_eq!(bytes_of(&records[0]), b"chk content\n");
    }

    #[test]
    fn large_text_fills_its_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().max_group_size(60);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let base: Vec<String> = (0..10).map(|i| format!("line {:03} abc\n", i)).collect();
        let mut grown = base.clone();
        grown.push("more\n".to_string());
        let other: Vec<String> = (0..10).map(|i| format!("xyz {:03} pqr\n", i)).collect();

        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("t0"), Some(vec![]), &base[..], None).unwrap();
        writer.add_lines(k("t1"), Some(vec![]), &grown[..], None).unwrap();
        writer.add_lines(k("t2"), Some(vec![]), &other[..], None).unwrap();
        writer.end().unwrap();

        // Past the group limit, but under twice the largest text
        assert_eq!(entry_of(&store, &k("t0")).block, entry_of(&store, &k("t1")).block);
        assert_ne!(entry_of(&store, &k("t1")).block, entry_of(&store, &k("t2")).block);
        let records = read_all(&store, &[k("t1"), k("t2")], RecordOrder::AsRequested);
        assert_eq!(bytes_of(&records[0]), grown.concat().as_bytes());
        assert_eq!(bytes_of(&records[1]), other.concat().as_bytes());
    }

    #[test]
    fn prefix_change_splits_after_compressing() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().key_length(2).prefix_group_size(60);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let f = format!("{}\n", "f".repeat(49));
        let g1 = format!("{}\n", "g".repeat(49));
        let g2 = format!("{}h\n", "g".repeat(48));

        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k2("f", "1"), Some(vec![]), &[f.as_str()], None).unwrap();
        // The group is under the prefix limit until this text is compressed into it
        writer.add_lines(k2("g", "1"), Some(vec![]), &[g1.as_str()], None).unwrap();
        writer
            .add_lines(k2("g", "2"), Some(vec![k2("g", "1")]), &[g2.as_str()], None)
            .unwrap();
        writer.end().unwrap();

        let block = |key: &Key| entry_of(&store, key).block;
        assert_ne!(block(&k2("f", "1")), block(&k2("g", "1")));
        assert_eq!(block(&k2("g", "1")), block(&k2("g", "2")));
    }

    #[test]
    fn pack_write_failure_fails_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new().max_group_size(60);
        let store = GroupCompressStore::create(dir.path(), config).unwrap();
        let t0 = format!("{}\n", "a".repeat(49));
        let t1 = format!("{}\n", "b".repeat(49));
        let upload = dir.path().join(UPLOAD_DIR);

        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("t0"), Some(vec![]), &[t0.as_str()], None).unwrap();
        fs::remove_dir(&upload).unwrap();
        // t1 overflows the group, and the block holding t0 can't be written
        let err = writer
            .add_lines(k("t1"), Some(vec![]), &[t1.as_str()], None)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        fs::create_dir(&upload).unwrap();

        // t0 is lost, so the write group must not take more or commit
        for (key, text) in [(k("t0"), &t0), (k("t1"), &t1)] {
            assert!(matches!(
                writer.add_lines(key, Some(vec![]), &[text.as_str()], None),
                Err(Error::WriteGroupFailed(_))
            ));
        }
        let stream = vec![Ok(Record::fulltext(k("t2"), Some(vec![]), b"t2\n".to_vec()))];
        assert!(matches!(
            writer.insert_record_stream(stream),
            Err(Error::WriteGroupFailed(_))
        ));
        assert!(matches!(writer.end(), Err(Error::WriteGroupFailed(_))));
        assert!(store.keys().is_empty());
        for dir in [UPLOAD_DIR, PACKS_DIR, INDICES_DIR] {
            assert_eq!(dir_len(&store, dir), 0);
        }

        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("t1"), Some(vec![]), &[t1.as_str()], None).unwrap();
        writer.end().unwrap();
        assert_eq!(store.keys(), vec![k("t1")]);
    }

    #[test]
    fn failed_pack_write_on_end() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let upload = dir.path().join(UPLOAD_DIR);
        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("a"), Some(vec![]), &["a\n"], None).unwrap();
        fs::remove_dir(&upload).unwrap();
        assert!(matches!(writer.end(), Err(Error::Io(_))));
        fs::create_dir(&upload).unwrap();
        assert!(store.keys().is_empty());
        for dir in [UPLOAD_DIR, PACKS_DIR, INDICES_DIR] {
            assert_eq!(dir_len(&store, dir), 0);
        }
    }

    #[test]
    fn failed_index_write_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        let indices = dir.path().join(INDICES_DIR);
        let mut writer = store.start_write_group().unwrap();
        writer.add_lines(k("a"), Some(vec![]), &["a\n"], None).unwrap();
        fs::remove_dir(&indices).unwrap();
        // The pack is already in packs/ when the index can't be moved into place
        assert!(matches!(writer.end(), Err(Error::Io(_))));
        fs::create_dir(&indices).unwrap();
        assert!(store.keys().is_empty());
        for dir in [UPLOAD_DIR, PACKS_DIR, INDICES_DIR] {
            assert_eq!(dir_len(&store, dir), 0);
        }

        chain(&store);
        assert_eq!(store.keys().len(), 3);
    }

    #[test]
    fn existing_pack_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = GroupCompressStore::create(dir.path(), StoreConfig::new()).unwrap();
        // A second handle that never sees the first commit
        let other = GroupCompressStore::open(dir.path(), StoreConfig::new()).unwrap();
        let add_a = |s: &GroupCompressStore| {
            let mut writer = s.start_write_group().unwrap();
            writer.add_lines(k("a"), Some(vec![]), &["a\n"], None).unwrap();
            writer.end()
        };
        let name = add_a(&store).unwrap().unwrap();

        // Identical content makes an identically named pack. Failing its commit must not
        // remove the pack already there.
        let index_path = store.index_path(&name);
        fs::remove_file(&index_path).unwrap();
        fs::create_dir(&index_path).unwrap();
        assert!(add_a(&other).is_err());
        assert!(store.pack_path(&name).is_file());
        assert_eq!(dir_len(&store, UPLOAD_DIR), 0);
        let records = read_all(&store, &[k("a")], RecordOrder::AsRequested);
        assert_eq!(bytes_of(&records[0]), b"a\n");

        fs::remove_dir(&index_path).unwrap();
        assert_eq!(add_a(&other).unwrap(), Some(name.clone()));
        assert_eq!(dir_len(&store, PACKS_DIR), 1);
        assert_eq!(dir_len(&store, UPLOAD_DIR), 0);
        assert_eq!(other.keys(), vec![k("a")]);
    }
}
