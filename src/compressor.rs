//! The per-group delta engine.
//!
//! Every text compressed into a group is written as a record appended to one growing buffer.
//! The first record is a fulltext; each later record is a delta whose source is the entire
//! buffer written so far, so a text can borrow from any earlier text in the group.
//!
//! Matches are found through a hash index over the literal bytes in the buffer: fulltext
//! payloads and insert payloads. Copies are never indexed, since the bytes they produce are
//! already indexed wherever they were first inserted.

use crate::block::{BlockBuilder, EntryKind};
use crate::delta::{self, RecordBody, MAX_INSERT_LEN};
use crate::digest::Sha1Digest;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::varint;
use std::collections::HashMap;

/// Width of the hashed window, and the shortest run worth a copy instruction.
pub const MIN_MATCH_LEN: usize = 16;
/// Shortest run worth a copy when compressing softly.
pub const SOFT_MIN_MATCH_LEN: usize = 200;
/// Most buffer positions remembered for any one hash value.
const MAX_BUCKET_LEN: usize = 64;

const HASH_MUL: u32 = 0x0100_0193;
// HASH_MUL ^ (MIN_MATCH_LEN - 1), for rolling the oldest byte out of the window.
const HASH_OUT: u32 = {
    let mut v = 1u32;
    let mut i = 1;
    while i < MIN_MATCH_LEN {
        v = v.wrapping_mul(HASH_MUL);
        i += 1;
    }
    v
};

fn window_hash(window: &[u8]) -> u32 {
    window
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(HASH_MUL).wrapping_add(b as u32 + 1))
}

fn roll_hash(h: u32, out: u8, into: u8) -> u32 {
    h.wrapping_sub((out as u32 + 1).wrapping_mul(HASH_OUT))
        .wrapping_mul(HASH_MUL)
        .wrapping_add(into as u32 + 1)
}

/// Hash index over fixed windows of the group buffer.
#[derive(Clone, Debug, Default)]
struct DeltaIndex {
    buckets: HashMap<u32, Vec<usize>>,
}

impl DeltaIndex {
    /// Index the literal region `buf[start..start+len]` at window-sized strides. Returns the
    /// hashes that were actually recorded, so they can be revoked later.
    fn add_region(&mut self, buf: &[u8], start: usize, len: usize, added: &mut Vec<u32>) {
        let end = start + len;
        let mut pos = start;
        while pos + MIN_MATCH_LEN <= end {
            let h = window_hash(&buf[pos..pos + MIN_MATCH_LEN]);
            let bucket = self.buckets.entry(h).or_default();
            if bucket.len() < MAX_BUCKET_LEN {
                bucket.push(pos);
                added.push(h);
            }
            pos += MIN_MATCH_LEN;
        }
    }

    /// Undo a run of `add_region` calls. `added` must be the hashes they returned, and nothing
    /// else may have been indexed since.
    fn revoke(&mut self, added: &[u32]) {
        for h in added.iter().rev() {
            if let Some(bucket) = self.buckets.get_mut(h) {
                bucket.pop();
                if bucket.is_empty() {
                    self.buckets.remove(h);
                }
            }
        }
    }

    /// Find the longest verified match for `target[pos..]` whose window hashes to `h`. Returns
    /// the source offset and the forward match length.
    fn best_match(&self, h: u32, source: &[u8], target: &[u8], pos: usize) -> Option<(usize, usize)> {
        let bucket = self.buckets.get(&h)?;
        let window = &target[pos..pos + MIN_MATCH_LEN];
        let mut best: Option<(usize, usize)> = None;
        for &cand in bucket {
            if source[cand..cand + MIN_MATCH_LEN] != *window {
                continue;
            }
            let len = MIN_MATCH_LEN
                + source[cand + MIN_MATCH_LEN..]
                    .iter()
                    .zip(&target[pos + MIN_MATCH_LEN..])
                    .take_while(|(a, b)| a == b)
                    .count();
            if best.map_or(true, |(_, l)| len > l) {
                best = Some((cand, len));
            }
        }
        best
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// The result of compressing one text into a group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed {
    pub sha1: Sha1Digest,
    /// Buffer offset where the record begins.
    pub start: usize,
    /// Buffer offset right after the record.
    pub end: usize,
    pub kind: EntryKind,
    /// Length of the uncompressed text.
    pub len: usize,
}

#[derive(Clone, Debug)]
struct Label {
    key: Key,
    out: Compressed,
    first_chunk: usize,
    indexed: Vec<u32>,
}

/// Stateful compressor for a single group.
#[derive(Clone, Debug)]
pub struct GroupCompressor {
    delta: bool,
    buffer: Vec<u8>,
    chunk_ends: Vec<usize>,
    index: DeltaIndex,
    labels: Vec<Label>,
    by_key: HashMap<Key, usize>,
    input_bytes: usize,
}

impl Default for GroupCompressor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl GroupCompressor {
    /// Create an empty compressor. With `delta` off, every record is stored as a fulltext and
    /// the group relies solely on the block's zlib pass.
    pub fn new(delta: bool) -> Self {
        Self {
            delta,
            buffer: Vec::new(),
            chunk_ends: Vec::new(),
            index: DeltaIndex::default(),
            labels: Vec::new(),
            by_key: HashMap::new(),
            input_bytes: 0,
        }
    }

    /// Compress `text` under `key`, requiring matches of at least [`MIN_MATCH_LEN`] bytes.
    pub fn compress(
        &mut self,
        key: Key,
        text: &[u8],
        known_sha1: Option<Sha1Digest>,
    ) -> Result<Compressed> {
        self.compress_with(key, text, known_sha1, MIN_MATCH_LEN)
    }

    /// Like [`compress`](Self::compress), but only copies runs of at least
    /// [`SOFT_MIN_MATCH_LEN`] bytes. Used for texts that are expected to be similar to the
    /// previous one, to keep their deltas from fragmenting into many tiny copies.
    pub fn compress_soft(
        &mut self,
        key: Key,
        text: &[u8],
        known_sha1: Option<Sha1Digest>,
    ) -> Result<Compressed> {
        self.compress_with(key, text, known_sha1, SOFT_MIN_MATCH_LEN)
    }

    fn compress_with(
        &mut self,
        key: Key,
        text: &[u8],
        known_sha1: Option<Sha1Digest>,
        min_match: usize,
    ) -> Result<Compressed> {
        if self.by_key.contains_key(&key) {
            return Err(Error::DuplicateKey(key));
        }
        let sha1 = known_sha1.unwrap_or_else(|| Sha1Digest::of(text));
        let start = self.buffer.len();
        let first_chunk = self.chunk_ends.len();
        let mut indexed = Vec::new();

        let kind = if text.is_empty() {
            EntryKind::Fulltext
        } else if self.buffer.is_empty() || !self.delta {
            self.push_chunk(&[delta::FULLTEXT_TAG]);
            self.push_chunk(&varint::encode(text.len() as u64));
            let text_start = self.buffer.len();
            self.push_chunk(text);
            self.index.add_region(&self.buffer, text_start, text.len(), &mut indexed);
            EntryKind::Fulltext
        } else {
            let (body, literals) = self.make_delta(text, min_match)?;
            self.push_chunk(&[delta::DELTA_TAG]);
            self.push_chunk(&varint::encode(body.len() as u64));
            let body_start = self.buffer.len();
            self.push_chunk(&body);
            for (offset, len) in literals {
                self.index.add_region(&self.buffer, body_start + offset, len, &mut indexed);
            }
            EntryKind::Delta
        };

        let out = Compressed {
            sha1,
            start,
            end: self.buffer.len(),
            kind,
            len: text.len(),
        };
        self.input_bytes += text.len();
        self.by_key.insert(key.clone(), self.labels.len());
        self.labels.push(Label {
            key,
            out: out.clone(),
            first_chunk,
            indexed,
        });
        Ok(out)
    }

    fn push_chunk(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        self.chunk_ends.push(self.buffer.len());
    }

    /// Build a delta body for `text` against the whole buffer. Also returns the body-relative
    /// ranges of every insert payload, for indexing.
    fn make_delta(&self, text: &[u8], min_match: usize) -> Result<(Vec<u8>, Vec<(usize, usize)>)> {
        let source = &self.buffer[..];
        let mut body = Vec::with_capacity(text.len() / 2 + 16);
        varint::write(source.len() as u64, &mut body);
        varint::write(text.len() as u64, &mut body);
        let mut literals = Vec::new();

        let mut emit_insert = |bytes: &[u8], body: &mut Vec<u8>| {
            for run in bytes.chunks(MAX_INSERT_LEN) {
                literals.push((body.len() + 1, run.len()));
                delta::write_insert(run, body);
            }
        };

        let mut pending = 0;
        let mut pos = 0;
        if text.len() >= MIN_MATCH_LEN {
            let mut h = window_hash(&text[..MIN_MATCH_LEN]);
            loop {
                if let Some((mut src, mut len)) = self.index.best_match(h, source, text, pos) {
                    let mut tgt = pos;
                    while src > 0 && tgt > pending && source[src - 1] == text[tgt - 1] {
                        src -= 1;
                        tgt -= 1;
                        len += 1;
                    }
                    if len >= min_match {
                        emit_insert(&text[pending..tgt], &mut body);
                        delta::write_copy(src, len, &mut body)?;
                        pos = tgt + len;
                        pending = pos;
                        if pos + MIN_MATCH_LEN > text.len() {
                            break;
                        }
                        h = window_hash(&text[pos..pos + MIN_MATCH_LEN]);
                        continue;
                    }
                }
                if pos + MIN_MATCH_LEN >= text.len() {
                    break;
                }
                h = roll_hash(h, text[pos], text[pos + MIN_MATCH_LEN]);
                pos += 1;
            }
        }
        emit_insert(&text[pending..], &mut body);
        Ok((body, literals))
    }

    /// Rebuild the text stored under `key`, along with its digest.
    pub fn extract(&self, key: &Key) -> Result<(Vec<u8>, Sha1Digest)> {
        let idx = *self
            .by_key
            .get(key)
            .ok_or_else(|| Error::NotFound(key.clone()))?;
        let out = &self.labels[idx].out;
        if out.start == out.end {
            return Ok((Vec::new(), out.sha1));
        }
        let record = RecordBody::parse(&self.buffer[out.start..out.end])?;
        let text = record.expand(&self.buffer[..out.start])?;
        Ok((text, out.sha1))
    }

    /// Revoke the most recent `compress`, restoring the compressor to its prior state. Returns
    /// the key that was removed, if any.
    pub fn pop_last(&mut self) -> Option<Key> {
        let label = self.labels.pop()?;
        self.buffer.truncate(label.out.start);
        self.chunk_ends.truncate(label.first_chunk);
        self.index.revoke(&label.indexed);
        self.input_bytes -= label.out.len;
        self.by_key.remove(&label.key);
        Some(label.key)
    }

    /// Total uncompressed bytes over total encoded bytes. Zero if nothing has been written.
    pub fn ratio(&self) -> f64 {
        if self.buffer.is_empty() {
            return 0.0;
        }
        self.input_bytes as f64 / self.buffer.len() as f64
    }

    /// The buffer, split into the fragments it was written as.
    pub fn chunks(&self) -> Vec<&[u8]> {
        let mut start = 0;
        self.chunk_ends
            .iter()
            .map(|&end| {
                let chunk = &self.buffer[start..end];
                start = end;
                chunk
            })
            .collect()
    }

    /// Length of the buffer, which is also the offset the next record will start at.
    pub fn endpoint(&self) -> usize {
        self.buffer.len()
    }

    /// Uncompressed bytes taken in so far.
    pub fn input_bytes(&self) -> usize {
        self.input_bytes
    }

    /// Number of texts compressed into the group.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.by_key.contains_key(key)
    }

    /// Seal the group, producing the block's entry table and its content blob.
    pub fn flush(self) -> (BlockBuilder, Vec<u8>) {
        let mut builder = BlockBuilder::new();
        for label in self.labels {
            builder.push_entry(
                label.key,
                label.out.kind,
                label.out.sha1,
                label.out.start,
                label.out.end - label.out.start,
            );
        }
        (builder, self.buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    fn key(s: &str) -> Key {
        Key::new([s]).unwrap()
    }

    const TEXT1: &[u8] = b"strange\ncommon long line\nthat needs a 16 byte match\n";
    const TEXT2: &[u8] = b"common long line\nthat needs a 16 byte match\ndifferent\n";

    #[test]
    fn empty_compressor() {
        let gc = GroupCompressor::default();
        assert!(gc.chunks().is_empty());
        assert_eq!(gc.endpoint(), 0);
        assert_eq!(gc.ratio(), 0.0);
        assert!(gc.is_empty());
    }

    #[test]
    fn first_is_fulltext() {
        let mut gc = GroupCompressor::default();
        let out = gc.compress(key("label"), b"strange\ncommon\n", None).unwrap();
        assert_eq!(out.sha1, Sha1Digest::of(b"strange\ncommon\n"));
        assert_eq!(out.kind, EntryKind::Fulltext);
        assert_eq!(out.start, 0);
        assert_eq!(out.end, 17);
        assert_eq!(
            gc.chunks(),
            vec![&b"f"[..], &b"\x0f"[..], &b"strange\ncommon\n"[..]]
        );
    }

    #[test]
    fn two_texts_delta() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("label"), TEXT1, None).unwrap();
        let out = gc.compress(key("newlabel"), TEXT2, None).unwrap();
        assert_eq!(out.kind, EntryKind::Delta);
        assert_eq!(out.start, 54);
        let mut expected = vec![b'd', 0x10, 0x36, 0x36, 0x91, 0x0a, 0x2c, 0x0a];
        expected.extend_from_slice(b"different\n");
        assert_eq!(gc.chunks()[3..].concat(), expected);
        assert_eq!(out.end, 54 + expected.len());
    }

    #[test]
    fn three_texts_borrow_from_all() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("label1"), b"strange\ncommon very very long line\nwith some extra text\n", None)
            .unwrap();
        gc.compress(key("label2"), b"different\nmoredifferent\nand then some more\n", None)
            .unwrap();
        let text3 = b"new\ncommon very very long line\nwith some extra text\ndifferent\nmoredifferent\nand then some more\n";
        let out = gc.compress(key("label3"), text3, None).unwrap();
        assert_eq!(out.kind, EntryKind::Delta);
        // Two copies and a single short insert take far less room than the text
        assert!(out.end - out.start < text3.len() / 2);
        assert_eq!(gc.extract(&key("label3")).unwrap().0, text3.to_vec());
    }

    #[test]
    fn soft_needs_long_matches() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("a"), TEXT1, None).unwrap();
        let out = gc.compress_soft(key("b"), TEXT2, None).unwrap();
        let mut expected = vec![b'd', 0x39, 0x36, 0x36, 0x36];
        expected.extend_from_slice(TEXT2);
        assert_eq!(gc.chunks()[3..].concat(), expected);
        assert_eq!(out.end - out.start, expected.len());
        assert_eq!(gc.extract(&key("b")).unwrap().0, TEXT2.to_vec());
    }

    #[test]
    fn extract_all() {
        let mut rng = rand::thread_rng();
        let mut gc = GroupCompressor::default();
        let mut texts: Vec<(Key, Vec<u8>)> = Vec::new();
        let mut base: Vec<u8> = (0..2000).map(|_| rng.gen_range(b'a'..=b'z')).collect();
        for i in 0..20 {
            for _ in 0..5 {
                let at = rng.gen_range(0..base.len());
                base[at] = b'\n';
            }
            if i % 3 == 0 {
                base.extend((0..50).map(|_| rng.gen::<u8>()));
            }
            let k = key(&format!("rev-{}", i));
            gc.compress(k.clone(), &base, None).unwrap();
            texts.push((k, base.clone()));
        }
        assert!(gc.ratio() > 1.0);
        for (k, text) in texts.iter() {
            let (got, sha1) = gc.extract(k).unwrap();
            assert_eq!(&got, text);
            assert_eq!(sha1, Sha1Digest::of(text));
        }
    }

    #[test]
    fn nul_and_binary_content() {
        let mut gc = GroupCompressor::default();
        let a: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let mut b = a.clone();
        b[500] = 0;
        b.extend_from_slice(b"\0\0\0");
        gc.compress(key("a"), &a, None).unwrap();
        gc.compress(key("b"), &b, None).unwrap();
        assert_eq!(gc.extract(&key("a")).unwrap().0, a);
        assert_eq!(gc.extract(&key("b")).unwrap().0, b);
    }

    #[test]
    fn empty_text() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("a"), TEXT1, None).unwrap();
        let out = gc.compress(key("empty"), b"", None).unwrap();
        assert_eq!(out.sha1, Sha1Digest::NULL);
        assert_eq!(out.start, out.end);
        assert_eq!(out.start, 54);
        assert_eq!(gc.endpoint(), 54);
        assert_eq!(gc.extract(&key("empty")).unwrap(), (Vec::new(), Sha1Digest::NULL));
    }

    #[test]
    fn duplicate_and_missing() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("a"), TEXT1, None).unwrap();
        assert!(matches!(
            gc.compress(key("a"), TEXT2, None),
            Err(Error::DuplicateKey(_))
        ));
        assert!(matches!(gc.extract(&key("b")), Err(Error::NotFound(_))));
    }

    #[test]
    fn known_sha1_is_trusted() {
        let mut gc = GroupCompressor::default();
        let fake = Sha1Digest::of(b"something else");
        let out = gc.compress(key("a"), TEXT1, Some(fake)).unwrap();
        assert_eq!(out.sha1, fake);
    }

    #[test]
    fn no_delta() {
        let mut gc = GroupCompressor::new(false);
        gc.compress(key("a"), TEXT1, None).unwrap();
        let out = gc.compress(key("b"), TEXT2, None).unwrap();
        assert_eq!(out.kind, EntryKind::Fulltext);
        assert_eq!(gc.chunks()[5], TEXT2);
    }

    #[test]
    fn pop_last() {
        let mut gc = GroupCompressor::default();
        gc.compress(key("key1"), b"some text\nfor the first entry\n", None)
            .unwrap();
        let expected: Vec<Vec<u8>> = gc.chunks().iter().map(|c| c.to_vec()).collect();
        let index_len = gc.index.len();
        gc.compress(key("key2"), b"some text\nfor the second entry\n", None)
            .unwrap();
        assert_eq!(gc.pop_last(), Some(key("key2")));
        let got: Vec<Vec<u8>> = gc.chunks().iter().map(|c| c.to_vec()).collect();
        assert_eq!(got, expected);
        assert_eq!(gc.index.len(), index_len);
        assert!(!gc.contains(&key("key2")));
        assert_eq!(gc.len(), 1);

        // The key can be compressed again, and the result matches a fresh compressor
        let again = gc.compress(key("key2"), TEXT2, None).unwrap();
        let mut fresh = GroupCompressor::default();
        fresh
            .compress(key("key1"), b"some text\nfor the first entry\n", None)
            .unwrap();
        assert_eq!(fresh.compress(key("key2"), TEXT2, None).unwrap(), again);
    }

    #[test]
    fn flush_entries() {
        let mut gc = GroupCompressor::default();
        let a = gc.compress(key("a"), TEXT1, None).unwrap();
        let b = gc.compress(key("b"), TEXT2, None).unwrap();
        let (builder, content) = gc.flush();
        let entries = builder.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].start, a.start);
        assert_eq!(entries[0].length, a.end - a.start);
        assert_eq!(entries[1].kind, EntryKind::Delta);
        assert_eq!(entries[1].sha1, b.sha1);
        assert_eq!(content.len(), b.end);
    }
}
