//! The serialized form of one compression group.
//!
//! ```text
//! gcb1z\n
//! <metadata compressed length>\n
//! <metadata length>\n
//! <content compressed length>\n
//! <content length>\n
//! <zlib metadata><zlib content>
//! ```
//!
//! The metadata is a run of stanzas separated by blank lines, one per entry:
//!
//! ```text
//! key:<NUL-joined key>
//! sha1:<hex digest>
//! type:fulltext|delta
//! start:<offset into content>
//! length:<record length>
//! ```

use crate::compress::{zlib_compress, zlib_decompress, ZlibInflater};
use crate::delta::{Delta, Instruction, RecordBody};
use crate::digest::Sha1Digest;
use crate::error::{Error, Result};
use crate::key::Key;
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::{fmt, str::FromStr};

/// Tag every serialized block starts with.
pub const GCB_HEADER: &[u8] = b"gcb1z\n";

/// How an entry's record is stored in the content blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Fulltext,
    Delta,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Fulltext => "fulltext",
            EntryKind::Delta => "delta",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fulltext" => Ok(EntryKind::Fulltext),
            "delta" => Ok(EntryKind::Delta),
            _ => Err(Error::Format(format!("unknown entry type {:?}", s))),
        }
    }
}

/// Where one key's record lives inside a block's content blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: Key,
    pub sha1: Sha1Digest,
    pub kind: EntryKind,
    pub start: usize,
    pub length: usize,
}

impl BlockEntry {
    pub fn end(&self) -> usize {
        self.start + self.length
    }

    fn write_stanza(&self, out: &mut String) {
        use std::fmt::Write;
        // Writing to a String can't fail
        let _ = write!(
            out,
            "key:{}\nsha1:{}\ntype:{}\nstart:{}\nlength:{}\n",
            self.key.flatten(),
            self.sha1,
            self.kind,
            self.start,
            self.length
        );
    }
}

/// Write side of a block: collects entries, then serializes them alongside a content blob.
#[derive(Clone, Debug, Default)]
pub struct BlockBuilder {
    entries: Vec<BlockEntry>,
    keys: HashSet<Key>,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry to the table. Fails if the key is already present.
    pub fn add_entry(
        &mut self,
        key: Key,
        kind: EntryKind,
        sha1: Sha1Digest,
        start: usize,
        length: usize,
    ) -> Result<()> {
        if self.keys.contains(&key) {
            return Err(Error::DuplicateKey(key));
        }
        self.push_entry(key, kind, sha1, start, length);
        Ok(())
    }

    // For callers that already hold unique keys.
    pub(crate) fn push_entry(
        &mut self,
        key: Key,
        kind: EntryKind,
        sha1: Sha1Digest,
        start: usize,
        length: usize,
    ) {
        self.keys.insert(key.clone());
        self.entries.push(BlockEntry {
            key,
            sha1,
            kind,
            start,
            length,
        });
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn metadata(&self) -> String {
        let mut text = String::new();
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                text.push('\n');
            }
            entry.write_stanza(&mut text);
        }
        text
    }

    /// Serialize the entry table together with `content`.
    pub fn to_bytes(&self, content: &[u8]) -> Result<Vec<u8>> {
        let meta = self.metadata();
        let meta_z = compress_segment(meta.as_bytes())?;
        let content_z = compress_segment(content)?;
        let header = format!(
            "{}\n{}\n{}\n{}\n",
            meta_z.len(),
            meta.len(),
            content_z.len(),
            content.len()
        );
        let mut out =
            Vec::with_capacity(GCB_HEADER.len() + header.len() + meta_z.len() + content_z.len());
        out.extend_from_slice(GCB_HEADER);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&meta_z);
        out.extend_from_slice(&content_z);
        Ok(out)
    }
}

fn compress_segment(segment: &[u8]) -> Result<Vec<u8>> {
    if segment.is_empty() {
        return Ok(Vec::new());
    }
    Ok(zlib_compress(segment)?)
}

fn decompress_segment(name: &str, compressed: &[u8], expected: usize) -> Result<Vec<u8>> {
    if compressed.is_empty() {
        if expected != 0 {
            return Err(Error::Corruption(format!(
                "{} is empty, but should hold {} bytes",
                name, expected
            )));
        }
        return Ok(Vec::new());
    }
    let out = zlib_decompress(compressed, expected)?;
    if out.len() > expected {
        return Err(Error::Corruption(format!(
            "{} decompressed past its declared {} bytes",
            name, expected
        )));
    }
    if out.len() < expected {
        return Err(Error::Corruption(format!(
            "{} decompressed to {} bytes, expected {}",
            name,
            out.len(),
            expected
        )));
    }
    Ok(out)
}

fn read_length(buf: &mut &[u8]) -> Result<usize> {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        return Err(Error::Format("block header ended early".into()));
    };
    let digits = &buf[..nl];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::Format(format!(
            "block length {:?} isn't a decimal number",
            String::from_utf8_lossy(digits)
        )));
    }
    let len = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(|| Error::Format("block length out of range".into()))?;
    *buf = &buf[nl + 1..];
    Ok(len)
}

fn parse_field<'a>(line: Option<&'a str>, name: &str) -> Result<&'a str> {
    line.and_then(|l| l.strip_prefix(name))
        .and_then(|l| l.strip_prefix(':'))
        .ok_or_else(|| Error::Format(format!("expected a {:?} line in block metadata", name)))
}

fn parse_number(line: Option<&str>, name: &str) -> Result<usize> {
    let v = parse_field(line, name)?;
    v.parse()
        .map_err(|_| Error::Format(format!("bad {} value {:?} in block metadata", name, v)))
}

fn parse_metadata(text: &str) -> Result<Vec<BlockEntry>> {
    let mut entries = Vec::new();
    let mut lines = text.split_terminator('\n');
    while let Some(first) = lines.next() {
        let key = Key::from_flat(parse_field(Some(first), "key")?)
            .map_err(|e| Error::Format(format!("bad key in block metadata: {}", e)))?;
        let sha1: Sha1Digest = parse_field(lines.next(), "sha1")?.parse()?;
        let kind: EntryKind = parse_field(lines.next(), "type")?.parse()?;
        let start = parse_number(lines.next(), "start")?;
        let length = parse_number(lines.next(), "length")?;
        entries.push(BlockEntry {
            key,
            sha1,
            kind,
            start,
            length,
        });
        match lines.next() {
            None | Some("") => (),
            Some(l) => {
                return Err(Error::Format(format!(
                    "expected a blank line between stanzas, got {:?}",
                    l
                )))
            }
        }
    }
    Ok(entries)
}

// Extra content expanded past what a read asks for, so that neighbouring reads don't each
// restart the inflater.
const ZLIB_WINDOW: usize = 32 * 1024;

/// The content blob, expanded as far as reads have needed so far.
struct LazyContent {
    out: Vec<u8>,
    inflater: Option<ZlibInflater>,
    broken: Option<String>,
}

/// A parsed, read-only block.
///
/// Metadata is parsed up front. Content is only inflated as far as the records read from it
/// reach, unless a read needs more than three quarters of it, in which case it is expanded all
/// at once.
pub struct GroupCompressBlock {
    entries: Vec<BlockEntry>,
    by_key: HashMap<Key, usize>,
    raw: Vec<u8>,
    content_start: usize,
    content_len: usize,
    content: Mutex<LazyContent>,
}

impl fmt::Debug for GroupCompressBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("GroupCompressBlock")
            .field("entries", &self.entries)
            .field("content_len", &self.content_len)
            .field("expanded", &self.expanded_len())
            .finish()
    }
}

impl GroupCompressBlock {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some(mut rest) = bytes.strip_prefix(GCB_HEADER) else {
            return Err(Error::Format("not a gcb1z block".into()));
        };
        let meta_z_len = read_length(&mut rest)?;
        let meta_len = read_length(&mut rest)?;
        let content_z_len = read_length(&mut rest)?;
        let content_len = read_length(&mut rest)?;

        let body_len = meta_z_len
            .checked_add(content_z_len)
            .ok_or_else(|| Error::Format("block lengths overflow".into()))?;
        if rest.len() < body_len {
            return Err(Error::Format(format!(
                "block needs {} bytes after its header, has {}",
                body_len,
                rest.len()
            )));
        }
        if rest.len() > body_len {
            return Err(Error::Format(format!(
                "{} stray bytes after the end of the block",
                rest.len() - body_len
            )));
        }
        let meta_z = &rest[..meta_z_len];
        let content_start = bytes.len() - content_z_len;

        let meta = decompress_segment("metadata", meta_z, meta_len)?;
        let meta = String::from_utf8(meta)
            .map_err(|_| Error::Format("block metadata isn't valid UTF-8".into()))?;
        let entries = parse_metadata(&meta)?;
        if content_z_len == 0 && content_len != 0 {
            return Err(Error::Corruption(format!(
                "content is empty, but should hold {} bytes",
                content_len
            )));
        }

        let mut by_key = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if by_key.insert(entry.key.clone(), i).is_some() {
                return Err(Error::Corruption(format!(
                    "key {} appears twice in one block",
                    entry.key
                )));
            }
        }
        Ok(Self {
            entries,
            by_key,
            raw: bytes.to_vec(),
            content_start,
            content_len,
            content: Mutex::new(LazyContent {
                out: Vec::new(),
                inflater: (content_z_len > 0).then(ZlibInflater::new),
                broken: None,
            }),
        })
    }

    /// Entries in the order they were added.
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn entry(&self, key: &Key) -> Option<&BlockEntry> {
        self.by_key.get(key).map(|&i| &self.entries[i])
    }

    /// The serialized block, exactly as it was parsed.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Declared length of the decompressed content blob.
    pub fn content_len(&self) -> usize {
        self.content_len
    }

    /// How much of the content blob has been inflated so far.
    pub fn expanded_len(&self) -> usize {
        self.content.lock().out.len()
    }

    /// The whole decompressed content blob.
    pub fn content(&self) -> Result<MappedMutexGuard<'_, [u8]>> {
        self.ensure_content(self.content_len)
    }

    /// Inflate at least the first `num_bytes` of content, and hand back everything inflated so
    /// far.
    pub(crate) fn ensure_content(&self, num_bytes: usize) -> Result<MappedMutexGuard<'_, [u8]>> {
        let len = self.content_len;
        let num_bytes = num_bytes.min(len);
        let mut lazy = self.content.lock();
        let LazyContent {
            out,
            inflater,
            broken,
        } = &mut *lazy;

        if let Some(mut z) = inflater.take() {
            let full = num_bytes == len || num_bytes.saturating_mul(4) > len.saturating_mul(3);
            let want = if full {
                // Also read up to the end of the stream, to check nothing follows it
                len.saturating_add(1)
            } else {
                num_bytes.saturating_add(ZLIB_WINDOW).min(len)
            };
            let input = &self.raw[self.content_start..];
            let result = if out.len() < want {
                z.inflate(input, out, want, len).map_err(Error::from)
            } else {
                Ok(())
            };
            let result = result.and_then(|()| {
                if out.len() > len {
                    return Err(Error::Corruption(format!(
                        "content decompressed past its declared {} bytes",
                        len
                    )));
                }
                if z.is_finished() && out.len() < len {
                    return Err(Error::Corruption(format!(
                        "content decompressed to {} bytes, expected {}",
                        out.len(),
                        len
                    )));
                }
                Ok(())
            });
            match result {
                Ok(()) if !z.is_finished() => *inflater = Some(z),
                Ok(()) => (),
                Err(e) => {
                    *broken = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        if out.len() < num_bytes {
            return Err(Error::Corruption(broken.clone().unwrap_or_else(|| {
                format!("content ends at {} bytes, needed {}", out.len(), num_bytes)
            })));
        }
        Ok(MutexGuard::map(lazy, |c| &mut c.out[..]))
    }

    fn range(&self, entry: &BlockEntry) -> Result<Range<usize>> {
        match entry.start.checked_add(entry.length) {
            Some(end) if end <= self.content_len => Ok(entry.start..end),
            _ => Err(Error::Corruption(format!(
                "entry for {} covers {}+{}, past the {} byte content",
                entry.key, entry.start, entry.length, self.content_len
            ))),
        }
    }

    /// Rebuild the text stored under `key` and check it against its recorded digest. Only the
    /// content up to the end of that key's record is inflated.
    pub fn extract(&self, key: &Key) -> Result<(Vec<u8>, Sha1Digest)> {
        let entry = self.entry(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let text = if entry.length == 0 {
            Vec::new()
        } else {
            let range = self.range(entry)?;
            let content = self.ensure_content(range.end)?;
            RecordBody::parse(&content[range.clone()])?.expand(&content[..range.start])?
        };
        let sha1 = Sha1Digest::of(&text);
        if sha1 != entry.sha1 {
            return Err(Error::Corruption(format!(
                "content of {} has sha1 {}, expected {}",
                key, sha1, entry.sha1
            )));
        }
        Ok((text, sha1))
    }

    /// Describe every record in the block. With `include_text`, literal bytes are included.
    pub fn dump(&self, include_text: bool) -> Result<Vec<DumpRecord>> {
        let content = self.content()?;
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in self.entries.iter() {
            if entry.length == 0 {
                out.push(DumpRecord::Fulltext {
                    key: entry.key.clone(),
                    len: 0,
                    text: include_text.then(Vec::new),
                });
                continue;
            }
            match RecordBody::parse(&content[self.range(entry)?])? {
                RecordBody::Fulltext(text) => out.push(DumpRecord::Fulltext {
                    key: entry.key.clone(),
                    len: text.len(),
                    text: include_text.then(|| text.to_vec()),
                }),
                RecordBody::Delta(body) => {
                    let delta = Delta::parse(body)?;
                    let target_len = delta.target_len;
                    let mut instructions = Vec::new();
                    for inst in delta.instructions {
                        instructions.push(match inst? {
                            Instruction::Insert(bytes) => DumpInstruction::Insert {
                                len: bytes.len(),
                                text: include_text.then(|| bytes.to_vec()),
                            },
                            Instruction::Copy { offset, len } => {
                                DumpInstruction::Copy { offset, len }
                            }
                        });
                    }
                    out.push(DumpRecord::Delta {
                        key: entry.key.clone(),
                        delta_len: body.len(),
                        target_len,
                        instructions,
                    });
                }
            }
        }
        Ok(out)
    }
}

/// One record of a [`GroupCompressBlock::dump`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpRecord {
    Fulltext {
        key: Key,
        len: usize,
        text: Option<Vec<u8>>,
    },
    Delta {
        key: Key,
        delta_len: usize,
        target_len: usize,
        instructions: Vec<DumpInstruction>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DumpInstruction {
    Insert { len: usize, text: Option<Vec<u8>> },
    Copy { offset: usize, len: usize },
}
