//! Group records and the copy/insert instructions inside delta records.
//!
//! A record is a one-byte tag followed by a varint length and that many bytes. Fulltext records
//! (`f`) carry the text itself. Delta records (`d`) carry the length of the source they were
//! computed against, the length of the text they produce, then a run of instructions:
//!
//! - Insert: a count byte from 1 to 0x7F, followed by that many literal bytes.
//! - Copy: a command byte with 0x80 set. Bits 0x01 through 0x08 say which little-endian offset
//!   bytes follow, bits 0x10 through 0x40 which length bytes follow. Zero bytes are left out, and
//!   a length of zero means 0x10000.

use crate::compress::PREALLOC_LIMIT;
use crate::error::{Error, Result};
use crate::varint;

pub const FULLTEXT_TAG: u8 = b'f';
pub const DELTA_TAG: u8 = b'd';

/// Largest insert a single instruction can carry.
pub const MAX_INSERT_LEN: usize = 0x7F;
/// Largest copy a single instruction can carry.
pub const MAX_COPY_LEN: usize = 0x10000;
/// Copy offsets are at most 32 bits.
pub const MAX_COPY_OFFSET: usize = u32::MAX as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction<'a> {
    Insert(&'a [u8]),
    Copy { offset: usize, len: usize },
}

/// Append insert instructions for `bytes`, split into runs no longer than [`MAX_INSERT_LEN`].
pub fn write_insert(bytes: &[u8], out: &mut Vec<u8>) {
    for run in bytes.chunks(MAX_INSERT_LEN) {
        out.push(run.len() as u8);
        out.extend_from_slice(run);
    }
}

/// Append copy instructions for `len` bytes at `offset`, split into runs no longer than
/// [`MAX_COPY_LEN`].
pub fn write_copy(mut offset: usize, mut len: usize, out: &mut Vec<u8>) -> Result<()> {
    while len > 0 {
        let run = len.min(MAX_COPY_LEN);
        encode_copy(offset, run, out)?;
        offset += run;
        len -= run;
    }
    Ok(())
}

fn encode_copy(offset: usize, len: usize, out: &mut Vec<u8>) -> Result<()> {
    if offset > MAX_COPY_OFFSET {
        return Err(Error::Format(format!(
            "copy offset {} doesn't fit in 32 bits",
            offset
        )));
    }
    let cmd_pos = out.len();
    let mut cmd = 0x80u8;
    out.push(cmd);
    for i in 0..4 {
        let b = (offset >> (8 * i)) as u8;
        if b != 0 {
            cmd |= 1 << i;
            out.push(b);
        }
    }
    if len != MAX_COPY_LEN {
        for i in 0..2 {
            let b = (len >> (8 * i)) as u8;
            if b != 0 {
                cmd |= 0x10 << i;
                out.push(b);
            }
        }
    }
    out[cmd_pos] = cmd;
    Ok(())
}

fn take_byte(buf: &mut &[u8]) -> Result<u8> {
    let (&b, rest) = buf
        .split_first()
        .ok_or_else(|| Error::Format("delta instruction cut short".into()))?;
    *buf = rest;
    Ok(b)
}

/// Read one instruction from the front of `buf`.
pub fn read_instruction<'a>(buf: &mut &'a [u8]) -> Result<Instruction<'a>> {
    let cmd = take_byte(buf)?;
    if cmd & 0x80 == 0 {
        if cmd == 0 {
            return Err(Error::Format("zero is not a valid delta command".into()));
        }
        let len = cmd as usize;
        if buf.len() < len {
            return Err(Error::Format(format!(
                "insert of {} bytes, but only {} remain",
                len,
                buf.len()
            )));
        }
        let (bytes, rest) = buf.split_at(len);
        *buf = rest;
        return Ok(Instruction::Insert(bytes));
    }
    let mut offset = 0usize;
    for i in 0..4 {
        if cmd & (1 << i) != 0 {
            offset |= (take_byte(buf)? as usize) << (8 * i);
        }
    }
    let mut len = 0usize;
    for i in 0..3 {
        if cmd & (0x10 << i) != 0 {
            len |= (take_byte(buf)? as usize) << (8 * i);
        }
    }
    if len == 0 {
        len = MAX_COPY_LEN;
    }
    Ok(Instruction::Copy { offset, len })
}

/// Iterator over the instructions of a delta body, after its two length headers.
#[derive(Clone, Debug)]
pub struct Instructions<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let item = read_instruction(&mut self.rest);
        if item.is_err() {
            self.rest = &[];
        }
        Some(item)
    }
}

/// A parsed delta body.
#[derive(Clone, Debug)]
pub struct Delta<'a> {
    pub source_len: usize,
    pub target_len: usize,
    pub instructions: Instructions<'a>,
}

impl<'a> Delta<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self> {
        let mut rest = body;
        let source_len = varint::read(&mut rest)? as usize;
        let target_len = varint::read(&mut rest)? as usize;
        Ok(Self {
            source_len,
            target_len,
            instructions: Instructions { rest },
        })
    }
}

/// Rebuild the target text of a delta `body` by copying from `source`.
///
/// The delta's declared source length must not exceed `source`; copies are checked against the
/// declared length, and the result must come out at exactly the declared target length.
pub fn apply_delta(source: &[u8], body: &[u8]) -> Result<Vec<u8>> {
    let delta = Delta::parse(body)?;
    if delta.source_len > source.len() {
        return Err(Error::Corruption(format!(
            "delta wants a {} byte source, only {} available",
            delta.source_len,
            source.len()
        )));
    }
    let basis = &source[..delta.source_len];
    let mut out = Vec::with_capacity(delta.target_len.min(PREALLOC_LIMIT));
    for inst in delta.instructions {
        match inst? {
            Instruction::Insert(bytes) => out.extend_from_slice(bytes),
            Instruction::Copy { offset, len } => {
                let end = offset.checked_add(len).filter(|&e| e <= basis.len());
                let Some(end) = end else {
                    return Err(Error::Corruption(format!(
                        "copy of {} bytes at {} runs past the {} byte source",
                        len,
                        offset,
                        basis.len()
                    )));
                };
                out.extend_from_slice(&basis[offset..end]);
            }
        }
        if out.len() > delta.target_len {
            break;
        }
    }
    if out.len() != delta.target_len {
        return Err(Error::Corruption(format!(
            "delta produced {} bytes, expected {}",
            out.len(),
            delta.target_len
        )));
    }
    Ok(out)
}

/// The two kinds of group record, borrowed from their encoded form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordBody<'a> {
    Fulltext(&'a [u8]),
    Delta(&'a [u8]),
}

impl<'a> RecordBody<'a> {
    /// Split an encoded record into its kind and payload. The record must be exactly one
    /// tag-and-length-prefixed record, with nothing trailing.
    pub fn parse(record: &'a [u8]) -> Result<Self> {
        let Some((&tag, mut rest)) = record.split_first() else {
            return Err(Error::Format("empty group record".into()));
        };
        let len = varint::read(&mut rest)? as usize;
        if rest.len() != len {
            return Err(Error::Format(format!(
                "record declares {} bytes but holds {}",
                len,
                rest.len()
            )));
        }
        match tag {
            FULLTEXT_TAG => Ok(RecordBody::Fulltext(rest)),
            DELTA_TAG => Ok(RecordBody::Delta(rest)),
            _ => Err(Error::Format(format!("unknown record tag {:#04x}", tag))),
        }
    }

    /// Reconstruct the text, using `source` as everything that preceded the record in its group.
    pub fn expand(&self, source: &[u8]) -> Result<Vec<u8>> {
        match *self {
            RecordBody::Fulltext(text) => Ok(text.to_vec()),
            RecordBody::Delta(body) => apply_delta(source, body),
        }
    }
}
