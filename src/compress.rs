//! zlib for block segments, zstd for index files.

use flate2::{
    read::ZlibDecoder, write::ZlibEncoder, Compression, Decompress, FlushDecompress, Status,
};
use std::io::{Read, Write};
use std::{cell::RefCell, fmt};

thread_local! {
    static ZSTD_CCTX: RefCell<zstd_safe::CCtx<'static>> = RefCell::new(zstd_safe::CCtx::create());
    static ZSTD_DCTX: RefCell<zstd_safe::DCtx<'static>> = RefCell::new(zstd_safe::DCtx::create());
}

// Most a decompressor reserves before it has seen any output.
pub(crate) const PREALLOC_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
pub enum CompressionError {
    ExceededSize { max: usize, actual: usize },
    ZstdInner(usize),
    Zlib(String),
    Parsing(&'static str),
}

impl fmt::Display for CompressionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionError::ExceededSize { max, actual } => write!(
                f,
                "Decompressed size is {} bytes, larger than max of {} kiB",
                actual,
                (max + 1) >> 10
            ),
            CompressionError::ZstdInner(v) => write!(
                f,
                "zstd failure, code {} ({})",
                v,
                zstd_safe::get_error_name(*v)
            ),
            CompressionError::Zlib(s) => write!(f, "zlib failure: {}", s),
            CompressionError::Parsing(s) => f.write_str(s),
        }
    }
}

impl std::error::Error for CompressionError {}

impl From<zstd_safe::ErrorCode> for CompressionError {
    fn from(value: zstd_safe::ErrorCode) -> Self {
        CompressionError::ZstdInner(value)
    }
}

impl From<std::io::Error> for CompressionError {
    fn from(value: std::io::Error) -> Self {
        CompressionError::Zlib(value.to_string())
    }
}

/// Compress `input` as a single zlib stream.
pub fn zlib_compress(input: &[u8]) -> Result<Vec<u8>, CompressionError> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(input.len() / 2 + 64), Compression::default());
    enc.write_all(input)?;
    Ok(enc.finish()?)
}

/// Decompress a zlib stream, reading no more than one byte past `max_size`. The caller is
/// expected to compare the length of the result against what it was told to expect.
pub fn zlib_decompress(input: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    let mut output = Vec::with_capacity(max_size.min(PREALLOC_LIMIT));
    ZlibDecoder::new(input)
        .take(max_size as u64 + 1)
        .read_to_end(&mut output)?;
    Ok(output)
}

/// A zlib stream expanded a piece at a time, so a reader only pays for the prefix it uses.
///
/// Every call must pass the same compressed input.
pub(crate) struct ZlibInflater {
    state: Decompress,
    ended: bool,
}

impl ZlibInflater {
    pub(crate) fn new() -> Self {
        Self {
            state: Decompress::new(true),
            ended: false,
        }
    }

    /// True once the end of the zlib stream has been reached.
    pub(crate) fn is_finished(&self) -> bool {
        self.ended
    }

    /// Inflate onto the end of `out` until it holds at least `want` bytes, the stream ends, or
    /// `out` grows past `limit`. Growth past `limit` is left for the caller to report.
    pub(crate) fn inflate(
        &mut self,
        input: &[u8],
        out: &mut Vec<u8>,
        want: usize,
        limit: usize,
    ) -> Result<(), CompressionError> {
        while !self.ended && out.len() < want && out.len() <= limit {
            let consumed = usize::try_from(self.state.total_in()).unwrap_or(usize::MAX);
            let produced = self.state.total_out();
            let Some(rest) = input.get(consumed..) else {
                return Err(CompressionError::Zlib("consumed past the end of input".into()));
            };
            // One byte past the limit is enough to see an overrun
            let room = (want - out.len())
                .min(limit.saturating_add(1) - out.len())
                .min(PREALLOC_LIMIT);
            out.reserve_exact(room);
            let status = self
                .state
                .decompress_vec(rest, out, FlushDecompress::None)
                .map_err(|e| CompressionError::Zlib(e.to_string()))?;
            match status {
                Status::StreamEnd => self.ended = true,
                Status::Ok | Status::BufError => {
                    if self.state.total_out() == produced
                        && usize::try_from(self.state.total_in()).ok() == Some(consumed)
                    {
                        return Err(CompressionError::Zlib("zlib stream is truncated".into()));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Compress `input` as one zstd frame, with its content size recorded in the header.
pub fn zstd_compress(input: &[u8], level: i32) -> Result<Vec<u8>, CompressionError> {
    use zstd_safe::*;
    ZSTD_CCTX.with_borrow_mut(|ctx| {
        ctx.reset(ResetDirective::SessionAndParameters)?;
        ctx.set_parameter(CParameter::CompressionLevel(level))?;
        ctx.set_parameter(CParameter::ChecksumFlag(true))?;
        ctx.set_parameter(CParameter::ContentSizeFlag(true))?;
        ctx.set_pledged_src_size(Some(input.len() as u64))?;

        let mut output = vec![0u8; compress_bound(input.len())];
        let used_len = ctx.compress2(&mut output[..], input)?;
        output.truncate(used_len);
        Ok(output)
    })
}

/// Decompress one zstd frame. Fails if the frame doesn't declare its size, declares more than
/// `max_size`, or doesn't produce what it declared.
pub fn zstd_decompress(input: &[u8], max_size: usize) -> Result<Vec<u8>, CompressionError> {
    use zstd_safe::*;

    let out_size = get_frame_content_size(input)
        .map_err(|_| CompressionError::Parsing("Not a valid zstd frame header"))?
        .ok_or(CompressionError::Parsing("Missing frame content size"))?;
    let out_size = usize::try_from(out_size).unwrap_or(usize::MAX);
    if out_size > max_size {
        return Err(CompressionError::ExceededSize {
            max: max_size,
            actual: out_size,
        });
    }

    ZSTD_DCTX.with_borrow_mut(|dtx| {
        dtx.reset(ResetDirective::SessionAndParameters)?;
        let mut output = vec![0u8; out_size];
        let used_len = dtx.decompress(&mut output[..], input)?;
        if used_len != out_size {
            return Err(CompressionError::Parsing(
                "Decompressed size doesn't match promised size",
            ));
        }
        Ok(output)
    })
}
