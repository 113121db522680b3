//! gcpack stores many versions of many texts compactly, by compressing related texts together.
//!
//! It has two layers:
//!
//! - A group compression codec. Texts are fed one at a time into a [`GroupCompressor`], which
//!   stores each as a fulltext or as a delta against everything already in the group. A sealed
//!   group becomes a [`GroupCompressBlock`]: a small header, zlib-compressed metadata naming
//!   where each key's record lives, and the zlib-compressed records themselves. Any single text
//!   can be pulled back out of a block without expanding the others.
//! - A versioned-content store. A [`GroupCompressStore`] is a directory of immutable pack files,
//!   each a run of blocks, with one index file per pack mapping keys to their block. Keys are
//!   tuples of strings, optionally with parent keys forming a graph. Content is added through a
//!   [`PackWriter`] write group and becomes visible all at once when the group ends; content
//!   comes back out as a stream of [`Record`]s in the requested [`RecordOrder`]. Streams copied
//!   into another store carry their blocks along, so well used blocks are written through
//!   instead of being recompressed.
//!
//! Every text carries its SHA-1, which is checked whenever the text is expanded.
//!
//! A [`FormatRegistry`] names the store configurations a repository uses for its different kinds
//! of content.

mod compress;
mod error;

pub mod block;
pub mod compressor;
pub mod config;
pub mod delta;
pub mod digest;
pub mod index;
pub mod key;
pub mod ordering;
pub mod record;
pub mod registry;
pub mod reuse;
pub mod store;
pub mod varint;

pub use self::block::{BlockEntry, BlockBuilder, DumpRecord, EntryKind, GroupCompressBlock};
pub use self::compress::CompressionError;
pub use self::compressor::{Compressed, GroupCompressor};
pub use self::config::{IndexTolerance, StoreConfig};
pub use self::delta::apply_delta;
pub use self::digest::Sha1Digest;
pub use self::error::{Error, Result};
pub use self::key::{AddKey, Key};
pub use self::ordering::RecordOrder;
pub use self::record::{Record, StorageKind};
pub use self::registry::{FormatRegistry, StoreFactory};
pub use self::reuse::{BlockRun, CompactBlock, Compaction};
pub use self::store::{CheckReport, GroupCompressStore, InsertSummary, PackWriter, RecordStream};

