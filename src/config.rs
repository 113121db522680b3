use educe::Educe;
use serde::{Deserialize, Serialize};

/// What a store does when its index contradicts itself or the blocks it points at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexTolerance {
    /// Any contradiction fails the operation with a corruption error.
    #[default]
    Fatal,
    /// Contradictions are logged and reported; reads of unaffected keys carry on.
    Tolerant,
}

/// Settings for a [`GroupCompressStore`](crate::GroupCompressStore).
///
/// # Defaults
///
/// Fields that aren't specified use their defaults instead. The defaults for each field are:
///
/// - graph: true
/// - delta: true
/// - key_length: 1
/// - tolerance: Fatal
/// - max_group_size: 4 MiB
/// - prefix_group_size: 2 MiB
/// - block_cache_capacity: 64
/// - index_compression_level: 3
/// - check_content: true
/// - reuse_blocks: true
///
#[derive(Educe, Clone, Debug, Serialize, Deserialize)]
#[educe(PartialEq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Track parent lists for every key.
    #[educe(Default = true)]
    pub graph: bool,
    /// Delta-compress texts against the rest of their group.
    #[educe(Default = true)]
    pub delta: bool,
    /// Number of parts every key must have.
    #[educe(Default = 1)]
    pub key_length: usize,
    /// How index inconsistencies are handled.
    pub tolerance: IndexTolerance,
    /// Encoded group size that always starts a new group.
    #[educe(Default = 4 << 20)]
    pub max_group_size: usize,
    /// Encoded group size past which a change of key prefix starts a new group.
    #[educe(Default = 2 << 20)]
    pub prefix_group_size: usize,
    /// Number of parsed blocks kept in memory.
    #[educe(PartialEq(ignore))]
    #[educe(Default = 64)]
    pub block_cache_capacity: usize,
    /// zstd level for index files.
    #[educe(PartialEq(ignore))]
    #[educe(Default = 3)]
    pub index_compression_level: i32,
    /// Check that lines given to `add_lines` are split correctly.
    #[educe(Default = true)]
    pub check_content: bool,
    /// Copy well used blocks from inserted record streams instead of recompressing them.
    #[educe(Default = true)]
    pub reuse_blocks: bool,
}

impl StoreConfig {
    /// Make a new configuration with the defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn graph(mut self, graph: bool) -> Self {
        self.graph = graph;
        self
    }

    pub fn delta(mut self, delta: bool) -> Self {
        self.delta = delta;
        self
    }

    pub fn key_length(mut self, key_length: usize) -> Self {
        self.key_length = key_length;
        self
    }

    pub fn tolerance(mut self, tolerance: IndexTolerance) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn max_group_size(mut self, size: usize) -> Self {
        self.max_group_size = size;
        self
    }

    pub fn prefix_group_size(mut self, size: usize) -> Self {
        self.prefix_group_size = size;
        self
    }

    pub fn block_cache_capacity(mut self, capacity: usize) -> Self {
        self.block_cache_capacity = capacity;
        self
    }

    pub fn index_compression_level(mut self, level: i32) -> Self {
        self.index_compression_level = level;
        self
    }

    pub fn check_content(mut self, check: bool) -> Self {
        self.check_content = check;
        self
    }

    pub fn reuse_blocks(mut self, reuse: bool) -> Self {
        self.reuse_blocks = reuse;
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = StoreConfig::default();
        assert!(config.graph);
        assert!(config.delta);
        assert_eq!(config.key_length, 1);
        assert_eq!(config.tolerance, IndexTolerance::Fatal);
        assert_eq!(config.max_group_size, 4 * 1024 * 1024);
        assert_eq!(config.prefix_group_size, 2 * 1024 * 1024);
        assert_eq!(config.block_cache_capacity, 64);
        assert!(config.reuse_blocks);
    }

    #[test]
    fn partial_json() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"graph": false, "tolerance": "tolerant"}"#).unwrap();
        assert_eq!(
            config,
            StoreConfig::new()
                .graph(false)
                .tolerance(IndexTolerance::Tolerant)
        );
        assert!(serde_json::from_str::<StoreConfig>(r#"{"grpah": false}"#).is_err());
    }

    #[test]
    fn builder() {
        let config = StoreConfig::new().key_length(2).delta(false).max_group_size(100);
        assert_eq!(config.key_length, 2);
        assert!(!config.delta);
        assert_eq!(config.max_group_size, 100);
    }
}
