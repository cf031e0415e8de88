use std::path::PathBuf;

/// Configuration for a database handle.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the backing file.
    pub path: PathBuf,

    /// Bytes per block (default: 512).
    pub block_size: u16,

    /// Byte budget per tree node. The default is derived from the block
    /// size so that even a node packed with minimal one-byte elements
    /// serializes within one block payload; workloads with larger
    /// elements can raise it, up to `block_size - 7`.
    pub node_size: u16,
}

/// The largest node budget whose serialized image is guaranteed to fit a
/// block: each element costs up to 7 bytes on disk (length prefix, after
/// index, one payload byte) against 1 byte of budget.
fn node_budget(block_size: u16) -> u16 {
    6 + block_size.saturating_sub(13) / 7
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./ember.blk"),
            block_size: 512,
            node_size: node_budget(512),
        }
    }
}

impl Config {
    /// Create a new config with the given backing file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the block size, re-deriving the default node budget for it.
    pub fn block_size(mut self, size: u16) -> Self {
        self.block_size = size;
        self.node_size = node_budget(size);
        self
    }

    /// Set the tree node byte budget.
    pub fn node_size(mut self, size: u16) -> Self {
        self.node_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.path, PathBuf::from("./ember.blk"));
        assert_eq!(config.block_size, 512);
        assert_eq!(config.node_size, 77);
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/test.blk").block_size(1024).node_size(256);
        assert_eq!(config.path, PathBuf::from("/tmp/test.blk"));
        assert_eq!(config.block_size, 1024);
        assert_eq!(config.node_size, 256);

        let config = Config::new("/tmp/test.blk").block_size(256);
        assert_eq!(config.node_size, 6 + (256 - 13) / 7);
    }

    #[test]
    fn test_default_node_budget_fits_one_block() {
        // A node at budget holds at most (node_size - 6) one-byte
        // elements; each costs 7 image bytes plus the 6-byte header.
        for block_size in [64u16, 128, 512, 4096] {
            let budget = node_budget(block_size) as usize;
            let worst_image = 6 + (budget - 6) * 7;
            assert!(worst_image <= block_size as usize - 7);
        }
    }
}
