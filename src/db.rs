use log::debug;

use crate::block::{BlockStore, V1_0_0};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::file_store;
use crate::tree::{BTree, Pair};

/// A single-file key/value database: a B-tree of pairs over a block
/// store. `open` creates the backing file when it does not exist yet.
///
/// Tree mutations stay in memory until `checkpoint` persists the dirty
/// nodes; the returned root block index reopens the same tree through
/// `open_at`.
pub struct Db {
    store: BlockStore,
    tree: BTree<Pair>,
}

impl Db {
    /// Opens the backing file, creating and formatting it when missing,
    /// with a fresh empty tree.
    pub fn open(config: Config) -> Result<Db> {
        let store = Self::open_store(&config)?;
        if config.node_size > store.data_size() {
            return Err(Error::InvariantViolation(format!(
                "node size {} exceeds block payload capacity {}",
                config.node_size,
                store.data_size()
            )));
        }
        let tree = BTree::new(config.node_size)?;
        Ok(Db { store, tree })
    }

    /// Opens an existing file and loads the tree checkpointed at block
    /// `root`.
    pub fn open_at(config: Config, root: u32) -> Result<Db> {
        let store = Self::open_store(&config)?;
        let tree = BTree::load(&store, root)?;
        Ok(Db { store, tree })
    }

    fn open_store(config: &Config) -> Result<BlockStore> {
        let mut store = BlockStore::new(file_store(&config.path));
        match store.open() {
            Ok(()) => {}
            Err(Error::NotExists) => {
                debug!("no database at {:?}, creating", config.path);
                store.create(V1_0_0, config.block_size)?;
            }
            Err(err) => return Err(err),
        }
        Ok(store)
    }

    /// Inserts or replaces the value under `key`.
    pub fn put(&self, key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> Result<()> {
        self.tree.put(Pair::new(key, val))
    }

    /// Returns the value under `key`.
    pub fn get(&self, key: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
        self.tree.get(&Pair::probe(key)).map(Pair::into_value)
    }

    /// Deletes the value under `key`, if present.
    pub fn del(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.tree.del(&Pair::probe(key))
    }

    /// Persists all dirty tree nodes and returns the root's block index
    /// (0 for an empty tree). Pass it to `open_at` to reopen this tree.
    pub fn checkpoint(&mut self) -> Result<u32> {
        self.tree.sync(&mut self.store)
    }

    /// Closes the backing file. Unsynced tree state is discarded.
    pub fn close(mut self) -> Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path().join("test.blk"))
    }

    #[test]
    fn test_open_creates_then_reopens() {
        let dir = TempDir::new().expect("Failed to create temporary directory");

        let db = Db::open(config(&dir)).expect("open failed");
        db.close().expect("close failed");

        // A second open finds the formatted file.
        let db = Db::open(config(&dir)).expect("reopen failed");
        db.close().expect("close failed");
    }

    #[test]
    fn test_put_get_del() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let db = Db::open(config(&dir)).expect("open failed");

        db.put("alpha", "1").expect("put failed");
        db.put("beta", "2").expect("put failed");
        assert_eq!(db.get("alpha").expect("get failed"), b"1");
        assert_eq!(db.get("beta").expect("get failed"), b"2");

        db.put("alpha", "updated").expect("put failed");
        assert_eq!(db.get("alpha").expect("get failed"), b"updated");

        db.del("alpha").expect("del failed");
        assert_eq!(db.get("alpha"), Err(Error::NotFound));
        assert_eq!(db.get("beta").expect("get failed"), b"2");
    }

    #[test]
    fn test_checkpoint_and_open_at() {
        let dir = TempDir::new().expect("Failed to create temporary directory");

        let mut db = Db::open(config(&dir)).expect("open failed");
        for i in 0..40 {
            db.put(format!("key{i:02}"), format!("value{i:02}"))
                .expect("put failed");
        }
        let root = db.checkpoint().expect("checkpoint failed");
        assert_ne!(root, 0);
        db.close().expect("close failed");

        let db = Db::open_at(config(&dir), root).expect("open_at failed");
        for i in 0..40 {
            assert_eq!(
                db.get(format!("key{i:02}")).expect("get failed"),
                format!("value{i:02}").into_bytes()
            );
        }
        assert_eq!(db.get("missing"), Err(Error::NotFound));
    }

    #[test]
    fn test_checkpoint_empty_tree() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let mut db = Db::open(config(&dir)).expect("open failed");
        assert_eq!(db.checkpoint().expect("checkpoint failed"), 0);
    }

    #[test]
    fn test_node_size_must_fit_block() {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        let config = Config::new(dir.path().join("test.blk")).node_size(600);
        assert!(matches!(
            Db::open(config),
            Err(Error::InvariantViolation(_))
        ));
    }
}
