use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::Result;

/// A positioned byte store: random-access reads and writes on a file-like
/// resource. Implementations serialize access internally, so concurrent
/// calls from multiple threads are safe but fully serialized.
pub trait ByteStore: Send {
    /// Reads into `buf` starting at `pos`. Returns the number of bytes
    /// read, which is only shorter than `buf` at end of store.
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf` starting at `pos`. Returns the number of bytes
    /// written.
    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize>;

    /// Current length of the store in bytes.
    fn len(&self) -> Result<u64>;

    fn close(&self) -> Result<()>;
}

/// Factory producing a byte store on demand. Called once per block store
/// `create` or `open`.
pub type ByteStoreFactory = Box<dyn Fn() -> Result<Box<dyn ByteStore>> + Send>;

/// A `ByteStore` over a local file. Seek-then-access runs under one mutex
/// so interleaved positioned calls never tear.
pub struct FileStore {
    file: Mutex<File>,
}

impl FileStore {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

/// Returns a factory that opens (creating if missing) the file at `path`
/// for read/write.
pub fn file_store(path: impl Into<PathBuf>) -> ByteStoreFactory {
    let path = path.into();
    Box::new(move || Ok(Box::new(FileStore::open(&path)?) as Box<dyn ByteStore>))
}

impl ByteStore for FileStore {
    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(pos))?;
        let mut read = 0;
        while read < buf.len() {
            let n = file.read(&mut buf[read..])?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    fn write_at(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut file = self.file.lock()?;
        file.seek(SeekFrom::Start(pos))?;
        file.write_all(buf)?;
        Ok(buf.len())
    }

    fn len(&self) -> Result<u64> {
        let file = self.file.lock()?;
        Ok(file.metadata()?.len())
    }

    fn close(&self) -> Result<()> {
        let file = self.file.lock()?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_read_write_at() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let store = FileStore::open(tmp.path()).expect("Failed to open store");

        store.write_at(0, b"hello world").expect("write failed");
        store.write_at(6, b"rust!").expect("write failed");

        let mut buf = [0u8; 11];
        let n = store.read_at(0, &mut buf).expect("read failed");
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello rust!");
        assert_eq!(store.len().expect("len failed"), 11);
    }

    #[test]
    fn test_read_past_end() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let store = FileStore::open(tmp.path()).expect("Failed to open store");

        store.write_at(0, b"abc").expect("write failed");
        let mut buf = [0u8; 8];
        let n = store.read_at(1, &mut buf).expect("read failed");
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn test_factory() {
        let tmp = NamedTempFile::new().expect("Failed to create temporary file");
        let factory = file_store(tmp.path());
        let store = factory().expect("factory failed");
        assert_eq!(store.len().expect("len failed"), 0);
    }
}
