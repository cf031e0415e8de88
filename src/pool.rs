use std::sync::Mutex;

// Enough spares for a handful of concurrent readers before falling back
// to allocation.
const MAX_SPARES: usize = 8;

/// A bounded free-list of fixed-size scratch buffers. `get` hands out a
/// zeroed buffer, preferring a recycled one; `put` returns it for reuse.
/// Amortizes the per-call allocations of block and metadata I/O.
pub struct BufferPool {
    size: usize,
    spares: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            spares: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let recycled = self.spares.lock().ok().and_then(|mut s| s.pop());
        match recycled {
            Some(mut buf) => {
                buf.iter_mut().for_each(|b| *b = 0);
                buf
            }
            None => vec![0u8; self.size],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.len() != self.size {
            return;
        }
        if let Ok(mut spares) = self.spares.lock() {
            if spares.len() < MAX_SPARES {
                spares.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_put_recycles() {
        let pool = BufferPool::new(16);
        let mut buf = pool.get();
        assert_eq!(buf.len(), 16);
        buf[0] = 0xff;
        pool.put(buf);

        // Recycled buffers come back zeroed.
        let buf = pool.get();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_rejects_wrong_size() {
        let pool = BufferPool::new(16);
        pool.put(vec![0u8; 4]);
        let buf = pool.get();
        assert_eq!(buf.len(), 16);
    }
}
