//! One contiguous byte region carved into fixed-size chunks.
//!
//! The arena is allocated once, up front, and every I/O context gets a chunk
//! bound to it for its whole life. Chunk ids live in a lock-free free list;
//! a chunk id is handed out at most once, which is what makes the byte
//! ranges of two chunks disjoint.

use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, slice};

use crossbeam_queue::ArrayQueue;

use crate::error::{Error, Result};

struct ArenaInner {
    base: NonNull<u8>,
    chunk_size: usize,
    chunks: usize,
    free_chunks: ArrayQueue<usize>,
}

impl ArenaInner {
    fn total_len(&self) -> usize {
        self.chunk_size * self.chunks
    }
}

impl Drop for ArenaInner {
    fn drop(&mut self) {
        let len = self.total_len();
        // SAFETY: `base` came from `Box::into_raw` on a boxed slice of exactly
        // `len` bytes and every `Chunk` holds an `Arc` to us, so none is alive.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base.as_ptr(),
                len,
            )));
        }
    }
}

// SAFETY: the raw region is only reachable through `Chunk`s, each of which
// covers a distinct range and is exclusively owned.
unsafe impl Send for ArenaInner {}
unsafe impl Sync for ArenaInner {}

/// The shared buffer arena.
#[derive(Clone)]
pub struct SharedArena {
    inner: Arc<ArenaInner>,
}

impl SharedArena {
    /// Allocates `chunk_size * chunks` zeroed bytes.
    pub fn new(chunk_size: usize, chunks: usize) -> Self {
        let storage = vec![0u8; chunk_size * chunks].into_boxed_slice();
        let base = NonNull::new(Box::into_raw(storage) as *mut u8).unwrap_or(NonNull::dangling());

        let free_chunks = ArrayQueue::new(chunks.max(1));
        for id in 0..chunks {
            let _ = free_chunks.push(id);
        }

        Self {
            inner: Arc::new(ArenaInner {
                base,
                chunk_size,
                chunks,
                free_chunks,
            }),
        }
    }

    /// Binds the next free chunk. The chunk is never returned to the arena;
    /// it lives as long as its owner.
    pub fn assign_buffer(&self) -> Result<Chunk> {
        let id = self.inner.free_chunks.pop().ok_or(Error::ArenaExhausted {
            chunks: self.inner.chunks,
        })?;
        Ok(Chunk {
            arena: Arc::clone(&self.inner),
            id,
            offset: id * self.inner.chunk_size,
            len: self.inner.chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Total number of chunks the arena was created with.
    pub fn pool_size(&self) -> usize {
        self.inner.chunks
    }

    /// Number of chunks not yet assigned.
    #[cfg(test)]
    fn unassigned(&self) -> usize {
        self.inner.free_chunks.len()
    }
}

/// A fixed byte range of the arena, exclusively owned.
pub struct Chunk {
    arena: Arc<ArenaInner>,
    id: usize,
    offset: usize,
    len: usize,
}

impl Chunk {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Byte offset of this chunk from the start of the arena.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `offset + len` is within the arena and no other chunk covers
        // this range; shared access is tied to `&self`.
        unsafe { slice::from_raw_parts(self.arena.base.as_ptr().add(self.offset), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.arena.base.as_ptr().add(self.offset), self.len) }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_until_exhausted() {
        let arena = SharedArena::new(64, 3);
        let chunks: Vec<_> = (0..3).map(|_| arena.assign_buffer().unwrap()).collect();
        assert_eq!(arena.unassigned(), 0);
        assert!(chunks.iter().all(|c| c.len() == 64));

        match arena.assign_buffer() {
            Err(Error::ArenaExhausted { chunks }) => assert_eq!(chunks, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn test_chunks_do_not_overlap() {
        let arena = SharedArena::new(128, 16);
        let mut ranges: Vec<_> = (0..16)
            .map(|_| {
                let c = arena.assign_buffer().unwrap();
                (c.offset(), c.offset() + c.len())
            })
            .collect();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
        assert_eq!(ranges.last().unwrap().1, 128 * 16);
    }

    #[test]
    fn test_writes_stay_inside_their_chunk() {
        let arena = SharedArena::new(8, 2);
        let mut a = arena.assign_buffer().unwrap();
        let mut b = arena.assign_buffer().unwrap();

        a.as_mut_slice().fill(0xAA);
        b.as_mut_slice().fill(0x55);

        assert!(a.as_slice().iter().all(|&x| x == 0xAA));
        assert!(b.as_slice().iter().all(|&x| x == 0x55));
    }

    #[test]
    fn test_chunks_outlive_arena_handle() {
        let arena = SharedArena::new(4, 1);
        let mut chunk = arena.assign_buffer().unwrap();
        drop(arena);
        chunk.as_mut_slice().copy_from_slice(b"live");
        assert_eq!(chunk.as_slice(), b"live");
    }

    #[test]
    fn test_concurrent_assignment_is_exclusive() {
        let arena = SharedArena::new(16, 64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Ok(chunk) = arena.assign_buffer() {
                        ids.push(chunk.id());
                    }
                    ids
                })
            })
            .collect();

        let mut ids: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (0..64).collect::<Vec<_>>());
    }
}
