use parking_lot::Mutex;
use tracing::warn;

/// A fixed-size, thread-safe free list of reusable items.
///
/// Unlike a growable object pool, popping from an empty `ResourcePool` never
/// creates a new item: it returns `None` and the caller is expected to treat
/// that as backpressure. Items are handed out LIFO so the most recently used
/// (and most likely cache-warm) one goes out first.
pub struct ResourcePool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> ResourcePool<T> {
    /// Creates an empty pool that will hold at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Creates a pool pre-filled with `capacity` items built by `create_fn`.
    pub fn filled<F>(capacity: usize, mut create_fn: F) -> Self
    where
        F: FnMut() -> T,
    {
        let pool = Self::new(capacity);
        {
            let mut items = pool.items.lock();
            for _ in 0..capacity {
                items.push(create_fn());
            }
        }
        pool
    }

    /// Creates a full pool out of `items`; its capacity is their count.
    pub fn from_items(items: Vec<T>) -> Self {
        Self {
            capacity: items.len(),
            items: Mutex::new(items),
        }
    }

    /// Takes one available item out of the pool.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    /// Returns an item to the pool, making it available again.
    #[inline]
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            drop(items);
            warn!(capacity = self.capacity, "resource pool is full, dropping surplus item");
            return;
        }
        items.push(item);
    }

    /// Number of items currently available.
    pub fn available(&self) -> usize {
        self.items.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of items handed out and not yet returned.
    pub fn checked_out(&self) -> usize {
        self.capacity - self.available()
    }
}
