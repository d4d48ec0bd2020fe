use crate::thread_pool::DEFAULT_POOL_CAPACITY;

/// Number of completion threads to use when none is configured.
pub fn get_default_capacity() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_POOL_CAPACITY)
}
