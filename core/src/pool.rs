use std::sync::Mutex;

/// Bounded recycling pool. Keeps hot-path allocation flat by reusing
/// buffers/events instead of round-tripping through the allocator.
///
/// `take` never blocks: an empty pool falls back to `T::default()`.
/// `put` drops the value when the pool is already at capacity.
#[derive(Debug)]
pub struct Pool<T> {
    free: Mutex<Vec<T>>,
    max: usize,
}

impl<T: Default> Pool<T> {
    pub fn new(max: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max)),
            max,
        }
    }

    /// Pre-fill the pool with default-constructed values.
    pub fn prewarmed(max: usize) -> Self {
        let pool = Self::new(max);
        {
            let mut free = pool.free.lock().expect("pool lock poisoned");
            free.extend((0..max).map(|_| T::default()));
        }
        pool
    }

    pub fn take(&self) -> T {
        self.free
            .lock()
            .expect("pool lock poisoned")
            .pop()
            .unwrap_or_default()
    }

    pub fn put(&self, value: T) {
        let mut free = self.free.lock().expect("pool lock poisoned");
        if free.len() < self.max {
            free.push(value);
        }
    }

    pub fn available(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").len()
    }
}
