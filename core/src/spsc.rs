//! Single-producer single-consumer ring used on the hot path between the
//! router output and the ring-buffer scheduler. Lock-free: one atomic load
//! and one atomic store per operation on each side.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner<T> {
    buf: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Next slot the producer writes. Only the producer stores this.
    tail: AtomicUsize,
    /// Next slot the consumer reads. Only the consumer stores this.
    head: AtomicUsize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for i in head..tail {
            let slot = &self.buf[i & self.mask];
            unsafe { (*slot.get()).assume_init_drop() };
        }
    }
}

pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a ring with the given capacity, which must be a power of two.
pub fn ring<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity.is_power_of_two(), "SPSC capacity must be a power of two");
    let buf = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(Inner {
        buf,
        mask: capacity - 1,
        tail: AtomicUsize::new(0),
        head: AtomicUsize::new(0),
    });
    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Push a value; on a full ring the value comes back in `Err` so the
    /// caller can apply its own backpressure policy.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let inner = &self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        if tail - head == inner.buf.len() {
            return Err(value);
        }
        let slot = &inner.buf[tail & inner.mask];
        unsafe { (*slot.get()).write(value) };
        inner.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.tail.load(Ordering::Relaxed) - self.inner.head.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.buf.len()
    }
}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<T> {
        let inner = &self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let slot = &inner.buf[head & inner.mask];
        let value = unsafe { (*slot.get()).assume_init_read() };
        inner.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.inner.tail.load(Ordering::Acquire) - self.inner.head.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let (mut tx, mut rx) = ring::<u32>(8);
        for i in 0..8 {
            tx.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(rx.pop(), Some(i));
        }
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn full_ring_rejects() {
        let (mut tx, mut rx) = ring::<u32>(4);
        for i in 0..4 {
            tx.push(i).unwrap();
        }
        assert_eq!(tx.push(99), Err(99));
        assert_eq!(rx.pop(), Some(0));
        tx.push(99).unwrap();
    }

    #[test]
    fn wraps_around_many_times() {
        let (mut tx, mut rx) = ring::<u64>(4);
        for i in 0..1000u64 {
            tx.push(i).unwrap();
            assert_eq!(rx.pop(), Some(i));
        }
    }

    #[test]
    fn cross_thread_transfer() {
        let (mut tx, mut rx) = ring::<u64>(1024);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    match tx.push(i) {
                        Ok(()) => break,
                        Err(_) => std::thread::yield_now(),
                    }
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.pop() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn drops_unconsumed_values() {
        let drops = std::sync::Arc::new(AtomicUsize::new(0));
        struct Tracked(std::sync::Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        {
            let (mut tx, rx) = ring::<Tracked>(8);
            for _ in 0..5 {
                tx.push(Tracked(Arc::clone(&drops))).map_err(|_| ()).unwrap();
            }
            drop(rx);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }
}
