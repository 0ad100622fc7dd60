//! Process-wide response cache.
//!
//! A single fixed-capacity slot holds the most recently built `/metrics`
//! response together with its expiry.  Handlers serialize on an atomic lock
//! word: the winner of a FREE→IN_USE compare-and-swap owns the slot until it
//! stores FREE back; losers sleep for a millisecond and retry.  Scrape rate is
//! low, so the unbounded retry is acceptable.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

const STATE_FREE: u8 = 0;
const STATE_IN_USE: u8 = 1;

/// Slot capacity when `metrics_cache_max_size` is unset.
pub const DEFAULT_CACHE_SIZE: usize = 256 * 1024;

/// Hard cap on the slot capacity.
pub const MAX_CACHE_SIZE: usize = 1024 * 1024;

/// Seconds since the Unix epoch.
fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

struct Slot {
    data: Vec<u8>,
    valid_until: u64,
    appending: bool,
}

/// The response cache: one slot, one writer at a time.
pub struct ResponseCache {
    lock: AtomicU8,
    max_age: u64,
    capacity: usize,
    slot: UnsafeCell<Slot>,
}

// The slot is only ever touched through a `CacheGuard`, which is handed out
// solely to the winner of the FREE→IN_USE CAS on `lock`.
unsafe impl Sync for ResponseCache {}

impl ResponseCache {
    /// Creates the cache from the configured knobs.
    ///
    /// `max_age == 0` disables caching; `max_size == 0` selects
    /// [`DEFAULT_CACHE_SIZE`]; any configured size is clamped to
    /// [`MAX_CACHE_SIZE`].
    pub fn new(max_age: u64, max_size: usize) -> ResponseCache {
        let capacity = if max_age == 0 {
            0
        } else if max_size > 0 {
            max_size.min(MAX_CACHE_SIZE)
        } else {
            DEFAULT_CACHE_SIZE
        };

        ResponseCache {
            lock: AtomicU8::new(STATE_FREE),
            max_age,
            capacity,
            slot: UnsafeCell::new(Slot {
                data: Vec::with_capacity(capacity),
                valid_until: 0,
                appending: false,
            }),
        }
    }

    /// Whether caching is configured at all.
    pub fn is_configured(&self) -> bool {
        self.max_age != 0
    }

    /// Acquires the slot, sleeping 1 ms between attempts.
    pub fn acquire(&self) -> CacheGuard<'_> {
        loop {
            if self
                .lock
                .compare_exchange(STATE_FREE, STATE_IN_USE, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return CacheGuard { cache: self };
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Unconditionally drops the cached response (management trigger).
    pub fn reset(&self) {
        self.acquire().invalidate();
    }
}

/// Exclusive access to the cache slot; releases the lock on drop.
pub struct CacheGuard<'a> {
    cache: &'a ResponseCache,
}

impl CacheGuard<'_> {
    fn slot(&self) -> &Slot {
        // The CAS in `acquire` made this guard the sole owner.
        unsafe { &*self.cache.slot.get() }
    }

    fn slot_mut(&mut self) -> &mut Slot {
        // The CAS in `acquire` made this guard the sole owner.
        unsafe { &mut *self.cache.slot.get() }
    }

    /// The cached response, when caching is configured, the payload is
    /// non-empty and the expiry lies in the future.
    pub fn serve(&self) -> Option<&[u8]> {
        if !self.cache.is_configured() {
            return None;
        }
        let slot = self.slot();
        if slot.valid_until == 0 || slot.data.is_empty() || now_epoch() > slot.valid_until {
            return None;
        }
        Some(&slot.data)
    }

    /// Drops the payload and expiry.
    pub fn invalidate(&mut self) {
        let slot = self.slot_mut();
        slot.data.clear();
        slot.valid_until = 0;
    }

    /// Starts a fresh build: invalidates and re-enables appending.
    pub fn begin(&mut self) {
        let configured = self.cache.is_configured();
        self.invalidate();
        self.slot_mut().appending = configured;
    }

    /// Appends response bytes to the payload.
    ///
    /// An append that would overflow the capacity invalidates the cache and
    /// disables appending for the remainder of the scrape; the live response
    /// keeps streaming regardless.
    pub fn append(&mut self, bytes: &[u8]) {
        let capacity = self.cache.capacity;
        let slot = self.slot_mut();
        if !slot.appending {
            return;
        }
        if slot.data.len() + bytes.len() >= capacity {
            debug!(
                append = bytes.len(),
                used = slot.data.len(),
                capacity,
                "response does not fit the metrics cache; caching skipped for this scrape"
            );
            slot.data.clear();
            slot.valid_until = 0;
            slot.appending = false;
            return;
        }
        slot.data.extend_from_slice(bytes);
    }

    /// Stamps the expiry at the end of a successful build.
    pub fn finalize(&mut self) {
        let max_age = self.cache.max_age;
        let configured = self.cache.is_configured();
        let slot = self.slot_mut();
        if !configured || !slot.appending {
            return;
        }
        slot.valid_until = now_epoch() + max_age;
    }
}

impl Drop for CacheGuard<'_> {
    fn drop(&mut self) {
        self.cache.lock.store(STATE_FREE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn unconfigured_cache_never_serves() {
        let cache = ResponseCache::new(0, 0);
        let mut guard = cache.acquire();
        guard.begin();
        guard.append(b"HTTP/1.1 200 OK\r\n\r\nbody");
        guard.finalize();
        assert!(guard.serve().is_none());
    }

    #[test]
    fn serves_after_finalize_until_reset() {
        let cache = ResponseCache::new(60, 0);
        {
            let mut guard = cache.acquire();
            guard.begin();
            guard.append(b"payload");
            assert!(guard.serve().is_none(), "not servable before finalize");
            guard.finalize();
            assert_eq!(guard.serve().expect("servable"), b"payload");
        }

        cache.reset();
        assert!(cache.acquire().serve().is_none());
    }

    #[test]
    fn overflow_disables_appending_for_the_scrape() {
        let cache = ResponseCache::new(60, 16);
        let mut guard = cache.acquire();
        guard.begin();
        guard.append(b"0123456789");
        guard.append(b"0123456789"); // 20 >= 16: overflow
        guard.append(b"x");
        guard.finalize();
        assert!(guard.serve().is_none(), "overflowed scrape must not become servable");

        // The next scrape starts over and fits.
        guard.begin();
        guard.append(b"tiny");
        guard.finalize();
        assert_eq!(guard.serve().expect("servable"), b"tiny");
    }

    #[test]
    fn configured_size_is_clamped() {
        let cache = ResponseCache::new(60, 64 * MAX_CACHE_SIZE);
        assert_eq!(cache.capacity, MAX_CACHE_SIZE);
        let cache = ResponseCache::new(60, 0);
        assert_eq!(cache.capacity, DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn lock_admits_one_holder_at_a_time() {
        let cache = Arc::new(ResponseCache::new(60, 0));
        let holders = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let holders = Arc::clone(&holders);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let mut guard = cache.acquire();
                        assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0, "second winner");
                        guard.begin();
                        guard.append(b"x");
                        holders.fetch_sub(1, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().expect("no holder panicked");
        }
    }
}
