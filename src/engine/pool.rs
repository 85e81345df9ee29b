//! Engine pool
//!
//! Fixed-capacity pool of paired detector+recognizer engines shared by all
//! streams. A stream checks a set out for its whole lifetime and returns it
//! on teardown; disposal forcibly reclaims every set the factory ever built,
//! including sets still checked out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::PoolError;

use super::{FaceDetector, FaceRecognizer};

/// A paired detector+recognizer checked out as a unit.
///
/// Handed out behind an `Arc` so returning a set to the pool never depends
/// on stage threads having released their references first.
pub struct EngineSet {
    pub detector: Box<dyn FaceDetector>,
    pub recognizer: Box<dyn FaceRecognizer>,
}

/// Builds engine sets and knows how to tear down their backing resources.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<EngineSet>;

    /// Best-effort reclamation of the hardware/process resources behind a
    /// set, for backends that do not release cleanly on drop. Called at
    /// disposal for every set the factory produced, checked out or not.
    fn force_reclaim(&self, _set: &EngineSet) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct EnginePool {
    capacity: usize,
    available: Receiver<Arc<EngineSet>>,
    returns: Sender<Arc<EngineSet>>,
    /// Every set ever produced, kept so disposal can reclaim checked-out
    /// sets too.
    all_sets: Mutex<Vec<Arc<EngineSet>>>,
    factory: Arc<dyn EngineFactory>,
    disposed: AtomicBool,
}

impl EnginePool {
    /// Build `capacity` engine sets up front. Construction is all-or-nothing:
    /// any factory failure aborts the whole pool.
    pub fn new(capacity: usize, factory: Arc<dyn EngineFactory>) -> anyhow::Result<Self> {
        info!("initializing engine pool with {capacity} set(s)");
        let (returns, available) = bounded(capacity);
        let mut all_sets = Vec::with_capacity(capacity);

        for i in 0..capacity {
            info!("loading engine set {}/{}", i + 1, capacity);
            let set = Arc::new(factory.create()?);
            all_sets.push(set.clone());
            returns
                .send(set)
                .expect("pool queue sized to capacity cannot reject construction");
        }

        info!("engine pool ready ({capacity} set(s) available)");
        Ok(Self {
            capacity,
            available,
            returns,
            all_sets: Mutex::new(all_sets),
            factory,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }

    pub fn checked_out(&self) -> usize {
        self.capacity - self.available.len()
    }

    /// Block up to `timeout` for a free engine set.
    pub fn acquire(&self, timeout: Duration) -> Result<Arc<EngineSet>, PoolError> {
        debug!(
            "acquiring engine set ({}/{} available)",
            self.available(),
            self.capacity
        );
        match self.available.recv_timeout(timeout) {
            Ok(set) => {
                debug!("engine set acquired");
                Ok(set)
            }
            Err(_) => {
                warn!("engine pool exhausted: nothing freed up within {timeout:?}");
                Err(PoolError::Exhausted(timeout))
            }
        }
    }

    /// Return a previously-acquired set. Callers must never release a set
    /// they did not acquire.
    pub fn release(&self, set: Arc<EngineSet>) {
        if self.disposed.load(Ordering::SeqCst) {
            debug!("pool already disposed, dropping returned engine set");
            return;
        }
        if self.returns.try_send(set).is_err() {
            warn!("engine set returned to an already-full pool, dropping it");
        } else {
            debug!(
                "engine set released ({}/{} available)",
                self.available(),
                self.capacity
            );
        }
    }

    /// Idempotent, best-effort disposal. Forcibly reclaims the resources of
    /// every set the factory produced, including sets currently checked out
    /// by running streams, then drains the pool. In-flight inference on
    /// reclaimed sets is expected to fail afterwards; those failures are the
    /// callers' to log and swallow.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!("disposing engine pool, forcibly reclaiming all engine sets");

        let all_sets = std::mem::take(&mut *self.all_sets.lock());
        for set in &all_sets {
            if let Err(err) = self.factory.force_reclaim(set) {
                // Expected for handles whose backing workers are already gone.
                warn!("engine reclaim reported an error (ignored): {err:#}");
            }
        }

        let mut drained = 0usize;
        while self.available.try_recv().is_ok() {
            drained += 1;
        }
        info!(
            "engine pool disposed ({} set(s) drained, {} were checked out)",
            drained,
            all_sets.len().saturating_sub(drained)
        );
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    use super::super::testsupport::StubFactory;
    use super::*;

    fn pool_of(capacity: usize) -> (EnginePool, Arc<StubFactory>) {
        let factory = Arc::new(StubFactory::new());
        let pool = EnginePool::new(capacity, factory.clone()).unwrap();
        (pool, factory)
    }

    #[test]
    fn test_counters_hold_invariant() {
        let (pool, _) = pool_of(2);
        assert_eq!(pool.available() + pool.checked_out(), 2);

        let a = pool.acquire(Duration::from_millis(100)).unwrap();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.checked_out(), 1);
        assert_eq!(pool.available() + pool.checked_out(), 2);

        let b = pool.acquire(Duration::from_millis(100)).unwrap();
        assert_eq!(pool.available() + pool.checked_out(), 2);

        pool.release(a);
        pool.release(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.checked_out(), 0);
    }

    #[test]
    fn test_acquire_times_out_when_empty() {
        let (pool, _) = pool_of(2);
        let _a = pool.acquire(Duration::from_millis(50)).unwrap();
        let _b = pool.acquire(Duration::from_millis(50)).unwrap();

        let start = Instant::now();
        let result = pool.acquire(Duration::from_millis(100));
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(PoolError::Exhausted(_))));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_release_frees_a_waiter() {
        let (pool, _) = pool_of(1);
        let set = pool.acquire(Duration::from_millis(50)).unwrap();

        let pool = Arc::new(pool);
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire(Duration::from_secs(2)))
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.release(set);

        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_construction_is_all_or_nothing() {
        let factory = Arc::new(StubFactory {
            fail_from: Some(1),
            ..StubFactory::new()
        });
        assert!(EnginePool::new(3, factory.clone()).is_err());
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispose_reclaims_checked_out_sets() {
        let (pool, factory) = pool_of(3);
        let _held = pool.acquire(Duration::from_millis(50)).unwrap();

        pool.dispose();
        assert_eq!(factory.reclaimed.load(Ordering::SeqCst), 3);
        assert_eq!(pool.available(), 0);

        // Idempotent: a second dispose does not reclaim again.
        pool.dispose();
        assert_eq!(factory.reclaimed.load(Ordering::SeqCst), 3);
    }
}
