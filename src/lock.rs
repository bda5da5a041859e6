//! Named mutual exclusion shared through the backend.
//!
//! A lock is a lease on one backend key holding a random token. The lease
//! expires after the configured ttl, so a holder that crashes cannot wedge
//! other processes. Acquisition retries with a fixed sleep until its
//! deadline; the async variant sleeps on the tokio timer instead of
//! blocking the thread.
//!
//! Locks are not reentrant: a second acquire from the flow already holding
//! the lock waits for it like any other contender.

use crate::backend::Backend;
use crate::config::LockConfig;
use crate::error::{BusError, Result};
use crate::history::KeyLayout;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A named lock backed by a backend lease.
#[derive(Clone)]
pub struct DistributedLock {
    backend: Arc<dyn Backend>,
    name: String,
    key: String,
    ttl: Duration,
    retry_interval: Duration,
}

impl fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DistributedLock {
    pub fn new(backend: Arc<dyn Backend>, layout: &KeyLayout, config: &LockConfig) -> Self {
        Self {
            backend,
            name: config.name.clone(),
            key: layout.lock(&config.name),
            ttl: config.ttl,
            retry_interval: config.retry_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Try to take the lock.
    ///
    /// Without `blocking` a single attempt is made. With it, attempts repeat
    /// until `timeout` elapses (forever when `None`). Returns `None` when
    /// the lock could not be taken.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<Option<LockGuard>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let token = Uuid::new_v4().to_string();

        loop {
            let attempted = Instant::now();
            if self.backend.try_lease(&self.key, &token, self.ttl)? {
                return Ok(Some(self.guard(token, attempted)));
            }
            match self.pause(blocking, deadline) {
                Some(pause) => std::thread::sleep(pause),
                None => return Ok(None),
            }
        }
    }

    /// Take the lock, waiting at most `wait`.
    pub fn acquire_or_timeout(&self, wait: Duration) -> Result<LockGuard> {
        self.acquire(true, Some(wait))?
            .ok_or_else(|| self.timed_out(wait))
    }

    /// Async form of [`acquire`](Self::acquire).
    pub async fn acquire_async(
        &self,
        blocking: bool,
        timeout: Option<Duration>,
    ) -> Result<Option<LockGuard>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let token = Uuid::new_v4().to_string();

        loop {
            let attempted = Instant::now();
            if self.backend.try_lease(&self.key, &token, self.ttl)? {
                return Ok(Some(self.guard(token, attempted)));
            }
            match self.pause(blocking, deadline) {
                Some(pause) => tokio::time::sleep(pause).await,
                None => return Ok(None),
            }
        }
    }

    /// Async form of [`acquire_or_timeout`](Self::acquire_or_timeout).
    pub async fn acquire_or_timeout_async(&self, wait: Duration) -> Result<LockGuard> {
        self.acquire_async(true, Some(wait))
            .await?
            .ok_or_else(|| self.timed_out(wait))
    }

    /// How long to sleep before the next attempt, or `None` to give up.
    fn pause(&self, blocking: bool, deadline: Option<Instant>) -> Option<Duration> {
        if !blocking {
            return None;
        }
        match deadline {
            None => Some(self.retry_interval),
            Some(deadline) => {
                let remaining = deadline.checked_duration_since(Instant::now())?;
                if remaining.is_zero() {
                    None
                } else {
                    Some(self.retry_interval.min(remaining))
                }
            }
        }
    }

    /// `attempted` is taken before the lease request, so the guard never
    /// overestimates what is left of the lease.
    fn guard(&self, token: String, attempted: Instant) -> LockGuard {
        tracing::trace!(lock = %self.name, "acquired lock");
        LockGuard {
            backend: Arc::clone(&self.backend),
            name: self.name.clone(),
            key: self.key.clone(),
            token,
            expires_at: attempted + self.ttl,
            released: false,
        }
    }

    fn timed_out(&self, waited: Duration) -> BusError {
        tracing::warn!(lock = %self.name, ?waited, "timed out acquiring lock");
        BusError::LockTimeout {
            name: self.name.clone(),
            waited,
        }
    }
}

/// Proof of holding a [`DistributedLock`]. Releases the lock when dropped.
pub struct LockGuard {
    backend: Arc<dyn Backend>,
    name: String,
    key: String,
    token: String,
    expires_at: Instant,
    released: bool,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Time left before the lease lapses and another holder may take it.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Release the lock.
    ///
    /// Fails with `LockNotHeld` if the lease expired in the meantime (and
    /// possibly passed to another holder).
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        if self.backend.release_lease(&self.key, &self.token)? {
            tracing::trace!(lock = %self.name, "released lock");
            Ok(())
        } else {
            Err(BusError::LockNotHeld(self.name.clone()))
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            // Expired leases need no release.
            let _ = self.backend.release_lease(&self.key, &self.token);
        }
    }
}
