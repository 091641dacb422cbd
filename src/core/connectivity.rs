//! Process-wide node connectivity flag.
//!
//! [`ConnectivityState`] is the single writer and is owned by the
//! supervisor. Everybody else (the health endpoint in particular) holds a
//! cloneable, read-only [`ConnectivityHandle`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    connected: AtomicBool,
    terminated: AtomicBool,
}

/// Writer side of the connectivity flag. Not `Clone`.
#[derive(Debug, Default)]
pub struct ConnectivityState {
    inner: Arc<Inner>,
}

impl ConnectivityState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a read-only handle sharing this state.
    pub fn handle(&self) -> ConnectivityHandle {
        ConnectivityHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        // Once terminated the flag stays down.
        if connected && self.inner.terminated.load(Ordering::Acquire) {
            return;
        }
        self.inner.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn set_terminated(&self) {
        self.inner.terminated.store(true, Ordering::Release);
        self.inner.connected.store(false, Ordering::Release);
    }
}

/// What a health check sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityStatus {
    Connected,
    Disconnected,
    /// Retries are exhausted; this will not recover without a restart.
    Terminated,
}

impl std::fmt::Display for ConnectivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityStatus::Connected => write!(f, "connected"),
            ConnectivityStatus::Disconnected => write!(f, "disconnected"),
            ConnectivityStatus::Terminated => write!(f, "terminated"),
        }
    }
}

/// Read-only view of the connectivity flag.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
    inner: Arc<Inner>,
}

impl ConnectivityHandle {
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ConnectivityStatus {
        if self.is_terminated() {
            ConnectivityStatus::Terminated
        } else if self.is_connected() {
            ConnectivityStatus::Connected
        } else {
            ConnectivityStatus::Disconnected
        }
    }
}
