//! Deferred release queue
//!
//! Design: wrapper `Drop` impls never call into native code. They push the
//! release they owe onto this queue, and the runtime carries the queue out
//! at its next safe point (before a call, on `tick`, on `stop`).

use parking_lot::Mutex;

/// Native release owed by a dropped wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingRelease {
    /// One `g_object_unref` on an instance
    Unref(usize),
    /// Native-allocator `free` of plain memory
    Free(usize),
    /// `g_boxed_free` of a boxed value of `gtype`
    BoxedFree { gtype: usize, address: usize },
}

impl PendingRelease {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unref(_) => "unref",
            Self::Free(_) => "free",
            Self::BoxedFree { .. } => "boxed_free",
        }
    }

    pub fn address(&self) -> usize {
        match self {
            Self::Unref(addr) | Self::Free(addr) => *addr,
            Self::BoxedFree { address, .. } => *address,
        }
    }
}

/// Releases waiting for the next safe point
#[derive(Debug, Default)]
pub struct ReleaseQueue {
    pending: Mutex<Vec<PendingRelease>>,
}

impl ReleaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callable from any `Drop`, including one running during another drain
    pub fn push(&self, release: PendingRelease) {
        self.pending.lock().push(release);
    }

    /// Take everything queued so far, in push order
    pub fn drain(&self) -> Vec<PendingRelease> {
        core::mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
