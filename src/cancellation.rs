//! Session cancellation. Each listening session gets a numbered guard holding
//! a child of the engine's current token; starting the next session cancels
//! the old token and bumps the number, so a superseded session can neither
//! commit fires nor touch the listening state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

pub struct SessionGeneration {
    root: Mutex<CancellationToken>,
    latest: Arc<AtomicU64>,
}

impl Default for SessionGeneration {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGeneration {
    pub fn new() -> Self {
        Self {
            root: Mutex::new(CancellationToken::new()),
            latest: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Supersede whatever session is running and hand out the next guard.
    pub fn cancel_and_advance(&self) -> SessionGuard {
        let mut root = self.root.lock();
        let previous = std::mem::replace(&mut *root, CancellationToken::new());
        previous.cancel();
        let id = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        SessionGuard {
            id,
            latest: Arc::clone(&self.latest),
            token: root.child_token(),
        }
    }

    /// Number of the newest session; 0 before the first start.
    pub fn current_generation(&self) -> u64 {
        self.latest.load(Ordering::SeqCst)
    }

    /// Stop the running session. The next start still gets a fresh number.
    pub fn cancel_all(&self) {
        self.root.lock().cancel();
    }
}

#[derive(Clone)]
pub struct SessionGuard {
    id: u64,
    latest: Arc<AtomicU64>,
    token: CancellationToken,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// No newer session has been started.
    #[inline]
    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::SeqCst) == self.id
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    #[inline]
    pub fn should_continue(&self) -> bool {
        self.is_current() && !self.is_cancelled()
    }

    /// Cancel this session only; used when its device fails.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_session_supersedes_previous() {
        let sessions = SessionGeneration::new();
        let first = sessions.cancel_and_advance();
        assert!(first.should_continue());

        let second = sessions.cancel_and_advance();
        assert!(first.is_cancelled());
        assert!(!first.is_current());
        assert!(second.should_continue());
        assert_eq!(second.id(), 2);
    }

    #[test]
    fn cancel_all_stops_without_renumbering() {
        let sessions = SessionGeneration::new();
        let guard = sessions.cancel_and_advance();
        sessions.cancel_all();
        assert!(guard.is_cancelled());
        assert!(guard.is_current());
        assert_eq!(sessions.current_generation(), 1);
        assert!(sessions.cancel_and_advance().should_continue());
    }

    #[test]
    fn guard_cancel_reaches_clones() {
        let sessions = SessionGeneration::new();
        let guard = sessions.cancel_and_advance();
        let clone = guard.clone();
        guard.cancel();
        assert!(!clone.should_continue());
    }
}
