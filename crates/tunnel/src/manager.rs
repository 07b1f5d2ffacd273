//! Owns the set of live sessions and picks the best one.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Session, SessionId, TransportKind};

struct Entry {
    session: Arc<Session>,
    cancel: CancellationToken,
}

/// Single owner of all live sessions. Higher layers query it but only ever
/// mutate the set through `add` / `remove` / `close_all`.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Entry>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, start its heartbeat, and (if given) arm `on_remove`
    /// to fire once when the session's cancel signal trips.
    pub fn add(&self, session: Arc<Session>, on_remove: Option<Box<dyn FnOnce() + Send>>) {
        let cancel = CancellationToken::new();

        self.sessions
            .write()
            .expect("session map lock poisoned")
            .insert(
                session.id(),
                Entry {
                    session: session.clone(),
                    cancel: cancel.clone(),
                },
            );

        {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { session.run_heartbeat(cancel).await });
        }

        if let Some(on_remove) = on_remove {
            tokio::spawn(async move {
                cancel.cancelled().await;
                on_remove();
            });
        }

        debug!(session = session.id(), transport = %session.kind(), "session added");
    }

    /// Remove a session: cancel once, close the multiplexer, delete the
    /// entry. Removing an unknown session is a no-op.
    pub fn remove(&self, session: &Session) {
        let entry = self
            .sessions
            .write()
            .expect("session map lock poisoned")
            .remove(&session.id());

        if let Some(entry) = entry {
            entry.cancel.cancel();
            entry.session.close();
            debug!(session = session.id(), "session removed");
        }
    }

    /// The preferred session: any `Secondary` if present, else any
    /// `Primary`, else none.
    pub fn get_best(&self) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("session map lock poisoned");
        let mut best: Option<&Entry> = None;
        for entry in sessions.values() {
            match best {
                None => best = Some(entry),
                Some(current) if current.session.kind() != TransportKind::Secondary
                    && entry.session.kind() == TransportKind::Secondary =>
                {
                    best = Some(entry)
                }
                Some(_) => {}
            }
        }
        best.map(|entry| entry.session.clone())
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .len()
    }

    /// Cancel and close every session.
    pub fn close_all(&self) {
        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        for (_, entry) in sessions.drain() {
            entry.cancel.cancel();
            entry.session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn pipe_session() -> Arc<Session> {
        let (a, b) = tokio::io::duplex(4096);
        let client = tokio::spawn(Session::new_pipe(a, false));
        let _server = Session::new_pipe(b, true).await.expect("server session");
        Arc::new(client.await.expect("join failed").expect("client session"))
    }

    #[tokio::test]
    async fn empty_manager_has_no_best() {
        let mgr = SessionManager::new();
        assert!(mgr.get_best().is_none());
        assert_eq!(mgr.count(), 0);
    }

    #[tokio::test]
    async fn add_and_get_best_primary() {
        let mgr = SessionManager::new();
        let s = pipe_session().await;
        mgr.add(s.clone(), None);

        assert_eq!(mgr.count(), 1);
        let best = mgr.get_best().expect("no best session");
        assert_eq!(best.id(), s.id());
        assert_eq!(best.kind(), TransportKind::Primary);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_fires_on_remove_once() {
        let mgr = SessionManager::new();
        let s = pipe_session().await;

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        mgr.add(
            s.clone(),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        mgr.remove(&s);
        mgr.remove(&s);
        assert_eq!(mgr.count(), 0);

        // Let the on_remove waiter run.
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_all_empties_the_set() {
        let mgr = SessionManager::new();
        mgr.add(pipe_session().await, None);
        mgr.add(pipe_session().await, None);
        assert_eq!(mgr.count(), 2);

        mgr.close_all();
        assert_eq!(mgr.count(), 0);
        assert!(mgr.get_best().is_none());
    }
}
