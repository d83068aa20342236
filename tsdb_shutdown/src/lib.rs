//! Ordered process shutdown
//!
//! Points accepted by a transport (the frontend) are only safe once the
//! ingestion pipeline (the backend) has written them and handed their
//! metadata to the search index. Shutdown therefore runs backend first:
//!
//! 1. [`ShutdownManager::shutdown`] wakes every registered component through
//!    its [`ShutdownToken`].
//! 2. Each component drains its queues and calls
//!    [`complete`][ShutdownToken::complete].
//! 3. [`ShutdownManager::join`] returns once every component completed and
//!    only then cancels the frontend token handed to
//!    [`ShutdownManager::new`], letting transports close their sockets.
use std::{collections::BTreeSet, sync::Arc};

use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Coordinates shutdown of the registered backend components
#[derive(Debug)]
pub struct ShutdownManager {
    frontend_shutdown: CancellationToken,
    backend_shutdown: CancellationToken,
    tasks: TaskTracker,
    pending: Arc<Mutex<BTreeSet<&'static str>>>,
}

impl ShutdownManager {
    /// `frontend_shutdown` is cancelled once every registered component completed.
    pub fn new(frontend_shutdown: CancellationToken) -> Self {
        Self {
            frontend_shutdown,
            backend_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            pending: Default::default(),
        }
    }

    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a component that must drain before the process exits.
    ///
    /// The component must call [`complete`][ShutdownToken::complete] when done;
    /// dropping every clone of the token without doing so also releases the
    /// manager, but is logged.
    pub fn register(&self, component: &'static str) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(component);

        let pending = Arc::clone(&self.pending);
        self.tasks.spawn(async move {
            match rx.await {
                Ok(()) => info!(component, "component shut down"),
                Err(_) => warn!(component, "component released without completing shutdown"),
            }
            pending.lock().remove(component);
        });

        ShutdownToken {
            component,
            token: self.backend_shutdown.clone(),
            complete_tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Components that have not completed yet.
    pub fn pending_components(&self) -> Vec<&'static str> {
        self.pending.lock().iter().copied().collect()
    }

    /// Start shutting down the backend.
    pub fn shutdown(&self) {
        self.backend_shutdown.cancel();
    }

    /// Wait for all registered components, then release the frontend.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.frontend_shutdown.cancel();
    }
}

/// Issued by [`ShutdownManager::register`] to one component.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    component: &'static str,
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Shut the process down because this component hit an unrecoverable state.
    pub fn trigger_shutdown(&self) {
        warn!(component = self.component, "component triggered shutdown");
        self.token.cancel();
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// A token cancelled together with the backend, for use in `select!` loops
    /// of tasks owned by this component.
    pub fn cancellation(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Signal that this component finished draining.
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
