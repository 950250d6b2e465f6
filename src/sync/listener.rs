//! # Realtime Listener
//!
//! Subscribes to pushed remote changes for the signed-in owner and folds
//! them into local state. Notifications arrive in bursts (a peer device
//! syncing writes one document per record), so the listener debounces:
//! each burst collapses into a single fetch-and-merge once the stream has
//! been quiet for the debounce window.
//!
//! The listener also watches connectivity. Push transports silently drop
//! their server connection while offline, so a reconnect tears down the
//! old subscription, registers a fresh one, and runs a catch-up merge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ChangeHandler, RemoteDocumentStore, SubscriptionHandle};
use crate::sync::{SyncEngine, RECORDS_COLLECTION};

enum ListenerEvent {
    /// A remote document changed
    RemoteChange,
    /// Connectivity was restored; resubscribe before merging
    Reconnected,
    /// Shut the worker down
    Stop,
}

struct ListenerState {
    tx: mpsc::UnboundedSender<ListenerEvent>,
    network_watch: SubscriptionHandle,
    worker: JoinHandle<()>,
}

/// Debounced bridge from pushed remote changes to engine merges.
/// `start` is idempotent; `stop` detaches every handler and waits for the
/// worker to finish its current merge.
pub struct RealtimeListener {
    engine: Arc<SyncEngine>,
    state: Mutex<Option<ListenerState>>,
    merges: Arc<AtomicU64>,
}

impl RealtimeListener {
    /// Create a stopped listener over the engine's collaborators
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self {
            engine,
            state: Mutex::new(None),
            merges: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Begin listening for the signed-in owner's changes. Calling while
    /// already running is a no-op.
    pub async fn start(&self) -> crate::error::Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!("listener already running");
            return Ok(());
        }

        let Some(owner) = self.engine.identity().current_owner_id().await else {
            return Err(crate::error::SyncError::NotAuthenticated);
        };

        let (tx, rx) = mpsc::unbounded_channel();

        let remote = Arc::clone(self.engine.remote_store());
        let subscription = remote
            .subscribe(RECORDS_COLLECTION, &owner, change_handler(tx.clone()))
            .await?;

        let network_tx = tx.clone();
        let network_watch = self.engine.network_state().on_change(Arc::new(move |connected| {
            if connected {
                let _ = network_tx.send(ListenerEvent::Reconnected);
            }
        }));

        let worker = tokio::spawn(run_worker(
            Arc::clone(&self.engine),
            remote,
            owner.clone(),
            rx,
            tx.clone(),
            subscription,
            Arc::clone(&self.merges),
        ));

        *state = Some(ListenerState {
            tx,
            network_watch,
            worker,
        });
        info!(owner = %owner, "realtime listener started");
        Ok(())
    }

    /// Stop listening and wait for the worker to wind down. Safe to call
    /// when not running.
    pub async fn stop(&self) {
        let state = self.state.lock().await.take();
        let Some(state) = state else {
            return;
        };
        let _ = state.tx.send(ListenerEvent::Stop);
        state.network_watch.cancel();
        if state.worker.await.is_err() {
            warn!("listener worker panicked during shutdown");
        }
        info!("realtime listener stopped");
    }

    /// Whether the listener is currently running
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Merges completed since construction (diagnostics)
    pub fn merge_count(&self) -> u64 {
        self.merges.load(Ordering::SeqCst)
    }
}

fn change_handler(tx: mpsc::UnboundedSender<ListenerEvent>) -> ChangeHandler {
    Arc::new(move |_change| {
        let _ = tx.send(ListenerEvent::RemoteChange);
    })
}

/// Event loop: wait for an event, coalesce the burst that follows it,
/// then run at most one merge. Resubscription happens before the merge so
/// the catch-up pass already sees fresh pushes.
async fn run_worker(
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteDocumentStore>,
    owner: String,
    mut rx: mpsc::UnboundedReceiver<ListenerEvent>,
    tx: mpsc::UnboundedSender<ListenerEvent>,
    subscription: SubscriptionHandle,
    merges: Arc<AtomicU64>,
) {
    let debounce = engine.config().listener_debounce;
    let mut subscription = Some(subscription);

    'outer: while let Some(event) = rx.recv().await {
        let mut resubscribe = false;
        match event {
            ListenerEvent::Stop => break,
            ListenerEvent::Reconnected => resubscribe = true,
            ListenerEvent::RemoteChange => {}
        }

        // Coalesce everything that arrives until the stream has been
        // quiet for one debounce window.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => break,
                next = rx.recv() => match next {
                    Some(ListenerEvent::Stop) | None => break 'outer,
                    Some(ListenerEvent::Reconnected) => resubscribe = true,
                    Some(ListenerEvent::RemoteChange) => {}
                },
            }
        }

        if resubscribe {
            if let Some(old) = subscription.take() {
                old.cancel();
            }
            match remote
                .subscribe(RECORDS_COLLECTION, &owner, change_handler(tx.clone()))
                .await
            {
                Ok(handle) => {
                    debug!("resubscribed after reconnect");
                    subscription = Some(handle);
                }
                Err(e) => warn!("resubscription failed: {}", e),
            }
        }

        if !engine.breaker().can_execute().await {
            debug!("breaker open, ignoring remote change");
            continue;
        }

        match engine.fetch_and_merge(&owner).await {
            Ok(()) => {
                merges.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => warn!("listener merge failed: {}", e),
        }
    }

    if let Some(handle) = subscription.take() {
        handle.cancel();
    }
    debug!("listener worker exited");
}
