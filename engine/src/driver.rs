//! Background task that keeps the engine moving.
//!
//! Reacts to three sources:
//! - connectivity changes: becoming reachable starts a drain
//! - the sync timer: drains while reachable, re-probes while unverified
//! - the remote subscription: every snapshot is reconciled

use crate::{ConnectivityState, RemoteEvent, StateChange, Subscription, SyncEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Run a drain in its own task. The caller does not wait for it.
pub(crate) fn spawn_drain(engine: Arc<SyncEngine>, trigger: &'static str) {
    tokio::spawn(async move {
        match engine.drain().await {
            Ok(outcome) => debug!(trigger, ?outcome, "Background drain finished"),
            Err(e) => error!(trigger, error = %e, "Background drain failed"),
        }
    });
}

pub(crate) struct Driver {
    engine: Arc<SyncEngine>,
    connectivity: watch::Receiver<ConnectivityState>,
    subscription: Subscription,
    sync_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Driver {
    pub(crate) fn new(
        engine: Arc<SyncEngine>,
        subscription: Subscription,
        sync_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let connectivity = engine.monitor().subscribe();
        Self {
            engine,
            connectivity,
            subscription,
            sync_interval,
            shutdown,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_state = *self.connectivity.borrow_and_update();
        let mut listening = true;

        info!(
            collection = %self.engine.collection(),
            interval_secs = self.sync_interval.as_secs(),
            state = %last_state,
            "Sync driver started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("Sync driver shutting down");
                    break;
                }

                changed = self.connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *self.connectivity.borrow_and_update();
                    if state != last_state {
                        self.engine.notify(StateChange::Connectivity { state });
                        if state.is_reachable() {
                            spawn_drain(self.engine.clone(), "reachable");
                        }
                        last_state = state;
                    }
                }

                _ = ticker.tick() => {
                    match self.engine.monitor().state() {
                        ConnectivityState::OnlineReachable => {
                            spawn_drain(self.engine.clone(), "timer");
                        }
                        ConnectivityState::OnlineUnverified => {
                            debug!("Re-probing remote store");
                            self.engine.monitor().probe().await;
                        }
                        ConnectivityState::Offline => {}
                    }
                }

                event = self.subscription.recv(), if listening => {
                    match event {
                        Some(RemoteEvent::Snapshot(docs)) => {
                            let subscription = &mut self.subscription;
                            let newer = || loop {
                                match subscription.try_recv()? {
                                    RemoteEvent::Snapshot(docs) => return Some(docs),
                                    RemoteEvent::Error(message) => {
                                        warn!(error = %message, "Remote subscription reported an error");
                                    }
                                }
                            };
                            if let Err(e) = self.engine.reconcile_latest(docs, newer).await {
                                error!(error = %e, "Failed to reconcile remote snapshot");
                            }
                        }
                        Some(RemoteEvent::Error(message)) => {
                            warn!(error = %message, "Remote subscription reported an error");
                        }
                        None => {
                            warn!("Remote subscription closed");
                            listening = false;
                        }
                    }
                }
            }
        }

        self.subscription.unsubscribe();
    }
}
