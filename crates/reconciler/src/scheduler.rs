//! Sync scheduler.
//!
//! Each registered application owns one worker task, which is the only
//! place its syncs run. Triggers fill a single pending slot per application;
//! further triggers coalesce into it. Phases move
//! `Idle -> Queued -> Syncing -> Idle`, or `Syncing -> Failed -> Idle` when
//! the sync fails, and every transition is published as an event.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use keel_core::LogResultExt;
use keel_events::{AppName, EventBus, SyncEvent, SyncPhase, TriggerCause};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Runs one sync for an application.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// Run a full sync. An `Err` moves the application through `Failed`.
    async fn run_sync(&self, app: &AppName, cause: TriggerCause) -> Result<()>;
}

/// What a trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOutcome {
    /// The trigger filled the empty pending slot.
    Queued,
    /// A trigger was already pending; this one merged into it.
    Coalesced,
}

/// Scheduler view of one application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerState {
    pub phase: SyncPhase,
    pub pending: Option<TriggerCause>,
}

struct SlotState {
    phase: SyncPhase,
    pending: Option<TriggerCause>,
}

struct AppSlot {
    state: Mutex<SlotState>,
    wake: Notify,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Per-application sync scheduler.
pub struct SyncScheduler {
    runner: Weak<dyn SyncRunner>,
    bus: Option<Arc<EventBus>>,
    slots: RwLock<HashMap<AppName, Arc<AppSlot>>>,
}

impl SyncScheduler {
    /// Create a scheduler driving syncs through `runner`.
    ///
    /// The scheduler holds the runner weakly; workers exit once it is gone.
    pub fn new(runner: Weak<dyn SyncRunner>, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            runner,
            bus,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Start the worker for `app`.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationExists` if `app` is already registered.
    pub async fn register(&self, app: AppName) -> Result<()> {
        let mut slots = self.slots.write().await;
        if slots.contains_key(&app) {
            return Err(Error::application_exists(app.as_str()));
        }

        let (stop, stop_rx) = watch::channel(false);
        let slot = Arc::new(AppSlot {
            state: Mutex::new(SlotState {
                phase: SyncPhase::Idle,
                pending: None,
            }),
            wake: Notify::new(),
            stop,
            worker: Mutex::new(None),
        });
        let handle = tokio::spawn(worker(
            app.clone(),
            Arc::clone(&slot),
            self.runner.clone(),
            self.bus.clone(),
            stop_rx,
        ));
        *slot.worker.lock().await = Some(handle);
        slots.insert(app.clone(), slot);
        debug!(app = %app, "Scheduler worker started");
        Ok(())
    }

    /// Stop the worker for `app`, waiting for a running sync to finish.
    /// A pending trigger is dropped.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` if `app` is not registered.
    pub async fn unregister(&self, app: &AppName) -> Result<()> {
        let slot = self
            .slots
            .write()
            .await
            .remove(app)
            .ok_or_else(|| Error::application_not_found(app.as_str()))?;
        stop_slot(app, &slot).await;
        Ok(())
    }

    /// Request a sync of `app`.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` if `app` is not registered.
    pub async fn trigger(&self, app: &AppName, cause: TriggerCause) -> Result<TriggerOutcome> {
        let slot = self.slot(app).await?;
        let mut state = slot.state.lock().await;
        let mut events = Vec::new();
        let pending = state.pending;
        let outcome = match pending {
            Some(existing) => {
                if cause == TriggerCause::Manual && existing != TriggerCause::Manual {
                    state.pending = Some(TriggerCause::Manual);
                }
                TriggerOutcome::Coalesced
            }
            None => {
                state.pending = Some(cause);
                if matches!(state.phase, SyncPhase::Idle | SyncPhase::Failed) {
                    transition(app, &mut state, SyncPhase::Queued, &mut events);
                }
                TriggerOutcome::Queued
            }
        };
        // Published under the lock so events follow transition order.
        publish(self.bus.as_deref(), events).await;
        drop(state);

        if outcome == TriggerOutcome::Queued {
            slot.wake.notify_one();
        }
        debug!(app = %app, %cause, ?outcome, "Sync triggered");
        Ok(outcome)
    }

    /// Drop the pending trigger of `app`, if any. A running sync is never
    /// interrupted. Returns whether a trigger was removed.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` if `app` is not registered.
    pub async fn cancel_queued(&self, app: &AppName) -> Result<bool> {
        let slot = self.slot(app).await?;
        let mut state = slot.state.lock().await;
        let mut events = Vec::new();
        let cancelled = state.pending.take().is_some();
        if cancelled && state.phase == SyncPhase::Queued {
            transition(app, &mut state, SyncPhase::Idle, &mut events);
        }
        publish(self.bus.as_deref(), events).await;
        drop(state);

        if cancelled {
            info!(app = %app, "Queued sync cancelled");
        }
        Ok(cancelled)
    }

    /// Current phase and pending trigger of `app`.
    ///
    /// # Errors
    ///
    /// Returns `ApplicationNotFound` if `app` is not registered.
    pub async fn state(&self, app: &AppName) -> Result<SchedulerState> {
        let slot = self.slot(app).await?;
        let state = slot.state.lock().await;
        Ok(SchedulerState {
            phase: state.phase,
            pending: state.pending,
        })
    }

    /// Stop every worker, waiting for running syncs to finish.
    pub async fn shutdown(&self) {
        let slots: Vec<(AppName, Arc<AppSlot>)> = self.slots.write().await.drain().collect();
        for (app, slot) in &slots {
            stop_slot(app, slot).await;
        }
        info!(workers = slots.len(), "Scheduler stopped");
    }

    async fn slot(&self, app: &AppName) -> Result<Arc<AppSlot>> {
        self.slots
            .read()
            .await
            .get(app)
            .cloned()
            .ok_or_else(|| Error::application_not_found(app.as_str()))
    }
}

async fn stop_slot(app: &AppName, slot: &AppSlot) {
    slot.stop.send_replace(true);
    let handle = slot.worker.lock().await.take();
    if let Some(handle) = handle {
        if let Err(e) = handle.await {
            warn!(app = %app, error = %e, "Scheduler worker ended abnormally");
        }
    }
}

fn transition(app: &AppName, state: &mut SlotState, to: SyncPhase, events: &mut Vec<SyncEvent>) {
    let from = state.phase;
    if from == to {
        return;
    }
    if !from.can_transition_to(to) {
        warn!(app = %app, %from, %to, "Unexpected phase transition");
    }
    state.phase = to;
    events.push(SyncEvent::phase_changed(app.clone(), from, to));
}

async fn publish(bus: Option<&EventBus>, events: Vec<SyncEvent>) {
    let Some(bus) = bus else {
        return;
    };
    for event in events {
        bus.publish(event)
            .await
            .warn_on_err("Failed to publish phase change");
    }
}

async fn worker(
    app: AppName,
    slot: Arc<AppSlot>,
    runner: Weak<dyn SyncRunner>,
    bus: Option<Arc<EventBus>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            () = slot.wake.notified() => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        }

        // Drain: run until no trigger is pending.
        loop {
            if *stop.borrow() {
                break;
            }
            let cause = {
                let mut state = slot.state.lock().await;
                let Some(cause) = state.pending.take() else {
                    break;
                };
                let mut events = Vec::new();
                transition(&app, &mut state, SyncPhase::Syncing, &mut events);
                publish(bus.as_deref(), events).await;
                cause
            };

            let Some(runner) = runner.upgrade() else {
                debug!(app = %app, "Sync runner dropped, worker exiting");
                return;
            };
            let result = runner.run_sync(&app, cause).await;
            drop(runner);

            let mut state = slot.state.lock().await;
            let mut events = Vec::new();
            if let Err(e) = &result {
                debug!(app = %app, error = %e, "Sync failed");
                transition(&app, &mut state, SyncPhase::Failed, &mut events);
            }
            let next = if state.pending.is_some() {
                SyncPhase::Queued
            } else {
                SyncPhase::Idle
            };
            transition(&app, &mut state, next, &mut events);
            publish(bus.as_deref(), events).await;
        }
    }
    debug!(app = %app, "Scheduler worker stopped");
}
