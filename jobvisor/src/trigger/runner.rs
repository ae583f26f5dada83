use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{TriggerCallback, TriggerError, TriggerId, TriggerMechanism, TriggerOptions};
use crate::{
    clock::{Clock, SystemClock},
    job::parse_cron,
};

struct Registration {
    callback: TriggerCallback,
    options: TriggerOptions,
    stop: CancellationToken,
}

struct Inner {
    registrations: Mutex<HashMap<TriggerId, Registration>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    id_counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

/// An in-process trigger mechanism running one tokio task per registration.
///
/// Callbacks are run on their own tasks, so a slow callback never delays the next firing of a
/// recurring trigger.
#[derive(Clone)]
pub struct TokioTriggerMechanism {
    inner: Arc<Inner>,
}

impl Default for TokioTriggerMechanism {
    fn default() -> Self {
        Self::new()
    }
}

impl TokioTriggerMechanism {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Cron schedules are evaluated against `clock`.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                registrations: Default::default(),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
                id_counter: AtomicU64::new(0),
                clock: Arc::new(clock),
            }),
        }
    }

    /// The ids of every live registration.
    pub fn registrations(&self) -> Vec<TriggerId> {
        self.inner
            .registrations
            .lock()
            .map(|registrations| registrations.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, id: &TriggerId) -> bool {
        self.inner
            .registrations
            .lock()
            .map(|registrations| registrations.contains_key(id))
            .unwrap_or_default()
    }

    fn ensure_running(&self) -> Result<(), TriggerError> {
        match self.inner.shutdown.is_cancelled() {
            true => Err(TriggerError::ShutDown),
            false => Ok(()),
        }
    }

    fn insert(&self, id: TriggerId, registration: Registration) -> Result<(), TriggerError> {
        let mut registrations = self
            .inner
            .registrations
            .lock()
            .map_err(|_| TriggerError::ShutDown)?;
        // Cancelled under the lock so that `retire` never removes the replacement.
        if let Some(previous) = registrations.insert(id, registration) {
            previous.stop.cancel();
        }
        Ok(())
    }

    /// Drop a registration whose task ended on its own, unless it has since been replaced.
    fn retire(&self, id: &TriggerId, stop: &CancellationToken) {
        if let Ok(mut registrations) = self.inner.registrations.lock() {
            if !stop.is_cancelled() {
                registrations.remove(id);
            }
        }
    }

    fn fire(&self, id: TriggerId, callback: TriggerCallback, options: TriggerOptions) {
        let shutdown = self.inner.shutdown.clone();
        self.inner
            .tasks
            .spawn(run_callback(id, callback, options, shutdown));
    }
}

async fn run_callback(
    id: TriggerId,
    callback: TriggerCallback,
    options: TriggerOptions,
    shutdown: CancellationToken,
) {
    let mut retries = 0;
    loop {
        match callback().await {
            Ok(()) => {
                tracing::debug!(trigger_id = %id, "Trigger {id} completed");
                return;
            }
            Err(error) if retries < options.retry_attempts => {
                retries += 1;
                tracing::warn!(
                    trigger_id = %id,
                    ?error,
                    "Trigger {id} failed, retrying ({retries}/{}): {error}",
                    options.retry_attempts
                );
                tokio::select! {
                    _ = tokio::time::sleep(options.retry_delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
            Err(error) => {
                tracing::error!(trigger_id = %id, ?error, "Trigger {id} failed: {error}");
                return;
            }
        }
    }
}

fn delay_until(clock: &dyn Clock, at: DateTime<FixedOffset>) -> Duration {
    (at.with_timezone(&Utc) - clock.now())
        .to_std()
        .unwrap_or(Duration::ZERO)
}

#[async_trait]
impl TriggerMechanism for TokioTriggerMechanism {
    async fn add_or_update_recurring(
        &self,
        id: TriggerId,
        callback: TriggerCallback,
        cron_expression: String,
        timezone: FixedOffset,
        options: TriggerOptions,
    ) -> Result<(), TriggerError> {
        self.ensure_running()?;
        let schedule = parse_cron(&cron_expression)?;
        let stop = self.inner.shutdown.child_token();
        self.insert(
            id.clone(),
            Registration {
                callback: callback.clone(),
                options,
                stop: stop.clone(),
            },
        )?;
        tracing::debug!(trigger_id = %id, %cron_expression, "Registered recurring trigger {id}");

        let mechanism = self.clone();
        self.inner.tasks.spawn(async move {
            let clock = mechanism.inner.clock.clone();
            let mut after = clock.now().with_timezone(&timezone);
            loop {
                let Some(next) = schedule.after(&after).next() else {
                    tracing::warn!(trigger_id = %id, "No future scheduled time for trigger {id}");
                    mechanism.retire(&id, &stop);
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay_until(clock.as_ref(), next)) => {
                        // Timers may fire marginally early against the wall clock.
                        let remaining = delay_until(clock.as_ref(), next);
                        if remaining > Duration::ZERO {
                            tokio::time::sleep(remaining).await;
                        }
                        mechanism.fire(id.clone(), callback.clone(), options);
                        after = next.max(clock.now().with_timezone(&timezone));
                    },
                    _ = stop.cancelled() => break,
                }
            }
            tracing::debug!(trigger_id = %id, "Stopped recurring trigger {id}");
        });
        Ok(())
    }

    async fn remove_if_exists(&self, id: &TriggerId) -> bool {
        let removed = self
            .inner
            .registrations
            .lock()
            .ok()
            .and_then(|mut registrations| registrations.remove(id));
        match removed {
            Some(registration) => {
                registration.stop.cancel();
                tracing::debug!(trigger_id = %id, "Removed trigger {id}");
                true
            }
            None => false,
        }
    }

    async fn trigger(&self, id: &TriggerId) -> Result<bool, TriggerError> {
        self.ensure_running()?;
        let registration = self
            .inner
            .registrations
            .lock()
            .map_err(|_| TriggerError::ShutDown)?
            .get(id)
            .map(|registration| (registration.callback.clone(), registration.options));
        match registration {
            Some((callback, options)) => {
                self.fire(id.clone(), callback, options);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn schedule(
        &self,
        callback: TriggerCallback,
        delay: Duration,
        options: TriggerOptions,
    ) -> Result<TriggerId, TriggerError> {
        self.ensure_running()?;
        let id = TriggerId::from(format!(
            "delayed-{}",
            self.inner.id_counter.fetch_add(1, Ordering::SeqCst) + 1
        ));
        let stop = self.inner.shutdown.child_token();
        self.insert(
            id.clone(),
            Registration {
                callback: callback.clone(),
                options,
                stop: stop.clone(),
            },
        )?;
        tracing::debug!(
            trigger_id = %id,
            ?delay,
            "Scheduled trigger {id}"
        );

        let mechanism = self.clone();
        self.inner.tasks.spawn({
            let id = id.clone();
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        mechanism.remove_if_exists(&id).await;
                        mechanism.fire(id, callback, options);
                    },
                    _ = stop.cancelled() => {},
                }
            }
        });
        Ok(id)
    }

    async fn graceful_shutdown(&self) {
        tracing::debug!("Shutting down trigger mechanism");
        self.inner.shutdown.cancel();
        if let Ok(mut registrations) = self.inner.registrations.lock() {
            registrations.clear();
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}
