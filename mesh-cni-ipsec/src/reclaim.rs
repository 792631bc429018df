//! Delayed removal of kernel state left behind by a key rotation.
//!
//! A rotation schedules one sweep after the configured delay so traffic still
//! using the outgoing key drains first. Only one sweep is pending at a time: a
//! rotation arriving inside the delay cancels the pending sweep and schedules
//! its own. The sweep keeps whatever versions the registry references when it
//! fires, so the later sweep covers every generation the cancelled one would
//! have removed.
//!
//! The retained set is every version any scope still references, not just the
//! version that triggered the sweep. With peer-scoped keys on mixed versions an
//! older version stays installed for as long as some scope uses it.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::keys::Spi;
use crate::registry::{KeyRegistry, Rotation};
use crate::xfrm::{StateSelector, XfrmDriver};
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub policies_deleted: usize,
    pub states_deleted: usize,
    pub failures: usize,
}

struct Pending {
    rotation: Rotation,
    cancel: CancellationToken,
}

pub struct Reclaimer<D: XfrmDriver> {
    driver: Arc<D>,
    registry: Arc<KeyRegistry>,
    delay: Duration,
    handle: Handle,
    cancel: CancellationToken,
    tracker: TaskTracker,
    pending: Mutex<Option<Pending>>,
}

impl<D: XfrmDriver + 'static> Reclaimer<D> {
    /// Captures the current tokio runtime, sweeps are spawned onto it.
    pub fn try_new(driver: Arc<D>, registry: Arc<KeyRegistry>, delay: Duration) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self {
            driver,
            registry,
            delay,
            handle,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            pending: Mutex::new(None),
        })
    }

    pub fn schedule(&self, rotation: Rotation) {
        let cancel = self.cancel.child_token();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(superseded) = pending.replace(Pending {
                rotation,
                cancel: cancel.clone(),
            }) {
                debug!(
                    superseded = superseded.rotation.current,
                    current = rotation.current,
                    "superseding pending SPI reclaim"
                );
                superseded.cancel.cancel();
            }
        }

        let deadline = Instant::now() + self.delay;
        let driver = Arc::clone(&self.driver);
        let registry = Arc::clone(&self.registry);
        info!(
            scope = %rotation.scope,
            previous = rotation.previous,
            current = rotation.current,
            delay = ?self.delay,
            "scheduling SPI reclaim"
        );
        self.tracker.spawn_on(
            async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!(previous = rotation.previous, "SPI reclaim cancelled");
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                let retain = registry.active_spis();
                info!(
                    previous = rotation.previous,
                    ?retain,
                    "new encryption keys, reclaiming SPI"
                );
                match tokio::task::spawn_blocking(move || sweep(driver.as_ref(), &retain)).await {
                    Ok(stats) => info!(
                        policies = stats.policies_deleted,
                        states = stats.states_deleted,
                        failures = stats.failures,
                        "SPI reclaim finished"
                    ),
                    Err(e) => warn!(%e, "SPI reclaim task failed"),
                }
            },
            &self.handle,
        );
    }

    /// Cancels pending sweeps and waits for running ones.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    #[cfg(test)]
    async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

/// Deletes IPsec policies and associations whose SPI is not in `retain`.
/// Policies without an IPsec encrypt/decrypt mark are left alone. A failed
/// listing skips that table; failed deletes are logged and skipped.
pub fn sweep<D: XfrmDriver + ?Sized>(driver: &D, retain: &BTreeSet<Spi>) -> SweepStats {
    let mut stats = SweepStats::default();

    match driver.policy_list() {
        Ok(policies) => {
            for policy in policies {
                let Some(spi) = policy.spi() else {
                    continue;
                };
                if retain.contains(&spi) || !policy.mark.is_some_and(|m| m.is_ipsec()) {
                    continue;
                }
                match driver.policy_delete(&policy.selector()) {
                    Ok(_) => stats.policies_deleted += 1,
                    Err(e) => {
                        warn!(spi, %e, "deleting old xfrm policy failed");
                        stats.failures += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!(%e, "deleting previous SPI, xfrm policy list error");
            stats.failures += 1;
        }
    }

    match driver.state_list() {
        Ok(states) => {
            for state in states {
                if retain.contains(&state.spi) {
                    continue;
                }
                match driver.state_delete(&StateSelector::from(&state)) {
                    Ok(_) => stats.states_deleted += 1,
                    Err(e) => {
                        warn!(spi = state.spi, %e, "deleting old xfrm state failed");
                        stats.failures += 1;
                    }
                }
            }
        }
        Err(e) => {
            warn!(%e, "deleting previous SPI, xfrm state list error");
            stats.failures += 1;
        }
    }

    stats
}
