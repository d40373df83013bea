//! Cancellable fixed-interval polls against the backend.
//!
//! Neither poll has a retry limit; the caller's cancellation token is the
//! only way out besides success or a backend error.

use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::{PowerState, VirtualizationBackend, VmId};
use crate::error::{ProvisionError, Result};

/// Wait until the guest reports `target` as its IP address
///
/// The first check happens one interval after the call.
pub async fn wait_for_guest_ip(
    backend: &dyn VirtualizationBackend,
    vm: &VmId,
    target: &str,
    hostname: &str,
    every: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled(format!("waiting for {} to report {}", hostname, target)));
            }
            _ = ticker.tick() => {}
        }

        let current = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled(format!("reading guest IP of {}", hostname)));
            }
            ip = backend.guest_ip(vm) => ip?,
        };

        match current.as_deref() {
            Some(ip) if ip == target => {
                info!("IP address for {} is expected {}.", hostname, ip);
                return Ok(());
            }
            other => {
                info!(
                    "Check to Install status for {}. Current ip address is {}.",
                    hostname,
                    other.filter(|ip| !ip.is_empty()).unwrap_or("null")
                );
            }
        }
    }
}

/// Wait until the VM reports powered off
pub async fn wait_for_power_off(
    backend: &dyn VirtualizationBackend,
    vm: &VmId,
    hostname: &str,
    every: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let state = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled(format!("waiting for {} to power off", hostname)));
            }
            state = backend.power_state(vm) => state?,
        };

        if state == PowerState::PoweredOff {
            info!("{} is powered off.", hostname);
            return Ok(());
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ProvisionError::Cancelled(format!("waiting for {} to power off", hostname)));
            }
            _ = tokio::time::sleep(every) => {}
        }
    }
}
