//! Fleet controller: one worker task per host, joined into a run report.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::BackendConnector;
use crate::config::{FleetConfig, PollingConfig};
use crate::error::{ProvisionError, Result};
use crate::installer::InstallerService;
use crate::types::HostIdentity;
use crate::worker::{HostOutcome, HostProvisioningWorker, HostReport, WorkerSettings};

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mac_separation: bool,
    /// Cancel the remaining workers after the first failure
    pub fail_fast: bool,
    pub guest_ip_interval: Duration,
    pub power_state_interval: Duration,
    /// How long cancelled workers get to wind down before they are aborted
    pub shutdown_grace: Duration,
}

impl RunOptions {
    pub fn from_config(polling: &PollingConfig) -> Self {
        Self {
            mac_separation: false,
            fail_fast: false,
            guest_ip_interval: polling.guest_ip_interval(),
            power_state_interval: polling.power_state_interval(),
            shutdown_grace: polling.shutdown_grace(),
        }
    }

    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            mac_separation: self.mac_separation,
            guest_ip_interval: self.guest_ip_interval,
            power_state_interval: self.power_state_interval,
        }
    }
}

#[derive(Debug)]
pub struct FleetReport {
    pub run_id: Uuid,
    /// One report per host, in index order
    pub hosts: Vec<HostReport>,
    /// The run was interrupted from outside
    pub interrupted: bool,
}

impl FleetReport {
    fn count(&self, pred: impl Fn(&HostReport) -> bool) -> usize {
        self.hosts.iter().filter(|h| pred(h)).count()
    }

    pub fn installed(&self) -> usize {
        self.count(|h| matches!(h.result, Ok(HostOutcome::Installed)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|h| matches!(h.result, Ok(HostOutcome::Skipped)))
    }

    pub fn failed(&self) -> usize {
        self.count(|h| h.is_failure())
    }

    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failed() == 0
    }

    /// Log one line per host plus totals
    pub fn log_summary(&self) {
        for host in &self.hosts {
            if host.is_failure() {
                error!("{}", host);
            } else {
                info!("{}", host);
            }
        }
        info!("{}", self);
    }
}

impl fmt::Display for FleetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {}: {} installed, {} skipped, {} failed",
            self.run_id,
            self.installed(),
            self.skipped(),
            self.failed()
        )?;
        if self.interrupted {
            f.write_str(" (interrupted)")?;
        }
        Ok(())
    }
}

pub struct FleetController {
    config: Arc<FleetConfig>,
    connector: Arc<dyn BackendConnector>,
    installer: Arc<dyn InstallerService>,
    options: RunOptions,
}

impl FleetController {
    pub fn new(
        config: FleetConfig,
        connector: Arc<dyn BackendConnector>,
        installer: Arc<dyn InstallerService>,
        options: RunOptions,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            installer,
            options,
        }
    }

    /// Provision every host concurrently
    ///
    /// Only planning errors fail the whole call; per-host failures end up in
    /// the report. Cancelling `shutdown` cancels every worker.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<FleetReport> {
        let hosts = self.config.plan_hosts()?;
        let run_id = Uuid::new_v4();
        let span = info_span!("fleet_run", %run_id);
        self.run_hosts(run_id, hosts, shutdown).instrument(span).await
    }

    async fn run_hosts(
        &self,
        run_id: Uuid,
        hosts: Vec<HostIdentity>,
        shutdown: CancellationToken,
    ) -> Result<FleetReport> {
        info!("Provisioning {} hosts", hosts.len());

        let run_cancel = shutdown.child_token();
        let mut tasks = JoinSet::new();
        let mut pending: BTreeMap<usize, HostIdentity> = BTreeMap::new();

        for identity in hosts {
            let worker = HostProvisioningWorker::new(
                identity.clone(),
                Arc::clone(&self.config),
                Arc::clone(&self.connector),
                Arc::clone(&self.installer),
                self.options.worker_settings(),
                run_cancel.child_token(),
            );
            let span = info_span!("host", host = %identity.fqdn, ip = %identity.ip);
            tasks.spawn(worker.run().instrument(span));
            pending.insert(identity.index, identity);
        }

        let mut reports = Vec::with_capacity(pending.len());
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    warn!("Shutdown requested; cancelling all workers");
                    interrupted = true;
                    run_cancel.cancel();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(report)) => {
                        let failed = report.is_failure() && !report.is_cancelled();
                        pending.remove(&report.identity.index);
                        reports.push(report);
                        if failed && self.options.fail_fast && !run_cancel.is_cancelled() {
                            warn!("Fail-fast: cancelling the remaining workers");
                            run_cancel.cancel();
                        }
                    }
                    Some(Err(e)) => error!("Worker task ended abnormally: {}", e),
                },
            }
        }

        if interrupted {
            self.drain(&mut tasks, &mut pending, &mut reports).await;
        }

        // Workers that never reported (panicked or aborted)
        for (_, identity) in pending {
            reports.push(HostReport {
                identity,
                last_state: None,
                result: Err(ProvisionError::Cancelled("aborted before reporting".to_string())),
            });
        }
        reports.sort_by_key(|r| r.identity.index);

        Ok(FleetReport {
            run_id,
            hosts: reports,
            interrupted,
        })
    }

    /// Collect cancelled workers, aborting whatever outlives the grace period
    async fn drain(
        &self,
        tasks: &mut JoinSet<HostReport>,
        pending: &mut BTreeMap<usize, HostIdentity>,
        reports: &mut Vec<HostReport>,
    ) {
        let deadline = tokio::time::sleep(self.options.shutdown_grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        "{} workers still running after {:?}; aborting them",
                        tasks.len(),
                        self.options.shutdown_grace
                    );
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    None => return,
                    Some(Ok(report)) => {
                        pending.remove(&report.identity.index);
                        reports.push(report);
                    }
                    Some(Err(e)) => error!("Worker task ended abnormally: {}", e),
                },
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok(report) = joined {
                pending.remove(&report.identity.index);
                reports.push(report);
            }
        }
    }
}
