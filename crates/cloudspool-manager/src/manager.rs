// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer Manager: owns the printer/job tables and runs the reconciliation
// loop, the poll-fallback loop, and the push-event loop that feed dispatch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use cloudspool_cloud::{CloudPrint, PushEvent};
use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{Identity, ManagerSnapshot};
use cloudspool_cups::LocalPrintService;

use crate::dispatch::{Admission, DispatchConfig, Dispatcher};
use crate::reconcile::Reconciler;
use crate::tables::{JobTable, PrinterTable};

/// Read-only view of the tables for diagnostics. Cheap to clone.
#[derive(Clone)]
pub struct SnapshotReader {
    printers: Arc<PrinterTable>,
    jobs: Arc<JobTable>,
}

impl SnapshotReader {
    pub fn new(printers: Arc<PrinterTable>, jobs: Arc<JobTable>) -> Self {
        Self { printers, jobs }
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            printers: self.printers.snapshot().into_values().collect(),
            jobs: self.jobs.snapshot(),
            counters: self.jobs.counters(),
            taken_at: Utc::now(),
        }
    }
}

/// Lists queued jobs and feeds them to the dispatcher.
#[derive(Clone)]
struct JobPoller {
    cloud: Arc<dyn CloudPrint>,
    printers: Arc<PrinterTable>,
    dispatcher: Dispatcher,
}

impl JobPoller {
    async fn poll_printer(&self, printer_id: &str) {
        let queued = match self.cloud.list_queued_jobs(printer_id).await {
            Ok(queued) => queued,
            Err(e) => {
                warn!(printer_id, error = %e, "listing queued jobs failed");
                return;
            }
        };
        for job in queued {
            match self.dispatcher.admit(job.id, &job.printer_id).await {
                Admission::ShuttingDown => return,
                Admission::Started | Admission::Duplicate => {}
            }
        }
    }

    /// Poll every registered printer once.
    async fn catch_up(&self) {
        let ids = self.printers.cloud_ids();
        debug!(printers = ids.len(), "polling all printers for queued jobs");
        for id in ids {
            if self.dispatcher.is_stopping() {
                return;
            }
            self.poll_printer(&id).await;
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// The running Printer Manager.
pub struct PrinterManager {
    reader: SnapshotReader,
    dispatcher: Dispatcher,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    fatal: Option<mpsc::UnboundedReceiver<CloudspoolError>>,
    drain_timeout: Duration,
}

impl PrinterManager {
    /// Run the first reconciliation pass and start the background loops.
    ///
    /// A fatal error in the first pass (robot credential rejected) aborts
    /// startup; any other failure is retried on the next tick. Queued jobs of
    /// every known printer are polled once before push events are consumed.
    pub async fn start(
        config: &ConnectorConfig,
        cloud: Arc<dyn CloudPrint>,
        local: Arc<dyn LocalPrintService>,
        push_events: Option<mpsc::UnboundedReceiver<PushEvent>>,
    ) -> Result<Self> {
        config.validate()?;
        let printers = Arc::new(PrinterTable::new());
        let jobs = Arc::new(JobTable::new());
        let reconciler = Reconciler::new(config, cloud.clone(), local.clone(), printers.clone());
        let dispatcher = Dispatcher::new(
            DispatchConfig::from_config(config),
            cloud.clone(),
            local,
            printers.clone(),
            jobs.clone(),
        );

        match reconciler.reconcile_once().await {
            Ok(report) => info!(?report, "initial reconciliation done"),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!(error = %e, "initial reconciliation failed, retrying on next tick"),
        }

        let (shutdown, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let poller = JobPoller {
            cloud,
            printers: printers.clone(),
            dispatcher: dispatcher.clone(),
        };
        let period = config.printer_poll_interval();
        let mut tasks = Vec::with_capacity(3);

        // Reconciliation loop.
        {
            let mut stop = shutdown.subscribe();
            let fatal_tx = fatal_tx.clone();
            let mut tick = ticker(period);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        _ = tick.tick() => {}
                    }
                    match reconciler.reconcile_once().await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "reconciliation hit a fatal error");
                            let _ = fatal_tx.send(e);
                            break;
                        }
                        Err(e) => warn!(error = %e, "reconciliation pass failed"),
                    }
                }
                debug!("reconciliation loop stopped");
            }));
        }

        // Poll fallback loop.
        {
            let mut stop = shutdown.subscribe();
            let poller = poller.clone();
            let mut tick = ticker(period);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stopped(&mut stop) => break,
                        _ = tick.tick() => poller.catch_up().await,
                    }
                }
                debug!("poll fallback loop stopped");
            }));
        }

        // Startup catch-up, then push events.
        {
            let mut stop = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                poller.catch_up().await;
                let Some(mut events) = push_events else {
                    return;
                };
                loop {
                    let event = tokio::select! {
                        _ = stopped(&mut stop) => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Some(PushEvent::Notification { printer_id }) => {
                            debug!(%printer_id, "job notification");
                            poller.poll_printer(&printer_id).await;
                        }
                        Some(PushEvent::Connected { reconnect: true }) => {
                            info!("push session reconnected, catching up");
                            poller.catch_up().await;
                        }
                        Some(PushEvent::Connected { reconnect: false }) => {
                            debug!("push session connected");
                        }
                        Some(PushEvent::Disconnected) => {
                            info!("push session disconnected, relying on polling");
                        }
                        Some(PushEvent::Fatal { detail }) => {
                            let _ = fatal_tx.send(CloudspoolError::Authentication {
                                identity: Identity::Robot,
                                detail,
                            });
                            break;
                        }
                        None => break,
                    }
                }
                debug!("push event loop stopped");
            }));
        }

        info!(period_secs = period.as_secs(), "printer manager started");
        Ok(Self {
            reader: SnapshotReader { printers, jobs },
            dispatcher,
            shutdown,
            tasks,
            fatal: Some(fatal_rx),
            drain_timeout: config.shutdown_drain_timeout(),
        })
    }

    /// Errors the manager cannot continue after. Handed out once.
    pub fn take_fatal_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<CloudspoolError>> {
        self.fatal.take()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        self.reader.snapshot()
    }

    pub fn snapshot_reader(&self) -> SnapshotReader {
        self.reader.clone()
    }

    /// Stop admitting jobs, stop the loops, and drain in-flight workers.
    pub async fn stop(self) {
        info!("stopping printer manager");
        self.dispatcher.stop_admitting();
        self.shutdown.send_replace(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "manager task ended abnormally");
            }
        }
        self.dispatcher.drain(self.drain_timeout).await;
        info!("printer manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::Ordering;

    use cloudspool_core::types::{CloudJobStatus, JobState};

    use super::*;
    use crate::fakes::{FakeCloud, FakeSpooler, local_printer};

    fn config() -> ConnectorConfig {
        ConnectorConfig {
            robot_refresh_token: "1/robot".into(),
            ..Default::default()
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..600 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn startup_registers_printers_and_catches_up_queued_jobs() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.add_printer("cloud-old", "printer-A");
        cloud.add_printer("cloud-dup", "printer-A");
        cloud.queue_job("J1", "cloud-old", BTreeMap::new());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));

        let manager = PrinterManager::start(&config(), cloud.clone(), spooler.clone(), None)
            .await
            .unwrap();

        let registered = cloud.registered();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].id, "cloud-old");

        wait_until(|| cloud.statuses_for("J1").contains(&CloudJobStatus::Done)).await;
        assert_eq!(spooler.submissions().len(), 1);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.printers.len(), 1);
        assert_eq!(snapshot.counters.done, 1);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_is_refused_at_start() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));
        let config = ConnectorConfig {
            cups_printer_poll_interval_secs: 0,
            ..config()
        };

        let result = PrinterManager::start(&config, cloud.clone(), spooler, None).await;
        assert!(matches!(result, Err(CloudspoolError::Config(_))));
        assert!(cloud.registered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_with_failed_update_still_prints_for_registered_printer() {
        let cloud = Arc::new(FakeCloud::default());
        cloud.add_printer("cloud-old", "printer-A");
        cloud.failing_updates.store(1, Ordering::SeqCst);
        cloud.queue_job("J1", "cloud-old", BTreeMap::new());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = PrinterManager::start(&config(), cloud.clone(), spooler.clone(), Some(rx))
            .await
            .unwrap();

        wait_until(|| cloud.statuses_for("J1").contains(&CloudJobStatus::Done)).await;

        cloud.queue_job("J2", "cloud-old", BTreeMap::new());
        tx.send(PushEvent::Notification {
            printer_id: "cloud-old".into(),
        })
        .unwrap();
        wait_until(|| cloud.statuses_for("J2").contains(&CloudJobStatus::Done)).await;

        assert_eq!(spooler.submissions().len(), 2);
        assert!(!cloud.statuses_for("J2").contains(&CloudJobStatus::Error));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn notification_dispatches_queued_job() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = PrinterManager::start(&config(), cloud.clone(), spooler.clone(), Some(rx))
            .await
            .unwrap();
        let printer_id = cloud.registered()[0].id.clone();

        cloud.queue_job("J1", &printer_id, BTreeMap::new());
        tx.send(PushEvent::Notification {
            printer_id: printer_id.clone(),
        })
        .unwrap();
        // A duplicate delivery of the same notification.
        tx.send(PushEvent::Notification { printer_id }).unwrap();

        wait_until(|| cloud.statuses_for("J1").contains(&CloudJobStatus::Done)).await;
        assert_eq!(spooler.submissions().len(), 1);
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_triggers_catch_up_for_every_printer() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![
            local_printer("printer-A"),
            local_printer("printer-B"),
        ]));
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ConnectorConfig {
            cups_printer_poll_interval_secs: 3_600,
            ..config()
        };

        let manager = PrinterManager::start(&config, cloud.clone(), spooler.clone(), Some(rx))
            .await
            .unwrap();
        for (n, printer) in cloud.registered().iter().enumerate() {
            cloud.queue_job(&format!("J{n}"), &printer.id, BTreeMap::new());
        }

        tx.send(PushEvent::Connected { reconnect: true }).unwrap();
        wait_until(|| spooler.submissions().len() == 2).await;

        let printers: Vec<_> = spooler.submissions().into_iter().map(|s| s.printer).collect();
        assert!(printers.contains(&"printer-A".to_string()));
        assert!(printers.contains(&"printer-B".to_string()));
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removed_printer_is_deleted_and_later_jobs_fail() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = PrinterManager::start(&config(), cloud.clone(), spooler.clone(), Some(rx))
            .await
            .unwrap();
        let printer_id = cloud.registered()[0].id.clone();

        spooler.set_printers(Vec::new());
        wait_until(|| cloud.registered().is_empty()).await;

        cloud.queue_job("J9", &printer_id, BTreeMap::new());
        tx.send(PushEvent::Notification { printer_id }).unwrap();
        wait_until(|| !cloud.statuses_for("J9").is_empty()).await;

        assert_eq!(cloud.statuses_for("J9"), vec![CloudJobStatus::Error]);
        assert!(cloud.download_log().is_empty());
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_fatal_is_surfaced() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut manager = PrinterManager::start(&config(), cloud, spooler, Some(rx))
            .await
            .unwrap();
        let mut fatal = manager.take_fatal_receiver().unwrap();
        assert!(manager.take_fatal_receiver().is_none());

        tx.send(PushEvent::Fatal {
            detail: "invalid_grant".into(),
        })
        .unwrap();
        let err = fatal.recv().await.unwrap();
        assert!(err.is_fatal());
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_stuck_job_failed_and_unreported() {
        let cloud = Arc::new(FakeCloud::default());
        let spooler = Arc::new(FakeSpooler::with_printers(vec![local_printer("printer-A")]));
        spooler.hold_jobs.store(true, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = PrinterManager::start(&config(), cloud.clone(), spooler.clone(), Some(rx))
            .await
            .unwrap();
        let reader = manager.snapshot_reader();
        let printer_id = cloud.registered()[0].id.clone();
        cloud.queue_job("J1", &printer_id, BTreeMap::new());
        tx.send(PushEvent::Notification { printer_id }).unwrap();
        wait_until(|| !spooler.submissions().is_empty()).await;

        manager.stop().await;

        let snapshot = reader.snapshot();
        let job = snapshot.jobs.iter().find(|j| j.id.0 == "J1").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert!(!cloud.statuses_for("J1").contains(&CloudJobStatus::Error));
        assert!(!cloud.statuses_for("J1").contains(&CloudJobStatus::Done));
    }
}
