/// Orchestrator module - coordinates all components
///
/// The orchestrator is the core coordinator that:
/// - Wires configuration, storage, the scheduler, alerting and notification
/// - Keeps the scheduler in step with the targets in the database
/// - Records every check and feeds it to the alert engine
///
/// ## Target management
/// The `targets` submodule validates and persists target changes. The running
/// service picks them up on its next reload.
pub mod targets;

pub use targets::{NewTarget, TargetChanges, TargetManager};

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::alerting::AlertEngine;
use crate::capture::{CaptureBackend, NoopBackend, TcpdumpBackend};
use crate::classify::Classifier;
use crate::config::Config;
use crate::database::{LibsqlStore, MemoryStore, ResultSink, TargetStore, open_pool};
use crate::models::{Target, TargetId};
use crate::monitoring::{CheckExecutor, CheckPipeline, CheckReport, MonitoringScheduler, ReportHandler};
use crate::notify::{DisabledNotifier, Notifier, WebhookNotifier};

/// Persists each report, then hands its result to the alert engine
struct ResultRecorder {
    targets: Arc<dyn TargetStore>,
    results: Arc<dyn ResultSink>,
    alerts: Arc<AlertEngine>,
}

#[async_trait]
impl ReportHandler for ResultRecorder {
    async fn handle(&self, target: &Target, report: &CheckReport) -> Result<()> {
        // The target may have been removed while its last check ran.
        if self.targets.get_target(target.id).await?.is_none() {
            debug!(target_id = %target.id, url = %target.url, "Target removed, discarding check");
            self.alerts.forget(target.id);
            return Ok(());
        }

        let recorded = self
            .results
            .record_check(&report.result, &report.subsequent_requests)
            .await
            .with_context(|| format!("Failed to record check for {}", target.url));

        self.alerts.process(target, &report.result).await;

        info!(
            target_id = %target.id,
            url = %target.url,
            status = %report.result.status,
            status_code = ?report.result.status_code,
            response_time_ms = report.result.response_time_ms,
            subsequent_requests = report.subsequent_requests.len(),
            "Check recorded"
        );
        recorded
    }
}

/// Build the check pipeline described by `config`
pub fn build_pipeline(config: &Config) -> Result<CheckPipeline> {
    let executor = CheckExecutor::new(config.check.timeout_seconds, config.check.max_body_bytes)?;
    let capture: Arc<dyn CaptureBackend> = if config.capture.enabled {
        Arc::new(TcpdumpBackend::new(
            config.capture.tool.clone(),
            config.capture.interface.clone(),
            config.capture.filter.clone(),
            config.capture.max_packets,
        ))
    } else {
        Arc::new(NoopBackend)
    };
    info!(backend = capture.name(), "Traffic capture configured");

    Ok(CheckPipeline::new(
        executor,
        capture,
        Classifier::new(Duration::from_millis(config.check.dns_timeout_ms)),
        config.capture_settings(),
        config.capture.document_fallback,
    ))
}

/// Webhook notifier when a URL is configured, otherwise one that drops everything
pub fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match &config.alerts.webhook_url {
        Some(url) => {
            info!("Webhook notifications enabled");
            Ok(Arc::new(WebhookNotifier::new(url.clone())?))
        }
        None => {
            info!("No webhook configured, notifications disabled");
            Ok(Arc::new(DisabledNotifier))
        }
    }
}

/// Main orchestrator for the pagewatch service
pub struct Orchestrator {
    config: Arc<Config>,
    targets: Arc<dyn TargetStore>,
    alerts: Arc<AlertEngine>,
    scheduler: MonitoringScheduler,
    /// Last definition handed to the scheduler, per target
    known: HashMap<TargetId, Target>,
}

impl Orchestrator {
    /// Open the configured database and assemble every component
    pub async fn start(config: Config) -> Result<Self> {
        info!(path = %config.database.path.display(), "Opening database...");
        let pool = open_pool(&config.database.path).await?;
        let store = Arc::new(LibsqlStore::new_from_pool(pool));

        let pipeline = Arc::new(build_pipeline(&config)?);
        let notifier = build_notifier(&config)?;
        Ok(Self::new(config, store.clone(), store, pipeline, notifier))
    }

    /// Orchestrator over an in-memory store with notifications off, for
    /// checks that must leave no trace
    pub fn detached(config: Config) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let pipeline = Arc::new(build_pipeline(&config)?);
        Ok(Self::new(config, store.clone(), store, pipeline, Arc::new(DisabledNotifier)))
    }

    pub fn new(
        config: Config,
        targets: Arc<dyn TargetStore>,
        results: Arc<dyn ResultSink>,
        pipeline: Arc<CheckPipeline>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let alerts = Arc::new(AlertEngine::new(config.alert_policy(), notifier, Arc::clone(&targets)));
        let handler = Arc::new(ResultRecorder { targets: Arc::clone(&targets), results, alerts: Arc::clone(&alerts) });
        let scheduler = MonitoringScheduler::new(pipeline, handler, config.scheduler.min_check_interval_seconds);

        Self { config: Arc::new(config), targets, alerts, scheduler, known: HashMap::new() }
    }

    pub fn targets(&self) -> TargetManager {
        TargetManager::new(Arc::clone(&self.targets), self.config.scheduler.min_check_interval_seconds)
    }

    /// Run until Ctrl-C
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Schedule active targets and keep reloading them until `shutdown` resolves
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting pagewatch orchestrator...");
        self.reconcile().await?;
        info!(targets = self.known.len(), "Orchestrator started successfully - monitoring targets");

        let reload_interval = Duration::from_secs(self.config.scheduler.reload_interval_seconds.max(1));
        let mut next_reload = tokio::time::Instant::now() + reload_interval;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }

                // Periodic task: pick up added, changed and removed targets
                _ = tokio::time::sleep_until(next_reload) => {
                    debug!("Checking for new or updated targets...");
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "Failed to reload targets");
                    }
                    next_reload = tokio::time::Instant::now() + reload_interval;
                }
            }
        }

        self.scheduler.shutdown(Duration::from_secs(self.config.scheduler.shutdown_grace_seconds)).await;
        self.known.clear();
        info!("Orchestrator stopped");
        Ok(())
    }

    /// Bring the scheduler in line with the active targets in the store
    pub async fn reconcile(&mut self) -> Result<()> {
        let current: HashMap<TargetId, Target> = self
            .targets
            .list_active_targets()
            .await?
            .into_iter()
            .filter(Target::is_recurring)
            .map(|target| (target.id, target))
            .collect();

        let removed: Vec<TargetId> = self.known.keys().filter(|id| !current.contains_key(id)).copied().collect();
        for id in removed {
            self.scheduler.unregister(id);
            self.alerts.forget(id);
            self.known.remove(&id);
        }

        for (id, target) in current {
            if self.known.get(&id) == Some(&target) && self.scheduler.is_scheduled(id) {
                continue;
            }
            match self.scheduler.update(target.clone()) {
                Ok(()) => {
                    self.known.insert(id, target);
                }
                Err(e) => warn!(target_id = %id, url = %target.url, error = %e, "Failed to schedule target"),
            }
        }
        Ok(())
    }

    /// Check `url` once, outside the schedule. Nothing is persisted or alerted.
    pub async fn check_once(&self, url: &str) -> Result<CheckReport> {
        let target = Target::one_time(url)?;
        Ok(self.scheduler.run_once(&target).await)
    }

    /// Return every target to healthy
    pub async fn reset_alerts(&self) -> Result<u64> {
        self.alerts.reset_all().await
    }

    pub fn scheduled(&self) -> Vec<TargetId> {
        self.scheduler.scheduled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::AlertEvent;
    use crate::error::ValidationError;
    use crate::models::AlertSettings;
    use crate::monitoring::checker::{Checker, ProbeError, ProbeResponse};
    use crate::monitoring::pipeline::tests::{PageChecker, pipeline};
    use crate::notify::{Notification, NotifyError};
    use tokio::sync::mpsc;

    struct DownChecker;

    #[async_trait]
    impl Checker for DownChecker {
        async fn probe(&self, _target: &str) -> Result<ProbeResponse, ProbeError> {
            Err(ProbeError::Connect("refused".into()))
        }
    }

    /// Fails after holding the check open for a while
    struct SlowDownChecker;

    #[async_trait]
    impl Checker for SlowDownChecker {
        async fn probe(&self, _target: &str) -> Result<ProbeResponse, ProbeError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(ProbeError::Connect("refused".into()))
        }
    }

    struct ChannelNotifier(mpsc::UnboundedSender<Notification>);

    #[async_trait]
    impl Notifier for ChannelNotifier {
        async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
            let _ = self.0.send(notification);
            Ok(())
        }
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        checker: Arc<dyn Checker>,
    ) -> (Orchestrator, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            Config::default(),
            store.clone(),
            store,
            Arc::new(pipeline(checker, Arc::new(NoopBackend), false)),
            Arc::new(ChannelNotifier(tx)),
        );
        (orchestrator, rx)
    }

    async fn add(store: &MemoryStore, url: &str, alerts: bool) -> Target {
        let target = Target::recurring(url, None, 10, 10)
            .unwrap()
            .with_alerts(AlertSettings { enabled: alerts, notify_on_recovery: true });
        store.save_target(&target).await.unwrap();
        target
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_follows_the_store() {
        let store = Arc::new(MemoryStore::new());
        let (mut orchestrator, _rx) = orchestrator(store.clone(), Arc::new(PageChecker(None)));
        let first = add(&store, "https://one.example", false).await;
        let mut inactive = add(&store, "https://two.example", false).await;
        inactive.active = false;
        store.save_target(&inactive).await.unwrap();

        orchestrator.reconcile().await.unwrap();
        assert_eq!(orchestrator.scheduled(), vec![first.id]);

        store.delete_target(first.id).await.unwrap();
        inactive.active = true;
        store.save_target(&inactive).await.unwrap();
        orchestrator.reconcile().await.unwrap();

        assert_eq!(orchestrator.scheduled(), vec![inactive.id]);
        orchestrator.scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_checks_are_recorded() {
        let store = Arc::new(MemoryStore::new());
        let (mut orchestrator, _rx) = orchestrator(store.clone(), Arc::new(PageChecker(None)));
        let target = add(&store, "https://one.example", false).await;

        orchestrator.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        let results = store.recent_results(target.id, 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_up()));
        orchestrator.scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_reach_the_notifier() {
        let store = Arc::new(MemoryStore::new());
        let (mut orchestrator, mut rx) = orchestrator(store.clone(), Arc::new(DownChecker));
        let target = add(&store, "https://down.example", true).await;

        orchestrator.reconcile().await.unwrap();
        let notification = rx.recv().await.unwrap();

        assert_eq!(notification.event, AlertEvent::Down);
        assert_eq!(notification.target_url, target.url);
        assert_eq!(notification.details.consecutive_failures, 2);
        assert_eq!(store.load_alert_state(target.id).await.unwrap().map(|s| s.currently_down), Some(true));

        assert_eq!(orchestrator.reset_alerts().await.unwrap(), 1);
        assert_eq!(store.load_alert_state(target.id).await.unwrap().map(|s| s.currently_down), Some(false));
        orchestrator.scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_finishing_after_removal_leaves_nothing_behind() {
        let store = Arc::new(MemoryStore::new());
        let (mut orchestrator, _rx) = orchestrator(store.clone(), Arc::new(SlowDownChecker));
        let target = add(&store, "https://slow.example", true).await;

        orchestrator.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        store.delete_target(target.id).await.unwrap();
        orchestrator.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(orchestrator.scheduled().is_empty());
        assert_eq!(orchestrator.alerts.state(target.id), None);
        assert!(store.recent_results(target.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_once_is_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let (orchestrator, _rx) = orchestrator(store.clone(), Arc::new(PageChecker(None)));

        let report = orchestrator.check_once("https://once.example").await.unwrap();

        assert!(report.result.is_up());
        assert!(store.list_targets().await.unwrap().is_empty());
        assert!(store.recent_results(report.result.target_id, 10).await.unwrap().is_empty());
        assert!(orchestrator.scheduled().is_empty());

        let err = orchestrator.check_once("once.example").await.unwrap_err();
        assert_eq!(err.downcast_ref::<ValidationError>(), Some(&ValidationError::MissingScheme));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_stops_on_signal() {
        let store = Arc::new(MemoryStore::new());
        let (mut orchestrator, _rx) = orchestrator(store.clone(), Arc::new(PageChecker(None)));
        add(&store, "https://one.example", false).await;

        orchestrator.run_until(tokio::time::sleep(Duration::from_secs(45))).await.unwrap();

        assert!(orchestrator.scheduled().is_empty());
        assert!(orchestrator.targets().add(NewTarget {
            url: "https://one.example".into(),
            name: None,
            interval_seconds: 60,
            alerts: AlertSettings::default(),
        })
        .await
        .is_err());
    }
}
