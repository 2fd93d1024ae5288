//! Reconciliation scheduling
//!
//! One [`Reconciler`] owns everything a reconciliation touches: the policy
//! source, the applier, the resolver handle and the [`SnapshotStore`]. The
//! [`Scheduler`] runs it on a single worker task, so two reconciliations of the
//! same firewall can never overlap.
//!
//! The timer task only wakes the worker; it never does I/O itself. Wakeups go
//! through a [`Notify`], so any number of triggers arriving while a
//! reconciliation runs collapse into one follow-up run.

use crate::audit::{self, AuditLog};
use crate::core::apply::{ApplyOutcome, RulesetApplier};
use crate::core::detector::detect;
use crate::core::error::{Error, Result};
use crate::core::policy::ClusterState;
use crate::core::render::Ruleset;
use crate::core::resolver::SetResolver;
use crate::core::snapshot::SnapshotStore;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Supplies the cluster objects a reconciliation works from
pub trait PolicySource: Send + Sync {
    fn fetch(&self) -> impl Future<Output = Result<ClusterState>> + Send;
}

impl<T: PolicySource> PolicySource for Arc<T> {
    fn fetch(&self) -> impl Future<Output = Result<ClusterState>> + Send {
        (**self).fetch()
    }
}

/// Reads a [`ClusterState`] JSON document on every fetch
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PolicySource for FileSource {
    async fn fetch(&self) -> Result<ClusterState> {
        let json = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Result of one reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing drifted; nothing was compiled
    UpToDate,
    /// A new ruleset was loaded
    Applied { reason: String, checksum: String },
    /// The rebuilt ruleset matched the loaded one
    Unchanged { reason: String, checksum: String },
    /// Snapshots were left untouched; the next trigger retries
    Failed { error: String },
}

#[derive(Debug, Clone)]
pub struct LastReconcile {
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: ReconcileOutcome,
}

/// Published on the scheduler's watch channel
#[derive(Debug, Clone, Default)]
pub struct ReconcileStatus {
    pub iteration: u64,
    pub running: bool,
    pub last: Option<LastReconcile>,
}

/// Detect → build → apply → record, for one firewall
pub struct Reconciler<S, A, R> {
    source: S,
    applier: A,
    resolver: R,
    store: SnapshotStore,
    apply_timeout: Duration,
    snapshot_path: Option<PathBuf>,
    audit: Option<AuditLog>,
}

impl<S, A, R> Reconciler<S, A, R>
where
    S: PolicySource,
    A: RulesetApplier,
    R: SetResolver + Send + Sync,
{
    pub fn new(source: S, applier: A, resolver: R, store: SnapshotStore) -> Self {
        Self {
            source,
            applier,
            resolver,
            store,
            apply_timeout: Duration::from_secs(20),
            snapshot_path: None,
            audit: None,
        }
    }

    #[must_use]
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    /// Persists the snapshot store to `path` after every successful apply
    #[must_use]
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Runs one reconciliation. Errors are reported, never propagated.
    pub async fn reconcile_once(&mut self) -> ReconcileOutcome {
        match self.try_reconcile().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Reconciliation failed: {e}");
                ReconcileOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn try_reconcile(&mut self) -> Result<ReconcileOutcome> {
        let state = self.source.fetch().await?;

        let Some(drift) = detect(&state.policies, &self.store, &self.resolver) else {
            debug!("No drift across {} policies", state.policies.len());
            return Ok(ReconcileOutcome::UpToDate);
        };
        let reason = drift.to_string();
        info!("Reconciling: {reason}");

        let output = Ruleset::build(
            &state.policies,
            &state.services,
            &state.firewall,
            &self.resolver,
        )?;
        for policy in &output.skipped {
            audit::log_rejected(self.audit.as_ref(), &policy.key().to_string()).await;
        }

        let text = output.ruleset.to_nft_text();
        let rule_count = output.ruleset.ingress.len() + output.ruleset.egress.len();
        let checksum = crate::core::apply::checksum(&text);

        let applied = match tokio::time::timeout(self.apply_timeout, self.applier.apply(&text)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ApplyTimeout(self.apply_timeout)),
        };
        let outcome = match applied {
            Ok(outcome) => outcome,
            Err(e) => {
                audit::log_apply(
                    self.audit.as_ref(),
                    &reason,
                    rule_count,
                    &checksum,
                    Some(e.to_string()),
                )
                .await;
                return Err(e);
            }
        };

        let outcome = match outcome {
            ApplyOutcome::Applied { checksum } => {
                audit::log_apply(self.audit.as_ref(), &reason, rule_count, &checksum, None).await;
                ReconcileOutcome::Applied { reason, checksum }
            }
            ApplyOutcome::Unchanged { checksum } => {
                audit::log_unchanged(self.audit.as_ref(), &checksum).await;
                ReconcileOutcome::Unchanged { reason, checksum }
            }
        };

        // Only now does the loaded ruleset reflect these specs
        for policy in output.applied {
            self.store.record(policy.key(), policy.spec);
        }
        // Rejected policies are recorded as seen, with the sets their
        // selectors resolved to, so they do not force a rebuild on every
        // trigger; editing them still shows up as drift.
        for policy in output.skipped {
            self.store.record(policy.key(), policy.spec);
        }
        self.persist().await;

        Ok(outcome)
    }

    async fn persist(&self) {
        let Some(path) = &self.snapshot_path else {
            return;
        };
        let result = self.store.save(path).await;
        if let Err(e) = &result {
            warn!("Failed to persist snapshots to {}: {e}", path.display());
        }
        audit::log_persist(
            self.audit.as_ref(),
            self.store.len(),
            result.err().map(|e| e.to_string()),
        )
        .await;
    }
}

/// Wakes the scheduler's worker
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    notify: Arc<Notify>,
}

impl SchedulerHandle {
    /// Requests a reconciliation. Requests made while one is running
    /// coalesce into a single follow-up run.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }
}

/// Runs a [`Reconciler`] on a timer and on demand
pub struct Scheduler {
    notify: Arc<Notify>,
    status: watch::Receiver<ReconcileStatus>,
    worker: tokio::task::JoinHandle<()>,
    ticker: tokio::task::JoinHandle<()>,
}

impl Scheduler {
    /// Spawns the worker and the timer. The first reconciliation starts
    /// immediately.
    pub fn start<S, A, R>(reconciler: Reconciler<S, A, R>, interval: Duration) -> Self
    where
        S: PolicySource + 'static,
        A: RulesetApplier + 'static,
        R: SetResolver + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let (status_tx, status_rx) = watch::channel(ReconcileStatus::default());

        let worker = tokio::spawn(run_worker(reconciler, Arc::clone(&notify), status_tx));
        let ticker = tokio::spawn(run_ticker(interval, Arc::clone(&notify)));

        Self {
            notify,
            status: status_rx,
            worker,
            ticker,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            notify: Arc::clone(&self.notify),
        }
    }

    pub fn status(&self) -> watch::Receiver<ReconcileStatus> {
        self.status.clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.ticker.abort();
        self.worker.abort();
    }
}

async fn run_ticker(period: Duration, notify: Arc<Notify>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        notify.notify_one();
    }
}

async fn run_worker<S, A, R>(
    mut reconciler: Reconciler<S, A, R>,
    notify: Arc<Notify>,
    status_tx: watch::Sender<ReconcileStatus>,
) where
    S: PolicySource,
    A: RulesetApplier,
    R: SetResolver + Send + Sync,
{
    let mut iteration = 0;
    loop {
        notify.notified().await;
        iteration += 1;

        let started_at = Utc::now();
        let start = Instant::now();
        status_tx.send_modify(|status| {
            status.iteration = iteration;
            status.running = true;
        });

        let outcome = reconciler.reconcile_once().await;
        let elapsed = start.elapsed();
        debug!("Reconciliation {iteration} finished in {elapsed:?}: {outcome:?}");

        status_tx.send_modify(|status| {
            status.running = false;
            status.last = Some(LastReconcile {
                iteration,
                started_at,
                elapsed,
                outcome,
            });
        });
    }
}
