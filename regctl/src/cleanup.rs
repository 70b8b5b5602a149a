//! Orphan registrant sweep.
//!
//! Signing up is two steps: the registrant row commits first and the user that links to it
//! commits second. When the second step never happens the registrant is left behind with
//! nothing pointing at it. [`CleanupSweep`] periodically deletes those rows and reconciles the
//! addresses they held.
//!
//! A registrant is reclaimed when all of the following hold at the time of the cycle:
//!
//! - it was created inside the reclaim window, `[now - reclaim_horizon, now - grace_period]`
//!   (both bounds inclusive, no lower bound when the horizon is disabled)
//! - no user links to it
//! - no registration document names it as `document_owner`
//!
//! Each cycle runs in a single transaction. Candidate rows are taken with
//! `FOR UPDATE SKIP LOCKED`, so a registrant that a concurrent signup is linking right now is
//! left for a later cycle instead of being deleted under it.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{config::CleanupConfig, db::errors::Result, metrics, registry::AddressRegistry, types::RegistrantKind};

/// Creation-time bounds of the registrants a cycle may reclaim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepWindow {
    /// Oldest reclaimable creation time, `None` when the horizon is disabled
    pub oldest: Option<DateTime<Utc>>,
    /// Newest reclaimable creation time
    pub newest: DateTime<Utc>,
}

impl SweepWindow {
    pub fn at(now: DateTime<Utc>, grace_period: Duration, reclaim_horizon: Option<Duration>) -> anyhow::Result<Self> {
        let grace = chrono::Duration::from_std(grace_period).context("grace period out of range")?;
        let oldest = reclaim_horizon
            .map(|h| chrono::Duration::from_std(h).map(|h| now - h))
            .transpose()
            .context("reclaim horizon out of range")?;
        Ok(Self {
            oldest,
            newest: now - grace,
        })
    }

    pub fn contains(&self, created_at: DateTime<Utc>) -> bool {
        created_at <= self.newest && self.oldest.is_none_or(|oldest| created_at >= oldest)
    }
}

/// What one completed cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub persons_deleted: u64,
    pub entities_deleted: u64,
    /// Owner rows removed while reconciling the addresses of deleted registrants
    pub owners_removed: u64,
    /// Distinct addresses reconciled
    pub addresses_checked: u64,
}

impl SweepReport {
    pub fn registrants_deleted(&self) -> u64 {
        self.persons_deleted + self.entities_deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(SweepReport),
    /// A previous cycle was still running, nothing was done
    Skipped,
}

/// Periodic reclamation of registrants that were never linked to a user or a document.
///
/// Clones share the overlap guard, so at most one cycle runs at a time per sweep instance.
#[derive(Clone)]
pub struct CleanupSweep {
    pool: PgPool,
    config: CleanupConfig,
    in_flight: Arc<Mutex<()>>,
}

impl CleanupSweep {
    pub fn new(pool: PgPool, config: CleanupConfig) -> Self {
        Self {
            pool,
            config,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    pub fn window(&self, now: DateTime<Utc>) -> anyhow::Result<SweepWindow> {
        SweepWindow::at(now, self.config.grace_period, self.config.reclaim_horizon)
    }

    /// Run one cycle against the database clock.
    ///
    /// `created_at` is stamped by the database, so the window is measured with `NOW()` from the
    /// cycle's own transaction rather than with the local clock.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        self.guarded(None).await
    }

    /// Run one cycle as if the current time were `now`.
    ///
    /// Returns [`CycleOutcome::Skipped`] without touching the database when another cycle on
    /// this sweep is still in flight. On error the whole cycle has been rolled back.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        self.guarded(Some(now)).await
    }

    async fn guarded(&self, now: Option<DateTime<Utc>>) -> Result<CycleOutcome> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Previous cleanup cycle still running, skipping");
            metrics::record_cycle("skipped", None);
            return Ok(CycleOutcome::Skipped);
        };

        let started = Instant::now();
        match self.sweep(now).await {
            Ok(report) => {
                metrics::record_cycle("completed", Some(started.elapsed().as_secs_f64()));
                metrics::record_registrants_reclaimed(RegistrantKind::NaturalPerson, report.persons_deleted);
                metrics::record_registrants_reclaimed(RegistrantKind::LegalEntity, report.entities_deleted);
                metrics::record_owners_removed(report.owners_removed);
                Ok(CycleOutcome::Completed(report))
            }
            Err(e) => {
                metrics::record_cycle("failed", None);
                Err(e)
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn sweep(&self, now: Option<DateTime<Utc>>) -> Result<SweepReport> {
        let mut tx = self.pool.begin().await?;

        let now = match now {
            Some(now) => now,
            None => sqlx::query_scalar("SELECT NOW()").fetch_one(&mut *tx).await?,
        };
        let window = self.window(now)?;
        debug!(newest = %window.newest, "Sweep window");

        let mut report = SweepReport::default();
        let mut touched = BTreeSet::new();

        for kind in RegistrantKind::ALL {
            let addresses = reclaim_unlinked(&mut tx, kind, &window).await?;
            let deleted = addresses.len() as u64;
            match kind {
                RegistrantKind::NaturalPerson => report.persons_deleted = deleted,
                RegistrantKind::LegalEntity => report.entities_deleted = deleted,
            }
            touched.extend(addresses);
        }

        let mut registry = AddressRegistry::new(&mut tx);
        registry.lock_addresses(touched.iter().map(String::as_str)).await?;
        for address in &touched {
            if registry.reconcile_address(address).await? {
                report.owners_removed += 1;
            }
        }
        report.addresses_checked = touched.len() as u64;

        tx.commit().await?;

        if report.registrants_deleted() > 0 {
            info!(
                persons_deleted = report.persons_deleted,
                entities_deleted = report.entities_deleted,
                owners_removed = report.owners_removed,
                "Reclaimed orphaned registrants"
            );
        } else {
            debug!("No orphaned registrants in window");
        }
        Ok(report)
    }

    /// Run cycles on the configured interval until `shutdown` is cancelled.
    ///
    /// A failed cycle is logged and retried on the next tick; it never stops the loop.
    pub async fn run_daemon(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!(
            interval = %humantime::format_duration(self.config.interval),
            grace_period = %humantime::format_duration(self.config.grace_period),
            reclaim_horizon = %self
                .config
                .reclaim_horizon
                .map(|h| humantime::format_duration(h).to_string())
                .unwrap_or_else(|| "none".to_string()),
            "Starting cleanup sweep"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Cleanup sweep shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Cleanup cycle failed, will retry on next tick");
                    }
                }
            }
        }

        Ok(())
    }
}

/// Delete the registrants of one kind in `window` that nothing links to, returning the
/// address of every deleted row.
#[instrument(skip(conn, kind, window), fields(kind = kind.as_str(), candidates = tracing::field::Empty), err)]
async fn reclaim_unlinked(conn: &mut PgConnection, kind: RegistrantKind, window: &SweepWindow) -> Result<Vec<String>> {
    let table = kind.table();
    let key = kind.key_column();

    let candidates: Vec<String> = sqlx::query_scalar(&format!(
        r#"
        SELECT {key} FROM {table}
        WHERE ($1::timestamptz IS NULL OR created_at >= $1) AND created_at <= $2
        ORDER BY {key}
        FOR UPDATE SKIP LOCKED
        "#
    ))
    .bind(window.oldest)
    .bind(window.newest)
    .fetch_all(&mut *conn)
    .await?;

    tracing::Span::current().record("candidates", candidates.len());
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let with_user: Vec<String> = sqlx::query_scalar(&format!("SELECT DISTINCT {key} FROM users WHERE {key} = ANY($1)"))
        .bind(&candidates)
        .fetch_all(&mut *conn)
        .await?;

    let with_document: Vec<String> =
        sqlx::query_scalar("SELECT DISTINCT document_owner FROM registration_docs WHERE document_owner = ANY($1)")
            .bind(&candidates)
            .fetch_all(&mut *conn)
            .await?;

    let linked: HashSet<String> = with_user.into_iter().chain(with_document).collect();
    let orphans: Vec<String> = candidates.into_iter().filter(|c| !linked.contains(c)).collect();
    if orphans.is_empty() {
        return Ok(Vec::new());
    }

    let addresses = sqlx::query_scalar(&format!("DELETE FROM {table} WHERE {key} = ANY($1) RETURNING address"))
        .bind(&orphans)
        .fetch_all(&mut *conn)
        .await?;

    Ok(addresses)
}
