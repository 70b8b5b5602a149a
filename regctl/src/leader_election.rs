use crate::config;
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Session advisory lock held by the replica that runs the cleanup sweep ("REGCSWEP")
pub const SWEEP_LEADER_LOCK_ID: i64 = 0x5245_4743_5357_4550;

/// How often a follower retries the lock and a leader checks its lock connection
pub const LEADER_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task for leader election
///
/// Only the leader runs the cleanup sweep, so several replicas can share a database without
/// sweeping the same rows at once. PostgreSQL advisory locks are session-based, so the leader
/// keeps a dedicated connection for as long as it holds the lock. On shutdown a leader runs
/// `on_lose_leadership` and releases the lock before returning.
#[instrument(skip_all)]
#[allow(clippy::too_many_arguments)]
pub async fn leader_election_task<F1, F2, Fut1, Fut2>(
    pool: PgPool,
    config: config::Config,
    is_leader: Arc<AtomicBool>,
    lock_id: i64,
    check_interval: Duration,
    shutdown: CancellationToken,
    on_gain_leadership: F1,
    on_lose_leadership: F2,
) where
    F1: Fn(PgPool, config::Config) -> Fut1 + Send + 'static,
    F2: Fn(PgPool, config::Config) -> Fut2 + Send + 'static,
    Fut1: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    Fut2: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
{
    let mut interval = tokio::time::interval(check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut leader_conn: Option<sqlx::pool::PoolConnection<sqlx::Postgres>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(mut conn) = leader_conn.take() {
                    is_leader.store(false, Ordering::Relaxed);
                    if let Err(e) = on_lose_leadership(pool.clone(), config.clone()).await {
                        tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
                    }
                    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)").bind(lock_id).execute(&mut *conn).await {
                        tracing::warn!("Failed to release leader lock: {}", e);
                    }
                    info!("Released leadership on shutdown");
                }
                break;
            }
            _ = interval.tick() => {}
        }

        if !is_leader.load(Ordering::Relaxed) {
            let mut conn = match pool.acquire().await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::error!("Failed to acquire connection for leader election: {}", e);
                    continue;
                }
            };

            match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                .bind(lock_id)
                .fetch_one(&mut *conn)
                .await
            {
                Ok(true) => {
                    info!("Gained leadership");
                    is_leader.store(true, Ordering::Relaxed);
                    leader_conn = Some(conn);

                    if let Err(e) = on_gain_leadership(pool.clone(), config.clone()).await {
                        tracing::error!("Failed to execute on_gain_leadership callback: {}", e);
                    }
                }
                Ok(false) => debug!("Following - will retry"),
                Err(e) => tracing::error!("Failed to check leader lock: {}", e),
            }
        } else if let Some(conn) = leader_conn.as_mut() {
            // The lock lives exactly as long as this connection
            match sqlx::query("SELECT 1").execute(&mut **conn).await {
                Ok(_) => debug!("Leadership renewed (connection alive)"),
                Err(e) => {
                    tracing::warn!("Lost leadership (connection died): {}", e);
                    is_leader.store(false, Ordering::Relaxed);
                    leader_conn = None;

                    if let Err(e) = on_lose_leadership(pool.clone(), config.clone()).await {
                        tracing::error!("Failed to execute on_lose_leadership callback: {}", e);
                    }
                }
            }
        } else {
            tracing::error!("Inconsistent state: is_leader=true but no connection");
            is_leader.store(false, Ordering::Relaxed);
        }
    }
}
