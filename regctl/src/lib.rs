//! # regctl: Address registry for vehicle registration records
//!
//! `regctl` keeps the registration records of a vehicle-registration authority: natural persons
//! (keyed by passport), legal entities (keyed by tax number), registration documents, and the
//! users that sign in for a registrant.
//!
//! ## Overview
//!
//! Most of the crate is conventional repository code over PostgreSQL. The part with real
//! invariants is the **address registry**: an `owners` row exists for an address exactly when
//! some natural person, legal entity or registration document references it. No caller creates
//! or deletes owners directly. Every repository write that adds, moves or removes an address
//! calls into [`registry::AddressRegistry`] inside the same transaction, so the owner set is
//! correct whenever a transaction commits.
//!
//! The second moving part is the **cleanup sweep** ([`cleanup::CleanupSweep`]). Account signup
//! ([`signup`]) commits the registrant before it creates the user. When the second step never
//! happens the registrant is left unlinked, and the sweep deletes such rows once they are old
//! enough, then reconciles the addresses they held.
//!
//! ### Core Components
//!
//! - [`db`]: repositories ([`db::handlers`]), models and database errors
//! - [`registry`]: owner bookkeeping and per-address locking
//! - [`cleanup`]: the periodic orphan sweep
//! - [`signup`]: the two-step account registration flow
//! - [`config`]: YAML + environment configuration
//! - [`telemetry`]: logging to stderr and optional OTLP trace export
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use regctl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = regctl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     regctl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.run(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await
//! }
//! ```
//!
//! ## Database Setup
//!
//! Migrations are embedded and run by [`Application::new`]. To run them by hand:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! regctl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
pub mod cleanup;
pub mod config;
pub mod db;
pub mod errors;
mod leader_election;
pub mod metrics;
pub mod registry;
pub mod signup;
pub mod telemetry;
pub mod types;
pub mod validation;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use std::sync::Arc;

use cleanup::CleanupSweep;
pub use config::Config;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use types::{PassportData, RegistrationNumber, TaxNumber, UserId};

/// Get the regctl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Connect with the configured pool settings and bring the schema up to date
async fn setup_database(config: &Config) -> anyhow::Result<PgPool> {
    info!("Connecting to database");
    let pool = config.database.pool.pool_options().connect(&config.database.url).await?;
    migrator().run(&pool).await?;
    Ok(pool)
}

/// Background tasks that run alongside the library API: the cleanup sweep, directly or under
/// leader election.
///
/// # Graceful Shutdown
///
/// [`shutdown`](BackgroundServices::shutdown) cancels the shared token and waits for every
/// task. Dropping the struct cancels the token through `drop_guard` without waiting.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();

        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn spawn_sweep(sweep: CleanupSweep, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = sweep.run_daemon(shutdown).await {
            tracing::error!("Cleanup sweep stopped: {}", e);
        }
    })
}

/// Start the cleanup sweep, under leader election when it is enabled
async fn setup_background_services(pool: PgPool, config: Config, shutdown_token: CancellationToken) -> anyhow::Result<BackgroundServices> {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if !config.cleanup.enabled {
        info!("Cleanup sweep disabled by configuration");
    } else if !config.leader_election.enabled {
        info!("Launching without leader election: running the cleanup sweep on this instance");
        let sweep = CleanupSweep::new(pool.clone(), config.cleanup.clone());
        background_tasks.push(spawn_sweep(sweep, shutdown_token.clone()));
    } else {
        info!("Starting leader election - the cleanup sweep runs on the leader only");

        let is_leader_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        // Sweep task of the current leadership session, cancelled and awaited on loss
        let session: Arc<tokio::sync::Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>> =
            Arc::new(tokio::sync::Mutex::new(None));
        let session_gain = session.clone();
        let session_lose = session.clone();
        let parent_shutdown = shutdown_token.clone();

        let handle = tokio::spawn(leader_election::leader_election_task(
            pool,
            config,
            is_leader_flag,
            leader_election::SWEEP_LEADER_LOCK_ID,
            leader_election::LEADER_CHECK_INTERVAL,
            shutdown_token.clone(),
            move |pool, config| {
                let session = session_gain.clone();
                let session_token = parent_shutdown.child_token();
                async move {
                    let sweep = CleanupSweep::new(pool, config.cleanup);
                    let handle = spawn_sweep(sweep, session_token.clone());
                    *session.lock().await = Some((session_token, handle));
                    info!("Cleanup sweep started on elected leader");
                    Ok(())
                }
            },
            move |_pool, _config| {
                let session = session_lose.clone();
                async move {
                    if let Some((token, handle)) = session.lock().await.take() {
                        token.cancel();
                        handle
                            .await
                            .map_err(|e| anyhow::anyhow!("Cleanup sweep task failed: {}", e))?;
                        info!("Cleanup sweep stopped (lost leadership)");
                    }
                    Ok(())
                }
            },
        ));
        background_tasks.push(handle);
    }

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    })
}

/// Main application struct that owns all resources and lifecycle.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] connects, runs migrations and starts background services
/// 2. **Run**: [`Application::run`] waits for the shutdown future
/// 3. **Shutdown**: background services stop, the pool closes and telemetry is flushed
pub struct Application {
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Create an application on an existing pool (migrations still run), or connect when `None`
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting registry with configuration: {:#?}", config);

        let pool = match pool {
            Some(pool) => {
                migrator().run(&pool).await?;
                pool
            }
            None => setup_database(&config).await?,
        };

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(pool.clone(), config.clone(), shutdown_token).await?;

        Ok(Self { config, pool, bg_services })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Pool for library callers (repositories, signup) running in the same process
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run until `shutdown` resolves, then stop everything in order
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!("Registry running");
        shutdown.await;

        info!("Stopping background services...");
        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{backdate_person, create_test_config, create_test_person, owner_exists};
    use chrono::Utc;
    use std::time::Duration;

    async fn wait_until_gone(pool: &PgPool, passport: &str) -> bool {
        for _ in 0..100 {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM natural_persons WHERE passport_data = $1)")
                .bind(passport)
                .fetch_one(pool)
                .await
                .unwrap();
            if !exists {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    /// Integration test: the application sweeps an interrupted signup without any caller
    /// driving the cycle
    #[sqlx::test]
    #[test_log::test]
    async fn test_application_sweeps_orphans_in_background(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;
        backdate_person(&mut conn, "1234 567890", Utc::now() - chrono::Duration::minutes(6)).await;

        let mut config = create_test_config();
        config.cleanup.interval = Duration::from_millis(50);

        let app = Application::new_with_pool(config, Some(pool.clone())).await.unwrap();

        assert!(wait_until_gone(&pool, "1234 567890").await, "orphan should be reclaimed");
        assert!(!owner_exists(&mut conn, "Addr1").await);

        // run() closes the pool, which waits for every checked-out connection
        drop(conn);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(app.run(async move {
            let _ = rx.await;
        }));
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(10), running)
            .await
            .expect("application should shut down")
            .unwrap()
            .unwrap();
        assert!(pool.is_closed());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_leader_runs_the_sweep(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;
        backdate_person(&mut conn, "1234 567890", Utc::now() - chrono::Duration::minutes(6)).await;

        let mut config = create_test_config();
        config.leader_election.enabled = true;
        config.cleanup.interval = Duration::from_millis(50);

        let app = Application::new_with_pool(config, Some(pool.clone())).await.unwrap();

        // The first election tick fires immediately
        assert!(wait_until_gone(&pool, "1234 567890").await, "leader should sweep");
        app.bg_services.shutdown().await;
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_disabled_sweep_leaves_orphans(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        create_test_person(&mut conn, "1234 567890", "Addr1").await;
        backdate_person(&mut conn, "1234 567890", Utc::now() - chrono::Duration::minutes(6)).await;

        let mut config = create_test_config();
        config.cleanup.enabled = false;
        config.cleanup.interval = Duration::from_millis(10);

        let app = Application::new_with_pool(config, Some(pool.clone())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(owner_exists(&mut conn, "Addr1").await);
        app.bg_services.shutdown().await;
    }
}
