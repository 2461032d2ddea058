//! Composition root: every component wired once from `Config`

use crate::cache::{CacheManager, CacheOperations, NoOpCacheManager};
use crate::config::Config;
use crate::policy::Evaluator;
use crate::repository::{
    PolicyRepositoryImpl, RbacRepositoryImpl, TenantRepositoryImpl, UserRepositoryImpl,
};
use crate::service::{
    AccessService, AssignmentLedger, PolicyLoader, PolicyStore, RoleCatalog, TenantService,
};
use anyhow::{Context, Result};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

pub type Tenants = TenantService<TenantRepositoryImpl, UserRepositoryImpl>;
pub type Roles = RoleCatalog<RbacRepositoryImpl, TenantRepositoryImpl>;
pub type Ledger = AssignmentLedger<RbacRepositoryImpl, TenantRepositoryImpl, UserRepositoryImpl>;
pub type Policies = PolicyStore<PolicyRepositoryImpl, TenantRepositoryImpl, Evaluator>;
pub type Loader = PolicyLoader<PolicyRepositoryImpl, RbacRepositoryImpl, Evaluator>;
pub type Access =
    AccessService<RbacRepositoryImpl, TenantRepositoryImpl, UserRepositoryImpl, Evaluator>;

/// Shared handles to every service, cheap to clone
#[derive(Clone)]
pub struct AuthzContext {
    pub config: Arc<Config>,
    pub db_pool: MySqlPool,
    pub evaluator: Arc<Evaluator>,
    pub tenants: Arc<Tenants>,
    pub roles: Arc<Roles>,
    pub ledger: Arc<Ledger>,
    pub policies: Arc<Policies>,
    pub loader: Arc<Loader>,
    pub access: Arc<Access>,
}

impl AuthzContext {
    /// Connect to MySQL (and Redis when configured) and build the services.
    ///
    /// Policies are not loaded here; call [`Loader::load`] before checking access.
    pub async fn build(config: Config) -> Result<Self> {
        let db_pool = MySqlPoolOptions::new()
            .max_connections(config.database.max_connections)
            .min_connections(config.database.min_connections)
            .connect(&config.database.url)
            .await
            .context("Failed to connect to database")?;
        info!("Connected to database");

        let cache: Arc<dyn CacheOperations> = match &config.redis {
            Some(redis) => {
                let manager = CacheManager::new(redis)
                    .await
                    .context("Failed to connect to Redis")?;
                info!("Connected to Redis");
                Arc::new(manager)
            }
            None => {
                info!("REDIS_URL not set, role resolution is uncached");
                Arc::new(NoOpCacheManager::new())
            }
        };

        let evaluator = Arc::new(Evaluator::from_config(&config.evaluator)?);
        info!(mode = %config.evaluator.mode, "Policy evaluator ready");

        Ok(Self::with_parts(config, db_pool, cache, evaluator))
    }

    /// Wire services over an existing pool, cache and evaluator
    pub fn with_parts(
        config: Config,
        db_pool: MySqlPool,
        cache: Arc<dyn CacheOperations>,
        evaluator: Arc<Evaluator>,
    ) -> Self {
        let tenant_repo = Arc::new(TenantRepositoryImpl::new(db_pool.clone()));
        let user_repo = Arc::new(UserRepositoryImpl::new(db_pool.clone()));
        let rbac_repo = Arc::new(RbacRepositoryImpl::new(db_pool.clone()));
        let policy_repo = Arc::new(PolicyRepositoryImpl::new(db_pool.clone()));

        let tenants = Arc::new(TenantService::new(
            tenant_repo.clone(),
            user_repo.clone(),
            cache.clone(),
        ));
        let roles = Arc::new(RoleCatalog::new(
            rbac_repo.clone(),
            tenant_repo.clone(),
            cache.clone(),
        ));
        let ledger = Arc::new(AssignmentLedger::new(
            rbac_repo.clone(),
            tenant_repo.clone(),
            user_repo.clone(),
            cache,
        ));
        let policies = Arc::new(PolicyStore::new(
            policy_repo.clone(),
            tenant_repo.clone(),
            evaluator.clone(),
        ));
        let loader = Arc::new(PolicyLoader::new(
            policy_repo,
            rbac_repo,
            evaluator.clone(),
            config.evaluator.policy_dir.clone(),
        ));
        let access = Arc::new(AccessService::new(
            ledger.clone(),
            tenant_repo,
            user_repo,
            evaluator.clone(),
            config.access.check_timeout,
        ));

        Self {
            config: Arc::new(config),
            db_pool,
            evaluator,
            tenants,
            roles,
            ledger,
            policies,
            loader,
            access,
        }
    }

    /// Start the periodic reload when `POLICY_REFRESH_INTERVAL_SECS` is set
    pub fn spawn_refresh(&self, shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let interval = self.config.evaluator.refresh_interval?;
        info!(interval_secs = interval.as_secs(), "Starting periodic policy refresh");
        Some(self.loader.clone().spawn_refresh(interval, shutdown))
    }
}
