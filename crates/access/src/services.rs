//! Service graph shared by the worker and the API server

use std::sync::Arc;

use keepwarden_billing::{
    BillingFailureHandler, BillingStatusSource, EmailService, MembershipStore, PgMembershipStore,
    StripeStatusSource,
};
use keepwarden_shared::flags::DEFAULT_FLAG_TTL;
use keepwarden_shared::{Config, FlagCache, PgFlagSource};
use sqlx::PgPool;

use crate::autofix::AutoFixer;
use crate::claim::ClaimService;
use crate::drift::DriftDetector;
use crate::notify::{ChannelEmailNotifier, PlatformMemberNotifier};
use crate::platform::{DiscordClient, PlatformClient};
use crate::reconcile::{AdminNotifier, Reconciler};
use crate::roles::RoleAssignmentService;
use crate::tasks::{TaskExecutor, TaskQueue};

#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn MembershipStore>,
    pub platform: Arc<dyn PlatformClient>,
    pub roles: Arc<RoleAssignmentService>,
    pub queue: Arc<TaskQueue>,
    pub billing: Arc<BillingFailureHandler>,
    pub reconciler: Arc<Reconciler>,
    pub claims: Arc<ClaimService>,
    pub flags: FlagCache,
}

impl Services {
    /// Wire every service over the given adapters. Starts the role task
    /// queue, so it must be called inside a tokio runtime.
    pub fn new(
        store: Arc<dyn MembershipStore>,
        platform: Arc<dyn PlatformClient>,
        flags: FlagCache,
        admins: Arc<dyn AdminNotifier>,
        billing_source: Option<Arc<dyn BillingStatusSource>>,
    ) -> Self {
        let roles = Arc::new(RoleAssignmentService::new(platform.clone(), store.clone()));
        let queue = Arc::new(TaskQueue::start(Arc::new(TaskExecutor::new(
            roles.clone(),
            store.clone(),
        ))));
        let billing = Arc::new(BillingFailureHandler::new(
            store.clone(),
            Arc::new(PlatformMemberNotifier::new(platform.clone())),
        ));

        let mut detector = DriftDetector::new(store.clone(), platform.clone());
        if let Some(source) = billing_source {
            detector = detector.with_billing_source(source);
        }
        let reconciler = Arc::new(Reconciler::new(
            detector,
            AutoFixer::new(store.clone(), roles.clone()),
            flags.clone(),
            admins,
        ));
        let claims = Arc::new(ClaimService::new(store.clone(), queue.clone()));

        Self {
            store,
            platform,
            roles,
            queue,
            billing,
            reconciler,
            claims,
            flags,
        }
    }

    /// Production wiring: Postgres, Discord, Stripe and Resend
    pub fn from_config(config: &Config, pool: PgPool) -> Self {
        let store: Arc<dyn MembershipStore> = Arc::new(PgMembershipStore::new(pool.clone()));
        let platform: Arc<dyn PlatformClient> = Arc::new(DiscordClient::new(&config.discord));
        let flags = FlagCache::new(Arc::new(PgFlagSource::new(pool)), DEFAULT_FLAG_TTL);

        let admins = Arc::new(ChannelEmailNotifier::new(
            platform.clone(),
            config.discord.admin_channel_id.clone(),
            EmailService::new(config.email.clone()),
        ));

        let billing_source = match config.stripe_secret_key.as_deref() {
            Some(key) => Some(Arc::new(StripeStatusSource::new(key)) as Arc<dyn BillingStatusSource>),
            None => {
                tracing::warn!("STRIPE_SECRET_KEY not set - drift detection uses stored status only");
                None
            }
        };

        Self::new(store, platform, flags, admins, billing_source)
    }
}
