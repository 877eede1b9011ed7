#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Keepwarden shared types
//!
//! Domain model, configuration, feature flags and database plumbing used by
//! every crate in the workspace.

pub mod config;
pub mod db;
pub mod flags;
pub mod types;

pub use config::{reconciliation_paused, Config, ConfigError, DiscordConfig, EmailConfig, RoleIds};
pub use db::{create_pool, run_migrations};
pub use flags::{FlagCache, FlagError, FlagSource, PgFlagSource, StaticFlagSource};
pub use types::{
    GraceWindow, ManagedRole, Member, SeatTier, SubscriptionStatus, Team, GRACE_PERIOD,
};
