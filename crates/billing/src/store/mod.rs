//! Relational store port for members, teams and the audit log
//!
//! The relational store is the authority for intended membership state.
//! Every state-changing method takes the [`AuditEntry`] describing the
//! transition and persists it together with the change.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgMembershipStore;

use async_trait::async_trait;
use keepwarden_shared::{GraceWindow, Member, SubscriptionStatus, Team};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::error::BillingResult;

#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>>;

    async fn get_team(&self, team_id: Uuid) -> BillingResult<Option<Team>>;

    /// Members with a platform user id
    async fn list_linked_members(&self) -> BillingResult<Vec<Member>>;

    async fn list_teams(&self) -> BillingResult<Vec<Team>>;

    async fn find_member_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Member>>;

    async fn find_team_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Team>>;

    async fn team_members(&self, team_id: Uuid) -> BillingResult<Vec<Member>>;

    /// Open a failure episode for one member.
    ///
    /// Conditional on `payment_failed_at IS NULL`; returns `None` when an
    /// episode was already open, so concurrent duplicates cannot both start one.
    async fn start_member_grace(
        &self,
        member_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Member>>;

    /// Open a failure episode for a team and every member seat, atomically.
    ///
    /// Returns `None` when the team already had an open episode. On error no
    /// row is changed.
    async fn start_team_grace(
        &self,
        team_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Vec<Member>>>;

    /// Clear grace and debtor fields and set the final status
    async fn close_member_episode(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Member>;

    /// Team variant of [`close_member_episode`](Self::close_member_episode), atomic across seats
    async fn close_team_episode(
        &self,
        team_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Vec<Member>>;

    /// Past-due members whose grace window ended before `now` and are not yet restricted
    async fn list_expired_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<Member>>;

    /// Set the debtor flag. Returns `None` if the member was already restricted
    /// or no longer has an open episode.
    async fn mark_debtor(&self, member_id: Uuid, audit: AuditEntry)
        -> BillingResult<Option<Member>>;

    async fn set_member_status(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<()>;

    async fn set_platform_user_id(
        &self,
        member_id: Uuid,
        platform_user_id: &str,
        audit: AuditEntry,
    ) -> BillingResult<Member>;

    async fn append_audit(&self, entry: AuditEntry) -> BillingResult<()>;
}
