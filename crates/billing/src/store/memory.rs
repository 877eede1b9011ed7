//! In-memory membership store
//!
//! Mirrors the Postgres store's conditional updates and all-or-nothing team
//! transitions. Used by the test suites and for running the engine without a
//! database. Supports injecting a failure part-way through a team update.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use keepwarden_shared::{GraceWindow, Member, SubscriptionStatus, Team};
use time::OffsetDateTime;
use uuid::Uuid;

use super::MembershipStore;
use crate::audit::AuditEntry;
use crate::error::{BillingError, BillingResult};

#[derive(Default)]
struct State {
    members: HashMap<Uuid, Member>,
    teams: HashMap<Uuid, Team>,
    audit: Vec<AuditEntry>,
    /// Fail a team transition after this many member rows were staged
    fail_team_update_after: Option<usize>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BillingResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| BillingError::Database("store mutex poisoned".to_string()))
    }

    pub fn insert_member(&self, member: Member) {
        if let Ok(mut state) = self.lock() {
            state.members.insert(member.id, member);
        }
    }

    pub fn insert_team(&self, team: Team) {
        if let Ok(mut state) = self.lock() {
            state.teams.insert(team.id, team);
        }
    }

    /// Replace a member row directly (simulates a write from another flow)
    pub fn update_member(&self, member_id: Uuid, f: impl FnOnce(&mut Member)) {
        if let Ok(mut state) = self.lock() {
            if let Some(member) = state.members.get_mut(&member_id) {
                f(member);
            }
        }
    }

    pub fn remove_member(&self, member_id: Uuid) {
        if let Ok(mut state) = self.lock() {
            state.members.remove(&member_id);
        }
    }

    pub fn member(&self, member_id: Uuid) -> Option<Member> {
        self.lock().ok()?.members.get(&member_id).cloned()
    }

    pub fn team(&self, team_id: Uuid) -> Option<Team> {
        self.lock().ok()?.teams.get(&team_id).cloned()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().map(|s| s.audit.clone()).unwrap_or_default()
    }

    /// The next team transition fails after staging `after` member rows
    pub fn fail_team_update_after(&self, after: usize) {
        if let Ok(mut state) = self.lock() {
            state.fail_team_update_after = Some(after);
        }
    }

    fn sorted(mut members: Vec<Member>) -> Vec<Member> {
        members.sort_by_key(|m| m.id);
        members
    }
}

fn open_episode(member: &mut Member, window: GraceWindow) {
    member.payment_failed_at = Some(window.failed_at);
    member.grace_period_ends_at = Some(window.ends_at);
    member.immediate_notice_sent_at = Some(window.failed_at);
    member.subscription_status = SubscriptionStatus::PastDue;
}

fn close_episode(member: &mut Member, status: SubscriptionStatus) {
    member.payment_failed_at = None;
    member.grace_period_ends_at = None;
    member.immediate_notice_sent_at = None;
    member.is_in_debtor_state = false;
    member.subscription_status = status;
}

impl State {
    /// Stage `f` over every seat of `team_id` on a copy, honouring the injected fault.
    /// Nothing is written unless every row succeeds.
    fn stage_team_members(
        &mut self,
        team_id: Uuid,
        f: impl Fn(&mut Member),
    ) -> BillingResult<Vec<Member>> {
        let mut staged: Vec<Member> = self
            .members
            .values()
            .filter(|m| m.team_id == Some(team_id))
            .cloned()
            .collect();
        staged.sort_by_key(|m| m.id);

        let fail_after = self.fail_team_update_after.take();
        for (index, member) in staged.iter_mut().enumerate() {
            if fail_after == Some(index) {
                return Err(BillingError::Database(format!(
                    "injected failure after {} member updates",
                    index
                )));
            }
            f(member);
        }
        Ok(staged)
    }
}

#[async_trait]
impl MembershipStore for InMemoryStore {
    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>> {
        Ok(self.lock()?.members.get(&member_id).cloned())
    }

    async fn get_team(&self, team_id: Uuid) -> BillingResult<Option<Team>> {
        Ok(self.lock()?.teams.get(&team_id).cloned())
    }

    async fn list_linked_members(&self) -> BillingResult<Vec<Member>> {
        let members = self
            .lock()?
            .members
            .values()
            .filter(|m| m.is_platform_linked())
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn list_teams(&self) -> BillingResult<Vec<Team>> {
        let mut teams: Vec<Team> = self.lock()?.teams.values().cloned().collect();
        teams.sort_by_key(|t| t.id);
        Ok(teams)
    }

    async fn find_member_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Member>> {
        Ok(self
            .lock()?
            .members
            .values()
            .find(|m| m.team_id.is_none() && m.billing_customer_ref.as_deref() == Some(customer_ref))
            .cloned())
    }

    async fn find_team_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Team>> {
        Ok(self
            .lock()?
            .teams
            .values()
            .find(|t| t.billing_customer_ref == customer_ref)
            .cloned())
    }

    async fn team_members(&self, team_id: Uuid) -> BillingResult<Vec<Member>> {
        let members = self
            .lock()?
            .members
            .values()
            .filter(|m| m.team_id == Some(team_id))
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn start_member_grace(
        &self,
        member_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Member>> {
        let mut state = self.lock()?;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or_else(|| BillingError::member_not_found(member_id))?;

        if member.payment_failed_at.is_some() {
            return Ok(None);
        }
        open_episode(member, window);
        let updated = member.clone();
        state.audit.push(audit);
        Ok(Some(updated))
    }

    async fn start_team_grace(
        &self,
        team_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Vec<Member>>> {
        let mut state = self.lock()?;
        let team = state
            .teams
            .get(&team_id)
            .cloned()
            .ok_or_else(|| BillingError::team_not_found(team_id))?;

        if team.payment_failed_at.is_some() {
            return Ok(None);
        }

        let staged = state.stage_team_members(team_id, |m| open_episode(m, window))?;

        // Commit
        if let Some(team) = state.teams.get_mut(&team_id) {
            team.payment_failed_at = Some(window.failed_at);
            team.grace_period_ends_at = Some(window.ends_at);
            team.subscription_status = SubscriptionStatus::PastDue;
        }
        for member in &staged {
            state.members.insert(member.id, member.clone());
            state.audit.push(audit.for_member(member.id));
        }
        state.audit.push(audit);
        Ok(Some(staged))
    }

    async fn close_member_episode(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Member> {
        let mut state = self.lock()?;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or_else(|| BillingError::member_not_found(member_id))?;
        close_episode(member, status);
        let updated = member.clone();
        state.audit.push(audit);
        Ok(updated)
    }

    async fn close_team_episode(
        &self,
        team_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Vec<Member>> {
        let mut state = self.lock()?;
        if !state.teams.contains_key(&team_id) {
            return Err(BillingError::team_not_found(team_id));
        }

        let staged = state.stage_team_members(team_id, |m| close_episode(m, status))?;

        if let Some(team) = state.teams.get_mut(&team_id) {
            team.payment_failed_at = None;
            team.grace_period_ends_at = None;
            team.subscription_status = status;
        }
        for member in &staged {
            state.members.insert(member.id, member.clone());
            state.audit.push(audit.for_member(member.id));
        }
        state.audit.push(audit);
        Ok(staged)
    }

    async fn list_expired_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<Member>> {
        let members = self
            .lock()?
            .members
            .values()
            .filter(|m| {
                m.subscription_status == SubscriptionStatus::PastDue
                    && !m.is_in_debtor_state
                    && m.grace_period_ends_at.is_some_and(|ends| ends < now)
            })
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn mark_debtor(
        &self,
        member_id: Uuid,
        audit: AuditEntry,
    ) -> BillingResult<Option<Member>> {
        let mut state = self.lock()?;
        let Some(member) = state.members.get_mut(&member_id) else {
            return Ok(None);
        };
        if member.is_in_debtor_state || member.payment_failed_at.is_none() {
            return Ok(None);
        }
        member.is_in_debtor_state = true;
        let updated = member.clone();
        state.audit.push(audit);
        Ok(Some(updated))
    }

    async fn set_member_status(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<()> {
        let mut state = self.lock()?;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or_else(|| BillingError::member_not_found(member_id))?;
        member.subscription_status = status;
        state.audit.push(audit);
        Ok(())
    }

    async fn set_platform_user_id(
        &self,
        member_id: Uuid,
        platform_user_id: &str,
        audit: AuditEntry,
    ) -> BillingResult<Member> {
        let mut state = self.lock()?;
        let member = state
            .members
            .get_mut(&member_id)
            .ok_or_else(|| BillingError::member_not_found(member_id))?;
        member.platform_user_id = Some(platform_user_id.to_string());
        let updated = member.clone();
        state.audit.push(audit);
        Ok(updated)
    }

    async fn append_audit(&self, entry: AuditEntry) -> BillingResult<()> {
        self.lock()?.audit.push(entry);
        Ok(())
    }
}
