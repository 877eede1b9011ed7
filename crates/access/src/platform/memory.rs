//! In-memory platform used by the test suites
//!
//! Every call is timestamped with `tokio::time::Instant` so tests running on
//! paused time can assert on spacing. Failures can be injected per operation,
//! user and role, either a fixed number of times or permanently.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use keepwarden_shared::ManagedRole;
use tokio::time::Instant;

use super::{PlatformClient, PlatformError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformOp {
    MemberRoles,
    AddRole,
    RemoveRole,
    Kick,
    SendDm,
    PostChannelMessage,
}

impl PlatformOp {
    pub fn is_role_mutation(&self) -> bool {
        matches!(self, PlatformOp::AddRole | PlatformOp::RemoveRole)
    }
}

#[derive(Debug, Clone)]
pub struct PlatformCall {
    pub op: PlatformOp,
    /// User id, or channel id for channel messages
    pub target: String,
    pub role: Option<ManagedRole>,
    pub at: Instant,
    pub succeeded: bool,
}

struct FailureRule {
    op: PlatformOp,
    target: Option<String>,
    role: Option<ManagedRole>,
    /// `None` fails forever
    remaining: Option<u32>,
    error: PlatformError,
}

impl FailureRule {
    fn matches(&self, op: PlatformOp, target: &str, role: Option<ManagedRole>) -> bool {
        self.op == op
            && self.target.as_deref().map_or(true, |t| t == target)
            && self.role.map_or(true, |r| Some(r) == role)
    }
}

#[derive(Default)]
struct State {
    members: HashMap<String, BTreeSet<String>>,
    calls: Vec<PlatformCall>,
    rules: Vec<FailureRule>,
    messages: Vec<(String, String)>,
    kicked: Vec<String>,
}

impl State {
    fn injected(
        &mut self,
        op: PlatformOp,
        target: &str,
        role: Option<ManagedRole>,
    ) -> Option<PlatformError> {
        let index = self
            .rules
            .iter()
            .position(|rule| rule.matches(op, target, role))?;
        let rule = &mut self.rules[index];
        let error = rule.error.clone();
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.rules.remove(index);
        }
        Some(error)
    }

    fn record(&mut self, op: PlatformOp, target: &str, role: Option<ManagedRole>, succeeded: bool) {
        self.calls.push(PlatformCall {
            op,
            target: target.to_string(),
            role,
            at: Instant::now(),
            succeeded,
        });
    }

    /// Record the call and return an injected error, if any
    fn begin(
        &mut self,
        op: PlatformOp,
        target: &str,
        role: Option<ManagedRole>,
    ) -> Result<(), PlatformError> {
        match self.injected(op, target, role) {
            Some(error) => {
                self.record(op, target, role, false);
                Err(error)
            }
            None => {
                self.record(op, target, role, true);
                Ok(())
            }
        }
    }
}

#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, PlatformError> {
        self.state
            .lock()
            .map_err(|_| PlatformError::Transport("platform mutex poisoned".to_string()))
    }

    /// Put a user in the guild with the given role names
    pub fn add_member(&self, user_id: &str, roles: &[&str]) {
        if let Ok(mut state) = self.lock() {
            state.members.insert(
                user_id.to_string(),
                roles.iter().map(|r| r.to_string()).collect(),
            );
        }
    }

    pub fn roles(&self, user_id: &str) -> Option<Vec<String>> {
        let state = self.lock().ok()?;
        state
            .members
            .get(user_id)
            .map(|roles| roles.iter().cloned().collect())
    }

    pub fn managed_roles(&self, user_id: &str) -> Vec<ManagedRole> {
        self.roles(user_id)
            .map(|roles| ManagedRole::managed_in(&roles))
            .unwrap_or_default()
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.lock()
            .map(|s| s.members.contains_key(user_id))
            .unwrap_or(false)
    }

    /// Fail `op` for `times` calls, or forever when `times` is `None`
    pub fn fail(
        &self,
        op: PlatformOp,
        target: Option<&str>,
        role: Option<ManagedRole>,
        times: Option<u32>,
        error: PlatformError,
    ) {
        if let Ok(mut state) = self.lock() {
            state.rules.push(FailureRule {
                op,
                target: target.map(str::to_string),
                role,
                remaining: times,
                error,
            });
        }
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Add and remove calls, including failed attempts
    pub fn role_mutations(&self) -> Vec<PlatformCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.op.is_role_mutation())
            .collect()
    }

    pub fn clear_calls(&self) {
        if let Ok(mut state) = self.lock() {
            state.calls.clear();
        }
    }

    /// Messages delivered to a user (DM) or channel
    pub fn messages_to(&self, target: &str) -> Vec<String> {
        self.lock()
            .map(|s| {
                s.messages
                    .iter()
                    .filter(|(t, _)| t == target)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn kicked(&self) -> Vec<String> {
        self.lock().map(|s| s.kicked.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PlatformClient for InMemoryPlatform {
    async fn member_roles(&self, user_id: &str) -> Result<Option<Vec<String>>, PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::MemberRoles, user_id, None)?;
        Ok(state
            .members
            .get(user_id)
            .map(|roles| roles.iter().cloned().collect()))
    }

    async fn add_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::AddRole, user_id, Some(role))?;
        let roles = state
            .members
            .get_mut(user_id)
            .ok_or_else(|| PlatformError::UnknownMember(user_id.to_string()))?;
        roles.insert(role.name().to_string());
        Ok(())
    }

    async fn remove_role(&self, user_id: &str, role: ManagedRole) -> Result<(), PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::RemoveRole, user_id, Some(role))?;
        let roles = state
            .members
            .get_mut(user_id)
            .ok_or_else(|| PlatformError::UnknownMember(user_id.to_string()))?;
        roles.remove(role.name());
        Ok(())
    }

    async fn kick(&self, user_id: &str, _reason: &str) -> Result<(), PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::Kick, user_id, None)?;
        if state.members.remove(user_id).is_some() {
            state.kicked.push(user_id.to_string());
        }
        Ok(())
    }

    async fn send_dm(&self, user_id: &str, content: &str) -> Result<(), PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::SendDm, user_id, None)?;
        state
            .messages
            .push((user_id.to_string(), content.to_string()));
        Ok(())
    }

    async fn post_channel_message(
        &self,
        channel_id: &str,
        content: &str,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock()?;
        state.begin(PlatformOp::PostChannelMessage, channel_id, None)?;
        state
            .messages
            .push((channel_id.to_string(), content.to_string()));
        Ok(())
    }
}
