//! Membership domain types shared by billing, access control and the binaries

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Length of the grace window that follows a renewal payment failure
pub const GRACE_PERIOD: time::Duration = time::Duration::hours(48);

// =============================================================================
// Enums
// =============================================================================

/// Subscription status as recorded in the relational store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    None,
    Trialing,
    Active,
    PastDue,
    Cancelled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "NONE"),
            Self::Trialing => write!(f, "TRIALING"),
            Self::Active => write!(f, "ACTIVE"),
            Self::PastDue => write!(f, "PAST_DUE"),
            Self::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Which kind of seat a member occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatTier {
    Individual,
    Owner,
    TeamMember,
}

impl std::fmt::Display for SeatTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Individual => write!(f, "INDIVIDUAL"),
            Self::Owner => write!(f, "OWNER"),
            Self::TeamMember => write!(f, "TEAM_MEMBER"),
        }
    }
}

/// Platform roles owned exclusively by this system.
///
/// A linked member holds at most one of these at a time. Roles that other
/// bots or moderators hand out are never touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ManagedRole {
    /// Paid, onboarding not finished
    Squire,
    /// Team seat
    Knight,
    /// Individual subscriber or team owner
    Lord,
    /// Billing failure past grace; support channel only
    Debtor,
}

impl ManagedRole {
    pub const ALL: [ManagedRole; 4] = [
        ManagedRole::Squire,
        ManagedRole::Knight,
        ManagedRole::Lord,
        ManagedRole::Debtor,
    ];

    /// The role a seat is entitled to, given onboarding and billing state.
    ///
    /// Debtor state wins over everything else, then an unfinished intro.
    pub fn for_seat(seat_tier: SeatTier, intro_completed: bool, is_in_debtor_state: bool) -> Self {
        if is_in_debtor_state {
            return Self::Debtor;
        }
        if !intro_completed {
            return Self::Squire;
        }
        match seat_tier {
            SeatTier::Owner | SeatTier::Individual => Self::Lord,
            SeatTier::TeamMember => Self::Knight,
        }
    }

    /// Role name as configured on the platform
    pub fn name(&self) -> &'static str {
        match self {
            Self::Squire => "Squire",
            Self::Knight => "Knight",
            Self::Lord => "Lord",
            Self::Debtor => "Debtor",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|role| role.name().eq_ignore_ascii_case(name))
    }

    /// Managed roles contained in an arbitrary platform role set
    pub fn managed_in<S: AsRef<str>>(roles: &[S]) -> Vec<ManagedRole> {
        let mut managed: Vec<ManagedRole> = roles
            .iter()
            .filter_map(|r| Self::from_name(r.as_ref()))
            .collect();
        managed.sort();
        managed.dedup();
        managed
    }
}

impl std::fmt::Display for ManagedRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Rows
// =============================================================================

/// A community member (one seat)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: Uuid,
    pub display_name: String,
    /// Stripe customer for individual subscribers; team seats bill through the team
    pub billing_customer_ref: Option<String>,
    pub subscription_status: SubscriptionStatus,
    /// Platform user id, set once the member claims their account
    pub platform_user_id: Option<String>,
    pub intro_completed: bool,
    pub is_in_debtor_state: bool,
    pub payment_failed_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub immediate_notice_sent_at: Option<OffsetDateTime>,
    pub seat_tier: SeatTier,
    pub team_id: Option<Uuid>,
}

impl Member {
    pub fn is_platform_linked(&self) -> bool {
        self.platform_user_id.is_some()
    }

    /// A payment failure episode is open (GRACE or RESTRICTED)
    pub fn in_failure_episode(&self) -> bool {
        self.payment_failed_at.is_some()
    }

    /// Managed role this member should hold, or `None` for no access.
    ///
    /// `effective_status` is the team's status for team seats and the member's
    /// own status otherwise.
    pub fn expected_role(&self, effective_status: SubscriptionStatus) -> Option<ManagedRole> {
        let entitled = match effective_status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::PastDue => self.in_failure_episode() || self.is_in_debtor_state,
            SubscriptionStatus::None
            | SubscriptionStatus::Trialing
            | SubscriptionStatus::Cancelled => false,
        };

        entitled.then(|| {
            ManagedRole::for_seat(
                self.seat_tier,
                self.intro_completed,
                self.is_in_debtor_state,
            )
        })
    }

    /// Effective status resolved against the owning team, if any
    pub fn effective_status(&self, team: Option<&Team>) -> SubscriptionStatus {
        match (self.team_id, team) {
            (Some(team_id), Some(team)) if team.id == team_id => team.subscription_status,
            _ => self.subscription_status,
        }
    }
}

/// A team subscription owning several member seats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub name: String,
    pub billing_customer_ref: String,
    pub subscription_status: SubscriptionStatus,
    pub owner_seats: i32,
    pub team_seats: i32,
    pub payment_failed_at: Option<OffsetDateTime>,
    pub grace_period_ends_at: Option<OffsetDateTime>,
}

/// Start and end of one grace episode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraceWindow {
    pub failed_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
}

impl GraceWindow {
    pub fn starting_at(failed_at: OffsetDateTime) -> Self {
        Self {
            failed_at,
            ends_at: failed_at + GRACE_PERIOD,
        }
    }
}
