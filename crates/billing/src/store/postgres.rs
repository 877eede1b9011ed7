//! Postgres-backed membership store

use async_trait::async_trait;
use keepwarden_shared::{GraceWindow, Member, SubscriptionStatus, Team};
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::MembershipStore;
use crate::audit::AuditEntry;
use crate::error::{BillingError, BillingResult};

const MEMBER_COLUMNS: &str = r#"
    id, display_name, billing_customer_ref, subscription_status, platform_user_id,
    intro_completed, is_in_debtor_state, payment_failed_at, grace_period_ends_at,
    immediate_notice_sent_at, seat_tier, team_id
"#;

const TEAM_COLUMNS: &str = r#"
    id, name, billing_customer_ref, subscription_status, owner_seats, team_seats,
    payment_failed_at, grace_period_ends_at
"#;

pub struct PgMembershipStore {
    pool: PgPool,
}

impl PgMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> BillingResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_logs (action, entity_type, entity_id, details, performed_by, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(entry.action.as_str())
    .bind(entry.entity_type.as_str())
    .bind(entry.entity_id.to_string())
    .bind(&entry.details)
    .bind(&entry.performed_by)
    .bind(entry.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl MembershipStore for PgMembershipStore {
    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>> {
        let sql = format!("SELECT {} FROM members WHERE id = $1", MEMBER_COLUMNS);
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(member_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(member)
    }

    async fn get_team(&self, team_id: Uuid) -> BillingResult<Option<Team>> {
        let sql = format!("SELECT {} FROM teams WHERE id = $1", TEAM_COLUMNS);
        let team = sqlx::query_as::<_, Team>(&sql)
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(team)
    }

    async fn list_linked_members(&self) -> BillingResult<Vec<Member>> {
        let sql = format!(
            "SELECT {} FROM members WHERE platform_user_id IS NOT NULL ORDER BY id",
            MEMBER_COLUMNS
        );
        let members = sqlx::query_as::<_, Member>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(members)
    }

    async fn list_teams(&self) -> BillingResult<Vec<Team>> {
        let sql = format!("SELECT {} FROM teams ORDER BY id", TEAM_COLUMNS);
        let teams = sqlx::query_as::<_, Team>(&sql).fetch_all(&self.pool).await?;
        Ok(teams)
    }

    async fn find_member_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Member>> {
        // Team seats bill through the team; only individual subscribers match here
        let sql = format!(
            "SELECT {} FROM members WHERE billing_customer_ref = $1 AND team_id IS NULL LIMIT 1",
            MEMBER_COLUMNS
        );
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(customer_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(member)
    }

    async fn find_team_by_customer(&self, customer_ref: &str) -> BillingResult<Option<Team>> {
        let sql = format!(
            "SELECT {} FROM teams WHERE billing_customer_ref = $1",
            TEAM_COLUMNS
        );
        let team = sqlx::query_as::<_, Team>(&sql)
            .bind(customer_ref)
            .fetch_optional(&self.pool)
            .await?;
        Ok(team)
    }

    async fn team_members(&self, team_id: Uuid) -> BillingResult<Vec<Member>> {
        let sql = format!(
            "SELECT {} FROM members WHERE team_id = $1 ORDER BY id",
            MEMBER_COLUMNS
        );
        let members = sqlx::query_as::<_, Member>(&sql)
            .bind(team_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(members)
    }

    async fn start_member_grace(
        &self,
        member_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Member>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE members
            SET payment_failed_at = $2,
                grace_period_ends_at = $3,
                immediate_notice_sent_at = $2,
                subscription_status = $4,
                updated_at = NOW()
            WHERE id = $1
              AND payment_failed_at IS NULL
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(member_id)
            .bind(window.failed_at)
            .bind(window.ends_at)
            .bind(SubscriptionStatus::PastDue)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(member) = member else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(Some(member))
    }

    async fn start_team_grace(
        &self,
        team_id: Uuid,
        window: GraceWindow,
        audit: AuditEntry,
    ) -> BillingResult<Option<Vec<Member>>> {
        // Network I/O must stay outside this transaction
        let mut tx = self.pool.begin().await?;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE teams
            SET payment_failed_at = $2,
                grace_period_ends_at = $3,
                subscription_status = $4,
                updated_at = NOW()
            WHERE id = $1
              AND payment_failed_at IS NULL
            RETURNING id
            "#,
        )
        .bind(team_id)
        .bind(window.failed_at)
        .bind(window.ends_at)
        .bind(SubscriptionStatus::PastDue)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let sql = format!(
            r#"
            UPDATE members
            SET payment_failed_at = $2,
                grace_period_ends_at = $3,
                immediate_notice_sent_at = $2,
                subscription_status = $4,
                updated_at = NOW()
            WHERE team_id = $1
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let members = sqlx::query_as::<_, Member>(&sql)
            .bind(team_id)
            .bind(window.failed_at)
            .bind(window.ends_at)
            .bind(SubscriptionStatus::PastDue)
            .fetch_all(&mut *tx)
            .await?;

        insert_audit(&mut *tx, &audit).await?;
        for member in &members {
            insert_audit(&mut *tx, &audit.for_member(member.id)).await?;
        }

        tx.commit().await?;
        Ok(Some(members))
    }

    async fn close_member_episode(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Member> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE members
            SET payment_failed_at = NULL,
                grace_period_ends_at = NULL,
                immediate_notice_sent_at = NULL,
                is_in_debtor_state = FALSE,
                subscription_status = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(member_id)
            .bind(status)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::member_not_found(member_id))?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(member)
    }

    async fn close_team_episode(
        &self,
        team_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<Vec<Member>> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE teams
            SET payment_failed_at = NULL,
                grace_period_ends_at = NULL,
                subscription_status = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(team_id)
        .bind(status)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::team_not_found(team_id));
        }

        let sql = format!(
            r#"
            UPDATE members
            SET payment_failed_at = NULL,
                grace_period_ends_at = NULL,
                immediate_notice_sent_at = NULL,
                is_in_debtor_state = FALSE,
                subscription_status = $2,
                updated_at = NOW()
            WHERE team_id = $1
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let members = sqlx::query_as::<_, Member>(&sql)
            .bind(team_id)
            .bind(status)
            .fetch_all(&mut *tx)
            .await?;

        insert_audit(&mut *tx, &audit).await?;
        for member in &members {
            insert_audit(&mut *tx, &audit.for_member(member.id)).await?;
        }

        tx.commit().await?;
        Ok(members)
    }

    async fn list_expired_grace(&self, now: OffsetDateTime) -> BillingResult<Vec<Member>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM members
            WHERE subscription_status = $1
              AND grace_period_ends_at IS NOT NULL
              AND grace_period_ends_at < $2
              AND is_in_debtor_state = FALSE
            ORDER BY grace_period_ends_at
            "#,
            MEMBER_COLUMNS
        );
        let members = sqlx::query_as::<_, Member>(&sql)
            .bind(SubscriptionStatus::PastDue)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(members)
    }

    async fn mark_debtor(
        &self,
        member_id: Uuid,
        audit: AuditEntry,
    ) -> BillingResult<Option<Member>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE members
            SET is_in_debtor_state = TRUE,
                updated_at = NOW()
            WHERE id = $1
              AND is_in_debtor_state = FALSE
              AND payment_failed_at IS NOT NULL
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(member_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(member) = member else {
            tx.rollback().await?;
            return Ok(None);
        };

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(Some(member))
    }

    async fn set_member_status(
        &self,
        member_id: Uuid,
        status: SubscriptionStatus,
        audit: AuditEntry,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE members SET subscription_status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(member_id)
        .bind(status)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(BillingError::member_not_found(member_id));
        }

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_platform_user_id(
        &self,
        member_id: Uuid,
        platform_user_id: &str,
        audit: AuditEntry,
    ) -> BillingResult<Member> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE members
            SET platform_user_id = $2,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            MEMBER_COLUMNS
        );
        let member = sqlx::query_as::<_, Member>(&sql)
            .bind(member_id)
            .bind(platform_user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::member_not_found(member_id))?;

        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        Ok(member)
    }

    async fn append_audit(&self, entry: AuditEntry) -> BillingResult<()> {
        insert_audit(&self.pool, &entry).await
    }
}
