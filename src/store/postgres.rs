use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};

use crate::types::{
    AccessCode, ApprovalDecision, CodeKind, InstanceConfig, InstanceId, LedgerEntry, LedgerReason,
    LibraryAccount, MediaIdentity, MediaKind, RequestRecord, RequestState, UserId, UserProfile,
    AccountStatus,
};

use super::{LedgerApply, Store};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id        BIGINT PRIMARY KEY,
    balance        BIGINT NOT NULL DEFAULT 0,
    warning_count  INT NOT NULL DEFAULT 0,
    is_admin       BOOLEAN NOT NULL DEFAULT FALSE,
    deactivated    BOOLEAN NOT NULL DEFAULT FALSE,
    created_at     TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS ledger_entries (
    id              BIGSERIAL PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    delta           BIGINT NOT NULL,
    reason          TEXT NOT NULL,
    idempotency_key TEXT NOT NULL UNIQUE,
    balance_after   BIGINT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL
);
CREATE TABLE IF NOT EXISTS instances (
    instance_id   BIGINT PRIMARY KEY,
    name          TEXT NOT NULL,
    base_url      TEXT NOT NULL,
    api_key       TEXT NOT NULL,
    webhook_token TEXT NOT NULL,
    kind          TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bindings (
    binding_id  TEXT PRIMARY KEY,
    instance_id BIGINT NOT NULL
);
CREATE TABLE IF NOT EXISTS requests (
    request_id      TEXT PRIMARY KEY,
    user_id         BIGINT NOT NULL,
    media_kind      TEXT NOT NULL,
    external_id     BIGINT NOT NULL,
    title           TEXT NOT NULL,
    localized_title TEXT,
    instance_id     BIGINT NOT NULL,
    binding_id      TEXT NOT NULL,
    state           TEXT NOT NULL,
    hold_key        TEXT,
    hold_amount     BIGINT NOT NULL DEFAULT 0,
    decision        TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    updated_at      TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS requests_media_idx ON requests (external_id, instance_id);
CREATE TABLE IF NOT EXISTS accounts (
    user_id      BIGINT NOT NULL,
    instance_id  BIGINT NOT NULL,
    remote_id    TEXT NOT NULL,
    account_name TEXT NOT NULL,
    status       TEXT NOT NULL,
    expires_at   TIMESTAMPTZ NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (user_id, instance_id)
);
CREATE TABLE IF NOT EXISTS access_codes (
    code        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    instance_id BIGINT NOT NULL,
    expires_at  TIMESTAMPTZ NOT NULL,
    used_at     TIMESTAMPTZ,
    used_by     BIGINT
);
CREATE TABLE IF NOT EXISTS webhook_deliveries (
    delivery_id TEXT PRIMARY KEY,
    seen_at     TIMESTAMPTZ NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }
        Ok(Self { pool })
    }
}

type RequestRow = (
    String,
    i64,
    String,
    i64,
    String,
    Option<String>,
    i64,
    String,
    String,
    Option<String>,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn request_from_row(row: RequestRow) -> RequestRecord {
    let (
        request_id,
        user_id,
        media_kind,
        external_id,
        title,
        localized_title,
        instance_id,
        binding_id,
        state,
        hold_key,
        hold_amount,
        decision,
        created_at,
        updated_at,
    ) = row;
    RequestRecord {
        request_id,
        user_id,
        media: MediaIdentity {
            kind: MediaKind::parse(&media_kind),
            external_id,
            title,
            localized_title,
        },
        instance_id,
        binding_id,
        state: RequestState::parse(&state),
        hold_key,
        hold_amount,
        decision: ApprovalDecision::parse(&decision),
        created_at,
        updated_at,
    }
}

const REQUEST_COLUMNS: &str = "request_id, user_id, media_kind, external_id, title, \
     localized_title, instance_id, binding_id, state, hold_key, hold_amount, decision, \
     created_at, updated_at";

type CodeRow = (
    String,
    String,
    i64,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<i64>,
);

fn code_from_row(row: CodeRow) -> AccessCode {
    let (code, kind, instance_id, expires_at, used_at, used_by) = row;
    AccessCode {
        code,
        kind: CodeKind::parse(&kind),
        instance_id,
        expires_at,
        used_at,
        used_by,
    }
}

type EntryRow = (i64, i64, String, String, i64, DateTime<Utc>);

fn entry_from_row(row: EntryRow) -> LedgerEntry {
    let (user_id, delta, reason, idempotency_key, balance_after, timestamp) = row;
    LedgerEntry {
        user_id,
        delta,
        reason: LedgerReason::parse(&reason),
        idempotency_key,
        balance_after,
        timestamp,
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_or_create_user(&self, user_id: UserId) -> anyhow::Result<UserProfile> {
        sqlx::query(
            "INSERT INTO users (user_id, created_at) VALUES ($1, $2)
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let (user_id, balance, warning_count, is_admin, deactivated, created_at) =
            sqlx::query_as::<_, (i64, i64, i32, bool, bool, DateTime<Utc>)>(
                "SELECT user_id, balance, warning_count, is_admin, deactivated, created_at
                 FROM users WHERE user_id = $1",
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(UserProfile {
            user_id,
            balance,
            warning_count: warning_count as u32,
            is_admin,
            deactivated,
            created_at,
        })
    }

    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> anyhow::Result<()> {
        self.get_or_create_user(user_id).await?;
        sqlx::query("UPDATE users SET is_admin = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(is_admin)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_warning(&self, user_id: UserId) -> anyhow::Result<u32> {
        self.get_or_create_user(user_id).await?;
        let (count,) = sqlx::query_as::<_, (i32,)>(
            "UPDATE users SET warning_count = warning_count + 1
             WHERE user_id = $1 RETURNING warning_count",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn deactivate_user(&self, user_id: UserId) -> anyhow::Result<()> {
        self.get_or_create_user(user_id).await?;
        sqlx::query("UPDATE users SET deactivated = TRUE WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_ledger(
        &self,
        user_id: UserId,
        delta: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> anyhow::Result<LedgerApply> {
        self.get_or_create_user(user_id).await?;
        let mut tx = self.pool.begin().await?;

        // Row lock serializes ledger applications per user.
        let (balance,) =
            sqlx::query_as::<_, (i64,)>("SELECT balance FROM users WHERE user_id = $1 FOR UPDATE")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;

        if let Some((prior,)) = sqlx::query_as::<_, (i64,)>(
            "SELECT balance_after FROM ledger_entries WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(&mut *tx)
        .await?
        {
            tx.rollback().await?;
            return Ok(LedgerApply::Duplicate(prior));
        }

        let next = balance + delta;
        if next < 0 && !reason.allows_negative() {
            tx.rollback().await?;
            return Ok(LedgerApply::Insufficient(balance));
        }

        let inserted = sqlx::query(
            "INSERT INTO ledger_entries (user_id, delta, reason, idempotency_key, balance_after, ts)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(user_id)
        .bind(delta)
        .bind(reason.as_str())
        .bind(idempotency_key)
        .bind(next)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Lost a race on the same key; report the winner's balance.
            tx.rollback().await?;
            let (prior,) = sqlx::query_as::<_, (i64,)>(
                "SELECT balance_after FROM ledger_entries WHERE idempotency_key = $1",
            )
            .bind(idempotency_key)
            .fetch_one(&self.pool)
            .await?;
            return Ok(LedgerApply::Duplicate(prior));
        }

        sqlx::query("UPDATE users SET balance = $2 WHERE user_id = $1")
            .bind(user_id)
            .bind(next)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(LedgerApply::Applied(next))
    }

    async fn balance(&self, user_id: UserId) -> anyhow::Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT balance FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(balance,)| balance).unwrap_or(0))
    }

    async fn ledger_entries(&self, user_id: UserId) -> anyhow::Result<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT user_id, delta, reason, idempotency_key, balance_after, ts
             FROM ledger_entries WHERE user_id = $1 ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(entry_from_row).collect())
    }

    async fn entries_with_key_prefix(&self, prefix: &str) -> anyhow::Result<Vec<LedgerEntry>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT user_id, delta, reason, idempotency_key, balance_after, ts
             FROM ledger_entries WHERE idempotency_key LIKE $1 ORDER BY id",
        )
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(entry_from_row).collect())
    }

    async fn upsert_instance(&self, instance: InstanceConfig) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO instances (instance_id, name, base_url, api_key, webhook_token, kind)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (instance_id)
             DO UPDATE SET name = EXCLUDED.name, base_url = EXCLUDED.base_url,
                           api_key = EXCLUDED.api_key, webhook_token = EXCLUDED.webhook_token,
                           kind = EXCLUDED.kind",
        )
        .bind(instance.instance_id)
        .bind(&instance.name)
        .bind(&instance.base_url)
        .bind(&instance.api_key)
        .bind(&instance.webhook_token)
        .bind(serde_json::to_string(&instance.kind)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<InstanceConfig>> {
        let row = sqlx::query_as::<_, (i64, String, String, String, String, String)>(
            "SELECT instance_id, name, base_url, api_key, webhook_token, kind
             FROM instances WHERE instance_id = $1",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(instance_id, name, base_url, api_key, webhook_token, kind)| {
            Ok(InstanceConfig {
                instance_id,
                name,
                base_url,
                api_key,
                webhook_token,
                kind: serde_json::from_str(&kind)?,
            })
        })
        .transpose()
    }

    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceConfig>> {
        let rows = sqlx::query_as::<_, (i64, String, String, String, String, String)>(
            "SELECT instance_id, name, base_url, api_key, webhook_token, kind
             FROM instances ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(instance_id, name, base_url, api_key, webhook_token, kind)| {
                Ok(InstanceConfig {
                    instance_id,
                    name,
                    base_url,
                    api_key,
                    webhook_token,
                    kind: serde_json::from_str(&kind)?,
                })
            })
            .collect()
    }

    async fn put_binding(&self, binding_id: &str, instance_id: InstanceId) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO bindings (binding_id, instance_id) VALUES ($1, $2)
             ON CONFLICT (binding_id) DO UPDATE SET instance_id = EXCLUDED.instance_id",
        )
        .bind(binding_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_binding(&self, binding_id: &str) -> anyhow::Result<bool> {
        let result = sqlx::query("DELETE FROM bindings WHERE binding_id = $1")
            .bind(binding_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_binding(&self, binding_id: &str) -> anyhow::Result<Option<InstanceId>> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT instance_id FROM bindings WHERE binding_id = $1",
        )
        .bind(binding_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(instance_id,)| instance_id))
    }

    async fn list_bindings(&self) -> anyhow::Result<Vec<(String, InstanceId)>> {
        Ok(sqlx::query_as::<_, (String, i64)>(
            "SELECT binding_id, instance_id FROM bindings ORDER BY binding_id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    async fn insert_request(&self, record: RequestRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO requests (request_id, user_id, media_kind, external_id, title,
                 localized_title, instance_id, binding_id, state, hold_key, hold_amount,
                 decision, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&record.request_id)
        .bind(record.user_id)
        .bind(record.media.kind.as_str())
        .bind(record.media.external_id)
        .bind(&record.media.title)
        .bind(&record.media.localized_title)
        .bind(record.instance_id)
        .bind(&record.binding_id)
        .bind(record.state.as_str())
        .bind(&record.hold_key)
        .bind(record.hold_amount)
        .bind(record.decision.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> anyhow::Result<Option<RequestRecord>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE request_id = $1"
        ))
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(request_from_row))
    }

    async fn transition_request(
        &self,
        record: RequestRecord,
        expected: RequestState,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE requests SET state = $3, hold_key = $4, hold_amount = $5, decision = $6,
                 updated_at = $7
             WHERE request_id = $1 AND state = $2",
        )
        .bind(&record.request_id)
        .bind(expected.as_str())
        .bind(record.state.as_str())
        .bind(&record.hold_key)
        .bind(record.hold_amount)
        .bind(record.decision.as_str())
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn requests_in_state(&self, state: RequestState) -> anyhow::Result<Vec<RequestRecord>> {
        let rows = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE state = $1 ORDER BY created_at"
        ))
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(request_from_row).collect())
    }

    async fn find_request_by_media(
        &self,
        external_id: i64,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<RequestRecord>> {
        let row = sqlx::query_as::<_, RequestRow>(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests
             WHERE external_id = $1 AND instance_id = $2
             ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(external_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(request_from_row))
    }

    async fn insert_account(&self, account: LibraryAccount) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO accounts (user_id, instance_id, remote_id, account_name, status,
                 expires_at, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (user_id, instance_id)
             DO UPDATE SET remote_id = EXCLUDED.remote_id, account_name = EXCLUDED.account_name,
                           status = EXCLUDED.status, expires_at = EXCLUDED.expires_at",
        )
        .bind(account.user_id)
        .bind(account.instance_id)
        .bind(&account.remote_id)
        .bind(&account.account_name)
        .bind(account.status.as_str())
        .bind(account.expires_at)
        .bind(account.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_account(&self, account: LibraryAccount) -> anyhow::Result<()> {
        self.insert_account(account).await
    }

    async fn get_account(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<LibraryAccount>> {
        let row = sqlx::query_as::<
            _,
            (i64, i64, String, String, String, DateTime<Utc>, DateTime<Utc>),
        >(
            "SELECT user_id, instance_id, remote_id, account_name, status, expires_at, created_at
             FROM accounts WHERE user_id = $1 AND instance_id = $2",
        )
        .bind(user_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(account_from_row))
    }

    async fn list_accounts(&self) -> anyhow::Result<Vec<LibraryAccount>> {
        let rows = sqlx::query_as::<
            _,
            (i64, i64, String, String, String, DateTime<Utc>, DateTime<Utc>),
        >(
            "SELECT user_id, instance_id, remote_id, account_name, status, expires_at, created_at
             FROM accounts ORDER BY user_id, instance_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(account_from_row).collect())
    }

    async fn insert_code(&self, code: AccessCode) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO access_codes (code, kind, instance_id, expires_at, used_at, used_by)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&code.code)
        .bind(code.kind.as_str())
        .bind(code.instance_id)
        .bind(code.expires_at)
        .bind(code.used_at)
        .bind(code.used_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume_code(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<AccessCode>> {
        let row = sqlx::query_as::<_, CodeRow>(
            "UPDATE access_codes SET used_at = $2, used_by = $3
             WHERE code = $1 AND used_at IS NULL AND expires_at > $2
             RETURNING code, kind, instance_id, expires_at, used_at, used_by",
        )
        .bind(code)
        .bind(now)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(code_from_row))
    }

    async fn restore_code(&self, code: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE access_codes SET used_at = NULL, used_by = NULL WHERE code = $1")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune_codes(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result =
            sqlx::query("DELETE FROM access_codes WHERE used_at IS NULL AND expires_at < $1")
                .bind(before)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn record_delivery(
        &self,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_deliveries (delivery_id, seen_at) VALUES ($1, $2)
             ON CONFLICT (delivery_id) DO NOTHING",
        )
        .bind(delivery_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_deliveries(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM webhook_deliveries WHERE seen_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn account_from_row(
    row: (i64, i64, String, String, String, DateTime<Utc>, DateTime<Utc>),
) -> LibraryAccount {
    let (user_id, instance_id, remote_id, account_name, status, expires_at, created_at) = row;
    LibraryAccount {
        user_id,
        instance_id,
        remote_id,
        account_name,
        status: AccountStatus::parse(&status),
        expires_at,
        created_at,
    }
}
