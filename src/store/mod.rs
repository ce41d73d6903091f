mod in_memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    AccessCode, InstanceConfig, InstanceId, LedgerEntry, LedgerReason, LibraryAccount,
    RequestRecord, RequestState, UserId, UserProfile,
};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Result of one atomic ledger application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerApply {
    /// Entry appended, balance updated.
    Applied(i64),
    /// Idempotency key already seen; carries the balance recorded back then.
    Duplicate(i64),
    /// Would go negative and the reason does not allow it; carries the
    /// untouched balance.
    Insufficient(i64),
}

#[async_trait]
pub trait Store: Send + Sync {
    // Users
    async fn get_or_create_user(&self, user_id: UserId) -> anyhow::Result<UserProfile>;
    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> anyhow::Result<()>;
    async fn add_warning(&self, user_id: UserId) -> anyhow::Result<u32>;
    async fn deactivate_user(&self, user_id: UserId) -> anyhow::Result<()>;

    // Ledger. The entry append and balance update are one atomic step, and
    // applications for a single user are serialized.
    async fn apply_ledger(
        &self,
        user_id: UserId,
        delta: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> anyhow::Result<LedgerApply>;
    async fn balance(&self, user_id: UserId) -> anyhow::Result<i64>;
    async fn ledger_entries(&self, user_id: UserId) -> anyhow::Result<Vec<LedgerEntry>>;
    async fn entries_with_key_prefix(&self, prefix: &str) -> anyhow::Result<Vec<LedgerEntry>>;

    // Instances and bindings
    async fn upsert_instance(&self, instance: InstanceConfig) -> anyhow::Result<()>;
    async fn get_instance(&self, instance_id: InstanceId)
    -> anyhow::Result<Option<InstanceConfig>>;
    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceConfig>>;
    async fn put_binding(&self, binding_id: &str, instance_id: InstanceId) -> anyhow::Result<()>;
    async fn remove_binding(&self, binding_id: &str) -> anyhow::Result<bool>;
    async fn get_binding(&self, binding_id: &str) -> anyhow::Result<Option<InstanceId>>;
    async fn list_bindings(&self) -> anyhow::Result<Vec<(String, InstanceId)>>;

    // Requests
    async fn insert_request(&self, record: RequestRecord) -> anyhow::Result<()>;
    async fn get_request(&self, request_id: &str) -> anyhow::Result<Option<RequestRecord>>;
    /// Compare-and-set state transition; returns false when the stored state
    /// no longer matches `expected`. This is the per-request gate that keeps
    /// ledger finalization and concurrent deciders mutually exclusive.
    async fn transition_request(
        &self,
        record: RequestRecord,
        expected: RequestState,
    ) -> anyhow::Result<bool>;
    async fn requests_in_state(&self, state: RequestState) -> anyhow::Result<Vec<RequestRecord>>;
    async fn find_request_by_media(
        &self,
        external_id: i64,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<RequestRecord>>;

    // Library accounts
    async fn insert_account(&self, account: LibraryAccount) -> anyhow::Result<()>;
    async fn update_account(&self, account: LibraryAccount) -> anyhow::Result<()>;
    async fn get_account(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<LibraryAccount>>;
    async fn list_accounts(&self) -> anyhow::Result<Vec<LibraryAccount>>;

    // Access codes
    async fn insert_code(&self, code: AccessCode) -> anyhow::Result<()>;
    /// Atomically marks an unused, unexpired code as consumed by `user_id`.
    /// Returns `None` when the code is missing, already used or expired.
    async fn consume_code(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<AccessCode>>;
    /// Rolls a reservation back after a failed redemption.
    async fn restore_code(&self, code: &str) -> anyhow::Result<()>;
    async fn prune_codes(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;

    // Webhook delivery dedup; first writer wins.
    async fn record_delivery(&self, delivery_id: &str, now: DateTime<Utc>)
    -> anyhow::Result<bool>;
    async fn prune_deliveries(&self, before: DateTime<Utc>) -> anyhow::Result<u64>;
}
