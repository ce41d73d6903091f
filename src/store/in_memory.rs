use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::types::{
    AccessCode, InstanceConfig, InstanceId, LedgerEntry, LedgerReason, LibraryAccount,
    RequestRecord, RequestState, UserId, UserProfile,
};

use super::{LedgerApply, Store};

const DELIVERY_CACHE_CAP: usize = 4096;

#[derive(Debug, Default)]
struct LedgerBook {
    balances: HashMap<UserId, i64>,
    entries: Vec<LedgerEntry>,
    seen_keys: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct DeliveryCache {
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    users: RwLock<HashMap<UserId, UserProfile>>,
    ledger: Mutex<LedgerBook>,
    instances: RwLock<HashMap<InstanceId, InstanceConfig>>,
    bindings: RwLock<HashMap<String, InstanceId>>,
    requests: RwLock<HashMap<String, RequestRecord>>,
    accounts: RwLock<HashMap<(UserId, InstanceId), LibraryAccount>>,
    codes: RwLock<HashMap<String, AccessCode>>,
    deliveries: Mutex<DeliveryCache>,
}

fn blank_profile(user_id: UserId) -> UserProfile {
    UserProfile {
        user_id,
        balance: 0,
        warning_count: 0,
        is_admin: false,
        deactivated: false,
        created_at: Utc::now(),
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get_or_create_user(&self, user_id: UserId) -> anyhow::Result<UserProfile> {
        let balance = self
            .ledger
            .lock()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(0);
        let mut users = self.users.write().await;
        let profile = users.entry(user_id).or_insert_with(|| blank_profile(user_id));
        profile.balance = balance;
        Ok(profile.clone())
    }

    async fn set_admin(&self, user_id: UserId, is_admin: bool) -> anyhow::Result<()> {
        let mut users = self.users.write().await;
        users.entry(user_id).or_insert_with(|| blank_profile(user_id)).is_admin = is_admin;
        Ok(())
    }

    async fn add_warning(&self, user_id: UserId) -> anyhow::Result<u32> {
        let mut users = self.users.write().await;
        let profile = users.entry(user_id).or_insert_with(|| blank_profile(user_id));
        profile.warning_count += 1;
        Ok(profile.warning_count)
    }

    async fn deactivate_user(&self, user_id: UserId) -> anyhow::Result<()> {
        let mut users = self.users.write().await;
        users
            .entry(user_id)
            .or_insert_with(|| blank_profile(user_id))
            .deactivated = true;
        Ok(())
    }

    async fn apply_ledger(
        &self,
        user_id: UserId,
        delta: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> anyhow::Result<LedgerApply> {
        let mut book = self.ledger.lock().await;
        if let Some(prior) = book.seen_keys.get(idempotency_key) {
            return Ok(LedgerApply::Duplicate(*prior));
        }
        let balance = book.balances.get(&user_id).copied().unwrap_or(0);
        let next = balance + delta;
        if next < 0 && !reason.allows_negative() {
            return Ok(LedgerApply::Insufficient(balance));
        }
        book.balances.insert(user_id, next);
        book.seen_keys.insert(idempotency_key.to_owned(), next);
        book.entries.push(LedgerEntry {
            user_id,
            delta,
            reason,
            idempotency_key: idempotency_key.to_owned(),
            balance_after: next,
            timestamp: Utc::now(),
        });
        Ok(LedgerApply::Applied(next))
    }

    async fn balance(&self, user_id: UserId) -> anyhow::Result<i64> {
        Ok(self
            .ledger
            .lock()
            .await
            .balances
            .get(&user_id)
            .copied()
            .unwrap_or(0))
    }

    async fn ledger_entries(&self, user_id: UserId) -> anyhow::Result<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn entries_with_key_prefix(&self, prefix: &str) -> anyhow::Result<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.idempotency_key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn upsert_instance(&self, instance: InstanceConfig) -> anyhow::Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.instance_id, instance);
        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<InstanceConfig>> {
        Ok(self.instances.read().await.get(&instance_id).cloned())
    }

    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceConfig>> {
        let mut instances = self
            .instances
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        instances.sort_by_key(|instance| instance.instance_id);
        Ok(instances)
    }

    async fn put_binding(&self, binding_id: &str, instance_id: InstanceId) -> anyhow::Result<()> {
        self.bindings
            .write()
            .await
            .insert(binding_id.to_owned(), instance_id);
        Ok(())
    }

    async fn remove_binding(&self, binding_id: &str) -> anyhow::Result<bool> {
        Ok(self.bindings.write().await.remove(binding_id).is_some())
    }

    async fn get_binding(&self, binding_id: &str) -> anyhow::Result<Option<InstanceId>> {
        Ok(self.bindings.read().await.get(binding_id).copied())
    }

    async fn list_bindings(&self) -> anyhow::Result<Vec<(String, InstanceId)>> {
        let mut bindings = self
            .bindings
            .read()
            .await
            .iter()
            .map(|(binding_id, instance_id)| (binding_id.clone(), *instance_id))
            .collect::<Vec<_>>();
        bindings.sort();
        Ok(bindings)
    }

    async fn insert_request(&self, record: RequestRecord) -> anyhow::Result<()> {
        self.requests
            .write()
            .await
            .insert(record.request_id.clone(), record);
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> anyhow::Result<Option<RequestRecord>> {
        Ok(self.requests.read().await.get(request_id).cloned())
    }

    async fn transition_request(
        &self,
        record: RequestRecord,
        expected: RequestState,
    ) -> anyhow::Result<bool> {
        let mut requests = self.requests.write().await;
        match requests.get(&record.request_id) {
            Some(stored) if stored.state == expected => {
                requests.insert(record.request_id.clone(), record);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn requests_in_state(&self, state: RequestState) -> anyhow::Result<Vec<RequestRecord>> {
        let mut records = self
            .requests
            .read()
            .await
            .values()
            .filter(|record| record.state == state)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn find_request_by_media(
        &self,
        external_id: i64,
        instance_id: InstanceId,
    ) -> anyhow::Result<Option<RequestRecord>> {
        let requests = self.requests.read().await;
        let mut matches = requests
            .values()
            .filter(|record| {
                record.media.external_id == external_id && record.instance_id == instance_id
            })
            .cloned()
            .collect::<Vec<_>>();
        matches.sort_by_key(|record| std::cmp::Reverse(record.created_at));
        Ok(matches.into_iter().next())
    }

    async fn insert_account(&self, account: LibraryAccount) -> anyhow::Result<()> {
        self.accounts
            .write()
            .await
            .insert((account.user_id, account.instance_id), account);
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
        Ok(self
            .accounts
            .read()
            .await
            .get(&(user_id, instance_id))
            .cloned())
    }

    async fn list_accounts(&self) -> anyhow::Result<Vec<LibraryAccount>> {
        let mut accounts = self
            .accounts
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        accounts.sort_by_key(|account| (account.user_id, account.instance_id));
        Ok(accounts)
    }

    async fn insert_code(&self, code: AccessCode) -> anyhow::Result<()> {
        self.codes.write().await.insert(code.code.clone(), code);
        Ok(())
    }

    async fn consume_code(
        &self,
        code: &str,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<AccessCode>> {
        let mut codes = self.codes.write().await;
        match codes.get_mut(code) {
            Some(stored) if stored.used_at.is_none() && stored.expires_at > now => {
                stored.used_at = Some(now);
                stored.used_by = Some(user_id);
                Ok(Some(stored.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn restore_code(&self, code: &str) -> anyhow::Result<()> {
        let mut codes = self.codes.write().await;
        if let Some(stored) = codes.get_mut(code) {
            stored.used_at = None;
            stored.used_by = None;
        }
        Ok(())
    }

    async fn prune_codes(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut codes = self.codes.write().await;
        let initial = codes.len();
        codes.retain(|_, code| code.used_at.is_some() || code.expires_at >= before);
        Ok((initial - codes.len()) as u64)
    }

    async fn record_delivery(
        &self,
        delivery_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut cache = self.deliveries.lock().await;
        if cache.seen.contains_key(delivery_id) {
            return Ok(false);
        }
        cache.seen.insert(delivery_id.to_owned(), now);
        cache.order.push_back(delivery_id.to_owned());
        while cache.order.len() > DELIVERY_CACHE_CAP {
            if let Some(oldest) = cache.order.pop_front() {
                cache.seen.remove(&oldest);
            }
        }
        Ok(true)
    }

    async fn prune_deliveries(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut cache = self.deliveries.lock().await;
        let initial = cache.seen.len();
        cache.seen.retain(|_, seen_at| *seen_at >= before);
        let seen = std::mem::take(&mut cache.seen);
        cache.order.retain(|id| seen.contains_key(id));
        cache.seen = seen;
        Ok((initial - cache.seen.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::types::{AccessCode, CodeKind, LedgerReason};

    use super::super::{LedgerApply, Store};
    use super::InMemoryStore;

    #[tokio::test]
    async fn ledger_apply_is_idempotent_per_key() {
        let store = InMemoryStore::default();
        let first = store
            .apply_ledger(1, 50, LedgerReason::AdminAdjust, "k1")
            .await
            .expect("apply should succeed");
        assert_eq!(first, LedgerApply::Applied(50));

        let replay = store
            .apply_ledger(1, 50, LedgerReason::AdminAdjust, "k1")
            .await
            .expect("replay should succeed");
        assert_eq!(replay, LedgerApply::Duplicate(50));
        assert_eq!(store.balance(1).await.expect("balance"), 50);
        assert_eq!(store.ledger_entries(1).await.expect("entries").len(), 1);
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        store
            .insert_code(AccessCode {
                code: "ABC123".into(),
                kind: CodeKind::Signup,
                instance_id: 1,
                expires_at: now + Duration::days(30),
                used_at: None,
                used_by: None,
            })
            .await
            .expect("insert");

        let taken = store.consume_code("ABC123", 7, now).await.expect("consume");
        assert!(taken.is_some());
        let again = store.consume_code("ABC123", 8, now).await.expect("consume");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn delivery_dedup_first_writer_wins() {
        let store = InMemoryStore::default();
        let now = Utc::now();
        assert!(store.record_delivery("d-1", now).await.expect("record"));
        assert!(!store.record_delivery("d-1", now).await.expect("record"));
        assert!(store.record_delivery("d-2", now).await.expect("record"));
    }
}
