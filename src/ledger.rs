use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::settings::EngineSettings;
use crate::store::{LedgerApply, Store};
use crate::types::{LedgerEntry, LedgerReason, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOutcome {
    Applied(i64),
    /// Idempotency key was seen before; carries the balance recorded by the
    /// original application.
    Duplicate(i64),
}

impl LedgerOutcome {
    pub fn balance(self) -> i64 {
        match self {
            LedgerOutcome::Applied(balance) | LedgerOutcome::Duplicate(balance) => balance,
        }
    }
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn Store>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn debit(
        &self,
        user_id: UserId,
        amount: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.apply(user_id, -amount, reason, idempotency_key).await
    }

    pub async fn credit(
        &self,
        user_id: UserId,
        amount: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        self.apply(user_id, amount, reason, idempotency_key).await
    }

    async fn apply(
        &self,
        user_id: UserId,
        delta: i64,
        reason: LedgerReason,
        idempotency_key: &str,
    ) -> Result<LedgerOutcome, LedgerError> {
        let applied = self
            .store
            .apply_ledger(user_id, delta, reason, idempotency_key)
            .await?;
        match applied {
            LedgerApply::Applied(balance) => Ok(LedgerOutcome::Applied(balance)),
            LedgerApply::Duplicate(balance) => {
                debug!(user_id, idempotency_key, "duplicate ledger application ignored");
                Ok(LedgerOutcome::Duplicate(balance))
            }
            LedgerApply::Insufficient(balance) => Err(LedgerError::InsufficientFunds {
                balance,
                needed: delta.unsigned_abs() as i64,
            }),
        }
    }

    pub async fn balance(&self, user_id: UserId) -> anyhow::Result<i64> {
        self.store.balance(user_id).await
    }

    pub async fn entries(&self, user_id: UserId) -> anyhow::Result<Vec<LedgerEntry>> {
        self.store.ledger_entries(user_id).await
    }

    /// Net effect of all entries in one hold family: 0 when fully refunded,
    /// minus the hold amount when finalized exactly once.
    pub async fn hold_family_net(&self, request_id: &str) -> anyhow::Result<i64> {
        let prefix = format!("req:{request_id}:");
        let entries = self.store.entries_with_key_prefix(&prefix).await?;
        Ok(entries.iter().map(|entry| entry.delta).sum())
    }

    /// Daily check-in reward. The date-keyed idempotency key makes the
    /// second attempt of a day a duplicate, not a second credit.
    pub async fn check_in(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
        settings: &EngineSettings,
    ) -> Result<CheckIn, LedgerError> {
        let key = format!("checkin:{user_id}:{}", now.format("%Y-%m-%d"));
        match self
            .credit(user_id, settings.check_in_reward, LedgerReason::CheckIn, &key)
            .await?
        {
            LedgerOutcome::Applied(balance) => Ok(CheckIn::Rewarded {
                amount: settings.check_in_reward,
                balance,
            }),
            LedgerOutcome::Duplicate(balance) => Ok(CheckIn::AlreadyToday { balance }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckIn {
    Rewarded { amount: i64, balance: i64 },
    AlreadyToday { balance: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct SpamWarning {
    pub user_id: UserId,
    pub warning_count: u32,
    pub balance: i64,
}

#[derive(Debug, Default)]
struct TrackerState {
    last_user: UserId,
    consecutive: u32,
    message_counts: HashMap<UserId, u64>,
}

/// Tracks group chat activity: consecutive-message spam earns a warning and
/// a penalty debit, total activity is settled into rewards periodically.
pub struct ActivityTracker {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    state: Mutex<TrackerState>,
}

impl ActivityTracker {
    pub fn new(store: Arc<dyn Store>, ledger: CreditLedger) -> Self {
        Self {
            store,
            ledger,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub async fn process_message(
        &self,
        user_id: UserId,
        settings: &EngineSettings,
    ) -> anyhow::Result<Option<SpamWarning>> {
        let mut state = self.state.lock().await;
        if state.last_user != user_id {
            state.last_user = user_id;
            state.consecutive = 1;
            *state.message_counts.entry(user_id).or_insert(0) += 1;
            return Ok(None);
        }

        state.consecutive += 1;
        if state.consecutive <= settings.spam_threshold {
            return Ok(None);
        }
        // Reset so one burst is punished once.
        state.consecutive = 0;
        drop(state);

        let warning_count = self.store.add_warning(user_id).await?;
        let key = format!("spam:{user_id}:{warning_count}");
        let outcome = self
            .ledger
            .apply(user_id, -settings.spam_penalty, LedgerReason::SpamPenalty, &key)
            .await;
        let balance = match outcome {
            Ok(outcome) => outcome.balance(),
            // Penalties never go below zero; clamp to the current balance.
            Err(LedgerError::InsufficientFunds { balance, .. }) => {
                let drain = format!("spam:{user_id}:{warning_count}:drain");
                self.ledger
                    .apply(user_id, -balance, LedgerReason::SpamPenalty, &drain)
                    .await
                    .map(LedgerOutcome::balance)
                    .unwrap_or(0)
            }
            Err(LedgerError::Store(error)) => return Err(error),
        };
        Ok(Some(SpamWarning {
            user_id,
            warning_count,
            balance,
        }))
    }

    /// Settles accumulated activity into credits and clears the counters.
    /// Each user earns half their message count, floor one.
    pub async fn settle(&self, period: &str) -> anyhow::Result<Vec<(UserId, i64)>> {
        let counts = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.message_counts)
        };
        let mut awarded = Vec::with_capacity(counts.len());
        for (user_id, count) in counts {
            let amount = ((count / 2) as i64).max(1);
            let key = format!("settle:{period}:{user_id}");
            match self
                .ledger
                .credit(user_id, amount, LedgerReason::ActivityReward, &key)
                .await
            {
                Ok(LedgerOutcome::Applied(_)) => awarded.push((user_id, amount)),
                Ok(LedgerOutcome::Duplicate(_)) => {}
                Err(error) => {
                    // The counters were already taken; put this user's back
                    // so the next period settles the reward.
                    warn!(user_id, %error, "activity reward failed, count carried over");
                    let mut state = self.state.lock().await;
                    *state.message_counts.entry(user_id).or_insert(0) += count;
                }
            }
        }
        awarded.sort();
        Ok(awarded)
    }
}
