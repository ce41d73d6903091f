use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::{BackendRouter, LibraryHost};
use crate::error::{AccountError, LedgerError};
use crate::ledger::CreditLedger;
use crate::notify::Notifier;
use crate::settings::SettingsSource;
use crate::store::Store;
use crate::types::{
    AccessCode, AccountStatus, CodeKind, InstanceId, InstanceKind, LedgerReason, LibraryAccount,
    NotificationEvent, NotificationKind, UserId, UserProfile,
};

/// A freshly provisioned account together with its one-time password. The
/// password is never stored; it only travels back to the user.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub account: LibraryAccount,
    pub password: String,
}

#[derive(Debug, Clone)]
pub enum CodeRedemption {
    Registered(NewAccount),
    Renewed(LibraryAccount),
}

#[derive(Debug, Default)]
pub struct ExpirySweep {
    pub disabled: Vec<LibraryAccount>,
    pub deleted: Vec<LibraryAccount>,
}

/// Manages media-library accounts: paid registration and renewal, code
/// redemption, and the sweeps that disable and eventually delete lapsed
/// accounts on the remote server.
pub struct AccountLifecycle {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    backends: Arc<BackendRouter>,
    settings: Arc<dyn SettingsSource>,
    notifier: Arc<dyn Notifier>,
}

impl AccountLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: CreditLedger,
        backends: Arc<BackendRouter>,
        settings: Arc<dyn SettingsSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            ledger,
            backends,
            settings,
            notifier,
        }
    }

    /// Credit-funded registration. An existing account is refused before the
    /// ledger is touched; the debit is refunded under a paired key if the
    /// remote call fails, so a retry can never double charge.
    pub async fn register(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> Result<NewAccount, AccountError> {
        let term_days = self.term_days(instance_id).await?;
        if let Some(existing) = self.store.get_account(user_id, instance_id).await? {
            if existing.status != AccountStatus::Revoked {
                return Err(AccountError::AlreadyRegistered);
            }
        }
        let settings = self.settings.snapshot();
        let key = format!("register:{user_id}:{}", Uuid::new_v4());
        self.ledger
            .debit(user_id, settings.register_cost, LedgerReason::Registration, &key)
            .await
            .map_err(ledger_to_account)?;
        match self.provision(user_id, instance_id, term_days).await {
            Ok(new_account) => Ok(new_account),
            Err(error) => {
                self.ledger
                    .credit(
                        user_id,
                        settings.register_cost,
                        LedgerReason::Registration,
                        &format!("{key}:refund"),
                    )
                    .await
                    .map_err(ledger_to_account)?;
                Err(error)
            }
        }
    }

    /// Credit-funded renewal. Refused while more than the renewal window of
    /// validity remains; an expired account is re-enabled on the remote side.
    pub async fn renew(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> Result<LibraryAccount, AccountError> {
        let term_days = self.term_days(instance_id).await?;
        let account = self.active_or_expired(user_id, instance_id).await?;
        let settings = self.settings.snapshot();
        if account.status == AccountStatus::Active {
            let days_left = (account.expires_at - Utc::now()).num_days();
            if days_left > settings.renew_window_days {
                return Err(AccountError::RenewTooEarly { days_left });
            }
        }
        let key = format!("renew:{user_id}:{}", Uuid::new_v4());
        self.ledger
            .debit(user_id, settings.renew_cost, LedgerReason::Renewal, &key)
            .await
            .map_err(ledger_to_account)?;
        match self.extend(account, term_days).await {
            Ok(account) => Ok(account),
            Err(error) => {
                self.ledger
                    .credit(
                        user_id,
                        settings.renew_cost,
                        LedgerReason::Renewal,
                        &format!("{key}:refund"),
                    )
                    .await
                    .map_err(ledger_to_account)?;
                Err(error)
            }
        }
    }

    /// Redeems a single-use code. The code is reserved atomically up front
    /// and put back if registration or renewal fails afterwards, so a code
    /// is only ever burned by a successful redemption.
    pub async fn redeem_code(
        &self,
        user_id: UserId,
        code: &str,
    ) -> Result<CodeRedemption, AccountError> {
        let reserved = self
            .store
            .consume_code(code, user_id, Utc::now())
            .await?
            .ok_or(AccountError::InvalidCode)?;
        let outcome = match reserved.kind {
            CodeKind::Signup => {
                let term_days = self.term_days(reserved.instance_id).await;
                match term_days {
                    Ok(term_days) => self
                        .provision(user_id, reserved.instance_id, term_days)
                        .await
                        .map(CodeRedemption::Registered),
                    Err(error) => Err(error),
                }
            }
            CodeKind::Renew => {
                let term_days = self.term_days(reserved.instance_id).await;
                match term_days {
                    Ok(term_days) => match self
                        .active_or_expired(user_id, reserved.instance_id)
                        .await
                    {
                        Ok(account) => {
                            self.extend(account, term_days).await.map(CodeRedemption::Renewed)
                        }
                        Err(error) => Err(error),
                    },
                    Err(error) => Err(error),
                }
            }
        };
        match outcome {
            Ok(redemption) => {
                info!(user_id, code, kind = ?reserved.kind, "code redeemed");
                Ok(redemption)
            }
            Err(error) => {
                self.store.restore_code(code).await?;
                Err(error)
            }
        }
    }

    /// Issues a fresh single-use code. Admins issue for free; members buy
    /// renewal codes at the renewal price.
    pub async fn generate_code(
        &self,
        actor: &UserProfile,
        instance_id: InstanceId,
        kind: CodeKind,
    ) -> Result<AccessCode, AccountError> {
        self.term_days(instance_id).await?;
        if !actor.is_admin && kind == CodeKind::Signup {
            return Err(AccountError::NotAdmin);
        }
        let settings = self.settings.snapshot();
        let code = new_code();
        if !actor.is_admin {
            self.ledger
                .debit(
                    actor.user_id,
                    settings.renew_cost,
                    LedgerReason::CodeIssue,
                    &format!("code:{code}"),
                )
                .await
                .map_err(ledger_to_account)?;
        }
        let access = AccessCode {
            code: code.clone(),
            kind,
            instance_id,
            expires_at: Utc::now() + Duration::days(settings.code_expiry_days),
            used_at: None,
            used_by: None,
        };
        if let Err(error) = self.store.insert_code(access.clone()).await {
            if !actor.is_admin {
                self.ledger
                    .credit(
                        actor.user_id,
                        settings.renew_cost,
                        LedgerReason::CodeIssue,
                        &format!("code:{code}:refund"),
                    )
                    .await
                    .map_err(ledger_to_account)?;
            }
            return Err(AccountError::Store(error));
        }
        Ok(access)
    }

    pub async fn reset_password(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> Result<String, AccountError> {
        let account = self.active_or_expired(user_id, instance_id).await?;
        if account.status != AccountStatus::Active {
            return Err(AccountError::NotRegistered);
        }
        self.host(instance_id)?.reset_password(&account.remote_id).await
    }

    /// Revokes accounts whose owners are no longer in `members`. Already
    /// revoked accounts are skipped, so re-running against the same roster
    /// is a no-op.
    pub async fn reconcile_membership(
        &self,
        members: &HashSet<UserId>,
    ) -> anyhow::Result<Vec<LibraryAccount>> {
        let mut revoked = Vec::new();
        for mut account in self.store.list_accounts().await? {
            if members.contains(&account.user_id) || account.status == AccountStatus::Revoked {
                continue;
            }
            if let Ok(host) = self.host(account.instance_id) {
                if let Err(error) = host.delete_user(&account.remote_id).await {
                    warn!(
                        user_id = account.user_id,
                        instance_id = account.instance_id,
                        %error,
                        "remote delete failed, will retry next pass"
                    );
                    continue;
                }
            }
            account.status = AccountStatus::Revoked;
            self.store.update_account(account.clone()).await?;
            self.store.deactivate_user(account.user_id).await?;
            self.notify(NotificationKind::AccountRevoked, &account).await?;
            info!(user_id = account.user_id, "account revoked: owner left");
            revoked.push(account);
        }
        Ok(revoked)
    }

    /// Two-phase lapse handling: an account past its expiry is disabled
    /// first, and only deleted after the grace window on top of that. Both
    /// phases retry harmlessly if a remote call fails mid-sweep.
    pub async fn sweep_expired(&self) -> anyhow::Result<ExpirySweep> {
        let settings = self.settings.snapshot();
        let now = Utc::now();
        let mut sweep = ExpirySweep::default();
        for mut account in self.store.list_accounts().await? {
            match account.status {
                AccountStatus::Active if account.expires_at <= now => {
                    if let Ok(host) = self.host(account.instance_id) {
                        if let Err(error) = host.set_enabled(&account.remote_id, false).await {
                            warn!(user_id = account.user_id, %error, "remote disable failed");
                            continue;
                        }
                    }
                    account.status = AccountStatus::Expired;
                    self.store.update_account(account.clone()).await?;
                    self.notify(NotificationKind::AccountExpired, &account).await?;
                    sweep.disabled.push(account);
                }
                AccountStatus::Expired
                    if account.expires_at + Duration::days(settings.delete_after_days) <= now =>
                {
                    if let Ok(host) = self.host(account.instance_id) {
                        if let Err(error) = host.delete_user(&account.remote_id).await {
                            warn!(user_id = account.user_id, %error, "remote delete failed");
                            continue;
                        }
                    }
                    account.status = AccountStatus::Revoked;
                    self.store.update_account(account.clone()).await?;
                    self.notify(NotificationKind::AccountRevoked, &account).await?;
                    sweep.deleted.push(account);
                }
                _ => {}
            }
        }
        Ok(sweep)
    }

    /// Drops long-expired unused codes.
    pub async fn prune_codes(&self) -> anyhow::Result<u64> {
        self.store.prune_codes(Utc::now()).await
    }

    async fn provision(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
        term_days: i64,
    ) -> Result<NewAccount, AccountError> {
        let existing = self.store.get_account(user_id, instance_id).await?;
        if let Some(existing) = &existing {
            if existing.status != AccountStatus::Revoked {
                return Err(AccountError::AlreadyRegistered);
            }
        }
        let host = self.host(instance_id)?;
        let account_name = format!("user-{user_id}");
        let provisioned = host.create_user(&account_name).await?;
        let now = Utc::now();
        let account = LibraryAccount {
            user_id,
            instance_id,
            remote_id: provisioned.remote_id,
            account_name,
            status: AccountStatus::Active,
            expires_at: now + Duration::days(term_days),
            created_at: now,
        };
        if existing.is_some() {
            self.store.update_account(account.clone()).await?;
        } else {
            self.store.insert_account(account.clone()).await?;
        }
        info!(user_id, instance_id, "library account provisioned");
        Ok(NewAccount {
            account,
            password: provisioned.password,
        })
    }

    /// Extends validity from whichever is later, now or the current expiry,
    /// so renewing early never shortens the term.
    async fn extend(
        &self,
        mut account: LibraryAccount,
        term_days: i64,
    ) -> Result<LibraryAccount, AccountError> {
        let now = Utc::now();
        if account.status == AccountStatus::Expired {
            self.host(account.instance_id)?
                .set_enabled(&account.remote_id, true)
                .await?;
        }
        let base = account.expires_at.max(now);
        account.expires_at = base + Duration::days(term_days);
        account.status = AccountStatus::Active;
        self.store.update_account(account.clone()).await?;
        info!(
            user_id = account.user_id,
            expires_at = %account.expires_at,
            "library account renewed"
        );
        Ok(account)
    }

    async fn active_or_expired(
        &self,
        user_id: UserId,
        instance_id: InstanceId,
    ) -> Result<LibraryAccount, AccountError> {
        let account = self
            .store
            .get_account(user_id, instance_id)
            .await?
            .ok_or(AccountError::NotRegistered)?;
        if account.status == AccountStatus::Revoked {
            return Err(AccountError::NotRegistered);
        }
        Ok(account)
    }

    async fn term_days(&self, instance_id: InstanceId) -> Result<i64, AccountError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(AccountError::UnknownInstance(instance_id))?;
        match instance.kind {
            InstanceKind::LibraryServer { term_days } => Ok(term_days),
            InstanceKind::DownloadScheduler { .. } => {
                Err(AccountError::NotLibraryServer(instance_id))
            }
        }
    }

    fn host(&self, instance_id: InstanceId) -> Result<Arc<dyn LibraryHost>, AccountError> {
        self.backends
            .host(instance_id)
            .ok_or_else(|| AccountError::Provisioning(format!("no client for instance {instance_id}")))
    }

    async fn notify(
        &self,
        kind: NotificationKind,
        account: &LibraryAccount,
    ) -> anyhow::Result<()> {
        self.notifier
            .notify(NotificationEvent {
                kind,
                request_id: None,
                user_id: Some(account.user_id),
                payload: json!({
                    "instance_id": account.instance_id,
                    "account_name": account.account_name,
                    "expires_at": account.expires_at,
                }),
            })
            .await
    }
}

fn ledger_to_account(error: LedgerError) -> AccountError {
    match error {
        LedgerError::InsufficientFunds { balance, needed } => {
            AccountError::InsufficientFunds { balance, needed }
        }
        LedgerError::Store(error) => AccountError::Store(error),
    }
}

fn new_code() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let mut group = || {
        (0..4)
            .map(|_| (rng.sample(rand::distributions::Alphanumeric) as char).to_ascii_lowercase())
            .collect::<String>()
    };
    let a = group();
    let b = group();
    let c = group();
    let d = group();
    format!("{a}-{b}-{c}-{d}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use crate::catalog::{BackendRouter, MockHost};
    use crate::error::AccountError;
    use crate::ledger::CreditLedger;
    use crate::notify::RecordingNotifier;
    use crate::settings::{EngineSettings, StaticSettings};
    use crate::store::{InMemoryStore, Store};
    use crate::types::{
        AccessCode, AccountStatus, CodeKind, InstanceConfig, InstanceKind, LedgerReason,
        NotificationKind,
    };

    use super::{AccountLifecycle, CodeRedemption};

    struct Rig {
        store: Arc<InMemoryStore>,
        ledger: CreditLedger,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
        accounts: AccountLifecycle,
    }

    async fn rig() -> Rig {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());
        let ledger = CreditLedger::new(store.clone());
        let host = Arc::new(MockHost::default());
        let backends = Arc::new(BackendRouter::default());
        backends.register_host(20, host.clone());
        store
            .upsert_instance(InstanceConfig {
                instance_id: 20,
                name: "emby".into(),
                base_url: "http://localhost:8096".into(),
                api_key: "key".into(),
                webhook_token: "token".into(),
                kind: InstanceKind::LibraryServer { term_days: 30 },
            })
            .await
            .expect("instance");
        let settings = Arc::new(StaticSettings::new(EngineSettings::default()));
        let notifier = Arc::new(RecordingNotifier::default());
        let accounts = AccountLifecycle::new(
            store.clone(),
            ledger.clone(),
            backends,
            settings,
            notifier.clone(),
        );
        Rig {
            store,
            ledger,
            host,
            notifier,
            accounts,
        }
    }

    // The idempotency-key namespace is global, so seeds are keyed per user.
    async fn seed(rig: &Rig, user_id: i64, amount: i64) {
        rig.ledger
            .credit(
                user_id,
                amount,
                LedgerReason::AdminAdjust,
                &format!("seed:{user_id}"),
            )
            .await
            .expect("seed");
    }

    fn signup_code(code: &str) -> AccessCode {
        AccessCode {
            code: code.to_owned(),
            kind: CodeKind::Signup,
            instance_id: 20,
            expires_at: Utc::now() + Duration::days(30),
            used_at: None,
            used_by: None,
        }
    }

    #[tokio::test]
    async fn paid_registration_debits_and_provisions() {
        let rig = rig().await;
        seed(&rig, 1, 300).await;

        let new_account = rig.accounts.register(1, 20).await.expect("register");
        assert_eq!(new_account.account.status, AccountStatus::Active);
        assert!(!new_account.password.is_empty());
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 0);

        // The balance is zero now; an existing account must still answer
        // AlreadyRegistered and leave the ledger alone.
        let err = rig.accounts.register(1, 20).await.expect_err("second");
        assert!(matches!(err, AccountError::AlreadyRegistered));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 0);
        assert_eq!(rig.ledger.entries(1).await.expect("entries").len(), 2);
    }

    #[tokio::test]
    async fn failed_provisioning_refunds_the_debit() {
        let rig = rig().await;
        seed(&rig, 1, 300).await;
        rig.host
            .fail_create
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let err = rig.accounts.register(1, 20).await.expect_err("provision");
        assert!(matches!(err, AccountError::Provisioning(_)));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 300);
        assert!(rig.store.get_account(1, 20).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn signup_code_is_single_use() {
        let rig = rig().await;
        rig.store
            .insert_code(signup_code("ab12-cd34-ef56-gh78"))
            .await
            .expect("code");

        let redeemed = rig
            .accounts
            .redeem_code(1, "ab12-cd34-ef56-gh78")
            .await
            .expect("redeem");
        assert!(matches!(redeemed, CodeRedemption::Registered(_)));
        // No credits involved.
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 0);

        let err = rig
            .accounts
            .redeem_code(2, "ab12-cd34-ef56-gh78")
            .await
            .expect_err("reuse");
        assert!(matches!(err, AccountError::InvalidCode));
    }

    #[tokio::test]
    async fn failed_redemption_puts_the_code_back() {
        let rig = rig().await;
        rig.store
            .insert_code(signup_code("ab12-cd34-ef56-gh78"))
            .await
            .expect("code");
        rig.host
            .fail_create
            .store(true, std::sync::atomic::Ordering::Relaxed);

        rig.accounts
            .redeem_code(1, "ab12-cd34-ef56-gh78")
            .await
            .expect_err("provisioning down");

        rig.host
            .fail_create
            .store(false, std::sync::atomic::Ordering::Relaxed);
        rig.accounts
            .redeem_code(1, "ab12-cd34-ef56-gh78")
            .await
            .expect("retry succeeds");
    }

    #[tokio::test]
    async fn renewal_is_refused_outside_the_window() {
        let rig = rig().await;
        seed(&rig, 1, 900).await;
        rig.accounts.register(1, 20).await.expect("register");

        let err = rig.accounts.renew(1, 20).await.expect_err("too early");
        assert!(matches!(err, AccountError::RenewTooEarly { days_left } if days_left > 7));

        // Pull the expiry into the window and renew for real.
        let mut account = rig
            .store
            .get_account(1, 20)
            .await
            .expect("get")
            .expect("account");
        account.expires_at = Utc::now() + Duration::days(3);
        rig.store.update_account(account).await.expect("update");

        let renewed = rig.accounts.renew(1, 20).await.expect("renew");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 300);
        let days_left = (renewed.expires_at - Utc::now()).num_days();
        assert!((32..=33).contains(&days_left), "days_left = {days_left}");
    }

    #[tokio::test]
    async fn renewing_an_expired_account_re_enables_it() {
        let rig = rig().await;
        seed(&rig, 1, 600).await;
        rig.accounts.register(1, 20).await.expect("register");
        let mut account = rig
            .store
            .get_account(1, 20)
            .await
            .expect("get")
            .expect("account");
        account.status = AccountStatus::Expired;
        account.expires_at = Utc::now() - Duration::days(2);
        rig.store.update_account(account).await.expect("update");

        let renewed = rig.accounts.renew(1, 20).await.expect("renew");
        assert_eq!(renewed.status, AccountStatus::Active);
        assert!(renewed.expires_at > Utc::now() + Duration::days(29));
    }

    #[tokio::test]
    async fn lapse_is_two_phase_disable_then_delete() {
        let rig = rig().await;
        seed(&rig, 1, 300).await;
        rig.accounts.register(1, 20).await.expect("register");
        let mut account = rig
            .store
            .get_account(1, 20)
            .await
            .expect("get")
            .expect("account");
        account.expires_at = Utc::now() - Duration::days(1);
        rig.store.update_account(account).await.expect("update");

        let first = rig.accounts.sweep_expired().await.expect("sweep");
        assert_eq!(first.disabled.len(), 1);
        assert!(first.deleted.is_empty());
        assert_eq!(rig.host.disabled.lock().expect("mock").len(), 1);

        // Not yet past the grace window: nothing more happens.
        let second = rig.accounts.sweep_expired().await.expect("sweep");
        assert!(second.disabled.is_empty());
        assert!(second.deleted.is_empty());

        let mut account = rig
            .store
            .get_account(1, 20)
            .await
            .expect("get")
            .expect("account");
        account.expires_at = Utc::now() - Duration::days(16);
        rig.store.update_account(account).await.expect("update");

        let third = rig.accounts.sweep_expired().await.expect("sweep");
        assert_eq!(third.deleted.len(), 1);
        assert_eq!(rig.host.deleted.lock().expect("mock").len(), 1);
        let kinds: Vec<NotificationKind> = rig
            .notifier
            .events()
            .into_iter()
            .map(|event| event.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::AccountExpired,
                NotificationKind::AccountRevoked
            ]
        );
    }

    #[tokio::test]
    async fn reconcile_revokes_departed_members_once() {
        let rig = rig().await;
        seed(&rig, 1, 300).await;
        seed(&rig, 2, 300).await;
        rig.accounts.register(1, 20).await.expect("register");
        rig.accounts.register(2, 20).await.expect("register");

        let members: HashSet<i64> = [1].into_iter().collect();
        let revoked = rig
            .accounts
            .reconcile_membership(&members)
            .await
            .expect("reconcile");
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].user_id, 2);
        assert_eq!(rig.host.deleted.lock().expect("mock").len(), 1);

        let again = rig
            .accounts
            .reconcile_membership(&members)
            .await
            .expect("reconcile");
        assert!(again.is_empty());
        assert_eq!(rig.host.deleted.lock().expect("mock").len(), 1);
    }

    #[tokio::test]
    async fn member_bought_renew_code_costs_credits() {
        let rig = rig().await;
        seed(&rig, 1, 300).await;
        let member = rig.store.get_or_create_user(1).await.expect("user");

        let code = rig
            .accounts
            .generate_code(&member, 20, CodeKind::Renew)
            .await
            .expect("generate");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 0);
        assert_eq!(code.code.len(), 19);

        let err = rig
            .accounts
            .generate_code(&member, 20, CodeKind::Signup)
            .await
            .expect_err("signup codes are admin-only");
        assert!(matches!(err, AccountError::NotAdmin));
    }
}
