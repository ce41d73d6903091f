use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::catalog::{BackendRouter, SubmitProfile};
use crate::error::{ApprovalError, CatalogError};
use crate::ledger::CreditLedger;
use crate::notify::Notifier;
use crate::settings::SettingsSource;
use crate::store::Store;
use crate::types::{
    ApprovalDecision, InstanceKind, LedgerReason, NotificationEvent, NotificationKind,
    RequestRecord, RequestState, UserProfile,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

pub struct ApprovalWorkflow {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    backends: Arc<BackendRouter>,
    settings: Arc<dyn SettingsSource>,
    notifier: Arc<dyn Notifier>,
}

impl ApprovalWorkflow {
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

    /// Stores a held request awaiting an admin decision and alerts the
    /// admin channel.
    pub async fn submit_for_approval(&self, record: RequestRecord) -> Result<String, ApprovalError> {
        let request_id = record.request_id.clone();
        self.store.insert_request(record.clone()).await?;
        self.notifier
            .notify(NotificationEvent {
                kind: NotificationKind::ApprovalRequested,
                request_id: Some(request_id.clone()),
                user_id: Some(record.user_id),
                payload: json!({
                    "title": record.media.title,
                    "external_id": record.media.external_id,
                    "hold_amount": record.hold_amount,
                }),
            })
            .await
            .map_err(ApprovalError::Store)?;
        Ok(request_id)
    }

    pub async fn decide(
        &self,
        request_id: &str,
        decision: Decision,
        actor: &UserProfile,
    ) -> Result<RequestRecord, ApprovalError> {
        if !actor.is_admin {
            return Err(ApprovalError::NotAdmin);
        }
        let record = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| ApprovalError::UnknownRequest(request_id.to_owned()))?;

        match (record.state, decision) {
            (RequestState::AwaitingApproval, Decision::Approve) => {
                self.approve(record, actor).await
            }
            (RequestState::AwaitingApproval, Decision::Reject) => self.reject(record, actor).await,
            // Repeating an identical decision is a no-op.
            (RequestState::Submitted | RequestState::Submitting, Decision::Approve)
                if record.decision == ApprovalDecision::Approved =>
            {
                Ok(record)
            }
            (RequestState::Rejected, Decision::Reject) => Ok(record),
            (state, _) => Err(ApprovalError::AlreadyDecided {
                request_id: request_id.to_owned(),
                state,
            }),
        }
    }

    async fn approve(
        &self,
        mut record: RequestRecord,
        actor: &UserProfile,
    ) -> Result<RequestRecord, ApprovalError> {
        record.decision = ApprovalDecision::Approved;
        record.state = RequestState::Submitting;
        record.updated_at = Utc::now();
        // The CAS gate loses against a concurrent decision or refund.
        if !self
            .store
            .transition_request(record.clone(), RequestState::AwaitingApproval)
            .await?
        {
            let state = self
                .store
                .get_request(&record.request_id)
                .await?
                .map(|stored| stored.state)
                .unwrap_or(record.state);
            return Err(ApprovalError::AlreadyDecided {
                request_id: record.request_id,
                state,
            });
        }
        info!(request_id = %record.request_id, actor = actor.user_id, "request approved");
        Ok(self.finish_submit(record).await?)
    }

    async fn reject(
        &self,
        mut record: RequestRecord,
        actor: &UserProfile,
    ) -> Result<RequestRecord, ApprovalError> {
        record.decision = ApprovalDecision::Rejected;
        record.state = RequestState::Rejected;
        record.updated_at = Utc::now();
        if !self
            .store
            .transition_request(record.clone(), RequestState::AwaitingApproval)
            .await?
        {
            let state = self
                .store
                .get_request(&record.request_id)
                .await?
                .map(|stored| stored.state)
                .unwrap_or(record.state);
            return Err(ApprovalError::AlreadyDecided {
                request_id: record.request_id,
                state,
            });
        }
        self.refund_hold(&record).await?;
        info!(request_id = %record.request_id, actor = actor.user_id, "request rejected");
        self.notifier
            .notify(NotificationEvent {
                kind: NotificationKind::RequestRejected,
                request_id: Some(record.request_id.clone()),
                user_id: Some(record.user_id),
                payload: json!({ "title": record.media.title }),
            })
            .await
            .map_err(ApprovalError::Store)?;
        Ok(record)
    }

    /// Pushes a request in `Submitting` through the backend. On success the
    /// hold becomes the final debit; on failure it is refunded and the
    /// request cancelled.
    pub(crate) async fn finish_submit(
        &self,
        mut record: RequestRecord,
    ) -> anyhow::Result<RequestRecord> {
        let outcome = self.call_backend(&record).await;
        match outcome {
            Ok(()) => {
                record.state = RequestState::Submitted;
                record.updated_at = Utc::now();
                // A sweeper may have cancelled and refunded the request while
                // the backend call was in flight; the stored state wins.
                if !self
                    .store
                    .transition_request(record.clone(), RequestState::Submitting)
                    .await?
                {
                    let stored = self
                        .store
                        .get_request(&record.request_id)
                        .await?
                        .unwrap_or(record);
                    warn!(
                        request_id = %stored.request_id,
                        state = stored.state.as_str(),
                        "request was finalized elsewhere during submit"
                    );
                    return Ok(stored);
                }
                self.notifier
                    .notify(NotificationEvent {
                        kind: NotificationKind::RequestSubmitted,
                        request_id: Some(record.request_id.clone()),
                        user_id: Some(record.user_id),
                        payload: json!({
                            "title": record.media.title,
                            "external_id": record.media.external_id,
                        }),
                    })
                    .await?;
                Ok(record)
            }
            Err(error) => {
                warn!(request_id = %record.request_id, %error, "backend submit failed");
                record.state = RequestState::Cancelled;
                record.updated_at = Utc::now();
                if self
                    .store
                    .transition_request(record.clone(), RequestState::Submitting)
                    .await?
                {
                    self.refund_hold(&record).await?;
                }
                Ok(record)
            }
        }
    }

    async fn call_backend(&self, record: &RequestRecord) -> Result<(), CatalogError> {
        let instance = self
            .store
            .get_instance(record.instance_id)
            .await
            .map_err(|error| CatalogError::SubmitFailed(error.to_string()))?
            .ok_or(CatalogError::NoClient(record.instance_id))?;
        let InstanceKind::DownloadScheduler {
            quality_profile_id,
            root_folder,
            ..
        } = instance.kind
        else {
            return Err(CatalogError::NoClient(record.instance_id));
        };
        let backend = self.backends.scheduler(record.instance_id)?;
        backend
            .submit(
                &record.media,
                &SubmitProfile {
                    quality_profile_id,
                    root_folder,
                },
            )
            .await
    }

    /// Refund is keyed per request, so retries and racing sweepers apply it
    /// at most once.
    async fn refund_hold(&self, record: &RequestRecord) -> anyhow::Result<()> {
        if record.hold_key.is_none() || record.hold_amount == 0 {
            return Ok(());
        }
        self.ledger
            .credit(
                record.user_id,
                record.hold_amount,
                LedgerReason::RequestRefund,
                &record.refund_key(),
            )
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub async fn pending(&self) -> anyhow::Result<Vec<RequestRecord>> {
        self.store
            .requests_in_state(RequestState::AwaitingApproval)
            .await
    }

    /// Auto-rejects held requests older than the configured approval expiry.
    pub async fn sweep_expired(&self) -> anyhow::Result<Vec<RequestRecord>> {
        let settings = self.settings.snapshot();
        let Some(expiry) = settings.approval_expiry else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let mut expired = Vec::new();
        for mut record in self.pending().await? {
            if record.created_at + expiry > now {
                continue;
            }
            record.state = RequestState::Rejected;
            record.decision = ApprovalDecision::Rejected;
            record.updated_at = now;
            if self
                .store
                .transition_request(record.clone(), RequestState::AwaitingApproval)
                .await?
            {
                self.refund_hold(&record).await?;
                info!(request_id = %record.request_id, "approval expired, hold refunded");
                expired.push(record);
            }
        }
        Ok(expired)
    }

    /// Recovers holds stranded by a crash mid-submit: any request stuck in
    /// `Submitting` past the grace period is cancelled and refunded.
    pub async fn sweep_stuck_holds(&self) -> anyhow::Result<Vec<RequestRecord>> {
        let settings = self.settings.snapshot();
        let now = Utc::now();
        let mut recovered = Vec::new();
        for mut record in self.store.requests_in_state(RequestState::Submitting).await? {
            if record.updated_at + settings.hold_grace > now {
                continue;
            }
            record.state = RequestState::Cancelled;
            record.updated_at = now;
            if self
                .store
                .transition_request(record.clone(), RequestState::Submitting)
                .await?
            {
                self.refund_hold(&record).await?;
                warn!(request_id = %record.request_id, "stuck hold refunded");
                recovered.push(record);
            }
        }
        Ok(recovered)
    }
}
