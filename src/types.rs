use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type InstanceId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Series,
    Movie,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Series => "series",
            MediaKind::Movie => "movie",
        }
    }

    pub fn parse(raw: &str) -> MediaKind {
        match raw {
            "movie" => MediaKind::Movie,
            _ => MediaKind::Series,
        }
    }
}

/// Identity of a title in the external catalog. Matching anywhere in the
/// engine is keyed on `external_id`, never on title text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaIdentity {
    pub kind: MediaKind,
    pub external_id: i64,
    pub title: String,
    pub localized_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaCandidate {
    pub identity: MediaIdentity,
    pub year: Option<i32>,
    pub overview: String,
    pub poster_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub balance: i64,
    pub warning_count: u32,
    pub is_admin: bool,
    pub deactivated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    RequestHold,
    RequestRefund,
    Registration,
    Renewal,
    CodeIssue,
    CheckIn,
    ActivityReward,
    SpamPenalty,
    AdminAdjust,
}

impl LedgerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerReason::RequestHold => "request-hold",
            LedgerReason::RequestRefund => "request-refund",
            LedgerReason::Registration => "registration",
            LedgerReason::Renewal => "renewal",
            LedgerReason::CodeIssue => "code-issue",
            LedgerReason::CheckIn => "check-in",
            LedgerReason::ActivityReward => "activity-reward",
            LedgerReason::SpamPenalty => "spam-penalty",
            LedgerReason::AdminAdjust => "admin-adjust",
        }
    }

    pub fn parse(raw: &str) -> LedgerReason {
        match raw {
            "request-hold" => LedgerReason::RequestHold,
            "request-refund" => LedgerReason::RequestRefund,
            "registration" => LedgerReason::Registration,
            "renewal" => LedgerReason::Renewal,
            "code-issue" => LedgerReason::CodeIssue,
            "check-in" => LedgerReason::CheckIn,
            "activity-reward" => LedgerReason::ActivityReward,
            "spam-penalty" => LedgerReason::SpamPenalty,
            _ => LedgerReason::AdminAdjust,
        }
    }

    /// Only admin adjustments may push a balance below zero.
    pub fn allows_negative(self) -> bool {
        matches!(self, LedgerReason::AdminAdjust)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub delta: i64,
    pub reason: LedgerReason,
    pub idempotency_key: String,
    pub balance_after: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DownloadScheduler,
    LibraryServer,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::DownloadScheduler => "scheduler",
            BackendKind::LibraryServer => "library",
        }
    }

    pub fn parse(raw: &str) -> Option<BackendKind> {
        match raw {
            "scheduler" => Some(BackendKind::DownloadScheduler),
            "library" => Some(BackendKind::LibraryServer),
            _ => None,
        }
    }
}

/// Kind-specific configuration payload for a backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstanceKind {
    DownloadScheduler {
        media_kind: MediaKind,
        quality_profile_id: i64,
        root_folder: String,
    },
    LibraryServer {
        term_days: i64,
    },
}

impl InstanceKind {
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            InstanceKind::DownloadScheduler { .. } => BackendKind::DownloadScheduler,
            InstanceKind::LibraryServer { .. } => BackendKind::LibraryServer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: InstanceId,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub webhook_token: String,
    pub kind: InstanceKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    AwaitingApproval,
    Submitting,
    Submitted,
    Rejected,
    Cancelled,
}

impl RequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestState::AwaitingApproval => "awaiting-approval",
            RequestState::Submitting => "submitting",
            RequestState::Submitted => "submitted",
            RequestState::Rejected => "rejected",
            RequestState::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> RequestState {
        match raw {
            "awaiting-approval" => RequestState::AwaitingApproval,
            "submitting" => RequestState::Submitting,
            "submitted" => RequestState::Submitted,
            "rejected" => RequestState::Rejected,
            _ => RequestState::Cancelled,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Submitted | RequestState::Rejected | RequestState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    NoneRequired,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalDecision::NoneRequired => "none-required",
            ApprovalDecision::Pending => "pending",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        }
    }

    pub fn parse(raw: &str) -> ApprovalDecision {
        match raw {
            "pending" => ApprovalDecision::Pending,
            "approved" => ApprovalDecision::Approved,
            "rejected" => ApprovalDecision::Rejected,
            _ => ApprovalDecision::NoneRequired,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub user_id: UserId,
    pub media: MediaIdentity,
    pub instance_id: InstanceId,
    pub binding_id: String,
    pub state: RequestState,
    pub hold_key: Option<String>,
    pub hold_amount: i64,
    pub decision: ApprovalDecision,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn refund_key(&self) -> String {
        format!("req:{}:refund", self.request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
    Revoked,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> AccountStatus {
        match raw {
            "active" => AccountStatus::Active,
            "expired" => AccountStatus::Expired,
            _ => AccountStatus::Revoked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryAccount {
    pub user_id: UserId,
    pub instance_id: InstanceId,
    pub remote_id: String,
    pub account_name: String,
    pub status: AccountStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeKind {
    Signup,
    Renew,
}

impl CodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CodeKind::Signup => "signup",
            CodeKind::Renew => "renew",
        }
    }

    pub fn parse(raw: &str) -> CodeKind {
        match raw {
            "renew" => CodeKind::Renew,
            _ => CodeKind::Signup,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessCode {
    pub code: String,
    pub kind: CodeKind,
    pub instance_id: InstanceId,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub used_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RequestSubmitted,
    ApprovalRequested,
    RequestApproved,
    RequestRejected,
    DownloadComplete,
    LibraryAdd,
    AccountExpired,
    AccountRevoked,
    Generic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub request_id: Option<String>,
    pub user_id: Option<UserId>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub data: String,
}

impl Button {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Abstract reply handed back to the chat transport. The engine never talks
/// to the transport directly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    pub buttons: Vec<Button>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(text: impl Into<String>, buttons: Vec<Button>) -> Self {
        Self {
            text: text.into(),
            buttons,
        }
    }
}
