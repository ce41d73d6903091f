use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::approval::{ApprovalWorkflow, Decision};
use crate::catalog::{BackendRouter, CatalogPresence};
use crate::error::{ApprovalError, LedgerError, RegistryError};
use crate::ledger::{ActivityTracker, CheckIn, CreditLedger};
use crate::registry::InstanceRegistry;
use crate::settings::SettingsSource;
use crate::store::Store;
use crate::types::{
    ApprovalDecision, Button, InstanceConfig, LedgerReason, MediaCandidate, MediaKind,
    OutboundMessage, RequestRecord, RequestState, UserId,
};

const MAX_CANDIDATES: usize = 5;

#[derive(Debug, Clone)]
enum SessionStep {
    Searching,
    Disambiguating { candidates: Vec<MediaCandidate> },
    Confirming { candidate: MediaCandidate },
}

#[derive(Debug, Clone)]
struct Session {
    binding_id: String,
    instance: InstanceConfig,
    step: SessionStep,
    last_activity: DateTime<Utc>,
}

impl Session {
    fn new(binding_id: String, instance: InstanceConfig) -> Self {
        Self {
            binding_id,
            instance,
            step: SessionStep::Searching,
            last_activity: Utc::now(),
        }
    }
}

type SessionSlot = Arc<Mutex<Option<Session>>>;

/// Destination for subtitle archives uploaded through the chat. Extraction
/// and import into the library live behind this seam.
#[async_trait]
pub trait SubtitleSink: Send + Sync {
    async fn attach(
        &self,
        user_id: UserId,
        kind: MediaKind,
        external_id: i64,
        file_ref: &str,
    ) -> anyhow::Result<()>;
}

/// Default sink: acknowledges the upload and leaves a log trail.
pub struct LoggingSubtitleSink;

#[async_trait]
impl SubtitleSink for LoggingSubtitleSink {
    async fn attach(
        &self,
        user_id: UserId,
        kind: MediaKind,
        external_id: i64,
        file_ref: &str,
    ) -> anyhow::Result<()> {
        info!(user_id, ?kind, external_id, file_ref, "subtitle received, no importer configured");
        Ok(())
    }
}

/// Drives the guided request conversation: one session per user, advanced by
/// text messages and button callbacks from the chat transport. The per-user
/// slot mutex is held for the whole handler, so a user's events are applied
/// one at a time; a fresh intent simply replaces whatever was in flight.
pub struct RequestFlow {
    store: Arc<dyn Store>,
    ledger: CreditLedger,
    registry: InstanceRegistry,
    backends: Arc<BackendRouter>,
    approvals: Arc<ApprovalWorkflow>,
    tracker: Arc<ActivityTracker>,
    settings: Arc<dyn SettingsSource>,
    subtitles: Arc<dyn SubtitleSink>,
    sessions: Mutex<HashMap<UserId, SessionSlot>>,
}

impl RequestFlow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        ledger: CreditLedger,
        registry: InstanceRegistry,
        backends: Arc<BackendRouter>,
        approvals: Arc<ApprovalWorkflow>,
        tracker: Arc<ActivityTracker>,
        settings: Arc<dyn SettingsSource>,
    ) -> Self {
        Self {
            store,
            ledger,
            registry,
            backends,
            approvals,
            tracker,
            settings,
            subtitles: Arc::new(LoggingSubtitleSink),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_subtitle_sink(mut self, sink: Arc<dyn SubtitleSink>) -> Self {
        self.subtitles = sink;
        self
    }

    /// A plain text message: slash commands, an active session's search
    /// query, or just chatter (which feeds the activity tracker).
    pub async fn on_user_text(
        &self,
        user_id: UserId,
        text: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let text = text.trim();
        if let Some(command) = text.strip_prefix('/') {
            return self.on_command(user_id, command).await;
        }

        let slot = self.session_slot(user_id).await;
        let mut guard = slot.lock().await;
        if let Some(session) = guard.as_mut() {
            if self.is_expired(session) {
                *guard = None;
                return Ok(vec![OutboundMessage::text(
                    "Your request session timed out. Tap a request button to start over.",
                )]);
            }
            session.last_activity = Utc::now();
            // Any text during a session is a (re)search; the latest query
            // always wins.
            return self.run_search(session, text).await;
        }
        drop(guard);

        let settings = self.settings.snapshot();
        match self.tracker.process_message(user_id, &settings).await? {
            Some(warning) => Ok(vec![OutboundMessage::text(format!(
                "Please slow down. Warning #{}, {} credits deducted (balance {}).",
                warning.warning_count, settings.spam_penalty, warning.balance
            ))]),
            None => Ok(Vec::new()),
        }
    }

    async fn on_command(
        &self,
        user_id: UserId,
        command: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        match command {
            "balance" => {
                let balance = self.ledger.balance(user_id).await?;
                Ok(vec![OutboundMessage::text(format!(
                    "Your balance is {balance} credits."
                ))])
            }
            "checkin" => {
                let settings = self.settings.snapshot();
                match self.ledger.check_in(user_id, Utc::now(), &settings).await {
                    Ok(CheckIn::Rewarded { amount, balance }) => {
                        Ok(vec![OutboundMessage::text(format!(
                            "Checked in: +{amount} credits (balance {balance})."
                        ))])
                    }
                    Ok(CheckIn::AlreadyToday { balance }) => {
                        Ok(vec![OutboundMessage::text(format!(
                            "Already checked in today (balance {balance})."
                        ))])
                    }
                    Err(LedgerError::Store(error)) => Err(error),
                    Err(error) => Ok(vec![OutboundMessage::text(error.to_string())]),
                }
            }
            "cancel" => {
                self.clear_session(user_id).await;
                Ok(vec![OutboundMessage::text("Request cancelled.")])
            }
            other => {
                debug!(user_id, command = other, "unknown command");
                Ok(vec![OutboundMessage::text(format!(
                    "Unknown command `/{other}`."
                ))])
            }
        }
    }

    /// A file uploaded mid-chat. Only subtitle archives named after their
    /// catalog id are accepted, `tvdb-<id>.zip` or `tmdb-<id>.zip`.
    pub async fn on_file_upload(
        &self,
        user_id: UserId,
        file_ref: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let file_name = file_ref.rsplit(['/', '\\']).next().unwrap_or(file_ref);
        let Some((kind, external_id)) = parse_subtitle_name(file_name) else {
            return Ok(vec![OutboundMessage::text(
                "Name the file tvdb-<id>.zip or tmdb-<id>.zip so it can be matched.",
            )]);
        };
        match self.subtitles.attach(user_id, kind, external_id, file_ref).await {
            Ok(()) => Ok(vec![OutboundMessage::text(format!(
                "Subtitle for {} {external_id} received.",
                match kind {
                    MediaKind::Series => "series",
                    MediaKind::Movie => "movie",
                }
            ))]),
            Err(error) => {
                warn!(user_id, external_id, %error, "subtitle attach failed");
                Ok(vec![OutboundMessage::text(
                    "Could not store the subtitle, try again later.",
                )])
            }
        }
    }

    /// A button callback. Request buttons carry `req:*` data, approval
    /// buttons `appr:*`; anything else is ignored with a shrug.
    pub async fn on_callback(
        &self,
        user_id: UserId,
        data: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        if let Some(binding_id) = data.strip_prefix("req:start:") {
            return self.start_session(user_id, binding_id).await;
        }
        if let Some(request_id) = data.strip_prefix("appr:ok:") {
            return self.on_decision(user_id, request_id, Decision::Approve).await;
        }
        if let Some(request_id) = data.strip_prefix("appr:no:") {
            return self.on_decision(user_id, request_id, Decision::Reject).await;
        }

        let slot = self.session_slot(user_id).await;
        let mut guard = slot.lock().await;
        let Some(session) = guard.as_mut() else {
            return Ok(vec![OutboundMessage::text(
                "No request in progress. Tap a request button to start.",
            )]);
        };
        if self.is_expired(session) {
            *guard = None;
            return Ok(vec![OutboundMessage::text(
                "Your request session timed out. Tap a request button to start over.",
            )]);
        }
        session.last_activity = Utc::now();

        match data {
            "req:cancel" => {
                *guard = None;
                Ok(vec![OutboundMessage::text("Request cancelled.")])
            }
            "req:confirm" => match &session.step {
                SessionStep::Confirming { .. } => {
                    let replies = self.confirm(user_id, session).await?;
                    *guard = None;
                    Ok(replies)
                }
                _ => Ok(vec![OutboundMessage::text(
                    "Nothing to confirm. Send a title to search.",
                )]),
            },
            _ => {
                if let Some(index) = data.strip_prefix("req:pick:") {
                    return self.pick(session, index).await;
                }
                debug!(user_id, data, "unrecognized callback");
                Ok(Vec::new())
            }
        }
    }

    async fn start_session(
        &self,
        user_id: UserId,
        binding_id: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let instance = match self.registry.resolve(binding_id).await {
            Ok(instance) => instance,
            Err(RegistryError::Store(error)) => return Err(error),
            Err(error) => return Ok(vec![OutboundMessage::text(error.to_string())]),
        };
        let name = instance.name.clone();
        let slot = self.session_slot(user_id).await;
        let mut guard = slot.lock().await;
        // Starting over replaces whatever was in flight.
        *guard = Some(Session::new(binding_id.to_owned(), instance));
        Ok(vec![OutboundMessage::text(format!(
            "Requesting on {name}. Send me a title to search for."
        ))])
    }

    async fn run_search(
        &self,
        session: &mut Session,
        query: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let backend = match self.backends.scheduler(session.instance.instance_id) {
            Ok(backend) => backend,
            Err(error) => return Ok(vec![OutboundMessage::text(error.to_string())]),
        };
        let mut candidates = match backend.search(query).await {
            Ok(candidates) => candidates,
            Err(error) => {
                return Ok(vec![OutboundMessage::text(format!(
                    "Search failed ({error}). Try again in a moment."
                ))]);
            }
        };
        candidates.truncate(MAX_CANDIDATES);

        match candidates.len() {
            0 => Ok(vec![OutboundMessage::text(format!(
                "No results for `{query}`. Try another title."
            ))]),
            1 => {
                let candidate = candidates.remove(0);
                self.enter_confirm(session, candidate).await
            }
            _ => {
                let mut buttons: Vec<Button> = candidates
                    .iter()
                    .enumerate()
                    .map(|(index, candidate)| {
                        Button::new(describe(candidate), format!("req:pick:{index}"))
                    })
                    .collect();
                buttons.push(Button::new("Cancel", "req:cancel"));
                session.step = SessionStep::Disambiguating { candidates };
                Ok(vec![OutboundMessage::with_buttons(
                    "Which one did you mean?",
                    buttons,
                )])
            }
        }
    }

    async fn pick(
        &self,
        session: &mut Session,
        index: &str,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let SessionStep::Disambiguating { candidates } = &session.step else {
            return Ok(vec![OutboundMessage::text(
                "Nothing to pick right now. Send a title to search.",
            )]);
        };
        let candidate = index
            .parse::<usize>()
            .ok()
            .and_then(|index| candidates.get(index).cloned());
        match candidate {
            Some(candidate) => self.enter_confirm(session, candidate).await,
            None => Ok(vec![OutboundMessage::text(
                "Pick one of the listed options.",
            )]),
        }
    }

    /// Dedup gate on the way into the confirm step: an active or already
    /// submitted request for the same title on the same instance ends the
    /// session without touching the ledger, as does a title the backend
    /// already carries. A failed availability lookup only adds a warning.
    async fn enter_confirm(
        &self,
        session: &mut Session,
        candidate: MediaCandidate,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        if let Some(existing) = self
            .store
            .find_request_by_media(candidate.identity.external_id, session.instance.instance_id)
            .await?
        {
            if !matches!(
                existing.state,
                RequestState::Rejected | RequestState::Cancelled
            ) {
                session.step = SessionStep::Searching;
                return Ok(vec![OutboundMessage::text(format!(
                    "{} was already requested ({}).",
                    candidate.identity.title,
                    existing.state.as_str()
                ))]);
            }
        }

        let backend = match self.backends.scheduler(session.instance.instance_id) {
            Ok(backend) => backend,
            Err(error) => return Ok(vec![OutboundMessage::text(error.to_string())]),
        };
        let mut lookup_warning = None;
        let mut partial_note = None;
        match backend.exists(&candidate.identity).await {
            Ok(CatalogPresence::Present) => {
                session.step = SessionStep::Searching;
                return Ok(vec![OutboundMessage::text(format!(
                    "{} is already in the library.",
                    candidate.identity.title
                ))]);
            }
            Ok(CatalogPresence::PartiallyPresent(detail)) => partial_note = Some(detail),
            Ok(CatalogPresence::Absent) => {}
            Err(error) => {
                lookup_warning = Some(format!("Could not verify availability: {error}."));
            }
        }

        let settings = self.settings.snapshot();
        let mut text = format!(
            "Request {} for {} credits?",
            describe(&candidate),
            settings.request_cost
        );
        if let Some(note) = partial_note {
            text.push_str(&format!("\nPartially available already: {note}."));
        }
        if let Some(warning) = lookup_warning {
            text.push('\n');
            text.push_str(&warning);
        }
        session.step = SessionStep::Confirming { candidate };
        Ok(vec![OutboundMessage::with_buttons(
            text,
            vec![
                Button::new("Confirm", "req:confirm"),
                Button::new("Cancel", "req:cancel"),
            ],
        )])
    }

    /// Places the hold and hands the request off: straight to the backend, or
    /// into the approval queue when approval is required.
    async fn confirm(
        &self,
        user_id: UserId,
        session: &Session,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let SessionStep::Confirming { candidate, .. } = &session.step else {
            return Ok(vec![OutboundMessage::text(
                "Nothing to confirm. Send a title to search.",
            )]);
        };
        let settings = self.settings.snapshot();
        let request_id = Uuid::new_v4().to_string();
        let hold_key = format!("req:{request_id}:hold");
        match self
            .ledger
            .debit(user_id, settings.request_cost, LedgerReason::RequestHold, &hold_key)
            .await
        {
            Ok(_) => {}
            Err(LedgerError::InsufficientFunds { balance, needed }) => {
                return Ok(vec![OutboundMessage::text(format!(
                    "Not enough credits: this request costs {needed}, you have {balance}."
                ))]);
            }
            Err(LedgerError::Store(error)) => return Err(error),
        }

        let now = Utc::now();
        let mut record = RequestRecord {
            request_id: request_id.clone(),
            user_id,
            media: candidate.identity.clone(),
            instance_id: session.instance.instance_id,
            binding_id: session.binding_id.clone(),
            state: RequestState::AwaitingApproval,
            hold_key: Some(hold_key),
            hold_amount: settings.request_cost,
            decision: ApprovalDecision::Pending,
            created_at: now,
            updated_at: now,
        };

        if settings.approval_required {
            self.approvals
                .submit_for_approval(record)
                .await
                .map_err(approval_to_anyhow)?;
            info!(user_id, request_id = %request_id, "request queued for approval");
            return Ok(vec![OutboundMessage::text(format!(
                "{} requested: {} credits held pending approval.",
                candidate.identity.title, settings.request_cost
            ))]);
        }

        record.state = RequestState::Submitting;
        record.decision = ApprovalDecision::NoneRequired;
        self.store.insert_request(record.clone()).await?;
        let finished = self.approvals.finish_submit(record).await?;
        match finished.state {
            RequestState::Submitted => Ok(vec![OutboundMessage::text(format!(
                "{} submitted: {} credits spent.",
                candidate.identity.title, settings.request_cost
            ))]),
            _ => Ok(vec![OutboundMessage::text(format!(
                "Submitting {} failed; your {} credits were refunded.",
                candidate.identity.title, settings.request_cost
            ))]),
        }
    }

    async fn on_decision(
        &self,
        user_id: UserId,
        request_id: &str,
        decision: Decision,
    ) -> anyhow::Result<Vec<OutboundMessage>> {
        let actor = self.store.get_or_create_user(user_id).await?;
        match self.approvals.decide(request_id, decision, &actor).await {
            Ok(record) => {
                let text = match record.state {
                    RequestState::Submitted | RequestState::Submitting => {
                        format!("Approved: {} submitted.", record.media.title)
                    }
                    RequestState::Rejected => {
                        format!("Rejected: {}, hold refunded.", record.media.title)
                    }
                    _ => format!(
                        "Approved, but submitting {} failed; the hold was refunded.",
                        record.media.title
                    ),
                };
                Ok(vec![OutboundMessage::text(text)])
            }
            Err(ApprovalError::Store(error)) => Err(error),
            Err(error) => Ok(vec![OutboundMessage::text(error.to_string())]),
        }
    }

    /// Drops sessions idle past the timeout. Run periodically; handlers also
    /// check at entry, so this only reclaims memory for users who walked away.
    pub async fn sweep_timeouts(&self) -> Vec<UserId> {
        let slots: Vec<(UserId, SessionSlot)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .map(|(user_id, slot)| (*user_id, slot.clone()))
                .collect()
        };
        let mut dropped = Vec::new();
        for (user_id, slot) in slots {
            let mut guard = slot.lock().await;
            match guard.as_ref() {
                Some(session) if self.is_expired(session) => {
                    *guard = None;
                    dropped.push(user_id);
                }
                Some(_) => {}
                None => {}
            }
        }
        if !dropped.is_empty() {
            let mut sessions = self.sessions.lock().await;
            for user_id in &dropped {
                if let Some(slot) = sessions.get(user_id) {
                    if slot.try_lock().map(|guard| guard.is_none()).unwrap_or(false) {
                        sessions.remove(user_id);
                    }
                }
            }
        }
        dropped
    }

    async fn session_slot(&self, user_id: UserId) -> SessionSlot {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn clear_session(&self, user_id: UserId) {
        let slot = self.session_slot(user_id).await;
        *slot.lock().await = None;
    }

    fn is_expired(&self, session: &Session) -> bool {
        session.last_activity + self.settings.snapshot().session_timeout < Utc::now()
    }
}

fn parse_subtitle_name(file_name: &str) -> Option<(MediaKind, i64)> {
    let lower = file_name.to_ascii_lowercase();
    let stem = lower.strip_suffix(".zip")?;
    let (prefix, id) = stem.split_once('-')?;
    let kind = match prefix {
        "tvdb" => MediaKind::Series,
        "tmdb" => MediaKind::Movie,
        _ => return None,
    };
    let external_id: i64 = id.parse().ok()?;
    (external_id > 0).then_some((kind, external_id))
}

fn describe(candidate: &MediaCandidate) -> String {
    match candidate.year {
        Some(year) => format!("{} ({year})", candidate.identity.title),
        None => candidate.identity.title.clone(),
    }
}

fn approval_to_anyhow(error: ApprovalError) -> anyhow::Error {
    match error {
        ApprovalError::Store(error) => error,
        other => anyhow::Error::new(other),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use crate::approval::ApprovalWorkflow;
    use crate::catalog::{BackendRouter, CatalogPresence, MockBackend};
    use crate::ledger::{ActivityTracker, CreditLedger};
    use crate::notify::RecordingNotifier;
    use crate::registry::InstanceRegistry;
    use crate::settings::{EngineSettings, StaticSettings};
    use crate::store::{InMemoryStore, Store};
    use crate::types::{
        InstanceConfig, InstanceKind, LedgerReason, MediaCandidate, MediaIdentity, MediaKind,
        RequestState,
    };

    use super::{RequestFlow, SubtitleSink};

    struct Rig {
        store: Arc<InMemoryStore>,
        ledger: CreditLedger,
        backend: Arc<MockBackend>,
        settings: Arc<StaticSettings>,
        flow: RequestFlow,
    }

    fn candidate(external_id: i64, title: &str, year: i32) -> MediaCandidate {
        MediaCandidate {
            identity: MediaIdentity {
                kind: MediaKind::Series,
                external_id,
                title: title.to_owned(),
                localized_title: None,
            },
            year: Some(year),
            overview: String::new(),
            poster_url: None,
        }
    }

    async fn rig_with(results: Vec<MediaCandidate>) -> Rig {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());
        let ledger = CreditLedger::new(store.clone());
        let backend = Arc::new(MockBackend::with_results(results));
        let backends = Arc::new(BackendRouter::default());
        backends.register_scheduler(10, backend.clone());
        store
            .upsert_instance(InstanceConfig {
                instance_id: 10,
                name: "sonarr".into(),
                base_url: "http://localhost:8989".into(),
                api_key: "key".into(),
                webhook_token: "token".into(),
                kind: InstanceKind::DownloadScheduler {
                    media_kind: MediaKind::Series,
                    quality_profile_id: 1,
                    root_folder: "/tv".into(),
                },
            })
            .await
            .expect("instance");
        store.put_binding("anime", 10).await.expect("binding");
        let settings = Arc::new(StaticSettings::new(EngineSettings::default()));
        let notifier = Arc::new(RecordingNotifier::default());
        let approvals = Arc::new(ApprovalWorkflow::new(
            store.clone(),
            ledger.clone(),
            backends.clone(),
            settings.clone(),
            notifier,
        ));
        let tracker = Arc::new(ActivityTracker::new(store.clone(), ledger.clone()));
        let registry = InstanceRegistry::new(store.clone());
        let flow = RequestFlow::new(
            store.clone(),
            ledger.clone(),
            registry,
            backends,
            approvals,
            tracker,
            settings.clone(),
        );
        Rig {
            store,
            ledger,
            backend,
            settings,
            flow,
        }
    }

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

    async fn pending_request_id(rig: &Rig) -> String {
        let pending = rig
            .store
            .requests_in_state(RequestState::AwaitingApproval)
            .await
            .expect("pending");
        assert_eq!(pending.len(), 1);
        pending[0].request_id.clone()
    }

    #[tokio::test]
    async fn hold_then_reject_restores_the_full_balance() {
        let rig = rig_with(vec![candidate(430047, "The Wandering Earth", 2019)]).await;
        seed(&rig, 1, 100).await;
        rig.store.set_admin(99, true).await.expect("admin");

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        let replies = rig
            .flow
            .on_user_text(1, "wandering earth")
            .await
            .expect("search");
        assert!(replies[0].text.contains("30 credits"));

        rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 70);

        let request_id = pending_request_id(&rig).await;
        rig.flow
            .on_callback(99, &format!("appr:no:{request_id}"))
            .await
            .expect("reject");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 100);
        let record = rig
            .store
            .get_request(&request_id)
            .await
            .expect("get")
            .expect("record");
        assert_eq!(record.state, RequestState::Rejected);
    }

    #[tokio::test]
    async fn title_already_in_library_ends_without_a_hold() {
        let rig = rig_with(vec![candidate(430047, "The Wandering Earth", 2019)]).await;
        seed(&rig, 1, 100).await;
        rig.backend.set_presence(CatalogPresence::Present);

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        let replies = rig
            .flow
            .on_user_text(1, "wandering earth")
            .await
            .expect("search");
        assert!(replies[0].text.contains("already in the library"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 100);
        assert!(rig.ledger.entries(1).await.expect("entries").len() == 1);
    }

    #[tokio::test]
    async fn active_duplicate_request_is_refused() {
        let rig = rig_with(vec![candidate(430047, "The Wandering Earth", 2019)]).await;
        seed(&rig, 1, 200).await;

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.flow.on_user_text(1, "wandering").await.expect("search");
        rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 170);

        rig.flow.on_callback(1, "req:start:anime").await.expect("restart");
        let replies = rig.flow.on_user_text(1, "wandering").await.expect("search");
        assert!(replies[0].text.contains("already requested"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 170);
    }

    #[tokio::test]
    async fn ambiguous_search_offers_a_pick_then_confirms() {
        let rig = rig_with(vec![
            candidate(1, "Dune", 2021),
            candidate(2, "Dune: Part Two", 2024),
        ])
        .await;
        seed(&rig, 1, 100).await;
        rig.settings.update(|settings| settings.approval_required = false);

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        let replies = rig.flow.on_user_text(1, "dune").await.expect("search");
        assert_eq!(replies[0].buttons.len(), 3);

        rig.flow.on_callback(1, "req:pick:1").await.expect("pick");
        let replies = rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert!(replies[0].text.contains("submitted"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 70);
        let submitted = rig.backend.submitted.lock().expect("mock");
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].external_id, 2);
    }

    #[tokio::test]
    async fn failed_submit_refunds_immediately() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 100).await;
        rig.settings.update(|settings| settings.approval_required = false);
        rig.backend
            .fail_submit
            .store(true, std::sync::atomic::Ordering::Relaxed);

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.flow.on_user_text(1, "dune").await.expect("search");
        let replies = rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert!(replies[0].text.contains("refunded"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 100);
    }

    #[tokio::test]
    async fn lookup_failure_warns_but_still_allows_the_request() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 100).await;

        rig.backend
            .fail_exists
            .store(true, std::sync::atomic::Ordering::Relaxed);
        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        let replies = rig.flow.on_user_text(1, "dune").await.expect("search");
        assert!(replies[0].text.contains("Request Dune"));
        assert!(replies[0].text.contains("Could not verify availability"));

        rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 70);
    }

    #[tokio::test]
    async fn insufficient_funds_leaves_no_record() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 10).await;

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.flow.on_user_text(1, "dune").await.expect("search");
        let replies = rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert!(replies[0].text.contains("Not enough credits"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 10);
        assert!(
            rig.store
                .requests_in_state(RequestState::AwaitingApproval)
                .await
                .expect("pending")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn a_new_intent_replaces_the_session_in_flight() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 100).await;

        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.flow.on_user_text(1, "dune").await.expect("search");
        // Mid-confirm, the user starts over. The old step is gone and no
        // hold was ever placed, so there is nothing to refund.
        rig.flow.on_callback(1, "req:start:anime").await.expect("restart");
        let replies = rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert!(replies[0].text.contains("Nothing to confirm"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 100);
    }

    #[tokio::test]
    async fn idle_sessions_expire() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 100).await;
        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.settings
            .update(|settings| settings.session_timeout = Duration::zero());

        let dropped = rig.flow.sweep_timeouts().await;
        assert_eq!(dropped, vec![1]);
        let replies = rig.flow.on_callback(1, "req:confirm").await.expect("confirm");
        assert!(replies[0].text.contains("No request in progress"));
    }

    #[derive(Default)]
    struct RecordingSubtitleSink {
        attached: std::sync::Mutex<Vec<(i64, MediaKind, i64)>>,
    }

    #[async_trait::async_trait]
    impl SubtitleSink for RecordingSubtitleSink {
        async fn attach(
            &self,
            user_id: i64,
            kind: MediaKind,
            external_id: i64,
            _file_ref: &str,
        ) -> anyhow::Result<()> {
            self.attached
                .lock()
                .expect("sink lock poisoned")
                .push((user_id, kind, external_id));
            Ok(())
        }
    }

    #[tokio::test]
    async fn subtitle_upload_is_routed_by_file_name() {
        let rig = rig_with(Vec::new()).await;
        let sink = Arc::new(RecordingSubtitleSink::default());
        let flow = rig.flow.with_subtitle_sink(sink.clone());

        let replies = flow
            .on_file_upload(7, "uploads/tvdb-842675.zip")
            .await
            .expect("upload");
        assert!(replies[0].text.contains("received"));
        assert_eq!(
            sink.attached.lock().expect("sink lock poisoned").as_slice(),
            &[(7, MediaKind::Series, 842675)]
        );

        // Anything that is not an id-named zip is turned away untouched.
        let replies = flow.on_file_upload(7, "notes.txt").await.expect("upload");
        assert!(replies[0].text.contains("tvdb-<id>.zip"));
        assert_eq!(sink.attached.lock().expect("sink lock poisoned").len(), 1);
    }

    #[tokio::test]
    async fn non_admin_cannot_decide() {
        let rig = rig_with(vec![candidate(1, "Dune", 2021)]).await;
        seed(&rig, 1, 100).await;
        rig.flow.on_callback(1, "req:start:anime").await.expect("start");
        rig.flow.on_user_text(1, "dune").await.expect("search");
        rig.flow.on_callback(1, "req:confirm").await.expect("confirm");

        let request_id = pending_request_id(&rig).await;
        let replies = rig
            .flow
            .on_callback(1, &format!("appr:ok:{request_id}"))
            .await
            .expect("decide");
        assert!(replies[0].text.contains("admin"));
        assert_eq!(rig.ledger.balance(1).await.expect("balance"), 70);
    }
}
