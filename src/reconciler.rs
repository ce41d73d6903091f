use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::IngestError;
use crate::notify::Notifier;
use crate::store::Store;
use crate::types::{
    BackendKind, InstanceId, NotificationEvent, NotificationKind, RequestRecord,
};

#[derive(Debug)]
pub enum IngestOutcome {
    /// Event correlated with a tracked request.
    Matched(RequestRecord),
    /// Valid event for something the engine never requested.
    Unmatched,
    /// Replay of a delivery we already processed.
    Duplicate,
}

/// Sonarr/Radarr-style event body. Only the fields the engine correlates on
/// are parsed; everything else is ignored.
#[derive(Debug, Deserialize)]
struct SchedulerEvent {
    #[serde(rename = "eventType")]
    event_type: String,
    #[serde(rename = "downloadId")]
    download_id: Option<String>,
    series: Option<SchedulerItem>,
    movie: Option<SchedulerItem>,
}

#[derive(Debug, Deserialize)]
struct SchedulerItem {
    #[serde(rename = "tvdbId")]
    tvdb_id: Option<i64>,
    #[serde(rename = "tmdbId")]
    tmdb_id: Option<i64>,
    title: Option<String>,
}

/// Emby/Jellyfin-style event body.
#[derive(Debug, Deserialize)]
struct LibraryEvent {
    #[serde(rename = "Event")]
    event: String,
    #[serde(rename = "Item")]
    item: Option<LibraryItem>,
}

#[derive(Debug, Deserialize)]
struct LibraryItem {
    #[serde(rename = "Name")]
    name: Option<String>,
    #[serde(rename = "ProviderIds")]
    provider_ids: Option<HashMap<String, String>>,
}

struct ParsedEvent {
    event: String,
    external_id: Option<i64>,
    title: Option<String>,
    delivery_id: Option<String>,
}

/// Ingests backend webhook events: authenticates, deduplicates and
/// correlates them back to the request that caused them, then emits a
/// notification. Matching is by external id and instance, never title text.
pub struct EventReconciler {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

impl EventReconciler {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    pub async fn ingest(
        &self,
        kind: BackendKind,
        instance_id: InstanceId,
        token: &str,
        body: &[u8],
    ) -> Result<IngestOutcome, IngestError> {
        let instance = self
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(IngestError::UnknownInstance(instance_id))?;
        if !constant_time_eq(token, &instance.webhook_token) {
            return Err(IngestError::InvalidToken);
        }
        let expected = instance.kind.backend_kind();
        if expected != kind {
            return Err(IngestError::KindMismatch {
                instance_id,
                expected,
            });
        }

        let parsed = parse_event(kind, body)?;
        let delivery_id = parsed.delivery_id.clone().unwrap_or_else(|| {
            format!(
                "{instance_id}:{}:{}",
                parsed.event,
                parsed.external_id.unwrap_or(0)
            )
        });
        if !self.store.record_delivery(&delivery_id, Utc::now()).await? {
            debug!(instance_id, delivery_id, "duplicate delivery ignored");
            return Ok(IngestOutcome::Duplicate);
        }

        let matched = match parsed.external_id {
            Some(external_id) => {
                self.store
                    .find_request_by_media(external_id, instance_id)
                    .await?
            }
            None => None,
        };
        match matched {
            Some(record) => {
                let notify_kind = match kind {
                    BackendKind::DownloadScheduler => NotificationKind::DownloadComplete,
                    BackendKind::LibraryServer => NotificationKind::LibraryAdd,
                };
                info!(
                    instance_id,
                    request_id = %record.request_id,
                    event = %parsed.event,
                    "webhook matched request"
                );
                self.notifier
                    .notify(NotificationEvent {
                        kind: notify_kind,
                        request_id: Some(record.request_id.clone()),
                        user_id: Some(record.user_id),
                        payload: json!({
                            "event": parsed.event,
                            "title": record.media.title,
                        }),
                    })
                    .await?;
                Ok(IngestOutcome::Matched(record))
            }
            None => {
                self.notifier
                    .notify(NotificationEvent {
                        kind: NotificationKind::Generic,
                        request_id: None,
                        user_id: None,
                        payload: json!({
                            "event": parsed.event,
                            "instance_id": instance_id,
                            "title": parsed.title,
                        }),
                    })
                    .await?;
                Ok(IngestOutcome::Unmatched)
            }
        }
    }

    /// Drops dedup entries older than the retention cutoff.
    pub async fn prune_deliveries(
        &self,
        before: chrono::DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        self.store.prune_deliveries(before).await
    }
}

fn parse_event(kind: BackendKind, body: &[u8]) -> Result<ParsedEvent, IngestError> {
    match kind {
        BackendKind::DownloadScheduler => {
            let event: SchedulerEvent = serde_json::from_slice(body)
                .map_err(|error| IngestError::MalformedPayload(error.to_string()))?;
            let item = event.series.as_ref().or(event.movie.as_ref());
            Ok(ParsedEvent {
                external_id: item.and_then(|item| item.tvdb_id.or(item.tmdb_id)),
                title: item.and_then(|item| item.title.clone()),
                delivery_id: event.download_id.clone(),
                event: event.event_type,
            })
        }
        BackendKind::LibraryServer => {
            let event: LibraryEvent = serde_json::from_slice(body)
                .map_err(|error| IngestError::MalformedPayload(error.to_string()))?;
            let external_id = event.item.as_ref().and_then(|item| {
                let ids = item.provider_ids.as_ref()?;
                ids.get("Tvdb")
                    .or_else(|| ids.get("Tmdb"))
                    .and_then(|raw| raw.parse().ok())
            });
            Ok(ParsedEvent {
                external_id,
                title: event.item.and_then(|item| item.name),
                delivery_id: None,
                event: event.event,
            })
        }
    }
}

/// Comparison time depends only on the stored token's length.
fn constant_time_eq(candidate: &str, expected: &str) -> bool {
    let candidate = candidate.as_bytes();
    let expected = expected.as_bytes();
    let mut diff = u8::from(candidate.len() != expected.len());
    for (index, byte) in expected.iter().enumerate() {
        diff |= byte ^ candidate.get(index).copied().unwrap_or(0);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use serde_json::json;

    use crate::error::IngestError;
    use crate::notify::RecordingNotifier;
    use crate::store::{InMemoryStore, Store};
    use crate::types::{
        ApprovalDecision, BackendKind, InstanceConfig, InstanceKind, MediaIdentity, MediaKind,
        NotificationKind, RequestRecord, RequestState,
    };

    use super::{EventReconciler, IngestOutcome, constant_time_eq};

    struct Rig {
        store: Arc<InMemoryStore>,
        notifier: Arc<RecordingNotifier>,
        reconciler: EventReconciler,
    }

    async fn rig() -> Rig {
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::default());
        store
            .upsert_instance(InstanceConfig {
                instance_id: 10,
                name: "sonarr".into(),
                base_url: "http://localhost:8989".into(),
                api_key: "key".into(),
                webhook_token: "hook-token".into(),
                kind: InstanceKind::DownloadScheduler {
                    media_kind: MediaKind::Series,
                    quality_profile_id: 1,
                    root_folder: "/tv".into(),
                },
            })
            .await
            .expect("instance");
        let notifier = Arc::new(RecordingNotifier::default());
        let reconciler = EventReconciler::new(store.clone(), notifier.clone());
        Rig {
            store,
            notifier,
            reconciler,
        }
    }

    async fn submitted_request(store: &InMemoryStore, external_id: i64) -> RequestRecord {
        let now = Utc::now();
        let record = RequestRecord {
            request_id: "r-1".into(),
            user_id: 1,
            media: MediaIdentity {
                kind: MediaKind::Series,
                external_id,
                title: "The Wandering Earth".into(),
                localized_title: None,
            },
            instance_id: 10,
            binding_id: "anime".into(),
            state: RequestState::Submitted,
            hold_key: Some("req:r-1:hold".into()),
            hold_amount: 30,
            decision: ApprovalDecision::Approved,
            created_at: now,
            updated_at: now,
        };
        store.insert_request(record.clone()).await.expect("insert");
        record
    }

    fn download_event(external_id: i64, download_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "eventType": "Download",
            "downloadId": download_id,
            "series": { "tvdbId": external_id, "title": "The Wandering Earth" },
        }))
        .expect("encode")
    }

    #[tokio::test]
    async fn matched_event_notifies_the_requester() {
        let rig = rig().await;
        let record = submitted_request(&rig.store, 430047).await;

        let outcome = rig
            .reconciler
            .ingest(
                BackendKind::DownloadScheduler,
                10,
                "hook-token",
                &download_event(430047, "d-1"),
            )
            .await
            .expect("ingest");
        assert!(matches!(outcome, IngestOutcome::Matched(matched) if matched.request_id == record.request_id));

        let events = rig.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::DownloadComplete);
        assert_eq!(events[0].user_id, Some(1));
    }

    #[tokio::test]
    async fn replayed_delivery_notifies_exactly_once() {
        let rig = rig().await;
        submitted_request(&rig.store, 430047).await;
        let body = download_event(430047, "d-1");

        rig.reconciler
            .ingest(BackendKind::DownloadScheduler, 10, "hook-token", &body)
            .await
            .expect("first");
        let second = rig
            .reconciler
            .ingest(BackendKind::DownloadScheduler, 10, "hook-token", &body)
            .await
            .expect("second");
        assert!(matches!(second, IngestOutcome::Duplicate));
        assert_eq!(rig.notifier.events().len(), 1);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected_before_parsing() {
        let rig = rig().await;
        let err = rig
            .reconciler
            .ingest(BackendKind::DownloadScheduler, 10, "wrong", b"not json")
            .await
            .expect_err("token");
        assert!(matches!(err, IngestError::InvalidToken));
        assert!(rig.notifier.events().is_empty());
    }

    #[tokio::test]
    async fn malformed_body_is_an_error_not_a_crash() {
        let rig = rig().await;
        let err = rig
            .reconciler
            .ingest(BackendKind::DownloadScheduler, 10, "hook-token", b"{]")
            .await
            .expect_err("parse");
        assert!(matches!(err, IngestError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let rig = rig().await;
        let err = rig
            .reconciler
            .ingest(BackendKind::LibraryServer, 10, "hook-token", b"{}")
            .await
            .expect_err("kind");
        assert!(matches!(
            err,
            IngestError::KindMismatch {
                instance_id: 10,
                expected: BackendKind::DownloadScheduler
            }
        ));
    }

    #[tokio::test]
    async fn unrequested_title_still_produces_a_generic_event() {
        let rig = rig().await;
        let outcome = rig
            .reconciler
            .ingest(
                BackendKind::DownloadScheduler,
                10,
                "hook-token",
                &download_event(999, "d-9"),
            )
            .await
            .expect("ingest");
        assert!(matches!(outcome, IngestOutcome::Unmatched));
        let events = rig.notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, NotificationKind::Generic);
        assert_eq!(events[0].request_id, None);
    }

    #[test]
    fn token_compare_handles_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abd", "abc"));
        assert!(!constant_time_eq("ab", "abc"));
        assert!(!constant_time_eq("abcd", "abc"));
        assert!(!constant_time_eq("", "abc"));
    }
}
