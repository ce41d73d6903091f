use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{AccountError, CatalogError};
use crate::types::{InstanceId, MediaCandidate, MediaIdentity, MediaKind};

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

/// What the dedup lookup found in a backend's library or queue. A failed
/// lookup is an error, never `Absent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogPresence {
    Present,
    PartiallyPresent(String),
    Absent,
}

#[derive(Debug, Clone)]
pub struct SubmitProfile {
    pub quality_profile_id: i64,
    pub root_folder: String,
}

#[async_trait]
pub trait MediaBackend: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<MediaCandidate>, CatalogError>;
    async fn exists(&self, identity: &MediaIdentity) -> Result<CatalogPresence, CatalogError>;
    async fn submit(
        &self,
        identity: &MediaIdentity,
        profile: &SubmitProfile,
    ) -> Result<(), CatalogError>;
}

#[derive(Debug, Clone)]
pub struct ProvisionedUser {
    pub remote_id: String,
    pub password: String,
}

/// Account operations on a library server (Emby/Jellyfin style).
#[async_trait]
pub trait LibraryHost: Send + Sync {
    async fn create_user(&self, name: &str) -> Result<ProvisionedUser, AccountError>;
    async fn set_enabled(&self, remote_id: &str, enabled: bool) -> Result<(), AccountError>;
    async fn delete_user(&self, remote_id: &str) -> Result<(), AccountError>;
    async fn reset_password(&self, remote_id: &str) -> Result<String, AccountError>;
}

/// Routes an instance id to its live client. Populated at startup from the
/// instance table; read-mostly.
#[derive(Default)]
pub struct BackendRouter {
    schedulers: RwLock<HashMap<InstanceId, Arc<dyn MediaBackend>>>,
    hosts: RwLock<HashMap<InstanceId, Arc<dyn LibraryHost>>>,
}

impl BackendRouter {
    pub fn register_scheduler(&self, instance_id: InstanceId, backend: Arc<dyn MediaBackend>) {
        self.schedulers
            .write()
            .expect("router lock poisoned")
            .insert(instance_id, backend);
    }

    pub fn register_host(&self, instance_id: InstanceId, host: Arc<dyn LibraryHost>) {
        self.hosts
            .write()
            .expect("router lock poisoned")
            .insert(instance_id, host);
    }

    pub fn scheduler(&self, instance_id: InstanceId) -> Result<Arc<dyn MediaBackend>, CatalogError> {
        self.schedulers
            .read()
            .expect("router lock poisoned")
            .get(&instance_id)
            .cloned()
            .ok_or(CatalogError::NoClient(instance_id))
    }

    pub fn host(&self, instance_id: InstanceId) -> Option<Arc<dyn LibraryHost>> {
        self.hosts
            .read()
            .expect("router lock poisoned")
            .get(&instance_id)
            .cloned()
    }
}

/// Sonarr/Radarr-style HTTP client.
#[derive(Debug, Clone)]
pub struct ArrBackend {
    client: Client,
    base_url: String,
    api_key: String,
    media_kind: MediaKind,
}

impl ArrBackend {
    pub fn new(base_url: String, api_key: String, media_kind: MediaKind) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(BACKEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            media_kind,
        })
    }

    fn resource(&self) -> &'static str {
        match self.media_kind {
            MediaKind::Series => "series",
            MediaKind::Movie => "movie",
        }
    }

    async fn lookup_raw(&self, term: &str) -> Result<Vec<serde_json::Value>, CatalogError> {
        let url = format!("{}/api/v3/{}/lookup", self.base_url, self.resource());
        debug!(url = %url, term, "catalog lookup");
        let items = self
            .client
            .get(url)
            .query(&[("term", term)])
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|error| CatalogError::LookupFailed(error.to_string()))?
            .error_for_status()
            .map_err(|error| CatalogError::LookupFailed(error.to_string()))?
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|error| CatalogError::LookupFailed(error.to_string()))?;
        Ok(items)
    }

    async fn lookup(&self, term: &str) -> Result<Vec<ArrLookupItem>, CatalogError> {
        let items = self.lookup_raw(term).await?;
        items
            .into_iter()
            .map(|raw| {
                serde_json::from_value(raw)
                    .map_err(|error| CatalogError::LookupFailed(error.to_string()))
            })
            .collect()
    }

    fn external_term(&self, identity: &MediaIdentity) -> String {
        match self.media_kind {
            MediaKind::Series => format!("tvdb:{}", identity.external_id),
            MediaKind::Movie => format!("tmdb:{}", identity.external_id),
        }
    }

    fn candidate(&self, item: &ArrLookupItem) -> MediaCandidate {
        MediaCandidate {
            identity: MediaIdentity {
                kind: self.media_kind,
                external_id: match self.media_kind {
                    MediaKind::Series => item.tvdb_id.unwrap_or_default(),
                    MediaKind::Movie => item.tmdb_id.unwrap_or_default(),
                },
                title: item.title.clone(),
                localized_title: None,
            },
            year: item.year,
            overview: item.overview.clone().unwrap_or_default(),
            poster_url: item.remote_poster.clone(),
        }
    }
}

#[async_trait]
impl MediaBackend for ArrBackend {
    async fn search(&self, query: &str) -> Result<Vec<MediaCandidate>, CatalogError> {
        let items = self.lookup(query).await?;
        Ok(items
            .iter()
            .filter(|item| match self.media_kind {
                MediaKind::Series => item.tvdb_id.unwrap_or_default() > 0,
                MediaKind::Movie => item.tmdb_id.unwrap_or_default() > 0,
            })
            .map(|item| self.candidate(item))
            .collect())
    }

    async fn exists(&self, identity: &MediaIdentity) -> Result<CatalogPresence, CatalogError> {
        let items = self.lookup(&self.external_term(identity)).await?;
        let Some(item) = items.first() else {
            return Ok(CatalogPresence::Absent);
        };
        // A backend-local id means the title is already managed there.
        if item.id.unwrap_or_default() == 0 {
            return Ok(CatalogPresence::Absent);
        }
        if let Some(stats) = &item.statistics {
            let have = stats.episode_file_count.unwrap_or_default();
            let want = stats.episode_count.unwrap_or_default();
            if want > 0 && have < want {
                return Ok(CatalogPresence::PartiallyPresent(format!(
                    "{have}/{want} episodes on disk"
                )));
            }
        }
        Ok(CatalogPresence::Present)
    }

    async fn submit(
        &self,
        identity: &MediaIdentity,
        profile: &SubmitProfile,
    ) -> Result<(), CatalogError> {
        let items = self.lookup_raw(&self.external_term(identity)).await?;
        let Some(mut payload) = items.into_iter().next() else {
            return Err(CatalogError::SubmitFailed(format!(
                "no metadata for external id {}",
                identity.external_id
            )));
        };

        payload["qualityProfileId"] = profile.quality_profile_id.into();
        payload["rootFolderPath"] = profile.root_folder.clone().into();
        payload["monitored"] = true.into();

        let url = format!("{}/api/v3/{}", self.base_url, self.resource());
        self.client
            .post(url)
            .header("X-Api-Key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| CatalogError::SubmitFailed(error.to_string()))?
            .error_for_status()
            .map_err(|error| {
                warn!(?error, external_id = identity.external_id, "backend rejected submit");
                CatalogError::SubmitFailed(error.to_string())
            })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ArrLookupItem {
    title: String,
    #[serde(default)]
    id: Option<i64>,
    #[serde(default, rename = "tvdbId")]
    tvdb_id: Option<i64>,
    #[serde(default, rename = "tmdbId")]
    tmdb_id: Option<i64>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    overview: Option<String>,
    #[serde(default, rename = "remotePoster")]
    remote_poster: Option<String>,
    #[serde(default)]
    statistics: Option<ArrStatistics>,
}

#[derive(Debug, Clone, Deserialize)]
struct ArrStatistics {
    #[serde(default, rename = "episodeFileCount")]
    episode_file_count: Option<i64>,
    #[serde(default, rename = "episodeCount")]
    episode_count: Option<i64>,
}

/// Emby-style library server client.
#[derive(Debug, Clone)]
pub struct EmbyHost {
    client: Client,
    base_url: String,
    api_key: String,
}

impl EmbyHost {
    pub fn new(base_url: String, api_key: String) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(BACKEND_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    fn generated_password() -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..12)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect()
    }

    async fn set_password(&self, remote_id: &str, password: &str) -> Result<(), AccountError> {
        let url = format!("{}/Users/{}/Password", self.base_url, remote_id);
        self.client
            .post(url)
            .header("X-Emby-Token", &self.api_key)
            .json(&serde_json::json!({ "NewPw": password, "ResetPassword": false }))
            .send()
            .await
            .map_err(|error| AccountError::Provisioning(error.to_string()))?
            .error_for_status()
            .map_err(|error| AccountError::Provisioning(error.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct NewEmbyUser<'a> {
    #[serde(rename = "Name")]
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbyUser {
    #[serde(rename = "Id")]
    id: String,
}

#[async_trait]
impl LibraryHost for EmbyHost {
    async fn create_user(&self, name: &str) -> Result<ProvisionedUser, AccountError> {
        let url = format!("{}/Users/New", self.base_url);
        let user = self
            .client
            .post(url)
            .header("X-Emby-Token", &self.api_key)
            .json(&NewEmbyUser { name })
            .send()
            .await
            .map_err(|error| AccountError::Provisioning(error.to_string()))?
            .error_for_status()
            .map_err(|error| AccountError::Provisioning(error.to_string()))?
            .json::<EmbyUser>()
            .await
            .map_err(|error| AccountError::Provisioning(error.to_string()))?;

        let password = Self::generated_password();
        self.set_password(&user.id, &password).await?;
        Ok(ProvisionedUser {
            remote_id: user.id,
            password,
        })
    }

    async fn set_enabled(&self, remote_id: &str, enabled: bool) -> Result<(), AccountError> {
        let url = format!("{}/Users/{}/Policy", self.base_url, remote_id);
        self.client
            .post(url)
            .header("X-Emby-Token", &self.api_key)
            .json(&serde_json::json!({ "IsDisabled": !enabled }))
            .send()
            .await
            .map_err(|error| AccountError::Provisioning(error.to_string()))?
            .error_for_status()
            .map_err(|error| AccountError::Provisioning(error.to_string()))?;
        Ok(())
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), AccountError> {
        let url = format!("{}/Users/{}", self.base_url, remote_id);
        self.client
            .delete(url)
            .header("X-Emby-Token", &self.api_key)
            .send()
            .await
            .map_err(|error| AccountError::Provisioning(error.to_string()))?
            .error_for_status()
            .map_err(|error| AccountError::Provisioning(error.to_string()))?;
        Ok(())
    }

    async fn reset_password(&self, remote_id: &str) -> Result<String, AccountError> {
        let password = Self::generated_password();
        self.set_password(remote_id, &password).await?;
        Ok(password)
    }
}

/// Scripted backend used in tests and when no real instance is configured.
#[derive(Default)]
pub struct MockBackend {
    pub search_results: std::sync::Mutex<Vec<MediaCandidate>>,
    pub presence: std::sync::Mutex<Option<CatalogPresence>>,
    pub fail_lookup: std::sync::atomic::AtomicBool,
    pub fail_exists: std::sync::atomic::AtomicBool,
    pub fail_submit: std::sync::atomic::AtomicBool,
    pub submitted: std::sync::Mutex<Vec<MediaIdentity>>,
}

impl MockBackend {
    pub fn with_results(results: Vec<MediaCandidate>) -> Self {
        Self {
            search_results: std::sync::Mutex::new(results),
            presence: std::sync::Mutex::new(Some(CatalogPresence::Absent)),
            ..Self::default()
        }
    }

    pub fn set_presence(&self, presence: CatalogPresence) {
        *self.presence.lock().expect("mock lock poisoned") = Some(presence);
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    async fn search(&self, query: &str) -> Result<Vec<MediaCandidate>, CatalogError> {
        if self.fail_lookup.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CatalogError::LookupFailed("mock offline".to_owned()));
        }
        let results = self.search_results.lock().expect("mock lock poisoned");
        Ok(results
            .iter()
            .filter(|candidate| {
                candidate
                    .identity
                    .title
                    .to_lowercase()
                    .contains(&query.to_lowercase())
                    || query.is_empty()
            })
            .cloned()
            .collect())
    }

    async fn exists(&self, _identity: &MediaIdentity) -> Result<CatalogPresence, CatalogError> {
        if self.fail_lookup.load(std::sync::atomic::Ordering::Relaxed)
            || self.fail_exists.load(std::sync::atomic::Ordering::Relaxed)
        {
            return Err(CatalogError::LookupFailed("mock offline".to_owned()));
        }
        Ok(self
            .presence
            .lock()
            .expect("mock lock poisoned")
            .clone()
            .unwrap_or(CatalogPresence::Absent))
    }

    async fn submit(
        &self,
        identity: &MediaIdentity,
        _profile: &SubmitProfile,
    ) -> Result<(), CatalogError> {
        if self.fail_submit.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CatalogError::SubmitFailed("mock offline".to_owned()));
        }
        self.submitted
            .lock()
            .expect("mock lock poisoned")
            .push(identity.clone());
        Ok(())
    }
}

/// Scripted library host for tests.
#[derive(Default)]
pub struct MockHost {
    pub created: std::sync::Mutex<Vec<String>>,
    pub deleted: std::sync::Mutex<Vec<String>>,
    pub disabled: std::sync::Mutex<Vec<String>>,
    pub fail_create: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl LibraryHost for MockHost {
    async fn create_user(&self, name: &str) -> Result<ProvisionedUser, AccountError> {
        if self.fail_create.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(AccountError::Provisioning("mock offline".to_owned()));
        }
        self.created
            .lock()
            .expect("mock lock poisoned")
            .push(name.to_owned());
        Ok(ProvisionedUser {
            remote_id: format!("remote-{name}"),
            password: "hunter2-initial".to_owned(),
        })
    }

    async fn set_enabled(&self, remote_id: &str, enabled: bool) -> Result<(), AccountError> {
        if !enabled {
            self.disabled
                .lock()
                .expect("mock lock poisoned")
                .push(remote_id.to_owned());
        }
        Ok(())
    }

    async fn delete_user(&self, remote_id: &str) -> Result<(), AccountError> {
        self.deleted
            .lock()
            .expect("mock lock poisoned")
            .push(remote_id.to_owned());
        Ok(())
    }

    async fn reset_password(&self, _remote_id: &str) -> Result<String, AccountError> {
        Ok("hunter2-reset".to_owned())
    }
}
