use std::{env, net::SocketAddr};

use chrono::Duration;

use crate::settings::EngineSettings;
use crate::types::{InstanceConfig, InstanceId, UserId};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub http_bind: SocketAddr,
    pub database_url: Option<String>,
    pub instances: Vec<InstanceConfig>,
    pub bindings: Vec<(String, InstanceId)>,
    pub admin_ids: Vec<UserId>,
    pub settings: EngineSettings,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = env::var("PORT").unwrap_or_else(|_| "8080".to_owned());
        let http_bind = env::var("HTTP_BIND").unwrap_or_else(|_| format!("0.0.0.0:{port}"));
        let http_bind = http_bind.parse()?;

        // INSTANCES is a JSON array of instance configs, BINDINGS a JSON
        // object mapping binding id to instance id. Both survive restarts in
        // the store as well; the env copies are upserted at boot.
        let instances = match env::var("INSTANCES") {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => Vec::new(),
        };
        let bindings = match env::var("BINDINGS") {
            Ok(raw) => {
                let map: std::collections::HashMap<String, InstanceId> =
                    serde_json::from_str(&raw)?;
                map.into_iter().collect()
            }
            Err(_) => Vec::new(),
        };
        let admin_ids = env::var("ADMIN_IDS")
            .unwrap_or_default()
            .split(',')
            .filter_map(|raw| raw.trim().parse().ok())
            .collect();

        let defaults = EngineSettings::default();
        let settings = EngineSettings {
            request_cost: env_i64("REQUEST_COST", defaults.request_cost),
            approval_required: env_bool("APPROVAL_REQUIRED", defaults.approval_required),
            session_timeout: Duration::seconds(env_i64(
                "SESSION_TIMEOUT_SECS",
                defaults.session_timeout.num_seconds(),
            )),
            register_cost: env_i64("REGISTER_COST", defaults.register_cost),
            renew_cost: env_i64("RENEW_COST", defaults.renew_cost),
            check_in_reward: env_i64("CHECK_IN_REWARD", defaults.check_in_reward),
            ..defaults
        };

        Ok(Self {
            http_bind,
            database_url: env::var("DATABASE_URL").ok(),
            instances,
            bindings,
            admin_ids,
            settings,
        })
    }
}

fn env_i64(name: &str, default: i64) -> i64 {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .map(|raw| matches!(raw.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}
