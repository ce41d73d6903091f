use std::sync::Arc;

use seekarr::{
    accounts::AccountLifecycle,
    approval::ApprovalWorkflow,
    catalog::{ArrBackend, BackendRouter, EmbyHost},
    config::AppConfig,
    conversation::RequestFlow,
    http::{self, AppState},
    ledger::{ActivityTracker, CreditLedger},
    notify::{ChannelNotifier, Notifier},
    reconciler::EventReconciler,
    registry::InstanceRegistry,
    settings::StaticSettings,
    store::{InMemoryStore, PostgresStore, Store},
    types::InstanceKind,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;

    let store = build_store(&config).await?;
    seed_store(&config, store.clone()).await?;
    let backends = build_backends(&config)?;
    let settings = Arc::new(StaticSettings::new(config.settings.clone()));

    let (notifier, mut events) = ChannelNotifier::pair();
    let notifier: Arc<dyn Notifier> = Arc::new(notifier);
    // The chat transport's delivery loop attaches here; until one does,
    // events land in the log.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(kind = ?event.kind, user_id = ?event.user_id, request_id = ?event.request_id, "notification");
        }
    });

    let ledger = CreditLedger::new(store.clone());
    let registry = InstanceRegistry::new(store.clone());
    let tracker = Arc::new(ActivityTracker::new(store.clone(), ledger.clone()));
    let approvals = Arc::new(ApprovalWorkflow::new(
        store.clone(),
        ledger.clone(),
        backends.clone(),
        settings.clone(),
        notifier.clone(),
    ));
    let accounts = Arc::new(AccountLifecycle::new(
        store.clone(),
        ledger.clone(),
        backends.clone(),
        settings.clone(),
        notifier.clone(),
    ));
    let reconciler = Arc::new(EventReconciler::new(store.clone(), notifier.clone()));
    let flow = Arc::new(RequestFlow::new(
        store,
        ledger,
        registry,
        backends,
        approvals.clone(),
        tracker.clone(),
        settings,
    ));

    spawn_fast_sweeper(flow.clone(), approvals);
    spawn_slow_sweeper(accounts, reconciler.clone(), tracker);

    let app = http::router(AppState { flow, reconciler });
    let listener = TcpListener::bind(config.http_bind).await?;
    info!("seekarr listening on {}", config.http_bind);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn Store>> {
    if let Some(database_url) = &config.database_url {
        let store = PostgresStore::connect(database_url).await?;
        info!("connected to Postgres store");
        Ok(Arc::new(store))
    } else {
        warn!("DATABASE_URL not set; using in-memory store, state is lost on restart");
        Ok(Arc::new(InMemoryStore::default()))
    }
}

async fn seed_store(config: &AppConfig, store: Arc<dyn Store>) -> anyhow::Result<()> {
    for instance in &config.instances {
        store.upsert_instance(instance.clone()).await?;
    }
    for (binding_id, instance_id) in &config.bindings {
        store.put_binding(binding_id, *instance_id).await?;
    }
    for user_id in &config.admin_ids {
        store.set_admin(*user_id, true).await?;
    }
    Ok(())
}

fn build_backends(config: &AppConfig) -> anyhow::Result<Arc<BackendRouter>> {
    let backends = Arc::new(BackendRouter::default());
    for instance in &config.instances {
        match &instance.kind {
            InstanceKind::DownloadScheduler { media_kind, .. } => {
                let backend = ArrBackend::new(
                    instance.base_url.clone(),
                    instance.api_key.clone(),
                    *media_kind,
                )?;
                backends.register_scheduler(instance.instance_id, Arc::new(backend));
            }
            InstanceKind::LibraryServer { .. } => {
                let host = EmbyHost::new(instance.base_url.clone(), instance.api_key.clone())?;
                backends.register_host(instance.instance_id, Arc::new(host));
            }
        }
    }
    Ok(backends)
}

fn spawn_fast_sweeper(flow: Arc<RequestFlow>, approvals: Arc<ApprovalWorkflow>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            tick.tick().await;
            flow.sweep_timeouts().await;
            if let Err(error) = approvals.sweep_expired().await {
                warn!(%error, "approval expiry sweep failed");
            }
            if let Err(error) = approvals.sweep_stuck_holds().await {
                warn!(%error, "stuck hold sweep failed");
            }
        }
    });
}

fn spawn_slow_sweeper(
    accounts: Arc<AccountLifecycle>,
    reconciler: Arc<EventReconciler>,
    tracker: Arc<ActivityTracker>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tick.tick().await;
            if let Err(error) = accounts.sweep_expired().await {
                warn!(%error, "account expiry sweep failed");
            }
            if let Err(error) = accounts.prune_codes().await {
                warn!(%error, "code prune failed");
            }
            let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
            if let Err(error) = reconciler.prune_deliveries(cutoff).await {
                warn!(%error, "delivery prune failed");
            }
            let period = chrono::Utc::now().format("%Y-%m-%d-%H").to_string();
            match tracker.settle(&period).await {
                Ok(awarded) if !awarded.is_empty() => {
                    info!(users = awarded.len(), "activity settled");
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "activity settlement failed"),
            }
        }
    });
}
