use std::sync::Arc;

use tracing::info;

use crate::error::RegistryError;
use crate::store::Store;
use crate::types::{InstanceConfig, InstanceId, UserProfile};

/// Maps logical bindings (chat buttons, library tags) to backend instances.
/// Resolution never falls back to a default: an unbound id is a
/// configuration error the caller must surface.
#[derive(Clone)]
pub struct InstanceRegistry {
    store: Arc<dyn Store>,
}

impl InstanceRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, binding_id: &str) -> Result<InstanceConfig, RegistryError> {
        let instance_id = self
            .store
            .get_binding(binding_id)
            .await?
            .ok_or_else(|| RegistryError::NotBound(binding_id.to_owned()))?;
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(RegistryError::UnknownInstance(instance_id))
    }

    pub async fn register_instance(
        &self,
        actor: &UserProfile,
        instance: InstanceConfig,
    ) -> Result<(), RegistryError> {
        if !actor.is_admin {
            return Err(RegistryError::NotAdmin);
        }
        info!(instance_id = instance.instance_id, name = %instance.name, "instance registered");
        self.store.upsert_instance(instance).await?;
        Ok(())
    }

    /// Overwrites any previous binding; rebinding is replacement, not merge.
    pub async fn bind(
        &self,
        actor: &UserProfile,
        binding_id: &str,
        instance_id: InstanceId,
    ) -> Result<(), RegistryError> {
        if !actor.is_admin {
            return Err(RegistryError::NotAdmin);
        }
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(RegistryError::UnknownInstance(instance_id))?;
        self.store.put_binding(binding_id, instance_id).await?;
        info!(binding_id, instance_id, "binding updated");
        Ok(())
    }

    pub async fn unbind(
        &self,
        actor: &UserProfile,
        binding_id: &str,
    ) -> Result<bool, RegistryError> {
        if !actor.is_admin {
            return Err(RegistryError::NotAdmin);
        }
        Ok(self.store.remove_binding(binding_id).await?)
    }

    pub async fn bindings(&self) -> Result<Vec<(String, InstanceConfig)>, RegistryError> {
        let mut resolved = Vec::new();
        for (binding_id, instance_id) in self.store.list_bindings().await? {
            if let Some(instance) = self.store.get_instance(instance_id).await? {
                resolved.push((binding_id, instance));
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::error::RegistryError;
    use crate::store::{InMemoryStore, Store};
    use crate::types::{InstanceConfig, InstanceKind, MediaKind};

    use super::InstanceRegistry;

    fn scheduler_config(instance_id: i64, name: &str) -> InstanceConfig {
        InstanceConfig {
            instance_id,
            name: name.to_owned(),
            base_url: "http://localhost:8989".to_owned(),
            api_key: "key".to_owned(),
            webhook_token: "token".to_owned(),
            kind: InstanceKind::DownloadScheduler {
                media_kind: MediaKind::Series,
                quality_profile_id: 1,
                root_folder: "/tv".to_owned(),
            },
        }
    }

    async fn admin(store: &InMemoryStore) -> crate::types::UserProfile {
        store.set_admin(99, true).await.expect("set admin");
        store.get_or_create_user(99).await.expect("user")
    }

    #[tokio::test]
    async fn unbound_binding_is_an_error_not_a_default() {
        let store = Arc::new(InMemoryStore::default());
        let registry = InstanceRegistry::new(store);
        let err = registry.resolve("anime").await.expect_err("unbound");
        assert!(matches!(err, RegistryError::NotBound(id) if id == "anime"));
    }

    #[tokio::test]
    async fn bind_requires_admin_and_overwrites() {
        let store = Arc::new(InMemoryStore::default());
        let registry = InstanceRegistry::new(store.clone());
        let admin = admin(&store).await;
        let member = store.get_or_create_user(1).await.expect("user");

        registry
            .register_instance(&admin, scheduler_config(10, "sonarr-a"))
            .await
            .expect("register");
        registry
            .register_instance(&admin, scheduler_config(11, "sonarr-b"))
            .await
            .expect("register");

        let err = registry.bind(&member, "anime", 10).await.expect_err("member");
        assert!(matches!(err, RegistryError::NotAdmin));

        registry.bind(&admin, "anime", 10).await.expect("bind");
        assert_eq!(registry.resolve("anime").await.expect("resolve").instance_id, 10);

        registry.bind(&admin, "anime", 11).await.expect("rebind");
        assert_eq!(registry.resolve("anime").await.expect("resolve").instance_id, 11);
    }

    #[tokio::test]
    async fn binding_to_unknown_instance_is_rejected() {
        let store = Arc::new(InMemoryStore::default());
        let registry = InstanceRegistry::new(store.clone());
        let admin = admin(&store).await;
        let err = registry.bind(&admin, "anime", 42).await.expect_err("bind");
        assert!(matches!(err, RegistryError::UnknownInstance(42)));
    }
}
