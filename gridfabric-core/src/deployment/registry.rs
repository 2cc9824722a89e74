//! Registry of deployed resources. The store publishes every deployment
//! here; undeploys arrive back through the unregister listener.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::deployment::error::DeploymentError;
use crate::deployment::loader::{ResourceDef, ResourceLoader, same_loader};

/// A resource registered together with the loader that owns it.
#[derive(Debug, Clone)]
pub struct RegisteredResource {
    /// The resource definition.
    pub def: ResourceDef,
    /// Loader the resource was registered by.
    pub loader: Arc<dyn ResourceLoader>,
}

/// Callback invoked when a loader's last resource is unregistered.
pub type UnregisterListener = Box<dyn Fn(Arc<dyn ResourceLoader>) + Send + Sync>;

/// Pluggable resource registry.
pub trait DeploymentRegistry: Send + Sync {
    /// Registers a resource under its name and alias. Re-registering the
    /// same name with a different loader is refused.
    fn register(
        &self,
        loader: &Arc<dyn ResourceLoader>,
        def: &ResourceDef,
    ) -> Result<(), DeploymentError>;

    /// Looks a registered resource up by name or alias.
    fn find_resource(&self, name: &str) -> Option<RegisteredResource>;

    /// Unregisters the resource with the given name along with every other
    /// resource owned by the same loader, then fires the listener once.
    fn unregister(&self, name: &str) -> bool;

    /// Installs or clears the unregister listener.
    fn set_listener(&self, listener: Option<UnregisterListener>);
}

/// In-process registry implementation.
#[derive(Default)]
pub struct LocalDeploymentRegistry {
    entries: DashMap<String, RegisteredResource>,
    listener: Mutex<Option<UnregisterListener>>,
}

impl LocalDeploymentRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeploymentRegistry for LocalDeploymentRegistry {
    fn register(
        &self,
        loader: &Arc<dyn ResourceLoader>,
        def: &ResourceDef,
    ) -> Result<(), DeploymentError> {
        let mut keys = vec![def.name.clone()];
        if let Some(alias) = &def.alias
            && alias != &def.name
        {
            keys.push(alias.clone());
        }

        for key in &keys {
            if let Some(existing) = self.entries.get(key)
                && !same_loader(&existing.loader, loader)
            {
                return Err(DeploymentError::AlreadyRegistered(key.clone()));
            }
        }
        for key in keys {
            self.entries.insert(key, RegisteredResource {
                def: def.clone(),
                loader: Arc::clone(loader),
            });
        }
        debug!(name = %def.name, "registered resource");
        Ok(())
    }

    fn find_resource(&self, name: &str) -> Option<RegisteredResource> {
        self.entries.get(name).map(|entry| entry.clone())
    }

    fn unregister(&self, name: &str) -> bool {
        let Some((_, removed)) = self.entries.remove(name) else {
            return false;
        };

        let loader = removed.loader;
        let orphaned: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| same_loader(&entry.value().loader, &loader))
            .map(|entry| entry.key().clone())
            .collect();
        for key in orphaned {
            self.entries.remove(&key);
        }

        debug!(name, "unregistered resource and its loader");
        if let Some(listener) = &*self.listener.lock() {
            listener(loader);
        }
        true
    }

    fn set_listener(&self, listener: Option<UnregisterListener>) {
        *self.listener.lock() = listener;
    }
}

impl std::fmt::Debug for LocalDeploymentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDeploymentRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::loader::LocalResourceLoader;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn loader() -> Arc<dyn ResourceLoader> {
        Arc::new(LocalResourceLoader::default())
    }

    #[test]
    fn duplicate_name_with_different_loader_is_refused() {
        let registry = LocalDeploymentRegistry::new();
        let first = loader();
        let second = loader();
        let def = ResourceDef::class("jobs::Mapper");

        registry.register(&first, &def).expect("first register");
        // Same loader may re-register freely.
        registry.register(&first, &def).expect("re-register");
        assert_eq!(
            registry.register(&second, &def),
            Err(DeploymentError::AlreadyRegistered("jobs::Mapper".to_owned()))
        );
    }

    #[test]
    fn unregister_sweeps_the_whole_loader_and_fires_once() {
        let registry = LocalDeploymentRegistry::new();
        let owner = loader();
        registry
            .register(&owner, &ResourceDef::task("jobs::A").with_alias("a"))
            .expect("register a");
        registry
            .register(&owner, &ResourceDef::class("jobs::B"))
            .expect("register b");

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        registry.set_listener(Some(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(registry.unregister("jobs::A"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(registry.find_resource("a").is_none());
        assert!(registry.find_resource("jobs::B").is_none());
        assert!(!registry.unregister("jobs::A"));
    }
}
