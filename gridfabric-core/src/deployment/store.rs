//! Storage for local deployments: alias-indexed, loader-keyed records of
//! the code resources this node can run.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::GridContext;
use crate::deployment::DeploymentMode;
use crate::deployment::error::DeploymentError;
use crate::deployment::loader::{ResourceDef, ResourceLoader, same_loader};
use crate::deployment::registry::DeploymentRegistry;
use crate::event::{Event, EventPayload, EventType};

/// Lookup request for [`LocalDeploymentStore::get_deployment`].
#[derive(Clone)]
pub struct DeploymentMetadata {
    /// Alias the resource is requested by.
    pub alias: String,
    /// Full resource name, when the caller knows it and it differs from
    /// the alias.
    pub resource_name: Option<String>,
    /// Loader to auto-deploy through. Falls back to the grid system
    /// loader.
    pub loader: Option<Arc<dyn ResourceLoader>>,
    /// Whether to record deployment events for this request.
    pub record: bool,
}

impl DeploymentMetadata {
    /// Creates a lookup for an alias with event recording enabled.
    #[must_use]
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            resource_name: None,
            loader: None,
            record: true,
        }
    }

    /// Sets the full resource name.
    #[must_use]
    pub fn resource_name(mut self, name: impl Into<String>) -> Self {
        self.resource_name = Some(name.into());
        self
    }

    /// Sets the loader to auto-deploy through.
    #[must_use]
    pub fn loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.loader = Some(loader);
        self
    }
}

impl std::fmt::Debug for DeploymentMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentMetadata")
            .field("alias", &self.alias)
            .field("resource_name", &self.resource_name)
            .field("record", &self.record)
            .finish()
    }
}

/// A resource deployed under a specific alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedResource {
    /// The resource definition.
    pub def: ResourceDef,
    /// Alias it was deployed under.
    pub alias: String,
}

/// One deployment: a loader plus every (resource, alias) pair deployed
/// through it. At most one non-undeployed deployment exists per alias.
pub struct Deployment {
    mode: DeploymentMode,
    loader: Arc<dyn ResourceLoader>,
    loader_id: Uuid,
    user_version: String,
    primary_name: String,
    local: bool,
    undeployed: AtomicBool,
    released: AtomicBool,
    usages: AtomicUsize,
    entries: RwLock<Vec<DeployedResource>>,
}

impl Deployment {
    fn new(
        mode: DeploymentMode,
        loader: Arc<dyn ResourceLoader>,
        primary_name: String,
        local: bool,
    ) -> Self {
        let user_version = loader.user_version().to_owned();
        Self {
            mode,
            loader,
            loader_id: Uuid::new_v4(),
            user_version,
            primary_name,
            local,
            undeployed: AtomicBool::new(false),
            released: AtomicBool::new(false),
            usages: AtomicUsize::new(0),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Deployment mode this record was created with.
    #[must_use]
    pub const fn mode(&self) -> DeploymentMode {
        self.mode
    }

    /// The owning loader.
    #[must_use]
    pub const fn loader(&self) -> &Arc<dyn ResourceLoader> {
        &self.loader
    }

    /// Unique id of the owning loader, assigned at deploy time.
    #[must_use]
    pub const fn loader_id(&self) -> Uuid {
        self.loader_id
    }

    /// User version captured from the loader at deploy time.
    #[must_use]
    pub fn user_version(&self) -> &str {
        &self.user_version
    }

    /// Name of the resource the deployment was created for.
    #[must_use]
    pub fn primary_name(&self) -> &str {
        &self.primary_name
    }

    /// Whether the deployment originated on this node.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.local
    }

    /// Whether the deployment has been undeployed.
    #[must_use]
    pub fn is_undeployed(&self) -> bool {
        self.undeployed.load(Ordering::Acquire)
    }

    /// Undeployed with no remaining users; release hooks may run.
    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.is_undeployed() && self.usages.load(Ordering::Acquire) == 0
    }

    /// Marks the deployment as in use by one more job.
    pub fn acquire(&self) {
        self.usages.fetch_add(1, Ordering::AcqRel);
    }

    /// Every (resource, alias) pair deployed through this record.
    #[must_use]
    pub fn resources(&self) -> Vec<DeployedResource> {
        self.entries.read().clone()
    }

    fn add_resource(&self, def: &ResourceDef, alias: &str) -> bool {
        let mut entries = self.entries.write();
        if entries
            .iter()
            .any(|entry| entry.def.name == def.name && entry.alias == alias)
        {
            return false;
        }
        entries.push(DeployedResource {
            def: def.clone(),
            alias: alias.to_owned(),
        });
        true
    }

    fn undeploy(&self) {
        self.undeployed.store(true, Ordering::Release);
    }

    fn release_usage(&self) -> bool {
        let before = self.usages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(before > 0, "usage underflow");
        before == 1 && self.is_undeployed()
    }
}

impl std::fmt::Debug for Deployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("primary", &self.primary_name)
            .field("loader_id", &self.loader_id)
            .field("user_version", &self.user_version)
            .field("undeployed", &self.is_undeployed())
            .finish()
    }
}

/// Callback releasing caches tied to a deployment; runs exactly once per
/// deployment, after it becomes obsolete.
pub type ReleaseHook = Box<dyn Fn(&Deployment) + Send + Sync>;

/// Storage for local deployments. Reads walk the concurrent alias index
/// lock-free; every mutation happens under one mutex.
pub struct LocalDeploymentStore {
    ctx: Arc<GridContext>,
    registry: Arc<dyn DeploymentRegistry>,
    cache: DashMap<String, VecDeque<Arc<Deployment>>>,
    mux: Mutex<()>,
    hooks: RwLock<Vec<ReleaseHook>>,
}

impl LocalDeploymentStore {
    /// Creates a store bound to the context and a registry.
    #[must_use]
    pub fn new(ctx: Arc<GridContext>, registry: Arc<dyn DeploymentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            cache: DashMap::new(),
            mux: Mutex::new(()),
            hooks: RwLock::new(Vec::new()),
        })
    }

    /// Installs the registry unregister listener. Call once after
    /// construction.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.registry.set_listener(Some(Box::new(move |loader| {
            if let Some(store) = weak.upgrade() {
                store.undeploy(&loader);
            }
        })));
        debug!("local deployment store started");
    }

    /// Detaches from the registry and undeploys every live loader.
    pub fn stop(&self) {
        self.registry.set_listener(None);

        let loaders: Vec<Arc<dyn ResourceLoader>> = {
            let _guard = self.mux.lock();
            let mut loaders: Vec<Arc<dyn ResourceLoader>> = Vec::new();
            for entry in self.cache.iter() {
                for dep in entry.value() {
                    if !loaders.iter().any(|known| same_loader(known, dep.loader())) {
                        loaders.push(Arc::clone(dep.loader()));
                    }
                }
            }
            loaders
        };
        for loader in loaders {
            self.undeploy(&loader);
        }
        debug!("local deployment store stopped");
    }

    /// Registers a hook releasing resources tied to obsolete deployments.
    pub fn on_release<F>(&self, hook: F)
    where
        F: Fn(&Deployment) + Send + Sync + 'static,
    {
        self.hooks.write().push(Box::new(hook));
    }

    /// All live deployments, deduplicated.
    #[must_use]
    pub fn deployments(&self) -> Vec<Arc<Deployment>> {
        let mut seen: Vec<Arc<Deployment>> = Vec::new();
        for entry in self.cache.iter() {
            for dep in entry.value() {
                if !seen.iter().any(|known| Arc::ptr_eq(known, dep)) {
                    seen.push(Arc::clone(dep));
                }
            }
        }
        seen
    }

    /// Live deployment the alias currently resolves to.
    #[must_use]
    pub fn deployment(&self, alias: &str) -> Option<Arc<Deployment>> {
        let deps = self.cache.get(alias)?;
        deps.front()
            .filter(|dep| !dep.is_undeployed())
            .map(Arc::clone)
    }

    /// Deployment lookup by loader id.
    #[must_use]
    pub fn deployment_by_loader_id(&self, loader_id: Uuid) -> Option<Arc<Deployment>> {
        for entry in self.cache.iter() {
            for dep in entry.value() {
                if dep.loader_id() == loader_id {
                    return Some(Arc::clone(dep));
                }
            }
        }
        None
    }

    /// Resolves a deployment for the request, auto-deploying when the
    /// alias is unknown to both the store and the registry. Returns `None`
    /// when the resource cannot be resolved or conflicts with an existing
    /// deployment.
    pub fn get_deployment(&self, meta: &DeploymentMetadata) -> Option<Arc<Deployment>> {
        debug!(?meta, "resolving local deployment");

        if let Some(dep) = self.deployment(&meta.alias) {
            debug!(alias = %meta.alias, "acquired deployment from local cache");
            return Some(dep);
        }

        if let Some(found) = self.registry.find_resource(&meta.alias) {
            let dep = self.deploy(
                self.ctx.config().deployment_mode,
                found.loader,
                &found.def,
                &meta.alias,
                meta.record,
            );
            debug_assert!(dep.is_some(), "registered resource must deploy");
            return dep;
        }

        // Auto-deploy with the caller's loader, or the grid system loader.
        let loader = meta
            .loader
            .clone()
            .unwrap_or_else(|| Arc::clone(self.ctx.system_loader()));
        if loader.is_peer() {
            debug!(alias = %meta.alias, "skipping auto-deploy through a peer loader");
            return None;
        }

        let lookup = meta.resource_name.as_deref().unwrap_or(&meta.alias);
        let Some(def) = loader.load(lookup) else {
            debug!(alias = %meta.alias, "loader does not know the requested resource");
            return None;
        };
        if let Err(err) = self.registry.register(&loader, &def) {
            error!(alias = %meta.alias, %err, "failed to register auto-deployed resource");
            return None;
        }
        let Some(found) = self.registry.find_resource(&def.name) else {
            warn!(
                alias = %meta.alias,
                "resource vanished from registry right after registering"
            );
            return None;
        };
        if !same_loader(&found.loader, &loader) {
            warn!(alias = %meta.alias, "registry returned the resource under a different loader");
            return None;
        }

        self.deploy(
            self.ctx.config().deployment_mode,
            loader,
            &def,
            &meta.alias,
            meta.record,
        )
    }

    /// Deploys a resource explicitly. A peer loader is substituted by its
    /// parent so the deployment anchors at the real origin.
    pub fn explicit_deploy(
        &self,
        name: &str,
        loader: Arc<dyn ResourceLoader>,
    ) -> Result<Option<Arc<Deployment>>, DeploymentError> {
        let loader = if loader.is_peer() {
            loader.parent().unwrap_or(loader)
        } else {
            loader
        };

        let Some(def) = loader.load(name) else {
            return Err(DeploymentError::ResourceNotFound(name.to_owned()));
        };

        if let Err(err) = self.registry.register(&loader, &def) {
            self.record_deploy_failed(&def, true);
            return Err(err);
        }

        if let Some(dep) = self.deployment(&def.name) {
            return Ok(Some(dep));
        }
        if let Some(found) = self.registry.find_resource(&def.name)
            && same_loader(&found.loader, &loader)
        {
            let alias = found.def.alias_or_name().to_owned();
            return Ok(self.deploy(
                self.ctx.config().deployment_mode,
                found.loader,
                &found.def,
                &alias,
                true,
            ));
        }
        Ok(None)
    }

    /// Unregisters a resource; the store sweep happens through the
    /// registry's unregister callback.
    pub fn explicit_undeploy(&self, name: &str) {
        self.registry.unregister(name);
    }

    /// Undeploys everything owned by a loader: marks the deployments
    /// undeployed, drops them from every alias, collapses empty aliases,
    /// then (outside the lock) runs release hooks for deployments that
    /// became obsolete and records undeploy events.
    pub fn undeploy(&self, loader: &Arc<dyn ResourceLoader>) {
        let mut doomed: Vec<Arc<Deployment>> = Vec::new();
        {
            let _guard = self.mux.lock();
            let mut emptied: Vec<String> = Vec::new();
            for mut entry in self.cache.iter_mut() {
                entry.value_mut().retain(|dep| {
                    if same_loader(dep.loader(), loader) {
                        dep.undeploy();
                        if !doomed.iter().any(|known| Arc::ptr_eq(known, dep)) {
                            doomed.push(Arc::clone(dep));
                        }
                        false
                    } else {
                        true
                    }
                });
                if entry.value().is_empty() {
                    emptied.push(entry.key().clone());
                }
            }
            for key in emptied {
                self.cache.remove_if(&key, |_, deps| deps.is_empty());
            }
        }

        for dep in doomed {
            info!(deployment = ?dep, "removed undeployed resources");
            self.maybe_release(&dep);
            self.record_undeploy(&dep);
        }
    }

    /// Releases one usage of a deployment taken with
    /// [`Deployment::acquire`]; runs release hooks if the deployment just
    /// became obsolete.
    pub fn release(&self, dep: &Arc<Deployment>) {
        if dep.release_usage() {
            self.maybe_release(dep);
        }
    }

    fn maybe_release(&self, dep: &Arc<Deployment>) {
        if dep.is_obsolete() && !dep.released.swap(true, Ordering::AcqRel) {
            for hook in self.hooks.read().iter() {
                hook(dep);
            }
        }
    }

    fn deploy(
        &self,
        mode: DeploymentMode,
        loader: Arc<dyn ResourceLoader>,
        def: &ResourceDef,
        alias: &str,
        record: bool,
    ) -> Option<Arc<Deployment>> {
        let mut fire = false;
        let deployed = {
            let _guard = self.mux.lock();

            if let Some(existing) = self.find_by_loader(&loader) {
                fire = existing.add_resource(def, alias);
                self.index(alias, &existing);
                if def.name != alias {
                    self.index(&def.name, &existing);
                }
                Some(existing)
            } else {
                let conflict = self
                    .cache
                    .get(alias)
                    .is_some_and(|deps| deps.iter().any(|dep| !dep.is_undeployed()));
                if conflict {
                    error!(
                        alias,
                        resource = %def.name,
                        "refusing deployment: alias already owned by a live deployment \
                         with a different loader"
                    );
                    None
                } else {
                    let dep = Arc::new(Deployment::new(mode, loader, def.name.clone(), true));
                    fire = dep.add_resource(def, alias);
                    debug_assert!(fire, "fresh deployment must accept its first resource");

                    self.cache
                        .entry(alias.to_owned())
                        .or_default()
                        .push_front(Arc::clone(&dep));
                    if def.name != alias {
                        self.index(&def.name, &dep);
                    }
                    debug!(?dep, "created new deployment");
                    Some(dep)
                }
            }
        };

        if fire {
            self.record_deploy(def, alias, record);
        }
        deployed
    }

    fn find_by_loader(&self, loader: &Arc<dyn ResourceLoader>) -> Option<Arc<Deployment>> {
        for entry in self.cache.iter() {
            for dep in entry.value() {
                if same_loader(dep.loader(), loader) {
                    return Some(Arc::clone(dep));
                }
            }
        }
        None
    }

    fn index(&self, key: &str, dep: &Arc<Deployment>) {
        let mut deps = self.cache.entry(key.to_owned()).or_default();
        if !deps.iter().any(|known| Arc::ptr_eq(known, dep)) {
            deps.push_front(Arc::clone(dep));
        }
    }

    fn record_deploy(&self, def: &ResourceDef, alias: &str, record: bool) {
        let kind = if def.task {
            EventType::TaskDeployed
        } else {
            EventType::ClassDeployed
        };
        let message = format!(
            "{} locally deployed: {}",
            if def.task { "Task" } else { "Class" },
            def.name
        );

        if record && self.ctx.events().is_recordable(kind) {
            self.publish(kind, alias.to_owned(), message.clone());
        }
        if !is_system_resource(&def.name) {
            info!("{message}");
        }
    }

    fn record_deploy_failed(&self, def: &ResourceDef, record: bool) {
        let kind = if def.task {
            EventType::TaskDeployFailed
        } else {
            EventType::ClassDeployFailed
        };
        let message = format!(
            "Failed to deploy {}: {}",
            if def.task { "task" } else { "class" },
            def.name
        );

        if record && self.ctx.events().is_recordable(kind) {
            self.publish(kind, def.alias_or_name().to_owned(), message.clone());
        }
        info!("{message}");
    }

    fn record_undeploy(&self, dep: &Arc<Deployment>) {
        for resource in dep.resources() {
            let kind = if resource.def.task {
                EventType::TaskUndeployed
            } else {
                EventType::ClassUndeployed
            };
            let message = format!(
                "{} locally undeployed: {}",
                if resource.def.task { "Task" } else { "Class" },
                resource.def.name
            );

            if self.ctx.events().is_recordable(kind) {
                self.publish(kind, resource.alias, message.clone());
            }
            if !is_system_resource(&resource.def.name) {
                info!("{message}");
            }
        }
    }

    fn publish(&self, kind: EventType, alias: String, message: String) {
        let event = Event {
            kind,
            local_node: self.ctx.local_node_id().unwrap_or_else(Uuid::nil),
            timestamp: chrono::Utc::now(),
            message,
            payload: EventPayload::Deployment { alias },
        };
        self.ctx.events().publish(&event);
    }
}

/// Resources belonging to the standard library or the grid itself are
/// deployed like any other but kept out of the info log.
fn is_system_resource(name: &str) -> bool {
    ["std::", "core::", "alloc::", "gridfabric::"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

impl std::fmt::Debug for LocalDeploymentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDeploymentStore")
            .field("aliases", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::config::ClusterConfig;
    use crate::deployment::loader::{LocalResourceLoader, PeerResourceLoader};
    use crate::deployment::registry::LocalDeploymentRegistry;
    use std::sync::atomic::AtomicUsize;

    fn test_ctx() -> Arc<GridContext> {
        let mut config = ClusterConfig::default();
        config.worker_pool.core_size = 2;
        GridContext::new(config).expect("context")
    }

    fn test_store(ctx: &Arc<GridContext>) -> Arc<LocalDeploymentStore> {
        let store =
            LocalDeploymentStore::new(Arc::clone(ctx), Arc::new(LocalDeploymentRegistry::new()));
        store.start();
        store
    }

    fn loader_with(defs: &[ResourceDef]) -> Arc<dyn ResourceLoader> {
        let mut loader = LocalResourceLoader::new("rev-1");
        for def in defs {
            loader = loader.with_resource(def.clone());
        }
        Arc::new(loader)
    }

    type CapturedEvents = Arc<Mutex<Vec<(EventType, String)>>>;

    fn capture_events(ctx: &Arc<GridContext>) -> CapturedEvents {
        let captured: CapturedEvents = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&captured);
        ctx.events().subscribe(
            &[
                EventType::TaskDeployed,
                EventType::TaskUndeployed,
                EventType::TaskDeployFailed,
                EventType::ClassDeployed,
                EventType::ClassUndeployed,
                EventType::ClassDeployFailed,
            ],
            move |event| {
                if let EventPayload::Deployment { alias } = &event.payload {
                    sink.lock().push((event.kind, alias.clone()));
                }
            },
        );
        captured
    }

    #[test]
    fn aliases_on_one_loader_share_a_deployment() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let events = capture_events(&ctx);
        let loader = loader_with(&[ResourceDef::class("jobs::Mapper")]);

        let first = store
            .get_deployment(
                &DeploymentMetadata::new("a1")
                    .resource_name("jobs::Mapper")
                    .loader(Arc::clone(&loader)),
            )
            .expect("first deploy");
        let second = store
            .get_deployment(
                &DeploymentMetadata::new("a2")
                    .resource_name("jobs::Mapper")
                    .loader(Arc::clone(&loader)),
            )
            .expect("second deploy");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(store.deployment("a2").is_some());
        assert!(store.deployment("jobs::Mapper").is_some());
        assert_eq!(store.deployments().len(), 1);

        store.undeploy(&loader);
        assert!(store.deployment("a1").is_none());
        assert!(store.deployment("a2").is_none());
        assert!(store.deployment("jobs::Mapper").is_none());

        // One CLASS_DEPLOYED per newly deployed (resource, alias) pair and
        // one CLASS_UNDEPLOYED per pair on the sweep.
        let recorded = events.lock().clone();
        let deploys: Vec<_> = recorded
            .iter()
            .filter(|(kind, _)| *kind == EventType::ClassDeployed)
            .collect();
        let undeploys: Vec<_> = recorded
            .iter()
            .filter(|(kind, _)| *kind == EventType::ClassUndeployed)
            .collect();
        assert_eq!(deploys.len(), 2);
        assert_eq!(undeploys.len(), 2);
    }

    #[test]
    fn alias_is_single_owner_until_undeployed() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let original = loader_with(&[ResourceDef::class("jobs::Mapper")]);
        let rival = loader_with(&[ResourceDef::class("jobs::Mapper")]);

        let first = store
            .get_deployment(&DeploymentMetadata::new("jobs::Mapper").loader(Arc::clone(&original)))
            .expect("deploy");

        // While the original deployment is live the alias keeps resolving
        // to it; the rival loader cannot take the alias over.
        let resolved = store
            .get_deployment(&DeploymentMetadata::new("jobs::Mapper").loader(Arc::clone(&rival)))
            .expect("resolve");
        assert!(Arc::ptr_eq(&first, &resolved));
        assert!(same_loader(resolved.loader(), &original));

        store.undeploy(&original);
        assert!(store.deployment("jobs::Mapper").is_none());
    }

    #[test]
    fn auto_deploy_skips_peer_loaders() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let parent: Arc<dyn ResourceLoader> = Arc::new(
            LocalResourceLoader::new("rev-1").with_resource(ResourceDef::task("jobs::Remote")),
        );
        let peer: Arc<dyn ResourceLoader> =
            Arc::new(PeerResourceLoader::new(Arc::clone(&parent)));

        let result = store.get_deployment(
            &DeploymentMetadata::new("jobs::Remote").loader(Arc::clone(&peer)),
        );
        assert!(result.is_none(), "nested auto-deploy must be refused");
    }

    #[test]
    fn explicit_deploy_substitutes_peer_parent() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let parent: Arc<dyn ResourceLoader> = Arc::new(
            LocalResourceLoader::new("rev-3").with_resource(ResourceDef::task("jobs::Origin")),
        );
        let peer: Arc<dyn ResourceLoader> =
            Arc::new(PeerResourceLoader::new(Arc::clone(&parent)));

        let dep = store
            .explicit_deploy("jobs::Origin", peer)
            .expect("deploy")
            .expect("deployment");
        assert!(same_loader(dep.loader(), &parent));
        assert_eq!(dep.user_version(), "rev-3");
    }

    #[test]
    fn explicit_deploy_of_unknown_resource_fails() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let loader = loader_with(&[]);
        assert_eq!(
            store.explicit_deploy("jobs::Ghost", loader).unwrap_err(),
            DeploymentError::ResourceNotFound("jobs::Ghost".to_owned())
        );
    }

    #[test]
    fn release_hooks_run_exactly_once_for_obsolete_deployments() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        store.on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let loader = loader_with(&[ResourceDef::class("jobs::Mapper")]);
        store
            .get_deployment(&DeploymentMetadata::new("jobs::Mapper").loader(Arc::clone(&loader)))
            .expect("deploy");

        store.undeploy(&loader);
        store.undeploy(&loader);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn in_use_deployment_releases_hooks_only_after_last_usage() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        store.on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let loader = loader_with(&[ResourceDef::task("jobs::LongRunner")]);
        let dep = store
            .get_deployment(&DeploymentMetadata::new("jobs::LongRunner").loader(Arc::clone(&loader)))
            .expect("deploy");
        dep.acquire();

        store.undeploy(&loader);
        assert!(dep.is_undeployed());
        assert_eq!(released.load(Ordering::SeqCst), 0, "still in use");

        store.release(&dep);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn explicit_undeploy_sweeps_through_the_registry() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let loader = loader_with(&[ResourceDef::task("jobs::Swept")]);
        store
            .explicit_deploy("jobs::Swept", Arc::clone(&loader))
            .expect("deploy")
            .expect("deployment");
        assert!(store.deployment("jobs::Swept").is_some());

        store.explicit_undeploy("jobs::Swept");
        assert!(store.deployment("jobs::Swept").is_none());
    }

    #[test]
    fn stop_undeploys_every_live_loader() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let first = loader_with(&[ResourceDef::class("jobs::A")]);
        let second = loader_with(&[ResourceDef::class("jobs::B")]);
        store
            .get_deployment(&DeploymentMetadata::new("jobs::A").loader(Arc::clone(&first)))
            .expect("deploy a");
        store
            .get_deployment(&DeploymentMetadata::new("jobs::B").loader(Arc::clone(&second)))
            .expect("deploy b");

        store.stop();
        assert!(store.deployments().is_empty());
        assert!(store.deployment("jobs::A").is_none());
        assert!(store.deployment("jobs::B").is_none());
    }

    #[test]
    fn lookup_by_loader_id_matches_deploy_result() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let loader = loader_with(&[ResourceDef::class("jobs::Lookup")]);
        let dep = store
            .get_deployment(&DeploymentMetadata::new("jobs::Lookup").loader(loader))
            .expect("deploy");

        let found = store
            .deployment_by_loader_id(dep.loader_id())
            .expect("by loader id");
        assert!(Arc::ptr_eq(&dep, &found));
        assert!(store.deployment_by_loader_id(Uuid::new_v4()).is_none());
    }

    #[test]
    fn task_and_class_events_are_distinguished() {
        let ctx = test_ctx();
        let store = test_store(&ctx);
        let events = capture_events(&ctx);
        let loader = loader_with(&[
            ResourceDef::task("jobs::ATask"),
            ResourceDef::class("jobs::AClass"),
        ]);

        store
            .get_deployment(&DeploymentMetadata::new("jobs::ATask").loader(Arc::clone(&loader)))
            .expect("task deploy");
        store
            .get_deployment(&DeploymentMetadata::new("jobs::AClass").loader(Arc::clone(&loader)))
            .expect("class deploy");

        let recorded = events.lock().clone();
        assert!(recorded.contains(&(EventType::TaskDeployed, "jobs::ATask".to_owned())));
        assert!(recorded.contains(&(EventType::ClassDeployed, "jobs::AClass".to_owned())));
    }
}
