//! Resource loaders: the source a deployable resource is materialized
//! from. Loader identity is pointer identity; two handles to the same
//! loader resolve to the same deployment.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A deployable unit of code: a compute task or a supporting class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Fully qualified resource name.
    pub name: String,
    /// Optional short alias the resource is addressable by.
    pub alias: Option<String>,
    /// Whether the resource is a compute task.
    pub task: bool,
}

impl ResourceDef {
    /// Defines a non-task resource.
    #[must_use]
    pub fn class(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            task: false,
        }
    }

    /// Defines a compute task resource.
    #[must_use]
    pub fn task(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            task: true,
        }
    }

    /// Sets the short alias.
    #[must_use]
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// The alias when present, otherwise the full name.
    #[must_use]
    pub fn alias_or_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Source of deployable resources; the unit deployments are keyed by.
pub trait ResourceLoader: Send + Sync + fmt::Debug {
    /// Resolves a resource by name or alias.
    fn load(&self, name: &str) -> Option<ResourceDef>;

    /// Opaque revision string disambiguating peer-loaded code.
    fn user_version(&self) -> &str;

    /// The loader this one materializes peer-loaded resources from.
    fn parent(&self) -> Option<Arc<dyn ResourceLoader>> {
        None
    }

    /// Whether this loader serves peer-deployed resources. Auto-deployment
    /// never goes through a peer loader.
    fn is_peer(&self) -> bool {
        false
    }
}

/// Loader identity: same underlying instance, regardless of how many
/// handles exist.
#[must_use]
pub fn same_loader(a: &Arc<dyn ResourceLoader>, b: &Arc<dyn ResourceLoader>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a).cast::<()>(),
        Arc::as_ptr(b).cast::<()>(),
    )
}

/// In-process loader backed by an explicit resource table.
#[derive(Debug)]
pub struct LocalResourceLoader {
    user_version: String,
    resources: HashMap<String, ResourceDef>,
}

impl LocalResourceLoader {
    /// Creates an empty loader with the given user version.
    #[must_use]
    pub fn new(user_version: impl Into<String>) -> Self {
        Self {
            user_version: user_version.into(),
            resources: HashMap::new(),
        }
    }

    /// Adds a resource, indexing it under both its name and its alias.
    #[must_use]
    pub fn with_resource(mut self, def: ResourceDef) -> Self {
        if let Some(alias) = &def.alias {
            self.resources.insert(alias.clone(), def.clone());
        }
        self.resources.insert(def.name.clone(), def);
        self
    }
}

impl Default for LocalResourceLoader {
    fn default() -> Self {
        Self::new("0")
    }
}

impl ResourceLoader for LocalResourceLoader {
    fn load(&self, name: &str) -> Option<ResourceDef> {
        self.resources.get(name).cloned()
    }

    fn user_version(&self) -> &str {
        &self.user_version
    }
}

/// Loader serving resources fetched from a remote node. Carries the local
/// loader it was derived from; explicit deploys bind to that parent so
/// they anchor at the real origin.
#[derive(Debug)]
pub struct PeerResourceLoader {
    parent: Arc<dyn ResourceLoader>,
    resources: HashMap<String, ResourceDef>,
}

impl PeerResourceLoader {
    /// Creates a peer loader on top of a local parent.
    #[must_use]
    pub fn new(parent: Arc<dyn ResourceLoader>) -> Self {
        Self {
            parent,
            resources: HashMap::new(),
        }
    }

    /// Adds a remotely fetched resource.
    #[must_use]
    pub fn with_resource(mut self, def: ResourceDef) -> Self {
        if let Some(alias) = &def.alias {
            self.resources.insert(alias.clone(), def.clone());
        }
        self.resources.insert(def.name.clone(), def);
        self
    }
}

impl ResourceLoader for PeerResourceLoader {
    fn load(&self, name: &str) -> Option<ResourceDef> {
        self.resources
            .get(name)
            .cloned()
            .or_else(|| self.parent.load(name))
    }

    fn user_version(&self) -> &str {
        self.parent.user_version()
    }

    fn parent(&self) -> Option<Arc<dyn ResourceLoader>> {
        Some(Arc::clone(&self.parent))
    }

    fn is_peer(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_loader_resolves_by_name_and_alias() {
        let loader = LocalResourceLoader::new("rev-1")
            .with_resource(ResourceDef::task("jobs::Reducer").with_alias("reduce"));

        assert!(loader.load("jobs::Reducer").is_some());
        assert_eq!(
            loader.load("reduce").map(|def| def.name),
            Some("jobs::Reducer".to_owned())
        );
        assert!(loader.load("missing").is_none());
        assert_eq!(loader.user_version(), "rev-1");
        assert!(!loader.is_peer());
    }

    #[test]
    fn loader_identity_is_pointer_identity() {
        let a: Arc<dyn ResourceLoader> = Arc::new(LocalResourceLoader::default());
        let b: Arc<dyn ResourceLoader> = Arc::new(LocalResourceLoader::default());
        assert!(same_loader(&a, &Arc::clone(&a)));
        assert!(!same_loader(&a, &b));
    }

    #[test]
    fn peer_loader_delegates_and_exposes_parent() {
        let parent: Arc<dyn ResourceLoader> = Arc::new(
            LocalResourceLoader::new("rev-2").with_resource(ResourceDef::class("util::Codec")),
        );
        let peer = PeerResourceLoader::new(Arc::clone(&parent))
            .with_resource(ResourceDef::task("remote::Task"));

        assert!(peer.is_peer());
        assert!(peer.load("remote::Task").is_some());
        assert!(peer.load("util::Codec").is_some());
        assert_eq!(peer.user_version(), "rev-2");
        let exposed = peer.parent().expect("parent");
        assert!(same_loader(&exposed, &parent));
    }
}
