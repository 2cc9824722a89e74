//! Local deployment store: keys code resources into the topology so the
//! compute plane can resolve them by alias.

/// Deployment error kinds.
pub mod error;
/// Resource loader abstraction and the local implementation.
pub mod loader;
/// Registry the store publishes deployed resources through.
pub mod registry;
/// The local deployment store itself.
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::DeploymentError;
pub use loader::{LocalResourceLoader, PeerResourceLoader, ResourceDef, ResourceLoader};
pub use registry::{DeploymentRegistry, LocalDeploymentRegistry, RegisteredResource};
pub use store::{Deployment, DeploymentMetadata, LocalDeploymentStore};

/// How deployed resources are shared between tasks and nodes. Must match
/// across all non-daemon nodes of a cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    /// Every task gets its own deployment, undeployed with the task.
    Private,
    /// Tasks from the same source share a deployment.
    Isolated,
    /// Deployments are shared across tasks and survive their originators.
    #[default]
    Shared,
    /// Like shared, but deployments also survive the originating node.
    Continuous,
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Private => "private",
            Self::Isolated => "isolated",
            Self::Shared => "shared",
            Self::Continuous => "continuous",
        };
        f.write_str(name)
    }
}

impl FromStr for DeploymentMode {
    type Err = DeploymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "isolated" => Ok(Self::Isolated),
            "shared" => Ok(Self::Shared),
            "continuous" => Ok(Self::Continuous),
            other => Err(DeploymentError::InvalidMode(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_display() {
        for mode in [
            DeploymentMode::Private,
            DeploymentMode::Isolated,
            DeploymentMode::Shared,
            DeploymentMode::Continuous,
        ] {
            assert_eq!(mode.to_string().parse::<DeploymentMode>(), Ok(mode));
        }
        assert!("turbo".parse::<DeploymentMode>().is_err());
    }
}
