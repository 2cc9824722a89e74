//! Network segmentation detection: resolver contract, shared check state
//! and lifecycle hooks the policy engine drives.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::cluster::error::ClusterError;

/// How long start-time and reconnect-time checks wait between retries.
pub(crate) const SEGMENT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Answers whether the local node is in a legitimate network segment,
/// typically by probing a well-known address or service.
pub trait SegmentationResolver: Send + Sync + fmt::Debug {
    /// Returns `Ok(true)` when the segment is valid. Errors are treated as
    /// an invalid segment.
    fn is_valid_segment(&self) -> Result<bool, ClusterError>;
}

/// Hooks the segmentation policy engine uses to stop the local node or
/// request a host-process restart. Implemented by the embedding runtime.
pub trait NodeLifecycle: Send + Sync {
    /// Stops the local node.
    fn stop_node(&self);
    /// Asks the host process to restart itself.
    fn restart_process(&self);
}

/// Default lifecycle that only logs. Embedders replace it to actually
/// stop the process.
#[derive(Debug, Default)]
pub struct LoggingLifecycle;

impl NodeLifecycle for LoggingLifecycle {
    fn stop_node(&self) {
        error!("node stop requested by segmentation policy, no lifecycle hooks installed");
    }

    fn restart_process(&self) {
        error!("process restart requested by segmentation policy, no lifecycle hooks installed");
    }
}

/// Shared segmentation check state: the configured resolvers and the
/// result of the most recent check. The watchdog only re-queries resolvers
/// while the last result was valid; a reconnect re-arms it.
pub(crate) struct SegmentationState {
    resolvers: Vec<Arc<dyn SegmentationResolver>>,
    last_valid: AtomicBool,
}

impl SegmentationState {
    pub(crate) fn new(resolvers: Vec<Arc<dyn SegmentationResolver>>) -> Self {
        Self {
            resolvers,
            last_valid: AtomicBool::new(true),
        }
    }

    pub(crate) fn has_resolvers(&self) -> bool {
        !self.resolvers.is_empty()
    }

    /// Queries every resolver; the segment is valid only if all agree.
    pub(crate) fn is_valid_segment(&self) -> bool {
        for resolver in &self.resolvers {
            match resolver.is_valid_segment() {
                Ok(true) => {}
                Ok(false) => {
                    debug!(?resolver, "segmentation resolver reported invalid segment");
                    return false;
                }
                Err(err) => {
                    warn!(?resolver, %err, "segmentation resolver failed, treating segment as invalid");
                    return false;
                }
            }
        }
        true
    }

    pub(crate) fn last_valid(&self) -> bool {
        self.last_valid.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_valid(&self, valid: bool) {
        self.last_valid.store(valid, Ordering::Release);
    }

    /// Blocking check used at start and before a reconnect. With `wait`
    /// the check retries every two seconds until the segment is valid,
    /// otherwise an invalid segment fails immediately.
    pub(crate) fn check_blocking(&self, wait: bool) -> Result<(), ClusterError> {
        debug!("starting network segment check");
        loop {
            if self.is_valid_segment() {
                debug!("finished network segment check successfully");
                return Ok(());
            }
            if !wait {
                return Err(ClusterError::InvalidSegment);
            }
            warn!(
                retry_ms = SEGMENT_RETRY_INTERVAL.as_millis() as u64,
                "network segment is invalid, retrying"
            );
            std::thread::sleep(SEGMENT_RETRY_INTERVAL);
        }
    }
}

impl fmt::Debug for SegmentationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentationState")
            .field("resolvers", &self.resolvers.len())
            .field("last_valid", &self.last_valid.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Resolver whose answer can be flipped from tests.
    #[derive(Debug)]
    pub(crate) struct FlipResolver {
        valid: AtomicBool,
    }

    impl FlipResolver {
        pub(crate) fn new(valid: bool) -> Arc<Self> {
            Arc::new(Self {
                valid: AtomicBool::new(valid),
            })
        }

        pub(crate) fn set_valid(&self, valid: bool) {
            self.valid.store(valid, Ordering::SeqCst);
        }
    }

    impl SegmentationResolver for FlipResolver {
        fn is_valid_segment(&self) -> Result<bool, ClusterError> {
            Ok(self.valid.load(Ordering::SeqCst))
        }
    }

    /// Resolver that always fails.
    #[derive(Debug)]
    pub(crate) struct FailingResolver;

    impl SegmentationResolver for FailingResolver {
        fn is_valid_segment(&self) -> Result<bool, ClusterError> {
            Err(ClusterError::InvalidSegment)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FailingResolver, FlipResolver};
    use super::*;

    #[test]
    fn segment_is_valid_only_when_all_resolvers_agree() {
        let yes = FlipResolver::new(true);
        let no = FlipResolver::new(false);
        let state = SegmentationState::new(vec![
            Arc::clone(&yes) as Arc<dyn SegmentationResolver>,
            Arc::clone(&no) as Arc<dyn SegmentationResolver>,
        ]);
        assert!(!state.is_valid_segment());

        no.set_valid(true);
        assert!(state.is_valid_segment());
    }

    #[test]
    fn resolver_failure_counts_as_invalid() {
        let state =
            SegmentationState::new(vec![Arc::new(FailingResolver) as Arc<dyn SegmentationResolver>]);
        assert!(!state.is_valid_segment());
    }

    #[test]
    fn non_waiting_check_fails_fast_on_invalid_segment() {
        let state =
            SegmentationState::new(vec![FlipResolver::new(false) as Arc<dyn SegmentationResolver>]);
        assert!(matches!(
            state.check_blocking(false),
            Err(ClusterError::InvalidSegment)
        ));
    }

    #[test]
    fn empty_resolver_set_is_always_valid() {
        let state = SegmentationState::new(Vec::new());
        assert!(!state.has_resolvers());
        assert!(state.is_valid_segment());
        assert!(state.check_blocking(false).is_ok());
    }
}
