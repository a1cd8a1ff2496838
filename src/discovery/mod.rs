//! Endpoint discovery sources and listener-observable endpoint lists.

mod dynamic;
mod file;

pub use dynamic::DynamicEndpointGroup;
pub use file::{load_endpoints, FileEndpointGroup};

use crate::endpoint::Endpoint;
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Callback invoked with the full endpoint list every time it is replaced.
pub type EndpointListener = Arc<dyn Fn(&[Endpoint]) + Send + Sync>;

/// Errors reported by a discovery source.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to read endpoints file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse endpoints file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to watch endpoints file: {0}")]
    Watch(#[from] notify::Error),

    #[error("endpoint group is closed")]
    Closed,
}

/// An ordered, changing list of endpoints.
///
/// Implemented by discovery sources and by the health-checked group itself,
/// so groups can be layered.
pub trait EndpointGroup: Send + Sync {
    /// Snapshot of the current endpoints.
    fn endpoints(&self) -> Vec<Endpoint>;

    /// Endpoints to use for the initial load.
    ///
    /// Sources that can fail on load override this; the default returns the
    /// current snapshot.
    fn initial_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        Ok(self.endpoints())
    }

    /// Subscribe to endpoint list replacements.
    fn add_listener(&self, listener: EndpointListener);

    /// Release the resources held by this group.
    fn close(&self) -> BoxFuture<'static, ()>;
}
