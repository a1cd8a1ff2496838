//! File-backed discovery source.
//!
//! Reads candidate endpoints from a YAML file and replaces them whenever the
//! file changes or the process receives SIGHUP.

use crate::discovery::{DiscoveryError, DynamicEndpointGroup, EndpointGroup, EndpointListener};
use crate::endpoint::Endpoint;
use crate::util::ShutdownSignal;
use futures::future::{BoxFuture, FutureExt};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// On-disk layout of an endpoints file.
#[derive(Debug, Deserialize)]
struct EndpointsFile {
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

/// Load the endpoint list from a YAML file.
///
/// ```yaml
/// endpoints:
///   - "10.0.0.1:8080"
///   - "10.0.0.2:8080"
/// ```
pub fn load_endpoints<P: AsRef<Path>>(path: P) -> Result<Vec<Endpoint>, DiscoveryError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| DiscoveryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file: EndpointsFile =
        serde_yaml::from_str(&contents).map_err(|source| DiscoveryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(file.endpoints)
}

/// Discovery source backed by a watched endpoints file.
pub struct FileEndpointGroup {
    /// Path to the endpoints file.
    path: PathBuf,
    /// Current candidates.
    group: Arc<DynamicEndpointGroup>,
    /// Stops the watcher task.
    shutdown: ShutdownSignal,
}

impl FileEndpointGroup {
    /// Load the file and start watching it on the given runtime.
    pub fn start(path: impl Into<PathBuf>, runtime: &Handle) -> Result<Self, DiscoveryError> {
        let path = path.into();
        let endpoints = load_endpoints(&path)?;
        info!(
            path = %path.display(),
            endpoints = endpoints.len(),
            "loaded endpoints file"
        );

        let group = Arc::new(DynamicEndpointGroup::with_endpoints(endpoints));
        let shutdown = ShutdownSignal::new();

        let (tx, rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher = Watcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        // Watch the parent directory so editors that replace the file are seen
        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        let task = WatchTask {
            path: path.clone(),
            group: Arc::clone(&group),
            _watcher: watcher,
            events: rx,
        };
        runtime.spawn(task.run(shutdown.subscribe()));

        Ok(Self {
            path,
            group,
            shutdown,
        })
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file now, keeping the current endpoints on failure.
    pub fn reload(&self) -> Result<(), DiscoveryError> {
        reload(&self.path, &self.group)
    }
}

impl EndpointGroup for FileEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.group.endpoints()
    }

    fn initial_endpoints(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        if self.group.is_closed() {
            return Err(DiscoveryError::Closed);
        }
        load_endpoints(&self.path)
    }

    fn add_listener(&self, listener: EndpointListener) {
        self.group.add_listener(listener);
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.shutdown.shutdown();
        let group = Arc::clone(&self.group);
        async move { group.close().await }.boxed()
    }
}

/// Background task that turns file events into endpoint updates.
struct WatchTask {
    path: PathBuf,
    group: Arc<DynamicEndpointGroup>,
    _watcher: RecommendedWatcher,
    events: mpsc::Receiver<Event>,
}

impl WatchTask {
    async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to setup SIGHUP handler");
                None
            }
        };

        info!(path = %self.path.display(), "endpoints file watcher ready");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(100)) => {
                    let mut changed = false;
                    while let Ok(event) = self.events.try_recv() {
                        changed |= should_reload(&self.path, &event);
                    }
                    if changed {
                        self.try_reload();
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        if let Some(ref mut sig) = sighup {
                            sig.recv().await
                        } else {
                            std::future::pending::<Option<()>>().await
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading endpoints");
                    self.try_reload();
                }

                _ = shutdown.recv() => {
                    info!(path = %self.path.display(), "endpoints file watcher shutting down");
                    break;
                }
            }
        }
    }

    fn try_reload(&self) {
        if let Err(e) = reload(&self.path, &self.group) {
            error!(error = %e, "failed to reload endpoints, keeping current");
        }
    }
}

fn reload(path: &Path, group: &DynamicEndpointGroup) -> Result<(), DiscoveryError> {
    let endpoints = load_endpoints(path)?;
    let count = endpoints.len();
    if group.set_endpoints(endpoints) {
        info!(path = %path.display(), endpoints = count, "endpoints reloaded");
    }
    Ok(())
}

/// Check if this event should trigger a reload.
fn should_reload(path: &Path, event: &Event) -> bool {
    let is_our_file = event
        .paths
        .iter()
        .any(|p| p.file_name() == path.file_name());

    let is_modify_or_create = matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    );

    is_our_file && is_modify_or_create
}
