//! Listener-observable endpoint list.

use crate::discovery::{EndpointGroup, EndpointListener};
use crate::endpoint::Endpoint;
use arc_swap::ArcSwap;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An endpoint list that can be replaced at any time and notifies its listeners.
///
/// Reads are lock-free. Replacements are serialized so listeners observe
/// updates in the order they were made. Listeners run on the thread calling
/// [`set_endpoints`](Self::set_endpoints) and must not call back into it.
pub struct DynamicEndpointGroup {
    /// Current endpoints.
    endpoints: ArcSwap<Vec<Endpoint>>,
    /// Registered listeners.
    listeners: Mutex<Vec<EndpointListener>>,
    /// Serializes replacements; `true` once the first list was published.
    update_lock: Mutex<bool>,
    /// Set once closed.
    closed: AtomicBool,
}

impl DynamicEndpointGroup {
    /// Create an empty group that has not published anything yet.
    pub fn new() -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(Vec::new()),
            listeners: Mutex::new(Vec::new()),
            update_lock: Mutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a group that starts with the given endpoints.
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
            listeners: Mutex::new(Vec::new()),
            update_lock: Mutex::new(true),
            closed: AtomicBool::new(false),
        }
    }

    /// Replace the endpoint list and notify listeners.
    ///
    /// An unchanged list is not announced again, except for the first
    /// publication which always notifies. Returns whether listeners were notified.
    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let mut published = self.update_lock.lock();
        if *published && **self.endpoints.load() == endpoints {
            return false;
        }

        let endpoints = Arc::new(endpoints);
        self.endpoints.store(Arc::clone(&endpoints));
        *published = true;

        let listeners = self.listeners.lock().clone();
        debug!(
            endpoints = endpoints.len(),
            listeners = listeners.len(),
            "endpoint list updated"
        );
        for listener in &listeners {
            listener(&endpoints);
        }
        true
    }

    /// Whether at least one list has been published.
    pub fn is_ready(&self) -> bool {
        *self.update_lock.lock()
    }

    /// Whether [`close`](EndpointGroup::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for DynamicEndpointGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointGroup for DynamicEndpointGroup {
    fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.load().to_vec()
    }

    fn add_listener(&self, listener: EndpointListener) {
        self.listeners.lock().push(listener);
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.closed.store(true, Ordering::Release);
        self.listeners.lock().clear();
        future::ready(()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_listener(group: &DynamicEndpointGroup) -> (Arc<AtomicUsize>, Arc<Mutex<Vec<Endpoint>>>) {
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(Vec::new()));
        let (c, l) = (Arc::clone(&count), Arc::clone(&last));
        group.add_listener(Arc::new(move |endpoints: &[Endpoint]| {
            c.fetch_add(1, Ordering::SeqCst);
            *l.lock() = endpoints.to_vec();
        }));
        (count, last)
    }

    #[test]
    fn test_first_publish_always_notifies() {
        let group = DynamicEndpointGroup::new();
        let (count, last) = counting_listener(&group);

        assert!(!group.is_ready());
        assert!(group.set_endpoints(vec![]));
        assert!(group.is_ready());
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(last.lock().is_empty());
    }

    #[test]
    fn test_unchanged_list_not_announced() {
        let group = DynamicEndpointGroup::new();
        let (count, last) = counting_listener(&group);
        let a = Endpoint::of("a", 1);

        assert!(group.set_endpoints(vec![a.clone()]));
        assert!(!group.set_endpoints(vec![a.clone()]));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(group.set_endpoints(vec![]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(last.lock().is_empty());
        assert!(group.endpoints().is_empty());
    }

    #[test]
    fn test_with_endpoints_is_ready() {
        let a = Endpoint::of("a", 1);
        let group = DynamicEndpointGroup::with_endpoints(vec![a.clone()]);
        assert!(group.is_ready());
        assert_eq!(group.endpoints(), vec![a.clone()]);
        assert_eq!(group.initial_endpoints().unwrap(), vec![a]);
    }

    #[test]
    fn test_close_drops_listeners() {
        let group = DynamicEndpointGroup::new();
        let (count, _) = counting_listener(&group);

        tokio_test::block_on(group.close());
        assert!(group.is_closed());
        assert!(!group.set_endpoints(vec![Endpoint::new("a")]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
