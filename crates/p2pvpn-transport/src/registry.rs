//! Protocol → handler routing table shared by host implementations

use crate::StreamHandler;
use std::collections::HashMap;
use std::sync::RwLock;

pub struct HandlerRegistry<S> {
    handlers: RwLock<HashMap<String, StreamHandler<S>>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, protocol: &str, handler: StreamHandler<S>) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(protocol.to_string(), handler);
    }

    pub fn remove(&self, protocol: &str) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(protocol);
    }

    pub fn get(&self, protocol: &str) -> Option<StreamHandler<S>> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(protocol)
            .cloned()
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(protocol)
    }
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for HandlerRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let protocols: Vec<String> = self
            .handlers
            .read()
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("HandlerRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_insert_get_remove() {
        let registry: HandlerRegistry<u32> = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        registry.insert(
            "/vpn/tun/1.0.0",
            Arc::new(move |value: u32| {
                counter.fetch_add(value as usize, Ordering::SeqCst);
                async {}.boxed()
            }),
        );

        assert!(registry.contains("/vpn/tun/1.0.0"));
        assert!(registry.get("/vpn/tap/1.0.0").is_none());

        let handler = registry.get("/vpn/tun/1.0.0").unwrap();
        handler(3).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        registry.remove("/vpn/tun/1.0.0");
        assert!(!registry.contains("/vpn/tun/1.0.0"));
    }
}
