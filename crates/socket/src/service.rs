//! Service trait and the static registry connections dispatch through.
//!
//! Implementors provide domain logic (build jobs, artifact transfer, runner
//! identification) while the connection handles framing, routing and
//! lifecycle. One service instance is shared by every connection of its
//! registry; per-connection state is keyed by
//! [`ServiceSender::connection_id`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::SocketError;
use crate::connection::{ConnectionId, ServiceSender};

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A named logical channel multiplexed over a connection.
///
/// Messages for one service on one connection are handled strictly in
/// arrival order; different services are handled concurrently. Default
/// implementations log and drop, so services only override the message
/// kinds they use.
pub trait Service: Send + Sync + 'static {
    /// Called once per connection before any message is dispatched.
    fn on_connected(&self, sender: ServiceSender) -> HandlerFuture<'_> {
        let _ = sender;
        Box::pin(async {})
    }

    /// Called for `String` frames.
    fn on_string_message(&self, sender: ServiceSender, text: String) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::warn!(
                service = sender.service_name(),
                len = text.len(),
                "string message received but handler not implemented"
            );
        })
    }

    /// Called for `Binary` frames.
    fn on_data_message(&self, sender: ServiceSender, data: Vec<u8>) -> HandlerFuture<'_> {
        Box::pin(async move {
            tracing::warn!(
                service = sender.service_name(),
                len = data.len(),
                "binary message received but handler not implemented"
            );
        })
    }

    /// Called for `Json` frames whose payload parsed as JSON.
    fn on_json_message(&self, sender: ServiceSender, value: serde_json::Value) -> HandlerFuture<'_> {
        let _ = value;
        Box::pin(async move {
            tracing::warn!(
                service = sender.service_name(),
                "json message received but handler not implemented"
            );
        })
    }

    /// Called after the connection closed and all queued messages ran.
    fn on_disconnected(&self, connection_id: ConnectionId) -> HandlerFuture<'_> {
        let _ = connection_id;
        Box::pin(async {})
    }
}

/// Mapping from service name to handler, built once at startup.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service` under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        service: Arc<dyn Service>,
    ) -> Result<(), SocketError> {
        let name = name.into();
        if self.services.contains_key(&name) {
            return Err(SocketError::DuplicateService(name));
        }
        self.services.insert(name, service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Service>> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Service>)> {
        self.services.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Service for Noop {}

    #[test]
    fn register_and_lookup() {
        let mut registry = ServiceRegistry::new();
        registry.register("build", Arc::new(Noop)).unwrap();
        registry.register("file-transfer", Arc::new(Noop)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("build").is_some());
        assert!(registry.get("xcode").is_none());
    }

    #[test]
    fn duplicate_name_rejected() {
        let mut registry = ServiceRegistry::new();
        registry.register("build", Arc::new(Noop)).unwrap();
        let err = registry.register("build", Arc::new(Noop)).unwrap_err();
        assert!(matches!(err, SocketError::DuplicateService(name) if name == "build"));
    }
}
