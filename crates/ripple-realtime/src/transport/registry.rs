//! The set of transport kinds a client may use.

use std::sync::Arc;

use super::TransportFactory;

/// Transport factories available to a client, passed in at construction.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled WebSocket transport.
    pub fn with_defaults() -> Self {
        Self::new().with(Arc::new(super::WebSocketTransportFactory))
    }

    pub fn with(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.register(factory);
        self
    }

    /// Register a factory, replacing any existing one of the same kind.
    pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
        self.factories.retain(|f| f.kind() != factory.kind());
        self.factories.push(factory);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories.iter().find(|f| f.kind() == kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.iter().map(|f| f.kind().to_string()).collect()
    }

    /// Registered factories in the given preference order; unregistered
    /// names are skipped.
    pub fn candidates(&self, preference: &[String]) -> Vec<Arc<dyn TransportFactory>> {
        preference.iter().filter_map(|kind| self.get(kind)).collect()
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
