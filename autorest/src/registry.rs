use parking_lot::RwLock;

use crate::{Endpoint, ServiceId};

/// Instance-scoped endpoint list. Each server owns its own registry, so two
/// servers in one process never collide on routes.
#[derive(Default)]
pub struct Registry {
    endpoints: RwLock<Vec<Endpoint>>,
}

impl Registry {
    /// Appends endpoints in registration order.
    pub fn register(&self, endpoints: Vec<Endpoint>) {
        self.endpoints.write().extend(endpoints);
    }

    /// Removes every endpoint owned by the given service instance. Endpoints
    /// of other instances, including ones sharing the same trait, stay.
    pub fn unregister(&self, service: ServiceId) {
        self.endpoints.write().retain(|ep| ep.service != service);
    }

    /// Resolves a request path to its endpoint. First match wins, so
    /// duplicate routes resolve to the earliest registration.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<Endpoint> {
        self.endpoints
            .read()
            .iter()
            .find(|ep| ep.route == path)
            .cloned()
    }

    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        self.endpoints
            .read()
            .iter()
            .map(|ep| ep.route.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("routes", &self.routes())
            .finish()
    }
}
