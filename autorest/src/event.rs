use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::ServiceId;

/// Local subscriber callback, invoked with the event payload.
pub type EventHandler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// System relay callback. It receives the `(owner service, property name)`
/// identity plus the JSON-encoded payload, so one shared callback can
/// correlate any raise to its endpoint.
pub type RelayHandler = Arc<dyn Fn(ServiceId, &str, Value) + Send + Sync>;

enum Subscriber<T> {
    Direct(EventHandler<T>),
    Relay(RelayHandler),
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        match self {
            Subscriber::Direct(h) => Subscriber::Direct(h.clone()),
            Subscriber::Relay(h) => Subscriber::Relay(h.clone()),
        }
    }
}

struct Inner<T> {
    /// Injected once during registration; the bus does not know its own
    /// identity before that.
    identity: Option<(ServiceId, String)>,
    subscribers: Vec<Subscriber<T>>,
}

/// Typed publish/subscribe primitive exposed as a service property, usable
/// both in-process and relayed across the transport.
///
/// Cloning yields another handle to the same subscriber list. Payload-less
/// events use the default `()` parameter.
pub struct ServerSideEvent<T = ()> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ServerSideEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for ServerSideEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ServerSideEvent<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                identity: None,
                subscribers: Vec::new(),
            })),
        }
    }

    /// Injects the owner/property identity. Called exactly once, during
    /// registration.
    ///
    /// # Panics
    ///
    /// Panics on a second call; attaching one bus twice is a programmer
    /// error.
    pub fn attach(&self, owner: ServiceId, property_name: &str) {
        let mut inner = self.inner.lock();
        assert!(
            inner.identity.is_none(),
            "event bus already attached as {:?}",
            inner.identity
        );
        inner.identity = Some((owner, property_name.to_string()));
    }

    #[must_use]
    pub fn identity(&self) -> Option<(ServiceId, String)> {
        self.inner.lock().identity.clone()
    }

    /// Appends a direct subscriber.
    pub fn subscribe(&self, handler: EventHandler<T>) {
        self.inner.lock().subscribers.push(Subscriber::Direct(handler));
    }

    /// Removes a direct subscriber by handler identity.
    pub fn unsubscribe(&self, handler: &EventHandler<T>) {
        self.inner.lock().subscribers.retain(|s| match s {
            Subscriber::Direct(h) => !Arc::ptr_eq(h, handler),
            Subscriber::Relay(_) => true,
        });
    }

    /// Appends a relay subscriber.
    pub fn subscribe_relay(&self, handler: RelayHandler) {
        self.inner.lock().subscribers.push(Subscriber::Relay(handler));
    }

    /// Removes a relay subscriber, matching the handler that was passed to
    /// [`subscribe_relay`](Self::subscribe_relay).
    pub fn unsubscribe_relay(&self, handler: &RelayHandler) {
        self.inner.lock().subscribers.retain(|s| match s {
            Subscriber::Direct(_) => true,
            Subscriber::Relay(h) => !Arc::ptr_eq(h, handler),
        });
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

impl<T: Serialize> ServerSideEvent<T> {
    /// Delivers the payload to every subscriber in registration order.
    ///
    /// Direct subscribers receive the payload as-is. Relay subscribers
    /// receive the injected owner/property identity instead of the sender;
    /// an unattached bus skips its relay subscribers. The payload is
    /// JSON-encoded at most once per raise.
    pub fn raise(&self, args: &T) {
        let (identity, subscribers) = {
            let inner = self.inner.lock();
            (inner.identity.clone(), inner.subscribers.clone())
        };

        let mut encoded: Option<Value> = None;
        for subscriber in &subscribers {
            match subscriber {
                Subscriber::Direct(handler) => handler(args),
                Subscriber::Relay(handler) => {
                    let Some((owner, name)) = &identity else {
                        continue;
                    };
                    let payload = encoded
                        .get_or_insert_with(|| {
                            serde_json::to_value(args).unwrap_or(Value::Null)
                        })
                        .clone();
                    handler(*owner, name, payload);
                }
            }
        }
    }
}
