use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{Error, ErrorKind, Result, ServiceId, wire, wire::EventInvoke};

/// One open event stream. Frames are pushed through the channel whole, so
/// broadcast and keepalive writers never interleave bytes on one stream.
struct Subscription {
    service: ServiceId,
    /// The subscribe route this stream was opened on.
    route: String,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Subscription {
    fn push(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| {
            Error::new(
                ErrorKind::TransportWrite,
                format!("stream of {} is gone", self.peer),
            )
        })
    }
}

/// Tracks open event streams, fans raises out to them and prunes broken
/// connections. Safe against concurrent subscribes, broadcasts and the
/// keepalive loop.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl SubscriptionManager {
    pub(crate) fn add(
        &self,
        service: ServiceId,
        route: String,
        peer: SocketAddr,
        tx: mpsc::UnboundedSender<Bytes>,
    ) {
        self.subscriptions.lock().push(Subscription {
            service,
            route,
            peer,
            tx,
        });
    }

    /// Writes one event frame to every subscription of `(owner, event)`.
    ///
    /// A failed write marks that subscription for removal; removals are
    /// applied after the pass so delivery to the remaining subscribers is
    /// never affected.
    pub fn broadcast(&self, owner: ServiceId, event_name: &str, payload: Value) {
        let needle = format!("{}/subscribe", event_name.to_lowercase());
        let envelope = EventInvoke {
            server_date_time: wire::timestamp(),
            event_name: event_name.to_string(),
            data: payload.to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap_or_else(|_| String::from("{}"));
        let frame = wire::data_frame(&json);

        let mut subscriptions = self.subscriptions.lock();
        let mut dead = Vec::new();
        for (idx, sub) in subscriptions.iter().enumerate() {
            if sub.service == owner && sub.route.ends_with(&needle) {
                if let Err(err) = sub.push(frame.clone()) {
                    tracing::debug!("pruning subscription: {err}");
                    dead.push(idx);
                }
            }
        }
        for idx in dead.into_iter().rev() {
            subscriptions.remove(idx);
        }
    }

    /// Writes an empty keepalive frame to every live subscription. Broken
    /// connections are pruned; one bad connection never stops the loop.
    pub(crate) fn keepalive(&self) {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|sub| match sub.push(wire::keepalive_frame()) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!("pruning subscription: {err}");
                false
            }
        });
    }

    /// Authoritative unsubscribe: drops the subscriptions a peer holds on
    /// one event. Returns how many streams were closed.
    pub(crate) fn unsubscribe(
        &self,
        service: ServiceId,
        subscribe_route: &str,
        peer_ip: IpAddr,
    ) -> usize {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|sub| {
            !(sub.service == service && sub.route == subscribe_route && sub.peer.ip() == peer_ip)
        });
        before - subscriptions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }
}

impl std::fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionManager")
            .field("open", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn subscribe(
        manager: &SubscriptionManager,
        service: ServiceId,
        route: &str,
        port: u16,
    ) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.add(service, route.to_string(), peer(port), tx);
        rx
    }

    #[test]
    fn test_broadcast_selects_by_owner_and_event() {
        let manager = SubscriptionManager::default();
        let one = Arc::new(1u8);
        let two = Arc::new(2u8);
        let (a, b) = (ServiceId::of(&one), ServiceId::of(&two));

        let mut rx_a = subscribe(&manager, a, "/api/a/tick/subscribe", 1);
        let mut rx_other = subscribe(&manager, a, "/api/a/tock/subscribe", 2);
        let mut rx_b = subscribe(&manager, b, "/api/b/tick/subscribe", 3);

        manager.broadcast(a, "Tick", Value::Null);

        let frame = rx_a.try_recv().unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"EventName\":\"Tick\""));
        assert!(rx_other.try_recv().is_err());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_prunes_after_pass() {
        let manager = SubscriptionManager::default();
        let service = ServiceId::of(&Arc::new(0u8));

        let rx_dead = subscribe(&manager, service, "/api/s/tick/subscribe", 1);
        drop(rx_dead);
        let mut rx_live = subscribe(&manager, service, "/api/s/tick/subscribe", 2);

        manager.broadcast(service, "Tick", Value::from(1));
        assert_eq!(manager.len(), 1);
        assert!(rx_live.try_recv().is_ok());
    }

    #[test]
    fn test_keepalive_prunes_broken() {
        let manager = SubscriptionManager::default();
        let service = ServiceId::of(&Arc::new(0u8));

        let mut rx = subscribe(&manager, service, "/api/s/tick/subscribe", 1);
        drop(subscribe(&manager, service, "/api/s/tick/subscribe", 2));

        manager.keepalive();
        assert_eq!(manager.len(), 1);
        assert_eq!(&rx.try_recv().unwrap()[..], b"data: {}\n\n");
    }

    #[test]
    fn test_dead_stream_yields_transport_write() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sub = Subscription {
            service: ServiceId::of(&Arc::new(0u8)),
            route: "/api/s/tick/subscribe".to_string(),
            peer: peer(1),
            tx,
        };
        let err = sub.push(wire::keepalive_frame()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TransportWrite);
    }

    #[test]
    fn test_unsubscribe_matches_peer() {
        let manager = SubscriptionManager::default();
        let service = ServiceId::of(&Arc::new(0u8));

        let _rx1 = subscribe(&manager, service, "/api/s/tick/subscribe", 1);
        let removed = manager.unsubscribe(
            service,
            "/api/s/tick/subscribe",
            IpAddr::from([127, 0, 0, 1]),
        );
        assert_eq!(removed, 1);
        assert!(manager.is_empty());
    }
}
