use crate::{
    server::connection::ConnectionHandle,
    wire::{PushFrame, SerializeMode},
};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::Mutex,
};
use tracing::{debug, trace, warn};

/// Topic → subscriber fan-out, one map per serialize mode.
///
/// Subscribers are kept in insertion order; a single publish dispatches in
/// that order, and per-subscriber FIFO follows from each connection's send
/// queue. Both maps live under one lock so `remove_all` is atomic with
/// respect to concurrent publishes.
#[derive(Debug, Default)]
pub(crate) struct Broker {
    maps: Mutex<Maps>,
}

#[derive(Debug, Default)]
struct Maps {
    structured: HashMap<String, Vec<ConnectionHandle>>,
    raw: HashMap<String, Vec<ConnectionHandle>>,
}

impl Maps {
    fn map_mut(&mut self, mode: SerializeMode) -> &mut HashMap<String, Vec<ConnectionHandle>> {
        match mode {
            SerializeMode::Structured => &mut self.structured,
            SerializeMode::Raw => &mut self.raw,
        }
    }
}

impl Broker {
    /// Add a subscriber to a topic. Idempotent per session.
    pub(crate) fn subscribe(&self, conn: ConnectionHandle, topic: String, mode: SerializeMode) {
        let mut maps = self.maps.lock().expect("broker lock poisoned");
        let subs = maps.map_mut(mode).entry(topic).or_default();
        if !subs.iter().any(|s| s.session_id() == conn.session_id()) {
            subs.push(conn);
        }
    }

    /// Remove a subscriber from a topic. Absent entries are a no-op.
    pub(crate) fn cancel(&self, session_id: &str, topic: &str, mode: SerializeMode) {
        let mut maps = self.maps.lock().expect("broker lock poisoned");
        let map = maps.map_mut(mode);
        if let Some(subs) = map.get_mut(topic) {
            subs.retain(|s| s.session_id() != session_id);
            if subs.is_empty() {
                map.remove(topic);
            }
        }
    }

    /// Drop every subscription a closing connection holds. Called from the
    /// connection's teardown, before the disconnect notification fires.
    pub(crate) fn remove_all(&self, session_id: &str) {
        let mut maps = self.maps.lock().expect("broker lock poisoned");
        let Maps { structured, raw } = &mut *maps;
        for map in [structured, raw] {
            map.retain(|_, subs| {
                subs.retain(|s| s.session_id() != session_id);
                !subs.is_empty()
            });
        }
    }

    /// Fan a published message out to every subscriber of `(topic, mode)`,
    /// in insertion order. Delivery is best-effort: a subscriber whose send
    /// queue has gone away is disconnected and removed; the others are
    /// unaffected. Worker-thread context.
    pub(crate) fn publish(&self, topic: &str, message_name: &str, body: Bytes, mode: SerializeMode) {
        let frame = PushFrame {
            mode,
            protocol: topic.to_owned(),
            message_name: message_name.to_owned(),
            body,
        };
        let wire = match frame.encode() {
            Ok(wire) => wire,
            Err(err) => {
                warn!(%err, topic, "dropping unencodable publish");
                return;
            }
        };

        // Snapshot under the lock, enqueue outside it. A subscriber removed
        // concurrently has a closed queue, so the enqueue fails rather than
        // ghost-dispatching.
        let targets: Vec<ConnectionHandle> = {
            let mut maps = self.maps.lock().expect("broker lock poisoned");
            maps.map_mut(mode).get(topic).cloned().unwrap_or_default()
        };
        if targets.is_empty() {
            trace!(topic, "publish with no subscribers");
            return;
        }

        let mut dead = Vec::new();
        for sub in &targets {
            if sub.enqueue_blocking(wire.clone()).is_err() {
                debug!(session_id = %sub.session_id(), topic, "subscriber send failed");
                dead.push(sub.clone());
            }
        }

        for sub in dead {
            sub.disconnect();
            self.remove_all(sub.session_id());
        }
    }

    #[cfg(test)]
    pub(crate) fn subscription_count(&self) -> usize {
        let maps = self.maps.lock().expect("broker lock poisoned");
        maps.structured.values().map(Vec::len).sum::<usize>()
            + maps.raw.values().map(Vec::len).sum::<usize>()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::server::connection::test_handle;

    #[test]
    fn subscribe_is_idempotent_per_session() {
        let broker = Broker::default();
        let (conn, _rx) = test_handle("s1");

        broker.subscribe(conn.clone(), "prices".into(), SerializeMode::Raw);
        broker.subscribe(conn, "prices".into(), SerializeMode::Raw);
        assert_eq!(broker.subscription_count(), 1);
    }

    #[test]
    fn modes_are_disjoint() {
        let broker = Broker::default();
        let (conn, _rx) = test_handle("s1");

        broker.subscribe(conn.clone(), "prices".into(), SerializeMode::Raw);
        broker.subscribe(conn, "prices".into(), SerializeMode::Structured);
        assert_eq!(broker.subscription_count(), 2);

        broker.cancel("s1", "prices", SerializeMode::Raw);
        assert_eq!(broker.subscription_count(), 1);
    }

    #[test]
    fn cancel_of_absent_topic_is_a_no_op() {
        let broker = Broker::default();
        broker.cancel("s1", "nope", SerializeMode::Raw);
        assert_eq!(broker.subscription_count(), 0);
    }

    #[test]
    fn remove_all_clears_every_topic() {
        let broker = Broker::default();
        let (a, _rx_a) = test_handle("a");
        let (b, _rx_b) = test_handle("b");

        broker.subscribe(a.clone(), "x".into(), SerializeMode::Raw);
        broker.subscribe(a.clone(), "y".into(), SerializeMode::Structured);
        broker.subscribe(b, "x".into(), SerializeMode::Raw);
        assert_eq!(broker.subscription_count(), 3);

        broker.remove_all("a");
        assert_eq!(broker.subscription_count(), 1);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_in_insertion_order() {
        let broker = Broker::default();
        let (a, mut rx_a) = test_handle("a");
        let (b, mut rx_b) = test_handle("b");

        broker.subscribe(a, "prices".into(), SerializeMode::Raw);
        broker.subscribe(b, "prices".into(), SerializeMode::Raw);

        let broker = std::sync::Arc::new(broker);
        let publisher = broker.clone();
        tokio::task::spawn_blocking(move || {
            publisher.publish("prices", "", Bytes::from_static(b"42"), SerializeMode::Raw);
        })
        .await
        .unwrap();

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned_on_publish() {
        let broker = std::sync::Arc::new(Broker::default());
        let (a, rx_a) = test_handle("a");
        let (b, mut rx_b) = test_handle("b");

        broker.subscribe(a, "prices".into(), SerializeMode::Raw);
        broker.subscribe(b, "prices".into(), SerializeMode::Raw);
        drop(rx_a);

        let publisher = broker.clone();
        tokio::task::spawn_blocking(move || {
            publisher.publish("prices", "", Bytes::from_static(b"1"), SerializeMode::Raw);
        })
        .await
        .expect("publish task");

        assert!(rx_b.recv().await.is_some());
        assert_eq!(broker.subscription_count(), 1);
    }
}
