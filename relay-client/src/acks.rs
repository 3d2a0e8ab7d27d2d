//! Broker acknowledgement correlation
//!
//! `rumqttc` assigns packet ids inside its event loop, so callers cannot know
//! theirs up front. Requests are queued in submission order and bound to a
//! packet id when the matching `Outgoing` event is observed; the event loop
//! processes its request channel in order, which keeps the two sequences
//! aligned. Only QoS 1 publishes are tracked.

use shared::QoS;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

use crate::error::{PublishError, SubscribeError};

pub(crate) type PublishAck = oneshot::Sender<Result<(), PublishError>>;
pub(crate) type SubscribeAck = oneshot::Sender<Result<QoS, SubscribeError>>;

#[derive(Default)]
pub(crate) struct AckTracker {
    queued_publishes: VecDeque<PublishAck>,
    queued_subscribes: VecDeque<(String, SubscribeAck)>,
    inflight_publishes: HashMap<u16, PublishAck>,
    inflight_subscribes: HashMap<u16, (String, SubscribeAck)>,
}

impl AckTracker {
    pub fn queue_publish(&mut self, ack: PublishAck) {
        self.queued_publishes.push_back(ack);
    }

    /// Undo the last `queue_publish` when the request never reached the event loop
    pub fn unqueue_publish(&mut self) {
        self.queued_publishes.pop_back();
    }

    pub fn queue_subscribe(&mut self, topic: &str, ack: SubscribeAck) {
        self.queued_subscribes.push_back((topic.to_string(), ack));
    }

    pub fn unqueue_subscribe(&mut self) {
        self.queued_subscribes.pop_back();
    }

    /// A PUBLISH left the event loop
    pub fn on_outgoing_publish(&mut self, pkid: u16) {
        // QoS 0
        if pkid == 0 {
            return;
        }
        // Retransmission after reconnect keeps its original binding
        if self.inflight_publishes.contains_key(&pkid) {
            return;
        }
        match self.queued_publishes.pop_front() {
            Some(ack) => {
                self.inflight_publishes.insert(pkid, ack);
            }
            None => tracing::trace!(pkid, "Outgoing publish without a waiting caller"),
        }
    }

    pub fn on_puback(&mut self, pkid: u16) {
        if let Some(ack) = self.inflight_publishes.remove(&pkid) {
            let _ = ack.send(Ok(()));
        }
    }

    /// A SUBSCRIBE left the event loop
    pub fn on_outgoing_subscribe(&mut self, pkid: u16) {
        match self.queued_subscribes.pop_front() {
            Some(entry) => {
                self.inflight_subscribes.insert(pkid, entry);
            }
            None => tracing::trace!(pkid, "Outgoing subscribe without a waiting caller"),
        }
    }

    /// SUBACK received; `granted` is `None` for a failure return code
    pub fn on_suback(&mut self, pkid: u16, granted: Option<QoS>) {
        if let Some((topic, ack)) = self.inflight_subscribes.remove(&pkid) {
            let result = granted.ok_or(SubscribeError::Rejected(topic));
            let _ = ack.send(result);
        }
    }

    /// Connection dropped
    ///
    /// Written SUBSCRIBEs are not replayed by the transport, so their waiters
    /// fail now. Queued requests stay: they are still in the request channel
    /// and go out after the reconnect. In-flight QoS 1 publishes are
    /// retransmitted with their packet id.
    pub fn on_interrupted(&mut self, reason: &str) {
        for (_, (_, ack)) in self.inflight_subscribes.drain() {
            let _ = ack.send(Err(SubscribeError::Interrupted(reason.to_string())));
        }
    }

    /// Event loop stopped; nothing will be acknowledged any more
    pub fn close(&mut self) {
        for ack in self.queued_publishes.drain(..) {
            let _ = ack.send(Err(PublishError::Closed));
        }
        for (_, ack) in self.inflight_publishes.drain() {
            let _ = ack.send(Err(PublishError::Closed));
        }
        for (_, ack) in self.queued_subscribes.drain(..) {
            let _ = ack.send(Err(SubscribeError::Closed));
        }
        for (_, (_, ack)) in self.inflight_subscribes.drain() {
            let _ = ack.send(Err(SubscribeError::Closed));
        }
    }

    pub fn pending(&self) -> usize {
        self.queued_publishes.len()
            + self.inflight_publishes.len()
            + self.queued_subscribes.len()
            + self.inflight_subscribes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_bound_in_order() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        tracker.queue_publish(tx1);
        tracker.queue_publish(tx2);

        tracker.on_outgoing_publish(7);
        tracker.on_outgoing_publish(8);
        tracker.on_puback(8);

        assert!(rx1.try_recv().is_err());
        assert!(matches!(rx2.try_recv(), Ok(Ok(()))));

        tracker.on_puback(7);
        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_qos0_publish_not_tracked() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.queue_publish(tx);

        tracker.on_outgoing_publish(0);
        tracker.on_outgoing_publish(3);
        tracker.on_puback(3);
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
    }

    #[test]
    fn test_retransmission_keeps_binding() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        tracker.queue_publish(tx1);
        tracker.on_outgoing_publish(5);
        tracker.queue_publish(tx2);

        // replayed after reconnect
        tracker.on_outgoing_publish(5);
        tracker.on_puback(5);

        assert!(matches!(rx1.try_recv(), Ok(Ok(()))));
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_suback_rejection() {
        let mut tracker = AckTracker::default();
        let (tx, mut rx) = oneshot::channel();
        tracker.queue_subscribe("work/in", tx);
        tracker.on_outgoing_subscribe(1);
        tracker.on_suback(1, None);

        match rx.try_recv() {
            Ok(Err(SubscribeError::Rejected(topic))) => assert_eq!(topic, "work/in"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_fails_written_subscribes_only() {
        let mut tracker = AckTracker::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        tracker.queue_subscribe("a", tx1);
        tracker.on_outgoing_subscribe(1);
        tracker.queue_subscribe("b", tx2);

        tracker.on_interrupted("network down");

        assert!(matches!(rx1.try_recv(), Ok(Err(SubscribeError::Interrupted(_)))));
        assert!(rx2.try_recv().is_err());

        tracker.on_outgoing_subscribe(2);
        tracker.on_suback(2, Some(QoS::AtLeastOnce));
        assert!(matches!(rx2.try_recv(), Ok(Ok(QoS::AtLeastOnce))));
    }

    #[test]
    fn test_close_fails_everything() {
        let mut tracker = AckTracker::default();
        let (ptx, mut prx) = oneshot::channel();
        let (stx, mut srx) = oneshot::channel();
        tracker.queue_publish(ptx);
        tracker.queue_subscribe("a", stx);

        tracker.close();

        assert!(matches!(prx.try_recv(), Ok(Err(PublishError::Closed))));
        assert!(matches!(srx.try_recv(), Ok(Err(SubscribeError::Closed))));
        assert_eq!(tracker.pending(), 0);
    }
}
