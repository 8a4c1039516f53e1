//! Per-queue message delivery with ack/release discipline (spec §4.3 — C3).
//!
//! Strict FIFO per queue; no cross-queue ordering is assumed or provided.
//! A caller that obtains a [`Message`] from [`QueueSubscriber::process`]
//! must call [`QueueSubscriber::message_done`] exactly once before the
//! next `process` call advances the consumer index — repeated or skipped
//! release is a caller bug, not a recoverable error (spec §4.3 discipline
//! 1 and 3), so it's caught with a `debug_assert` rather than threaded
//! through `Result`.

use crate::error::{VmError, VmResult};
use crate::ring::QueueId;
use crate::session::{QueueHandle, Session};
use std::sync::atomic::Ordering;

/// A delivered message: a borrow of the producer's user-data word and
/// payload, valid until [`QueueSubscriber::message_done`] is called.
pub struct Message<'a> {
    pub seq: u64,
    pub udata: u32,
    pub payload: &'a [u8],
}

/// Consumer-side cursor over one queue.
pub struct QueueSubscriber<'a, 's> {
    session: &'s Session<'a>,
    handle: QueueHandle,
    pending_slot: Option<u32>,
}

impl<'a, 's> QueueSubscriber<'a, 's> {
    pub fn new(session: &'s Session<'a>, handle: QueueHandle) -> Self {
        Self {
            session,
            handle,
            pending_slot: None,
        }
    }

    pub fn queue(&self) -> QueueId {
        self.handle.queue
    }

    /// Non-blocking. `Err(QueueEmpty)` when producer index == consumer
    /// index; otherwise the next message in FIFO order.
    pub fn process(&mut self) -> VmResult<Message<'a>> {
        debug_assert!(
            self.pending_slot.is_none(),
            "process() called again before message_done()"
        );

        let region = self.session.region();
        let queue = self.handle.queue;
        let desc = region.queue_descriptor(queue)?;

        let write_index = region.write_index_atomic(queue)?.load(Ordering::Acquire);
        let read_index = region.read_index_atomic(queue)?.load(Ordering::Relaxed);

        if read_index == write_index {
            return Err(VmError::QueueEmpty);
        }

        let slab = region.slab(&desc)?;
        let slot = slab
            .get(read_index as usize)
            .ok_or(VmError::Corrupt("read index out of slab bounds"))?;
        let payload = region.payload(slot)?;

        region
            .pending_ack_atomic(queue)?
            .fetch_or(1u64 << (read_index % 64), Ordering::Relaxed);
        self.pending_slot = Some(read_index);

        Ok(Message {
            seq: slot.seq,
            udata: slot.udata,
            payload,
        })
    }

    /// Releases the current message: advances the consumer index and
    /// clears the slot's pending-ack bit (spec §4.3).
    pub fn message_done(&mut self) {
        let slot = self
            .pending_slot
            .take()
            .expect("message_done() called with no message outstanding");

        let region = self.session.region();
        let queue = self.handle.queue;
        let desc = region
            .queue_descriptor(queue)
            .expect("queue descriptor vanished under an open subscription");

        region
            .pending_ack_atomic(queue)
            .expect("pending-ack word vanished under an open subscription")
            .fetch_and(!(1u64 << (slot % 64)), Ordering::Relaxed);

        let next = (slot + 1) % desc.capacity;
        region
            .read_index_atomic(queue)
            .expect("read index word vanished under an open subscription")
            .store(next, Ordering::Release);
    }

    pub fn into_handle(self) -> QueueHandle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_support::build_region;
    use std::time::Duration;

    #[test]
    fn delivers_messages_in_order_and_then_empties() {
        let bytes = build_region(&[b"one", b"two", b"three"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let handle = session.subscribe(QueueId::Frame).unwrap();
        let mut sub = QueueSubscriber::new(&session, handle);

        for expected in [&b"one"[..], &b"two"[..], &b"three"[..]] {
            let msg = sub.process().unwrap();
            assert_eq!(msg.payload, expected);
            sub.message_done();
        }

        assert!(matches!(sub.process().unwrap_err(), VmError::QueueEmpty));
    }

    #[test]
    fn message_done_exactly_once_advances_consumer_index() {
        let bytes = build_region(&[b"a", b"b"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let handle = session.subscribe(QueueId::Frame).unwrap();
        let mut sub = QueueSubscriber::new(&session, handle);

        let msg = sub.process().unwrap();
        assert_eq!(msg.payload, b"a");
        sub.message_done();

        let msg = sub.process().unwrap();
        assert_eq!(msg.payload, b"b");
        sub.message_done();
    }

    #[test]
    #[should_panic]
    fn message_done_without_pending_message_panics() {
        let bytes = build_region(&[b"a"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        let handle = session.subscribe(QueueId::Frame).unwrap();
        let mut sub = QueueSubscriber::new(&session, handle);
        sub.message_done();
    }
}
