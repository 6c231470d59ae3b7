//! Links: the transport association between two devices.
//!
//! A link exists while at least one map crosses between its devices. The
//! send side batches outgoing updates into a timetagged bundle between
//! `start_queue` and `send_queue`, so updates flushed together arrive
//! atomically at the peer's poll.

use std::net::SocketAddr;

use rosc::OscMessage;

use crate::id::Id;
use crate::time::Timetag;

#[derive(Debug)]
pub struct LinkRecord {
    pub id: Id,
    pub local_device: Id,
    pub remote_device: Id,
    /// Remote mesh address, once known.
    pub addr: Option<SocketAddr>,
    /// Maps using the link, `[outgoing, incoming]`.
    pub num_maps: [usize; 2],
    queue_time: Timetag,
    queue: Vec<OscMessage>,
}

impl LinkRecord {
    pub(crate) fn new(local: Id, remote: Id, addr: Option<SocketAddr>) -> Self {
        LinkRecord {
            id: Self::link_id(local, remote),
            local_device: local,
            remote_device: remote,
            addr,
            num_maps: [0, 0],
            queue_time: Timetag::IMMEDIATE,
            queue: Vec::new(),
        }
    }

    /// Order-independent id for a device pair. The low word marks link
    /// ids apart from device ids.
    pub fn link_id(a: Id, b: Id) -> Id {
        Id::from_u64(a.as_u64() ^ b.as_u64()).child(1)
    }

    pub fn total_maps(&self) -> usize {
        self.num_maps[0] + self.num_maps[1]
    }

    /// Opens a fresh bundle; anything still queued is carried over.
    pub(crate) fn start_queue(&mut self, time: Timetag) {
        self.queue_time = time;
    }

    pub(crate) fn queue_message(&mut self, msg: OscMessage) {
        self.queue.push(msg);
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Takes the queued bundle for transmission.
    pub(crate) fn take_queue(&mut self) -> Option<(Timetag, Vec<OscMessage>)> {
        if self.queue.is_empty() {
            return None;
        }
        Some((self.queue_time, std::mem::take(&mut self.queue)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_id_is_order_independent_and_distinct() {
        let a = Id::for_device_name("a.1");
        let b = Id::for_device_name("b.1");
        assert_eq!(LinkRecord::link_id(a, b), LinkRecord::link_id(b, a));
        assert_ne!(LinkRecord::link_id(a, b), a);
        assert_ne!(LinkRecord::link_id(a, b), b);
    }

    #[test]
    fn queue_accumulates_until_taken() {
        let mut link = LinkRecord::new(
            Id::for_device_name("a.1"),
            Id::for_device_name("b.1"),
            None,
        );
        link.start_queue(Timetag::new(10, 0));
        assert!(link.take_queue().is_none());
        link.queue_message(OscMessage {
            addr: "/b.1/in".to_string(),
            args: vec![],
        });
        link.queue_message(OscMessage {
            addr: "/b.1/in".to_string(),
            args: vec![],
        });
        assert!(link.has_queued());
        let (time, msgs) = link.take_queue().unwrap();
        assert_eq!(time, Timetag::new(10, 0));
        assert_eq!(msgs.len(), 2);
        assert!(!link.has_queued());
    }
}
