//! Per-peer connection state: outbound sequencing, acknowledgement and
//! in-order filtering of inbound messages.

use std::collections::VecDeque;
use std::sync::mpsc;

use tracing::{debug, trace, warn};

use crate::swiss::VatId;
use crate::wire::{Message, Op};

/// Outbound half of a link, handed to `Vat::connection_made`.
pub trait QueueHandle {
    fn push(&mut self, message: Message);
}

impl QueueHandle for mpsc::Sender<Message> {
    fn push(&mut self, message: Message) {
        if self.send(message).is_err() {
            debug!("peer queue closed; message left for retransmission");
        }
    }
}

/// What the connection made of one inbound message.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// In sequence: acked and ready for the scheduler.
    Accepted { seqnum: u64, op: Op },
    /// Duplicate or gap; the peer is expected to retransmit.
    Discarded { seqnum: u64, expected: u64 },
    /// An ack, releasing `released` buffered messages.
    Acked { seqnum: u64, released: usize },
}

pub struct Connection {
    peer: VatId,
    next_seqnum: u64,
    acked_through: Option<u64>,
    expected_inbound: u64,
    unacked: VecDeque<Message>,
    // Acks owed to the peer while no queue is attached.
    owed_acks: Vec<u64>,
    queue: Option<Box<dyn QueueHandle>>,
    max_unacked: usize,
}

impl Connection {
    pub fn new(peer: VatId, max_unacked: usize) -> Self {
        Self {
            peer,
            next_seqnum: 0,
            acked_through: None,
            expected_inbound: 0,
            unacked: VecDeque::new(),
            owed_acks: Vec::new(),
            queue: None,
            max_unacked,
        }
    }

    pub fn next_seqnum(&self) -> u64 {
        self.next_seqnum
    }

    pub fn acked_through(&self) -> Option<u64> {
        self.acked_through
    }

    pub fn expected_inbound(&self) -> u64 {
        self.expected_inbound
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn unacked_seqnums(&self) -> Vec<u64> {
        self.unacked.iter().map(Message::seqnum).collect()
    }

    pub fn is_attached(&self) -> bool {
        self.queue.is_some()
    }

    /// Attach (or replace) the outbound queue and flush everything the peer
    /// has not yet acknowledged, in sequence order.
    pub fn attach(&mut self, queue: Box<dyn QueueHandle>) {
        self.queue = Some(queue);
        for seqnum in std::mem::take(&mut self.owed_acks) {
            self.transmit(Message::Ack { seqnum });
        }
        let pending: Vec<Message> = self.unacked.iter().cloned().collect();
        for message in pending {
            self.transmit(message);
        }
    }

    /// Sequence `op`, keep it until acknowledged, and transmit it if a queue
    /// is attached.
    pub fn send(&mut self, op: Op) -> u64 {
        let seqnum = self.next_seqnum;
        self.next_seqnum += 1;
        let message = Message::Op { seqnum, op };
        if self.queue.is_some() {
            self.transmit(message.clone());
        }
        self.unacked.push_back(message);
        if self.unacked.len() > self.max_unacked {
            warn!(
                peer = %self.peer,
                unacked = self.unacked.len(),
                "unacknowledged buffer above limit"
            );
        }
        seqnum
    }

    pub fn receive(&mut self, message: Message) -> Inbound {
        match message {
            Message::Ack { seqnum } => self.receive_ack(seqnum),
            Message::Op { seqnum, op } => {
                if seqnum != self.expected_inbound {
                    // The peer missed our ack for something already delivered.
                    if seqnum < self.expected_inbound {
                        self.transmit(Message::Ack { seqnum });
                    }
                    debug!(
                        peer = %self.peer,
                        seqnum,
                        expected = self.expected_inbound,
                        "discarding out-of-sequence message"
                    );
                    return Inbound::Discarded {
                        seqnum,
                        expected: self.expected_inbound,
                    };
                }
                self.expected_inbound += 1;
                if self.queue.is_some() {
                    self.transmit(Message::Ack { seqnum });
                } else {
                    self.owed_acks.push(seqnum);
                }
                Inbound::Accepted { seqnum, op }
            }
        }
    }

    fn receive_ack(&mut self, seqnum: u64) -> Inbound {
        if seqnum >= self.next_seqnum {
            debug!(peer = %self.peer, seqnum, "ignoring ack for a message never sent");
            return Inbound::Acked { seqnum, released: 0 };
        }
        let before = self.unacked.len();
        self.unacked.retain(|m| m.seqnum() > seqnum);
        let released = before - self.unacked.len();
        if self.acked_through.is_none_or(|through| seqnum > through) {
            self.acked_through = Some(seqnum);
        }
        trace!(peer = %self.peer, seqnum, released, "ack");
        Inbound::Acked { seqnum, released }
    }

    /// Resend every unacknowledged message. Returns how many were sent.
    pub fn retransmit(&mut self) -> usize {
        if !self.is_attached() {
            return 0;
        }
        let pending: Vec<Message> = self.unacked.iter().cloned().collect();
        let count = pending.len();
        for message in pending {
            self.transmit(message);
        }
        count
    }

    fn transmit(&mut self, message: Message) {
        if let Some(queue) = self.queue.as_mut() {
            queue.push(message);
        }
    }
}
