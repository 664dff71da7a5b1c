//! In-memory links between vats, with inspection helpers for driving
//! protocol traces step by step.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::rc::Rc;

use anyhow::{Result, anyhow, bail};

use crate::comms::QueueHandle;
use crate::swiss::VatId;
use crate::vat::Vat;
use crate::wire::{self, Message};

/// One message observed on a link.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub from: VatId,
    pub to: VatId,
    pub message: Message,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = wire::to_json(&self.message).map_err(|_| fmt::Error)?;
        write!(f, "{}->{} {}", self.from, self.to, body)
    }
}

#[derive(Default)]
struct Links {
    queues: BTreeMap<(VatId, VatId), VecDeque<Message>>,
    trace: Vec<Frame>,
}

/// A set of directed in-memory queues. Clones share state.
#[derive(Clone, Default)]
pub struct Queues {
    links: Rc<RefCell<Links>>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the `from -> to` queue and return the handle `from` writes to.
    pub fn add_queue(&self, from: impl Into<VatId>, to: impl Into<VatId>) -> QueueRef {
        let (from, to) = (from.into(), to.into());
        self.links
            .borrow_mut()
            .queues
            .entry((from.clone(), to.clone()))
            .or_default();
        QueueRef {
            links: self.links.clone(),
            from,
            to,
        }
    }

    pub fn pop(&self, from: &str, to: &str) -> Option<Message> {
        self.links
            .borrow_mut()
            .queues
            .get_mut(&(VatId::from(from), VatId::from(to)))
            .and_then(VecDeque::pop_front)
    }

    pub fn len(&self, from: &str, to: &str) -> usize {
        self.links
            .borrow()
            .queues
            .get(&(VatId::from(from), VatId::from(to)))
            .map_or(0, VecDeque::len)
    }

    /// Pop the next message on `from -> to` and check it equals `expected`.
    pub fn expect(&self, from: &str, to: &str, expected: &Message) -> Result<Message> {
        let got = self
            .pop(from, to)
            .ok_or_else(|| anyhow!("expected a message on {from}->{to}, queue is empty"))?;
        if &got != expected {
            bail!(
                "unexpected message on {from}->{to}: got {}, expected {}",
                wire::to_json(&got)?,
                wire::to_json(expected)?
            );
        }
        Ok(got)
    }

    pub fn expect_empty(&self, from: &str, to: &str) -> Result<()> {
        if let Some(got) = self.pop(from, to) {
            bail!("expected {from}->{to} to be empty, found {}", wire::to_json(&got)?);
        }
        Ok(())
    }

    /// Pop an `ack(seqnum)` on `from -> to` and hand it to `receiver`.
    pub fn expect_and_deliver_ack(
        &self,
        from: &str,
        to: &str,
        receiver: &mut Vat,
        seqnum: u64,
    ) -> Result<()> {
        let ack = self.expect(from, to, &Message::ack(seqnum))?;
        receiver.comms_received(from, ack);
        Ok(())
    }

    /// Every message pushed so far, in push order.
    pub fn trace(&self) -> Vec<Frame> {
        self.links.borrow().trace.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.links.borrow().queues.values().all(VecDeque::is_empty)
    }

    /// Deliver queued messages to their vats and drain them until every
    /// queue is empty and every vat is idle. Returns the number of messages
    /// delivered.
    pub fn pump(&self, vats: &mut [&mut Vat]) -> Result<usize> {
        let mut delivered = 0;
        loop {
            let keys: Vec<(VatId, VatId)> = self.links.borrow().queues.keys().cloned().collect();
            let mut moved = false;
            for (from, to) in keys {
                while let Some(message) = self.pop(from.as_str(), to.as_str()) {
                    let vat = vats
                        .iter_mut()
                        .find(|v| v.id() == &to)
                        .ok_or_else(|| anyhow!("no vat named {to} to receive from {from}"))?;
                    vat.comms_received(from.clone(), message);
                    delivered += 1;
                    moved = true;
                }
            }
            for vat in vats.iter_mut() {
                if !vat.is_idle() {
                    vat.drain();
                    moved = true;
                }
            }
            if !moved {
                return Ok(delivered);
            }
        }
    }
}

/// Write end of one `from -> to` queue.
pub struct QueueRef {
    links: Rc<RefCell<Links>>,
    from: VatId,
    to: VatId,
}

impl QueueHandle for QueueRef {
    fn push(&mut self, message: Message) {
        let mut links = self.links.borrow_mut();
        links.trace.push(Frame {
            from: self.from.clone(),
            to: self.to.clone(),
            message: message.clone(),
        });
        links
            .queues
            .entry((self.from.clone(), self.to.clone()))
            .or_default()
            .push_back(message);
    }
}
