//! Vow table: pending results, their reactions, and the remote subscribers
//! that must hear about settlement.

use std::collections::{HashMap, HashSet};
use std::rc::Weak;

use smallvec::SmallVec;

use crate::error::{Rejection, VatError};
use crate::swiss::{SwissNum, VatId};
use crate::value::{Settlement, Value, Vow, VowId};
use crate::vat::Turn;

pub type Callback = Box<dyn FnOnce(&mut Turn<'_>, Settlement) -> Result<Value, Rejection>>;

/// Local work triggered by a vow's settlement. Runs at the next drain.
pub(crate) enum Reaction {
    /// Run `callback` and settle `derived` with what it returns.
    Callback { callback: Callback, derived: VowId },
    /// Settle another vow with the same outcome.
    Forward(VowId),
    /// Deliver a call that was sent to the vow before it settled.
    Deliver {
        method: String,
        args: Vec<Value>,
        result: VowId,
    },
}

/// A remote holder of a vow, addressed by the swiss number it knows the vow by.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscriber {
    pub peer: VatId,
    pub swiss: SwissNum,
}

#[derive(Clone, Debug, PartialEq)]
pub enum VowState {
    Unresolved,
    Resolved(Value),
    Rejected(Rejection),
}

struct VowRecord {
    state: VowState,
    // Resolved to another vow and waiting on it; no longer settleable by hand.
    locked: bool,
    holder: Weak<VowId>,
    reactions: SmallVec<[Reaction; 2]>,
    subscribers: SmallVec<[Subscriber; 2]>,
}

impl VowRecord {
    fn new(state: VowState, holder: &Vow) -> Self {
        Self {
            state,
            locked: false,
            holder: holder.downgrade(),
            reactions: SmallVec::new(),
            subscribers: SmallVec::new(),
        }
    }

    fn is_collectable(&self) -> bool {
        self.state != VowState::Unresolved && self.holder.strong_count() == 0
    }
}

/// Everything a settlement released, for the scheduler to queue.
pub(crate) struct Fired {
    pub reactions: SmallVec<[Reaction; 2]>,
    pub subscribers: SmallVec<[Subscriber; 2]>,
}

/// Outcome of attaching a reaction.
pub(crate) enum Registered {
    Pending,
    /// The vow had already settled; the reaction is handed back to be queued.
    Settled(Reaction, Settlement),
}

#[derive(Default)]
pub struct VowTable {
    next: u64,
    records: HashMap<VowId, VowRecord>,
}

impl VowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self) -> Vow {
        self.insert(VowState::Unresolved)
    }

    pub fn create_settled(&mut self, settlement: Settlement) -> Vow {
        self.insert(match settlement {
            Settlement::Resolved(v) => VowState::Resolved(v),
            Settlement::Rejected(r) => VowState::Rejected(r),
        })
    }

    fn insert(&mut self, state: VowState) -> Vow {
        let vow = Vow::new(VowId(self.next));
        self.next += 1;
        self.records.insert(vow.id(), VowRecord::new(state, &vow));
        vow
    }

    /// A handle on a vow the table still knows, sharing liveness with any
    /// handle already out there.
    pub fn handle(&mut self, id: VowId) -> Option<Vow> {
        let record = self.records.get_mut(&id)?;
        if let Some(vow) = Vow::upgrade(&record.holder) {
            return Some(vow);
        }
        let vow = Vow::new(id);
        record.holder = vow.downgrade();
        Some(vow)
    }

    pub fn state(&self, id: VowId) -> Option<&VowState> {
        self.records.get(&id).map(|r| &r.state)
    }

    /// `None` while unresolved (or unknown).
    pub fn settlement(&self, id: VowId) -> Option<Settlement> {
        match self.state(id)? {
            VowState::Unresolved => None,
            VowState::Resolved(v) => Some(Settlement::Resolved(v.clone())),
            VowState::Rejected(r) => Some(Settlement::Rejected(r.clone())),
        }
    }

    pub fn is_unresolved(&self, id: VowId) -> bool {
        matches!(self.state(id), Some(VowState::Unresolved))
    }

    /// Unresolved and not already following another vow.
    pub fn is_settleable(&self, id: VowId) -> bool {
        self.records
            .get(&id)
            .is_some_and(|r| r.state == VowState::Unresolved && !r.locked)
    }

    pub fn subscribers(&self, id: VowId) -> &[Subscriber] {
        self.records
            .get(&id)
            .map(|r| r.subscribers.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn lock(&mut self, id: VowId) -> Result<(), VatError> {
        let record = self.records.get_mut(&id).ok_or(VatError::UnknownVow(id))?;
        if record.locked || record.state != VowState::Unresolved {
            return Err(VatError::AlreadySettled(id));
        }
        record.locked = true;
        Ok(())
    }

    /// Record a remote holder. A peer holding the vow under the same swiss
    /// number is recorded once.
    pub(crate) fn subscribe(&mut self, id: VowId, subscriber: Subscriber) -> Result<(), VatError> {
        let record = self.records.get_mut(&id).ok_or(VatError::UnknownVow(id))?;
        if record.state != VowState::Unresolved {
            return Err(VatError::AlreadySettled(id));
        }
        if !record.subscribers.contains(&subscriber) {
            record.subscribers.push(subscriber);
        }
        Ok(())
    }

    pub(crate) fn react(&mut self, id: VowId, reaction: Reaction) -> Result<Registered, VatError> {
        let record = self.records.get_mut(&id).ok_or(VatError::UnknownVow(id))?;
        Ok(match &record.state {
            VowState::Unresolved => {
                record.reactions.push(reaction);
                Registered::Pending
            }
            VowState::Resolved(v) => Registered::Settled(reaction, Settlement::Resolved(v.clone())),
            VowState::Rejected(r) => Registered::Settled(reaction, Settlement::Rejected(r.clone())),
        })
    }

    /// Move an unresolved vow to its terminal state. Locked vows may still be
    /// settled here; that is how a followed vow passes its outcome on.
    pub(crate) fn settle(&mut self, id: VowId, settlement: Settlement) -> Result<Fired, VatError> {
        let record = self.records.get_mut(&id).ok_or(VatError::UnknownVow(id))?;
        if record.state != VowState::Unresolved {
            return Err(VatError::AlreadySettled(id));
        }
        record.state = match settlement {
            Settlement::Resolved(v) => VowState::Resolved(v),
            Settlement::Rejected(r) => VowState::Rejected(r),
        };
        record.locked = false;
        Ok(Fired {
            reactions: std::mem::take(&mut record.reactions),
            subscribers: std::mem::take(&mut record.subscribers),
        })
    }

    /// Forget settled vows that no handle reaches and that are not in
    /// `pinned`. Returns how many went.
    pub fn collect(&mut self, pinned: &HashSet<VowId>) -> usize {
        let before = self.records.len();
        self.records
            .retain(|id, record| !record.is_collectable() || pinned.contains(id));
        before - self.records.len()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(peer: &str, swiss: u64) -> Subscriber {
        Subscriber {
            peer: VatId::from(peer),
            swiss: SwissNum::Num(swiss),
        }
    }

    #[test]
    fn settles_exactly_once() {
        let mut vows = VowTable::new();
        let id = vows.create().id();
        assert!(vows.is_unresolved(id));
        vows.settle(id, Settlement::Resolved(Value::from("done")))
            .unwrap();
        assert_eq!(
            vows.settlement(id),
            Some(Settlement::Resolved(Value::from("done")))
        );
        assert!(matches!(
            vows.settle(id, Settlement::Rejected(Rejection::application("late"))),
            Err(VatError::AlreadySettled(_))
        ));
        assert_eq!(
            vows.state(id),
            Some(&VowState::Resolved(Value::from("done")))
        );
    }

    #[test]
    fn settlement_releases_subscribers_and_reactions_in_order() {
        let mut vows = VowTable::new();
        let id = vows.create().id();
        let a = vows.create().id();
        let b = vows.create().id();
        vows.subscribe(id, sub("vat1", 2)).unwrap();
        vows.subscribe(id, sub("vat3", 2)).unwrap();
        vows.subscribe(id, sub("vat1", 2)).unwrap();
        assert!(matches!(
            vows.react(id, Reaction::Forward(a)).unwrap(),
            Registered::Pending
        ));
        vows.react(id, Reaction::Forward(b)).unwrap();

        let fired = vows
            .settle(id, Settlement::Rejected(Rejection::application("no bids")))
            .unwrap();
        assert_eq!(
            fired.subscribers.as_slice(),
            &[sub("vat1", 2), sub("vat3", 2)]
        );
        let order: Vec<VowId> = fired
            .reactions
            .iter()
            .map(|r| match r {
                Reaction::Forward(v) => *v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![a, b]);
        assert!(vows.subscribers(id).is_empty());
    }

    #[test]
    fn reacting_to_settled_vow_hands_reaction_back() {
        let mut vows = VowTable::new();
        let id = vows.create_settled(Settlement::Resolved(Value::Int(4))).id();
        let target = vows.create().id();
        match vows.react(id, Reaction::Forward(target)).unwrap() {
            Registered::Settled(Reaction::Forward(v), Settlement::Resolved(Value::Int(4))) => {
                assert_eq!(v, target)
            }
            _ => panic!("expected settled registration"),
        }
        assert!(vows.subscribe(id, sub("vat2", 1)).is_err());
    }

    #[test]
    fn locked_vow_refuses_manual_settle_but_accepts_forward() {
        let mut vows = VowTable::new();
        let id = vows.create().id();
        vows.lock(id).unwrap();
        assert!(!vows.is_settleable(id));
        assert!(vows.is_unresolved(id));
        assert!(vows.lock(id).is_err());
        vows.settle(id, Settlement::Resolved(Value::Null)).unwrap();
        assert!(!vows.is_unresolved(id));
    }

    #[test]
    fn settled_vows_go_once_unheld_and_unpinned() {
        let mut vows = VowTable::new();
        let held = vows.create();
        let pending = vows.create().id();
        let pinned = vows.create().id();
        let loose = vows.create().id();
        for id in [held.id(), pinned, loose] {
            vows.settle(id, Settlement::Resolved(Value::Null)).unwrap();
        }
        assert_eq!(vows.len(), 4);

        assert_eq!(vows.collect(&HashSet::from([pinned])), 1);
        assert!(vows.state(loose).is_none());
        assert!(vows.is_unresolved(pending));
        assert!(vows.settlement(held.id()).is_some());

        // a fresh handle keeps a record alive just like the first one did
        let again = vows.handle(pinned).unwrap();
        drop(held);
        assert_eq!(vows.collect(&HashSet::new()), 1);
        assert_eq!(vows.len(), 2);
        assert!(vows.settlement(again.id()).is_some());
        assert!(vows.handle(loose).is_none());
    }
}
