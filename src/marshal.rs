//! Swiss-number registry and marshaller.
//!
//! Exports map swiss numbers owned by this vat to local objects and vows.
//! Imports map (owner vat, swiss) pairs to local presences and vows. Values
//! are encoded per destination peer, because exporting an unresolved vow
//! subscribes that peer to its settlement.

use std::collections::{HashMap, HashSet};
use std::rc::Weak;

use tracing::trace;

use crate::error::{Rejection, VatError};
use crate::swiss::{SwissAllocator, SwissNum, VatId};
use crate::value::{ObjectId, Presence, PresenceInner, Ref, Settlement, Value, VowId};
use crate::vow::{Subscriber, VowState, VowTable};
use crate::wire::{QCLASS, WireValue};

/// What an exported swiss number designates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Export {
    Object(ObjectId),
    Vow(VowId),
}

pub struct Registry {
    vat: VatId,
    alloc: SwissAllocator,
    exports: HashMap<SwissNum, Export>,
    object_swiss: HashMap<ObjectId, SwissNum>,
    vow_swiss: HashMap<VowId, SwissNum>,
    // Result slots are named by the caller's swissbase, so they are scoped
    // to the calling peer.
    result_slots: HashMap<(VatId, SwissNum), VowId>,
    // Vow swiss numbers whose settlement has been broadcast. Never reused.
    retired: HashSet<SwissNum>,
    revoked: HashSet<SwissNum>,
    presences: HashMap<(VatId, SwissNum), Weak<PresenceInner>>,
    imported_vows: HashMap<(VatId, SwissNum), VowId>,
    import_origin: HashMap<VowId, (VatId, SwissNum)>,
}

impl Registry {
    pub fn new(vat: VatId, first_swiss: u64) -> Self {
        Self {
            vat,
            alloc: SwissAllocator::new(first_swiss),
            exports: HashMap::new(),
            object_swiss: HashMap::new(),
            vow_swiss: HashMap::new(),
            result_slots: HashMap::new(),
            retired: HashSet::new(),
            revoked: HashSet::new(),
            presences: HashMap::new(),
            imported_vows: HashMap::new(),
            import_origin: HashMap::new(),
        }
    }

    pub fn next_base(&mut self) -> String {
        self.alloc.next_base()
    }

    /// Export an object under a caller-chosen swiss number (the root).
    pub fn export_at(&mut self, swiss: SwissNum, object: ObjectId) -> Result<(), VatError> {
        if self.exports.contains_key(&swiss)
            || self.retired.contains(&swiss)
            || self.revoked.contains(&swiss)
        {
            return Err(VatError::SwissInUse(swiss.to_string()));
        }
        self.exports.insert(swiss.clone(), Export::Object(object));
        self.object_swiss.insert(object, swiss);
        Ok(())
    }

    pub fn export_object(&mut self, object: ObjectId) -> SwissNum {
        if let Some(swiss) = self.object_swiss.get(&object) {
            return swiss.clone();
        }
        let swiss = self.alloc.next_export();
        trace!(vat = %self.vat, %object, %swiss, "export object");
        self.exports.insert(swiss.clone(), Export::Object(object));
        self.object_swiss.insert(object, swiss.clone());
        swiss
    }

    fn export_vow(&mut self, vow: VowId) -> SwissNum {
        if let Some(swiss) = self.vow_swiss.get(&vow) {
            return swiss.clone();
        }
        let swiss = self.alloc.next_export();
        trace!(vat = %self.vat, %vow, %swiss, "export vow");
        self.exports.insert(swiss.clone(), Export::Vow(vow));
        self.vow_swiss.insert(vow, swiss.clone());
        swiss
    }

    pub fn has_result_slot(&self, peer: &VatId, swiss: &SwissNum) -> bool {
        self.result_slots.contains_key(&(peer.clone(), swiss.clone()))
    }

    /// Bind the result slot a peer named for one of its calls. Fails if the
    /// name is currently bound.
    pub fn open_result_slot(&mut self, peer: &VatId, swiss: SwissNum, vow: VowId) -> bool {
        let key = (peer.clone(), swiss);
        if self.result_slots.contains_key(&key) {
            return false;
        }
        self.result_slots.insert(key, vow);
        true
    }

    /// Unbind a result slot once the caller has acknowledged its resolve.
    pub fn close_result_slot(&mut self, peer: &VatId, swiss: &SwissNum) -> Option<VowId> {
        self.result_slots.remove(&(peer.clone(), swiss.clone()))
    }

    pub fn result_slot_count(&self) -> usize {
        self.result_slots.len()
    }

    /// Find what an inbound `send` from `peer` targets.
    pub fn lookup(&self, peer: &VatId, swiss: &SwissNum) -> Result<Export, Rejection> {
        if let Some(vow) = self.result_slots.get(&(peer.clone(), swiss.clone())) {
            return Ok(Export::Vow(*vow));
        }
        if let Some(export) = self.exports.get(swiss) {
            return Ok(*export);
        }
        if self.retired.contains(swiss) {
            return Err(Rejection::invalid_reference(format!(
                "swiss number {swiss} in vat {} is retired",
                self.vat
            )));
        }
        if self.revoked.contains(swiss) {
            return Err(Rejection::invalid_reference(format!(
                "swiss number {swiss} in vat {} is revoked",
                self.vat
            )));
        }
        Err(Rejection::invalid_reference(format!(
            "unknown swiss number {swiss} in vat {}",
            self.vat
        )))
    }

    /// Retire a settled vow's export once its settlement has been broadcast.
    /// Result slots are left to [`Registry::close_result_slot`].
    pub fn retire_vow(&mut self, vow: VowId) {
        if let Some(swiss) = self.vow_swiss.remove(&vow) {
            self.exports.remove(&swiss);
            self.retired.insert(swiss);
        }
    }

    pub fn is_retired(&self, swiss: &SwissNum) -> bool {
        self.retired.contains(swiss)
    }

    /// Drop an object from the export table. Its swiss number is never reused.
    pub fn revoke_object(&mut self, object: ObjectId) -> bool {
        match self.object_swiss.remove(&object) {
            Some(swiss) => {
                self.exports.remove(&swiss);
                self.revoked.insert(swiss);
                true
            }
            None => false,
        }
    }

    /// Register the local vow standing for a remote result slot or vow.
    pub fn import_vow(&mut self, owner: VatId, swiss: SwissNum, vow: VowId) {
        self.import_origin.insert(vow, (owner.clone(), swiss.clone()));
        self.imported_vows.insert((owner, swiss), vow);
    }

    /// Remove and return the import a `resolve` from `peer` addresses.
    pub fn take_import(&mut self, peer: &VatId, swiss: &SwissNum) -> Option<VowId> {
        let vow = self.imported_vows.remove(&(peer.clone(), swiss.clone()))?;
        self.import_origin.remove(&vow);
        Some(vow)
    }

    /// Where an imported vow lives, for pipelining sends to it.
    pub fn import_origin(&self, vow: VowId) -> Option<&(VatId, SwissNum)> {
        self.import_origin.get(&vow)
    }

    pub fn intern_presence(&mut self, owner: VatId, swiss: SwissNum) -> Presence {
        let key = (owner, swiss);
        if let Some(existing) = self.presences.get(&key).and_then(Presence::upgrade) {
            return existing;
        }
        let presence = Presence::new(key.0.clone(), key.1.clone());
        self.presences.insert(key, presence.downgrade());
        presence
    }

    /// Forget presences no local value holds any more. Returns how many went.
    pub fn sweep(&mut self) -> usize {
        let before = self.presences.len();
        self.presences.retain(|_, weak| weak.strong_count() > 0);
        before - self.presences.len()
    }

    pub fn presence_count(&self) -> usize {
        self.presences.len()
    }

    pub fn import_count(&self) -> usize {
        self.imported_vows.len()
    }

    /// Vows the registry still names: live exports, bound result slots and
    /// pending imports.
    pub fn pinned_vows(&self) -> HashSet<VowId> {
        self.vow_swiss
            .keys()
            .chain(self.result_slots.values())
            .chain(self.imported_vows.values())
            .copied()
            .collect()
    }

    /// Encode `values` for delivery to `peer`. Nothing is exported or
    /// subscribed unless every value can be encoded.
    pub fn encode_all(
        &mut self,
        vows: &mut VowTable,
        values: &[Value],
        peer: &VatId,
    ) -> Result<Vec<WireValue>, VatError> {
        for value in values {
            check(vows, value)?;
        }
        values
            .iter()
            .map(|value| self.encode_checked(vows, value, peer))
            .collect()
    }

    /// Encode `value` for delivery to `peer`.
    pub fn encode(
        &mut self,
        vows: &mut VowTable,
        value: &Value,
        peer: &VatId,
    ) -> Result<WireValue, VatError> {
        check(vows, value)?;
        self.encode_checked(vows, value, peer)
    }

    fn encode_checked(
        &mut self,
        vows: &mut VowTable,
        value: &Value,
        peer: &VatId,
    ) -> Result<WireValue, VatError> {
        Ok(match value {
            Value::Undefined => WireValue::Undefined,
            Value::Null => WireValue::Null,
            Value::Bool(b) => WireValue::Bool(*b),
            Value::Int(n) => WireValue::Int(*n),
            Value::Float(f) => WireValue::Float(*f),
            Value::Str(s) => WireValue::Str(s.clone()),
            Value::List(items) => WireValue::List(
                items
                    .iter()
                    .map(|item| self.encode_checked(vows, item, peer))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Record(fields) => WireValue::Record(
                fields
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.encode_checked(vows, v, peer)?)))
                    .collect::<Result<_, VatError>>()?,
            ),
            Value::Ref(Ref::Object(object)) => {
                WireValue::presence(self.vat.clone(), self.export_object(*object))
            }
            Value::Ref(Ref::Presence(p)) => WireValue::presence(p.vat().clone(), p.swiss().clone()),
            Value::Ref(Ref::Vow(vow)) => match vows.state(vow.id()) {
                None => return Err(VatError::UnknownVow(vow.id())),
                Some(VowState::Resolved(settled)) => {
                    let settled = settled.clone();
                    self.encode_checked(vows, &settled, peer)?
                }
                Some(VowState::Rejected(r)) => WireValue::from(r),
                Some(VowState::Unresolved) => {
                    let swiss = self.export_vow(vow.id());
                    vows.subscribe(
                        vow.id(),
                        Subscriber {
                            peer: peer.clone(),
                            swiss: swiss.clone(),
                        },
                    )?;
                    WireValue::unresolved_vow(self.vat.clone(), swiss)
                }
            },
        })
    }

    /// Decode a value that arrived from `peer`.
    pub fn decode(
        &mut self,
        vows: &mut VowTable,
        wire: WireValue,
        peer: &VatId,
    ) -> Result<Value, VatError> {
        Ok(match wire {
            WireValue::Undefined => Value::Undefined,
            WireValue::Null => Value::Null,
            WireValue::Bool(b) => Value::Bool(b),
            WireValue::Int(n) => Value::Int(n),
            WireValue::Float(f) => Value::Float(f),
            WireValue::Str(s) => Value::Str(s),
            WireValue::List(items) => Value::List(
                items
                    .into_iter()
                    .map(|item| self.decode(vows, item, peer))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            WireValue::Record(fields) => Value::Record(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.decode(vows, v, peer)?)))
                    .collect::<Result<_, VatError>>()?,
            ),
            WireValue::Presence { vat_id, swissnum } => {
                if vat_id == self.vat {
                    match self.exports.get(&swissnum) {
                        Some(Export::Object(object)) => Value::object(*object),
                        _ => return Err(self.dangling(&swissnum)),
                    }
                } else {
                    Value::from(self.intern_presence(vat_id, swissnum))
                }
            }
            WireValue::UnresolvedVow { vat_id, swissnum } => {
                if vat_id == self.vat {
                    let own = match self.exports.get(&swissnum) {
                        Some(Export::Vow(vow)) => vows.handle(*vow),
                        _ => None,
                    };
                    match own {
                        Some(vow) => Value::vow(vow),
                        None => return Err(self.dangling(&swissnum)),
                    }
                } else {
                    let key = (vat_id, swissnum);
                    match self.imported_vows.get(&key).and_then(|vow| vows.handle(*vow)) {
                        Some(vow) => Value::vow(vow),
                        None => {
                            let vow = vows.create();
                            self.import_vow(key.0, key.1, vow.id());
                            Value::vow(vow)
                        }
                    }
                }
            }
            WireValue::Error { name, message } => {
                let rejection = Rejection::new(
                    crate::error::RejectionKind::from_name(&name),
                    message,
                );
                Value::vow(vows.create_settled(Settlement::Rejected(rejection)))
            }
        })
    }

    fn dangling(&self, swiss: &SwissNum) -> VatError {
        VatError::Decode(format!(
            "descriptor names swiss {swiss} which vat {} does not export",
            self.vat
        ))
    }
}

/// Reject what cannot be encoded before any export happens.
fn check(vows: &VowTable, value: &Value) -> Result<(), VatError> {
    match value {
        Value::List(items) => items.iter().try_for_each(|item| check(vows, item)),
        Value::Record(fields) => {
            if fields.contains_key(QCLASS) {
                return Err(VatError::Marshal(format!(
                    "record field `{QCLASS}` is reserved"
                )));
            }
            fields.values().try_for_each(|v| check(vows, v))
        }
        Value::Ref(Ref::Vow(vow)) => match vows.state(vow.id()) {
            None => Err(VatError::UnknownVow(vow.id())),
            Some(VowState::Resolved(settled)) => check(vows, settled),
            Some(_) => Ok(()),
        },
        _ => Ok(()),
    }
}
