//! Values that flow through vats: plain data plus references to objects,
//! presences and vows.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::Rejection;
use crate::swiss::{SwissNum, VatId};

/// Index of a local object in its vat's object table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "o{}", self.0)
    }
}

/// Index of a vow in its vat's vow table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VowId(pub u64);

impl fmt::Display for VowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct PresenceInner {
    vat: VatId,
    swiss: SwissNum,
}

/// Local proxy for an object owned by another vat.
///
/// Clones share identity. The marshaller only keeps a weak handle, so the
/// import entry goes away once every clone is dropped.
#[derive(Clone, Debug)]
pub struct Presence(Rc<PresenceInner>);

impl Presence {
    pub(crate) fn new(vat: VatId, swiss: SwissNum) -> Self {
        Self(Rc::new(PresenceInner { vat, swiss }))
    }

    pub fn vat(&self) -> &VatId {
        &self.0.vat
    }

    pub fn swiss(&self) -> &SwissNum {
        &self.0.swiss
    }

    pub(crate) fn downgrade(&self) -> Weak<PresenceInner> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<PresenceInner>) -> Option<Presence> {
        weak.upgrade().map(Presence)
    }
}

impl PartialEq for Presence {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Handle on a vow in this vat's vow table.
///
/// Clones share one liveness token. Once a vow has settled and its last
/// handle is gone, the table forgets it unless the vat itself still refers
/// to it (an export, a result slot or an import).
#[derive(Clone, Debug)]
pub struct Vow(Rc<VowId>);

impl Vow {
    pub(crate) fn new(id: VowId) -> Self {
        Self(Rc::new(id))
    }

    pub fn id(&self) -> VowId {
        *self.0
    }

    pub(crate) fn downgrade(&self) -> Weak<VowId> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn upgrade(weak: &Weak<VowId>) -> Option<Vow> {
        weak.upgrade().map(Vow)
    }
}

impl PartialEq for Vow {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Ref {
    Object(ObjectId),
    Presence(Presence),
    Vow(Vow),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Ref(Ref),
}

impl Value {
    pub fn vow(vow: Vow) -> Value {
        Value::Ref(Ref::Vow(vow))
    }

    pub fn object(id: ObjectId) -> Value {
        Value::Ref(Ref::Object(id))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_vow(&self) -> Option<VowId> {
        match self {
            Value::Ref(Ref::Vow(vow)) => Some(vow.id()),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(Ref::Object(id)) => Some(*id),
            _ => None,
        }
    }

    pub fn as_presence(&self) -> Option<&Presence> {
        match self {
            Value::Ref(Ref::Presence(p)) => Some(p),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Presence> for Value {
    fn from(p: Presence) -> Self {
        Value::Ref(Ref::Presence(p))
    }
}

/// Terminal outcome of a vow.
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    Resolved(Value),
    Rejected(Rejection),
}

impl Settlement {
    pub fn into_result(self) -> Result<Value, Rejection> {
        match self {
            Settlement::Resolved(v) => Ok(v),
            Settlement::Rejected(r) => Err(r),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settlement::Rejected(_))
    }
}

impl From<Result<Value, Rejection>> for Settlement {
    fn from(outcome: Result<Value, Rejection>) -> Self {
        match outcome {
            Ok(v) => Settlement::Resolved(v),
            Err(r) => Settlement::Rejected(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_identity_is_by_handle() {
        let a = Presence::new(VatId::from("vat2"), SwissNum::from("0"));
        let b = Presence::new(VatId::from("vat2"), SwissNum::from("0"));
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn weak_handle_dies_with_last_clone() {
        let p = Presence::new(VatId::from("vat2"), SwissNum::Num(4));
        let weak = p.downgrade();
        let again = Presence::upgrade(&weak).unwrap();
        assert_eq!(again, p);
        drop(again);
        drop(p);
        assert!(Presence::upgrade(&weak).is_none());
    }

    #[test]
    fn vow_handles_compare_by_id_and_share_liveness() {
        let vow = Vow::new(VowId(3));
        let weak = vow.downgrade();
        assert_eq!(Value::vow(vow.clone()), Value::vow(Vow::new(VowId(3))));
        assert_eq!(Value::vow(vow.clone()).as_vow(), Some(VowId(3)));
        drop(vow);
        assert!(Vow::upgrade(&weak).is_none());
    }
}
