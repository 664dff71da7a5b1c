//! Vat turn scheduler.
//!
//! A vat owns its object table, vow table, registry and connections. Inbound
//! messages are acked on receipt but only executed by [`Vat::drain`], one
//! delivery per turn, with the local continuation queue emptied before each
//! delivery and after the last one.
//!
//! A result slot stays bound after its resolve goes out, so pipelined sends
//! already in flight still reach the outcome. It is unbound once the caller
//! acknowledges the resolve, behind whatever the caller had sent before.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::rc::Rc;

use smallvec::SmallVec;
use tracing::{debug, info, trace, warn};

use crate::comms::{Connection, Inbound, QueueHandle};
use crate::config::VatConfig;
use crate::error::{Rejection, VatError};
use crate::marshal::{Export, Registry};
use crate::swiss::{Address, SwissNum, VatId, hash_of};
use crate::value::{ObjectId, Ref, Settlement, Value, Vow, VowId};
use crate::vow::{Reaction, Registered, Subscriber, VowTable};
use crate::wire::{Message, Op, ResolveOp, SendOp, WireValue};

/// A local object's implementation.
pub trait Behavior {
    fn invoke(&mut self, turn: &mut Turn<'_>, method: &str, args: Vec<Value>)
    -> Result<Value, Rejection>;
}

/// Startup code for a vat: receives `argv` and returns the root object.
pub trait VatBody {
    fn start(self: Box<Self>, turn: &mut Turn<'_>, argv: Value)
    -> Result<Box<dyn Behavior>, Rejection>;
}

impl<F> VatBody for F
where
    F: FnOnce(&mut Turn<'_>, Value) -> Result<Box<dyn Behavior>, Rejection>,
{
    fn start(self: Box<Self>, turn: &mut Turn<'_>, argv: Value) -> Result<Box<dyn Behavior>, Rejection> {
        (*self)(turn, argv)
    }
}

/// Box a startup closure as a [`VatBody`].
pub fn body<F>(start: F) -> Box<dyn VatBody>
where
    F: FnOnce(&mut Turn<'_>, Value) -> Result<Box<dyn Behavior>, Rejection> + 'static,
{
    Box::new(start)
}

/// A root object that answers no methods.
pub struct Inert;

impl Behavior for Inert {
    fn invoke(&mut self, _turn: &mut Turn<'_>, method: &str, _args: Vec<Value>) -> Result<Value, Rejection> {
        Err(Rejection::no_such_method(method))
    }
}

/// Destination for lines a vat logs.
pub trait TranscriptSink {
    fn write_output(&mut self, vat: &VatId, line: &str);
}

pub struct NullTranscript;

impl TranscriptSink for NullTranscript {
    fn write_output(&mut self, _vat: &VatId, _line: &str) {}
}

/// Shared in-memory transcript; clones append to the same buffer.
#[derive(Clone, Default)]
pub struct MemoryTranscript(Rc<RefCell<Vec<String>>>);

impl MemoryTranscript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}

impl TranscriptSink for MemoryTranscript {
    fn write_output(&mut self, vat: &VatId, line: &str) {
        self.0.borrow_mut().push(format!("{vat}: {line}"));
    }
}

/// Result of handing one message to [`Vat::comms_received`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receipt {
    Queued { seqnum: u64 },
    Discarded { seqnum: u64, expected: u64 },
    Acked { seqnum: u64, released: usize },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// External deliveries executed.
    pub turns: usize,
    /// Local continuations run.
    pub jobs: usize,
}

enum Delivery {
    Send { peer: VatId, op: SendOp },
    Resolve { peer: VatId, op: ResolveOp },
    /// The caller has seen the resolve for this slot.
    Release { peer: VatId, slot: SwissNum },
}

impl Delivery {
    fn is_turn(&self) -> bool {
        !matches!(self, Delivery::Release { .. })
    }
}

enum Job {
    Call {
        target: ObjectId,
        method: String,
        args: Vec<Value>,
        result: VowId,
    },
    React {
        reaction: Reaction,
        settlement: Settlement,
    },
    Broadcast {
        vow: VowId,
        subscribers: SmallVec<[Subscriber; 2]>,
        settlement: Settlement,
    },
}

#[derive(Default)]
struct ObjectTable {
    next: u64,
    // `None` while the object is executing.
    slots: HashMap<ObjectId, Option<Box<dyn Behavior>>>,
}

impl ObjectTable {
    fn insert(&mut self, behavior: Box<dyn Behavior>) -> ObjectId {
        let id = ObjectId(self.next);
        self.next += 1;
        self.slots.insert(id, Some(behavior));
        id
    }

    fn checkout(&mut self, id: ObjectId) -> Result<Box<dyn Behavior>, VatError> {
        self.slots
            .get_mut(&id)
            .and_then(Option::take)
            .ok_or(VatError::ObjectUnavailable(id))
    }

    /// Put an object back after a call, unless it was revoked meanwhile.
    fn checkin(&mut self, id: ObjectId, behavior: Box<dyn Behavior>) {
        if let Some(slot) = self.slots.get_mut(&id) {
            *slot = Some(behavior);
        }
    }

    fn remove(&mut self, id: ObjectId) -> bool {
        self.slots.remove(&id).is_some()
    }
}

struct Core {
    id: VatId,
    config: VatConfig,
    transcript: Box<dyn TranscriptSink>,
    objects: ObjectTable,
    vows: VowTable,
    registry: Registry,
    connections: BTreeMap<VatId, Connection>,
    inbox: VecDeque<Delivery>,
    jobs: VecDeque<Job>,
    // Result slots whose resolve went out, by peer and outbound seqnum.
    releases: HashMap<VatId, BTreeMap<u64, SwissNum>>,
}

impl Core {
    fn connection(&mut self, peer: &VatId) -> &mut Connection {
        let max_unacked = self.config.max_unacked;
        self.connections
            .entry(peer.clone())
            .or_insert_with(|| Connection::new(peer.clone(), max_unacked))
    }

    fn invoke(&mut self, target: ObjectId, method: &str, args: Vec<Value>) -> Result<Value, Rejection> {
        let mut behavior = self.objects.checkout(target)?;
        trace!(vat = %self.id, object = %target, method, "invoke");
        let outcome = behavior.invoke(&mut Turn { core: self }, method, args);
        self.objects.checkin(target, behavior);
        outcome
    }

    /// Settle `vow`, following another vow if that is what it resolves to.
    fn settle(&mut self, vow: VowId, settlement: Settlement) -> Result<(), VatError> {
        if let Settlement::Resolved(Value::Ref(Ref::Vow(inner))) = &settlement {
            return self.follow(vow, inner.id());
        }
        self.settle_now(vow, settlement)
    }

    fn follow(&mut self, vow: VowId, inner: VowId) -> Result<(), VatError> {
        if inner == vow {
            return self.settle_now(
                vow,
                Settlement::Rejected(Rejection::application("vow resolved to itself")),
            );
        }
        if let Some(outcome) = self.vows.settlement(inner) {
            return self.settle_now(vow, outcome);
        }
        self.vows.lock(vow)?;
        match self.vows.react(inner, Reaction::Forward(vow))? {
            Registered::Pending => {}
            Registered::Settled(reaction, settlement) => {
                self.jobs.push_back(Job::React {
                    reaction,
                    settlement,
                })
            }
        }
        Ok(())
    }

    fn settle_now(&mut self, vow: VowId, settlement: Settlement) -> Result<(), VatError> {
        let fired = self.vows.settle(vow, settlement.clone())?;
        trace!(
            vat = %self.id,
            %vow,
            rejected = settlement.is_rejected(),
            subscribers = fired.subscribers.len(),
            reactions = fired.reactions.len(),
            "vow settled"
        );
        if !fired.subscribers.is_empty() {
            self.jobs.push_back(Job::Broadcast {
                vow,
                subscribers: fired.subscribers,
                settlement: settlement.clone(),
            });
        }
        for reaction in fired.reactions {
            self.jobs.push_back(Job::React {
                reaction,
                settlement: settlement.clone(),
            });
        }
        Ok(())
    }

    fn settle_quietly(&mut self, vow: VowId, settlement: Settlement) {
        if let Err(err) = self.settle(vow, settlement) {
            warn!(vat = %self.id, %vow, "settlement dropped: {err}");
        }
    }

    /// Eventual send of `method` to whatever `target` designates.
    fn dispatch(&mut self, target: &Value, method: String, args: Vec<Value>, result: VowId) {
        match target {
            Value::Ref(Ref::Object(object)) => self.jobs.push_back(Job::Call {
                target: *object,
                method,
                args,
                result,
            }),
            Value::Ref(Ref::Presence(presence)) => {
                let peer = presence.vat().clone();
                let swiss = presence.swiss().clone();
                self.send_remote(peer, swiss, method, args, result);
            }
            Value::Ref(Ref::Vow(vow)) => self.dispatch_to_vow(vow.id(), method, args, result),
            other => {
                let rejection = Rejection::invalid_reference(format!(
                    "cannot send `{method}` to non-reference {other:?}"
                ));
                self.settle_quietly(result, Settlement::Rejected(rejection));
            }
        }
    }

    fn dispatch_to_vow(&mut self, vow: VowId, method: String, args: Vec<Value>, result: VowId) {
        match self.vows.settlement(vow) {
            Some(Settlement::Resolved(value)) => {
                return self.dispatch(&value, method, args, result);
            }
            Some(rejected) => return self.settle_quietly(result, rejected),
            None => {}
        }
        // pipeline straight to the owner of an imported vow
        if let Some((owner, swiss)) = self.registry.import_origin(vow).cloned() {
            return self.send_remote(owner, swiss, method, args, result);
        }
        let reaction = Reaction::Deliver {
            method,
            args,
            result,
        };
        match self.vows.react(vow, reaction) {
            Ok(Registered::Pending) => {}
            Ok(Registered::Settled(reaction, settlement)) => self.jobs.push_back(Job::React {
                reaction,
                settlement,
            }),
            Err(err) => self.settle_quietly(result, Settlement::Rejected(err.into())),
        }
    }

    fn send_remote(
        &mut self,
        peer: VatId,
        target: SwissNum,
        method: String,
        args: Vec<Value>,
        result: VowId,
    ) {
        let base = self.registry.next_base();
        let slot = hash_of(self.config.slot_naming, &base);
        let wire_args = match self.registry.encode_all(&mut self.vows, &args, &peer) {
            Ok(wire_args) => wire_args,
            Err(err) => {
                debug!(vat = %self.id, %peer, %method, "arguments not sent: {err}");
                return self.settle_quietly(result, Settlement::Rejected(err.into()));
            }
        };
        self.registry.import_vow(peer.clone(), slot, result);
        let op = Op::Send(SendOp {
            result_swissbase: base,
            target_swissnum: target,
            method_name: method,
            args: wire_args,
        });
        let seqnum = self.connection(&peer).send(op);
        trace!(vat = %self.id, %peer, seqnum, "send queued");
    }

    fn run_jobs(&mut self) -> usize {
        let mut count = 0;
        while let Some(job) = self.jobs.pop_front() {
            self.run_job(job);
            count += 1;
        }
        count
    }

    fn run_job(&mut self, job: Job) {
        match job {
            Job::Call {
                target,
                method,
                args,
                result,
            } => {
                let outcome = self.invoke(target, &method, args);
                self.settle_quietly(result, outcome.into());
            }
            Job::React {
                reaction,
                settlement,
            } => match reaction {
                Reaction::Callback { callback, derived } => {
                    let outcome = callback(&mut Turn { core: self }, settlement);
                    self.settle_quietly(derived, outcome.into());
                }
                Reaction::Forward(target) => self.settle_quietly(target, settlement),
                Reaction::Deliver {
                    method,
                    args,
                    result,
                } => match settlement {
                    Settlement::Resolved(value) => self.dispatch(&value, method, args, result),
                    rejected => self.settle_quietly(result, rejected),
                },
            },
            Job::Broadcast {
                vow,
                subscribers,
                settlement,
            } => self.broadcast(vow, &subscribers, &settlement),
        }
    }

    /// Tell every remote holder of `vow` how it settled, then retire its
    /// swiss numbers.
    fn broadcast(&mut self, vow: VowId, subscribers: &[Subscriber], settlement: &Settlement) {
        for sub in subscribers {
            let value = match settlement {
                Settlement::Resolved(value) => self
                    .registry
                    .encode(&mut self.vows, value, &sub.peer)
                    .unwrap_or_else(|err| WireValue::from(&Rejection::from(err))),
                Settlement::Rejected(rejection) => WireValue::from(rejection),
            };
            let op = Op::Resolve(ResolveOp {
                target_swissnum: sub.swiss.clone(),
                value,
            });
            let seqnum = self.connection(&sub.peer).send(op);
            debug!(vat = %self.id, peer = %sub.peer, swiss = %sub.swiss, seqnum, "resolve sent");
            if self.registry.has_result_slot(&sub.peer, &sub.swiss) {
                self.releases
                    .entry(sub.peer.clone())
                    .or_default()
                    .insert(seqnum, sub.swiss.clone());
            }
        }
        self.registry.retire_vow(vow);
    }

    /// Queue the release of every result slot whose resolve `peer` has now
    /// acknowledged.
    fn acknowledged(&mut self, peer: &VatId, through: u64) {
        let Some(pending) = self.releases.get_mut(peer) else {
            return;
        };
        let later = pending.split_off(&through.saturating_add(1));
        let acked = std::mem::replace(pending, later);
        if pending.is_empty() {
            self.releases.remove(peer);
        }
        for slot in acked.into_values() {
            self.inbox.push_back(Delivery::Release {
                peer: peer.clone(),
                slot,
            });
        }
    }

    /// Forget presences and settled vows that nothing holds any more.
    fn collect(&mut self) -> usize {
        let presences = self.registry.sweep();
        let pinned = self.registry.pinned_vows();
        let vows = self.vows.collect(&pinned);
        if presences + vows > 0 {
            trace!(vat = %self.id, presences, vows, "collected");
        }
        presences + vows
    }

    fn deliver(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Send { peer, op } => self.deliver_send(peer, op),
            Delivery::Resolve { peer, op } => self.deliver_resolve(peer, op),
            Delivery::Release { peer, slot } => {
                if let Some(vow) = self.registry.close_result_slot(&peer, &slot) {
                    trace!(vat = %self.id, %peer, %slot, %vow, "result slot released");
                }
            }
        }
    }

    fn deliver_send(&mut self, peer: VatId, op: SendOp) {
        let slot = hash_of(self.config.slot_naming, &op.result_swissbase);
        if self.registry.has_result_slot(&peer, &slot) {
            warn!(vat = %self.id, %peer, %slot, "result slot reused; call dropped");
            return;
        }
        let result = self.vows.create().id();
        self.registry.open_result_slot(&peer, slot.clone(), result);
        let subscriber = Subscriber {
            peer: peer.clone(),
            swiss: slot,
        };
        if let Err(err) = self.vows.subscribe(result, subscriber) {
            warn!(vat = %self.id, %peer, "cannot subscribe caller: {err}");
            return;
        }
        trace!(vat = %self.id, %peer, method = %op.method_name, target = %op.target_swissnum, "deliver send");

        let target = match self.registry.lookup(&peer, &op.target_swissnum) {
            Ok(target) => target,
            Err(rejection) => {
                debug!(vat = %self.id, %peer, "rejecting call: {rejection}");
                return self.settle_quietly(result, Settlement::Rejected(rejection));
            }
        };
        let mut args = Vec::with_capacity(op.args.len());
        for wire in op.args {
            match self.registry.decode(&mut self.vows, wire, &peer) {
                Ok(value) => args.push(value),
                Err(err) => {
                    return self.settle_quietly(result, Settlement::Rejected(err.into()));
                }
            }
        }
        match target {
            Export::Object(object) => {
                let outcome = self.invoke(object, &op.method_name, args);
                self.settle_quietly(result, outcome.into());
            }
            Export::Vow(vow) => self.dispatch_to_vow(vow, op.method_name, args, result),
        }
    }

    fn deliver_resolve(&mut self, peer: VatId, op: ResolveOp) {
        let Some(vow) = self.registry.take_import(&peer, &op.target_swissnum) else {
            warn!(vat = %self.id, %peer, swiss = %op.target_swissnum, "resolve for unknown import dropped");
            return;
        };
        let settlement = match op.value.as_rejection() {
            Some(rejection) => Settlement::Rejected(rejection),
            None => match self.registry.decode(&mut self.vows, op.value, &peer) {
                Ok(value) => Settlement::Resolved(value),
                Err(err) => Settlement::Rejected(err.into()),
            },
        };
        self.settle_quietly(vow, settlement);
    }
}

/// Capabilities available to code running inside a vat.
pub struct Turn<'a> {
    core: &'a mut Core,
}

impl Turn<'_> {
    pub fn vat_id(&self) -> &VatId {
        &self.core.id
    }

    /// Append a line to the vat's transcript.
    pub fn log(&mut self, line: impl AsRef<str>) {
        let line = line.as_ref();
        debug!(vat = %self.core.id, "{line}");
        self.core.transcript.write_output(&self.core.id, line);
    }

    pub fn make_object(&mut self, behavior: impl Behavior + 'static) -> Value {
        Value::object(self.core.objects.insert(Box::new(behavior)))
    }

    /// Remove a local object from the table. Later calls on it, local or
    /// remote, are rejected as invalid references.
    pub fn revoke(&mut self, target: &Value) -> bool {
        let Some(object) = target.as_object() else {
            return false;
        };
        self.core.registry.revoke_object(object);
        self.core.objects.remove(object)
    }

    pub fn make_vow(&mut self) -> Vow {
        self.core.vows.create()
    }

    pub fn resolve(&mut self, vow: &Vow, value: Value) -> Result<(), VatError> {
        self.check_settleable(vow.id())?;
        self.core.settle(vow.id(), Settlement::Resolved(value))
    }

    pub fn reject(&mut self, vow: &Vow, reason: Rejection) -> Result<(), VatError> {
        self.check_settleable(vow.id())?;
        self.core.settle(vow.id(), Settlement::Rejected(reason))
    }

    fn check_settleable(&self, vow: VowId) -> Result<(), VatError> {
        if self.core.vows.is_settleable(vow) {
            Ok(())
        } else if self.core.vows.state(vow).is_none() {
            Err(VatError::UnknownVow(vow))
        } else {
            Err(VatError::AlreadySettled(vow))
        }
    }

    /// Current outcome of `target`: `None` for an unresolved vow, the value
    /// itself for anything that is not a vow.
    pub fn settlement(&self, target: &Value) -> Option<Settlement> {
        settlement_of(&self.core.vows, target)
    }

    /// Eventual send. Returns a vow for the result.
    pub fn send(&mut self, target: &Value, method: &str, args: Vec<Value>) -> Value {
        let result = self.core.vows.create();
        self.core.dispatch(target, method.to_string(), args, result.id());
        Value::vow(result)
    }

    /// Run `callback` once `target` settles (at the next drain at the
    /// earliest). Returns a vow for the callback's result.
    pub fn when<F>(&mut self, target: &Value, callback: F) -> Value
    where
        F: FnOnce(&mut Turn<'_>, Settlement) -> Result<Value, Rejection> + 'static,
    {
        let derived = self.core.vows.create();
        let reaction = Reaction::Callback {
            callback: Box::new(callback),
            derived: derived.id(),
        };
        let registered = match target.as_vow() {
            Some(vow) => self.core.vows.react(vow, reaction),
            None => Ok(Registered::Settled(reaction, Settlement::Resolved(target.clone()))),
        };
        match registered {
            Ok(Registered::Pending) => {}
            Ok(Registered::Settled(reaction, settlement)) => self.core.jobs.push_back(Job::React {
                reaction,
                settlement,
            }),
            Err(err) => self
                .core
                .settle_quietly(derived.id(), Settlement::Rejected(err.into())),
        }
        Value::vow(derived)
    }
}

fn settlement_of(vows: &VowTable, target: &Value) -> Option<Settlement> {
    match target.as_vow() {
        Some(vow) => vows.settlement(vow),
        None => Some(Settlement::Resolved(target.clone())),
    }
}

pub struct Vat {
    core: Core,
    body: Option<Box<dyn VatBody>>,
    root: Option<ObjectId>,
}

impl Vat {
    pub fn build(
        id: impl Into<VatId>,
        config: VatConfig,
        transcript: Box<dyn TranscriptSink>,
        body: Box<dyn VatBody>,
    ) -> Vat {
        let id = id.into();
        info!(vat = %id, "vat built");
        let registry = Registry::new(id.clone(), config.first_swiss);
        Vat {
            core: Core {
                id,
                config,
                transcript,
                objects: ObjectTable::default(),
                vows: VowTable::new(),
                registry,
                connections: BTreeMap::new(),
                inbox: VecDeque::new(),
                jobs: VecDeque::new(),
                releases: HashMap::new(),
            },
            body: Some(body),
            root: None,
        }
    }

    pub fn id(&self) -> &VatId {
        &self.core.id
    }

    pub fn config(&self) -> &VatConfig {
        &self.core.config
    }

    pub fn root(&self) -> Option<Value> {
        self.root.map(Value::object)
    }

    pub fn registry(&self) -> &Registry {
        &self.core.registry
    }

    /// Run the vat body with `argv` and export its root object at
    /// `root_address` (`<this vat>/<swiss>`).
    pub fn initialize_code(&mut self, root_address: &str, argv: Value) -> Result<Value, VatError> {
        let address = Address::parse(root_address)?;
        if address.vat != self.core.id {
            return Err(VatError::ForeignRoot {
                address: root_address.to_string(),
                vat: self.core.id.clone(),
            });
        }
        let body = self
            .body
            .take()
            .ok_or_else(|| VatError::AlreadyInitialized(self.core.id.clone()))?;
        let behavior = body.start(&mut Turn { core: &mut self.core }, argv)?;
        let root = self.core.objects.insert(behavior);
        self.core.registry.export_at(address.swiss, root)?;
        self.root = Some(root);
        info!(vat = %self.core.id, root = root_address, "vat initialized");
        self.drain();
        Ok(Value::object(root))
    }

    /// Presence for `<vatID>/<swiss>`. An address in this vat yields the
    /// local object instead.
    pub fn create_presence(&mut self, address: &str) -> Result<Value, VatError> {
        let address = Address::parse(address)?;
        if address.vat == self.core.id {
            return match self.core.registry.lookup(&address.vat, &address.swiss) {
                Ok(Export::Object(object)) => Ok(Value::object(object)),
                Ok(Export::Vow(vow)) => self
                    .core
                    .vows
                    .handle(vow)
                    .map(Value::vow)
                    .ok_or_else(|| VatError::UnknownExport(address.to_string())),
                Err(_) => Err(VatError::UnknownExport(address.to_string())),
            };
        }
        Ok(Value::from(
            self.core.registry.intern_presence(address.vat, address.swiss),
        ))
    }

    pub fn connection_made(&mut self, peer: impl Into<VatId>, queue: impl QueueHandle + 'static) {
        let peer = peer.into();
        info!(vat = %self.core.id, %peer, "connection made");
        self.core.connection(&peer).attach(Box::new(queue));
    }

    /// Hand one inbound message to the comms layer. Accepted messages are
    /// acked now and executed on a later turn.
    pub fn comms_received(&mut self, peer: impl Into<VatId>, message: Message) -> Receipt {
        let peer = peer.into();
        match self.core.connection(&peer).receive(message) {
            Inbound::Accepted { seqnum, op } => {
                let delivery = match op {
                    Op::Send(op) => Delivery::Send { peer, op },
                    Op::Resolve(op) => Delivery::Resolve { peer, op },
                };
                self.core.inbox.push_back(delivery);
                Receipt::Queued { seqnum }
            }
            Inbound::Discarded { seqnum, expected } => Receipt::Discarded { seqnum, expected },
            Inbound::Acked { seqnum, released } => {
                let through = self.core.connections.get(&peer).and_then(Connection::acked_through);
                if let Some(through) = through {
                    self.core.acknowledged(&peer, through);
                }
                Receipt::Acked { seqnum, released }
            }
        }
    }

    /// Run pending continuations and at most one external delivery.
    pub fn step(&mut self) -> bool {
        let mut progressed = self.core.run_jobs() > 0;
        if let Some(delivery) = self.core.inbox.pop_front() {
            self.core.deliver(delivery);
            self.core.run_jobs();
            progressed = true;
        }
        progressed
    }

    /// Turn boundary: run until no continuation or delivery is left.
    pub fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            report.jobs += self.core.run_jobs();
            let Some(delivery) = self.core.inbox.pop_front() else {
                break;
            };
            if delivery.is_turn() {
                report.turns += 1;
            }
            self.core.deliver(delivery);
        }
        self.core.collect();
        report
    }

    pub fn is_idle(&self) -> bool {
        self.core.jobs.is_empty() && self.core.inbox.is_empty()
    }

    /// Call a local object directly, outside the scheduler. Effects it
    /// schedules still wait for the next drain.
    pub fn invoke_local(
        &mut self,
        target: &Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, Rejection> {
        let object = target
            .as_object()
            .ok_or_else(|| Rejection::invalid_reference("direct calls need a local object"))?;
        self.core.invoke(object, method, args)
    }

    /// Run host code with the vat's turn capabilities.
    pub fn with_turn<R>(&mut self, f: impl FnOnce(&mut Turn<'_>) -> R) -> R {
        f(&mut Turn { core: &mut self.core })
    }

    pub fn settlement(&self, target: &Value) -> Option<Settlement> {
        settlement_of(&self.core.vows, target)
    }

    pub fn connection(&self, peer: &VatId) -> Option<&Connection> {
        self.core.connections.get(peer)
    }

    pub fn retransmit(&mut self, peer: &VatId) -> Result<usize, VatError> {
        let conn = self
            .core
            .connections
            .get_mut(peer)
            .ok_or_else(|| VatError::UnknownPeer(peer.clone()))?;
        Ok(conn.retransmit())
    }

    /// Drop presences nobody holds and settled vows nothing refers to.
    /// Returns how many entries went.
    pub fn sweep(&mut self) -> usize {
        self.core.collect()
    }

    /// Vows this vat still keeps a record for.
    pub fn vow_count(&self) -> usize {
        self.core.vows.len()
    }
}
