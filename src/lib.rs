//! Vat runtime: single-threaded object containers that talk to each other
//! through sequenced, acknowledged message queues and settle cross-vat
//! results with vows.

pub mod comms;
pub mod config;
pub mod demo;
pub mod error;
pub mod harness;
pub mod marshal;
pub mod swiss;
pub mod value;
pub mod vat;
pub mod vow;
pub mod wire;

pub type Result<T> = anyhow::Result<T>;

pub use comms::{Connection, Inbound, QueueHandle};
pub use config::{SlotNaming, VatConfig};
pub use error::{Rejection, RejectionKind, VatError};
pub use harness::{Frame, Queues};
pub use swiss::{Address, SwissNum, VatId, hash_of};
pub use value::{ObjectId, Presence, Settlement, Value, Vow, VowId};
pub use vat::{
    Behavior, DrainReport, Inert, MemoryTranscript, NullTranscript, Receipt, TranscriptSink, Turn,
    Vat, VatBody, body,
};
pub use wire::{Message, Op, ResolveOp, SendOp, WireValue};
