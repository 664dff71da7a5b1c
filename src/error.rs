//! Error types for the vat runtime.
//!
//! `VatError` covers misuse of the host-facing API and malformed wire data.
//! `Rejection` is the reason carried by a rejected vow; it crosses the wire
//! as an `error` descriptor and never takes down the vat that produced it.

use std::fmt;

use thiserror::Error;

use crate::swiss::VatId;
use crate::value::{ObjectId, VowId};

#[derive(Debug, Error)]
pub enum VatError {
    #[error("malformed address `{0}`: expected <vatID>/<swiss>")]
    MalformedAddress(String),

    #[error("root address `{address}` does not belong to vat {vat}")]
    ForeignRoot { address: String, vat: VatId },

    #[error("vat {0} is already initialized")]
    AlreadyInitialized(VatId),

    #[error("swiss number {0} is already in use")]
    SwissInUse(String),

    #[error("nothing is exported at {0}")]
    UnknownExport(String),

    #[error("no connection to peer {0}")]
    UnknownPeer(VatId),

    #[error("unknown vow {0}")]
    UnknownVow(VowId),

    #[error("vow {0} is already settled")]
    AlreadySettled(VowId),

    #[error("object {0} is not available")]
    ObjectUnavailable(ObjectId),

    #[error("cannot marshal value: {0}")]
    Marshal(String),

    #[error("malformed wire data: {0}")]
    Decode(String),

    #[error("vat body failed to start: {0}")]
    Startup(#[from] Rejection),
}

/// Category of a rejection, carried on the wire as the descriptor `name`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// The invoked method failed.
    Application,
    /// The target swiss number is unknown, retired or revoked.
    InvalidReference,
    NoSuchMethod,
    /// A value could not be encoded or decoded.
    Marshal,
}

impl RejectionKind {
    pub fn as_name(self) -> &'static str {
        match self {
            RejectionKind::Application => "Error",
            RejectionKind::InvalidReference => "InvalidReference",
            RejectionKind::NoSuchMethod => "NoSuchMethod",
            RejectionKind::Marshal => "MarshalError",
        }
    }

    /// Unknown names from a peer are treated as application failures.
    pub fn from_name(name: &str) -> RejectionKind {
        match name {
            "InvalidReference" => RejectionKind::InvalidReference,
            "NoSuchMethod" => RejectionKind::NoSuchMethod,
            "MarshalError" => RejectionKind::Marshal,
            _ => RejectionKind::Application,
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
}

impl Rejection {
    pub fn new(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn application(message: impl Into<String>) -> Self {
        Self::new(RejectionKind::Application, message)
    }

    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::new(RejectionKind::InvalidReference, message)
    }

    pub fn no_such_method(method: &str) -> Self {
        Self::new(RejectionKind::NoSuchMethod, format!("no method `{method}`"))
    }

    pub fn marshal(message: impl Into<String>) -> Self {
        Self::new(RejectionKind::Marshal, message)
    }
}

impl From<VatError> for Rejection {
    fn from(err: VatError) -> Self {
        match err {
            VatError::Startup(rejection) => rejection,
            VatError::Marshal(msg) | VatError::Decode(msg) => Rejection::marshal(msg),
            VatError::ObjectUnavailable(id) => {
                Rejection::invalid_reference(format!("object {id} is not available"))
            }
            VatError::UnknownExport(address) => {
                Rejection::invalid_reference(format!("nothing is exported at {address}"))
            }
            other => Rejection::application(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_roundtrip() {
        for kind in [
            RejectionKind::Application,
            RejectionKind::InvalidReference,
            RejectionKind::NoSuchMethod,
            RejectionKind::Marshal,
        ] {
            assert_eq!(RejectionKind::from_name(kind.as_name()), kind);
        }
        assert_eq!(
            RejectionKind::from_name("TypeError"),
            RejectionKind::Application
        );
    }

    #[test]
    fn vat_error_becomes_rejection() {
        let rej: Rejection = VatError::Decode("bad tag".into()).into();
        assert_eq!(rej.kind, RejectionKind::Marshal);
        assert_eq!(rej.to_string(), "MarshalError: bad tag");
    }
}
