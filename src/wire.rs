//! Wire model: comms messages and the `@qclass` value descriptors they carry.
//!
//! Field names are the protocol's and must stay stable:
//!
//! ```text
//! send:    { seqnum, op: "send", resultSwissbase, targetSwissnum, methodName, args }
//! resolve: { seqnum, op: "resolve", targetSwissnum, value }
//! ack:     { seqnum }
//! ```
//!
//! The same serde model is framed either as JSON or as CBOR.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::de::Error as _;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

use crate::error::{Rejection, RejectionKind, VatError};
use crate::swiss::{SwissNum, VatId};

pub const QCLASS: &str = "@qclass";

/// A marshalled value. Data variants mirror JSON; the rest are the tagged
/// descriptors and are matched exhaustively on decode.
#[derive(Clone, Debug, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<WireValue>),
    Record(BTreeMap<String, WireValue>),
    Undefined,
    UnresolvedVow { vat_id: VatId, swissnum: SwissNum },
    Presence { vat_id: VatId, swissnum: SwissNum },
    Error { name: String, message: String },
}

impl WireValue {
    pub fn unresolved_vow(vat_id: impl Into<VatId>, swissnum: impl Into<SwissNum>) -> Self {
        WireValue::UnresolvedVow {
            vat_id: vat_id.into(),
            swissnum: swissnum.into(),
        }
    }

    pub fn presence(vat_id: impl Into<VatId>, swissnum: impl Into<SwissNum>) -> Self {
        WireValue::Presence {
            vat_id: vat_id.into(),
            swissnum: swissnum.into(),
        }
    }

    /// The rejection carried by an `error` descriptor, if this is one.
    pub fn as_rejection(&self) -> Option<Rejection> {
        match self {
            WireValue::Error { name, message } => Some(Rejection::new(
                RejectionKind::from_name(name),
                message.clone(),
            )),
            _ => None,
        }
    }
}

impl From<&Rejection> for WireValue {
    fn from(rejection: &Rejection) -> Self {
        WireValue::Error {
            name: rejection.kind.as_name().to_string(),
            message: rejection.message.clone(),
        }
    }
}

impl From<&str> for WireValue {
    fn from(s: &str) -> Self {
        WireValue::Str(s.to_string())
    }
}

impl Serialize for WireValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            WireValue::Null => serializer.serialize_unit(),
            WireValue::Bool(b) => serializer.serialize_bool(*b),
            WireValue::Int(n) => serializer.serialize_i64(*n),
            WireValue::Float(f) => serializer.serialize_f64(*f),
            WireValue::Str(s) => serializer.serialize_str(s),
            WireValue::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            WireValue::Record(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (key, value) in fields {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            WireValue::Undefined => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(QCLASS, "undefined")?;
                map.end()
            }
            WireValue::UnresolvedVow { vat_id, swissnum } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry(QCLASS, "unresolvedVow")?;
                map.serialize_entry("vatID", vat_id)?;
                map.serialize_entry("swissnum", swissnum)?;
                map.end()
            }
            WireValue::Presence { vat_id, swissnum } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry(QCLASS, "presence")?;
                map.serialize_entry("vatID", vat_id)?;
                map.serialize_entry("swissnum", swissnum)?;
                map.end()
            }
            WireValue::Error { name, message } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry(QCLASS, "error")?;
                map.serialize_entry("name", name)?;
                map.serialize_entry("message", message)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Json::deserialize(deserializer)?;
        WireValue::try_from(raw).map_err(D::Error::custom)
    }
}

impl TryFrom<Json> for WireValue {
    type Error = VatError;

    fn try_from(raw: Json) -> Result<Self, VatError> {
        Ok(match raw {
            Json::Null => WireValue::Null,
            Json::Bool(b) => WireValue::Bool(b),
            Json::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => WireValue::Int(i),
                (None, _) if n.is_u64() => {
                    return Err(VatError::Decode(format!("integer {n} does not fit in 64 signed bits")));
                }
                (None, Some(f)) => WireValue::Float(f),
                (None, None) => return Err(VatError::Decode(format!("unrepresentable number {n}"))),
            },
            Json::String(s) => WireValue::Str(s),
            Json::Array(items) => WireValue::List(
                items
                    .into_iter()
                    .map(WireValue::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Json::Object(mut map) => match map.remove(QCLASS) {
                None => WireValue::Record(
                    map.into_iter()
                        .map(|(k, v)| Ok((k, WireValue::try_from(v)?)))
                        .collect::<Result<BTreeMap<_, _>, VatError>>()?,
                ),
                Some(Json::String(tag)) => decode_tagged(&tag, map)?,
                Some(other) => {
                    return Err(VatError::Decode(format!("{QCLASS} must be a string, got {other}")));
                }
            },
        })
    }
}

fn decode_tagged(tag: &str, mut map: serde_json::Map<String, Json>) -> Result<WireValue, VatError> {
    match tag {
        "undefined" => Ok(WireValue::Undefined),
        "unresolvedVow" | "presence" => {
            let vat_id: VatId = take_field(&mut map, "vatID", tag)?;
            let swissnum: SwissNum = take_field(&mut map, "swissnum", tag)?;
            Ok(if tag == "presence" {
                WireValue::Presence { vat_id, swissnum }
            } else {
                WireValue::UnresolvedVow { vat_id, swissnum }
            })
        }
        "error" => {
            let name = match map.remove("name") {
                Some(Json::String(name)) => name,
                _ => RejectionKind::Application.as_name().to_string(),
            };
            let message: String = take_field(&mut map, "message", tag)?;
            Ok(WireValue::Error { name, message })
        }
        other => Err(VatError::Decode(format!("unknown {QCLASS} `{other}`"))),
    }
}

fn take_field<T: serde::de::DeserializeOwned>(
    map: &mut serde_json::Map<String, Json>,
    field: &str,
    tag: &str,
) -> Result<T, VatError> {
    let raw = map
        .remove(field)
        .ok_or_else(|| VatError::Decode(format!("{tag} descriptor missing `{field}`")))?;
    serde_json::from_value(raw)
        .map_err(|err| VatError::Decode(format!("{tag} descriptor field `{field}`: {err}")))
}

#[derive(Clone, Debug, PartialEq)]
pub struct SendOp {
    pub result_swissbase: String,
    pub target_swissnum: SwissNum,
    pub method_name: String,
    pub args: Vec<WireValue>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolveOp {
    pub target_swissnum: SwissNum,
    pub value: WireValue,
}

/// Sequenced payload of a comms message.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Send(SendOp),
    Resolve(ResolveOp),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum Message {
    Op { seqnum: u64, op: Op },
    /// Unsequenced acknowledgement of the peer's message `seqnum`.
    Ack { seqnum: u64 },
}

impl Message {
    pub fn send(
        seqnum: u64,
        result_swissbase: &str,
        target_swissnum: impl Into<SwissNum>,
        method_name: &str,
        args: Vec<WireValue>,
    ) -> Message {
        Message::Op {
            seqnum,
            op: Op::Send(SendOp {
                result_swissbase: result_swissbase.to_string(),
                target_swissnum: target_swissnum.into(),
                method_name: method_name.to_string(),
                args,
            }),
        }
    }

    pub fn resolve(seqnum: u64, target_swissnum: impl Into<SwissNum>, value: WireValue) -> Message {
        Message::Op {
            seqnum,
            op: Op::Resolve(ResolveOp {
                target_swissnum: target_swissnum.into(),
                value,
            }),
        }
    }

    pub fn ack(seqnum: u64) -> Message {
        Message::Ack { seqnum }
    }

    pub fn seqnum(&self) -> u64 {
        match self {
            Message::Op { seqnum, .. } | Message::Ack { seqnum } => *seqnum,
        }
    }

    pub fn is_ack(&self) -> bool {
        matches!(self, Message::Ack { .. })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    seqnum: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_swissbase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_swissnum: Option<SwissNum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Vec<WireValue>>,
    // `null` and absent both land on `None`; a resolve treats that as null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    value: Option<WireValue>,
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let mut raw = RawMessage {
            seqnum: message.seqnum(),
            op: None,
            result_swissbase: None,
            target_swissnum: None,
            method_name: None,
            args: None,
            value: None,
        };
        match message {
            Message::Ack { .. } => {}
            Message::Op {
                op: Op::Send(send), ..
            } => {
                raw.op = Some("send".to_string());
                raw.result_swissbase = Some(send.result_swissbase);
                raw.target_swissnum = Some(send.target_swissnum);
                raw.method_name = Some(send.method_name);
                raw.args = Some(send.args);
            }
            Message::Op {
                op: Op::Resolve(resolve),
                ..
            } => {
                raw.op = Some("resolve".to_string());
                raw.target_swissnum = Some(resolve.target_swissnum);
                raw.value = Some(resolve.value);
            }
        }
        raw
    }
}

impl TryFrom<RawMessage> for Message {
    type Error = VatError;

    fn try_from(raw: RawMessage) -> Result<Self, VatError> {
        let seqnum = raw.seqnum;
        let missing = |field: &str| VatError::Decode(format!("message {seqnum} missing `{field}`"));
        match raw.op.as_deref() {
            None => Ok(Message::Ack { seqnum }),
            Some("send") => Ok(Message::Op {
                seqnum,
                op: Op::Send(SendOp {
                    result_swissbase: raw.result_swissbase.ok_or_else(|| missing("resultSwissbase"))?,
                    target_swissnum: raw.target_swissnum.ok_or_else(|| missing("targetSwissnum"))?,
                    method_name: raw.method_name.ok_or_else(|| missing("methodName"))?,
                    args: raw.args.unwrap_or_default(),
                }),
            }),
            Some("resolve") => Ok(Message::Op {
                seqnum,
                op: Op::Resolve(ResolveOp {
                    target_swissnum: raw.target_swissnum.ok_or_else(|| missing("targetSwissnum"))?,
                    value: raw.value.unwrap_or(WireValue::Null),
                }),
            }),
            Some(other) => Err(VatError::Decode(format!("unknown op `{other}`"))),
        }
    }
}

pub fn to_json(message: &Message) -> Result<String> {
    serde_json::to_string(message).context("failed to encode message as JSON")
}

pub fn from_json(text: &str) -> Result<Message> {
    serde_json::from_str(text).with_context(|| format!("invalid wire message `{text}`"))
}

pub fn to_cbor(message: &Message) -> Result<Vec<u8>> {
    serde_cbor::to_vec(message).context("failed to encode message as CBOR")
}

pub fn from_cbor(bytes: &[u8]) -> Result<Message> {
    serde_cbor::from_slice(bytes).context("invalid CBOR wire message")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_send() -> Result<()> {
        let text = r#"{"seqnum":0,"op":"send","resultSwissbase":"base-1",
            "targetSwissnum":"0","methodName":"pleaseWait",
            "args":[{"@qclass":"unresolvedVow","vatID":"vat1","swissnum":2}]}"#;
        let message = from_json(text)?;
        assert_eq!(
            message,
            Message::send(
                0,
                "base-1",
                "0",
                "pleaseWait",
                vec![WireValue::unresolved_vow("vat1", 2u64)]
            )
        );
        Ok(())
    }

    #[test]
    fn ack_has_only_seqnum() -> Result<()> {
        assert_eq!(to_json(&Message::ack(7))?, r#"{"seqnum":7}"#);
        assert_eq!(from_json(r#"{"seqnum":7}"#)?, Message::ack(7));
        Ok(())
    }

    #[test]
    fn resolve_keeps_field_names_and_undefined_marker() -> Result<()> {
        let message = Message::resolve(0, "hash-of-base-1", WireValue::Undefined);
        let json: Json = serde_json::from_str(&to_json(&message)?)?;
        assert_eq!(
            json,
            serde_json::json!({
                "seqnum": 0,
                "op": "resolve",
                "targetSwissnum": "hash-of-base-1",
                "value": { "@qclass": "undefined" },
            })
        );
        Ok(())
    }

    #[test]
    fn descriptor_json_is_stable_through_decode() -> Result<()> {
        let nested = WireValue::List(vec![
            WireValue::presence("vat3", "0"),
            WireValue::Record(BTreeMap::from([(
                "bid".to_string(),
                WireValue::unresolved_vow("vat1", 9u64),
            )])),
            WireValue::Error {
                name: "NoSuchMethod".into(),
                message: "no method `x`".into(),
            },
        ]);
        let first = serde_json::to_string(&nested)?;
        let decoded: WireValue = serde_json::from_str(&first)?;
        assert_eq!(decoded, nested);
        assert_eq!(serde_json::to_string(&decoded)?, first);
        Ok(())
    }

    #[test]
    fn cbor_frames_the_same_model() -> Result<()> {
        let message = Message::send(
            3,
            "base-4",
            SwissNum::Num(2),
            "bid",
            vec![WireValue::Int(-5), WireValue::Float(1.5), WireValue::Undefined],
        );
        assert_eq!(from_cbor(&to_cbor(&message)?)?, message);
        Ok(())
    }

    #[test]
    fn rejects_unknown_tags_and_ops() {
        assert!(serde_json::from_str::<WireValue>(r#"{"@qclass":"mystery"}"#).is_err());
        assert!(serde_json::from_str::<WireValue>(r#"{"@qclass":"presence","vatID":"v"}"#).is_err());
        assert!(from_json(r#"{"seqnum":1,"op":"cancel"}"#).is_err());
        assert!(from_json(r#"{"seqnum":1,"op":"send","targetSwissnum":"0"}"#).is_err());
    }

    #[test]
    fn integers_past_i64_are_refused() {
        let err = serde_json::from_str::<WireValue>("18446744073709551615").unwrap_err();
        assert!(err.to_string().contains("64 signed bits"));
        assert_eq!(
            serde_json::from_str::<WireValue>("9223372036854775807").unwrap(),
            WireValue::Int(i64::MAX)
        );
        assert_eq!(
            serde_json::from_str::<WireValue>("1.5").unwrap(),
            WireValue::Float(1.5)
        );
        let text = r#"{"seqnum":0,"op":"resolve","targetSwissnum":"x",
            "value":9223372036854775808}"#;
        assert!(from_json(text).is_err());
    }

    #[test]
    fn error_descriptor_maps_to_rejection() {
        let rejection = Rejection::invalid_reference("swiss 9 retired");
        let wire = WireValue::from(&rejection);
        assert_eq!(wire.as_rejection(), Some(rejection));
        assert_eq!(WireValue::Null.as_rejection(), None);
    }
}
