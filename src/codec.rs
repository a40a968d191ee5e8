//! Wire envelope encoding for the RTA protocol.
//!
//! Every frame is a JSON array whose first element is the numeric message
//! type. Subscribe and unsubscribe frames carry the client sequence number in
//! the second slot; everything after that is type-specific payload.
//!
//! ```text
//! out  [1, SEQUENCE_N, "RESOURCE_URI"]          subscribe
//! out  [2, SEQUENCE_N, SUB_ID]                  unsubscribe
//! in   [1, SEQUENCE_N, CODE_N, SUB_ID, DATA]    subscribe ack (success)
//! in   [1, SEQUENCE_N, CODE_N, "MESSAGE"]       subscribe ack (failure)
//! in   [2, SEQUENCE_N, CODE_N]                  unsubscribe ack
//! in   [3, SUB_ID, DATA]                        change event
//! in   [4]                                      resync
//! ```

use crate::error::CodecError;
use crate::types::{ChangeEvent, RtaErrorCode, SequenceNumber, SubscriptionId};
use serde_json::Value;

/// Envelope discriminant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    Subscribe = 1,
    Unsubscribe = 2,
    ChangeEvent = 3,
    Resync = 4,
}

impl MessageType {
    pub fn from_wire(value: u64) -> Result<Self, CodecError> {
        match value {
            1 => Ok(MessageType::Subscribe),
            2 => Ok(MessageType::Unsubscribe),
            3 => Ok(MessageType::ChangeEvent),
            4 => Ok(MessageType::Resync),
            other => Err(CodecError::UnknownType(other)),
        }
    }

    pub fn as_wire(self) -> u64 {
        self as u64
    }

    /// Whether frames of this type carry a sequence number in slot 1.
    pub fn carries_sequence(self) -> bool {
        matches!(self, MessageType::Subscribe | MessageType::Unsubscribe)
    }
}

/// A frame split into its envelope fields.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedMessage {
    pub message_type: MessageType,
    /// Present for subscribe/unsubscribe frames only.
    pub sequence_number: Option<SequenceNumber>,
    /// Trailing type-specific fields, untouched.
    pub payload: Vec<Value>,
}

/// An inbound frame interpreted according to its type.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    SubscribeAccepted {
        sequence_number: SequenceNumber,
        subscription_id: SubscriptionId,
        data: Value,
    },
    SubscribeRejected {
        sequence_number: SequenceNumber,
        code: RtaErrorCode,
        message: String,
    },
    UnsubscribeAck {
        sequence_number: SequenceNumber,
        code: RtaErrorCode,
    },
    Change(ChangeEvent),
    Resync,
}

/// Encode an envelope. `sequence_number` is written only when given.
pub fn encode(
    message_type: MessageType,
    sequence_number: Option<SequenceNumber>,
    payload: &[Value],
) -> String {
    let mut fields = Vec::with_capacity(payload.len() + 2);
    fields.push(Value::from(message_type.as_wire()));
    if let Some(seq) = sequence_number {
        fields.push(Value::from(seq.0));
    }
    fields.extend(payload.iter().cloned());
    Value::Array(fields).to_string()
}

pub fn encode_subscribe(sequence_number: SequenceNumber, resource_uri: &str) -> String {
    encode(
        MessageType::Subscribe,
        Some(sequence_number),
        &[Value::from(resource_uri)],
    )
}

pub fn encode_unsubscribe(sequence_number: SequenceNumber, subscription_id: SubscriptionId) -> String {
    encode(
        MessageType::Unsubscribe,
        Some(sequence_number),
        &[Value::from(subscription_id.0)],
    )
}

/// Split a frame into envelope fields without interpreting the payload.
pub fn decode(frame: &str) -> Result<DecodedMessage, CodecError> {
    let fields: Vec<Value> = serde_json::from_str(frame)?;
    let mut fields = fields.into_iter();

    let discriminant = fields
        .next()
        .ok_or_else(|| CodecError::Malformed("empty envelope".into()))?;
    let discriminant = discriminant
        .as_u64()
        .ok_or_else(|| CodecError::Malformed(format!("non-numeric message type {discriminant}")))?;
    let message_type = MessageType::from_wire(discriminant)?;

    let sequence_number = if message_type.carries_sequence() {
        let raw = fields
            .next()
            .ok_or_else(|| CodecError::Malformed("missing sequence number".into()))?;
        Some(SequenceNumber(as_u32(&raw, "sequence number")?))
    } else {
        None
    };

    Ok(DecodedMessage {
        message_type,
        sequence_number,
        payload: fields.collect(),
    })
}

/// Decode a frame received from the service.
pub fn decode_inbound(frame: &str) -> Result<InboundMessage, CodecError> {
    let DecodedMessage {
        message_type,
        sequence_number,
        payload,
    } = decode(frame)?;

    match (message_type, sequence_number) {
        (MessageType::Subscribe, Some(sequence_number)) => {
            let code = RtaErrorCode::from_wire(field_u32(&payload, 0, "status code")?);
            if code.is_success() {
                Ok(InboundMessage::SubscribeAccepted {
                    sequence_number,
                    subscription_id: SubscriptionId(field_u32(&payload, 1, "subscription id")?),
                    data: payload.get(2).cloned().unwrap_or(Value::Null),
                })
            } else {
                let message = payload
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(InboundMessage::SubscribeRejected {
                    sequence_number,
                    code,
                    message,
                })
            }
        }
        (MessageType::Unsubscribe, Some(sequence_number)) => Ok(InboundMessage::UnsubscribeAck {
            sequence_number,
            code: RtaErrorCode::from_wire(field_u32(&payload, 0, "status code")?),
        }),
        (MessageType::ChangeEvent, _) => Ok(InboundMessage::Change(ChangeEvent {
            subscription_id: SubscriptionId(field_u32(&payload, 0, "subscription id")?),
            data: payload.get(1).cloned().unwrap_or(Value::Null),
        })),
        (MessageType::Resync, _) => Ok(InboundMessage::Resync),
        (_, None) => Err(CodecError::Malformed("missing sequence number".into())),
    }
}

fn field_u32(payload: &[Value], index: usize, name: &str) -> Result<u32, CodecError> {
    let value = payload
        .get(index)
        .ok_or_else(|| CodecError::Malformed(format!("missing {name}")))?;
    as_u32(value, name)
}

fn as_u32(value: &Value, name: &str) -> Result<u32, CodecError> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| CodecError::Malformed(format!("invalid {name}: {value}")))
}
