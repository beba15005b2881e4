//! Wire message shapes.
//!
//! Every message is a CBOR-style map with text keys. Handshake and negotiation
//! messages are discriminated by `type` + `stage`; steady-state frames by
//! their key set:
//!
//! ```text
//! {type:"handshake",   stage:0, challenge}     {type:"negotiation", stage:0|1, addressKey}
//! {type:"handshake",   stage:1, response}      {type:"negotiation", stage:2|3, encryptedMessageKey}
//! {type:"handshake",   stage:2}                {type:"negotiation", stage:4|5, extraData:{i,d}}
//!
//! {i:<12-byte IV>, d:<ciphertext>}   secure frame
//! {d:<PacketData>}                   unsecure control frame
//! ```
//!
//! Parsing is strict per stage: the map must carry exactly the expected keys
//! with the expected types. There is no generic deserializer on this path.

use crate::error::{ProtocolError, Result};
use crate::transport::Message;
use ciborium::value::Integer;
use peerlink_crypto::{EncryptedPacket, KeyRecord};

const HANDSHAKE: &str = "handshake";
const NEGOTIATION: &str = "negotiation";

fn text(value: &str) -> Message {
    Message::Text(value.to_owned())
}

fn entry(key: &str, value: Message) -> (Message, Message) {
    (text(key), value)
}

fn staged(kind: &str, stage: u8, field: Option<(&str, Message)>) -> Message {
    let mut entries = vec![
        entry("type", text(kind)),
        entry("stage", Message::Integer(Integer::from(stage))),
    ];
    if let Some((key, value)) = field {
        entries.push(entry(key, value));
    }
    Message::Map(entries)
}

fn lookup<'a>(entries: &'a [(Message, Message)], key: &str) -> Option<&'a Message> {
    entries
        .iter()
        .find(|(k, _)| k.as_text() == Some(key))
        .map(|(_, v)| v)
}

/// Check `message` against one staged shape and return its payload field.
fn parse_staged<'a>(
    message: &'a Message,
    kind: &str,
    stage: u8,
    field: Option<&str>,
) -> std::result::Result<Option<&'a Message>, &'static str> {
    let entries = message.as_map().ok_or("message is not a map")?;
    let expected_len = 2 + usize::from(field.is_some());
    if entries.len() != expected_len {
        return Err("unexpected field count");
    }
    if lookup(entries, "type").and_then(Message::as_text) != Some(kind) {
        return Err("wrong message type");
    }
    let received_stage = lookup(entries, "stage")
        .and_then(Message::as_integer)
        .and_then(|i| u64::try_from(i).ok());
    if received_stage != Some(u64::from(stage)) {
        return Err("unexpected stage");
    }
    match field {
        Some(key) => lookup(entries, key).map(Some).ok_or("missing payload field"),
        None => Ok(None),
    }
}

fn staged_bytes<'a>(
    message: &'a Message,
    kind: &str,
    stage: u8,
    field: &str,
) -> std::result::Result<&'a [u8], &'static str> {
    parse_staged(message, kind, stage, Some(field))?
        .and_then(Message::as_bytes)
        .map(Vec::as_slice)
        .ok_or("payload field is not a byte string")
}

// ============================================================================
// Handshake challenge
// ============================================================================

/// Stage 0: encrypted challenge.
pub fn handshake_challenge(challenge: Vec<u8>) -> Message {
    staged(HANDSHAKE, 0, Some(("challenge", Message::Bytes(challenge))))
}

/// Stage 1: challenge re-encrypted under the poser's key.
pub fn handshake_response(response: Vec<u8>) -> Message {
    staged(HANDSHAKE, 1, Some(("response", Message::Bytes(response))))
}

/// Stage 2: poser confirms.
pub fn handshake_confirm() -> Message {
    staged(HANDSHAKE, 2, None)
}

/// Parse a stage 0 handshake message.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedHandshake`] on any shape mismatch.
pub fn parse_handshake_challenge(message: &Message) -> Result<&[u8]> {
    staged_bytes(message, HANDSHAKE, 0, "challenge").map_err(ProtocolError::malformed_handshake)
}

/// Parse a stage 1 handshake message.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedHandshake`] on any shape mismatch.
pub fn parse_handshake_response(message: &Message) -> Result<&[u8]> {
    staged_bytes(message, HANDSHAKE, 1, "response").map_err(ProtocolError::malformed_handshake)
}

/// Parse a stage 2 handshake message.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedHandshake`] on any shape mismatch.
pub fn parse_handshake_confirm(message: &Message) -> Result<()> {
    parse_staged(message, HANDSHAKE, 2, None)
        .map(|_| ())
        .map_err(ProtocolError::malformed_handshake)
}

// ============================================================================
// Negotiation
// ============================================================================

/// Stages 0 and 1: own identity key record.
///
/// # Errors
///
/// Returns [`ProtocolError::Serialization`] if the record cannot be encoded.
pub fn negotiation_address_key(stage: u8, record: &KeyRecord) -> Result<Message> {
    let value =
        Message::serialized(record).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    Ok(staged(NEGOTIATION, stage, Some(("addressKey", value))))
}

/// Stages 2 and 3: block-encrypted messaging key and nonce.
pub fn negotiation_message_key(stage: u8, encrypted: Vec<u8>) -> Message {
    staged(
        NEGOTIATION,
        stage,
        Some(("encryptedMessageKey", Message::Bytes(encrypted))),
    )
}

/// Stages 4 and 5: extra data sealed under the session key.
pub fn negotiation_extra_data(stage: u8, packet: &EncryptedPacket) -> Message {
    staged(NEGOTIATION, stage, Some(("extraData", secure_frame(packet))))
}

/// Parse an identity key stage.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] on any shape mismatch.
pub fn parse_address_key(message: &Message, stage: u8) -> Result<KeyRecord> {
    let value = parse_staged(message, NEGOTIATION, stage, Some("addressKey"))
        .map_err(ProtocolError::malformed)?
        .ok_or(ProtocolError::malformed("missing addressKey"))?;
    if value.as_map().is_none() {
        return Err(ProtocolError::malformed("addressKey is not a key record"));
    }
    value
        .deserialized()
        .map_err(|_| ProtocolError::malformed("addressKey is not a key record"))
}

/// Parse a messaging key stage.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] on any shape mismatch.
pub fn parse_message_key(message: &Message, stage: u8) -> Result<&[u8]> {
    staged_bytes(message, NEGOTIATION, stage, "encryptedMessageKey")
        .map_err(ProtocolError::malformed)
}

/// Parse an extra data stage.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] on any shape mismatch.
pub fn parse_extra_data(message: &Message, stage: u8) -> Result<EncryptedPacket> {
    let value = parse_staged(message, NEGOTIATION, stage, Some("extraData"))
        .map_err(ProtocolError::malformed)?
        .ok_or(ProtocolError::malformed("missing extraData"))?;
    match parse_frame(value)? {
        Frame::Secure(packet) => Ok(packet),
        Frame::Unsecure(_) => Err(ProtocolError::malformed("extraData must be encrypted")),
    }
}

// ============================================================================
// Steady-state frames
// ============================================================================

/// Steady-state frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `{i, d}` encrypted packet
    Secure(EncryptedPacket),
    /// `{d}` plaintext control payload
    Unsecure(Message),
}

/// Encode an encrypted packet as `{i, d}`.
pub fn secure_frame(packet: &EncryptedPacket) -> Message {
    Message::Map(vec![
        entry("i", Message::Bytes(packet.iv.to_vec())),
        entry("d", Message::Bytes(packet.ciphertext.clone())),
    ])
}

/// Encode a plaintext payload as `{d}`.
pub fn unsecure_frame(payload: Message) -> Message {
    Message::Map(vec![entry("d", payload)])
}

/// Classify a steady-state frame.
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedMessage`] for any other shape and
/// [`ProtocolError::Decryption`] for an IV of the wrong length.
pub fn parse_frame(message: &Message) -> Result<Frame> {
    let entries = message
        .as_map()
        .ok_or(ProtocolError::malformed("frame is not a map"))?;
    let data = lookup(entries, "d").ok_or(ProtocolError::malformed("frame has no `d`"))?;
    match (entries.len(), lookup(entries, "i")) {
        (1, None) => Ok(Frame::Unsecure(data.clone())),
        (2, Some(iv)) => {
            let iv = iv
                .as_bytes()
                .ok_or(ProtocolError::malformed("`i` is not a byte string"))?;
            let ciphertext = data
                .as_bytes()
                .ok_or(ProtocolError::malformed("`d` is not a byte string"))?;
            Ok(Frame::Secure(EncryptedPacket::from_parts(
                iv,
                ciphertext.clone(),
            )?))
        }
        _ => Err(ProtocolError::malformed("unrecognised frame shape")),
    }
}
