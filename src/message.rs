// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire codecs for ratchet messages and the prekey envelope wrapping them during session
//! establishment.
//!
//! Fields are tagged and length-prefixed with little-endian base-128 varints. Decoders are
//! lenient by construction: malformed input yields a reader with all fields unset and the
//! consumer decides how to react.
use crate::account::KeyId;

const ONE_TIME_KEY_ID_TAG: u8 = 0x08;
const BASE_KEY_TAG: u8 = 0x12;
const IDENTITY_KEY_TAG: u8 = 0x1A;
const PRE_KEY_MESSAGE_TAG: u8 = 0x22;

const RATCHET_KEY_TAG: u8 = 0x0A;
const COUNTER_TAG: u8 = 0x10;
const CIPHERTEXT_TAG: u8 = 0x22;

fn varint_length(mut value: u64) -> usize {
    let mut length = 1;
    while value >= 0x80 {
        value >>= 7;
        length += 1;
    }
    length
}

fn write_varint(output: &mut [u8], mut value: u64) -> usize {
    let mut pos = 0;
    while value >= 0x80 {
        output[pos] = (value as u8 & 0x7F) | 0x80;
        value >>= 7;
        pos += 1;
    }
    output[pos] = value as u8;
    pos + 1
}

fn read_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    for (index, &byte) in bytes.iter().enumerate() {
        let shift = 7 * index;
        if shift >= 64 {
            return None;
        }
        let chunk = u64::from(byte & 0x7F);
        if shift == 63 && chunk > 1 {
            return None;
        }
        value |= chunk << shift;
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

fn read_length_prefixed(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let (length, consumed) = read_varint(bytes)?;
    let length = usize::try_from(length).ok()?;
    let rest = &bytes[consumed..];
    if rest.len() < length {
        return None;
    }
    Some((&rest[..length], &rest[length..]))
}

// Ratchet message: version, ratchet key, counter, ciphertext, followed by the MAC suffix.

pub(crate) fn encode_message_length(
    counter: u32,
    ratchet_key_length: usize,
    ciphertext_length: usize,
) -> usize {
    1 + 1
        + varint_length(ratchet_key_length as u64)
        + ratchet_key_length
        + 1
        + varint_length(u64::from(counter))
        + 1
        + varint_length(ciphertext_length as u64)
        + ciphertext_length
}

pub(crate) struct MessageWriter<'a> {
    pub ratchet_key: &'a mut [u8],
    pub ciphertext: &'a mut [u8],
}

/// Lays out a ratchet message (without its MAC suffix) in `output` and hands back the writable
/// key and ciphertext regions. `output` must hold exactly
/// [`encode_message_length`] bytes.
pub(crate) fn encode_message(
    version: u8,
    counter: u32,
    ratchet_key_length: usize,
    ciphertext_length: usize,
    output: &mut [u8],
) -> MessageWriter<'_> {
    let mut pos = 0;
    output[pos] = version;
    pos += 1;
    output[pos] = RATCHET_KEY_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], ratchet_key_length as u64);
    let ratchet_key_start = pos;
    pos += ratchet_key_length;
    output[pos] = COUNTER_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], u64::from(counter));
    output[pos] = CIPHERTEXT_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], ciphertext_length as u64);
    let ciphertext_start = pos;

    let (_, rest) = output.split_at_mut(ratchet_key_start);
    let (ratchet_key, rest) = rest.split_at_mut(ratchet_key_length);
    let gap = ciphertext_start - ratchet_key_start - ratchet_key_length;
    let (_, rest) = rest.split_at_mut(gap);
    let (ciphertext, _) = rest.split_at_mut(ciphertext_length);

    MessageWriter {
        ratchet_key,
        ciphertext,
    }
}

#[derive(Debug, Default)]
pub(crate) struct MessageReader<'a> {
    pub version: u8,
    pub ratchet_key: Option<&'a [u8]>,
    pub counter: Option<u64>,
    pub ciphertext: Option<&'a [u8]>,
    /// Everything up to the MAC; the region the MAC authenticates.
    pub body: &'a [u8],
    pub mac: &'a [u8],
}

pub(crate) fn decode_message(bytes: &[u8], mac_length: usize) -> MessageReader<'_> {
    if bytes.len() < mac_length + 1 {
        return MessageReader::default();
    }
    let boundary = bytes.len() - mac_length;
    let body = &bytes[..boundary];
    let mac = &bytes[boundary..];

    match try_decode_message(body) {
        Some(mut reader) => {
            reader.body = body;
            reader.mac = mac;
            reader
        }
        None => MessageReader {
            version: body[0],
            ..Default::default()
        },
    }
}

fn try_decode_message(body: &[u8]) -> Option<MessageReader<'_>> {
    let (&version, mut rest) = body.split_first()?;
    let mut reader = MessageReader {
        version,
        ..Default::default()
    };

    while let Some((&tag, after_tag)) = rest.split_first() {
        match tag {
            RATCHET_KEY_TAG => {
                let (slice, remaining) = read_length_prefixed(after_tag)?;
                reader.ratchet_key = Some(slice);
                rest = remaining;
            }
            COUNTER_TAG => {
                let (value, consumed) = read_varint(after_tag)?;
                reader.counter = Some(value);
                rest = &after_tag[consumed..];
            }
            CIPHERTEXT_TAG => {
                let (slice, remaining) = read_length_prefixed(after_tag)?;
                reader.ciphertext = Some(slice);
                rest = remaining;
            }
            _ => return None,
        }
    }

    Some(reader)
}

// Prekey envelope: version, one-time key id, base key, identity key, inner message.

pub(crate) fn encode_one_time_key_message_length(
    one_time_key_id: KeyId,
    identity_key_length: usize,
    base_key_length: usize,
    message_length: usize,
) -> usize {
    1 + 1
        + varint_length(u64::from(one_time_key_id))
        + 1
        + varint_length(base_key_length as u64)
        + base_key_length
        + 1
        + varint_length(identity_key_length as u64)
        + identity_key_length
        + 1
        + varint_length(message_length as u64)
        + message_length
}

pub(crate) struct PreKeyMessageWriter<'a> {
    pub identity_key: &'a mut [u8],
    pub base_key: &'a mut [u8],
    pub message: &'a mut [u8],
}

/// Lays out the prekey envelope in `output` and hands back the writable key and inner-message
/// regions. `output` must hold exactly [`encode_one_time_key_message_length`] bytes.
pub(crate) fn encode_one_time_key_message(
    version: u8,
    one_time_key_id: KeyId,
    identity_key_length: usize,
    base_key_length: usize,
    message_length: usize,
    output: &mut [u8],
) -> PreKeyMessageWriter<'_> {
    let mut pos = 0;
    output[pos] = version;
    pos += 1;
    output[pos] = ONE_TIME_KEY_ID_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], u64::from(one_time_key_id));
    output[pos] = BASE_KEY_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], base_key_length as u64);
    let base_key_start = pos;
    pos += base_key_length;
    output[pos] = IDENTITY_KEY_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], identity_key_length as u64);
    let identity_key_start = pos;
    pos += identity_key_length;
    output[pos] = PRE_KEY_MESSAGE_TAG;
    pos += 1;
    pos += write_varint(&mut output[pos..], message_length as u64);
    let message_start = pos;

    let (_, rest) = output.split_at_mut(base_key_start);
    let (base_key, rest) = rest.split_at_mut(base_key_length);
    let gap = identity_key_start - base_key_start - base_key_length;
    let (_, rest) = rest.split_at_mut(gap);
    let (identity_key, rest) = rest.split_at_mut(identity_key_length);
    let gap = message_start - identity_key_start - identity_key_length;
    let (_, rest) = rest.split_at_mut(gap);
    let (message, _) = rest.split_at_mut(message_length);

    PreKeyMessageWriter {
        identity_key,
        base_key,
        message,
    }
}

#[derive(Debug, Default)]
pub(crate) struct PreKeyMessageReader<'a> {
    pub version: u8,
    pub one_time_key_id: Option<KeyId>,
    pub identity_key: Option<&'a [u8]>,
    pub base_key: Option<&'a [u8]>,
    pub message: Option<&'a [u8]>,
}

pub(crate) fn decode_one_time_key_message(bytes: &[u8]) -> PreKeyMessageReader<'_> {
    match try_decode_one_time_key_message(bytes) {
        Some(reader) => reader,
        None => PreKeyMessageReader {
            version: bytes.first().copied().unwrap_or_default(),
            ..Default::default()
        },
    }
}

fn try_decode_one_time_key_message(bytes: &[u8]) -> Option<PreKeyMessageReader<'_>> {
    let (&version, mut rest) = bytes.split_first()?;
    let mut reader = PreKeyMessageReader {
        version,
        ..Default::default()
    };

    while let Some((&tag, after_tag)) = rest.split_first() {
        match tag {
            ONE_TIME_KEY_ID_TAG => {
                let (value, consumed) = read_varint(after_tag)?;
                reader.one_time_key_id = Some(KeyId::try_from(value).ok()?);
                rest = &after_tag[consumed..];
            }
            BASE_KEY_TAG => {
                let (slice, remaining) = read_length_prefixed(after_tag)?;
                reader.base_key = Some(slice);
                rest = remaining;
            }
            IDENTITY_KEY_TAG => {
                let (slice, remaining) = read_length_prefixed(after_tag)?;
                reader.identity_key = Some(slice);
                rest = remaining;
            }
            PRE_KEY_MESSAGE_TAG => {
                let (slice, remaining) = read_length_prefixed(after_tag)?;
                reader.message = Some(slice);
                rest = remaining;
            }
            _ => return None,
        }
    }

    Some(reader)
}

/// Validates that an envelope carries everything inbound session establishment needs.
pub(crate) fn check_prekey_message_fields(reader: &PreKeyMessageReader<'_>) -> bool {
    let key_length = crate::crypto::x25519::KEY_SIZE;
    matches!(reader.identity_key, Some(key) if key.len() == key_length)
        && matches!(reader.base_key, Some(key) if key.len() == key_length)
        && reader.message.is_some()
        && reader.one_time_key_id.is_some()
}
