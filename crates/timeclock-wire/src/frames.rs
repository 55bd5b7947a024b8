//! Binary control-channel codec.
//!
//! The pull/control channel is a stateful binary session over TCP. Every
//! exchange is a framed packet: a 4-byte magic, a little-endian u32 payload
//! length, then the payload itself -- an 8-byte header (command, checksum,
//! session id, reply id, all u16 LE) followed by the command body.
//!
//! Record layouts and byte offsets are vendor-mandated and live only in
//! this module; they are fixture-tested against known-good byte strings.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

/// Standard control-channel TCP port.
pub const DEFAULT_CONTROL_PORT: u16 = 4370;

/// Fingerprint template slots per user (finger indexes `0..10`).
pub const MAX_FINGER_SLOTS: u8 = 10;

/// Frame magic preceding every packet on the wire.
pub const TCP_MAGIC: [u8; 4] = [0x50, 0x50, 0x82, 0x7d];

/// Packet header length (command + checksum + session id + reply id).
pub const HEADER_LEN: usize = 8;

/// Length of the magic + payload-length preamble.
pub const PREAMBLE_LEN: usize = 8;

/// Control-channel command codes.
pub mod command {
    pub const SET_USER: u16 = 8;
    /// Empty body: read all user records. Three-byte body (`uid:u16 LE,
    /// finger:u8`): read one fingerprint template.
    pub const READ_USERS: u16 = 9;
    pub const SET_TEMPLATE: u16 = 10;
    pub const GET_OPTION: u16 = 11;
    pub const READ_ATTLOG: u16 = 13;
    pub const FREE_SIZES: u16 = 50;
    pub const CONNECT: u16 = 1000;
    pub const EXIT: u16 = 1001;
    pub const GET_VERSION: u16 = 1100;
    pub const PREPARE_DATA: u16 = 1500;
    pub const DATA: u16 = 1501;
    pub const ACK_OK: u16 = 2000;
    pub const ACK_ERROR: u16 = 2001;
}

/// Errors from decoding control-channel frames and records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("bad frame magic")]
    BadMagic,

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { expected: u16, computed: u16 },

    #[error("frame too large: {0} bytes")]
    Oversized(usize),
}

/// One control-channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u16,
    pub session_id: u16,
    pub reply_id: u16,
    pub body: Vec<u8>,
}

/// Upper bound on a single frame's payload; anything larger is a corrupt
/// length field, not a real device reply.
const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

impl Packet {
    pub const fn new(command: u16, session_id: u16, reply_id: u16, body: Vec<u8>) -> Self {
        Self {
            command,
            session_id,
            reply_id,
            body,
        }
    }

    /// Encode the full frame: magic, payload length, header with checksum,
    /// body.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = HEADER_LEN + self.body.len();
        let mut frame = Vec::with_capacity(PREAMBLE_LEN + payload_len);
        frame.extend_from_slice(&TCP_MAGIC);
        #[allow(clippy::cast_possible_truncation)]
        frame.extend_from_slice(&(payload_len as u32).to_le_bytes());

        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&self.command.to_le_bytes());
        // checksum slot stays zero while summing
        header[4..6].copy_from_slice(&self.session_id.to_le_bytes());
        header[6..8].copy_from_slice(&self.reply_id.to_le_bytes());
        let sum = checksum(&header, &self.body);
        header[2..4].copy_from_slice(&sum.to_le_bytes());

        frame.extend_from_slice(&header);
        frame.extend_from_slice(&self.body);
        frame
    }

    /// Decode a packet payload (header + body), verifying the checksum.
    pub fn decode_payload(payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                need: HEADER_LEN,
                have: payload.len(),
            });
        }

        let command = u16::from_le_bytes([payload[0], payload[1]]);
        let expected = u16::from_le_bytes([payload[2], payload[3]]);
        let session_id = u16::from_le_bytes([payload[4], payload[5]]);
        let reply_id = u16::from_le_bytes([payload[6], payload[7]]);
        let body = &payload[HEADER_LEN..];

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&payload[..HEADER_LEN]);
        header[2] = 0;
        header[3] = 0;
        let computed = checksum(&header, body);
        if computed != expected {
            return Err(FrameError::ChecksumMismatch { expected, computed });
        }

        Ok(Self {
            command,
            session_id,
            reply_id,
            body: body.to_vec(),
        })
    }
}

/// Validate a frame preamble and return the payload length that follows it.
pub fn frame_length(preamble: &[u8]) -> Result<usize, FrameError> {
    if preamble.len() < PREAMBLE_LEN {
        return Err(FrameError::Truncated {
            need: PREAMBLE_LEN,
            have: preamble.len(),
        });
    }
    if preamble[..4] != TCP_MAGIC {
        return Err(FrameError::BadMagic);
    }
    let len = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]) as usize;
    if len < HEADER_LEN || len > MAX_PAYLOAD {
        return Err(FrameError::Oversized(len));
    }
    Ok(len)
}

/// 16-bit ones'-complement sum over the zero-checksum header and the body.
fn checksum(header: &[u8; HEADER_LEN], body: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut push = |word: u16| {
        sum += u32::from(word);
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    };

    for chunk in header.chunks(2).chain(body.chunks(2)) {
        let word = if chunk.len() == 2 {
            u16::from_le_bytes([chunk[0], chunk[1]])
        } else {
            u16::from(chunk[0])
        };
        push(word);
    }

    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

// =============================================================================
// Device time encoding
// =============================================================================

/// Encode a naive datetime into the device's packed u32 representation.
#[allow(clippy::cast_sign_loss)]
pub fn encode_device_time(t: NaiveDateTime) -> u32 {
    let date = t.date();
    let days = (date.year() as u32).saturating_sub(2000) * 12 * 31
        + (date.month() - 1) * 31
        + (date.day() - 1);
    days * 86_400 + t.hour() * 3_600 + t.minute() * 60 + t.second()
}

/// Decode the device's packed u32 time. Returns `None` for encodings that
/// do not name a real calendar date (the packing is not dense).
pub fn decode_device_time(raw: u32) -> Option<NaiveDateTime> {
    let seconds = raw % 86_400;
    let days = raw / 86_400;

    let day = days % 31 + 1;
    let month = (days / 31) % 12 + 1;
    let year = days / (31 * 12) + 2000;

    #[allow(clippy::cast_possible_wrap)]
    let date = NaiveDate::from_ymd_opt(year as i32, month, day)?;
    date.and_hms_opt(seconds / 3_600, (seconds / 60) % 60, seconds % 60)
}

// =============================================================================
// User record (72 bytes)
// =============================================================================

/// Serialized length of a user record; also the set-user command frame.
pub const USER_RECORD_LEN: usize = 72;

// Field offsets within the 72-byte user record (vendor-mandated).
const USER_UID: usize = 0; // u16 LE
const USER_PRIVILEGE: usize = 2; // u8
const USER_PASSWORD: usize = 3; // 8 bytes
const USER_NAME: usize = 11; // 24 bytes
const USER_CARD: usize = 35; // u32 LE
const USER_GROUP: usize = 39; // u8
// 40..48 reserved, zero
const USER_USER_ID: usize = 48; // 24 bytes

const USER_PASSWORD_LEN: usize = 8;
const USER_NAME_LEN: usize = 24;
const USER_ID_LEN: usize = 24;

/// One user as stored on a terminal.
///
/// `uid` is the terminal-internal numeric handle; `user_id` is the
/// employee identifier shared across devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub uid: u16,
    pub privilege: u8,
    pub password: String,
    pub name: String,
    pub card: u32,
    pub group: u8,
    pub user_id: String,
}

impl UserRecord {
    /// Serialize into the fixed 72-byte layout. Strings are truncated to
    /// their field width and NUL-padded.
    pub fn encode(&self) -> [u8; USER_RECORD_LEN] {
        let mut buf = [0u8; USER_RECORD_LEN];
        buf[USER_UID..USER_UID + 2].copy_from_slice(&self.uid.to_le_bytes());
        buf[USER_PRIVILEGE] = self.privilege;
        put_padded(&mut buf[USER_PASSWORD..USER_PASSWORD + USER_PASSWORD_LEN], &self.password);
        put_padded(&mut buf[USER_NAME..USER_NAME + USER_NAME_LEN], &self.name);
        buf[USER_CARD..USER_CARD + 4].copy_from_slice(&self.card.to_le_bytes());
        buf[USER_GROUP] = self.group;
        // reserved bytes 40..48 stay zero
        put_padded(&mut buf[USER_USER_ID..USER_USER_ID + USER_ID_LEN], &self.user_id);
        buf
    }

    /// Parse one 72-byte user record.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < USER_RECORD_LEN {
            return Err(FrameError::Truncated {
                need: USER_RECORD_LEN,
                have: buf.len(),
            });
        }
        Ok(Self {
            uid: u16::from_le_bytes([buf[USER_UID], buf[USER_UID + 1]]),
            privilege: buf[USER_PRIVILEGE],
            password: read_padded(&buf[USER_PASSWORD..USER_PASSWORD + USER_PASSWORD_LEN]),
            name: read_padded(&buf[USER_NAME..USER_NAME + USER_NAME_LEN]),
            card: u32::from_le_bytes([
                buf[USER_CARD],
                buf[USER_CARD + 1],
                buf[USER_CARD + 2],
                buf[USER_CARD + 3],
            ]),
            group: buf[USER_GROUP],
            user_id: read_padded(&buf[USER_USER_ID..USER_USER_ID + USER_ID_LEN]),
        })
    }
}

/// Split a concatenated user-record buffer; short trailing fragments are
/// dropped (devices pad the final data packet).
pub fn decode_user_batch(buf: &[u8]) -> Vec<UserRecord> {
    buf.chunks_exact(USER_RECORD_LEN)
        .filter_map(|chunk| UserRecord::decode(chunk).ok())
        .collect()
}

// =============================================================================
// Attendance record (40 bytes)
// =============================================================================

/// Serialized length of one buffered attendance record.
pub const ATT_RECORD_LEN: usize = 40;

const ATT_UID: usize = 0; // u16 LE
const ATT_USER_ID: usize = 2; // 24 bytes
const ATT_VERIFY: usize = 26; // u8
const ATT_TIME: usize = 27; // u32 LE, device encoding
const ATT_PUNCH: usize = 31; // u8
// 32..40 reserved

/// One punch as buffered on a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttRecord {
    pub uid: u16,
    pub user_id: String,
    pub verify: u8,
    pub timestamp: NaiveDateTime,
    pub punch_code: u8,
}

impl AttRecord {
    pub fn encode(&self) -> [u8; ATT_RECORD_LEN] {
        let mut buf = [0u8; ATT_RECORD_LEN];
        buf[ATT_UID..ATT_UID + 2].copy_from_slice(&self.uid.to_le_bytes());
        put_padded(&mut buf[ATT_USER_ID..ATT_USER_ID + USER_ID_LEN], &self.user_id);
        buf[ATT_VERIFY] = self.verify;
        buf[ATT_TIME..ATT_TIME + 4].copy_from_slice(&encode_device_time(self.timestamp).to_le_bytes());
        buf[ATT_PUNCH] = self.punch_code;
        buf
    }

    /// Parse one 40-byte record. Returns `None` when the packed time does
    /// not decode; one corrupt record must not sink the batch.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < ATT_RECORD_LEN {
            return None;
        }
        let raw_time = u32::from_le_bytes([
            buf[ATT_TIME],
            buf[ATT_TIME + 1],
            buf[ATT_TIME + 2],
            buf[ATT_TIME + 3],
        ]);
        Some(Self {
            uid: u16::from_le_bytes([buf[ATT_UID], buf[ATT_UID + 1]]),
            user_id: read_padded(&buf[ATT_USER_ID..ATT_USER_ID + USER_ID_LEN]),
            verify: buf[ATT_VERIFY],
            timestamp: decode_device_time(raw_time)?,
            punch_code: buf[ATT_PUNCH],
        })
    }
}

/// Split a concatenated attendance buffer, dropping undecodable entries.
pub fn decode_att_batch(buf: &[u8]) -> Vec<AttRecord> {
    buf.chunks_exact(ATT_RECORD_LEN)
        .filter_map(AttRecord::decode)
        .collect()
}

// =============================================================================
// Template frames
// =============================================================================

/// Set-template command frame: a 4-byte header followed by the raw
/// template, which is opaque and replayed byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateFrame {
    pub uid: u16,
    pub finger: u8,
    pub valid: u8,
    pub template: Vec<u8>,
}

impl TemplateFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.template.len());
        buf.extend_from_slice(&self.uid.to_le_bytes());
        buf.push(self.finger);
        buf.push(self.valid);
        buf.extend_from_slice(&self.template);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < 4 {
            return Err(FrameError::Truncated {
                need: 4,
                have: buf.len(),
            });
        }
        Ok(Self {
            uid: u16::from_le_bytes([buf[0], buf[1]]),
            finger: buf[2],
            valid: buf[3],
            template: buf[4..].to_vec(),
        })
    }
}

/// Body of a single-template read request.
pub fn template_request(uid: u16, finger: u8) -> [u8; 3] {
    let uid_bytes = uid.to_le_bytes();
    [uid_bytes[0], uid_bytes[1], finger]
}

// =============================================================================
// Capacity / health words
// =============================================================================

/// Registered-record counts reported by the FREE_SIZES command.
///
/// The reply is a buffer of little-endian u32 words; the counts sit at
/// fixed word indexes with vendor-reserved words between them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeSizes {
    pub users: u32,
    pub fingers: u32,
    pub punches: u32,
    pub faces: u32,
}

const SIZES_WORDS: usize = 20;
const SIZES_USERS_WORD: usize = 4;
const SIZES_FINGERS_WORD: usize = 6;
const SIZES_PUNCHES_WORD: usize = 8;
const SIZES_FACES_WORD: usize = 18;

impl FreeSizes {
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let need = (SIZES_PUNCHES_WORD + 1) * 4;
        if buf.len() < need {
            return Err(FrameError::Truncated {
                need,
                have: buf.len(),
            });
        }
        let word = |index: usize| -> u32 {
            let at = index * 4;
            buf.get(at..at + 4)
                .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        Ok(Self {
            users: word(SIZES_USERS_WORD),
            fingers: word(SIZES_FINGERS_WORD),
            punches: word(SIZES_PUNCHES_WORD),
            faces: word(SIZES_FACES_WORD),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; SIZES_WORDS * 4];
        let mut put = |index: usize, value: u32| {
            buf[index * 4..index * 4 + 4].copy_from_slice(&value.to_le_bytes());
        };
        put(SIZES_USERS_WORD, self.users);
        put(SIZES_FINGERS_WORD, self.fingers);
        put(SIZES_PUNCHES_WORD, self.punches);
        put(SIZES_FACES_WORD, self.faces);
        buf
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Copy a string into a fixed-width field, truncating and NUL-padding.
fn put_padded(dst: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(dst.len());
    dst[..n].copy_from_slice(&bytes[..n]);
    for b in &mut dst[n..] {
        *b = 0;
    }
}

/// Read a NUL-padded fixed-width field back into a string.
fn read_padded(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).trim().to_string()
}
