// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-layout wire IDL: every message begins with an 8-byte header
// `{op_type: u32, reserved: u32}`, little-endian, tightly packed, no
// padding beyond what is explicitly declared below.

use crate::error::LcapError;

pub const MDTNAME_LEN: usize = 128;
pub const HDR_LEN: usize = 8;

/// Stable op-type tag values. Order and numbering are part of the wire
/// contract and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpType {
    Start = 0,
    Dequeue = 1,
    Clear = 2,
    Fini = 3,
    Enqueue = 4,
    Ack = 5,
    Signal = 6,
}

impl OpType {
    pub fn from_u32(v: u32) -> Option<OpType> {
        match v {
            0 => Some(OpType::Start),
            1 => Some(OpType::Dequeue),
            2 => Some(OpType::Clear),
            3 => Some(OpType::Fini),
            4 => Some(OpType::Enqueue),
            5 => Some(OpType::Ack),
            6 => Some(OpType::Signal),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpType::Start => "START",
            OpType::Dequeue => "DEQUEUE",
            OpType::Clear => "CLEAR",
            OpType::Fini => "FINI",
            OpType::Enqueue => "ENQUEUE",
            OpType::Ack => "ACK",
            OpType::Signal => "SIGNAL",
        }
    }
}

/// A decoded RPC message body (without the leading routing frames).
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Start { flags: u32, start: u64, mdtname: String },
    Dequeue,
    Clear { index: i64, reader_id: Vec<u8>, mdtname: String },
    Fini,
    Enqueue { records: Vec<u8>, count: u32 },
    Ack { retcode: i32 },
    Signal { ret: u64, mdtname: String },
}

impl RpcMessage {
    pub fn op_type(&self) -> OpType {
        match self {
            RpcMessage::Start { .. } => OpType::Start,
            RpcMessage::Dequeue => OpType::Dequeue,
            RpcMessage::Clear { .. } => OpType::Clear,
            RpcMessage::Fini => OpType::Fini,
            RpcMessage::Enqueue { .. } => OpType::Enqueue,
            RpcMessage::Ack { .. } => OpType::Ack,
            RpcMessage::Signal { .. } => OpType::Signal,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.op_type() as u32).to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // reserved

        match self {
            RpcMessage::Start { flags, start, mdtname } => {
                buf.extend_from_slice(&flags.to_le_bytes());
                buf.extend_from_slice(&0u32.to_le_bytes()); // padding
                buf.extend_from_slice(&start.to_le_bytes());
                buf.extend_from_slice(&pack_fixed_str(mdtname, MDTNAME_LEN));
            }
            RpcMessage::Dequeue | RpcMessage::Fini => {}
            RpcMessage::Clear { index, reader_id, mdtname } => {
                let id = pack_clear_id(reader_id, mdtname);
                buf.extend_from_slice(&index.to_le_bytes());
                buf.extend_from_slice(&(id.len() as i32).to_le_bytes());
                buf.extend_from_slice(&id);
            }
            RpcMessage::Enqueue { records, count } => {
                buf.extend_from_slice(&count.to_le_bytes());
                buf.extend_from_slice(records);
            }
            RpcMessage::Ack { retcode } => {
                buf.extend_from_slice(&retcode.to_le_bytes());
            }
            RpcMessage::Signal { ret, mdtname } => {
                buf.extend_from_slice(&ret.to_le_bytes());
                buf.extend_from_slice(&pack_fixed_str(mdtname, MDTNAME_LEN));
            }
        }
        buf
    }

    pub fn decode(body: &[u8]) -> Result<RpcMessage, LcapError> {
        if body.len() < HDR_LEN {
            return Err(LcapError::Protocol(format!(
                "truncated header: {} bytes",
                body.len()
            )));
        }
        let op_raw = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let op = OpType::from_u32(op_raw)
            .ok_or_else(|| LcapError::InvalidArgument(format!("invalid opcode {op_raw}")))?;

        let expected = expected_length(op);
        if body.len() < expected {
            return Err(LcapError::Protocol(format!(
                "truncated {} body: {} < {}",
                op.as_str(),
                body.len(),
                expected
            )));
        }

        let rest = &body[HDR_LEN..];
        Ok(match op {
            OpType::Start => {
                let flags = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let start = u64::from_le_bytes(rest[8..16].try_into().unwrap());
                let mdtname = unpack_fixed_str(&rest[16..16 + MDTNAME_LEN]);
                RpcMessage::Start { flags, start, mdtname }
            }
            OpType::Dequeue => RpcMessage::Dequeue,
            OpType::Clear => {
                let index = i64::from_le_bytes(rest[0..8].try_into().unwrap());
                let id_len = i32::from_le_bytes(rest[8..12].try_into().unwrap());
                if id_len < 0 || (id_len as usize) > rest.len() - 12 {
                    return Err(LcapError::Protocol("CLEAR id_len out of range".into()));
                }
                let id = &rest[12..12 + id_len as usize];
                let (reader_id, mdtname) = unpack_clear_id(id)?;
                RpcMessage::Clear { index, reader_id, mdtname }
            }
            OpType::Fini => RpcMessage::Fini,
            OpType::Enqueue => {
                let count = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                RpcMessage::Enqueue { count, records: rest[4..].to_vec() }
            }
            OpType::Ack => {
                let retcode = i32::from_le_bytes(rest[0..4].try_into().unwrap());
                RpcMessage::Ack { retcode }
            }
            OpType::Signal => {
                let ret = u64::from_le_bytes(rest[0..8].try_into().unwrap());
                let mdtname = unpack_fixed_str(&rest[8..8 + MDTNAME_LEN]);
                RpcMessage::Signal { ret, mdtname }
            }
        })
    }
}

/// Minimum body length (including the 8-byte header) for each op-type's
/// fixed prefix. Variable-length ops (`CLEAR`, `ENQUEUE`) are measured at
/// their fixed prefix only; trailing data is optional.
pub fn expected_length(op: OpType) -> usize {
    match op {
        OpType::Start => HDR_LEN + 4 + 4 + 8 + MDTNAME_LEN,
        OpType::Dequeue => HDR_LEN,
        OpType::Clear => HDR_LEN + 8 + 4,
        OpType::Fini => HDR_LEN,
        OpType::Enqueue => HDR_LEN + 4,
        OpType::Ack => HDR_LEN + 4,
        OpType::Signal => HDR_LEN + 8 + MDTNAME_LEN,
    }
}

fn pack_fixed_str(s: &str, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack_fixed_str(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// The CLEAR `id` field is two NUL-terminated strings back to back:
/// `reader_id` then `mdt_name`. Mirrors `px_rpc_get_id`/`px_rpc_get_mdtname`.
fn pack_clear_id(reader_id: &[u8], mdtname: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(reader_id.len() + 1 + mdtname.len() + 1);
    buf.extend_from_slice(reader_id);
    buf.push(0);
    buf.extend_from_slice(mdtname.as_bytes());
    buf.push(0);
    buf
}

fn unpack_clear_id(id: &[u8]) -> Result<(Vec<u8>, String), LcapError> {
    let split = id
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| LcapError::Protocol("CLEAR id missing NUL terminator".into()))?;
    let reader_id = id[..split].to_vec();
    let rest = &id[split + 1..];
    let mdt_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
    let mdtname = String::from_utf8_lossy(&rest[..mdt_end]).into_owned();
    Ok((reader_id, mdtname))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_round_trip() {
        let msg = RpcMessage::Start { flags: 3, start: 42, mdtname: "mdt0".into() };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), expected_length(OpType::Start));
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn clear_round_trip_with_variable_id() {
        let msg = RpcMessage::Clear {
            index: -1,
            reader_id: b"r0".to_vec(),
            mdtname: "mdt0".into(),
        };
        let bytes = msg.encode();
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn enqueue_round_trip_with_records() {
        let msg = RpcMessage::Enqueue { records: vec![1, 2, 3, 4], count: 1 };
        let bytes = msg.encode();
        assert_eq!(RpcMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn ack_and_signal_round_trip() {
        let ack = RpcMessage::Ack { retcode: -22 };
        assert_eq!(RpcMessage::decode(&ack.encode()).unwrap(), ack);

        let signal = RpcMessage::Signal { ret: 13, mdtname: "mdt1".into() };
        assert_eq!(RpcMessage::decode(&signal.encode()).unwrap(), signal);
    }

    #[test]
    fn truncated_header_is_protocol_error() {
        let err = RpcMessage::decode(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, LcapError::Protocol(_)));
    }

    #[test]
    fn truncated_start_body_is_protocol_error() {
        let mut bytes = RpcMessage::Start { flags: 0, start: 0, mdtname: "mdt0".into() }.encode();
        bytes.truncate(10);
        let err = RpcMessage::decode(&bytes).unwrap_err();
        assert!(matches!(err, LcapError::Protocol(_)));
    }

    #[test]
    fn out_of_range_opcode_is_invalid_argument() {
        let mut bytes = vec![0u8; HDR_LEN];
        bytes[0..4].copy_from_slice(&99u32.to_le_bytes());
        let err = RpcMessage::decode(&bytes).unwrap_err();
        assert!(matches!(err, LcapError::InvalidArgument(_)));
    }
}
