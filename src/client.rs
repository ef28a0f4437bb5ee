// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Consumer-side library. `ProxyClient` is the normal path: a REQ socket
// talking to the broker, with a local cache of undelivered records so a
// CLEAR that still has outstanding records queued locally can be answered
// without a round trip. `DirectClient` bypasses the broker entirely and
// reads a `ChangelogSource` in-process, for callers running in the same
// address space as the daemon (no transport, no multi-consumer fan-out).

use crate::error::LcapError;
use crate::source::{ChangeRecord, ChangelogSource, ChangelogSourceHandle};
use crate::wire::RpcMessage;

pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Operations common to every client backend, mirroring the daemon's own
/// START/DEQUEUE/CLEAR/FINI state machine from the consumer's side.
pub trait ClientBackend {
    fn recv(&mut self) -> Result<ChangeRecord, LcapError>;
    fn free(&mut self);
    fn clear(&mut self, reader_id: &[u8], end_record: i64) -> Result<(), LcapError>;
    fn fini(&mut self) -> Result<(), LcapError>;
}

/// REQ-socket client talking to the broker's public endpoint.
pub struct ProxyClient {
    sock: zmq::Socket,
    mdt: String,
    cache: Vec<ChangeRecord>,
    next: usize,
}

impl ProxyClient {
    /// Connect and register (`START`) against `mdt` at `start_index`.
    pub fn start(
        ctx: &zmq::Context,
        endpoint: &str,
        mdt: &str,
        flags: u32,
        start_index: u64,
    ) -> Result<ProxyClient, LcapError> {
        let sock = ctx.socket(zmq::REQ).map_err(|e| LcapError::Transport(e.to_string()))?;
        sock.connect(endpoint).map_err(|e| LcapError::Transport(e.to_string()))?;

        let mut client = ProxyClient {
            sock,
            mdt: mdt.to_owned(),
            cache: Vec::with_capacity(DEFAULT_CACHE_SIZE),
            next: 0,
        };

        let body = RpcMessage::Start { flags, start: start_index, mdtname: mdt.to_owned() }.encode();
        client.send(&body)?;
        let retcode = client.recv_ack()?;
        if retcode != 0 {
            return Err(LcapError::from_ack_code(retcode));
        }
        Ok(client)
    }

    /// `[mdt][body]`: the leading frame tells the broker which device this
    /// request targets; the REQ socket adds its own envelope delimiter.
    fn send(&self, body: &[u8]) -> Result<(), LcapError> {
        self.sock
            .send(self.mdt.as_bytes(), zmq::SNDMORE)
            .map_err(|e| LcapError::Transport(e.to_string()))?;
        self.sock.send(body, 0).map_err(|e| LcapError::Transport(e.to_string()))
    }

    fn recv_ack(&self) -> Result<i32, LcapError> {
        let body = self.sock.recv_bytes(0).map_err(|e| LcapError::Transport(e.to_string()))?;
        match RpcMessage::decode(&body)? {
            RpcMessage::Ack { retcode } => Ok(retcode),
            other => Err(LcapError::Protocol(format!(
                "expected ACK, got {}",
                other.op_type().as_str()
            ))),
        }
    }

    fn dequeue(&mut self) -> Result<(), LcapError> {
        let body = RpcMessage::Dequeue.encode();
        self.send(&body)?;

        let reply = self.sock.recv_bytes(0).map_err(|e| LcapError::Transport(e.to_string()))?;
        match RpcMessage::decode(&reply)? {
            RpcMessage::Ack { retcode } => Err(LcapError::from_ack_code(retcode)),
            RpcMessage::Enqueue { records, count } => {
                self.cache = ChangeRecord::decode_all(&records, count)?;
                self.next = 0;
                Ok(())
            }
            other => Err(LcapError::Protocol(format!(
                "expected ENQUEUE or ACK, got {}",
                other.op_type().as_str()
            ))),
        }
    }
}

impl ClientBackend for ProxyClient {
    fn recv(&mut self) -> Result<ChangeRecord, LcapError> {
        if self.next == self.cache.len() {
            self.dequeue()?;
        }
        let rec = self.cache[self.next].clone();
        self.next += 1;
        Ok(rec)
    }

    fn free(&mut self) {
        if self.next == self.cache.len() {
            self.cache.clear();
        }
    }

    fn clear(&mut self, reader_id: &[u8], end_record: i64) -> Result<(), LcapError> {
        if self.next < self.cache.len() {
            // Still holding undelivered records locally: nothing to clear yet.
            return Ok(());
        }
        let body = RpcMessage::Clear {
            index: end_record,
            reader_id: reader_id.to_vec(),
            mdtname: self.mdt.clone(),
        }
        .encode();
        self.send(&body)?;
        let retcode = self.recv_ack()?;
        if retcode == 0 {
            Ok(())
        } else {
            Err(LcapError::from_ack_code(retcode))
        }
    }

    fn fini(&mut self) -> Result<(), LcapError> {
        let body = RpcMessage::Fini.encode();
        self.send(&body)?;
        let retcode = self.recv_ack()?;
        if retcode == 0 {
            Ok(())
        } else {
            Err(LcapError::from_ack_code(retcode))
        }
    }
}

/// In-process client reading a `ChangelogSource` directly, for callers
/// that run inside the daemon's own address space and don't need fan-out
/// across multiple consumers.
pub struct DirectClient {
    handle: Box<dyn ChangelogSourceHandle>,
}

impl DirectClient {
    pub fn start(source: &dyn ChangelogSource, start_index: u64) -> Result<DirectClient, LcapError> {
        Ok(DirectClient { handle: source.open(start_index)? })
    }
}

impl ClientBackend for DirectClient {
    fn recv(&mut self) -> Result<ChangeRecord, LcapError> {
        self.handle.recv()
    }

    fn free(&mut self) {}

    fn clear(&mut self, _reader_id: &[u8], end_record: i64) -> Result<(), LcapError> {
        self.handle.clear(end_record)
    }

    fn fini(&mut self) -> Result<(), LcapError> {
        self.handle.close();
        Ok(())
    }
}
