// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Load-balancer mode: instead of one dedicated socket per MDT, every
// reader's enqueue phase feeds a single shared ring, and a pool of
// worker threads drains it behind REP sockets proxied from the broker's
// public endpoint. Records are handed out in arrival order across every
// MDT; there is no per-consumer bucket ownership here, only a per-device
// last-acknowledged watermark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::LcapError;
use crate::lb_ring::ConsumerHandle;
use crate::source::ChangeRecord;
use crate::wire::{OpType, RpcMessage};

pub const WORKERS_ENDPOINT: &str = "inproc://lcapwrk.ipc";

/// Per-device last-acked record index, `-1` meaning nothing acked yet.
/// Stored as an atomic since it is read and written from worker threads
/// concurrently with no other coordination.
pub struct AckTable {
    by_device: HashMap<String, AtomicI64>,
}

impl AckTable {
    pub fn new(devices: &[String]) -> Self {
        let by_device = devices.iter().map(|d| (d.clone(), AtomicI64::new(-1))).collect();
        AckTable { by_device }
    }

    fn set(&self, device: &str, index: i64) -> Result<(), LcapError> {
        self.by_device
            .get(device)
            .ok_or_else(|| LcapError::NotAvailable(format!("unknown device '{device}'")))?
            .store(index, Ordering::Relaxed);
        Ok(())
    }

    pub fn get(&self, device: &str) -> Result<i64, LcapError> {
        self.by_device
            .get(device)
            .map(|a| a.load(Ordering::Relaxed))
            .ok_or_else(|| LcapError::NotAvailable(format!("unknown device '{device}'")))
    }
}

pub struct WorkerContext {
    pub devices: Vec<String>,
    pub batch_size: usize,
    pub ring: ConsumerHandle<ChangeRecord>,
    pub acks: Arc<AckTable>,
}

fn handle_start(ctx: &WorkerContext, msg: &RpcMessage) -> Result<(), LcapError> {
    let mdtname = match msg {
        RpcMessage::Start { mdtname, .. } => mdtname,
        _ => unreachable!(),
    };
    if ctx.devices.iter().any(|d| d == mdtname) {
        Ok(())
    } else {
        Err(LcapError::NotAvailable(format!("unknown device '{mdtname}'")))
    }
}

fn handle_clear(ctx: &WorkerContext, msg: &RpcMessage) -> Result<(), LcapError> {
    let (index, mdtname) = match msg {
        RpcMessage::Clear { index, mdtname, .. } => (*index, mdtname.clone()),
        _ => unreachable!(),
    };
    ctx.acks.set(&mdtname, index)
}

/// Drain up to `batch_size` records from the shared ring and encode them as
/// an ENQUEUE reply body. Mirrors `ack_send_records`: an empty first pop is
/// reported as end-of-stream rather than an error.
fn handle_dequeue(ctx: &WorkerContext) -> Result<Vec<u8>, LcapError> {
    let mut records = Vec::new();
    let mut count = 0u32;
    for _ in 0..ctx.batch_size {
        match ctx.ring.pop() {
            Some(rec) => {
                records.extend_from_slice(&rec.encode());
                count += 1;
            }
            None => break,
        }
    }
    if count == 0 {
        return Err(LcapError::EndOfStream);
    }
    Ok(RpcMessage::Enqueue { records, count }.encode())
}

/// Process one request body, returning the exact reply body to send back
/// on the REP socket.
fn rpc_handler(ctx: &WorkerContext, body: &[u8]) -> Vec<u8> {
    let msg = match RpcMessage::decode(body) {
        Ok(m) => m,
        Err(e) => return RpcMessage::Ack { retcode: e.ack_code() }.encode(),
    };

    match msg.op_type() {
        OpType::Dequeue => match handle_dequeue(ctx) {
            Ok(body) => body,
            Err(e) => RpcMessage::Ack { retcode: e.ack_code() }.encode(),
        },
        OpType::Start => {
            let retcode = handle_start(ctx, &msg).err().map(|e| e.ack_code()).unwrap_or(0);
            RpcMessage::Ack { retcode }.encode()
        }
        OpType::Clear => {
            let retcode = handle_clear(ctx, &msg).err().map(|e| e.ack_code()).unwrap_or(0);
            RpcMessage::Ack { retcode }.encode()
        }
        OpType::Fini => RpcMessage::Ack { retcode: 0 }.encode(),
        OpType::Enqueue | OpType::Ack | OpType::Signal => {
            log::warn!("worker received unexpected {} RPC, ignoring", msg.op_type().as_str());
            RpcMessage::Ack { retcode: LcapError::Protocol("unexpected op".into()).ack_code() }.encode()
        }
    }
}

/// One worker thread's main loop: a REP socket connected to the internal
/// backend endpoint the broker proxies client traffic onto.
pub fn run(ctx: &zmq::Context, ctx_state: Arc<WorkerContext>, terminate: Arc<AtomicBool>) -> Result<(), LcapError> {
    let sock = ctx.socket(zmq::REP).map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.connect(WORKERS_ENDPOINT).map_err(|e| LcapError::Transport(e.to_string()))?;

    while !terminate.load(Ordering::Relaxed) {
        let mut items = [sock.as_poll_item(zmq::POLLIN)];
        let n = match zmq::poll(&mut items, 500) {
            Ok(n) => n,
            Err(zmq::Error::EINTR) => continue,
            Err(e) => return Err(LcapError::Transport(e.to_string())),
        };
        if n <= 0 || !items[0].is_readable() {
            continue;
        }

        let body = match sock.recv_bytes(0) {
            Ok(b) => b,
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => return Err(LcapError::Transport(e.to_string())),
        };

        let reply = rpc_handler(&ctx_state, &body);
        if let Err(e) = sock.send(reply, 0) {
            log::warn!("worker: cannot send reply: {e}");
        }
    }
    Ok(())
}

/// Proxy client traffic arriving on the broker's public endpoint to the
/// pool of REP workers connected at [`WORKERS_ENDPOINT`]. Blocks until the
/// sockets are closed or an error occurs; run this on its own thread.
pub fn run_proxy(ctx: &zmq::Context, frontend: zmq::Socket) -> Result<(), LcapError> {
    let backend = ctx.socket(zmq::DEALER).map_err(|e| LcapError::Transport(e.to_string()))?;
    backend
        .bind(WORKERS_ENDPOINT)
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    zmq::proxy(&frontend, &backend).map_err(|e| LcapError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lb_ring::Ring;

    fn ctx(devices: &[&str]) -> WorkerContext {
        let ring: Ring<ChangeRecord> = Ring::with_capacity(16);
        WorkerContext {
            devices: devices.iter().map(|s| s.to_string()).collect(),
            batch_size: 4,
            ring: ring.consumer(),
            acks: Arc::new(AckTable::new(&devices.iter().map(|s| s.to_string()).collect::<Vec<_>>())),
        }
    }

    #[test]
    fn start_accepts_known_device_rejects_unknown() {
        let c = ctx(&["mdt0"]);
        let known = RpcMessage::Start { flags: 0, start: 0, mdtname: "mdt0".into() };
        assert!(handle_start(&c, &known).is_ok());
        let unknown = RpcMessage::Start { flags: 0, start: 0, mdtname: "mdt9".into() };
        assert!(matches!(handle_start(&c, &unknown).unwrap_err(), LcapError::NotAvailable(_)));
    }

    #[test]
    fn dequeue_on_empty_ring_is_end_of_stream() {
        let c = ctx(&["mdt0"]);
        let err = handle_dequeue(&c).unwrap_err();
        assert!(matches!(err, LcapError::EndOfStream));
    }

    #[test]
    fn clear_updates_ack_table_for_known_device() {
        let c = ctx(&["mdt0"]);
        let msg = RpcMessage::Clear { index: 42, reader_id: Vec::new(), mdtname: "mdt0".into() };
        handle_clear(&c, &msg).unwrap();
        assert_eq!(c.acks.get("mdt0").unwrap(), 42);
    }

    #[test]
    fn clear_on_unknown_device_is_not_available() {
        let c = ctx(&["mdt0"]);
        let msg = RpcMessage::Clear { index: 1, reader_id: Vec::new(), mdtname: "mdt9".into() };
        assert!(matches!(handle_clear(&c, &msg).unwrap_err(), LcapError::NotAvailable(_)));
    }
}
