// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The broker owns the single router-style endpoint both consumers (REQ
// clients) and readers (DEALER, one per MDT) connect to. It maintains the
// mdt -> reader identity table (populated by SIGNAL) and the consumer ->
// mdt cache (populated by START), and otherwise just relays frames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::LcapError;
use crate::transport::{self, Request, RoutingIdentity};
use crate::wire::{OpType, RpcMessage};

const POLL_TIMEOUT_MS: i64 = 1000;

#[derive(Default)]
pub struct BrokerState {
    mdt_readers: HashMap<String, RoutingIdentity>,
    consumer_mdt: HashMap<RoutingIdentity, String>,
}

impl BrokerState {
    pub fn new() -> Self {
        BrokerState::default()
    }

    fn register_reader(&mut self, mdt: String, reader: RoutingIdentity) {
        log::info!("reader for '{mdt}' is ready");
        self.mdt_readers.insert(mdt, reader);
    }

    fn deregister_reader(&mut self, reader: &RoutingIdentity) {
        self.mdt_readers.retain(|mdt, id| {
            let keep = id != reader;
            if !keep {
                log::warn!("reader for '{mdt}' went away");
            }
            keep
        });
    }

    /// Resolve the mdt a consumer request targets: the body for START, or
    /// the cached association set up by a prior START for everything else.
    fn resolve_mdt(&self, remote: &RoutingIdentity, msg: &RpcMessage) -> Result<String, LcapError> {
        match msg {
            RpcMessage::Start { mdtname, .. } => Ok(mdtname.clone()),
            _ => self
                .consumer_mdt
                .get(remote)
                .cloned()
                .ok_or_else(|| LcapError::Protocol("request from unregistered client".into())),
        }
    }

    fn forward_to_reader(
        &mut self,
        sock: &zmq::Socket,
        remote: &RoutingIdentity,
        msg: &RpcMessage,
        body: &[u8],
    ) -> Result<(), LcapError> {
        let mdt = self.resolve_mdt(remote, msg)?;
        let reader = self
            .mdt_readers
            .get(&mdt)
            .cloned()
            .ok_or_else(|| LcapError::NotAvailable(format!("no reader for '{mdt}'")))?;

        if matches!(msg, RpcMessage::Start { .. }) {
            self.consumer_mdt.insert(remote.clone(), mdt);
        }

        transport::peer_rpc_send(sock, Some(&reader), remote, body)
    }

    fn forward_to_consumer(
        &mut self,
        sock: &zmq::Socket,
        req: &Request,
        body: &[u8],
    ) -> Result<(), LcapError> {
        let consumer = req
            .forward
            .clone()
            .ok_or_else(|| LcapError::Protocol("reader reply with no client identity".into()))?;
        transport::peer_rpc_send(sock, None, &consumer, body)
    }

    fn handle_signal(&mut self, req: &Request, ret: u64, mdtname: &str) {
        let reader = match &req.remote {
            Some(id) => id.clone(),
            None => {
                log::warn!("SIGNAL with no reader identity, ignoring");
                return;
            }
        };
        if ret == 0 {
            self.register_reader(mdtname.to_owned(), reader);
        } else {
            log::error!("reader for '{mdtname}' reported failure (code={ret})");
            self.deregister_reader(&reader);
        }
    }

    /// Handle one fully-reassembled request. Errors are turned into an ACK
    /// sent back to whichever peer owns this request's leading identity
    /// frame, mirroring `lcapd_process_request`.
    fn process(&mut self, sock: &zmq::Socket, req: Request) {
        let remote = req.remote.clone();

        let result = (|| -> Result<(), LcapError> {
            let msg = RpcMessage::decode(&req.body)?;
            match msg.op_type() {
                OpType::Start | OpType::Dequeue | OpType::Clear | OpType::Fini => {
                    let remote = remote
                        .clone()
                        .ok_or_else(|| LcapError::Protocol("client request with no identity".into()))?;
                    self.forward_to_reader(sock, &remote, &msg, &req.body)
                }
                OpType::Enqueue | OpType::Ack => self.forward_to_consumer(sock, &req, &req.body),
                OpType::Signal => {
                    if let RpcMessage::Signal { ret, mdtname } = &msg {
                        self.handle_signal(&req, *ret, mdtname);
                    }
                    Ok(())
                }
            }
        })();

        if let Err(e) = result {
            log::warn!("request failed: {e}");
            if let Some(remote) = remote {
                if let Err(ack_err) = transport::ack_retcode(sock, None, &remote, e.ack_code()) {
                    log::warn!("cannot ACK failure back to client: {ack_err}");
                }
            }
        }
    }
}

/// Bind the router socket and serve both consumers and readers until
/// `terminate` is observed.
pub fn run(ctx: &zmq::Context, bind_endpoint: &str, terminate: Arc<AtomicBool>) -> Result<(), LcapError> {
    let sock = ctx.socket(zmq::ROUTER).map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.bind(bind_endpoint).map_err(|e| LcapError::Transport(e.to_string()))?;

    let mut state = BrokerState::new();

    while !terminate.load(Ordering::Relaxed) {
        let mut items = [sock.as_poll_item(zmq::POLLIN)];
        let n = match zmq::poll(&mut items, POLL_TIMEOUT_MS) {
            Ok(n) => n,
            Err(zmq::Error::EINTR) => continue,
            Err(e) => return Err(LcapError::Transport(e.to_string())),
        };
        if n <= 0 || !items[0].is_readable() {
            continue;
        }

        transport::drain_requests(&sock, false, |req| state.process(&sock, req));
    }

    log::info!("broker stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_registers_and_deregisters_reader() {
        let mut state = BrokerState::new();
        let reader = RoutingIdentity::from("mdt0");
        let req = Request { remote: Some(reader.clone()), forward: None, body: Vec::new() };

        state.handle_signal(&req, 0, "mdt0");
        assert_eq!(state.mdt_readers.get("mdt0"), Some(&reader));

        state.handle_signal(&req, 5, "mdt0");
        assert!(state.mdt_readers.get("mdt0").is_none());
    }

    #[test]
    fn resolve_mdt_uses_cache_for_non_start_ops() {
        let mut state = BrokerState::new();
        let consumer = RoutingIdentity::from("c0");
        state.consumer_mdt.insert(consumer.clone(), "mdt0".into());
        let mdt = state.resolve_mdt(&consumer, &RpcMessage::Dequeue).unwrap();
        assert_eq!(mdt, "mdt0");
    }

    #[test]
    fn resolve_mdt_fails_for_unregistered_consumer() {
        let state = BrokerState::new();
        let consumer = RoutingIdentity::from("c0");
        let err = state.resolve_mdt(&consumer, &RpcMessage::Dequeue).unwrap_err();
        assert!(matches!(err, LcapError::Protocol(_)));
    }
}
