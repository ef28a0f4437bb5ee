// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multipart framing over a router-style transport. A remote identity
// frame is prepended to every inbound message by the transport; readers
// connect with a dealer-style identity equal to their MDT name, so no
// envelope frame is prepended there (see `Request::no_envelope` callers).

use crate::error::LcapError;

/// Opaque routing identity, compared only as a byte-string. The source's
/// `cid_compare` folds three states into one boolean; we keep the
/// distinction explicit instead of matching on a signed return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingIdentity(pub Vec<u8>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityOrdering {
    Equal,
    Different,
}

impl RoutingIdentity {
    pub fn compare(&self, other: &RoutingIdentity) -> IdentityOrdering {
        if self.0 == other.0 {
            IdentityOrdering::Equal
        } else {
            IdentityOrdering::Different
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for RoutingIdentity {
    fn from(s: &str) -> Self {
        RoutingIdentity(s.as_bytes().to_vec())
    }
}

/// One fully-reassembled inbound message: `remote` is who sent it (absent
/// when the endpoint itself carries no identity frame), `forward` is who
/// it should be routed to next (absent for reader-originated traffic),
/// `body` is the concatenated message payload.
#[derive(Debug)]
pub struct Request {
    pub remote: Option<RoutingIdentity>,
    pub forward: Option<RoutingIdentity>,
    pub body: Vec<u8>,
}

/// Receive one multipart message without blocking. Frames are consumed in
/// full even when the request turns out to be malformed, so the next call
/// never misaligns onto a mid-message boundary. `Ok(None)` means no
/// message was currently available.
pub fn recv_one_request(
    sock: &zmq::Socket,
    no_envelope: bool,
) -> Result<Option<Request>, LcapError> {
    let frames = match sock.recv_multipart(zmq::DONTWAIT) {
        Ok(frames) => frames,
        Err(zmq::Error::EAGAIN) => return Ok(None),
        Err(e) => return Err(LcapError::Transport(e.to_string())),
    };

    let mut remote = None;
    let mut forward = None;
    let mut body = Vec::new();

    for frame in frames {
        if frame.is_empty() {
            continue; // delimiter
        }
        if !no_envelope && remote.is_none() {
            remote = Some(RoutingIdentity(frame));
            continue;
        }
        if forward.is_none() {
            forward = Some(RoutingIdentity(frame));
            continue;
        }
        body.extend_from_slice(&frame);
    }

    if body.is_empty() {
        return Err(LcapError::Protocol("received RPC with empty body".into()));
    }

    Ok(Some(Request { remote, forward, body }))
}

/// Drain every currently-available message on `sock`, invoking `handler`
/// for each successfully reassembled [`Request`]. Transport/protocol
/// errors on an individual message are logged and do not stop the drain.
/// Returns the count of requests delivered to `handler`.
pub fn drain_requests<F>(sock: &zmq::Socket, no_envelope: bool, mut handler: F) -> usize
where
    F: FnMut(Request),
{
    let mut processed = 0;
    loop {
        match recv_one_request(sock, no_envelope) {
            Ok(Some(req)) => {
                handler(req);
                processed += 1;
            }
            Ok(None) => break,
            Err(e) => {
                log::warn!("dropping malformed RPC: {e}");
            }
        }
    }
    processed
}

/// `peer_rpc_send(sock, src, dst, body)`: emits `[src?][empty][dst][empty]
/// [body]`. `src` is only present when a third party (the broker) relays
/// on behalf of another identity.
pub fn peer_rpc_send(
    sock: &zmq::Socket,
    src: Option<&RoutingIdentity>,
    dst: &RoutingIdentity,
    body: &[u8],
) -> Result<(), LcapError> {
    let mut parts: Vec<&[u8]> = Vec::with_capacity(5);
    if let Some(src) = src {
        parts.push(src.as_bytes());
        parts.push(b"");
    }
    parts.push(dst.as_bytes());
    parts.push(b"");
    parts.push(body);
    sock.send_multipart(parts, 0)
        .map_err(|e| LcapError::Transport(e.to_string()))
}

pub fn ack_retcode(
    sock: &zmq::Socket,
    src: Option<&RoutingIdentity>,
    dst: &RoutingIdentity,
    retcode: i32,
) -> Result<(), LcapError> {
    let body = crate::wire::RpcMessage::Ack { retcode }.encode();
    peer_rpc_send(sock, src, dst, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_compare_is_byte_equality() {
        let a = RoutingIdentity::from("mdt0");
        let b = RoutingIdentity::from("mdt0");
        let c = RoutingIdentity::from("mdt1");
        assert_eq!(a.compare(&b), IdentityOrdering::Equal);
        assert_eq!(a.compare(&c), IdentityOrdering::Different);
    }
}
