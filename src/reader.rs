// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// One reader thread per MDT device. A reader owns a `ChangelogSource`
// handle and a `RecordCache`, and alternates between pulling records out
// of the source (enqueue phase) and answering consumer RPCs relayed by
// the broker (serve phase). The two phases are kept apart because the
// underlying change-log interface can block for a while on `recv`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cache::{Bucket, RecordCache};
use crate::error::LcapError;
use crate::source::{ChangelogSource, ChangelogSourceHandle};
use crate::transport::{self, Request, RoutingIdentity};
use crate::wire::RpcMessage;

/// Seconds to wait between retries once a source handle reaches EOF.
const EOF_RETRY_DELAY_MS: i64 = 1000;
const SERVE_POLL_MS: i64 = 50;

/// Per-consumer registration state, created on START and torn down on FINI.
struct ConsumerState {
    start: u64,
    bucket: Option<Bucket>,
}

/// Statistics accumulated over the lifetime of a reader thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReaderStats {
    pub records_read: u64,
    pub records_sent: u64,
}

impl ReaderStats {
    fn rate_per_sec(&self, since: Instant) -> f64 {
        let millis = since.elapsed().as_millis().max(1) as f64;
        self.records_read as f64 / millis * 1000.0
    }
}

pub struct ReaderConfig {
    pub mdt: String,
    pub batch_size: usize,
    pub max_buckets: usize,
    pub oneshot: bool,
}

/// Runtime state for one reader thread. Public only for tests that want to
/// drive `enqueue_phase`/`handle_request` without going through `run`.
pub struct ReaderState {
    cfg: ReaderConfig,
    cache: RecordCache,
    next_index: u64,
    handle: Option<Box<dyn ChangelogSourceHandle>>,
    peers: HashMap<RoutingIdentity, ConsumerState>,
    stats: ReaderStats,
    started_at: Instant,
}

impl ReaderState {
    pub fn new(cfg: ReaderConfig) -> Self {
        let batch_size = cfg.batch_size;
        let max_buckets = cfg.max_buckets;
        ReaderState {
            cfg,
            cache: RecordCache::new(batch_size, max_buckets),
            next_index: 0,
            handle: None,
            peers: HashMap::new(),
            stats: ReaderStats::default(),
            started_at: Instant::now(),
        }
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    fn is_full(&self) -> bool {
        self.cache.is_full()
    }

    /// Pull records from the source until the cache is full, the batch
    /// quota for this call is exhausted, or the source yields
    /// `EndOfStream`/`TryAgain`. On those two errors the handle is closed
    /// so the next call reopens at the updated low-watermark. Returns
    /// `Ok(true)` if the source is still open at the end of the call (used
    /// to pick the serve-phase poll timeout).
    fn enqueue_phase(&mut self, source: &dyn ChangelogSource) -> Result<bool, LcapError> {
        if self.is_full() {
            return Ok(self.handle.is_some());
        }

        if self.handle.is_none() {
            self.handle = Some(source.open(self.next_index)?);
        }

        let mut pulled = 0usize;
        loop {
            if self.is_full() || pulled >= self.cfg.batch_size {
                break;
            }
            let handle = self.handle.as_mut().unwrap();
            match handle.recv() {
                Ok(rec) => {
                    if rec.index < self.next_index {
                        continue;
                    }
                    self.next_index = rec.index + 1;
                    self.stats.records_read += 1;
                    pulled += 1;
                    self.cache.push(rec);
                }
                Err(LcapError::EndOfStream) | Err(LcapError::TryAgain) => {
                    self.handle.as_mut().unwrap().close();
                    self.handle = None;
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(self.handle.is_some())
    }

    fn handle_start(&mut self, req: &Request, msg: &RpcMessage) -> Result<(), LcapError> {
        let (start, flags) = match msg {
            RpcMessage::Start { start, flags, .. } => (*start, *flags),
            _ => unreachable!(),
        };
        let _ = flags;
        let forward = req
            .forward
            .clone()
            .ok_or_else(|| LcapError::Protocol("START with no client identity".into()))?;

        if self.peers.contains_key(&forward) {
            return Err(LcapError::AlreadyExists("client already registered".into()));
        }
        self.peers.insert(forward, ConsumerState { start, bucket: None });
        Ok(())
    }

    fn handle_dequeue(&mut self, req: &Request, sock: &zmq::Socket) -> Result<(), LcapError> {
        let forward = req
            .forward
            .clone()
            .ok_or_else(|| LcapError::Protocol("DEQUEUE with no client identity".into()))?;
        let consumer = self
            .peers
            .get_mut(&forward)
            .ok_or_else(|| LcapError::Protocol("DEQUEUE from unregistered client".into()))?;

        if consumer.bucket.is_some() {
            return Err(LcapError::Protocol(
                "client did not acknowledge previous bucket".into(),
            ));
        }

        let bucket = match self.cache.pop() {
            Some(b) => b,
            None => return Err(LcapError::EndOfStream),
        };

        let count = bucket.rec_count() as u32;
        let mut records = Vec::with_capacity(bucket.byte_size);
        for rec in &bucket.records {
            records.extend_from_slice(&rec.encode());
        }
        self.stats.records_sent += count as u64;
        consumer.bucket = Some(bucket);

        let body = RpcMessage::Enqueue { records, count }.encode();
        transport::peer_rpc_send(sock, None, &forward, &body)
    }

    fn handle_clear(&mut self, req: &Request) -> Result<(), LcapError> {
        let forward = req
            .forward
            .clone()
            .ok_or_else(|| LcapError::Protocol("CLEAR with no client identity".into()))?;
        let consumer = self
            .peers
            .get_mut(&forward)
            .ok_or_else(|| LcapError::Protocol("CLEAR from unregistered client".into()))?;

        if let Some(bucket) = consumer.bucket.take() {
            if let Some(handle) = self.handle.as_mut() {
                for rec in &bucket.records {
                    handle.free(rec);
                }
            }
        }
        Ok(())
    }

    fn handle_fini(&mut self, req: &Request) -> Result<(), LcapError> {
        let forward = req
            .forward
            .clone()
            .ok_or_else(|| LcapError::Protocol("FINI with no client identity".into()))?;
        self.peers
            .remove(&forward)
            .ok_or_else(|| LcapError::Protocol("FINI from unregistered client".into()))?;
        Ok(())
    }

    /// Dispatch one already-decoded request. ENQUEUE/ACK/SIGNAL are not
    /// legal on the reader's own socket and are always a protocol error.
    fn dispatch(&mut self, sock: &zmq::Socket, req: &Request, msg: &RpcMessage) -> Result<(), LcapError> {
        match msg {
            RpcMessage::Start { .. } => self.handle_start(req, msg),
            RpcMessage::Dequeue => self.handle_dequeue(req, sock),
            RpcMessage::Clear { .. } => self.handle_clear(req),
            RpcMessage::Fini => self.handle_fini(req),
            RpcMessage::Enqueue { .. } | RpcMessage::Ack { .. } | RpcMessage::Signal { .. } => {
                Err(LcapError::Protocol(format!(
                    "unexpected {} on reader socket",
                    msg.op_type().as_str()
                )))
            }
        }
    }

    fn handle_one(&mut self, sock: &zmq::Socket, req: Request) {
        let forward = req.forward.clone();
        let outcome = match RpcMessage::decode(&req.body) {
            Ok(msg) => {
                let is_dequeue = matches!(msg, RpcMessage::Dequeue);
                let result = self.dispatch(sock, &req, &msg);
                // DEQUEUE replies with ENQUEUE on success; every other op
                // (and DEQUEUE's own errors) reply with a plain ACK.
                if is_dequeue && result.is_ok() {
                    None
                } else {
                    Some(result)
                }
            }
            Err(e) => Some(Err(e)),
        };

        if let Some(result) = outcome {
            if let Some(forward) = forward {
                let retcode = match result {
                    Ok(()) => 0,
                    Err(e) => e.ack_code(),
                };
                if let Err(e) = transport::ack_retcode(sock, None, &forward, retcode) {
                    log::warn!("reader[{}]: cannot ACK: {e}", self.cfg.mdt);
                }
            }
        }
    }

    fn serve_phase(&mut self, sock: &zmq::Socket) -> Result<(), LcapError> {
        let timeout = if self.handle.is_some() { SERVE_POLL_MS } else { EOF_RETRY_DELAY_MS };
        let mut items = [sock.as_poll_item(zmq::POLLIN)];
        let n = zmq::poll(&mut items, timeout).map_err(|e| LcapError::Transport(e.to_string()))?;
        if n <= 0 {
            return Ok(());
        }
        if !items[0].is_readable() {
            return Ok(());
        }

        let mut processed = 0usize;
        loop {
            match transport::recv_one_request(sock, true) {
                Ok(Some(req)) => {
                    self.handle_one(sock, req);
                    processed += 1;
                }
                Ok(None) => break,
                Err(e) => log::warn!("reader[{}]: dropping malformed RPC: {e}", self.cfg.mdt),
            }
        }
        if processed > 0 {
            log::debug!("reader[{}]: processed {processed} client RPCs", self.cfg.mdt);
        }
        Ok(())
    }

    /// One-line stats summary, logged at shutdown and on every SIGUSR1.
    fn log_stats(&self) {
        log::info!(
            "reader[{}]: {} records read, {} sent, {} consumers registered, up {:.0}s ({:.0} rec/s)",
            self.cfg.mdt,
            self.stats.records_read,
            self.stats.records_sent,
            self.peers.len(),
            self.started_at.elapsed().as_secs_f64(),
            self.stats.rate_per_sec(self.started_at),
        );
    }
}

/// Connect a fresh DEALER socket identified by `mdt`, matching the
/// broker's expectation that a reader's routing identity equals its
/// device name.
fn connect_reader_socket(ctx: &zmq::Context, broker_endpoint: &str, mdt: &str) -> Result<zmq::Socket, LcapError> {
    let sock = ctx
        .socket(zmq::DEALER)
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.set_identity(mdt.as_bytes())
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.connect(broker_endpoint)
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    Ok(sock)
}

fn signal(sock: &zmq::Socket, mdt: &str, ret: u64) -> Result<(), LcapError> {
    let body = RpcMessage::Signal { ret, mdtname: mdt.to_owned() }.encode();
    sock.send(&b""[..], zmq::SNDMORE)
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.send(mdt.as_bytes(), zmq::SNDMORE)
        .map_err(|e| LcapError::Transport(e.to_string()))?;
    sock.send(body, 0).map_err(|e| LcapError::Transport(e.to_string()))?;
    Ok(())
}

/// Load-balancer mode collector: pulls records for one MDT and feeds them
/// straight into the shared ring instead of a per-reader cache. There is
/// no consumer bookkeeping here; worker threads hand records out without
/// regard to which device produced them.
pub fn run_collector(
    mdt: String,
    batch_size: usize,
    source: &dyn ChangelogSource,
    producer: crate::lb_ring::ProducerHandle<crate::source::ChangeRecord>,
    terminate: Arc<AtomicBool>,
) {
    let mut handle: Option<Box<dyn ChangelogSourceHandle>> = None;
    let mut next_index = 0u64;
    let mut read_count = 0u64;
    let started_at = Instant::now();

    while !terminate.load(Ordering::Relaxed) {
        if handle.is_none() {
            handle = match source.open(next_index) {
                Ok(h) => Some(h),
                Err(e) => {
                    log::error!("collector[{mdt}]: cannot open source: {e}");
                    std::thread::sleep(std::time::Duration::from_millis(EOF_RETRY_DELAY_MS as u64));
                    continue;
                }
            };
        }

        let mut pulled = 0usize;
        while pulled < batch_size {
            let rec = match handle.as_mut().unwrap().recv() {
                Ok(rec) => rec,
                Err(LcapError::EndOfStream) | Err(LcapError::TryAgain) => {
                    handle.as_mut().unwrap().close();
                    handle = None;
                    break;
                }
                Err(e) => {
                    log::error!("collector[{mdt}]: source error: {e}");
                    handle.as_mut().unwrap().close();
                    handle = None;
                    break;
                }
            };
            if rec.index < next_index {
                continue;
            }
            next_index = rec.index + 1;
            read_count += 1;
            pulled += 1;

            let mut item = rec;
            while let Err(back) = producer.push(item) {
                if terminate.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(5));
                item = back;
            }
        }

        if handle.is_none() {
            std::thread::sleep(std::time::Duration::from_millis(EOF_RETRY_DELAY_MS as u64));
        }
    }

    let millis = started_at.elapsed().as_millis().max(1) as f64;
    log::info!(
        "{read_count} records collected from {mdt} ({:.0}/s)",
        read_count as f64 / millis * 1000.0,
    );
}

/// Reader thread entry point. Runs until `terminate` is set or a fatal
/// error occurs; either way the broker is signalled one last time before
/// the socket is torn down. `dump_generation` is the process-wide SIGUSR1
/// counter (see [`crate::signals::SignalState`]); every time it changes
/// this reader logs its own stats snapshot.
pub fn run(
    ctx: &zmq::Context,
    broker_endpoint: &str,
    cfg: ReaderConfig,
    source: &dyn ChangelogSource,
    terminate: Arc<AtomicBool>,
    dump_generation: Arc<AtomicU64>,
) {
    let mdt = cfg.mdt.clone();
    let oneshot = cfg.oneshot;
    let mut state = ReaderState::new(cfg);
    let mut last_dump_seen = dump_generation.load(Ordering::Relaxed);

    let sock = match connect_reader_socket(ctx, broker_endpoint, &mdt) {
        Ok(s) => s,
        Err(e) => {
            log::error!("reader[{mdt}]: cannot start: {e}");
            return;
        }
    };

    if let Err(e) = signal(&sock, &mdt, 0) {
        log::error!("reader[{mdt}]: cannot signal readiness: {e}");
        return;
    }

    let mut exit_err: Option<LcapError> = None;
    while !terminate.load(Ordering::Relaxed) {
        match state.enqueue_phase(source) {
            Ok(open) => {
                if !open && oneshot && state.cache.total_cached() == 0 {
                    log::info!("reader[{mdt}]: source exhausted, exiting (oneshot)");
                    break;
                }
            }
            Err(e) => {
                exit_err = Some(e);
                break;
            }
        }

        if let Err(e) = state.serve_phase(&sock) {
            exit_err = Some(e);
            break;
        }

        let current_dump = dump_generation.load(Ordering::Relaxed);
        if current_dump != last_dump_seen {
            last_dump_seen = current_dump;
            state.log_stats();
        }
    }

    if let Some(ref e) = exit_err {
        log::error!("reader[{mdt}]: stopping: {e}");
        let _ = signal(&sock, &mdt, e.ack_code() as u64);
    }

    state.log_stats();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn cfg(mdt: &str) -> ReaderConfig {
        ReaderConfig { mdt: mdt.to_owned(), batch_size: 2, max_buckets: 4, oneshot: false }
    }

    #[test]
    fn enqueue_phase_fills_cache_and_closes_on_eof() {
        let source = MemorySource::from_indices(1..=3);
        let mut state = ReaderState::new(cfg("mdt0"));
        let open = state.enqueue_phase(&source).unwrap();
        assert!(!open, "source should have been closed at EOF");
        assert_eq!(state.cache.total_cached(), 3);
        assert_eq!(state.stats().records_read, 3);
    }

    #[test]
    fn start_then_duplicate_start_is_already_exists() {
        let mut state = ReaderState::new(cfg("mdt0"));
        let consumer = RoutingIdentity::from("c0");
        let req = Request { remote: None, forward: Some(consumer.clone()), body: Vec::new() };
        let msg = RpcMessage::Start { flags: 0, start: 0, mdtname: "mdt0".into() };
        state.handle_start(&req, &msg).unwrap();
        let err = state.handle_start(&req, &msg).unwrap_err();
        assert!(matches!(err, LcapError::AlreadyExists(_)));
    }

    #[test]
    fn clear_without_start_is_protocol_error() {
        let mut state = ReaderState::new(cfg("mdt0"));
        let consumer = RoutingIdentity::from("c0");
        let req = Request { remote: None, forward: Some(consumer), body: Vec::new() };
        let err = state.handle_clear(&req).unwrap_err();
        assert!(matches!(err, LcapError::Protocol(_)));
    }

    #[test]
    fn fini_removes_registration() {
        let mut state = ReaderState::new(cfg("mdt0"));
        let consumer = RoutingIdentity::from("c0");
        let req = Request { remote: None, forward: Some(consumer.clone()), body: Vec::new() };
        let msg = RpcMessage::Start { flags: 0, start: 0, mdtname: "mdt0".into() };
        state.handle_start(&req, &msg).unwrap();
        state.handle_fini(&req).unwrap();
        assert!(state.handle_fini(&req).is_err());
    }
}
