// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end tests driving the broker and reader threads over real zmq
// sockets (inproc transport, one context per test to keep them isolated).

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lcapd::broker;
use lcapd::client::{ClientBackend, ProxyClient};
use lcapd::error::LcapError;
use lcapd::reader::{self, ReaderConfig};
use lcapd::source::{ChangeRecord, ChangelogSource, ChangelogSourceHandle, MemorySource};
use lcapd::wire::RpcMessage;

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_endpoint() -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("inproc://lcap-daemon-test-{n}")
}

/// Spin up a broker plus a single reader thread for `mdt` over `source`,
/// both bound to a fresh inproc endpoint. Returns the shared context (for
/// opening additional client sockets), the endpoint, the termination
/// flag, and the thread handles.
fn spin_up(
    mdt: &str,
    source: Box<dyn ChangelogSource>,
    batch_size: usize,
    oneshot: bool,
) -> (zmq::Context, String, Arc<AtomicBool>, thread::JoinHandle<()>, thread::JoinHandle<()>) {
    let ctx = zmq::Context::new();
    let endpoint = unique_endpoint();
    let terminate = Arc::new(AtomicBool::new(false));

    let broker_ctx = ctx.clone();
    let broker_endpoint = endpoint.clone();
    let broker_terminate = terminate.clone();
    let broker_handle = thread::spawn(move || {
        broker::run(&broker_ctx, &broker_endpoint, broker_terminate).unwrap();
    });

    thread::sleep(Duration::from_millis(100));

    let reader_ctx = ctx.clone();
    let reader_endpoint = endpoint.clone();
    let reader_terminate = terminate.clone();
    let mdt_owned = mdt.to_owned();
    let dump_generation = Arc::new(AtomicU64::new(0));
    let reader_handle = thread::spawn(move || {
        let cfg = ReaderConfig { mdt: mdt_owned, batch_size, max_buckets: 8, oneshot };
        reader::run(&reader_ctx, &reader_endpoint, cfg, source.as_ref(), reader_terminate, dump_generation);
    });

    thread::sleep(Duration::from_millis(150));

    (ctx, endpoint, terminate, broker_handle, reader_handle)
}

fn shutdown(terminate: Arc<AtomicBool>, handles: Vec<thread::JoinHandle<()>>) {
    terminate.store(true, Ordering::Relaxed);
    for h in handles {
        let _ = h.join();
    }
}

#[test]
fn dequeue_chunks_records_by_batch_size_then_reports_eof() {
    let source = Box::new(MemorySource::from_indices(1..=5));
    let (ctx, endpoint, terminate, bh, rh) = spin_up("mdt0", source, 2, false);

    let mut client = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0).unwrap();

    assert_eq!(client.recv().unwrap().index, 1);
    assert_eq!(client.recv().unwrap().index, 2);
    assert_eq!(client.recv().unwrap().index, 3);
    assert_eq!(client.recv().unwrap().index, 4);
    assert_eq!(client.recv().unwrap().index, 5);
    assert!(matches!(client.recv().unwrap_err(), LcapError::EndOfStream));

    shutdown(terminate, vec![bh, rh]);
}

#[test]
fn second_consumer_can_dequeue_while_first_holds_an_outstanding_bucket() {
    let source = Box::new(MemorySource::from_indices(1..=4));
    let (ctx, endpoint, terminate, bh, rh) = spin_up("mdt0", source, 2, false);

    let mut a = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0).unwrap();
    assert_eq!(a.recv().unwrap().index, 1); // pulls bucket #1, holds it outstanding

    let mut b = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0).unwrap();
    assert_eq!(b.recv().unwrap().index, 3); // bucket #2, unaffected by A's hold

    shutdown(terminate, vec![bh, rh]);
}

#[test]
fn malformed_rpc_is_answered_with_protocol_error() {
    let source = Box::new(MemorySource::from_indices(std::iter::empty()));
    let (ctx, endpoint, terminate, bh, rh) = spin_up("mdt0", source, 4, false);

    let sock = ctx.socket(zmq::REQ).unwrap();
    sock.connect(&endpoint).unwrap();
    sock.send(b"mdt0".as_slice(), zmq::SNDMORE).unwrap();
    sock.send(&[1, 2, 3][..], 0).unwrap(); // too short to even hold a header

    let reply = sock.recv_bytes(0).unwrap();
    let ack = RpcMessage::decode(&reply).unwrap();
    assert!(matches!(ack, RpcMessage::Ack { retcode } if retcode == LcapError::Protocol(String::new()).ack_code()));

    shutdown(terminate, vec![bh, rh]);
}

struct AlwaysFailsSource;

impl ChangelogSource for AlwaysFailsSource {
    fn open(&self, _start_index: u64) -> Result<Box<dyn ChangelogSourceHandle>, LcapError> {
        Err(LcapError::Source("simulated backing store failure".into()))
    }
}

#[test]
fn reader_that_fails_after_startup_is_deregistered_from_the_broker() {
    let source = Box::new(AlwaysFailsSource);
    let (ctx, endpoint, terminate, bh, rh) = spin_up("mdt0", source, 4, false);

    // Give the reader time to signal readiness and then fail on its first
    // enqueue attempt.
    thread::sleep(Duration::from_millis(300));

    let err = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0).unwrap_err();
    assert!(matches!(err, LcapError::NotAvailable(_)));

    shutdown(terminate, vec![bh, rh]);
}

#[test]
fn oneshot_reader_exits_once_the_source_is_exhausted() {
    let source = Box::new(MemorySource::from_indices(1..=3));
    let (_ctx, _endpoint, terminate, bh, rh) = spin_up("mdt0", source, 10, true);

    thread::sleep(Duration::from_millis(300));
    assert!(rh.is_finished(), "oneshot reader should have exited after EOF");

    terminate.store(true, Ordering::Relaxed);
    let _ = rh.join();
    let _ = bh.join();
}

#[test]
fn fini_releases_registration_so_a_fresh_start_succeeds() {
    let source = Box::new(MemorySource::from_indices(1..=3));
    let (ctx, endpoint, terminate, bh, rh) = spin_up("mdt0", source, 2, false);

    let mut client = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0).unwrap();
    client.fini().unwrap();

    // Same identity (same REQ socket's connection), fresh registration.
    let client2 = ProxyClient::start(&ctx, &endpoint, "mdt0", 0, 0);
    assert!(client2.is_ok());

    shutdown(terminate, vec![bh, rh]);
}

#[allow(unused)]
fn suppress_changerecord_unused(_r: ChangeRecord) {}
