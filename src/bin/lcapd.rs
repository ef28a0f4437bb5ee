// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Daemon entry point: parse flags, load the config file, spin up the
// broker and one reader thread per configured MDT device (plus a worker
// pool if `workers N` is set), and run until a signal tells us to stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use lcapd::config::{self, Cli, Configuration};
use lcapd::lb_ring::Ring;
use lcapd::signals::SignalState;
use lcapd::source::{ChangeRecord, MemorySource};
use lcapd::worker::{AckTable, WorkerContext};
use lcapd::{broker, reader, worker};

/// Number of slow-joiner milliseconds to wait after spawning readers so
/// their initial SIGNAL isn't lost on a brand new broker socket.
const SLOW_JOINER_PAUSE_MS: u64 = 200;

fn main() {
    let cli = Cli::parse();

    let cfg = match Configuration::from_cli(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("lcapd: {e}");
            std::process::exit(1);
        }
    };

    init_logging(&cfg);

    if let Err(e) = run(cfg) {
        log::error!("lcapd: {e}");
        std::process::exit(1);
    }
}

fn init_logging(cfg: &Configuration) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config::verbosity_to_level(cfg.verbosity));
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    builder.init();
}

/// Every changelog source this daemon pulls from is keyed by device name.
/// Until a real filesystem-native source is wired in, each device reads
/// from an empty in-memory source so the rest of the pipeline (broker,
/// readers, client protocol) runs end to end.
fn build_sources(devices: &[String]) -> std::collections::HashMap<String, MemorySource> {
    devices
        .iter()
        .map(|d| (d.clone(), MemorySource::from_indices(std::iter::empty())))
        .collect()
}

fn run(cfg: Configuration) -> Result<(), lcapd::LcapError> {
    log::info!("starting lcapd (config: {})", cfg.config_path.display());

    let signals = SignalState::install()?;
    let zctx = zmq::Context::new();

    // In per-device mode the broker owns the public endpoint directly. In
    // worker-pool mode `spawn_worker_pool` binds it instead and proxies to
    // the REP worker pool, so the two must never run at once.
    let broker_handle = if cfg.worker_count.is_none() {
        let broker_terminate = signals.terminate.clone();
        let broker_ctx = zctx.clone();
        Some(thread::spawn(move || {
            if let Err(e) = broker::run(&broker_ctx, config::BROKER_BIND_ENDPOINT, broker_terminate) {
                log::error!("broker stopped with error: {e}");
            }
        }))
    } else {
        None
    };

    thread::sleep(Duration::from_millis(SLOW_JOINER_PAUSE_MS));

    let sources = build_sources(&cfg.mdt);

    let reader_handles = if let Some(worker_count) = cfg.worker_count {
        spawn_worker_pool(&zctx, &cfg, sources, worker_count, signals.terminate.clone())?
    } else {
        spawn_per_device_readers(&zctx, &cfg, sources, signals.terminate.clone(), signals.dump_generation.clone())
    };

    while !signals.terminate.load(Ordering::Relaxed) {
        if signals.take_reload() {
            log::info!("reload requested but not yet implemented; ignoring");
        }
        thread::sleep(Duration::from_millis(200));
    }

    for h in reader_handles {
        let _ = h.join();
    }
    if let Some(h) = broker_handle {
        let _ = h.join();
    }

    Ok(())
}

fn spawn_per_device_readers(
    zctx: &zmq::Context,
    cfg: &Configuration,
    mut sources: std::collections::HashMap<String, MemorySource>,
    terminate: Arc<AtomicBool>,
    dump_generation: Arc<std::sync::atomic::AtomicU64>,
) -> Vec<thread::JoinHandle<()>> {
    cfg.mdt
        .iter()
        .map(|mdt| {
            let ctx = zctx.clone();
            let mdt = mdt.clone();
            let batch_size = cfg.rec_batch_count as usize;
            let max_buckets = cfg.max_buckets;
            let oneshot = cfg.oneshot;
            let terminate = terminate.clone();
            let dump_generation = dump_generation.clone();
            let source = sources.remove(&mdt).expect("source configured for every device");
            thread::spawn(move || {
                let rcfg = reader::ReaderConfig { mdt, batch_size, max_buckets, oneshot };
                reader::run(&ctx, config::BROKER_CONNECT_ENDPOINT, rcfg, &source, terminate, dump_generation);
            })
        })
        .collect()
}

fn spawn_worker_pool(
    zctx: &zmq::Context,
    cfg: &Configuration,
    mut sources: std::collections::HashMap<String, MemorySource>,
    worker_count: u32,
    terminate: Arc<AtomicBool>,
) -> Result<Vec<thread::JoinHandle<()>>, lcapd::LcapError> {
    let frontend = zctx.socket(zmq::ROUTER).map_err(|e| lcapd::LcapError::Transport(e.to_string()))?;
    frontend
        .bind(config::BROKER_BIND_ENDPOINT)
        .map_err(|e| lcapd::LcapError::Transport(e.to_string()))?;

    let proxy_ctx = zctx.clone();
    thread::spawn(move || {
        if let Err(e) = worker::run_proxy(&proxy_ctx, frontend) {
            log::error!("worker proxy stopped with error: {e}");
        }
    });

    let ring: Ring<ChangeRecord> = Ring::with_capacity(lcapd::lb_ring::DEFAULT_CAPACITY);
    let acks = Arc::new(AckTable::new(&cfg.mdt));

    let mut handles = Vec::new();

    for mdt in &cfg.mdt {
        let producer = ring.producer();
        let mdt = mdt.clone();
        let batch_size = cfg.rec_batch_count as usize;
        let terminate = terminate.clone();
        let source = sources.remove(&mdt).expect("source configured for every device");
        handles.push(thread::spawn(move || {
            reader::run_collector(mdt, batch_size, &source, producer, terminate);
        }));
    }

    for _ in 0..worker_count {
        let ctx = zctx.clone();
        let wctx = Arc::new(WorkerContext {
            devices: cfg.mdt.clone(),
            batch_size: cfg.rec_batch_count as usize,
            ring: ring.consumer(),
            acks: acks.clone(),
        });
        let terminate = terminate.clone();
        handles.push(thread::spawn(move || {
            if let Err(e) = worker::run(&ctx, wctx, terminate) {
                log::error!("worker stopped with error: {e}");
            }
        }));
    }

    Ok(handles)
}
