//! envsync Stress Driver
//!
//! Runs concurrent transactions through a SyncEnv while a second handle on
//! the same store keeps growing the memory map, as a cooperating process
//! would.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use envsync::{
    handler_fn, Config, EnvFlags, Environment, Handler, MapResizedHandler, MemoryEnv, SyncEnv,
    SyncError,
};
use tracing_subscriber::{fmt, EnvFilter};

/// envsync stress driver
#[derive(Parser, Debug)]
#[command(name = "envsync-stress")]
#[command(about = "Concurrent transactions against an environment resized by a peer")]
#[command(version)]
struct Args {
    /// Data directory (empty keeps everything in memory)
    #[arg(short, long, default_value = "")]
    data_dir: String,

    /// Worker threads
    #[arg(short, long, default_value = "8")]
    threads: usize,

    /// Updates per worker
    #[arg(short, long, default_value = "1000")]
    iterations: u64,

    /// Milliseconds between peer resizes (0 disables the peer)
    #[arg(short, long, default_value = "5")]
    resize_every_ms: u64,

    /// Disable engine locking
    #[arg(long)]
    no_lock: bool,

    /// Initial map size in KB
    #[arg(short = 'm', long, default_value = "1024")]
    map_kb: u64,

    /// Resize adoptions allowed per transaction
    #[arg(long, default_value = "8")]
    max_resize_retries: u32,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,envsync=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("envsync stress v{}", envsync::VERSION);
    tracing::info!(threads = args.threads, iterations = args.iterations, no_lock = args.no_lock);

    if let Err(e) = run(&args) {
        tracing::error!("Stress run failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> envsync::Result<()> {
    let mut open_flags = EnvFlags::NO_SYNC;
    if args.no_lock {
        open_flags |= EnvFlags::NO_LOCK;
    }

    let config = Config::builder()
        .map_size(args.map_kb * 1024)
        .max_resize_retries(args.max_resize_retries)
        .open_flags(open_flags)
        .build();

    let resizes_seen = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&resizes_seen);
    let observe = handler_fn(move |bag, result: envsync::Result<()>| {
        if matches!(result, Err(SyncError::MapResized)) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        (bag, result)
    });

    let handlers: Vec<Arc<dyn Handler<MemoryEnv>>> = vec![
        Arc::new(observe),
        Arc::new(MapResizedHandler::from_config(&config)),
    ];
    let env = SyncEnv::new(None, handlers)?;
    env.open_with_config(&args.data_dir, &config)?;

    // SAFETY: attach only reads the shared store; it does not resize, change
    // flags or run transactions on the wrapped handle.
    let peer = unsafe { env.raw() }.attach()?;

    let done = AtomicBool::new(false);
    let peer_resizes = AtomicU64::new(0);
    let app_resizes = AtomicU64::new(0);
    let started = Instant::now();

    thread::scope(|s| -> envsync::Result<()> {
        if args.resize_every_ms > 0 {
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(args.resize_every_ms));
                    let grown = peer.info().recorded_map_size + 4096;
                    if let Err(e) = peer.set_map_size(grown) {
                        tracing::warn!("Peer resize failed: {}", e);
                        continue;
                    }
                    peer_resizes.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        let workers: Vec<_> = (0..args.threads)
            .map(|id| {
                let env = &env;
                let app_resizes = &app_resizes;
                s.spawn(move || worker(env, id, args.iterations, app_resizes))
            })
            .collect();

        let mut outcome = Ok(());
        for worker in workers {
            let result = worker
                .join()
                .unwrap_or_else(|_| Err(SyncError::Config("worker panicked".to_string())));
            if outcome.is_ok() {
                outcome = result;
            }
        }
        done.store(true, Ordering::Relaxed);
        outcome
    })?;

    let mut total = 0u64;
    env.view(|txn| {
        total = txn
            .iter()
            .filter(|(key, _)| key.starts_with(b"counter/"))
            .map(|(_, value)| decode_counter(value))
            .sum();
        Ok(())
    })?;

    let expected = args.threads as u64 * args.iterations;
    tracing::info!(
        elapsed = ?started.elapsed(),
        total,
        expected,
        peer_resizes = peer_resizes.load(Ordering::Relaxed),
        resizes_seen = resizes_seen.load(Ordering::Relaxed),
        app_resizes = app_resizes.load(Ordering::Relaxed),
        "Stress run complete"
    );

    if total != expected {
        return Err(SyncError::Config(format!(
            "lost updates: counted {} of {}",
            total, expected
        )));
    }
    Ok(())
}

/// Increment this worker's counter `iterations` times, growing the map
/// when it fills up
fn worker(
    env: &SyncEnv<MemoryEnv>,
    id: usize,
    iterations: u64,
    app_resizes: &AtomicU64,
) -> envsync::Result<()> {
    let key = format!("counter/{:04}", id).into_bytes();

    for _ in 0..iterations {
        loop {
            let result = env.update(|txn| {
                let next = txn.get(&key).map(decode_counter).unwrap_or(0) + 1;
                txn.put(&key, &next.to_be_bytes())
            });

            match result {
                Ok(()) => break,
                Err(SyncError::MapFull) => {
                    // SAFETY: info only reads sizes.
                    let current = unsafe { env.raw() }.info().map_size;
                    env.set_map_size(current * 2)?;
                    app_resizes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

fn decode_counter(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
    u64::from_be_bytes(buf)
}
