use std::sync::Arc;

use symra::{Context, Coordinator, SymraConfig};

/// Run `f` on `npes` thread-PEs over an in-process coordinator, tearing
/// everything down collectively. Returns per-PE results ordered by rank.
pub fn run_pes<F, T>(npes: u32, config: SymraConfig, f: F) -> Vec<T>
where
    F: Fn(&Context) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let hub = Coordinator::new(npes);
    let f = Arc::new(f);
    let handles: Vec<_> = (0..npes)
        .map(|pe| {
            let boot = hub.attach(pe).unwrap();
            let config = config.clone();
            let f = Arc::clone(&f);
            std::thread::spawn(move || {
                let ctx = Context::init(config, Box::new(boot)).unwrap();
                let out = f(&ctx);
                ctx.finalize().unwrap();
                out
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

/// Default config shrunk for tests: small heap, shallow queues so
/// wraparound paths are hit quickly.
pub fn test_config() -> SymraConfig {
    SymraConfig {
        heap_size: 8 * 1024 * 1024,
        max_teams: 8,
        qp_depth: 16,
        backpressure_threshold: 4,
        ..Default::default()
    }
}
