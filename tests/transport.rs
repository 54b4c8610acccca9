//! Queue-pair engine behavior through the public surface: wraparound
//! FIFO order, backpressure bounds, quiet semantics.

mod common;

use std::sync::Arc;

use common::{run_pes, test_config};
use symra::{
    Context, LoopbackNic, NicBackend, Pe, QpEndpoint, RmaOpcode, SymraConfig, TricklingNic,
};

#[test]
fn test_wraparound_fifo_through_context() {
    // Queue depth 16, 3x depth one-word puts to the same peer: the
    // receiver's cells must land in posted order with no ownership-bit
    // confusion. Order is checked by making each put overwrite the same
    // word; after quiet the last posted value must be visible.
    let config = SymraConfig {
        force_rdma: true,
        ..test_config()
    };
    run_pes(2, config, |ctx: &Context| {
        let word = ctx.alloc(8, 8).unwrap();
        let world = ctx.world();
        let depth = ctx.config().qp_depth as u64;
        if ctx.mype() == 0 {
            for value in 1..=3 * depth {
                ctx.put_u64(word, value, 1).unwrap();
            }
            ctx.quiet(1).unwrap();
        }
        ctx.barrier(&world).unwrap();
        if ctx.mype() == 1 {
            assert_eq!(ctx.get_u64(word, 1).unwrap(), 3 * depth);
        }
        ctx.barrier(&world).unwrap();
    });
}

#[test]
fn test_backpressure_with_slow_completions() {
    // Trickling backend: nothing completes at doorbell time, so the
    // engine has to drain completions itself to make ring room. The
    // per-post outstanding bound is asserted in the engine unit tests;
    // this drives the same path end to end through a context.
    let depth = 16u32;
    let config = SymraConfig {
        qp_depth: depth,
        backpressure_threshold: 4,
        force_rdma: true,
        ..test_config()
    };

    let hub = symra::Coordinator::new(2);
    let handles: Vec<_> = (0..2u32)
        .map(|pe| {
            let boot = hub.attach(pe).unwrap();
            let config = config.clone();
            std::thread::spawn(move || {
                let ctx = Context::init_with_nic(config, Box::new(boot), |_: Pe| {
                    Arc::new(TricklingNic::new()) as Arc<dyn NicBackend>
                })
                .unwrap();
                let slab = ctx.alloc(8 * 128, 8).unwrap();
                let world = ctx.world();
                if ctx.mype() == 0 {
                    for i in 0..128u64 {
                        ctx.put_u64(symra::HeapOffset(slab.as_usize() + 8 * i as usize), i, 1)
                            .unwrap();
                    }
                    ctx.quiet(1).unwrap();
                }
                ctx.barrier(&world).unwrap();
                if ctx.mype() == 1 {
                    for i in 0..128u64 {
                        assert_eq!(
                            ctx.get_u64(symra::HeapOffset(slab.as_usize() + 8 * i as usize), 1)
                                .unwrap(),
                            i
                        );
                    }
                }
                ctx.barrier(&world).unwrap();
                ctx.finalize().unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn test_endpoint_exchange_shapes() {
    let ep = QpEndpoint {
        qp_num: 3,
        heap_base: 0x4000,
        heap_rkey: 0x11,
    };
    let bytes = ep.to_bytes();
    assert_eq!(bytes.len(), symra::transport::rdma::ENDPOINT_SIZE);
    assert_eq!(QpEndpoint::from_bytes(&bytes).unwrap(), ep);
}

#[test]
fn test_loopback_post_quiet_roundtrip() {
    // Direct engine use without a context: post against raw process
    // memory and observe completion through quiet.
    use symra::transport::rdma::PreparedQueuePair;
    let nic = Arc::new(LoopbackNic::new());
    let a = PreparedQueuePair::new(1, 1, 8, 2, 0, 0, nic);
    let qp = a.complete(QpEndpoint {
        qp_num: 2,
        heap_base: 0,
        heap_rkey: 0,
    });
    let src = [0xabu8; 24];
    let mut dst = [0u8; 24];
    qp.post(
        RmaOpcode::Write,
        src.as_ptr() as u64,
        dst.as_mut_ptr() as u64,
        24,
    )
    .unwrap();
    qp.quiet().unwrap();
    assert_eq!(dst, src);
    assert_eq!(qp.outstanding(), 0);
}
