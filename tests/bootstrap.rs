//! Socket bootstrap over localhost: rendezvous, collectives, magic
//! filtering, and full context bring-up.

use std::net::TcpListener;
use std::time::Duration;

use symra::bootstrap::socket::{Acceptor, Connector, SocketState};
use symra::bootstrap::uid::SocketBootstrap;
use symra::{Bootstrap, Context, SessionId, SymraConfig};

fn test_config() -> SymraConfig {
    SymraConfig {
        heap_size: 8 * 1024 * 1024,
        max_teams: 8,
        qp_depth: 16,
        backpressure_threshold: 4,
        refused_retries: 20_000,
        retry_sleep: Duration::from_micros(200),
        ..Default::default()
    }
}

/// Pick a free localhost port. The listener is dropped before use, so
/// connectors rely on their refused-retry loop to cover the gap until
/// the root binds it again.
fn free_addr() -> std::net::SocketAddr {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
}

fn spawn_job<F, T>(npes: u32, f: F) -> Vec<T>
where
    F: Fn(SocketBootstrap) -> T + Send + Sync + 'static,
    T: Send + 'static,
{
    let session = SessionId::generate(free_addr());
    let f = std::sync::Arc::new(f);
    let handles: Vec<_> = (0..npes)
        .map(|pe| {
            let f = std::sync::Arc::clone(&f);
            std::thread::spawn(move || {
                let boot = SocketBootstrap::init(session, pe, npes, &test_config()).unwrap();
                f(boot)
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn test_socket_allgather_and_barrier() {
    spawn_job(4, |mut boot| {
        let send = [boot.pe() as u8 + 1; 2];
        let mut recv = vec![0u8; 2 * 4];
        boot.allgather(&send, &mut recv).unwrap();
        assert_eq!(recv, vec![1, 1, 2, 2, 3, 3, 4, 4]);
        for _ in 0..5 {
            boot.barrier().unwrap();
        }
        boot.finalize().unwrap();
    });
}

#[test]
fn test_socket_alltoall_and_p2p() {
    spawn_job(3, |mut boot| {
        let pe = boot.pe();
        let send: Vec<u8> = (0..3u8).map(|d| pe as u8 * 16 + d).collect();
        let mut recv = vec![0u8; 3];
        boot.alltoall(&send, &mut recv).unwrap();
        let expect: Vec<u8> = (0..3u8).map(|s| s * 16 + pe as u8).collect();
        assert_eq!(recv, expect);

        // Tagged p2p around a ring, out-of-order tags exercising the
        // unexpected queue.
        let next = (pe + 1) % 3;
        let prev = (pe + 2) % 3;
        boot.send(next, 7, &[pe as u8]).unwrap();
        boot.send(next, 8, &[pe as u8 + 100]).unwrap();
        let mut hi = [0u8; 1];
        boot.recv(prev, 8, &mut hi).unwrap();
        assert_eq!(hi[0], prev as u8 + 100);
        let mut lo = [0u8; 1];
        boot.recv(prev, 7, &mut lo).unwrap();
        assert_eq!(lo[0], prev as u8);
        boot.finalize().unwrap();
    });
}

#[test]
fn test_wrong_magic_is_rejected_and_listener_survives() {
    let mut acceptor = Acceptor::new("127.0.0.1:0".parse().unwrap(), 0xfeed_f00d);
    while acceptor.progress().unwrap() != SocketState::Accepting {}
    let addr = acceptor.local_addr().unwrap();

    // Foreign connector with the wrong session magic.
    let intruder = std::thread::spawn(move || {
        Connector::new(addr, 0xbad0_bad0, 1, 100, 10, Duration::from_millis(1)).connect()
    });
    // The intruder's handshake is consumed and discarded; the acceptor
    // must end up back in Accepting, not Ready and not Error.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        let state = acceptor.progress().unwrap();
        assert_ne!(state, SocketState::Ready, "wrong magic must not hand out a connection");
        if std::time::Instant::now() > deadline {
            break;
        }
        if intruder.is_finished() && state == SocketState::Accepting {
            break;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    intruder.join().unwrap().unwrap();
    assert_eq!(acceptor.state(), SocketState::Accepting);

    // A correct connector still gets through afterwards.
    let legit = std::thread::spawn(move || {
        Connector::new(addr, 0xfeed_f00d, 5, 100, 10, Duration::from_millis(1))
            .connect()
            .unwrap()
    });
    acceptor.wait_ready().unwrap();
    let (_stream, msg_type) = acceptor.take().unwrap();
    assert_eq!(msg_type, 5);
    legit.join().unwrap();
}

#[test]
fn test_context_init_over_socket_bootstrap() {
    let session = SessionId::generate(free_addr());
    let handles: Vec<_> = (0..2u32)
        .map(|pe| {
            std::thread::spawn(move || {
                let boot = SocketBootstrap::init(session, pe, 2, &test_config()).unwrap();
                let ctx = Context::init(test_config(), Box::new(boot)).unwrap();
                let cell = ctx.alloc(8, 8).unwrap();
                let world = ctx.world();
                ctx.put_u64(cell, ctx.mype() as u64 + 1, ctx.mype()).unwrap();
                ctx.barrier(&world).unwrap();
                let other = 1 - ctx.mype();
                assert_eq!(ctx.get_u64(cell, other).unwrap(), other as u64 + 1);
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
fn test_session_id_travels_as_bytes() {
    // The id is distributed out-of-band as an opaque byte blob.
    let sid = SessionId::generate(free_addr());
    let wire = sid.to_bytes();
    let back = SessionId::from_bytes(&wire).unwrap();
    assert_eq!(back.magic, sid.magic);
    assert_eq!(back.addr, sid.addr);
}
