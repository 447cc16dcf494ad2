use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use occl::bootstrap::task::{bootstrap_net_send, BootstrapExchangeInfo, EXCHANGE_INFO_SEND_SIZE};
use occl::bootstrap::{bootstrap_root, get_unique_id, BootstrapError, BootstrapState};
use occl::config::BootstrapConfig;
use occl::utils::tcp;
use occl::AbortFlag;

fn init_logging() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .is_test(true)
            .init();
    });
}

fn test_config() -> BootstrapConfig {
    init_logging();
    BootstrapConfig {
        if_prefix: Some("lo".to_string()),
        ..Default::default()
    }
}

fn new_abort() -> AbortFlag {
    Arc::new(AtomicU32::new(0))
}

/// Runs every rank's init as its own thread and returns the states sorted
/// by rank.
fn bootstrap_group(num_ranks: usize) -> Vec<BootstrapState> {
    let handle = get_unique_id(&test_config()).unwrap();
    let mut workers = Vec::new();
    for rank in 0..num_ranks {
        let handle = handle.clone();
        workers.push(thread::spawn(move || {
            BootstrapState::init(&handle, &test_config(), rank, num_ranks, new_abort()).unwrap()
        }));
    }
    let mut states: Vec<BootstrapState> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();
    states.sort_by_key(|s| s.rank);
    states
}

#[test]
fn single_rank_init_all_gather_close() {
    let mut states = bootstrap_group(1);
    let state = states.pop().unwrap();
    let mut data = [0xAA, 0xBB, 0xCC, 0xDD];
    state.all_gather(&mut data).unwrap();
    assert_eq!(data, [0xAA, 0xBB, 0xCC, 0xDD]);
    state.close().unwrap();
}

#[test]
fn ring_all_gather_four_ranks() {
    let states = bootstrap_group(4);
    thread::scope(|s| {
        for state in &states {
            s.spawn(move || {
                let mut data = [0u8; 4];
                data[state.rank] = 0x10 * (state.rank as u8 + 1);
                state.all_gather(&mut data).unwrap();
                assert_eq!(data, [0x10, 0x20, 0x30, 0x40]);
            });
        }
    });
}

#[test]
fn peer_addresses_agree_across_ranks() {
    for num_ranks in [2usize, 3, 8] {
        let states = bootstrap_group(num_ranks);
        let reference = states[0].peer_addrs().to_vec();
        let proxy_reference = states[0].peer_proxy_addrs().to_vec();
        assert_eq!(reference.len(), num_ranks);
        for state in &states {
            assert_eq!(state.peer_addrs(), reference.as_slice());
            assert_eq!(state.peer_proxy_addrs(), proxy_reference.as_slice());
            assert_eq!(
                state.proxy().unwrap().listen_addr().unwrap(),
                proxy_reference[state.rank]
            );
        }
    }
}

#[test]
fn ring_is_well_formed() {
    let states = bootstrap_group(4);
    let addrs = states[0].peer_addrs().to_vec();
    for (rank, state) in states.iter().enumerate() {
        let (send_peer, recv_peer) = state.ring_peers().unwrap();
        assert_eq!(send_peer, addrs[(rank + 1) % 4]);
        // the predecessor connects from an ephemeral port; only its host is fixed
        assert_eq!(recv_peer.ip(), addrs[(rank + 3) % 4].ip());
    }
}

#[test]
fn unexpected_connections_are_parked_and_consumed() {
    let states = bootstrap_group(3);
    thread::scope(|s| {
        let (r0, r1, r2) = (&states[0], &states[1], &states[2]);
        s.spawn(move || {
            thread::sleep(Duration::from_millis(150));
            r0.send(2, 7, b"hi").unwrap();
        });
        s.spawn(move || {
            r1.send(2, 9, b"xx").unwrap();
        });
        s.spawn(move || {
            let mut buf = [0u8; 2];
            r2.recv(0, 7, &mut buf).unwrap();
            assert_eq!(&buf, b"hi");
            // the mismatched message from rank 1 arrived first and was parked
            assert_eq!(r2.unexpected_count(), 1);
            r2.recv(1, 9, &mut buf).unwrap();
            assert_eq!(&buf, b"xx");
            assert_eq!(r2.unexpected_count(), 0);
        });
    });
}

#[test]
fn tagged_channels_deliver_exactly_once() {
    let states = bootstrap_group(2);
    thread::scope(|s| {
        let (r0, r1) = (&states[0], &states[1]);
        s.spawn(move || {
            for tag in [3, 1, 2, 0] {
                r0.send(1, tag, format!("msg-{tag}").as_bytes()).unwrap();
            }
        });
        s.spawn(move || {
            for tag in [0, 1, 2, 3] {
                let mut buf = [0u8; 5];
                r1.recv(0, tag, &mut buf).unwrap();
                assert_eq!(buf.as_slice(), format!("msg-{tag}").as_bytes());
            }
            assert_eq!(r1.unexpected_count(), 0);
        });
    });
}

#[test]
fn unexpected_queue_is_fifo_per_channel() {
    let states = bootstrap_group(2);
    thread::scope(|s| {
        let (r0, r1) = (&states[0], &states[1]);
        s.spawn(move || {
            r0.send(1, 5, b"aaaa").unwrap();
            r0.send(1, 5, b"bbbb").unwrap();
            r0.send(1, 6, b"done").unwrap();
        });
        s.spawn(move || {
            let mut buf = [0u8; 4];
            r1.recv(0, 6, &mut buf).unwrap();
            assert_eq!(&buf, b"done");
            assert_eq!(r1.unexpected_count(), 2);
            r1.recv(0, 5, &mut buf).unwrap();
            assert_eq!(&buf, b"aaaa");
            r1.recv(0, 5, &mut buf).unwrap();
            assert_eq!(&buf, b"bbbb");
            assert_eq!(r1.unexpected_count(), 0);
        });
    });
}

#[test]
fn barrier_eight_ranks() {
    let states = bootstrap_group(8);
    let ranks: Vec<usize> = (0..8).collect();
    thread::scope(|s| {
        for state in &states {
            let ranks = ranks.clone();
            s.spawn(move || {
                state.barrier(&ranks, state.rank, 0xB0).unwrap();
            });
        }
    });
}

#[test]
fn barrier_blocks_until_abort_when_rank_missing() {
    let states = bootstrap_group(4);
    let ranks: Vec<usize> = (0..4).collect();
    thread::scope(|s| {
        // rank 3 never enters the barrier
        let waiters: Vec<_> = states[..3]
            .iter()
            .map(|state| {
                let ranks = ranks.clone();
                s.spawn(move || state.barrier(&ranks, state.rank, 0x77))
            })
            .collect();
        thread::sleep(Duration::from_millis(300));
        for state in &states {
            state.abort();
        }
        for waiter in waiters {
            assert!(matches!(
                waiter.join().unwrap(),
                Err(BootstrapError::Aborted)
            ));
        }
    });
}

#[test]
fn intra_node_all_gather_and_broadcast() {
    let states = bootstrap_group(4);
    let ranks: Vec<usize> = (0..4).collect();
    thread::scope(|s| {
        for state in &states {
            let ranks = ranks.clone();
            s.spawn(move || {
                let mut data = [0u8; 4];
                data[state.rank] = state.rank as u8 + 0x30;
                state
                    .intra_node_all_gather(&ranks, state.rank, &mut data)
                    .unwrap();
                assert_eq!(data, [0x30, 0x31, 0x32, 0x33]);

                let mut bcast = if state.rank == 1 { *b"root" } else { [0u8; 4] };
                state
                    .intra_node_broadcast(&ranks, state.rank, 1, &mut bcast)
                    .unwrap();
                assert_eq!(&bcast, b"root");
                assert_eq!(state.unexpected_count(), 0);
            });
        }
    });
}

#[test]
fn split_into_two_groups() {
    let states = bootstrap_group(4);
    thread::scope(|s| {
        for state in &states {
            let parent_ranks: Vec<usize> = if state.rank % 2 == 0 {
                vec![0, 2]
            } else {
                vec![1, 3]
            };
            let child_rank = parent_ranks
                .iter()
                .position(|&r| r == state.rank)
                .unwrap();
            s.spawn(move || {
                let child = BootstrapState::split(
                    state,
                    &test_config(),
                    child_rank,
                    &parent_ranks,
                    new_abort(),
                )
                .unwrap();
                assert_eq!(child.peer_addrs().len(), 2);

                // the child's all-gather runs on the child's own ring
                let mut data = [0u8; 2];
                data[child_rank] = state.rank as u8 + 1;
                child.all_gather(&mut data).unwrap();
                let expected: [u8; 2] = if state.rank % 2 == 0 { [1, 3] } else { [2, 4] };
                assert_eq!(data, expected);
                child.close().unwrap();
            });
        }
    });

    // the parent ring is untouched by the children
    thread::scope(|s| {
        for state in &states {
            s.spawn(move || {
                let mut data = [0u8; 4];
                data[state.rank] = 0x50 + state.rank as u8;
                state.all_gather(&mut data).unwrap();
                assert_eq!(data, [0x50, 0x51, 0x52, 0x53]);
            });
        }
    });
}

#[test]
fn abort_unblocks_init() {
    let handle = get_unique_id(&test_config()).unwrap();
    let abort = new_abort();
    let flag = Arc::clone(&abort);
    // rank 1 never checks in, so rank 0 blocks waiting for the root callback
    let worker =
        thread::spawn(move || BootstrapState::init(&handle, &test_config(), 0, 2, flag));
    thread::sleep(Duration::from_millis(300));
    abort.store(1, Ordering::Relaxed);
    let result = worker.join().unwrap();
    assert!(matches!(result, Err(BootstrapError::Aborted)));
}

#[test]
fn oversized_message_is_a_truncation_error() {
    let states = bootstrap_group(2);
    thread::scope(|s| {
        let (r0, r1) = (&states[0], &states[1]);
        s.spawn(move || {
            r0.send(1, 11, b"way-too-long").unwrap();
        });
        s.spawn(move || {
            let mut buf = [0u8; 4];
            let err = r1.recv(0, 11, &mut buf).unwrap_err();
            assert!(matches!(err, BootstrapError::Truncated(12, 4)));
        });
    });
}

#[test]
fn short_message_fills_a_prefix() {
    let states = bootstrap_group(2);
    thread::scope(|s| {
        let (r0, r1) = (&states[0], &states[1]);
        s.spawn(move || r0.send(1, 4, b"ab").unwrap());
        s.spawn(move || {
            let mut buf = [0xFFu8; 8];
            let received = r1.recv(0, 4, &mut buf).unwrap();
            assert_eq!(received, 2);
            assert_eq!(&buf[..2], b"ab");
            assert_eq!(&buf[2..], &[0xFF; 6]);
        });
    });
}

#[test]
fn close_rejects_unconsumed_messages() {
    let states = bootstrap_group(2);
    let mut states = states.into_iter();
    let r0 = states.next().unwrap();
    let r1 = states.next().unwrap();
    thread::scope(|s| {
        s.spawn(|| {
            r0.send(1, 99, b"stray").unwrap();
            r0.send(1, 21, b"real").unwrap();
        });
        s.spawn(|| {
            let mut buf = [0u8; 5];
            r1.recv(0, 21, &mut buf).unwrap();
            assert_eq!(r1.unexpected_count(), 1);
        });
    });
    r0.close().unwrap();
    assert!(matches!(
        r1.close(),
        Err(BootstrapError::UnexpectedNotEmpty(1))
    ));
}

#[test]
fn large_group_staggered_init() {
    let num_ranks = 130;
    let states = bootstrap_group(num_ranks);
    let reference = states[0].peer_addrs().to_vec();
    assert_eq!(reference.len(), num_ranks);
    for state in &states {
        assert_eq!(state.peer_addrs(), reference.as_slice());
    }
}

fn check_in(root_addr: SocketAddr, magic: u64, rank: usize, num_ranks: usize) {
    let dummy: SocketAddr = "127.0.0.1:9999".parse().unwrap();
    let info = BootstrapExchangeInfo {
        rank,
        num_ranks,
        listen_addr_root: dummy,
        listen_addr: dummy,
    };
    let mut buf = [0u8; EXCHANGE_INFO_SEND_SIZE];
    let mut slice = buf.as_mut_slice();
    info.encode(&mut slice);
    let mut stream = tcp::connect(&root_addr, magic, None).unwrap();
    bootstrap_net_send(&mut stream, &buf, None).unwrap();
}

#[test]
fn root_rejects_duplicate_check_in() {
    init_logging();
    let listener = tcp::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let magic = 0x5eed;
    let root = thread::spawn(move || bootstrap_root(listener, magic));
    check_in(addr, magic, 0, 2);
    check_in(addr, magic, 0, 2);
    assert!(matches!(
        root.join().unwrap(),
        Err(BootstrapError::DuplicatedCheckIn(0))
    ));
}

#[test]
fn root_rejects_rank_count_mismatch() {
    init_logging();
    let listener = tcp::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let magic = 0x5eed;
    let root = thread::spawn(move || bootstrap_root(listener, magic));
    check_in(addr, magic, 0, 2);
    check_in(addr, magic, 1, 3);
    assert!(matches!(
        root.join().unwrap(),
        Err(BootstrapError::NumRanksMismatch(3, 2))
    ));
}

#[test]
fn root_rejects_out_of_range_rank() {
    init_logging();
    let listener = tcp::listen(&"127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = listener.local_addr().unwrap();
    let magic = 0x5eed;
    let root = thread::spawn(move || bootstrap_root(listener, magic));
    check_in(addr, magic, 0, 2);
    check_in(addr, magic, 5, 2);
    assert!(matches!(
        root.join().unwrap(),
        Err(BootstrapError::RankOverflow(5))
    ));
}
