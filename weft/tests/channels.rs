//! Channel and work-queue behaviour across workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing_subscriber::EnvFilter;
use weft::channel::{
    BoundedChannel, GetWork, MultiChannel, Push, Selector, SpChannel, UnboundedChannel, WorkQueue,
};
use weft::sync::Signal;
use weft::{Config, Runtime};

fn runtime(workers: usize) -> Runtime {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Runtime::start(Config {
        workers,
        ..Config::default()
    })
    .expect("failed to start runtime")
}

#[test]
fn bounded_channel_ping_pong() {
    const ITERATIONS: u64 = 100_000;

    let rt = runtime(2);

    let ping = Arc::new(BoundedChannel::with_signal(7, Arc::new(Signal::new())));
    let pong = Arc::new(BoundedChannel::with_signal(7, Arc::new(Signal::new())));

    let ponger = {
        let ping = ping.clone();
        let pong = pong.clone();
        weft::spawn(move || {
            let mut received = 0;
            for _ in 0..ITERATIONS {
                let value = ping.recv();
                received += 1;
                pong.send(value);
            }
            received
        })
    };

    let mut received = 0;
    for i in 0..ITERATIONS {
        ping.send(i);
        assert_eq!(pong.recv(), i);
        received += 1;
    }

    assert_eq!(received, ITERATIONS);
    assert_eq!(ponger.join().unwrap(), ITERATIONS);

    rt.shutdown();
}

#[test]
fn bounded_channel_respects_capacity() {
    let rt = runtime(1);

    let channel = BoundedChannel::new(2);
    assert_eq!(channel.capacity(), 4);
    for i in 0..4 {
        channel.send(i);
    }
    // the buffer is full; a try_recv must free a slot before more fits
    assert_eq!(channel.try_recv(), Some(0));
    channel.send(4);
    for i in 1..=4 {
        assert_eq!(channel.recv(), i);
    }
    assert_eq!(channel.try_recv(), None);

    rt.shutdown();
}

#[test]
fn unbounded_channel_keeps_per_sender_order() {
    const PER_SENDER: u64 = 20_000;
    const SENDERS: u64 = 3;

    let rt = runtime(4);

    let channel = Arc::new(UnboundedChannel::with_signal(Arc::new(Signal::new())));

    let senders: Vec<_> = (0..SENDERS)
        .map(|s| {
            let channel = channel.clone();
            weft::spawn(move || {
                for i in 0..PER_SENDER {
                    channel.send((s, i));
                    if i % 1024 == 0 {
                        weft::yield_now();
                    }
                }
            })
        })
        .collect();

    let mut last = [None::<u64>; SENDERS as usize];
    for _ in 0..SENDERS * PER_SENDER {
        let (s, i) = channel.recv();
        if let Some(prev) = last[s as usize] {
            assert!(i > prev, "sender {s} reordered: {prev} then {i}");
        }
        last[s as usize] = Some(i);
    }

    for sender in senders {
        sender.join().unwrap();
    }
    rt.shutdown();
}

#[test]
fn unbounded_channel_recycles_nodes() {
    let rt = runtime(1);

    let channel = UnboundedChannel::new();
    channel.send(1_u32);
    let node = channel.recv_node();
    // Safety: the node is exclusively ours after recv.
    assert_eq!(unsafe { node.take() }, Some(1));

    // reuse the same allocation for the next message
    // Safety: not enqueued anywhere.
    unsafe { node.put(2) };
    channel.send_node(node);
    assert_eq!(channel.try_recv(), Some(2));
    assert_eq!(channel.try_recv(), None);

    rt.shutdown();
}

#[test]
fn sp_channel_is_strict_fifo() {
    const ITEMS: u32 = 50_000;

    let rt = runtime(2);

    let channel = Arc::new(SpChannel::with_signal(Arc::new(Signal::new())));
    let producer = {
        let channel = channel.clone();
        weft::spawn(move || {
            for i in 0..ITEMS {
                channel.send(i);
            }
        })
    };

    for expected in 0..ITEMS {
        assert_eq!(channel.recv(), expected);
    }

    producer.join().unwrap();
    rt.shutdown();
}

#[test]
fn multi_channel_many_to_many() {
    const PER_SENDER: usize = 5_000;
    const SIDES: usize = 4;

    let rt = runtime(4);

    let channel = Arc::new(MultiChannel::new(5));
    let total = Arc::new(AtomicUsize::new(0));

    let senders: Vec<_> = (0..SIDES)
        .map(|s| {
            let channel = channel.clone();
            weft::spawn(move || {
                for i in 0..PER_SENDER {
                    channel.send(s * PER_SENDER + i);
                }
            })
        })
        .collect();

    let receivers: Vec<_> = (0..SIDES)
        .map(|_| {
            let channel = channel.clone();
            let total = total.clone();
            weft::spawn(move || {
                for _ in 0..PER_SENDER {
                    channel.recv();
                    total.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for handle in senders.into_iter().chain(receivers) {
        handle.join().unwrap();
    }
    assert_eq!(total.load(Ordering::Relaxed), SIDES * PER_SENDER);

    rt.shutdown();
}

#[test]
fn work_queue_elects_one_worker() {
    const FIBERS: usize = 32;
    const PER_FIBER: usize = 200;

    let rt = runtime(4);

    let queue = Arc::new(WorkQueue::new());
    let processed = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..FIBERS)
        .map(|f| {
            let queue = queue.clone();
            let processed = processed.clone();
            weft::spawn(move || {
                for i in 0..PER_FIBER {
                    if queue.push(f * PER_FIBER + i) == Push::StartWorking {
                        // we were elected: drain until the burst is over
                        while let GetWork::More(_) = queue.get_work() {
                            processed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    if i % 64 == 0 {
                        weft::yield_now();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(processed.load(Ordering::Relaxed), FIBERS * PER_FIBER);

    rt.shutdown();
}

#[test]
fn selector_round_robins_channels() {
    let rt = runtime(2);

    let signal = Arc::new(Signal::new());
    let channels: Vec<_> = (0..3)
        .map(|_| Arc::new(UnboundedChannel::with_signal(signal.clone())))
        .collect();
    let selector = Selector::new(signal, channels.clone()).unwrap();

    // preload unevenly: a busy channel must not shadow the others
    for i in 0..6 {
        channels[0].send((0, i));
    }
    channels[1].send((1, 0));
    channels[2].send((2, 0));

    let mut seen_channels = [0_usize; 3];
    for _ in 0..8 {
        let (channel, _) = selector.select();
        seen_channels[channel] += 1;
    }
    assert_eq!(seen_channels, [6, 1, 1]);

    // and it blocks on the shared signal until someone sends
    let feeder = {
        let channel = channels[2].clone();
        weft::spawn(move || {
            for _ in 0..20 {
                weft::yield_now();
            }
            channel.send((2, 99));
        })
    };
    assert_eq!(selector.select(), (2, 99));
    feeder.join().unwrap();

    rt.shutdown();
}

#[test]
fn selector_rejects_foreign_channels() {
    let rt = runtime(1);

    let signal = Arc::new(Signal::new());
    let foreign = Arc::new(UnboundedChannel::<u32>::new());
    assert!(Selector::new(signal, vec![foreign]).is_err());

    rt.shutdown();
}
