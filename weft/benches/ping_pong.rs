use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;
use weft::channel::BoundedChannel;
use weft::sync::Signal;
use weft::{Config, Runtime};

/// Round-trips one message between two fibers over a pair of bounded
/// channels, the shape the runtime is tuned for: every iteration is two
/// sends, two receives and (usually) two context switches.
fn ping_pong(c: &mut Criterion) {
    let rt = Runtime::start(Config {
        workers: 2,
        ..Config::default()
    })
    .expect("failed to start runtime");

    let ping = Arc::new(BoundedChannel::with_signal(7, Arc::new(Signal::new())));
    let pong = Arc::new(BoundedChannel::with_signal(7, Arc::new(Signal::new())));

    let echoer = {
        let ping = ping.clone();
        let pong = pong.clone();
        weft::spawn(move || {
            loop {
                let value: u64 = ping.recv();
                if value == u64::MAX {
                    break;
                }
                pong.send(value);
            }
        })
    };

    c.bench_function("bounded_channel_ping_pong", |b| {
        b.iter(|| {
            ping.send(1);
            pong.recv()
        });
    });

    ping.send(u64::MAX);
    echoer.join().expect("echo fiber failed");
    rt.shutdown();
}

criterion_group!(benches, ping_pong);
criterion_main!(benches);
