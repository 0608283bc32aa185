//! Event bridge and fiber-aware I/O: sleeps, readiness waits, closed-fd
//! wakeups, socket echo.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use weft::{Config, Runtime, io};

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
fn sleep_lasts_at_least_the_requested_time() {
    let rt = runtime(2);

    let start = Instant::now();
    weft::sleep(Duration::from_millis(30));
    assert!(start.elapsed() >= Duration::from_millis(30));

    rt.shutdown();
}

#[test]
fn many_sleepers_wake_in_one_pass() {
    const SLEEPERS: usize = 32;

    let rt = runtime(2);

    let woken = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..SLEEPERS)
        .map(|_| {
            let woken = woken.clone();
            weft::spawn(move || {
                weft::sleep(Duration::from_millis(20));
                woken.fetch_add(1, Ordering::Relaxed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(woken.load(Ordering::Relaxed), SLEEPERS);

    rt.shutdown();
}

#[test]
fn pipe_read_parks_until_data_arrives() {
    let rt = runtime(2);

    let (rx, tx) = io::pipe().unwrap();

    let reader = weft::spawn(move || {
        let mut buf = [0_u8; 16];
        let n = io::read(rx, &mut buf).unwrap();
        buf[..n].to_vec()
    });

    // give the reader time to park on the empty pipe
    weft::sleep(Duration::from_millis(10));
    io::write(tx, b"hello").unwrap();

    assert_eq!(reader.join().unwrap(), b"hello");
    io::close(rx).unwrap();
    io::close(tx).unwrap();

    rt.shutdown();
}

#[test]
fn closing_a_descriptor_wakes_its_waiters() {
    let rt = runtime(2);

    let (rx, tx) = io::pipe().unwrap();

    let reader = weft::spawn(move || {
        let mut buf = [0_u8; 8];
        io::read(rx, &mut buf)
    });

    weft::sleep(Duration::from_millis(10));
    io::close(rx).unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EBADF));

    io::close(tx).unwrap();
    rt.shutdown();
}

#[test]
fn socketpair_echo() {
    const ROUNDS: usize = 200;

    let rt = runtime(2);

    let (a, b) = io::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();

    let echoer = weft::spawn(move || {
        let mut buf = [0_u8; 64];
        let mut served = 0;
        loop {
            let n = io::read(b, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            let mut sent = 0;
            while sent < n {
                sent += io::write(b, &buf[sent..n]).unwrap();
            }
            served += 1;
        }
        io::close(b).unwrap();
        served
    });

    for i in 0..ROUNDS {
        let message = format!("round trip {i}");
        io::write(a, message.as_bytes()).unwrap();

        let mut buf = [0_u8; 64];
        let mut got = 0;
        while got < message.len() {
            got += io::read(a, &mut buf[got..message.len()]).unwrap();
        }
        assert_eq!(&buf[..got], message.as_bytes());
    }

    // half-close our side so the echoer reads EOF
    // Safety: shutting down a socket we own.
    unsafe { libc::shutdown(a, libc::SHUT_WR) };
    assert!(echoer.join().unwrap() >= 1);
    io::close(a).unwrap();

    rt.shutdown();
}

#[test]
fn thread_lock_disables_parking() {
    let rt = runtime(1);

    let (rx, _tx) = io::pipe().unwrap();

    io::lock_thread();
    let mut buf = [0_u8; 4];
    let err = io::read(rx, &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    io::unlock_thread();

    io::close(rx).unwrap();
    io::close(_tx).unwrap();
    rt.shutdown();
}

#[test]
fn set_nonblocking_opts_a_descriptor_out() {
    let rt = runtime(1);

    let (rx, tx) = io::pipe().unwrap();
    io::set_nonblocking(rx);

    let mut buf = [0_u8; 4];
    let err = io::read(rx, &mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    io::close(rx).unwrap();
    io::close(tx).unwrap();
    rt.shutdown();
}

#[test]
fn event_waits_show_up_in_stats() {
    let rt = runtime(2);

    let (rx, tx) = io::pipe().unwrap();
    let reader = weft::spawn(move || {
        let mut buf = [0_u8; 4];
        io::read(rx, &mut buf).unwrap()
    });
    weft::sleep(Duration::from_millis(10));
    io::write(tx, b"x").unwrap();
    assert_eq!(reader.join().unwrap(), 1);

    let stats = rt.stats();
    assert!(stats.event_waits >= 1);
    assert!(stats.polls >= 1);

    io::close(rx).unwrap();
    io::close(tx).unwrap();
    rt.shutdown();
}
