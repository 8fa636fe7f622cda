//! Integration tests for the broadcast bus.
//!
//! Each test runs its own bus and talks to it through the secondary device
//! paths, the same way an external serial program would.

use nix::sys::signal;
use nix::unistd::Pid;
use ptybus::testing::{BusHarness, TestError};
use ptybus::{Bus, BusConfig, BusError, ConfigError};
use std::collections::HashSet;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

#[tokio::test]
async fn test_distinct_device_paths() {
    for count in [1, 2, 5] {
        let harness = BusHarness::new(count).await.expect("start failed");

        let paths: HashSet<_> = harness.paths().iter().collect();
        assert_eq!(paths.len(), count);
        for path in harness.paths() {
            assert!(path.exists(), "missing {}", path.display());
        }

        harness.shutdown().await.expect("shutdown failed");
    }
}

/// Three ports, no companions: a byte from port 1 reaches 2 and 3 only.
#[tokio::test]
async fn test_broadcast_excludes_source() {
    let harness = BusHarness::new(3).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");
    let p3 = harness.connect(3).expect("connect 3");

    p1.send(&[0x41]).await.expect("send failed");

    assert_eq!(p2.wait_for_bytes(1, WAIT).await.expect("port 2"), [0x41]);
    assert_eq!(p3.wait_for_bytes(1, WAIT).await.expect("port 3"), [0x41]);
    assert!(p1.read_for(QUIET).await.expect("read port 1").is_empty());

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_every_pair_relays() {
    let harness = BusHarness::new(3).await.expect("start failed");
    let clients: Vec<_> = (1..=3)
        .map(|id| harness.connect(id).expect("connect"))
        .collect();

    for (i, source) in clients.iter().enumerate() {
        let byte = b'a' + u8::try_from(i).expect("small index");
        source.send(&[byte]).await.expect("send failed");

        for (j, dest) in clients.iter().enumerate() {
            if i == j {
                continue;
            }
            let got = dest.wait_for_bytes(1, WAIT).await.expect("relay failed");
            assert_eq!(got, [byte], "port {} -> port {}", i + 1, j + 1);
        }
        assert!(source.read_for(QUIET).await.expect("read").is_empty());
    }

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_bytes_are_transparent_and_ordered() {
    let harness = BusHarness::new(2).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");

    // Control characters, CR/LF, XON/XOFF and high bytes all pass untouched
    let data: Vec<u8> = (0..=255).collect();
    p1.send(&data).await.expect("send failed");

    let got = p2.wait_for_bytes(data.len(), WAIT).await.expect("relay failed");
    assert_eq!(got, data);

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_ordered_within_each_source() {
    let harness = BusHarness::new(3).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");
    let p3 = harness.connect(3).expect("connect 3");

    let (r1, r2) = tokio::join!(p1.send(b"abcdefgh"), p2.send(b"ABCDEFGH"));
    r1.expect("send 1");
    r2.expect("send 2");

    let got = p3.wait_for_bytes(16, WAIT).await.expect("relay failed");
    let lower: Vec<u8> = got.iter().copied().filter(u8::is_ascii_lowercase).collect();
    let upper: Vec<u8> = got.iter().copied().filter(u8::is_ascii_uppercase).collect();
    assert_eq!(lower, b"abcdefgh");
    assert_eq!(upper, b"ABCDEFGH");

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_chunked_relay() {
    let config = BusConfig {
        chunk_size: 16,
        ..BusConfig::with_ports(3)
    };
    let harness = BusHarness::start(config).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");
    let p3 = harness.connect(3).expect("connect 3");

    let data: Vec<u8> = (0..100).collect();
    p2.send(&data).await.expect("send failed");

    assert_eq!(p1.wait_for_bytes(100, WAIT).await.expect("port 1"), data);
    assert_eq!(p3.wait_for_bytes(100, WAIT).await.expect("port 3"), data);
    assert!(p2.read_for(QUIET).await.expect("read port 2").is_empty());

    harness.shutdown().await.expect("shutdown failed");
}

/// Four ports; the only client of port 3 goes away and the rest keep talking.
#[tokio::test]
async fn test_disconnected_port_does_not_stop_relay() {
    let harness = BusHarness::new(4).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");
    let p3 = harness.connect(3).expect("connect 3");
    let p4 = harness.connect(4).expect("connect 4");

    drop(p3);
    p1.send(b"Z").await.expect("send failed");

    assert_eq!(p2.wait_for_bytes(1, WAIT).await.expect("port 2"), b"Z");
    assert_eq!(p4.wait_for_bytes(1, WAIT).await.expect("port 4"), b"Z");
    assert!(harness.is_running());

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_port_relays_after_reattach() {
    let harness = BusHarness::new(3).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");
    let p2 = harness.connect(2).expect("connect 2");

    drop(harness.connect(3).expect("connect 3"));
    p1.send(b"x").await.expect("send failed");
    assert_eq!(p2.wait_for_bytes(1, WAIT).await.expect("port 2"), b"x");

    // Anything queued while detached comes first
    let p3 = harness.connect(3).expect("reconnect 3");
    p1.send(b"MARK").await.expect("send failed");
    let got = p3.wait_for_suffix(b"MARK", WAIT).await.expect("port 3");
    assert!(got.ends_with(b"MARK"));
    assert_eq!(p2.wait_for_bytes(4, WAIT).await.expect("port 2"), b"MARK");

    // And it still relays outward
    p3.send(b"back").await.expect("send failed");
    assert_eq!(p1.wait_for_bytes(4, WAIT).await.expect("port 1"), b"back");
    assert_eq!(p2.wait_for_bytes(4, WAIT).await.expect("port 2"), b"back");

    harness.shutdown().await.expect("shutdown failed");
}

/// Two ports, `echo %p` on port 2.
#[tokio::test]
async fn test_companion_argv_substituted() {
    let mut config = BusConfig::with_ports(2);
    config
        .set_companion(2, vec!["echo".into(), "%p".into()])
        .expect("set companion");
    let harness = BusHarness::start(config).await.expect("start failed");

    let path = harness.path(2).expect("path").display().to_string();
    let argv = harness.companion_argv(2).expect("companion");
    assert_eq!(argv, ["echo".to_string(), path].as_slice());
    assert!(!argv.iter().any(|arg| arg == "%p"));
    assert!(harness.companion_argv(1).is_none());

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_companion_talks_on_its_port() {
    let mut config = BusConfig::with_ports(2);
    config
        .set_companion(
            2,
            vec![
                "sh".into(),
                "-c".into(),
                "sleep 0.2; printf HELLO > \"$0\"".into(),
                "%p".into(),
            ],
        )
        .expect("set companion");
    let harness = BusHarness::start(config).await.expect("start failed");
    let p1 = harness.connect(1).expect("connect 1");

    let got = p1.wait_for_suffix(b"HELLO", WAIT).await.expect("companion output");
    assert_eq!(got, b"HELLO");

    harness.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn test_exited_companion_is_reaped() {
    let mut config = BusConfig::with_ports(2);
    config
        .set_companion(1, vec!["sh".into(), "-c".into(), "exit 3".into()])
        .expect("set companion");
    let harness = BusHarness::start(config).await.expect("start failed");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(harness.is_running());

    let bus = harness.stop().await.expect("stop failed");
    let companion = bus
        .ports()
        .get(1)
        .and_then(|p| p.companion.as_ref())
        .expect("companion");
    assert_eq!(companion.exit_code(), Some(3));
    bus.close();
}

#[tokio::test]
async fn test_close_stops_running_companions() {
    let mut config = BusConfig::with_ports(1);
    config
        .set_companion(1, vec!["sleep".into(), "30".into()])
        .expect("set companion");
    let harness = BusHarness::start(config).await.expect("start failed");

    let bus = harness.stop().await.expect("stop failed");
    let pid: Pid = bus
        .ports()
        .get(1)
        .and_then(|p| p.companion.as_ref())
        .map(ptybus::Companion::pid)
        .expect("companion");
    assert!(signal::kill(pid, None::<signal::Signal>).is_ok(), "companion should be alive");

    tokio::task::spawn_blocking(move || bus.close())
        .await
        .expect("close failed");
    assert_eq!(signal::kill(pid, None::<signal::Signal>), Err(nix::Error::ESRCH));
}

#[tokio::test]
async fn test_zero_ports_rejected() {
    let result = Bus::open(&BusConfig::with_ports(0));
    assert!(matches!(result, Err(BusError::Config(ConfigError::NoPorts))));

    let result = BusHarness::new(0).await;
    assert!(matches!(
        result,
        Err(TestError::Bus(BusError::Config(ConfigError::NoPorts)))
    ));
}

#[tokio::test]
async fn test_failed_spawn_is_fatal() {
    let mut config = BusConfig::with_ports(3);
    config
        .set_companion(2, vec!["/nonexistent/ptybus-companion".into()])
        .expect("set companion");

    let result = Bus::open(&config);
    assert!(matches!(result, Err(BusError::Launch { id: 2, .. })));
}
