//! Integration tests for the metrics endpoint wired into the control plane.
//!
//! Verifies that:
//! - `ControlPlane::start` brings the server up when an address is configured
//! - `GET /metrics` returns Prometheus text for both loops
//! - The server reflects live state changes
//! - Non-metrics paths return 404

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;

use dualsim_common::{SlotId, SubId};
use dualsim_core::arbiter::ArbiterEvent;
use dualsim_core::collab::memory::MemoryDevice;
use dualsim_core::config::DaemonConfig;
use dualsim_core::runtime::ControlPlane;

/// Helper: HTTP GET and return the full response string.
fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).expect("connect to metrics server");
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    response
}

fn start_plane(device: &MemoryDevice) -> ControlPlane {
    let config = DaemonConfig::from_toml_str(
        r#"
version = 1

[telemetry]
metrics_addr = "127.0.0.1:0"
"#,
    )
    .expect("config should parse");
    ControlPlane::start(&config, device.collaborators(), quanta::Clock::new())
        .expect("control plane should start")
}

fn two_sims() -> MemoryDevice {
    let device = MemoryDevice::new(2);
    device.subscriptions.insert_sim(SlotId(0), SubId(1));
    device.subscriptions.insert_sim(SlotId(1), SubId(2));
    device.subscriptions.set_default_data(Some(SubId(1)));
    device
}

fn poll_until(addr: SocketAddr, path: &str, needle: &str) -> String {
    let mut last = String::new();
    for _ in 0..50 {
        last = http_get(addr, path);
        if last.contains(needle) {
            return last;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("{needle:?} never appeared; last response: {last}");
}

#[test]
fn control_plane_serves_prometheus() {
    let device = two_sims();
    let mut plane = start_plane(&device);
    let addr = plane.metrics_addr().expect("metrics server bound");

    let resp = poll_until(addr, "/metrics", "dualsim_data_stalled");
    assert!(
        resp.starts_with("HTTP/1.1 200 OK"),
        "expected 200, got: {}",
        &resp[..resp.len().min(80)]
    );
    assert!(resp.contains("text/plain"));
    assert!(resp.contains("dualsim_preferred_slot{reason=\"manual\"} 0"));
    assert!(resp.contains("dualsim_slot_active{slot=\"0\"} 1"));
    assert!(resp.contains("dualsim_data_stalled 0"));

    plane.shutdown();
}

#[test]
fn metrics_reflect_preferred_slot_changes() {
    let device = two_sims();
    let mut plane = start_plane(&device);
    let addr = plane.metrics_addr().expect("metrics server bound");
    poll_until(addr, "/metrics", "dualsim_preferred_slot{reason=\"manual\"} 0");

    device.subscriptions.set_default_data(Some(SubId(2)));
    plane
        .arbiter()
        .send(ArbiterEvent::SubscriptionMappingChanged)
        .unwrap();

    let resp = poll_until(addr, "/metrics", "dualsim_preferred_slot{reason=\"manual\"} 1");
    assert!(resp.contains("dualsim_slot_active{slot=\"1\"} 1"));

    let json = poll_until(addr, "/telemetry", "\"preferred\"");
    assert!(json.contains("application/json"));

    plane.shutdown();
}

#[test]
fn unknown_path_returns_404() {
    let device = two_sims();
    let mut plane = start_plane(&device);
    let addr = plane.metrics_addr().expect("metrics server bound");

    let resp = http_get(addr, "/");
    assert!(resp.starts_with("HTTP/1.1 404"));

    plane.shutdown();
}
