//! # Prometheus Metrics
//!
//! Renders the arbiter and recovery snapshots in Prometheus text
//! exposition format and provides a lightweight HTTP server for scraping.
//! The runtimes publish into a shared [`TelemetrySnapshot`] after every
//! processed event; the server only ever reads it.

use crate::arbiter::ArbiterSnapshot;
use crate::recovery::RecoverySnapshot;
use chrono::{DateTime, Utc};
use dualsim_common::recovery::RecoveryAction;
use serde::Serialize;
use std::fmt::Write;
use std::io::{Read, Write as IoWrite};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Latest state published by the two control loops.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TelemetrySnapshot {
    pub arbiter: Option<ArbiterSnapshot>,
    pub recovery: Option<RecoverySnapshot>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub type TelemetryHandle = Arc<Mutex<TelemetrySnapshot>>;

/// Render a telemetry snapshot as Prometheus text exposition format.
pub fn render_prometheus(snap: &TelemetrySnapshot) -> String {
    let mut out = String::with_capacity(2048);

    // ── Arbiter ─────────────────────────────────────────────────

    if let Some(arb) = &snap.arbiter {
        writeln!(
            out,
            "# HELP dualsim_preferred_slot Slot currently preferred for Internet data (-1 when none)."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_preferred_slot gauge").unwrap();
        let preferred = arb.state.preferred_slot.map_or(-1, |s| s.index() as i64);
        writeln!(
            out,
            "dualsim_preferred_slot{{reason=\"{}\"}} {preferred}",
            arb.state.last_switch_reason.as_str()
        )
        .unwrap();

        writeln!(
            out,
            "# HELP dualsim_slot_active Whether data attach is in force on the slot (1) or not (0)."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_slot_active gauge").unwrap();
        for s in &arb.slots {
            let v = if s.active { 1 } else { 0 };
            writeln!(out, "dualsim_slot_active{{slot=\"{}\"}} {v}", s.slot.index()).unwrap();
        }

        writeln!(
            out,
            "# HELP dualsim_slot_registered Registration state of the slot (1 for the labelled state)."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_slot_registered gauge").unwrap();
        for s in &arb.slots {
            writeln!(
                out,
                "dualsim_slot_registered{{slot=\"{}\",state=\"{}\"}} 1",
                s.slot.index(),
                s.registration.as_str()
            )
            .unwrap();
        }

        writeln!(
            out,
            "# HELP dualsim_emergency_override Whether an emergency data override is in force."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_emergency_override gauge").unwrap();
        let v = if arb.emergency_slot.is_some() { 1 } else { 0 };
        writeln!(out, "dualsim_emergency_override {v}").unwrap();

        writeln!(
            out,
            "# HELP dualsim_auto_switch_engaged Whether data was auto-switched away from the primary."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_auto_switch_engaged gauge").unwrap();
        let v = if arb.auto_switch_engaged { 1 } else { 0 };
        writeln!(out, "dualsim_auto_switch_engaged {v}").unwrap();

        writeln!(
            out,
            "# HELP dualsim_network_requests Outstanding network requests."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_network_requests gauge").unwrap();
        writeln!(out, "dualsim_network_requests {}", arb.outstanding_requests).unwrap();

        let counters = [
            ("evaluations", "Arbiter evaluations run.", arb.stats.evaluations),
            (
                "preferred_changes",
                "Changes of the preferred slot.",
                arb.stats.preferred_changes,
            ),
            ("commands_sent", "Modem data commands issued.", arb.stats.commands_sent),
            (
                "command_failures",
                "Modem data commands that failed.",
                arb.stats.command_failures,
            ),
            ("auto_switches", "Committed auto data switches.", arb.stats.auto_switches),
        ];
        for (name, help, value) in counters {
            writeln!(out, "# HELP dualsim_arbiter_{name}_total {help}").unwrap();
            writeln!(out, "# TYPE dualsim_arbiter_{name}_total counter").unwrap();
            writeln!(out, "dualsim_arbiter_{name}_total {value}").unwrap();
        }
    }

    // ── Recovery ────────────────────────────────────────────────

    if let Some(rec) = &snap.recovery {
        writeln!(
            out,
            "# HELP dualsim_data_stalled Whether the Internet network is currently stalled."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_data_stalled gauge").unwrap();
        let v = if rec.valid_network { 0 } else { 1 };
        writeln!(out, "dualsim_data_stalled {v}").unwrap();

        writeln!(
            out,
            "# HELP dualsim_recovery_action Next recovery action, by external ordinal."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_recovery_action gauge").unwrap();
        writeln!(
            out,
            "dualsim_recovery_action{{action=\"{}\"}} {}",
            rec.current_action.as_str(),
            rec.current_action.ordinal()
        )
        .unwrap();

        writeln!(
            out,
            "# HELP dualsim_stall_duration_ms Duration of the current stall in milliseconds."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_stall_duration_ms gauge").unwrap();
        writeln!(
            out,
            "dualsim_stall_duration_ms {}",
            rec.stall_duration_ms.unwrap_or(0)
        )
        .unwrap();

        writeln!(
            out,
            "# HELP dualsim_recovery_actions_total Recovery actions executed."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_recovery_actions_total counter").unwrap();
        for action in RecoveryAction::LADDER {
            writeln!(
                out,
                "dualsim_recovery_actions_total{{action=\"{}\"}} {}",
                action.as_str(),
                rec.stats.actions(action)
            )
            .unwrap();
        }

        writeln!(
            out,
            "# HELP dualsim_stall_recoveries_total Stalls that ended with validation passing."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_stall_recoveries_total counter").unwrap();
        for (reason, value) in [
            ("dsrm", rec.stats.recovered_by_dsrm),
            ("modem", rec.stats.recovered_by_modem),
            ("user", rec.stats.recovered_by_user),
        ] {
            writeln!(
                out,
                "dualsim_stall_recoveries_total{{reason=\"{reason}\"}} {value}"
            )
            .unwrap();
        }

        writeln!(
            out,
            "# HELP dualsim_stalls_total Data stall episodes detected."
        )
        .unwrap();
        writeln!(out, "# TYPE dualsim_stalls_total counter").unwrap();
        writeln!(out, "dualsim_stalls_total {}", rec.stats.episodes).unwrap();
    }

    out
}

/// Lightweight HTTP server that exposes `/metrics` for Prometheus scraping.
///
/// Runs in a background thread. Stops when dropped.
pub struct MetricsServer {
    running: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Start the metrics server on the given address.
    ///
    /// `telemetry` is the handle the runtimes publish into.
    pub fn start(bind_addr: SocketAddr, telemetry: TelemetryHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(bind_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
        let running_clone = running.clone();

        let handle = thread::Builder::new()
            .name("dualsim-metrics".into())
            .spawn(move || {
                serve_loop(listener, telemetry, running_clone);
            })
            .map_err(std::io::Error::other)?;

        tracing::info!(%addr, "metrics server listening");
        Ok(MetricsServer {
            running,
            handle: Some(handle),
            addr,
        })
    }

    /// The address the server is actually listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Gracefully stop the server.
    pub fn stop(&mut self) {
        self.running
            .store(false, std::sync::atomic::Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve_loop(
    listener: TcpListener,
    telemetry: TelemetryHandle,
    running: Arc<std::sync::atomic::AtomicBool>,
) {
    while running.load(std::sync::atomic::Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let snap = telemetry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                handle_connection(stream, &snap);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(_) => {
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn handle_connection(mut stream: TcpStream, snap: &TelemetrySnapshot) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));

    let mut buf = [0u8; 1024];
    let n = match stream.read(&mut buf) {
        Ok(n) => n,
        Err(_) => return,
    };
    let request = String::from_utf8_lossy(&buf[..n]);

    let (status, content_type, body) = if request.starts_with("GET /metrics") {
        (
            "200 OK",
            "text/plain; version=0.0.4; charset=utf-8",
            render_prometheus(snap),
        )
    } else if request.starts_with("GET /telemetry") {
        ("200 OK", "application/json", to_telemetry_json(snap))
    } else {
        ("404 Not Found", "text/plain", String::new())
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes());
}

/// Serialize a snapshot as one JSON telemetry document.
///
/// Produces `{"preferred": {...}, "slots": [...], "recovery": {...},
/// "timestamp_ms": ...}`; sections whose loop has not published yet are
/// `null`.
pub fn to_telemetry_json(snap: &TelemetrySnapshot) -> String {
    let slots: Vec<serde_json::Value> = snap
        .arbiter
        .iter()
        .flat_map(|a| a.slots.iter())
        .map(|s| {
            serde_json::json!({
                "slot": s.slot.index(),
                "sub": s.sub.map(|sub| sub.0),
                "active": s.active,
                "requested_active": s.requested_active,
                "registration": s.registration.as_str(),
            })
        })
        .collect();

    let preferred = snap.arbiter.as_ref().map(|a| {
        serde_json::json!({
            "slot": a.state.preferred_slot.map(|s| s.index()),
            "sub": a.state.preferred_sub.map(|s| s.0),
            "primary_sub": a.state.primary_sub.map(|s| s.0),
            "reason": a.state.last_switch_reason.as_str(),
            "mode": a.mode,
            "emergency_slot": a.emergency_slot.map(|s| s.index()),
        })
    });

    let recovery = snap.recovery.as_ref().map(|r| {
        serde_json::json!({
            "stalled": !r.valid_network,
            "current_action": r.current_action.as_str(),
            "last_action": r.last_action.as_str(),
            "attempted_all_steps": r.attempted_all_steps,
            "stall_duration_ms": r.stall_duration_ms,
            "stats": r.stats,
        })
    });

    let now_ms = snap
        .updated_at
        .unwrap_or_else(Utc::now)
        .timestamp_millis();

    serde_json::json!({
        "preferred": preferred,
        "slots": slots,
        "recovery": recovery,
        "timestamp_ms": now_ms,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterStats, SlotSnapshot};
    use crate::recovery::RecoveryStats;
    use dualsim_common::models::{
        CommandMode, PreferredDataState, RegistrationState, SwitchReason,
    };
    use dualsim_common::{SlotId, SubId};

    fn sample() -> TelemetrySnapshot {
        let mut stats = RecoveryStats::default();
        stats.record_action(RecoveryAction::GetDataCallList);
        stats.record_action(RecoveryAction::Cleanup);
        stats.episodes = 1;
        TelemetrySnapshot {
            arbiter: Some(ArbiterSnapshot {
                mode: CommandMode::AllowData,
                state: PreferredDataState {
                    preferred_slot: Some(SlotId(1)),
                    preferred_sub: Some(SubId(2)),
                    primary_sub: Some(SubId(2)),
                    auto_selected_sub: None,
                    last_switch_reason: SwitchReason::Manual,
                },
                slots: vec![
                    SlotSnapshot {
                        slot: SlotId(0),
                        sub: Some(SubId(1)),
                        requested_active: false,
                        active: false,
                        registration: RegistrationState::Home,
                    },
                    SlotSnapshot {
                        slot: SlotId(1),
                        sub: Some(SubId(2)),
                        requested_active: true,
                        active: true,
                        registration: RegistrationState::Roaming,
                    },
                ],
                slot_in_call: None,
                emergency_slot: None,
                auto_switch_engaged: false,
                auto_switch_failures: 0,
                outstanding_requests: 1,
                stats: ArbiterStats {
                    evaluations: 4,
                    preferred_changes: 1,
                    commands_sent: 2,
                    ..ArbiterStats::default()
                },
            }),
            recovery: Some(RecoverySnapshot {
                slot: Some(SlotId(1)),
                valid_network: false,
                recovery_triggered: true,
                current_action: RecoveryAction::RadioRestart,
                last_action: RecoveryAction::Cleanup,
                attempted_all_steps: false,
                stall_duration_ms: Some(1200),
                stats,
            }),
            updated_at: None,
        }
    }

    #[test]
    fn render_prometheus_contains_all_metrics() {
        let out = render_prometheus(&sample());
        assert!(out.contains("dualsim_preferred_slot{reason=\"manual\"} 1"));
        assert!(out.contains("dualsim_slot_active{slot=\"0\"} 0"));
        assert!(out.contains("dualsim_slot_active{slot=\"1\"} 1"));
        assert!(out.contains("dualsim_network_requests 1"));
        assert!(out.contains("dualsim_arbiter_commands_sent_total 2"));
        assert!(out.contains("dualsim_data_stalled 1"));
        assert!(out.contains("dualsim_recovery_action{action=\"radio_restart\"} 3"));
        assert!(out.contains("dualsim_recovery_actions_total{action=\"cleanup\"} 1"));
        assert!(out.contains("dualsim_recovery_actions_total{action=\"reset_modem\"} 0"));
        assert!(out.contains("dualsim_stall_duration_ms 1200"));
        assert!(out.contains("dualsim_stalls_total 1"));
    }

    #[test]
    fn render_prometheus_help_and_type() {
        let out = render_prometheus(&sample());
        for line in out.lines().filter(|l| l.starts_with("# TYPE")) {
            let name = line.split_whitespace().nth(2).unwrap();
            assert!(
                out.contains(&format!("# HELP {name} ")),
                "missing HELP for {name}"
            );
        }
    }

    #[test]
    fn render_prometheus_before_first_publish_is_empty() {
        assert!(render_prometheus(&TelemetrySnapshot::default()).is_empty());
    }

    #[test]
    fn telemetry_json_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&to_telemetry_json(&sample())).unwrap();
        assert_eq!(json["preferred"]["slot"], 1);
        assert_eq!(json["preferred"]["reason"], "manual");
        assert_eq!(json["preferred"]["mode"], "allow_data");
        assert_eq!(json["slots"].as_array().unwrap().len(), 2);
        assert_eq!(json["slots"][1]["registration"], "roaming");
        assert_eq!(json["recovery"]["stalled"], true);
        assert_eq!(json["recovery"]["stats"]["actions_executed"]["cleanup"], 1);
        assert!(json["timestamp_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn metrics_server_serves_prometheus() {
        let telemetry = Arc::new(Mutex::new(sample()));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::start(addr, telemetry).expect("server should start");

        thread::sleep(Duration::from_millis(100));

        let response = fetch(server.addr(), "/metrics");
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("text/plain"));
        assert!(response.contains("dualsim_preferred_slot"));

        server.stop();
    }

    #[test]
    fn metrics_server_404_on_wrong_path() {
        let telemetry = Arc::new(Mutex::new(TelemetrySnapshot::default()));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::start(addr, telemetry).expect("server should start");

        thread::sleep(Duration::from_millis(100));

        let response = fetch(server.addr(), "/");
        assert!(response.starts_with("HTTP/1.1 404"));

        server.stop();
    }

    #[test]
    fn metrics_server_dynamic_updates() {
        let telemetry = Arc::new(Mutex::new(TelemetrySnapshot::default()));
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server =
            MetricsServer::start(addr, telemetry.clone()).expect("server should start");

        thread::sleep(Duration::from_millis(100));

        let body1 = fetch(server.addr(), "/metrics");
        assert!(!body1.contains("dualsim_preferred_slot"));

        *telemetry.lock().unwrap() = sample();

        let body2 = fetch(server.addr(), "/metrics");
        assert!(body2.contains("dualsim_preferred_slot{reason=\"manual\"} 1"));

        let json = fetch(server.addr(), "/telemetry");
        assert!(json.contains("application/json"));
        assert!(json.contains("\"stalled\":true"));

        server.stop();
    }

    fn fetch(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect");
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
            .unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }
}
