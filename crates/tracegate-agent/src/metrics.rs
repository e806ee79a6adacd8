//! Prometheus text-exposition metrics for the agent: events handled and
//! reconcile outcomes, plus (VPS_T only) per-peer WireGuard traffic read
//! from `wg show <iface> dump`. Grounded in the original `agent/metrics.py`,
//! adapted to the `lazy_static!` + `prometheus` idiom used elsewhere in this
//! workspace rather than a custom `Collector`.

use std::path::Path;

use lazy_static::lazy_static;
use prometheus::{register_gauge_vec, register_int_counter_vec, Encoder, GaugeVec, IntCounterVec, TextEncoder};

lazy_static! {
	pub static ref EVENTS_RECEIVED: IntCounterVec = register_int_counter_vec!("tracegate_agent_events_received_total", "Events received by type", &["event_type"]).unwrap();
	pub static ref EVENTS_DUPLICATE: IntCounterVec =
		register_int_counter_vec!("tracegate_agent_events_duplicate_total", "Events recognized as already processed", &["event_type"]).unwrap();
	pub static ref EVENTS_FAILED: IntCounterVec = register_int_counter_vec!("tracegate_agent_events_failed_total", "Events that raised a handler error", &["event_type"]).unwrap();
	pub static ref RECONCILE_CHANGED: IntCounterVec =
		register_int_counter_vec!("tracegate_agent_reconcile_changed_total", "Reconcile passes that rewrote a runtime config", &["kind"]).unwrap();
	pub static ref WG_SCRAPE_OK: GaugeVec = register_gauge_vec!("tracegate_wg_scrape_ok", "WireGuard scrape status (1=ok, 0=error)", &[]).unwrap();
	pub static ref WG_PEER_RX_BYTES: GaugeVec =
		register_gauge_vec!("tracegate_wg_peer_rx_bytes", "WireGuard peer received bytes", &["user_id", "device_id", "peer_public_key"]).unwrap();
	pub static ref WG_PEER_TX_BYTES: GaugeVec =
		register_gauge_vec!("tracegate_wg_peer_tx_bytes", "WireGuard peer transmitted bytes", &["user_id", "device_id", "peer_public_key"]).unwrap();
	pub static ref WG_PEER_HANDSHAKE: GaugeVec = register_gauge_vec!(
		"tracegate_wg_peer_latest_handshake_seconds",
		"WireGuard peer latest handshake timestamp (unix seconds)",
		&["user_id", "device_id", "peer_public_key"]
	)
	.unwrap();
}

fn load_wg_peer_labels(root: &Path) -> std::collections::HashMap<String, (String, String)> {
	let mut out = std::collections::HashMap::new();
	let dir = root.join("wg-peers");
	let Ok(entries) = std::fs::read_dir(dir) else { return out };
	for entry in entries.flatten() {
		let Ok(raw) = std::fs::read_to_string(entry.path()) else { continue };
		let Ok(row) = serde_json::from_str::<serde_json::Value>(&raw) else { continue };
		let Some(pub_key) = row.get("peer_public_key").and_then(|v| v.as_str()) else { continue };
		if pub_key.is_empty() {
			continue;
		}
		let user_id = row.get("user_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
		let device_id = row.get("device_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
		out.insert(pub_key.to_string(), (user_id, device_id));
	}
	out
}

/// Parses `wg show <iface> dump`: first line is the interface, subsequent
/// tab-separated lines are peers (pubkey, psk, endpoint, allowed_ips,
/// latest_handshake, rx, tx, keepalive).
fn wg_dump(interface: &str) -> Option<Vec<Vec<String>>> {
	let output = std::process::Command::new("wg").arg("show").arg(interface).arg("dump").output().ok()?;
	if !output.status.success() {
		return None;
	}
	let text = String::from_utf8_lossy(&output.stdout);
	Some(text.lines().filter(|l| !l.trim().is_empty()).map(|l| l.split('\t').map(str::to_string).collect()).collect())
}

/// Refreshes the WireGuard gauges from `wg show <iface> dump`. Only
/// meaningful on VPS_T, where the call site gates on role.
pub fn refresh_wireguard_gauges(data_root: &Path, wg_interface: &str) {
	let peer_labels = load_wg_peer_labels(data_root);
	let Some(rows) = wg_dump(wg_interface) else {
		WG_SCRAPE_OK.with_label_values(&[]).set(0.0);
		return;
	};
	WG_SCRAPE_OK.with_label_values(&[]).set(1.0);

	for row in rows.iter().skip(1) {
		if row.len() < 7 {
			continue;
		}
		let peer_pub = row[0].trim();
		let latest_handshake: f64 = row[4].parse().unwrap_or(0.0);
		let rx: f64 = row[5].parse().unwrap_or(0.0);
		let tx: f64 = row[6].parse().unwrap_or(0.0);
		let (user_id, device_id) = peer_labels.get(peer_pub).cloned().unwrap_or_default();

		WG_PEER_RX_BYTES.with_label_values(&[&user_id, &device_id, peer_pub]).set(rx);
		WG_PEER_TX_BYTES.with_label_values(&[&user_id, &device_id, peer_pub]).set(tx);
		WG_PEER_HANDSHAKE.with_label_values(&[&user_id, &device_id, peer_pub]).set(latest_handshake);
	}
}

pub fn gather_text() -> Result<String, prometheus::Error> {
	let encoder = TextEncoder::new();
	let families = prometheus::gather();
	let mut buffer = Vec::new();
	encoder.encode(&families, &mut buffer)?;
	Ok(String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn counters_register_and_increment() {
		EVENTS_RECEIVED.with_label_values(&["UPSERT_USER"]).inc();
		let text = gather_text().unwrap();
		assert!(text.contains("tracegate_agent_events_received_total"));
	}
}
