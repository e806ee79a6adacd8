//! Renders the frozen "effective configuration" stored on a
//! `ConnectionRevision`, one function per protocol. Grounded in the
//! original `services/config_builder.py`'s `build_effective_config`.

use serde_json::{json, Value};

use crate::hysteria_markers::Marker;

/// REALITY camouflage material for one node (public key + short id), kept
/// opaque to this module — the caller resolves it from node configuration.
pub struct RealityMaterial {
	pub public_key: String,
	pub short_id: String,
}

pub struct WireguardPeerConfig {
	pub endpoint: String,
	pub listen_port: u16,
	pub interface_address: String,
	pub dns: Vec<String>,
	pub mtu: u32,
	pub server_public_key: String,
	pub allowed_ips: Vec<String>,
	pub preshared_key: Option<String>,
}

/// Direct variant uses `vps_t_material`; chain variant uses `vps_e_material`
/// and additionally carries a `chain` block forwarding to `vps_t_host`.
pub fn render_vless_reality(
	connection_id: &str,
	sni_fqdn: &str,
	is_chain: bool,
	vps_t_host: &str,
	vps_e_host: &str,
	vps_t_material: &RealityMaterial,
	vps_e_material: &RealityMaterial,
	overrides: &Value,
) -> Value {
	let (server, material) = if is_chain { (vps_e_host, vps_e_material) } else { (vps_t_host, vps_t_material) };

	let mut config = json!({
		"protocol": "vless",
		"transport": "reality",
		"port": 443,
		"uuid": connection_id,
		"sni": sni_fqdn,
		"server": server,
		"reality": {
			"public_key": material.public_key,
			"short_id": material.short_id,
		},
	});

	if is_chain {
		config["chain"] = json!({ "type": "tcp_forward", "upstream": vps_t_host, "port": 443 });
	}

	merge_overrides(&mut config, overrides);
	config
}

pub fn render_vless_ws_tls(connection_id: &str, vps_t_host: &str, tls_server_name: &str, ws_host: &str, ws_path: &str, overrides: &Value) -> Value {
	let mut config = json!({
		"protocol": "vless",
		"transport": "ws",
		"port": 443,
		"uuid": connection_id,
		"server": vps_t_host,
		"tls_server_name": tls_server_name,
		"ws_host": ws_host,
		"ws_path": ws_path,
	});
	merge_overrides(&mut config, overrides);
	config
}

pub fn render_hysteria2(device_id: &str, marker: &Marker, vps_t_host: &str, overrides: &Value) -> Value {
	let mut config = json!({
		"protocol": "hysteria2",
		"port": 443,
		"proto": "udp",
		"server": vps_t_host,
		"auth": {
			"username_aliases": marker.aliases(),
			"password": device_id,
		},
	});
	merge_overrides(&mut config, overrides);
	config
}

pub fn render_wireguard(peer: &WireguardPeerConfig, overrides: &Value) -> Value {
	let mut config = json!({
		"protocol": "wireguard",
		"port": 51820,
		"proto": "udp",
		"endpoint": peer.endpoint,
		"listen_port": peer.listen_port,
		"address": peer.interface_address,
		"dns": peer.dns,
		"mtu": peer.mtu,
		"server_public_key": peer.server_public_key,
		"allowed_ips": peer.allowed_ips,
	});
	if let Some(psk) = &peer.preshared_key {
		config["preshared_key"] = json!(psk);
	}
	merge_overrides(&mut config, overrides);
	config
}

/// Overrides have already passed `overrides::validate` for the protocol, so
/// they're merged in last and win over the rendered defaults.
fn merge_overrides(config: &mut Value, overrides: &Value) {
	if let (Some(target), Some(source)) = (config.as_object_mut(), overrides.as_object()) {
		for (key, value) in source {
			target.insert(key.clone(), value.clone());
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reality_direct_uses_vps_t_material_and_no_chain() {
		let vps_t = RealityMaterial { public_key: "tpk".into(), short_id: "tsid".into() };
		let vps_e = RealityMaterial { public_key: "epk".into(), short_id: "esid".into() };
		let cfg = render_vless_reality("conn-1", "splitter.wb.ru", false, "vps-t.example", "vps-e.example", &vps_t, &vps_e, &json!({}));
		assert_eq!(cfg["server"], "vps-t.example");
		assert_eq!(cfg["reality"]["public_key"], "tpk");
		assert!(cfg.get("chain").is_none());
	}

	#[test]
	fn reality_chain_uses_vps_e_material_and_carries_chain() {
		let vps_t = RealityMaterial { public_key: "tpk".into(), short_id: "tsid".into() };
		let vps_e = RealityMaterial { public_key: "epk".into(), short_id: "esid".into() };
		let cfg = render_vless_reality("conn-1", "splitter.wb.ru", true, "vps-t.example", "vps-e.example", &vps_t, &vps_e, &json!({}));
		assert_eq!(cfg["server"], "vps-e.example");
		assert_eq!(cfg["reality"]["public_key"], "epk");
		assert_eq!(cfg["chain"]["upstream"], "vps-t.example");
	}

	#[test]
	fn overrides_win_over_defaults() {
		let cfg = render_hysteria2("dev-1", &Marker { variant: "3".into(), user_id: "1".into(), connection_id: "c1".into() }, "vps-t.example", &json!({"up_mbps": 200}));
		assert_eq!(cfg["up_mbps"], 200);
	}
}
