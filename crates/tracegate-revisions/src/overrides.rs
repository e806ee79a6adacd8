//! Per-protocol override allow/deny validation for `Connection.custom_overrides_json`.
//! Grounded in the original `services/overrides.py`, with the `vless_ws_tls`
//! branch added: the original has no case for it and always raises, a gap
//! fixed here (see the open-question resolution recorded in `DESIGN.md`).

use std::collections::HashSet;

use tracegate_db::enums::ConnectionProtocol;

#[derive(thiserror::Error, Debug)]
pub enum OverrideError {
	#[error("override key '{0}' is not recognized for this protocol")]
	Unknown(String),

	#[error("override key '{0}' is forbidden for this protocol")]
	Forbidden(String),

	#[error("overrides must be a JSON object")]
	NotAnObject,
}

struct Rule {
	allowed: &'static [&'static str],
	forbidden: &'static [&'static str],
}

fn rule_for(protocol: ConnectionProtocol) -> Rule {
	match protocol {
		ConnectionProtocol::VlessReality => Rule {
			allowed: &["mode", "camouflage_sni_id", "connect_timeout_ms", "dial_timeout_ms", "local_socks_port", "tcp_fast_open"],
			forbidden: &["port", "server_port", "reality_server_port", "chain_sni"],
		},
		ConnectionProtocol::VlessWsTls => {
			Rule { allowed: &["mode", "connect_timeout_ms", "dial_timeout_ms", "local_socks_port", "tcp_fast_open"], forbidden: &["port", "server_port", "ws_path", "tls_server_name"] }
		}
		ConnectionProtocol::Hysteria2 => Rule {
			allowed: &["client_mode", "up_mbps", "down_mbps", "socks_listen", "http_listen"],
			forbidden: &["masquerade", "traffic_stats_secret", "disable_stats_auth", "server_port", "port"],
		},
		ConnectionProtocol::Wireguard => {
			Rule { allowed: &["dns", "mtu", "persistent_keepalive", "allowed_ips"], forbidden: &["listen_port", "endpoint_port", "server_port"] }
		}
	}
}

pub fn validate(protocol: ConnectionProtocol, overrides: &serde_json::Value) -> Result<(), OverrideError> {
	let object = overrides.as_object().ok_or(OverrideError::NotAnObject)?;
	let rule = rule_for(protocol);
	let allowed: HashSet<&str> = rule.allowed.iter().copied().collect();
	let forbidden: HashSet<&str> = rule.forbidden.iter().copied().collect();

	for key in object.keys() {
		if forbidden.contains(key.as_str()) {
			return Err(OverrideError::Forbidden(key.clone()));
		}
		if !allowed.contains(key.as_str()) {
			return Err(OverrideError::Unknown(key.clone()));
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn accepts_allowed_keys() {
		assert!(validate(ConnectionProtocol::VlessReality, &json!({"connect_timeout_ms": 500})).is_ok());
	}

	#[test]
	fn rejects_forbidden_port_override() {
		assert!(matches!(validate(ConnectionProtocol::Hysteria2, &json!({"server_port": 1234})), Err(OverrideError::Forbidden(_))));
	}

	#[test]
	fn rejects_unknown_key() {
		assert!(matches!(validate(ConnectionProtocol::Wireguard, &json!({"bogus": 1})), Err(OverrideError::Unknown(_))));
	}

	#[test]
	fn vless_ws_tls_now_has_a_table_instead_of_always_failing() {
		assert!(validate(ConnectionProtocol::VlessWsTls, &json!({"tcp_fast_open": true})).is_ok());
		assert!(matches!(validate(ConnectionProtocol::VlessWsTls, &json!({"ws_path": "/x"})), Err(OverrideError::Forbidden(_))));
	}
}
