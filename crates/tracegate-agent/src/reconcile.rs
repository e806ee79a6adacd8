//! Rebuilds on-disk Xray/Hysteria2/WireGuard runtime configuration from the
//! base templates plus the artifact index, writing only on real change so
//! reload commands aren't triggered spuriously. Grounded in the original
//! `agent/reconcile.py`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::{json, Value};

use crate::error::HandlerError;
use crate::system::atomic_write;

const INDEX_FILE_NAME: &str = "artifact-index.json";

static INDEX_LOCK: Mutex<()> = Mutex::new(());

#[derive(Clone)]
pub struct AgentPaths {
	pub root: PathBuf,
	pub base: PathBuf,
	pub runtime: PathBuf,
	pub users_dir: PathBuf,
	pub wg_peers_dir: PathBuf,
}

impl AgentPaths {
	pub fn new(root: &Path) -> Self {
		Self { root: root.to_path_buf(), base: root.join("base"), runtime: root.join("runtime"), users_dir: root.join("users"), wg_peers_dir: root.join("wg-peers") }
	}

	pub fn user_dir(&self, user_id: &str) -> PathBuf {
		self.users_dir.join(user_id)
	}

	/// Creates every directory the agent writes under its data root so a
	/// fresh node doesn't fail its first event on a missing parent.
	pub fn ensure_dirs(&self) -> std::io::Result<()> {
		for dir in [&self.base, &self.runtime, &self.users_dir, &self.wg_peers_dir, &self.root.join("bundles"), &self.root.join("events")] {
			std::fs::create_dir_all(dir)?;
		}
		Ok(())
	}
}

#[derive(Default, serde::Serialize, serde::Deserialize)]
struct ArtifactIndex {
	users: BTreeMap<String, Value>,
	wg_peers: BTreeMap<String, Value>,
}

fn index_path(paths: &AgentPaths) -> PathBuf {
	paths.runtime.join(INDEX_FILE_NAME)
}

fn load_index(paths: &AgentPaths) -> Option<ArtifactIndex> {
	let path = index_path(paths);
	let raw = std::fs::read_to_string(path).ok()?;
	serde_json::from_str(&raw).ok()
}

fn scan_user_artifacts(paths: &AgentPaths) -> BTreeMap<String, Value> {
	let mut out = BTreeMap::new();
	let Ok(entries) = walk_json_files(&paths.users_dir, "connection-") else { return out };
	for path in entries {
		let Ok(raw) = std::fs::read_to_string(&path) else { continue };
		let Ok(row) = serde_json::from_str::<Value>(&raw) else { continue };
		let connection_id = row.get("connection_id").and_then(Value::as_str).unwrap_or("").trim().to_string();
		if connection_id.is_empty() {
			continue;
		}
		out.insert(connection_id, row);
	}
	out
}

fn scan_wg_peer_artifacts(paths: &AgentPaths) -> BTreeMap<String, Value> {
	let mut out = BTreeMap::new();
	let Ok(dir) = std::fs::read_dir(&paths.wg_peers_dir) else { return out };
	for entry in dir.flatten() {
		let path = entry.path();
		let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
		let Some(key) = stem.strip_prefix("peer-") else { continue };
		if key.is_empty() {
			continue;
		}
		let Ok(raw) = std::fs::read_to_string(&path) else { continue };
		let Ok(row) = serde_json::from_str::<Value>(&raw) else { continue };
		out.insert(key.to_string(), row);
	}
	out
}

fn walk_json_files(root: &Path, prefix: &str) -> std::io::Result<Vec<PathBuf>> {
	let mut out = Vec::new();
	if !root.exists() {
		return Ok(out);
	}
	for entry in std::fs::read_dir(root)? {
		let entry = entry?;
		let path = entry.path();
		if path.is_dir() {
			out.extend(walk_json_files(&path, prefix)?);
		} else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
			if name.starts_with(prefix) && name.ends_with(".json") {
				out.push(path);
			}
		}
	}
	Ok(out)
}

fn rebuild_index(paths: &AgentPaths) -> ArtifactIndex {
	let index = ArtifactIndex { users: scan_user_artifacts(paths), wg_peers: scan_wg_peer_artifacts(paths) };
	save_index(paths, &index);
	index
}

fn save_index(paths: &AgentPaths, index: &ArtifactIndex) {
	if let Ok(text) = serde_json::to_string_pretty(index) {
		let relative = index_path(paths).strip_prefix(&paths.root).unwrap_or(Path::new(INDEX_FILE_NAME)).to_string_lossy().into_owned();
		let _ = atomic_write(&paths.root, &relative, &text);
	}
}

fn ensure_index(paths: &AgentPaths) -> ArtifactIndex {
	load_index(paths).unwrap_or_else(|| rebuild_index(paths))
}

pub fn load_all_user_artifacts(paths: &AgentPaths) -> Vec<Value> {
	let _guard = INDEX_LOCK.lock().unwrap();
	ensure_index(paths).users.into_values().collect()
}

pub fn load_all_wg_peer_artifacts(paths: &AgentPaths) -> Vec<Value> {
	let _guard = INDEX_LOCK.lock().unwrap();
	ensure_index(paths).wg_peers.into_values().collect()
}

pub fn upsert_user_artifact_index(paths: &AgentPaths, payload: &Value) {
	let connection_id = payload.get("connection_id").and_then(Value::as_str).unwrap_or("").trim().to_string();
	if connection_id.is_empty() {
		return;
	}
	let _guard = INDEX_LOCK.lock().unwrap();
	let mut index = ensure_index(paths);
	index.users.insert(connection_id, payload.clone());
	save_index(paths, &index);
}

pub fn remove_user_artifact_index(paths: &AgentPaths, user_id: &str) {
	let _guard = INDEX_LOCK.lock().unwrap();
	let mut index = ensure_index(paths);
	index.users.retain(|_, value| value.get("user_id").and_then(Value::as_str) != Some(user_id));
	save_index(paths, &index);
}

pub fn remove_connection_artifact_index(paths: &AgentPaths, connection_id: &str) {
	let _guard = INDEX_LOCK.lock().unwrap();
	let mut index = ensure_index(paths);
	index.users.remove(connection_id);
	save_index(paths, &index);
}

pub fn upsert_wg_peer_artifact_index(paths: &AgentPaths, peer_key: &str, payload: &Value) {
	let _guard = INDEX_LOCK.lock().unwrap();
	let mut index = ensure_index(paths);
	index.wg_peers.insert(peer_key.to_string(), payload.clone());
	save_index(paths, &index);
}

pub fn remove_wg_peer_artifact_index(paths: &AgentPaths, peer_key: &str) {
	let _guard = INDEX_LOCK.lock().unwrap();
	let mut index = ensure_index(paths);
	index.wg_peers.remove(peer_key);
	save_index(paths, &index);
}

fn merge_clients(existing: &[Value], dynamic: &[Value]) -> Vec<Value> {
	let mut out: BTreeMap<String, Value> = BTreeMap::new();
	for row in existing {
		if let Some(id) = row.get("id").and_then(Value::as_str) {
			if !id.is_empty() {
				out.insert(id.to_string(), row.clone());
			}
		}
	}
	for row in dynamic {
		if let Some(id) = row.get("id").and_then(Value::as_str) {
			if !id.is_empty() {
				out.insert(id.to_string(), row.clone());
			}
		}
	}
	out.into_values().collect()
}

/// Rewrites the Xray runtime config's REALITY/WS inbounds' client lists from
/// the on-disk user artifacts. Returns whether the runtime file changed,
/// plus the desired email->uuid membership per managed inbound tag (for the
/// caller to apply live via the Xray gRPC control API when enabled).
pub fn reconcile_xray(paths: &AgentPaths, sni_seed: &[String]) -> Result<(bool, BTreeMap<String, BTreeMap<String, String>>), HandlerError> {
	let base_path = paths.base.join("xray").join("config.json");
	if !base_path.exists() {
		return Ok((false, BTreeMap::new()));
	}
	let base_text = std::fs::read_to_string(&base_path)?;
	let mut base: Value = serde_json::from_str(&base_text).map_err(|e| HandlerError::BadPayload(e.to_string()))?;

	let artifacts = load_all_user_artifacts(paths);
	let mut clients_reality = Vec::new();
	let mut clients_ws = Vec::new();
	let mut server_names: std::collections::BTreeSet<String> = sni_seed.iter().filter(|s| !s.is_empty()).cloned().collect();

	for row in &artifacts {
		let protocol = row.get("protocol").and_then(Value::as_str).unwrap_or("").to_lowercase();
		if protocol != "vless_reality" && protocol != "vless_ws_tls" {
			continue;
		}
		let cfg = row.get("config").cloned().unwrap_or_else(|| json!({}));
		let Some(uuid) = cfg.get("uuid").and_then(Value::as_str) else { continue };
		let email = format!("{}:{}", row.get("user_id").and_then(Value::as_str).unwrap_or(""), row.get("connection_id").and_then(Value::as_str).unwrap_or(""));
		if protocol == "vless_reality" {
			if let Some(sni) = cfg.get("sni").and_then(Value::as_str) {
				if !sni.is_empty() {
					server_names.insert(sni.to_string());
				}
			}
			clients_reality.push(json!({"id": uuid, "email": email}));
		} else {
			clients_ws.push(json!({"id": uuid, "email": email}));
		}
	}
	clients_reality.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));
	clients_ws.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

	let managed_reality_tags = ["vless-reality-in", "entry-in"];
	let managed_ws_tags = ["vless-ws-in"];
	let mut desired_by_tag: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();

	let inbounds = base.get_mut("inbounds").and_then(Value::as_array_mut);
	if let Some(inbounds) = inbounds {
		let has_tagged_reality = inbounds.iter().any(|i| managed_reality_tags.contains(&i.get("tag").and_then(Value::as_str).unwrap_or("")));
		let has_tagged_ws = inbounds.iter().any(|i| managed_ws_tags.contains(&i.get("tag").and_then(Value::as_str).unwrap_or("")));

		for inbound in inbounds.iter_mut() {
			let tag = inbound.get("tag").and_then(Value::as_str).unwrap_or("").to_string();
			let protocol = inbound.get("protocol").and_then(Value::as_str).unwrap_or("").to_string();
			let stream = inbound.get("streamSettings").cloned().unwrap_or_else(|| json!({}));
			let is_reality = protocol == "vless" && stream.get("security").and_then(Value::as_str) == Some("reality");
			let network = stream.get("network").and_then(Value::as_str).unwrap_or("").to_lowercase();
			let is_ws = protocol == "vless" && network == "ws";

			if is_reality {
				let should_manage = if has_tagged_reality { managed_reality_tags.contains(&tag.as_str()) } else { true };
				if !should_manage {
					continue;
				}
				let existing: Vec<Value> = inbound.get("settings").and_then(|s| s.get("clients")).and_then(Value::as_array).cloned().unwrap_or_default();
				let merged = merge_clients(&existing, &clients_reality);
				inbound["settings"]["clients"] = json!(merged);
				if !server_names.is_empty() {
					let existing_names: Vec<String> =
						inbound.get("streamSettings").and_then(|s| s.get("realitySettings")).and_then(|r| r.get("serverNames")).and_then(Value::as_array).map(|a| {
							a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect()
						}).unwrap_or_default();
					let mut all: std::collections::BTreeSet<String> = existing_names.into_iter().collect();
					all.extend(server_names.iter().cloned());
					let mut sorted: Vec<String> = all.into_iter().collect();
					sorted.sort_by_key(|s| s.to_lowercase());
					inbound["streamSettings"]["realitySettings"]["serverNames"] = json!(sorted);
				}
				if !tag.is_empty() {
					desired_by_tag.insert(tag.clone(), desired_from_clients(&merged));
				}
			} else if is_ws {
				let should_manage = if has_tagged_ws { managed_ws_tags.contains(&tag.as_str()) } else { true };
				if !should_manage {
					continue;
				}
				let existing: Vec<Value> = inbound.get("settings").and_then(|s| s.get("clients")).and_then(Value::as_array).cloned().unwrap_or_default();
				let merged = merge_clients(&existing, &clients_ws);
				inbound["settings"]["clients"] = json!(merged);
				if !tag.is_empty() {
					desired_by_tag.insert(tag.clone(), desired_from_clients(&merged));
				}
			}
		}
	}

	let runtime_path = paths.runtime.join("xray").join("config.json");
	let current: Option<Value> = std::fs::read_to_string(&runtime_path).ok().and_then(|t| serde_json::from_str(&t).ok());
	let should_write = current.as_ref() != Some(&base);
	if should_write {
		let relative = runtime_path.strip_prefix(&paths.root).unwrap().to_string_lossy().into_owned();
		atomic_write(&paths.root, &relative, &serde_json::to_string_pretty(&base).unwrap())?;
	}
	Ok((should_write, desired_by_tag))
}

fn desired_from_clients(clients: &[Value]) -> BTreeMap<String, String> {
	let mut desired = BTreeMap::new();
	for row in clients {
		let email = row.get("email").and_then(Value::as_str).unwrap_or("").trim().to_string();
		let id = row.get("id").and_then(Value::as_str).unwrap_or("").trim().to_string();
		if !email.is_empty() && !id.is_empty() {
			desired.insert(email, id);
		}
	}
	desired
}

/// Rewrites the Hysteria2 runtime config's `auth.userpass` map from on-disk
/// user artifacts. Both username spellings in `username_aliases` map to the
/// same password so either client alias authenticates.
pub fn reconcile_hysteria(paths: &AgentPaths) -> Result<bool, HandlerError> {
	let base_path = paths.base.join("hysteria").join("config.yaml");
	if !base_path.exists() {
		return Ok(false);
	}
	let base_text = std::fs::read_to_string(&base_path)?;
	let mut base: serde_yaml::Value = serde_yaml::from_str(&base_text).map_err(|e| HandlerError::BadPayload(e.to_string()))?;

	let artifacts = load_all_user_artifacts(paths);
	let mut userpass: BTreeMap<String, String> = BTreeMap::new();
	for row in &artifacts {
		if row.get("protocol").and_then(Value::as_str) != Some("hysteria2") {
			continue;
		}
		let auth = row.get("config").and_then(|c| c.get("auth")).cloned().unwrap_or_else(|| json!({}));
		let password = auth.get("password").and_then(Value::as_str).unwrap_or("").trim().to_string();
		let aliases = auth.get("username_aliases").and_then(Value::as_array).cloned().unwrap_or_default();
		if password.is_empty() {
			continue;
		}
		for alias in aliases {
			if let Some(username) = alias.as_str() {
				if !username.is_empty() {
					userpass.insert(username.to_string(), password.clone());
				}
			}
		}
	}

	let userpass_yaml: serde_yaml::Value = serde_yaml::to_value(&userpass).unwrap();
	let mut auth_map = serde_yaml::Mapping::new();
	auth_map.insert(serde_yaml::Value::String("type".into()), serde_yaml::Value::String("userpass".into()));
	auth_map.insert(serde_yaml::Value::String("userpass".into()), userpass_yaml);
	if let serde_yaml::Value::Mapping(map) = &mut base {
		map.insert(serde_yaml::Value::String("auth".into()), serde_yaml::Value::Mapping(auth_map));
	}

	let runtime_path = paths.runtime.join("hysteria").join("config.yaml");
	let current: Option<serde_yaml::Value> = std::fs::read_to_string(&runtime_path).ok().and_then(|t| serde_yaml::from_str(&t).ok());
	if current.as_ref() == Some(&base) {
		return Ok(false);
	}
	let rendered = serde_yaml::to_string(&base).map_err(|e| HandlerError::BadPayload(e.to_string()))?;
	let relative = runtime_path.strip_prefix(&paths.root).unwrap().to_string_lossy().into_owned();
	atomic_write(&paths.root, &relative, &rendered)?;
	Ok(true)
}

/// Rewrites the WireGuard server config's `[Peer]` blocks from on-disk peer
/// artifacts, keeping the `[Interface]` header from the base template
/// verbatim. VPS_E never runs this (role gate lives in the caller).
pub fn reconcile_wireguard(paths: &AgentPaths) -> Result<bool, HandlerError> {
	let base_path = paths.base.join("wireguard").join("wg0.conf");
	if !base_path.exists() {
		return Ok(false);
	}
	let base_text = std::fs::read_to_string(&base_path)?;
	let mut interface_lines = Vec::new();
	for line in base_text.lines() {
		if line.trim_start().starts_with("[Peer]") {
			break;
		}
		interface_lines.push(line);
	}
	let mut out = interface_lines.join("\n").trim_end().to_string();
	out.push_str("\n\n");

	let artifacts = load_all_wg_peer_artifacts(paths);
	let mut peers: Vec<(String, Option<String>, String)> = Vec::new();
	for row in &artifacts {
		let peer_public_key = row.get("peer_public_key").and_then(Value::as_str).unwrap_or("").trim().to_string();
		let peer_ip = row.get("peer_ip").and_then(Value::as_str).unwrap_or("").trim().to_string();
		if peer_public_key.is_empty() || peer_ip.is_empty() {
			continue;
		}
		let psk = row.get("preshared_key").and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
		peers.push((peer_public_key, psk, peer_ip));
	}
	peers.sort_by(|a, b| (&a.2, &a.0).cmp(&(&b.2, &b.0)));

	for (pub_key, psk, ip) in &peers {
		out.push_str("[Peer]\n");
		out.push_str(&format!("PublicKey = {pub_key}\n"));
		if let Some(psk) = psk {
			out.push_str(&format!("PresharedKey = {psk}\n"));
		}
		out.push_str(&format!("AllowedIPs = {ip}/32\n\n"));
	}

	let runtime_path = paths.runtime.join("wireguard").join("wg0.conf");
	let current = std::fs::read_to_string(&runtime_path).ok();
	if current.as_deref() == Some(out.as_str()) {
		return Ok(false);
	}
	let relative = runtime_path.strip_prefix(&paths.root).unwrap().to_string_lossy().into_owned();
	atomic_write(&paths.root, &relative, &out)?;
	Ok(true)
}

/// Runs every protocol's reconciler and, when `config.xray_api_enabled`,
/// applies the Xray inbound membership live via gRPC instead of waiting for
/// a process restart to pick up the rewritten runtime file.
pub async fn reconcile_all(paths: &AgentPaths, config: &tracegate_config::AgentConfig, sni_seed: &[String]) -> Result<Vec<&'static str>, HandlerError> {
	let mut changed = Vec::new();
	let (xray_changed, desired_by_tag) = reconcile_xray(paths, sni_seed)?;
	if xray_changed {
		changed.push("xray");
	}
	if config.xray_api_enabled {
		for (tag, desired) in &desired_by_tag {
			if let Err(e) = crate::xray_api::sync_inbound_users(config, tag, desired).await {
				tracing::warn!(inbound = %tag, error = %e, "live xray apply failed");
			}
		}
	}
	if config.role == "VPS_T" {
		if reconcile_hysteria(paths)? {
			changed.push("hysteria");
		}
		if reconcile_wireguard(paths)? {
			changed.push("wireguard");
		}
	}
	Ok(changed)
}
