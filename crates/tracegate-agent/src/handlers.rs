//! Applies one outbox event's payload to local state and reloads the
//! affected proxy process(es) if reconciliation actually changed something.
//! Grounded in the original `agent/handlers.py`.

use std::path::Path;
use std::sync::Mutex;

use serde_json::Value;
use tracegate_config::AgentConfig;
use tracegate_db::enums::OutboxEventType;

use crate::error::HandlerError;
use crate::reconcile::{
	self, reconcile_all, remove_connection_artifact_index, remove_user_artifact_index, remove_wg_peer_artifact_index, upsert_user_artifact_index,
	upsert_wg_peer_artifact_index, AgentPaths,
};
use crate::state::AgentStateStore;
use crate::system::{apply_files, run_command};

/// Serializes reload hooks so concurrent event handlers never interleave a
/// partially-applied Xray/Hysteria2/WireGuard reload.
static RELOAD_LOCK: Mutex<()> = Mutex::new(());

fn field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
	payload.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn require<'a>(payload: &'a Value, key: &str) -> Result<&'a str, HandlerError> {
	field(payload, key).ok_or_else(|| HandlerError::BadPayload(format!("missing field: {key}")))
}

fn run_reload_commands(dry_run: bool, commands: &[&str]) -> Result<(), HandlerError> {
	let mut failures = Vec::new();
	let _guard = RELOAD_LOCK.lock().unwrap();
	for cmd in commands.iter().filter(|c| !c.is_empty()) {
		let (ok, out) = run_command(cmd, dry_run);
		if ok {
			continue;
		}
		let mut details = out.trim().to_string();
		if details.is_empty() {
			details = "no output".to_string();
		}
		if details.len() > 400 {
			details.truncate(400);
			details.push_str("...");
		}
		failures.push(format!("{cmd}: {details}"));
	}
	if failures.is_empty() {
		Ok(())
	} else {
		Err(HandlerError::ReloadFailed(failures.join(" | ")))
	}
}

/// Per-aggregate last-writer-wins gate: `payload`'s `op_ts`, if present, is
/// compared against the newest `op_ts` already applied under any of `keys`.
/// An older write is rejected (caller should no-op rather than apply);
/// otherwise every key is raised to `op_ts` so a later, even-older write is
/// rejected in turn. Payloads with no `op_ts` (e.g. APPLY_BUNDLE) always pass.
async fn op_ts_admits(store: &AgentStateStore, keys: &[String], payload: &Value) -> Result<bool, HandlerError> {
	let Some(op_ts) = payload.get("op_ts").and_then(Value::as_i64) else {
		return Ok(true);
	};

	let mut newest_seen: Option<i64> = None;
	for key in keys {
		if let Some(seen) = store.last_op_ts(key).await? {
			newest_seen = Some(newest_seen.map_or(seen, |m| m.max(seen)));
		}
	}
	if newest_seen.is_some_and(|seen| op_ts < seen) {
		return Ok(false);
	}
	for key in keys {
		store.bump_op_ts(key, op_ts).await?;
	}
	Ok(true)
}

fn user_key(user_id: &str) -> String {
	format!("user:{user_id}")
}

fn connection_key(connection_id: &str) -> String {
	format!("conn:{connection_id}")
}

fn wg_key(peer_key: &str) -> String {
	format!("wg:{peer_key}")
}

async fn reload_after_reconcile(config: &AgentConfig, paths: &AgentPaths) -> Result<(), HandlerError> {
	let changed = reconcile_all(paths, config, &config.sni_seed_list()).await?;
	if changed.is_empty() {
		return Ok(());
	}
	let mut commands = Vec::new();
	if changed.contains(&"xray") {
		commands.push(config.reload_xray_cmd.as_str());
	}
	if changed.contains(&"hysteria") {
		commands.push(config.reload_hysteria_cmd.as_str());
	}
	if changed.contains(&"wireguard") {
		commands.push(config.reload_wg_cmd.as_str());
	}
	run_reload_commands(config.dry_run, &commands)
}

pub fn handle_apply_bundle(config: &AgentConfig, payload: &Value) -> Result<String, HandlerError> {
	let bundle_name = require(payload, "bundle_name")?;
	let files = payload.get("files").and_then(Value::as_object).ok_or_else(|| HandlerError::BadPayload("files must be an object".to_string()))?;

	let root = Path::new(&config.data_root).join("bundles").join(bundle_name);
	std::fs::create_dir_all(&root)?;
	apply_files(&root, files)?;

	let commands: Vec<&str> = payload.get("commands").and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_str).collect()).unwrap_or_default();
	let mut results = Vec::new();
	for cmd in &commands {
		let (ok, out) = run_command(cmd, config.dry_run);
		results.push(format!("{cmd}: {}: {out}", if ok { "ok" } else { "failed" }));
	}

	Ok(format!("bundle applied: {bundle_name}; files={}; commands={}", files.len(), results.len()))
}

pub async fn handle_upsert_user(config: &AgentConfig, store: &AgentStateStore, payload: &Value) -> Result<String, HandlerError> {
	for key in ["user_id", "connection_id", "revision_id", "config"] {
		require(payload, key).map_err(|_| HandlerError::BadPayload(format!("missing fields: {key}")))?;
	}
	let user_id = require(payload, "user_id")?;
	let connection_id = require(payload, "connection_id")?;

	let keys = [user_key(user_id), connection_key(connection_id)];
	if !op_ts_admits(store, &keys, payload).await? {
		return Ok(format!("ignored older upsert for connection={connection_id}"));
	}

	let paths = AgentPaths::new(Path::new(&config.data_root));
	let user_root = paths.user_dir(user_id);
	std::fs::create_dir_all(&user_root)?;
	let target = user_root.join(format!("connection-{connection_id}.json"));
	std::fs::write(&target, serde_json::to_string_pretty(payload).unwrap())?;
	upsert_user_artifact_index(&paths, payload);

	reload_after_reconcile(config, &paths).await?;
	Ok(format!("upserted user payload for user={user_id} connection={connection_id}"))
}

pub async fn handle_revoke_user(config: &AgentConfig, store: &AgentStateStore, payload: &Value) -> Result<String, HandlerError> {
	let user_id = require(payload, "user_id")?;

	let keys = [user_key(user_id)];
	if !op_ts_admits(store, &keys, payload).await? {
		return Ok(format!("ignored older revoke for user={user_id}"));
	}

	let paths = AgentPaths::new(Path::new(&config.data_root));
	let user_root = paths.user_dir(user_id);
	if user_root.exists() {
		std::fs::remove_dir_all(&user_root)?;
	}
	remove_user_artifact_index(&paths, user_id);

	reload_after_reconcile(config, &paths).await?;
	Ok(format!("revoked user artifacts for {user_id}"))
}

pub async fn handle_revoke_connection(config: &AgentConfig, store: &AgentStateStore, payload: &Value) -> Result<String, HandlerError> {
	let user_id = require(payload, "user_id")?;
	let connection_id = require(payload, "connection_id")?;

	let keys = [user_key(user_id), connection_key(connection_id)];
	if !op_ts_admits(store, &keys, payload).await? {
		return Ok(format!("ignored older revoke for connection={connection_id}"));
	}

	let paths = AgentPaths::new(Path::new(&config.data_root));
	let user_root = paths.user_dir(user_id);
	let target = user_root.join(format!("connection-{connection_id}.json"));
	if target.exists() {
		std::fs::remove_file(&target)?;
	}
	remove_connection_artifact_index(&paths, connection_id);
	if user_root.exists() && std::fs::read_dir(&user_root).map(|mut d| d.next().is_none()).unwrap_or(false) {
		let _ = std::fs::remove_dir(&user_root);
	}

	reload_after_reconcile(config, &paths).await?;
	Ok(format!("revoked connection artifacts for user={user_id} connection={connection_id}"))
}

fn wg_peer_key(payload: &Value) -> Result<String, HandlerError> {
	field(payload, "device_id").or_else(|| field(payload, "connection_id")).or_else(|| field(payload, "revision_id")).map(str::to_string).ok_or_else(|| {
		HandlerError::BadPayload("missing peer key".to_string())
	})
}

pub async fn handle_wg_peer_upsert(config: &AgentConfig, store: &AgentStateStore, payload: &Value) -> Result<String, HandlerError> {
	require(payload, "peer_public_key")?;
	require(payload, "peer_ip")?;
	let peer_key = wg_peer_key(payload)?;

	let keys = [wg_key(&peer_key)];
	if !op_ts_admits(store, &keys, payload).await? {
		return Ok(format!("ignored older upsert for wg peer={peer_key}"));
	}

	let paths = AgentPaths::new(Path::new(&config.data_root));
	std::fs::create_dir_all(&paths.wg_peers_dir)?;
	let target = paths.wg_peers_dir.join(format!("peer-{peer_key}.json"));
	std::fs::write(&target, serde_json::to_string_pretty(payload).unwrap())?;
	upsert_wg_peer_artifact_index(&paths, &peer_key, payload);

	let changed = reconcile::reconcile_all(&paths, config, &config.sni_seed_list()).await?;
	if changed.contains(&"wireguard") {
		run_reload_commands(config.dry_run, &[config.reload_wg_cmd.as_str()])?;
	}
	Ok(format!("wg peer upserted: {peer_key}"))
}

pub async fn handle_wg_peer_remove(config: &AgentConfig, store: &AgentStateStore, payload: &Value) -> Result<String, HandlerError> {
	let peer_key = wg_peer_key(payload)?;

	let keys = [wg_key(&peer_key)];
	if !op_ts_admits(store, &keys, payload).await? {
		return Ok(format!("ignored older revoke for wg peer={peer_key}"));
	}

	let paths = AgentPaths::new(Path::new(&config.data_root));
	let target = paths.wg_peers_dir.join(format!("peer-{peer_key}.json"));
	if target.exists() {
		std::fs::remove_file(&target)?;
	}
	remove_wg_peer_artifact_index(&paths, &peer_key);

	let changed = reconcile::reconcile_all(&paths, config, &config.sni_seed_list()).await?;
	if changed.contains(&"wireguard") {
		run_reload_commands(config.dry_run, &[config.reload_wg_cmd.as_str()])?;
	}
	Ok(format!("wg peer removed: {peer_key}"))
}

pub async fn dispatch_event(config: &AgentConfig, store: &AgentStateStore, event_type: OutboxEventType, payload: &Value) -> Result<String, HandlerError> {
	match event_type {
		OutboxEventType::ApplyBundle => handle_apply_bundle(config, payload),
		OutboxEventType::UpsertUser => handle_upsert_user(config, store, payload).await,
		OutboxEventType::RevokeUser => handle_revoke_user(config, store, payload).await,
		OutboxEventType::RevokeConnection => handle_revoke_connection(config, store, payload).await,
		OutboxEventType::WgPeerUpsert => handle_wg_peer_upsert(config, store, payload).await,
		OutboxEventType::WgPeerRemove => handle_wg_peer_remove(config, store, payload).await,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn config(root: &std::path::Path) -> AgentConfig {
		AgentConfig::test(root.to_string_lossy().into_owned())
	}

	async fn store(dir: &std::path::Path) -> AgentStateStore {
		AgentStateStore::open(dir).await.unwrap()
	}

	#[tokio::test]
	async fn upsert_then_revoke_user_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path());
		let st = store(dir.path()).await;
		let payload = json!({
			"user_id": "u1",
			"connection_id": "c1",
			"revision_id": "r1",
			"protocol": "vless_reality",
			"config": {"uuid": "11111111-1111-1111-1111-111111111111", "sni": "example.com"},
		});
		let msg = handle_upsert_user(&cfg, &st, &payload).await.unwrap();
		assert!(msg.contains("u1"));
		assert!(dir.path().join("users/u1/connection-c1.json").exists());

		handle_revoke_user(&cfg, &st, &json!({"user_id": "u1"})).await.unwrap();
		assert!(!dir.path().join("users/u1").exists());
	}

	#[test]
	fn apply_bundle_requires_bundle_name() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path());
		let err = handle_apply_bundle(&cfg, &json!({"files": {}})).unwrap_err();
		assert!(matches!(err, HandlerError::BadPayload(_)));
	}

	#[tokio::test]
	async fn out_of_order_revoke_then_upsert_is_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let cfg = config(dir.path());
		let st = store(dir.path()).await;

		handle_revoke_connection(&cfg, &st, &json!({"user_id": "u1", "connection_id": "c1", "op_ts": 200})).await.unwrap();

		let stale = json!({
			"user_id": "u1",
			"connection_id": "c1",
			"revision_id": "r1",
			"protocol": "vless_reality",
			"config": {"uuid": "11111111-1111-1111-1111-111111111111", "sni": "example.com"},
			"op_ts": 100,
		});
		let msg = handle_upsert_user(&cfg, &st, &stale).await.unwrap();
		assert!(msg.contains("ignored"), "expected an ignored-older-upsert message, got: {msg}");
		assert!(!dir.path().join("users/u1/connection-c1.json").exists());
	}
}
