//! Filesystem and process primitives the handlers and reconciler build on:
//! atomic writes, reload-command execution, and the role-appropriate health
//! probes. Grounded in the original `agent/system.py`.

use std::path::{Path, PathBuf};

use crate::error::HandlerError;

fn safe_path(root: &Path, relative: &str) -> Result<PathBuf, HandlerError> {
	let joined = root.join(relative);
	if joined.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
		return Err(HandlerError::BadPayload(format!("unsafe path outside root: {relative}")));
	}
	Ok(joined)
}

/// Writes `content` to `root/relative` via a temp-file-then-rename, so a
/// concurrent reader never observes a partially written file.
pub fn atomic_write(root: &Path, relative: &str, content: &str) -> Result<(), HandlerError> {
	let path = safe_path(root, relative)?;
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let mut tmp_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact").to_string();
	tmp_name.push_str(".tmp");
	let tmp = path.with_file_name(tmp_name);
	std::fs::write(&tmp, content)?;
	std::fs::rename(&tmp, &path)?;
	Ok(())
}

pub fn apply_files(root: &Path, files: &serde_json::Map<String, serde_json::Value>) -> Result<(), HandlerError> {
	for (relative, value) in files {
		let content = value.as_str().ok_or_else(|| HandlerError::BadPayload(format!("file content for {relative} must be a string")))?;
		atomic_write(root, relative, content)?;
	}
	Ok(())
}

/// Runs `cmd` via the shell, unless `dry_run`, in which case it's a no-op
/// that still reports success.
pub fn run_command(cmd: &str, dry_run: bool) -> (bool, String) {
	if dry_run {
		return (true, format!("dry-run: {cmd}"));
	}
	match std::process::Command::new("sh").arg("-c").arg(cmd).output() {
		Ok(output) => {
			let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
			combined.push('\n');
			combined.push_str(&String::from_utf8_lossy(&output.stderr));
			(output.status.success(), combined.trim().to_string())
		}
		Err(e) => (false, e.to_string()),
	}
}

pub struct HealthCheckResult {
	pub name: String,
	pub ok: bool,
	pub details: String,
}

fn check_port(protocol: &str, port: u16) -> HealthCheckResult {
	let flag = if protocol == "tcp" { "-ltn" } else { "-lun" };
	let name = format!("listen {protocol}/{port}");
	match std::process::Command::new("ss").arg(flag).output() {
		Ok(output) if output.status.success() => {
			let text = String::from_utf8_lossy(&output.stdout);
			let needle = format!(":{port}");
			match text.lines().find(|line| line.contains(&needle)) {
				Some(line) => HealthCheckResult { name, ok: true, details: line.trim().to_string() },
				None => HealthCheckResult { name, ok: false, details: format!("{protocol}/{port} is not listening") },
			}
		}
		Ok(output) => HealthCheckResult { name, ok: false, details: format!("cannot run ss: {}", String::from_utf8_lossy(&output.stderr).trim()) },
		Err(e) => HealthCheckResult { name, ok: false, details: format!("cannot run ss: {e}") },
	}
}

fn check_process(process_name: &str) -> HealthCheckResult {
	let name = format!("process {process_name}");
	match std::process::Command::new("pgrep").arg("-fa").arg(process_name).output() {
		Ok(output) if output.status.success() => {
			let text = String::from_utf8_lossy(&output.stdout);
			let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or(process_name).trim().to_string();
			HealthCheckResult { name, ok: true, details: first }
		}
		Ok(_) => HealthCheckResult { name, ok: false, details: format!("process '{process_name}' not found") },
		Err(_) => HealthCheckResult { name, ok: false, details: "pgrep not found".to_string() },
	}
}

async fn check_hysteria_stats_secret(url: &str, secret: &str) -> HealthCheckResult {
	let name = "hysteria stats API auth".to_string();
	if url.is_empty() {
		return HealthCheckResult { name, ok: false, details: "no stats URL configured".to_string() };
	}
	let client = reqwest::Client::new();
	let unauthorized = client.get(url).timeout(std::time::Duration::from_secs(5)).send().await;
	let authorized = client.get(url).header("Authorization", secret).timeout(std::time::Duration::from_secs(5)).send().await;

	match (unauthorized, authorized) {
		(Ok(u), Ok(a)) => {
			let unauthorized_ok = matches!(u.status().as_u16(), 401 | 403);
			let authorized_ok = a.status().as_u16() < 400;
			HealthCheckResult { name, ok: unauthorized_ok && authorized_ok, details: format!("unauth={}, auth={}", u.status(), a.status()) }
		}
		(Err(e), _) | (_, Err(e)) => HealthCheckResult { name, ok: false, details: e.to_string() },
	}
}

fn check_wg_listen_port(interface: &str, expected: u16) -> HealthCheckResult {
	let name = "wireguard listen-port policy".to_string();
	match std::process::Command::new("wg").arg("show").arg(interface).arg("listen-port").output() {
		Ok(output) if output.status.success() => {
			let actual = String::from_utf8_lossy(&output.stdout).trim().to_string();
			let ok = actual == expected.to_string();
			HealthCheckResult { name, ok, details: format!("expected={expected}, actual={actual}") }
		}
		Ok(output) => HealthCheckResult { name, ok: false, details: String::from_utf8_lossy(&output.stderr).trim().to_string() },
		Err(_) => HealthCheckResult { name, ok: false, details: "wg not found".to_string() },
	}
}

/// Runs the role-appropriate subset of probes. VPS_T carries the Hysteria2
/// and WireGuard specific checks; every role gets the shared TCP/443 +
/// process-presence checks.
pub async fn gather_health_checks(stats_url: &str, stats_secret: &str, wg_interface: &str, wg_port: u16, role: &str) -> Vec<HealthCheckResult> {
	let mut checks = Vec::new();

	checks.push(check_port("tcp", 443));
	if role == "VPS_T" {
		checks.push(check_port("udp", 443));
		checks.push(check_port("udp", wg_port));
	}

	if role == "VPS_E" {
		let x = check_process("xray");
		let h = check_process("haproxy");
		let ok = x.ok || h.ok;
		let details = if x.ok { x.details.clone() } else { h.details.clone() };
		checks.push(HealthCheckResult { name: "process entry".to_string(), ok, details });
	} else {
		checks.push(check_process("xray"));
		checks.push(check_process("hysteria"));
	}

	if role == "VPS_T" {
		checks.push(check_hysteria_stats_secret(stats_url, stats_secret).await);
		checks.push(check_wg_listen_port(wg_interface, wg_port));
	}

	checks
}
