//! Live-apply transport for Xray's local gRPC control API
//! (`xray.app.proxyman.command.HandlerService` and
//! `xray.app.stats.command.StatsService`). Grounded in the original
//! `agent/xray_api.py`. Rather than generating full client stubs from the
//! upstream `.proto` files at build time, this hand-maintains the narrow
//! slice of message types the agent actually calls, in the same shape
//! `tonic-build` would produce, and drives them through
//! `tonic::client::Grpc::unary` directly.

use std::collections::BTreeMap;
use std::time::Duration;

use prost::Message;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::transport::Channel;
use tonic::IntoRequest;

use tracegate_config::AgentConfig;

#[derive(thiserror::Error, Debug)]
pub enum XrayApiError {
	#[error("xray control channel error: {0}")]
	Transport(#[from] tonic::transport::Error),

	#[error("xray control call failed: {0}")]
	Rpc(#[from] tonic::Status),

	#[error("inbound not found: {0}")]
	InboundMissing(String),
}

#[derive(Clone, PartialEq, Message)]
pub struct TypedMessage {
	#[prost(string, tag = "1")]
	pub r#type: String,
	#[prost(bytes = "vec", tag = "2")]
	pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VlessAccount {
	#[prost(string, tag = "1")]
	pub id: String,
	#[prost(string, tag = "3")]
	pub encryption: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct User {
	#[prost(uint32, tag = "2")]
	pub level: u32,
	#[prost(string, tag = "3")]
	pub email: String,
	#[prost(message, optional, tag = "4")]
	pub account: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetInboundUserRequest {
	#[prost(string, tag = "1")]
	pub tag: String,
	#[prost(string, tag = "2")]
	pub email: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetInboundUserResponse {
	#[prost(message, repeated, tag = "1")]
	pub users: Vec<User>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddUserOperation {
	#[prost(message, optional, tag = "1")]
	pub user: Option<User>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoveUserOperation {
	#[prost(string, tag = "1")]
	pub email: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundRequest {
	#[prost(string, tag = "1")]
	pub tag: String,
	#[prost(message, optional, tag = "2")]
	pub operation: Option<TypedMessage>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AlterInboundResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsRequest {
	#[prost(string, tag = "1")]
	pub pattern: String,
	#[prost(bool, tag = "2")]
	pub reset: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Stat {
	#[prost(string, tag = "1")]
	pub name: String,
	#[prost(int64, tag = "2")]
	pub value: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct QueryStatsResponse {
	#[prost(message, repeated, tag = "1")]
	pub stat: Vec<Stat>,
}

async fn channel(server: &str, timeout: Duration) -> Result<Channel, XrayApiError> {
	let endpoint = Channel::from_shared(format!("http://{server}")).map_err(tonic::transport::Error::from)?.timeout(timeout).connect_timeout(timeout);
	Ok(endpoint.connect().await?)
}

async fn unary<Req: Message + 'static, Resp: Message + Default + 'static>(channel: Channel, path: &'static str, req: Req) -> Result<Resp, XrayApiError> {
	let mut grpc = Grpc::new(channel);
	grpc.ready().await.map_err(|e| tonic::Status::unavailable(e.to_string()))?;
	let codec = ProstCodec::default();
	let response = grpc.unary(req.into_request(), tonic::codegen::http::uri::PathAndQuery::from_static(path), codec).await?;
	Ok(response.into_inner())
}

pub async fn list_inbound_user_emails(config: &AgentConfig, inbound_tag: &str) -> Result<std::collections::BTreeSet<String>, XrayApiError> {
	let ch = channel(&config.xray_api_server, config.xray_api_timeout).await?;
	let req = GetInboundUserRequest { tag: inbound_tag.to_string(), email: String::new() };
	let resp: GetInboundUserResponse =
		unary(ch, "/xray.app.proxyman.command.HandlerService/GetInboundUsers", req).await.map_err(|e| match &e {
			XrayApiError::Rpc(status) if status.message().contains("handler not found") || status.message().contains("failed to get handler") => {
				XrayApiError::InboundMissing(inbound_tag.to_string())
			}
			_ => e,
		})?;
	Ok(resp.users.into_iter().map(|u| u.email).filter(|e| !e.is_empty()).collect())
}

pub async fn add_vless_user(config: &AgentConfig, inbound_tag: &str, email: &str, uuid: &str) -> Result<(), XrayApiError> {
	let account = VlessAccount { id: uuid.to_string(), encryption: "none".to_string() };
	let user = User { level: 0, email: email.to_string(), account: Some(TypedMessage { r#type: "xray.proxy.vless.Account".to_string(), value: account.encode_to_vec() }) };
	let op = AddUserOperation { user: Some(user) };
	let req = AlterInboundRequest { tag: inbound_tag.to_string(), operation: Some(TypedMessage { r#type: "xray.app.proxyman.command.AddUserOperation".to_string(), value: op.encode_to_vec() }) };

	let ch = channel(&config.xray_api_server, config.xray_api_timeout).await?;
	match unary::<_, AlterInboundResponse>(ch, "/xray.app.proxyman.command.HandlerService/AlterInbound", req).await {
		Ok(_) => Ok(()),
		Err(XrayApiError::Rpc(status)) if status.message().contains("already exists") => Ok(()),
		Err(e) => Err(e),
	}
}

pub async fn remove_user(config: &AgentConfig, inbound_tag: &str, email: &str) -> Result<(), XrayApiError> {
	let op = RemoveUserOperation { email: email.to_string() };
	let req = AlterInboundRequest { tag: inbound_tag.to_string(), operation: Some(TypedMessage { r#type: "xray.app.proxyman.command.RemoveUserOperation".to_string(), value: op.encode_to_vec() }) };

	let ch = channel(&config.xray_api_server, config.xray_api_timeout).await?;
	match unary::<_, AlterInboundResponse>(ch, "/xray.app.proxyman.command.HandlerService/AlterInbound", req).await {
		Ok(_) => Ok(()),
		Err(XrayApiError::Rpc(status)) if status.message().contains("not found") || status.message().contains("doesn't exist") => Ok(()),
		Err(e) => Err(e),
	}
}

/// Adds/removes so the inbound's live membership matches `desired` exactly
/// (keyed by email, mapped to the client uuid); returns whether anything
/// changed. A missing handler (inbound not yet provisioned on this node) is
/// treated as "nothing to do" rather than an error.
pub async fn sync_inbound_users(config: &AgentConfig, inbound_tag: &str, desired: &BTreeMap<String, String>) -> Result<bool, XrayApiError> {
	let current = match list_inbound_user_emails(config, inbound_tag).await {
		Ok(emails) => emails,
		Err(XrayApiError::InboundMissing(_)) => return Ok(false),
		Err(e) => return Err(e),
	};
	let desired_emails: std::collections::BTreeSet<String> = desired.keys().cloned().collect();

	let to_add: Vec<&String> = desired_emails.difference(&current).collect();
	let to_remove: Vec<&String> = current.difference(&desired_emails).collect();
	let changed = !to_add.is_empty() || !to_remove.is_empty();

	for email in to_add {
		add_vless_user(config, inbound_tag, email, &desired[email]).await?;
	}
	for email in to_remove {
		remove_user(config, inbound_tag, email).await?;
	}
	Ok(changed)
}

/// Queries Xray's StatsService for per-user traffic counters, keyed by
/// email to `{uplink, downlink}` bytes.
pub async fn query_user_traffic_bytes(config: &AgentConfig, reset: bool) -> Result<BTreeMap<String, (i64, i64)>, XrayApiError> {
	let ch = channel(&config.xray_api_server, config.xray_api_timeout).await?;
	let req = QueryStatsRequest { pattern: "user>>>*>>>traffic>>>*".to_string(), reset };
	let resp: QueryStatsResponse = unary(ch, "/xray.app.stats.command.StatsService/QueryStats", req).await?;

	let mut out: BTreeMap<String, (i64, i64)> = BTreeMap::new();
	for row in resp.stat {
		let parts: Vec<&str> = row.name.split(">>>").collect();
		if parts.len() < 4 || parts[0] != "user" || parts[2] != "traffic" {
			continue;
		}
		let email = parts[1].trim();
		let direction = parts[3].trim().to_lowercase();
		if email.is_empty() {
			continue;
		}
		let entry = out.entry(email.to_string()).or_insert((0, 0));
		match direction.as_str() {
			"uplink" => entry.0 = row.value,
			"downlink" => entry.1 = row.value,
			_ => {}
		}
	}
	Ok(out)
}
