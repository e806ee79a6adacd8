//! Entity structs. Field-level detail grounded in the original ORM models
//! (`models.py`); see `SPEC_FULL.md` §3.

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::enums::{
	ConnectionMode, ConnectionProtocol, ConnectionVariant, DeliveryStatus, LeaseStatus, NodeRole, OutboxEventType, OutboxStatus, OwnerType,
	RecordStatus, UserEntitlement, UserRole,
};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
	pub id: String,
	pub telegram_id: i64,
	pub role: UserRole,
	pub entitlement: UserEntitlement,
	pub grace_ends_at: Option<String>,
	pub device_quota: i64,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
	pub id: String,
	pub user_id: String,
	pub name: String,
	pub status: RecordStatus,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Connection {
	pub id: String,
	pub device_id: String,
	pub user_id: String,
	pub protocol: ConnectionProtocol,
	pub mode: ConnectionMode,
	pub variant: ConnectionVariant,
	pub custom_overrides_json: Json<serde_json::Value>,
	pub status: RecordStatus,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConnectionRevision {
	pub id: String,
	pub connection_id: String,
	pub slot: i64,
	pub status: RecordStatus,
	pub camouflage_sni_id: Option<i64>,
	pub effective_config_json: Json<serde_json::Value>,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpamPool {
	pub id: String,
	pub cidr: String,
	pub gateway: String,
	pub quarantine_seconds: i64,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct IpamLease {
	pub id: String,
	pub pool_id: String,
	pub owner_type: OwnerType,
	pub owner_id: String,
	pub ip: String,
	pub status: LeaseStatus,
	pub quarantined_until: Option<String>,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WireguardPeer {
	pub id: String,
	pub device_id: String,
	pub lease_id: String,
	pub peer_public_key: String,
	pub preshared_key: Option<String>,
	pub status: RecordStatus,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NodeEndpoint {
	pub id: String,
	pub role: NodeRole,
	pub name: String,
	pub base_url: String,
	pub public_ipv4: String,
	pub fqdn: Option<String>,
	pub proxy_fqdn: Option<String>,
	pub active: bool,
	pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEvent {
	pub id: String,
	pub event_type: OutboxEventType,
	pub aggregate_id: String,
	pub payload_json: Json<serde_json::Value>,
	pub role_target: Option<NodeRole>,
	pub node_id: Option<String>,
	pub idempotency_key: String,
	pub status: OutboxStatus,
	pub attempts: i64,
	pub last_error: Option<String>,
	pub created_at: String,
	pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxDelivery {
	pub id: String,
	pub outbox_event_id: String,
	pub node_id: String,
	pub status: DeliveryStatus,
	pub attempts: i64,
	pub next_attempt_at: String,
	pub locked_until: Option<String>,
	pub locked_by: Option<String>,
	pub last_error: Option<String>,
	pub created_at: String,
}
