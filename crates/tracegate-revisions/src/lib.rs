//! The revision engine: `create_revision`, `activate_revision`,
//! `revoke_revision`. Grounded in the original `services/revisions.py`
//! (algorithm) plus the sibling modules it calls into, each reimplemented
//! in its own module here (`config_builder`, `grace`, `overrides`,
//! `role_targeting`, `hysteria_markers`, `wireguard`).

pub mod config_builder;
pub mod error;
pub mod grace;
pub mod hysteria_markers;
pub mod overrides;
pub mod role_targeting;
pub mod wireguard;

pub use error::RevisionError;

use serde_json::json;

use tracegate_config::EndpointDefaults;
use tracegate_db::enums::{ConnectionMode, ConnectionProtocol, NodeRole, OutboxEventType, OwnerType};
use tracegate_db::models::{Connection, ConnectionRevision};
use tracegate_db::repos::connections::ConnectionRepository;
use tracegate_db::repos::node_endpoints::NodeEndpointRepository;
use tracegate_db::repos::revisions::RevisionRepository;
use tracegate_db::repos::users::UserRepository;
use tracegate_db::repos::wireguard_peers::WireguardPeerRepository;
use tracegate_db::SqlitePool;
use tracegate_ipam::IpamAllocator;
use tracegate_outbox::OutboxService;

use config_builder::{RealityMaterial, WireguardPeerConfig};
use hysteria_markers::Marker;

/// Resolves a camouflage SNI id to an enabled hostname. An external
/// collaborator (the static SNI catalog) is out of scope for this system;
/// callers inject a lookup rather than the engine owning that storage.
pub trait SniCatalog: Send + Sync {
	/// `explicit_id`, if given, must resolve to an enabled entry or this
	/// fails. Otherwise falls back to the first enabled entry.
	fn resolve(&self, explicit_id: Option<i64>) -> Result<(i64, String), RevisionError>;
}

/// REALITY camouflage key material per role; also an external collaborator
/// (node provisioning owns the actual key material).
pub trait RealityMaterialSource: Send + Sync {
	fn material_for(&self, role: NodeRole) -> RealityMaterial;
}

pub struct RevisionEngine {
	connections: ConnectionRepository,
	revisions: RevisionRepository,
	users: UserRepository,
	node_endpoints: NodeEndpointRepository,
	wireguard_peers: WireguardPeerRepository,
	ipam: IpamAllocator,
	outbox: OutboxService,
	endpoint_defaults: EndpointDefaults,
}

impl RevisionEngine {
	pub fn new(pool: SqlitePool, endpoint_defaults: EndpointDefaults) -> Self {
		Self {
			connections: ConnectionRepository::new(pool.clone()),
			revisions: RevisionRepository::new(pool.clone()),
			users: UserRepository::new(pool.clone()),
			node_endpoints: NodeEndpointRepository::new(pool.clone()),
			wireguard_peers: WireguardPeerRepository::new(pool.clone()),
			ipam: IpamAllocator::new(pool.clone()),
			outbox: OutboxService::new(pool),
			endpoint_defaults,
		}
	}

	async fn vps_t_host(&self) -> Result<String, RevisionError> {
		Ok(self.node_endpoints.active_for_role(NodeRole::VpsT).await?.into_iter().next().map(|e| e.base_url).unwrap_or_else(|| self.endpoint_defaults.default_vps_t_host.clone()))
	}

	async fn vps_e_host(&self) -> Result<String, RevisionError> {
		Ok(self.node_endpoints.active_for_role(NodeRole::VpsE).await?.into_iter().next().map(|e| e.base_url).unwrap_or_else(|| self.endpoint_defaults.default_vps_e_host.clone()))
	}

	fn op_ts() -> i64 {
		chrono::Utc::now().timestamp_millis()
	}

	/// WireGuard carries desired state as a peer upsert; every other
	/// protocol as a user upsert.
	fn upsert_event_type(protocol: ConnectionProtocol) -> OutboxEventType {
		if protocol == ConnectionProtocol::Wireguard {
			OutboxEventType::WgPeerUpsert
		} else {
			OutboxEventType::UpsertUser
		}
	}

	/// Renders the effective configuration for a connection; the caller is
	/// responsible for persisting it and for any WireGuard peer/lease setup.
	#[allow(clippy::too_many_arguments)]
	async fn render_effective_config(
		&self,
		connection: &Connection,
		sni_fqdn: Option<&str>,
		reality: &dyn RealityMaterialSource,
		wireguard_peer: Option<&WireguardPeerConfig>,
	) -> Result<serde_json::Value, RevisionError> {
		let is_chain = connection.mode == ConnectionMode::Chain;
		let overrides = &connection.custom_overrides_json.0;

		let config = match connection.protocol {
			ConnectionProtocol::VlessReality => {
				let fqdn = sni_fqdn.ok_or(RevisionError::NoSniAvailable)?;
				config_builder::render_vless_reality(
					&connection.id,
					fqdn,
					is_chain,
					&self.vps_t_host().await?,
					&self.vps_e_host().await?,
					&reality.material_for(NodeRole::VpsT),
					&reality.material_for(NodeRole::VpsE),
					overrides,
				)
			}
			ConnectionProtocol::VlessWsTls => {
				let host = self.vps_t_host().await?;
				config_builder::render_vless_ws_tls(&connection.id, &host, &host, &host, "/ws", overrides)
			}
			ConnectionProtocol::Hysteria2 => {
				let marker = Marker { variant: connection.variant.as_str().trim_start_matches('B').to_string(), user_id: connection.user_id.clone(), connection_id: connection.id.clone() };
				config_builder::render_hysteria2(&connection.device_id, &marker, &self.vps_t_host().await?, overrides)
			}
			ConnectionProtocol::Wireguard => {
				let peer = wireguard_peer.ok_or(RevisionError::RevisionNotFound("wireguard peer config missing".to_string()))?;
				config_builder::render_wireguard(peer, overrides)
			}
		};
		Ok(config)
	}

	/// Reuses the device's existing ACTIVE peer if one exists; otherwise
	/// allocates an IPAM lease and generates a fresh server-side keypair.
	/// Step 4 of `create_revision`.
	async fn ensure_wireguard_peer(&self, connection: &Connection, pool: &tracegate_db::models::IpamPool) -> Result<WireguardPeerConfig, RevisionError> {
		let existing = self.wireguard_peers.get_for_device(&connection.device_id).await?;

		let (peer_public_key, lease_id, interface_address, preshared_key) = if let Some(peer) = existing {
			let lease = self.ipam.allocate(pool, OwnerType::Device, &connection.device_id).await?;
			(peer.peer_public_key, peer.lease_id, lease.ip, peer.preshared_key)
		} else {
			let lease = self.ipam.allocate(pool, OwnerType::Device, &connection.device_id).await?;
			let keypair = wireguard::generate_keypair();
			let psk = wireguard::generate_preshared_key();
			let created = self.wireguard_peers.create(&connection.device_id, &lease.id, &keypair.public_key_b64, Some(&psk)).await?;
			(created.peer_public_key, created.lease_id, lease.ip, created.preshared_key)
		};

		let _ = lease_id;
		Ok(WireguardPeerConfig {
			endpoint: format!("{}:51820", self.vps_t_host().await?),
			listen_port: 51820,
			interface_address,
			dns: vec!["1.1.1.1".to_string()],
			mtu: 1420,
			server_public_key: peer_public_key,
			allowed_ips: vec!["0.0.0.0/0".to_string()],
			preshared_key,
		})
	}

	/// `create_revision(connection_id, camouflage_sni_id?, force?) -> revision`.
	pub async fn create_revision(
		&self,
		connection_id: &str,
		camouflage_sni_id: Option<i64>,
		force: bool,
		sni_catalog: &dyn SniCatalog,
		reality: &dyn RealityMaterialSource,
		wg_pool: Option<&tracegate_db::models::IpamPool>,
	) -> Result<ConnectionRevision, RevisionError> {
		let connection = self.connections.get_by_id(connection_id).await?.ok_or_else(|| RevisionError::ConnectionNotFound(connection_id.to_string()))?;
		let user = self.users.get_by_id(&connection.user_id).await?.ok_or_else(|| RevisionError::ConnectionNotFound(connection.user_id.clone()))?;

		grace::ensure_can_issue_new_config(&user, &chrono::Utc::now(), force)?;
		overrides::validate(connection.protocol, &connection.custom_overrides_json.0)?;

		let sni = if connection.protocol == ConnectionProtocol::VlessReality { Some(sni_catalog.resolve(camouflage_sni_id)?) } else { None };

		let wireguard_peer = if connection.protocol == ConnectionProtocol::Wireguard {
			let pool = wg_pool.ok_or_else(|| RevisionError::RevisionNotFound("no IPAM pool configured for WireGuard".to_string()))?;
			Some(self.ensure_wireguard_peer(&connection, pool).await?)
		} else {
			None
		};

		let effective_config = self.render_effective_config(&connection, sni.as_ref().map(|(_, fqdn)| fqdn.as_str()), reality, wireguard_peer.as_ref()).await?;

		self.revisions.shift_history(connection_id).await?;
		let revision = self.revisions.insert(connection_id, 0, sni.as_ref().map(|(id, _)| *id), &effective_config).await?;

		self.fanout_for_revision(&connection, &revision, Self::upsert_event_type(connection.protocol), &effective_config).await?;
		Ok(revision)
	}

	/// `activate_revision(revision_id) -> revision`.
	pub async fn activate_revision(&self, revision_id: &str) -> Result<ConnectionRevision, RevisionError> {
		let revision = self.revisions.get_by_id(revision_id).await?.ok_or_else(|| RevisionError::RevisionNotFound(revision_id.to_string()))?;
		let connection = self.connections.get_by_id(&revision.connection_id).await?.ok_or_else(|| RevisionError::ConnectionNotFound(revision.connection_id.clone()))?;

		self.revisions.renumber_with_slot_zero(&connection.id, revision_id).await?;
		// Renumbering moves every other ACTIVE revision to slots 1/2 first,
		// so by the time `revision_id` lands on slot 0 no ACTIVE row can
		// still be sitting there; only now is it safe to flip a previously
		// REVOKED revision (e.g. rolling back to an older one) to ACTIVE
		// without transiently colliding with the partial unique index.
		self.revisions.set_status(revision_id, "ACTIVE").await?;
		let activated = self.revisions.get_by_id(revision_id).await?.ok_or_else(|| RevisionError::RevisionNotFound(revision_id.to_string()))?;

		self.fanout_for_revision(&connection, &activated, Self::upsert_event_type(connection.protocol), &activated.effective_config_json.0).await?;
		Ok(activated)
	}

	/// `revoke_revision(revision_id) -> revision`.
	pub async fn revoke_revision(&self, revision_id: &str) -> Result<ConnectionRevision, RevisionError> {
		let revision = self.revisions.get_by_id(revision_id).await?.ok_or_else(|| RevisionError::RevisionNotFound(revision_id.to_string()))?;
		let connection = self.connections.get_by_id(&revision.connection_id).await?.ok_or_else(|| RevisionError::ConnectionNotFound(revision.connection_id.clone()))?;

		self.revisions.set_status(revision_id, "REVOKED").await?;
		self.revisions.renumber_with_slot_zero(&connection.id, revision_id).await.ok();

		let revoke_type = if connection.protocol == ConnectionProtocol::Wireguard { OutboxEventType::WgPeerRemove } else { OutboxEventType::RevokeUser };
		self.fanout_for_revision(&connection, &revision, revoke_type, &revision.effective_config_json.0).await?;

		self.revisions.get_by_id(revision_id).await?.ok_or_else(|| RevisionError::RevisionNotFound(revision_id.to_string()))
	}

	/// Builds the event-type-specific payload shape from `§6` and fans it
	/// out to every target role. Each event type carries only the fields
	/// the corresponding agent handler needs — in particular a WireGuard
	/// peer event never carries the full effective config, only the
	/// top-level `peer_public_key`/`peer_ip`/`preshared_key` the
	/// reconciler's `[Peer]` block renders from.
	async fn fanout_for_revision(
		&self,
		connection: &Connection,
		revision: &ConnectionRevision,
		event_type: OutboxEventType,
		effective_config: &serde_json::Value,
	) -> Result<(), RevisionError> {
		let roles = role_targeting::target_roles(connection.protocol, connection.mode, connection.variant);
		let op_ts = Self::op_ts();
		let payload = match event_type {
			OutboxEventType::WgPeerUpsert => {
				let mut p = json!({
					"device_id": connection.device_id,
					"connection_id": connection.id,
					"revision_id": revision.id,
					"peer_public_key": effective_config.get("server_public_key").cloned().unwrap_or(serde_json::Value::Null),
					"peer_ip": effective_config.get("address").cloned().unwrap_or(serde_json::Value::Null),
					"op_ts": op_ts,
				});
				if let Some(psk) = effective_config.get("preshared_key") {
					p["preshared_key"] = psk.clone();
				}
				p
			}
			OutboxEventType::WgPeerRemove => json!({
				"device_id": connection.device_id,
				"connection_id": connection.id,
				"revision_id": revision.id,
				"op_ts": op_ts,
			}),
			OutboxEventType::RevokeUser => json!({
				"user_id": connection.user_id,
				"op_ts": op_ts,
			}),
			OutboxEventType::RevokeConnection => json!({
				"user_id": connection.user_id,
				"connection_id": connection.id,
				"op_ts": op_ts,
			}),
			_ => json!({
				"user_id": connection.user_id,
				"connection_id": connection.id,
				"revision_id": revision.id,
				"protocol": connection.protocol.as_str(),
				"variant": connection.variant.as_str(),
				"config": effective_config,
				"op_ts": op_ts,
			}),
		};

		for role in roles {
			let suffix = format!("{}:{}", revision.id, role.as_str());
			self.outbox.create_event(event_type, &connection.id, &payload, role, Some(&suffix)).await?;
		}
		Ok(())
	}
}
