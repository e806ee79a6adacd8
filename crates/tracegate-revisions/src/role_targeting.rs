//! Derives which node roles an effective configuration must be delivered
//! to. Grounded in the original `services/role_targeting.py`, widened to
//! cover the Hysteria2 chain (B4) variant the original predates.

use tracegate_db::enums::{ConnectionMode, ConnectionProtocol, ConnectionVariant, NodeRole};

pub fn target_roles(protocol: ConnectionProtocol, mode: ConnectionMode, _variant: ConnectionVariant) -> Vec<NodeRole> {
	match (protocol, mode) {
		(_, ConnectionMode::Chain) => vec![NodeRole::VpsE, NodeRole::VpsT],
		_ => vec![NodeRole::VpsT],
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn direct_variants_target_transit_only() {
		assert_eq!(target_roles(ConnectionProtocol::Wireguard, ConnectionMode::Direct, ConnectionVariant::B5), vec![NodeRole::VpsT]);
		assert_eq!(target_roles(ConnectionProtocol::VlessWsTls, ConnectionMode::Direct, ConnectionVariant::B1), vec![NodeRole::VpsT]);
	}

	#[test]
	fn chain_variants_target_both_roles() {
		assert_eq!(target_roles(ConnectionProtocol::VlessReality, ConnectionMode::Chain, ConnectionVariant::B2), vec![NodeRole::VpsE, NodeRole::VpsT]);
		assert_eq!(target_roles(ConnectionProtocol::Hysteria2, ConnectionMode::Chain, ConnectionVariant::B4), vec![NodeRole::VpsE, NodeRole::VpsT]);
	}
}
