//! Closed enumerations shared across the control plane, mirroring the
//! wire-level string values used in `§6` of the specification.

use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{Sqlite, SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Type};
use std::fmt;
use std::str::FromStr;

/// Defines a C-like enum whose wire representation is a fixed string (the
/// same strings the original service's Python enums used), and wires it up
/// as a SQLite `TEXT` column via `sqlx::Type`/`Encode`/`Decode`.
macro_rules! string_enum {
	($name:ident { $($variant:ident => $wire:expr),+ $(,)? }) => {
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
		pub enum $name {
			$($variant),+
		}

		// Hand-rolled rather than `#[derive(Serialize, Deserialize)]` so JSON on
		// the wire uses the same strings as the SQLite column and the Python
		// original, instead of serde's default PascalCase variant names.
		impl Serialize for $name {
			fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
				serializer.serialize_str(self.as_str())
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				let raw = <std::borrow::Cow<'de, str> as Deserialize<'de>>::deserialize(deserializer)?;
				Self::from_str(&raw).map_err(serde::de::Error::custom)
			}
		}

		impl $name {
			pub const fn as_str(self) -> &'static str {
				match self {
					$(Self::$variant => $wire),+
				}
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(self.as_str())
			}
		}

		impl FromStr for $name {
			type Err = String;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$(if s.eq_ignore_ascii_case($wire) { return Ok(Self::$variant); })+
				Err(format!("unknown {}: {s}", stringify!($name)))
			}
		}

		impl Type<Sqlite> for $name {
			fn type_info() -> SqliteTypeInfo {
				<&str as Type<Sqlite>>::type_info()
			}
		}

		impl<'q> Encode<'q, Sqlite> for $name {
			fn encode_by_ref(&self, buf: &mut Vec<SqliteArgumentValue<'q>>) -> Result<IsNull, BoxDynError> {
				<&str as Encode<'q, Sqlite>>::encode_by_ref(&self.as_str(), buf)
			}
		}

		impl<'r> Decode<'r, Sqlite> for $name {
			fn decode(value: SqliteValueRef<'r>) -> Result<Self, BoxDynError> {
				let raw = <&str as Decode<Sqlite>>::decode(value)?;
				Self::from_str(raw).map_err(Into::into)
			}
		}
	};
}

string_enum!(UserRole { User => "user", Admin => "admin", Superadmin => "superadmin" });

string_enum!(UserEntitlement { Active => "ACTIVE", Grace => "GRACE", Blocked => "BLOCKED" });

string_enum!(RecordStatus { Active => "ACTIVE", Revoked => "REVOKED" });

string_enum!(LeaseStatus { Active => "ACTIVE", Quarantined => "QUARANTINED", Released => "RELEASED" });

string_enum!(OwnerType { User => "user", Device => "device", Peer => "peer" });

string_enum!(NodeRole { VpsT => "VPS_T", VpsE => "VPS_E" });

string_enum!(ConnectionProtocol {
	VlessReality => "vless_reality",
	VlessWsTls => "vless_ws_tls",
	Hysteria2 => "hysteria2",
	Wireguard => "wireguard",
});

string_enum!(ConnectionMode { Direct => "direct", Chain => "chain" });

string_enum!(ConnectionVariant {
	B1 => "B1",
	B2 => "B2",
	B3 => "B3",
	B4 => "B4",
	B5 => "B5",
});

string_enum!(OutboxEventType {
	ApplyBundle => "APPLY_BUNDLE",
	UpsertUser => "UPSERT_USER",
	RevokeUser => "REVOKE_USER",
	RevokeConnection => "REVOKE_CONNECTION",
	WgPeerUpsert => "WG_PEER_UPSERT",
	WgPeerRemove => "WG_PEER_REMOVE",
});

string_enum!(OutboxStatus { Pending => "PENDING", Inflight => "INFLIGHT", Sent => "SENT", Failed => "FAILED" });

string_enum!(DeliveryStatus { Pending => "PENDING", Sent => "SENT", Failed => "FAILED", Dead => "DEAD" });

/// The closed set of (protocol, mode, variant) triples the data model accepts. See `§6`.
pub const ALLOWED_TRIPLES: &[(ConnectionProtocol, ConnectionMode, ConnectionVariant)] = &[
	(ConnectionProtocol::VlessReality, ConnectionMode::Direct, ConnectionVariant::B1),
	(ConnectionProtocol::VlessReality, ConnectionMode::Chain, ConnectionVariant::B2),
	(ConnectionProtocol::VlessWsTls, ConnectionMode::Direct, ConnectionVariant::B1),
	(ConnectionProtocol::Hysteria2, ConnectionMode::Direct, ConnectionVariant::B3),
	(ConnectionProtocol::Hysteria2, ConnectionMode::Chain, ConnectionVariant::B4),
	(ConnectionProtocol::Wireguard, ConnectionMode::Direct, ConnectionVariant::B5),
];

pub fn is_allowed_triple(protocol: ConnectionProtocol, mode: ConnectionMode, variant: ConnectionVariant) -> bool {
	ALLOWED_TRIPLES.iter().any(|&(p, m, v)| p == protocol && m == mode && v == variant)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_wire_strings() {
		assert_eq!(ConnectionProtocol::from_str("vless_reality").unwrap(), ConnectionProtocol::VlessReality);
		assert_eq!(ConnectionVariant::B4.as_str(), "B4");
		assert_eq!(NodeRole::from_str("vps_t").unwrap(), NodeRole::VpsT);
	}

	#[test]
	fn rejects_unknown_triples() {
		assert!(!is_allowed_triple(ConnectionProtocol::Hysteria2, ConnectionMode::Direct, ConnectionVariant::B4));
		assert!(is_allowed_triple(ConnectionProtocol::Hysteria2, ConnectionMode::Chain, ConnectionVariant::B4));
	}
}
