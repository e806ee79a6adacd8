//! Hysteria2 identifies clients by a human-readable "marker" embedded in the
//! userpass auth string rather than a UUID. Two spellings of the same
//! marker are kept in sync on every revision: a canonical one and an
//! iOS-safe one (some Hysteria2 clients on iOS reject spaces and dashes in
//! the auth username). Grounded in the original `services/hysteria_markers.py`.

use regex::Regex;
use std::sync::OnceLock;

pub struct Marker {
	pub variant: String,
	pub user_id: String,
	pub connection_id: String,
}

impl Marker {
	/// `"B<variant> - <user_id> - <connection_id>"`, e.g. `"B3 - 12345 - 9c1f..."`.
	pub fn canonical(&self) -> String {
		format!("B{} - {} - {}", self.variant, self.user_id, self.connection_id)
	}

	/// `"b<variant>_<user_id>_<connection_id_no_dashes>"`, lowercase and
	/// delimiter-free so iOS Hysteria2 clients accept it as a username.
	pub fn ios_safe(&self) -> String {
		format!("b{}_{}_{}", self.variant.to_lowercase(), self.user_id, self.connection_id.replace('-', ""))
	}

	/// Both spellings, the pair that must be kept as aliases for the same
	/// userpass entry.
	pub fn aliases(&self) -> [String; 2] {
		[self.canonical(), self.ios_safe()]
	}
}

fn canonical_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?i)^B(?P<variant>[0-9]+)\s*-\s*(?P<user_id>[^-\s][^-]*?)\s*-\s*(?P<connection_id>[0-9a-f-]+)$").unwrap())
}

fn ios_safe_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"(?i)^b(?P<variant>[0-9]+)_(?P<user_id>[^_]+)_(?P<connection_id>[0-9a-f]+)$").unwrap())
}

/// Parses either spelling back into its parts. The iOS-safe form loses the
/// dashes from `connection_id`, so a parsed connection id from that form is
/// dash-free and must be matched against a dash-free comparison key.
pub fn parse(marker: &str) -> Option<Marker> {
	if let Some(caps) = canonical_re().captures(marker) {
		return Some(Marker {
			variant: caps["variant"].to_string(),
			user_id: caps["user_id"].to_string(),
			connection_id: caps["connection_id"].to_string(),
		});
	}
	if let Some(caps) = ios_safe_re().captures(marker) {
		return Some(Marker {
			variant: caps["variant"].to_string(),
			user_id: caps["user_id"].to_string(),
			connection_id: caps["connection_id"].to_string(),
		});
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_both_spellings() {
		let marker = Marker { variant: "3".to_string(), user_id: "12345".to_string(), connection_id: "9c1f-abcd".to_string() };
		assert_eq!(marker.canonical(), "B3 - 12345 - 9c1f-abcd");
		assert_eq!(marker.ios_safe(), "b3_12345_9c1fabcd");
	}

	#[test]
	fn parses_canonical_and_ios_safe() {
		let a = parse("B3 - 12345 - 9c1f-abcd").unwrap();
		assert_eq!(a.variant, "3");
		assert_eq!(a.user_id, "12345");

		let b = parse("b3_12345_9c1fabcd").unwrap();
		assert_eq!(b.variant, "3");
		assert_eq!(b.connection_id, "9c1fabcd");
	}

	#[test]
	fn rejects_garbage() {
		assert!(parse("not a marker").is_none());
	}
}
