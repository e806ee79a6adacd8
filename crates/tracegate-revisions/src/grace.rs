//! Entitlement gate for issuing new revisions. Grounded in the original
//! `services/grace.py`.

use tracegate_db::enums::UserEntitlement;
use tracegate_db::models::User;

#[derive(thiserror::Error, Debug)]
pub enum GraceError {
	#[error("user is blocked")]
	Blocked,

	#[error("grace period has expired")]
	GraceExpired,
}

/// `force=true` bypasses both the GRACE and BLOCKED checks; the original
/// spec is silent on the BLOCKED+force interaction, so the original's
/// literal (permissive) behavior is followed.
pub fn ensure_can_issue_new_config(user: &User, now: &chrono::DateTime<chrono::Utc>, force: bool) -> Result<(), GraceError> {
	if force {
		return Ok(());
	}

	match user.entitlement {
		UserEntitlement::Active => Ok(()),
		UserEntitlement::Blocked => Err(GraceError::Blocked),
		UserEntitlement::Grace => match &user.grace_ends_at {
			Some(ends_at) => {
				let ends_at = chrono::DateTime::parse_from_rfc3339(ends_at).map(|dt| dt.with_timezone(&chrono::Utc)).unwrap_or(*now);
				if *now < ends_at {
					Ok(())
				} else {
					Err(GraceError::GraceExpired)
				}
			}
			None => Err(GraceError::GraceExpired),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	fn user(entitlement: UserEntitlement, grace_ends_at: Option<String>) -> User {
		User { id: "u1".into(), telegram_id: 1, role: tracegate_db::enums::UserRole::User, entitlement, grace_ends_at, device_quota: 3, created_at: "now".into() }
	}

	#[test]
	fn active_user_always_allowed() {
		let u = user(UserEntitlement::Active, None);
		assert!(ensure_can_issue_new_config(&u, &chrono::Utc::now(), false).is_ok());
	}

	#[test]
	fn blocked_user_denied_unless_forced() {
		let u = user(UserEntitlement::Blocked, None);
		let now = chrono::Utc::now();
		assert!(ensure_can_issue_new_config(&u, &now, false).is_err());
		assert!(ensure_can_issue_new_config(&u, &now, true).is_ok());
	}

	#[test]
	fn grace_user_allowed_until_expiry() {
		let now = chrono::Utc::now();
		let u = user(UserEntitlement::Grace, Some((now + Duration::hours(1)).to_rfc3339()));
		assert!(ensure_can_issue_new_config(&u, &now, false).is_ok());

		let expired = user(UserEntitlement::Grace, Some((now - Duration::hours(1)).to_rfc3339()));
		assert!(ensure_can_issue_new_config(&expired, &now, false).is_err());
	}
}
