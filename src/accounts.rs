use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::SqliteConnection;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::Error;
use crate::model::{
    DeviceToken, NewAdminSession, NewDeviceToken, NewProfile, NewSession, Profile, StaffRole,
};
use crate::notify::is_valid_push_token;
use crate::schema::{admin_sessions, device_tokens, profiles, sessions};

/// Who is calling. Built once per HTTP request from the bearer token and handed to every
/// operation that needs to authorise something.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionContext {
    pub profile: Option<Profile>,
    pub is_admin: bool,
    #[serde(skip)]
    pub token: Option<String>,
}

impl SessionContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Admin session with no profile attached (password login).
    pub fn admin() -> Self {
        Self {
            profile: None,
            is_admin: true,
            token: None,
        }
    }

    pub fn for_profile(profile: Profile) -> Self {
        Self {
            is_admin: profile.is_admin,
            profile: Some(profile),
            token: None,
        }
    }

    pub fn profile_id(&self) -> Option<i32> {
        self.profile.as_ref().map(|p| p.id)
    }

    pub fn require_profile(&self) -> Result<&Profile, Error> {
        self.profile.as_ref().ok_or(Error::Unauthorized)
    }

    pub fn require_admin(&self) -> Result<(), Error> {
        if self.is_admin {
            Ok(())
        } else if self.profile.is_some() || self.token.is_some() {
            Err(Error::Forbidden)
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// The caller's profile, if it carries `role`.
    pub fn require_role(&self, role: StaffRole) -> Result<&Profile, Error> {
        let profile = self.require_profile()?;
        if profile.has_role(role) {
            Ok(profile)
        } else {
            Err(Error::Forbidden)
        }
    }

    /// Like [`SessionContext::require_role`], but the profile must also be marked available.
    pub fn require_on_duty(&self, role: StaffRole) -> Result<&Profile, Error> {
        let profile = self.require_role(role)?;
        if profile.is_available {
            Ok(profile)
        } else {
            Err(Error::Forbidden)
        }
    }
}

/// Creates an admin session and returns the token.
pub fn create_admin_session(conn: &mut SqliteConnection) -> Result<String, Error> {
    let token_str = Uuid::new_v4().to_string();
    let new_session = NewAdminSession {
        token: token_str.clone(),
    };
    diesel::insert_into(admin_sessions::table)
        .values(&new_session)
        .execute(conn)?;
    Ok(token_str)
}

/// Checks `password` against the configured admin password and opens an admin session.
pub fn admin_login(
    conn: &mut SqliteConnection,
    password: &str,
    admin_password: &str,
) -> Result<String, Error> {
    if password != admin_password {
        return Err(Error::Unauthorized);
    }
    let token = create_admin_session(conn)?;
    info!("admin session opened");
    Ok(token)
}

/// Returns true if the provided token exists in the admin_sessions table.
pub fn validate_admin_token(conn: &mut SqliteConnection, token: &str) -> Result<bool, Error> {
    if Uuid::parse_str(token).is_err() {
        return Ok(false);
    }
    let count: i64 = admin_sessions::table
        .filter(admin_sessions::token.eq(token))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Deletes a session token, whichever kind it is. Returns the number of sessions removed.
pub fn revoke_token(conn: &mut SqliteConnection, token: &str) -> Result<usize, Error> {
    let admin = diesel::delete(admin_sessions::table.filter(admin_sessions::token.eq(token)))
        .execute(conn)?;
    let profile =
        diesel::delete(sessions::table.filter(sessions::token.eq(token))).execute(conn)?;
    Ok(admin + profile)
}

pub fn create_profile(conn: &mut SqliteConnection, new_profile: &NewProfile) -> Result<Profile, Error> {
    if new_profile.username.trim().is_empty() || new_profile.full_name.trim().is_empty() {
        return Err(Error::Validation(
            "username and full_name are required".to_string(),
        ));
    }

    // The UNIQUE constraint is the only check, so concurrent creates cannot both succeed.
    diesel::insert_into(profiles::table)
        .values(new_profile)
        .returning(Profile::as_returning())
        .get_result(conn)
        .map_err(|e| match e {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                Error::Validation(format!("username '{}' is taken", new_profile.username))
            }
            e => e.into(),
        })
}

pub fn get_profile(conn: &mut SqliteConnection, profile_id: i32) -> Result<Profile, Error> {
    profiles::table
        .filter(profiles::id.eq(profile_id))
        .select(Profile::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::NotFound)
}

/// Issues a fresh session token for a profile, replacing any it had before.
pub fn issue_session(conn: &mut SqliteConnection, profile_id: i32) -> Result<String, Error> {
    conn.transaction(|conn| {
        get_profile(conn, profile_id)?;

        diesel::delete(sessions::table.filter(sessions::profile_id.eq(profile_id)))
            .execute(conn)?;

        let token_str = Uuid::new_v4().to_string();
        let new_session = NewSession {
            profile_id,
            token: token_str.clone(),
        };
        diesel::insert_into(sessions::table)
            .values(&new_session)
            .execute(conn)?;

        Ok(token_str)
    })
}

/// Retrieves a profile by its session token.
pub fn get_profile_by_token(conn: &mut SqliteConnection, token: &str) -> Result<Profile, Error> {
    // Validate token format.
    if Uuid::parse_str(token).is_err() {
        return Err(Error::NotFound);
    }

    sessions::table
        .filter(sessions::token.eq(token))
        .inner_join(profiles::table)
        .select(Profile::as_select())
        .first::<Profile>(conn)
        .optional()?
        .ok_or(Error::NotFound)
}

/// Resolves a bearer token into a session context. Unknown or malformed tokens are
/// [`Error::Unauthorized`].
pub fn resolve_session(conn: &mut SqliteConnection, token: &str) -> Result<SessionContext, Error> {
    if Uuid::parse_str(token).is_err() {
        return Err(Error::Unauthorized);
    }

    match get_profile_by_token(conn, token) {
        Ok(profile) => {
            let mut ctx = SessionContext::for_profile(profile);
            ctx.token = Some(token.to_string());
            return Ok(ctx);
        }
        Err(Error::NotFound) => {}
        Err(e) => return Err(e),
    }

    if validate_admin_token(conn, token)? {
        let mut ctx = SessionContext::admin();
        ctx.token = Some(token.to_string());
        Ok(ctx)
    } else {
        Err(Error::Unauthorized)
    }
}

pub fn set_availability(
    conn: &mut SqliteConnection,
    profile_id: i32,
    is_available: bool,
) -> Result<Profile, Error> {
    diesel::update(profiles::table.filter(profiles::id.eq(profile_id)))
        .set(profiles::is_available.eq(is_available))
        .returning(Profile::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or(Error::NotFound)
}

/// Stores the profile's push token. `None` clears it.
pub fn set_push_token(
    conn: &mut SqliteConnection,
    profile_id: i32,
    push_token: Option<&str>,
) -> Result<Profile, Error> {
    if let Some(token) = push_token {
        if !is_valid_push_token(token) {
            return Err(Error::Validation("malformed push token".to_string()));
        }
    }
    diesel::update(profiles::table.filter(profiles::id.eq(profile_id)))
        .set(profiles::push_token.eq(push_token))
        .returning(Profile::as_returning())
        .get_result(conn)
        .optional()?
        .ok_or(Error::NotFound)
}

/// Registers (or re-registers) an anonymous device token, optionally tied to a staff role.
pub fn register_device(
    conn: &mut SqliteConnection,
    token: &str,
    role: Option<StaffRole>,
) -> Result<DeviceToken, Error> {
    if !is_valid_push_token(token) {
        return Err(Error::Validation("malformed push token".to_string()));
    }
    let role = role.map(StaffRole::as_str);
    let device = diesel::insert_into(device_tokens::table)
        .values(&NewDeviceToken { token, role })
        .on_conflict(device_tokens::token)
        .do_update()
        .set(device_tokens::role.eq(role))
        .returning(DeviceToken::as_returning())
        .get_result(conn)?;
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[test]
    fn test_admin_login() {
        run_test_in_transaction(|conn| {
            let err = admin_login(conn, "wrong", "hunter2").expect_err("bad password");
            assert!(matches!(err, Error::Unauthorized));

            let token = admin_login(conn, "hunter2", "hunter2")?;
            assert!(Uuid::parse_str(&token).is_ok());
            assert!(validate_admin_token(conn, &token)?);
            assert!(!validate_admin_token(conn, "not-a-uuid")?);

            let ctx = resolve_session(conn, &token)?;
            assert!(ctx.is_admin);
            assert!(ctx.profile.is_none());

            assert_eq!(revoke_token(conn, &token)?, 1);
            assert!(matches!(resolve_session(conn, &token), Err(Error::Unauthorized)));
            Ok(())
        });
    }

    #[test]
    fn test_issue_session_replaces_old_token() {
        run_test_in_transaction(|conn| {
            let profile = create_profile(
                conn,
                &NewProfile {
                    username: "medic1".to_string(),
                    full_name: "Sam Medic".to_string(),
                    is_medical_staff: true,
                    ..Default::default()
                },
            )?;

            let first = issue_session(conn, profile.id)?;
            let second = issue_session(conn, profile.id)?;
            assert_ne!(first, second);

            assert!(matches!(resolve_session(conn, &first), Err(Error::Unauthorized)));
            let ctx = resolve_session(conn, &second)?;
            assert_eq!(ctx.profile_id(), Some(profile.id));
            assert!(!ctx.is_admin);
            assert!(ctx.require_role(StaffRole::MedicalStaff).is_ok());
            assert!(matches!(
                ctx.require_role(StaffRole::Driver),
                Err(Error::Forbidden)
            ));
            assert!(matches!(ctx.require_admin(), Err(Error::Forbidden)));

            assert!(matches!(issue_session(conn, 999), Err(Error::NotFound)));
            Ok(())
        });
    }

    #[test]
    fn test_create_profile_validation() {
        run_test_in_transaction(|conn| {
            let new_profile = NewProfile {
                username: "driver".to_string(),
                full_name: "Dee Driver".to_string(),
                is_driver: true,
                ..Default::default()
            };
            create_profile(conn, &new_profile)?;
            assert!(matches!(
                create_profile(conn, &new_profile),
                Err(Error::Validation(_))
            ));
            assert!(matches!(
                create_profile(conn, &NewProfile::default()),
                Err(Error::Validation(_))
            ));

            // A row that slipped in first still turns the second insert into a validation error.
            insert_profile(conn, "medic", &["medical"], true, None);
            let err = create_profile(
                conn,
                &NewProfile {
                    username: "medic".to_string(),
                    full_name: "Second Medic".to_string(),
                    ..Default::default()
                },
            )
            .expect_err("username already stored");
            assert!(matches!(err, Error::Validation(_)));
            assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
            Ok(())
        });
    }

    #[test]
    fn test_admin_profile_is_admin() {
        run_test_in_transaction(|conn| {
            let profile = insert_profile(conn, "td", &["admin"], false, None);
            let token = issue_session(conn, profile.id)?;
            let ctx = resolve_session(conn, &token)?;
            assert!(ctx.is_admin);
            assert!(ctx.require_admin().is_ok());
            Ok(())
        });
    }

    #[test]
    fn test_availability_and_push_token() {
        run_test_in_transaction(|conn| {
            let profile = insert_profile(conn, "vol", &["volunteer"], false, None);

            let updated = set_availability(conn, profile.id, true)?;
            assert!(updated.is_available);

            let err = set_push_token(conn, profile.id, Some("garbage")).expect_err("malformed");
            assert!(matches!(err, Error::Validation(_)));

            let updated = set_push_token(conn, profile.id, Some("ExponentPushToken[xyz-123]"))?;
            assert_eq!(updated.push_token.as_deref(), Some("ExponentPushToken[xyz-123]"));

            let cleared = set_push_token(conn, profile.id, None)?;
            assert!(cleared.push_token.is_none());

            assert!(matches!(set_availability(conn, 999, true), Err(Error::NotFound)));
            Ok(())
        });
    }

    #[test]
    fn test_register_device_is_idempotent() {
        run_test_in_transaction(|conn| {
            let first = register_device(conn, "ExpoPushToken[device1]", None)?;
            let second = register_device(conn, "ExpoPushToken[device1]", Some(StaffRole::Driver))?;
            assert_eq!(first.id, second.id);
            assert_eq!(second.role.as_deref(), Some("driver"));

            let count: i64 = device_tokens::table.count().get_result(conn)?;
            assert_eq!(count, 1);

            assert!(register_device(conn, "ExpoPushToken[]", None).is_err());
            Ok(())
        });
    }

    #[test]
    fn test_anonymous_context() {
        let ctx = SessionContext::anonymous();
        assert!(matches!(ctx.require_profile(), Err(Error::Unauthorized)));
        assert!(matches!(ctx.require_admin(), Err(Error::Unauthorized)));
        assert_eq!(ctx.profile_id(), None);
    }
}
