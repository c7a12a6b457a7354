use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::domain::{DomainError, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::registration;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, new_id, now_rfc3339, queue_notification, sha256_hex,
};
use crate::ipc::types::{AppState, Request};

pub fn hash_password(password: &str) -> String {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    let digest = sha256_hex(&format!("{}{}", salt, password));
    format!("{}${}", salt, digest)
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    sha256_hex(&format!("{}{}", salt, password)) == digest
}

pub fn validate_credentials(email: &str, password: &str) -> Result<(), DomainError> {
    if !email.contains('@') || email.trim().len() < 3 {
        return Err(DomainError::Validation(format!("invalid email: {}", email)));
    }
    if password.len() < 6 {
        return Err(DomainError::Validation(
            "password must be at least 6 characters".into(),
        ));
    }
    Ok(())
}

/// Creates the identity row. Either confirmed immediately, or pending with a
/// confirmation token whose hash is stored; the raw token goes onto the
/// email outbox (delivery is an external sink) and back to the caller.
pub fn create_identity(
    conn: &Connection,
    email: &str,
    password: &str,
    metadata: Option<&serde_json::Value>,
    require_confirmation: bool,
) -> Result<(String, Option<String>), HandlerErr> {
    validate_credentials(email, password)?;

    let existing: Option<String> = conn
        .query_row("SELECT id FROM identities WHERE email = ?", [email], |r| {
            r.get(0)
        })
        .optional()?;
    if existing.is_some() {
        return Err(DomainError::Auth(format!("email already registered: {}", email)).into());
    }

    let identity_id = new_id();
    let token = if require_confirmation {
        Some(uuid::Uuid::new_v4().simple().to_string())
    } else {
        None
    };
    let token_hash = token.as_deref().map(sha256_hex);
    let confirmed_at = if require_confirmation {
        None
    } else {
        Some(now_rfc3339())
    };

    conn.execute(
        "INSERT INTO identities(id, email, password_hash, metadata, confirmation_token_hash, confirmed_at, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &identity_id,
            email,
            hash_password(password),
            metadata.map(|m| m.to_string()),
            token_hash,
            confirmed_at,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::from(DomainError::Auth(format!("identity creation failed: {}", e))))?;

    if let Some(t) = token.as_deref() {
        queue_notification(
            conn,
            Some(&identity_id),
            "email",
            "Confirm your registration",
            &format!("Use confirmation token {} to complete sign-up.", t),
            "queued",
        )?;
    }

    Ok((identity_id, token))
}

pub fn create_session(conn: &Connection, identity_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let session_id = new_id();
    let access_token = uuid::Uuid::new_v4().simple().to_string();
    let refresh_token = uuid::Uuid::new_v4().simple().to_string();
    conn.execute(
        "INSERT INTO sessions(id, identity_id, access_token, refresh_token, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &session_id,
            identity_id,
            &access_token,
            &refresh_token,
            now_rfc3339(),
        ),
    )?;
    Ok(json!({
        "sessionId": session_id,
        "accessToken": access_token,
        "refreshToken": refresh_token
    }))
}

fn sign_up(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let require_confirmation = params
        .get("requireConfirmation")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let metadata = params.get("metadata").filter(|v| !v.is_null());

    let (identity_id, token) =
        create_identity(conn, &email, &password, metadata, require_confirmation)?;

    if let Some(token) = token {
        return Ok(json!({
            "confirmationRequired": true,
            "identityId": identity_id,
            "confirmationToken": token,
            "redirectUrl": get_optional_str(params, "redirectUrl"),
        }));
    }

    let session = create_session(conn, &identity_id)?;
    Ok(json!({
        "user": { "identityId": identity_id, "email": email },
        "session": session
    }))
}

fn identity_by_token_hash(conn: &Connection, token_hash: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT id FROM identities WHERE confirmation_token_hash = ?",
            [token_hash],
            |r| r.get(0),
        )
        .optional()?)
}

fn identity_by_session_tokens(
    conn: &Connection,
    access_token: &str,
    refresh_token: &str,
) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT identity_id FROM sessions WHERE access_token = ? AND refresh_token = ?",
            [access_token, refresh_token],
            |r| r.get(0),
        )
        .optional()?)
}

fn identity_by_session_id(conn: &Connection, session_id: &str) -> Result<Option<String>, HandlerErr> {
    Ok(conn
        .query_row(
            "SELECT identity_id FROM sessions WHERE id = ?",
            [session_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Confirmation callbacks arrive with whatever parameters the redirect kept.
/// Five verification strategies are tried in order until one resolves an
/// identity: explicit token hash, raw token, type-qualified token, a
/// session token pair, and finally an already-active session id.
fn resolve_confirmation_identity(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    if let Some(token_hash) = get_optional_str(params, "tokenHash") {
        if let Some(id) = identity_by_token_hash(conn, &token_hash)? {
            return Ok(id);
        }
    }
    if let Some(token) = get_optional_str(params, "token") {
        if let Some(id) = identity_by_token_hash(conn, &sha256_hex(&token))? {
            return Ok(id);
        }
    }
    if let (Some(kind), Some(token)) = (
        get_optional_str(params, "type"),
        get_optional_str(params, "token"),
    ) {
        if matches!(kind.as_str(), "signup" | "email" | "magiclink") {
            if let Some(id) = identity_by_token_hash(conn, &sha256_hex(&token))? {
                return Ok(id);
            }
        }
    }
    if let (Some(access), Some(refresh)) = (
        get_optional_str(params, "accessToken"),
        get_optional_str(params, "refreshToken"),
    ) {
        if let Some(id) = identity_by_session_tokens(conn, &access, &refresh)? {
            return Ok(id);
        }
    }
    if let Some(session_id) = get_optional_str(params, "sessionId") {
        if let Some(id) = identity_by_session_id(conn, &session_id)? {
            return Ok(id);
        }
    }
    Err(DomainError::Auth("no confirmation verification strategy succeeded".into()).into())
}

fn confirm(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let identity_id = resolve_confirmation_identity(conn, params)?;

    let confirmed_at: Option<String> = conn.query_row(
        "SELECT confirmed_at FROM identities WHERE id = ?",
        [&identity_id],
        |r| r.get(0),
    )?;
    let confirmed_at = match confirmed_at {
        Some(ts) => ts,
        None => {
            let ts = now_rfc3339();
            conn.execute(
                "UPDATE identities SET confirmed_at = ? WHERE id = ?",
                (&ts, &identity_id),
            )?;
            ts
        }
    };

    // Deferred provisioning: re-invoked safely even when the profile exists.
    let profile = registration::provision_from_metadata(conn, &identity_id)?;

    Ok(json!({
        "identityId": identity_id,
        "confirmedAt": confirmed_at,
        "profile": profile
    }))
}

fn sign_in(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;

    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT id, password_hash, confirmed_at FROM identities WHERE email = ?",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((identity_id, password_hash, confirmed_at)) = row else {
        return Err(DomainError::Auth("invalid email or password".into()).into());
    };
    if !verify_password(&password, &password_hash) {
        return Err(DomainError::Auth("invalid email or password".into()).into());
    }
    if confirmed_at.is_none() {
        return Err(DomainError::Auth("email is not confirmed yet".into()).into());
    }

    let session = create_session(conn, &identity_id)?;
    Ok(json!({
        "user": { "identityId": identity_id, "email": email },
        "session": session
    }))
}

/// Profile summary attached to the current-user lookup so callers can show
/// access indicators without a second round trip.
fn profile_summary(conn: &Connection, identity_id: &str) -> Result<serde_json::Value, HandlerErr> {
    for role in Role::all() {
        let sql = format!(
            "SELECT id, {}, status FROM {} WHERE identity_id = ?",
            role.human_id_column(),
            role.profile_table()
        );
        let row: Option<(String, String, String)> = conn
            .query_row(&sql, [identity_id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })
            .optional()?;
        if let Some((profile_id, human_id, status)) = row {
            return Ok(json!({
                "role": role.as_str(),
                "profileId": profile_id,
                "humanId": human_id,
                "status": status,
                "fullAccess": status == "APPROVED"
            }));
        }
    }
    Ok(serde_json::Value::Null)
}

fn get_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let access_token = get_required_str(params, "accessToken")?;
    let row: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT i.id, i.email, i.confirmed_at
             FROM sessions s JOIN identities i ON i.id = s.identity_id
             WHERE s.access_token = ?",
            [&access_token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((identity_id, email, confirmed_at)) = row else {
        return Err(DomainError::Auth("unknown access token".into()).into());
    };
    let profile = profile_summary(conn, &identity_id)?;
    Ok(json!({
        "identityId": identity_id,
        "email": email,
        "confirmedAt": confirmed_at,
        "profile": profile
    }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.signUp" => Some(with_conn(state, req, sign_up)),
        "auth.confirm" => Some(with_conn(state, req, confirm)),
        "auth.signIn" => Some(with_conn(state, req, sign_in)),
        "auth.getUser" => Some(with_conn(state, req, get_user)),
        _ => None,
    }
}
