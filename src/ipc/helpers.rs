use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::domain::{DomainError, Role};
use crate::ipc::error::HandlerErr;

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn get_required_f64(params: &serde_json::Value, key: &str) -> Result<f64, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

/// Accepts either a JSON array of strings or an already comma-joined string.
/// Collections cross the identity-metadata boundary as strings, so both
/// shapes show up in practice.
pub fn get_string_list(params: &serde_json::Value, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(serde_json::Value::String(s)) => crate::domain::split_subject_list(s),
        _ => Vec::new(),
    }
}

pub fn non_empty_trimmed(s: &str) -> Option<String> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

/// Explicit authenticated-actor context; every mutating call carries one
/// instead of reading ambient logged-in state.
pub struct ActorCtx {
    pub identity_id: String,
    pub role: Role,
    pub subjects: String,
}

/// Resolves `params.actor = {identityId, role}` against the actor's own
/// profile row. Teachers must hold an APPROVED profile to act.
pub fn resolve_actor(conn: &Connection, params: &serde_json::Value) -> Result<ActorCtx, HandlerErr> {
    let actor = params
        .get("actor")
        .ok_or_else(|| HandlerErr::bad_params("missing actor"))?;
    let identity_id = get_required_str(actor, "identityId")?;
    let role_raw = get_required_str(actor, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown actor role: {}", role_raw)))?;

    match role {
        Role::Admin => {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM admin_profiles WHERE identity_id = ?",
                    [&identity_id],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(DomainError::Permission("actor has no admin profile".into()).into());
            }
            Ok(ActorCtx {
                identity_id,
                role,
                subjects: String::new(),
            })
        }
        Role::Teacher => {
            let row: Option<(String, String)> = conn
                .query_row(
                    "SELECT status, subject_specialization FROM teacher_profiles WHERE identity_id = ?",
                    [&identity_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let Some((status, subjects)) = row else {
                return Err(DomainError::Permission("actor has no teacher profile".into()).into());
            };
            if status != "APPROVED" {
                return Err(
                    DomainError::Permission("teacher profile is not approved".into()).into(),
                );
            }
            Ok(ActorCtx {
                identity_id,
                role,
                subjects,
            })
        }
        Role::Student => {
            Err(DomainError::Permission("students cannot act as approvers".into()).into())
        }
    }
}

pub fn record_audit(
    conn: &Connection,
    actor_identity_id: Option<&str>,
    action: &str,
    entity: &str,
    entity_id: &str,
    detail: Option<serde_json::Value>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO audit_log(id, actor_identity_id, action, entity, entity_id, detail, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            new_id(),
            actor_identity_id,
            action,
            entity,
            entity_id,
            detail.map(|d| d.to_string()),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "audit_log" })),
    })?;
    Ok(())
}

/// The dispatcher itself is a sink; rows land on the outbox and delivery is
/// someone else's problem.
pub fn queue_notification(
    conn: &Connection,
    recipient_identity_id: Option<&str>,
    channel: &str,
    subject: &str,
    body: &str,
    status: &str,
) -> Result<String, HandlerErr> {
    let id = new_id();
    conn.execute(
        "INSERT INTO notifications(id, recipient_identity_id, channel, subject, body, status, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            recipient_identity_id,
            channel,
            subject,
            body,
            status,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_update_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "notifications" })),
    })?;
    Ok(id)
}
