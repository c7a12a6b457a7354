use std::collections::BTreeMap;

use rusqlite::Connection;
use serde_json::json;

use crate::db;
use crate::domain::{DomainError, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{record_audit, resolve_actor};
use crate::ipc::types::{AppState, Request};

/// Cascading deletes for one profile. Dependent fact rows go first so the
/// foreign keys stay satisfied. Returns false when the profile row did not
/// exist.
fn delete_profile_cascade(
    conn: &Connection,
    role: Role,
    profile_id: &str,
) -> Result<bool, HandlerErr> {
    if role == Role::Student {
        conn.execute(
            "DELETE FROM exam_results WHERE student_profile_id = ?",
            [profile_id],
        )?;
        conn.execute(
            "DELETE FROM fee_payments WHERE student_profile_id = ?",
            [profile_id],
        )?;
    }
    let sql = format!("DELETE FROM {} WHERE id = ?", role.profile_table());
    let deleted = conn.execute(&sql, [profile_id])?;
    Ok(deleted > 0)
}

/// Bulk delete runs as one transaction: either every requested profile (and
/// its dependents) goes, or none do.
fn bulk_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let actor = resolve_actor(conn, params)?;
    if actor.role != Role::Admin {
        return Err(DomainError::Permission("bulk delete is admin-only".into()).into());
    }

    let Some(items) = params.get("profiles").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("missing profiles"));
    };

    // Partition by role first so the response can report per-role counts.
    let mut by_role: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for item in items {
        let role = item
            .get("role")
            .and_then(|v| v.as_str())
            .and_then(Role::parse)
            .ok_or_else(|| HandlerErr::bad_params("each profile needs a valid role"))?;
        let profile_id = item
            .get("profileId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::bad_params("each profile needs a profileId"))?;
        by_role
            .entry(role.as_str())
            .or_default()
            .push(profile_id.to_string());
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let mut deleted = serde_json::Map::new();
    let mut missing: Vec<serde_json::Value> = Vec::new();
    for (role_name, ids) in &by_role {
        let role = Role::parse(role_name).unwrap_or(Role::Student);
        let mut count = 0i64;
        for profile_id in ids {
            if delete_profile_cascade(&tx, role, profile_id)? {
                count += 1;
            } else {
                missing.push(json!({ "role": role_name, "profileId": profile_id }));
            }
        }
        deleted.insert(role_name.to_string(), json!(count));
    }

    record_audit(
        &tx,
        Some(&actor.identity_id),
        "admin.bulk_delete",
        "profiles",
        "*",
        Some(json!({ "deleted": deleted, "missing": missing })),
    )?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "deleted": deleted, "missing": missing }))
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn audit_export_csv(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    // Older workspaces may predate the audit table; the probe assumes
    // presence on failure and the query then reports the real error.
    if !db::table_exists(conn, "audit_log") {
        return Ok(json!({
            "csv": "timestamp,actor,action,entity,entity_id,detail\n",
            "rows": 0
        }));
    }

    let mut stmt = conn.prepare(
        "SELECT created_at, actor_identity_id, action, entity, entity_id, detail
         FROM audit_log ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<String>>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut csv = String::from("timestamp,actor,action,entity,entity_id,detail\n");
    let count = rows.len();
    for (created_at, actor, action, entity, entity_id, detail) in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(&created_at),
            csv_quote(actor.as_deref().unwrap_or("")),
            csv_quote(&action),
            csv_quote(&entity),
            csv_quote(&entity_id),
            csv_quote(detail.as_deref().unwrap_or(""))
        ));
    }
    Ok(json!({ "csv": csv, "rows": count }))
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
        "admin.bulkDelete" => Some(with_conn(state, req, bulk_delete)),
        "admin.auditExportCsv" => Some(with_conn(state, req, audit_export_csv)),
        _ => None,
    }
}
