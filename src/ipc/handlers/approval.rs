use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::domain::{subjects_intersect, DomainError, ProfileStatus, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, now_rfc3339, queue_notification, record_audit,
    resolve_actor, ActorCtx,
};
use crate::ipc::types::{AppState, Request};

struct ProfileRow {
    profile_id: String,
    identity_id: String,
    full_name: String,
    status: ProfileStatus,
}

fn load_profile(conn: &Connection, role: Role, profile_id: &str) -> Result<ProfileRow, HandlerErr> {
    let sql = format!(
        "SELECT id, identity_id, full_name, status FROM {} WHERE id = ?",
        role.profile_table()
    );
    let row: Option<(String, String, String, String)> = conn
        .query_row(&sql, [profile_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .optional()?;
    let Some((profile_id, identity_id, full_name, status_raw)) = row else {
        return Err(DomainError::NotFound(format!(
            "{} profile not found: {}",
            role.as_str(),
            profile_id
        ))
        .into());
    };
    let status = ProfileStatus::parse(&status_raw).ok_or_else(|| {
        HandlerErr::new(
            "db_query_failed",
            format!("profile {} has unknown status {}", profile_id, status_raw),
        )
    })?;
    Ok(ProfileRow {
        profile_id,
        identity_id,
        full_name,
        status,
    })
}

fn check_actor_may_decide(actor: &ActorCtx, role: Role) -> Result<(), HandlerErr> {
    if actor.role == Role::Teacher && role != Role::Student {
        return Err(DomainError::Permission(
            "teachers may only decide student registrations".into(),
        )
        .into());
    }
    Ok(())
}

/// One decision path for both outcomes. The happy path is a conditional
/// update predicated on status = PENDING, so two racing approvers cannot
/// both win a blind write. When the predicate misses:
/// - same terminal state as requested: idempotent no-op success
/// - different terminal state: applied only by an admin, recorded as an
///   override with the previous status kept in the audit trail
fn decide(
    conn: &Connection,
    params: &serde_json::Value,
    target: ProfileStatus,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = resolve_actor(conn, params)?;
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;
    let profile_id = get_required_str(params, "profileId")?;
    check_actor_may_decide(&actor, role)?;

    let reason = match target {
        ProfileStatus::Rejected => {
            let reason = get_optional_str(params, "reason").unwrap_or_default();
            if reason.trim().is_empty() {
                return Err(
                    DomainError::Validation("a rejection reason is required".into()).into(),
                );
            }
            Some(reason)
        }
        _ => None,
    };

    let profile = load_profile(conn, role, &profile_id)?;
    let decided_at = now_rfc3339();

    let cas_sql = format!(
        "UPDATE {} SET status = ?, approved_by = ?, approval_at = ?, rejection_reason = ?
         WHERE id = ? AND status = 'PENDING'",
        role.profile_table()
    );
    let changed = conn
        .execute(
            &cas_sql,
            (
                target.as_str(),
                &actor.identity_id,
                &decided_at,
                reason.as_deref(),
                &profile.profile_id,
            ),
        )
        .map_err(|e| HandlerErr::from(DomainError::Persistence(e.to_string())))?;

    let mut overrode: Option<&'static str> = None;
    if changed == 0 {
        // Lost the race or the profile was already decided; re-read and
        // resolve against the terminal state.
        let current = load_profile(conn, role, &profile_id)?;
        if current.status == target {
            return Ok(json!({
                "profileId": profile.profile_id,
                "status": target.as_str(),
                "changed": false
            }));
        }
        if actor.role != Role::Admin {
            return Err(DomainError::Permission(format!(
                "profile is already {}; only an admin may override",
                current.status.as_str()
            ))
            .into());
        }
        let override_sql = format!(
            "UPDATE {} SET status = ?, approved_by = ?, approval_at = ?, rejection_reason = ?
             WHERE id = ?",
            role.profile_table()
        );
        conn.execute(
            &override_sql,
            (
                target.as_str(),
                &actor.identity_id,
                &decided_at,
                reason.as_deref(),
                &profile.profile_id,
            ),
        )
        .map_err(|e| HandlerErr::from(DomainError::Persistence(e.to_string())))?;
        overrode = Some(current.status.as_str());
    }

    let action = match target {
        ProfileStatus::Approved => "profile.approved",
        ProfileStatus::Rejected => "profile.rejected",
        ProfileStatus::Pending => unreachable!("pending is not a decision target"),
    };
    record_audit(
        conn,
        Some(&actor.identity_id),
        if overrode.is_some() {
            "profile.decision_overridden"
        } else {
            action
        },
        role.profile_table(),
        &profile.profile_id,
        Some(json!({
            "target": target.as_str(),
            "previousStatus": overrode,
            "reason": reason.as_deref(),
        })),
    )?;

    let body = match target {
        ProfileStatus::Approved => format!(
            "Hello {}, your {} registration has been approved.",
            profile.full_name,
            role.as_str()
        ),
        _ => format!(
            "Hello {}, your {} registration was rejected: {}",
            profile.full_name,
            role.as_str(),
            reason.as_deref().unwrap_or("")
        ),
    };
    queue_notification(
        conn,
        Some(&profile.identity_id),
        "email",
        "Registration status update",
        &body,
        "queued",
    )?;

    Ok(json!({
        "profileId": profile.profile_id,
        "status": target.as_str(),
        "approvedBy": actor.identity_id,
        "approvalAt": decided_at,
        "changed": true,
        "overrodeStatus": overrode,
    }))
}

fn pending_students(
    conn: &Connection,
    subject_scope: Option<&str>,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, full_name, class_level, selected_subjects, selected_batches, enrollment_no, created_at
         FROM student_profiles WHERE status = 'PENDING' ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(rows
        .into_iter()
        .filter(|(_, _, _, subjects, _, _, _)| match subject_scope {
            // Teachers only see students whose selected subjects intersect
            // their specialization.
            Some(scope) => subjects_intersect(scope, subjects),
            None => true,
        })
        .map(
            |(id, full_name, class_level, subjects, batches, enrollment_no, created_at)| {
                json!({
                    "role": "student",
                    "profileId": id,
                    "fullName": full_name,
                    "classLevel": class_level,
                    "selectedSubjects": subjects,
                    "selectedBatches": batches,
                    "humanId": enrollment_no,
                    "createdAt": created_at
                })
            },
        )
        .collect())
}

fn pending_staff(conn: &Connection, role: Role) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let sql = format!(
        "SELECT id, full_name, employee_id, created_at FROM {} WHERE status = 'PENDING' ORDER BY created_at",
        role.profile_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(rows
        .into_iter()
        .map(|(id, full_name, employee_id, created_at)| {
            json!({
                "role": role.as_str(),
                "profileId": id,
                "fullName": full_name,
                "humanId": employee_id,
                "createdAt": created_at
            })
        })
        .collect())
}

fn pending_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = resolve_actor(conn, params)?;
    let profiles = match actor.role {
        Role::Teacher => pending_students(conn, Some(&actor.subjects))?,
        Role::Admin => {
            let mut all = pending_students(conn, None)?;
            all.extend(pending_staff(conn, Role::Teacher)?);
            all.extend(pending_staff(conn, Role::Admin)?);
            all
        }
        Role::Student => unreachable!("resolve_actor rejects student actors"),
    };
    Ok(json!({ "profiles": profiles }))
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
        "approval.pendingList" => Some(with_conn(state, req, pending_list)),
        "approval.approve" => Some(with_conn(state, req, |conn, params| {
            decide(conn, params, ProfileStatus::Approved)
        })),
        "approval.reject" => Some(with_conn(state, req, |conn, params| {
            decide(conn, params, ProfileStatus::Rejected)
        })),
        _ => None,
    }
}
