use chrono::{Duration, Utc};
use rusqlite::Connection;
use serde_json::json;

use crate::domain::{subjects_intersect, DomainError, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::resolve_actor;
use crate::ipc::types::{AppState, Request};

fn count_where(conn: &Connection, table: &str, predicate: &str) -> Result<i64, HandlerErr> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, predicate);
    Ok(conn.query_row(&sql, [], |r| r.get(0))?)
}

fn count_recent(conn: &Connection, table: &str, since: &str) -> Result<i64, HandlerErr> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE created_at >= ?", table);
    Ok(conn.query_row(&sql, [since], |r| r.get(0))?)
}

fn role_counts(conn: &Connection, role: Role, since: &str) -> Result<serde_json::Value, HandlerErr> {
    let table = role.profile_table();
    Ok(json!({
        "total": count_where(conn, table, "1=1")?,
        "approved": count_where(conn, table, "status = 'APPROVED'")?,
        "pending": count_where(conn, table, "status = 'PENDING'")?,
        "rejected": count_where(conn, table, "status = 'REJECTED'")?,
        "createdLast7Days": count_recent(conn, table, since)?,
    }))
}

/// Fresh count queries on every call; the console tolerates read-after-write
/// consistency and nothing stronger.
fn admin_overview(
    conn: &Connection,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let since = (Utc::now() - Duration::days(7)).to_rfc3339();
    let mut roles = serde_json::Map::new();
    for role in Role::all() {
        roles.insert(role.as_str().to_string(), role_counts(conn, role, &since)?);
    }
    Ok(json!({
        "roles": roles,
        "exams": count_where(conn, "exams", "1=1")?,
        "examResults": count_where(conn, "exam_results", "1=1")?,
        "feePayments": count_where(conn, "fee_payments", "1=1")?,
        "queuedNotifications": count_where(conn, "notifications", "status = 'queued'")?,
    }))
}

fn teacher_overview(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let actor = resolve_actor(conn, params)?;
    if actor.role != Role::Teacher {
        return Err(DomainError::Permission("teacher overview requires a teacher actor".into()).into());
    }

    let mut stmt = conn.prepare(
        "SELECT status, selected_subjects FROM student_profiles",
    )?;
    let rows = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut pending = 0i64;
    let mut approved = 0i64;
    for (status, subjects) in rows {
        if !subjects_intersect(&actor.subjects, &subjects) {
            continue;
        }
        match status.as_str() {
            "PENDING" => pending += 1,
            "APPROVED" => approved += 1,
            _ => {}
        }
    }

    Ok(json!({
        "subjectScope": actor.subjects,
        "pendingStudents": pending,
        "approvedStudents": approved,
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
        "dashboard.adminOverview" => Some(with_conn(state, req, admin_overview)),
        "dashboard.teacherOverview" => Some(with_conn(state, req, teacher_overview)),
        _ => None,
    }
}
