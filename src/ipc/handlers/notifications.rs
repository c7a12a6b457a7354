use rusqlite::Connection;
use serde_json::json;

use crate::domain::DomainError;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{get_optional_str, get_required_str, queue_notification};
use crate::ipc::types::{AppState, Request};

fn list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let recipient = get_optional_str(params, "recipientIdentityId");
    let mut sql = String::from(
        "SELECT id, recipient_identity_id, channel, subject, body, status, created_at FROM notifications",
    );
    if recipient.is_some() {
        sql.push_str(" WHERE recipient_identity_id = ?");
    }
    sql.push_str(" ORDER BY created_at");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "notificationId": r.get::<_, String>(0)?,
            "recipientIdentityId": r.get::<_, Option<String>>(1)?,
            "channel": r.get::<_, String>(2)?,
            "subject": r.get::<_, String>(3)?,
            "body": r.get::<_, String>(4)?,
            "status": r.get::<_, String>(5)?,
            "createdAt": r.get::<_, String>(6)?,
        }))
    };
    let rows = match recipient {
        Some(id) => stmt
            .query_map([&id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
    };
    Ok(json!({ "notifications": rows }))
}

/// WhatsApp egress. With gateway credentials the message is queued for the
/// external proxy; without them the send is recorded as simulated. The
/// simulated path is a demo shim and must never be mistaken for delivery.
fn send_whatsapp(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let to = get_required_str(params, "to")?;
    let body = get_required_str(params, "body")?;
    if to.trim().is_empty() || body.trim().is_empty() {
        return Err(DomainError::Validation("recipient and body are required".into()).into());
    }

    let account_sid = get_optional_str(params, "accountSid");
    let auth_token = get_optional_str(params, "authToken");
    let from = get_optional_str(params, "from");
    let has_gateway = account_sid.as_deref().is_some_and(|s| !s.is_empty())
        && auth_token.as_deref().is_some_and(|s| !s.is_empty())
        && from.as_deref().is_some_and(|s| !s.is_empty());

    let status = if has_gateway { "queued" } else { "simulated" };
    if !has_gateway {
        tracing::warn!(to, "whatsapp gateway credentials absent; recording a simulated send");
    }

    let recipient = get_optional_str(params, "recipientIdentityId");
    let id = queue_notification(conn, recipient.as_deref(), "whatsapp", &to, &body, status)?;

    Ok(json!({
        "notificationId": id,
        "status": status,
        "simulated": !has_gateway,
        "sid": format!("WA{}", &id[..8]),
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
        "notifications.list" => Some(with_conn(state, req, list)),
        "notifications.sendWhatsapp" => Some(with_conn(state, req, send_whatsapp)),
        _ => None,
    }
}
