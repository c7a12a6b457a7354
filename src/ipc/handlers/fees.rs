use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::domain::DomainError;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_f64, get_required_str, new_id, now_rfc3339,
};
use crate::ipc::types::{AppState, Request};

fn create_structure(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_level = get_required_str(params, "classLevel")?;
    let name = get_required_str(params, "name")?;
    let amount = get_required_f64(params, "amount")?;
    if name.trim().is_empty() {
        return Err(DomainError::Validation("fee name is required".into()).into());
    }
    if !amount.is_finite() || amount <= 0.0 {
        return Err(DomainError::Validation("fee amount must be positive".into()).into());
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO fee_structures(id, class_level, name, amount, due_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &id,
            &class_level,
            &name,
            amount,
            get_optional_str(params, "dueDate"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "feeStructureId": id }))
}

fn list_structures(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let class_level = get_optional_str(params, "classLevel");
    let mut sql = String::from(
        "SELECT id, class_level, name, amount, due_date FROM fee_structures",
    );
    if class_level.is_some() {
        sql.push_str(" WHERE class_level = ?");
    }
    sql.push_str(" ORDER BY created_at");

    let mut stmt = conn.prepare(&sql)?;
    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "feeStructureId": r.get::<_, String>(0)?,
            "classLevel": r.get::<_, String>(1)?,
            "name": r.get::<_, String>(2)?,
            "amount": r.get::<_, f64>(3)?,
            "dueDate": r.get::<_, Option<String>>(4)?,
        }))
    };
    let rows = match class_level {
        Some(level) => stmt
            .query_map([&level], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?,
    };
    Ok(json!({ "structures": rows }))
}

fn paid_so_far(
    conn: &Connection,
    fee_structure_id: &str,
    student_profile_id: &str,
) -> Result<f64, HandlerErr> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(amount_paid), 0) FROM fee_payments
         WHERE fee_structure_id = ? AND student_profile_id = ?",
        [fee_structure_id, student_profile_id],
        |r| r.get(0),
    )?)
}

fn record_payment(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let fee_structure_id = get_required_str(params, "feeStructureId")?;
    let student_profile_id = get_required_str(params, "studentProfileId")?;
    let amount_paid = get_required_f64(params, "amountPaid")?;
    let method = get_required_str(params, "method")?;

    let total: Option<f64> = conn
        .query_row(
            "SELECT amount FROM fee_structures WHERE id = ?",
            [&fee_structure_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(total) = total else {
        return Err(
            DomainError::NotFound(format!("fee structure not found: {}", fee_structure_id)).into(),
        );
    };
    let student_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM student_profiles WHERE id = ?",
            [&student_profile_id],
            |r| r.get(0),
        )
        .optional()?;
    if student_exists.is_none() {
        return Err(
            DomainError::NotFound(format!("student profile not found: {}", student_profile_id))
                .into(),
        );
    }

    if !amount_paid.is_finite() || amount_paid <= 0.0 {
        return Err(DomainError::Validation("payment amount must be positive".into()).into());
    }
    let already_paid = paid_so_far(conn, &fee_structure_id, &student_profile_id)?;
    let outstanding = total - already_paid;
    if amount_paid > outstanding + 1e-9 {
        return Err(DomainError::Validation(format!(
            "payment {} exceeds outstanding balance {}",
            amount_paid, outstanding
        ))
        .into());
    }

    let id = new_id();
    conn.execute(
        "INSERT INTO fee_payments(id, fee_structure_id, student_profile_id, amount_paid, method, reference, paid_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &fee_structure_id,
            &student_profile_id,
            amount_paid,
            &method,
            get_optional_str(params, "reference"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({
        "paymentId": id,
        "outstanding": outstanding - amount_paid
    }))
}

fn student_status(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_profile_id = get_required_str(params, "studentProfileId")?;
    let class_level: Option<String> = conn
        .query_row(
            "SELECT class_level FROM student_profiles WHERE id = ?",
            [&student_profile_id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(class_level) = class_level else {
        return Err(
            DomainError::NotFound(format!("student profile not found: {}", student_profile_id))
                .into(),
        );
    };

    let mut stmt = conn.prepare(
        "SELECT id, name, amount, due_date FROM fee_structures WHERE class_level = ? ORDER BY created_at",
    )?;
    let structures = stmt
        .query_map([&class_level], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut items = Vec::new();
    let mut total_due = 0.0;
    let mut total_paid = 0.0;
    for (fee_id, name, amount, due_date) in structures {
        let paid = paid_so_far(conn, &fee_id, &student_profile_id)?;
        total_due += amount;
        total_paid += paid;
        items.push(json!({
            "feeStructureId": fee_id,
            "name": name,
            "amount": amount,
            "paid": paid,
            "outstanding": amount - paid,
            "dueDate": due_date,
        }));
    }

    Ok(json!({
        "studentProfileId": student_profile_id,
        "classLevel": class_level,
        "fees": items,
        "totalDue": total_due,
        "totalPaid": total_paid,
        "totalOutstanding": total_due - total_paid,
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
        "fees.createStructure" => Some(with_conn(state, req, create_structure)),
        "fees.listStructures" => Some(with_conn(state, req, list_structures)),
        "fees.recordPayment" => Some(with_conn(state, req, record_payment)),
        "fees.studentStatus" => Some(with_conn(state, req, student_status)),
        _ => None,
    }
}
