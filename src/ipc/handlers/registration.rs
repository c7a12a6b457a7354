use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::domain::{
    format_human_id, human_id_month_pattern, join_subject_list, time_derived_suffix, DomainError,
    Role,
};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::handlers::auth;
use crate::ipc::helpers::{
    get_optional_str, get_required_str, get_string_list, new_id, now_rfc3339, record_audit,
};
use crate::ipc::types::{AppState, Request};

/// Role-specific registration data. One shape for all three roles; the
/// role strategy decides which fields are required and which columns they
/// land in.
#[derive(Debug, Default, Clone)]
pub struct ProfileInput {
    pub full_name: String,
    pub class_level: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    pub subjects: String,
    pub batches: String,
    pub experience_years: Option<i64>,
}

pub fn validate_input(role: Role, input: &ProfileInput) -> Result<(), DomainError> {
    if input.full_name.trim().is_empty() {
        return Err(DomainError::Validation("full name is required".into()));
    }
    match role {
        Role::Student => {
            if input
                .class_level
                .as_deref()
                .map(str::trim)
                .unwrap_or("")
                .is_empty()
            {
                return Err(DomainError::Validation("class level is required".into()));
            }
            if input.subjects.trim().is_empty() {
                return Err(DomainError::Validation(
                    "at least one subject must be selected".into(),
                ));
            }
            if input.batches.trim().is_empty() {
                return Err(DomainError::Validation(
                    "at least one batch must be selected".into(),
                ));
            }
        }
        Role::Teacher => {
            if input.subjects.trim().is_empty() {
                return Err(DomainError::Validation(
                    "subject specialization is required".into(),
                ));
            }
        }
        Role::Admin => {}
    }
    Ok(())
}

/// `{PREFIX}{YYYY}{MM}{NNNN}` where NNNN is one past the count of ids already
/// issued this month. A failed count query falls back to current-time digits.
fn generate_human_id(conn: &Connection, role: Role) -> String {
    let now = Utc::now();
    let pattern = human_id_month_pattern(role.id_prefix(), now);
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE {} LIKE ?",
        role.profile_table(),
        role.human_id_column()
    );
    let suffix = match conn.query_row(&sql, [&pattern], |r| r.get::<_, i64>(0)) {
        Ok(count) => (count + 1) as u32,
        Err(e) => {
            tracing::warn!(role = role.as_str(), error = %e, "id count query failed; using time-derived suffix");
            time_derived_suffix(now)
        }
    };
    format_human_id(role.id_prefix(), now, suffix)
}

fn insert_profile(
    conn: &Connection,
    role: Role,
    identity_id: &str,
    input: &ProfileInput,
    human_id: &str,
) -> rusqlite::Result<String> {
    let profile_id = new_id();
    match role {
        Role::Student => {
            conn.execute(
                "INSERT INTO student_profiles(id, identity_id, full_name, class_level, guardian_name,
                    guardian_phone, selected_subjects, selected_batches, enrollment_no, status, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', ?)",
                (
                    &profile_id,
                    identity_id,
                    &input.full_name,
                    input.class_level.as_deref().unwrap_or(""),
                    input.guardian_name.as_deref(),
                    input.guardian_phone.as_deref(),
                    &input.subjects,
                    &input.batches,
                    human_id,
                    now_rfc3339(),
                ),
            )?;
        }
        Role::Teacher => {
            conn.execute(
                "INSERT INTO teacher_profiles(id, identity_id, full_name, subject_specialization,
                    experience_years, employee_id, status, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, 'PENDING', ?)",
                (
                    &profile_id,
                    identity_id,
                    &input.full_name,
                    &input.subjects,
                    input.experience_years,
                    human_id,
                    now_rfc3339(),
                ),
            )?;
        }
        Role::Admin => {
            conn.execute(
                "INSERT INTO admin_profiles(id, identity_id, full_name, employee_id, status, created_at)
                 VALUES(?, ?, ?, ?, 'PENDING', ?)",
                (
                    &profile_id,
                    identity_id,
                    &input.full_name,
                    human_id,
                    now_rfc3339(),
                ),
            )?;
        }
    }
    Ok(profile_id)
}

/// Failure shapes that read like a policy/permission denial. The linkage
/// between a fresh identity and its row policies can lag, so one retry after
/// a fixed delay absorbs it.
fn is_permission_pattern(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("permission")
        || m.contains("policy")
        || m.contains("row-level")
        || m.contains("not authorized")
        || m.contains("locked")
        || m.contains("busy")
}

fn is_human_id_conflict(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("unique") && (m.contains("enrollment_no") || m.contains("employee_id"))
}

fn existing_profile(
    conn: &Connection,
    role: Role,
    identity_id: &str,
) -> Result<Option<serde_json::Value>, HandlerErr> {
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
    Ok(row.map(|(profile_id, human_id, status)| {
        json!({
            "role": role.as_str(),
            "profileId": profile_id,
            "humanId": human_id,
            "status": status,
            "created": false
        })
    }))
}

/// The provisioner proper: exactly one profile per identity per role, status
/// PENDING, fresh human identifier. Safe to re-invoke; an existing profile
/// short-circuits to a no-op.
pub fn provision_profile(
    conn: &Connection,
    role: Role,
    identity_id: &str,
    input: &ProfileInput,
) -> Result<serde_json::Value, HandlerErr> {
    validate_input(role, input)?;

    if let Some(existing) = existing_profile(conn, role, identity_id)? {
        return Ok(existing);
    }

    let mut human_id = generate_human_id(conn, role);
    let mut rls_retried = false;
    let mut id_regens = 0u32;
    let profile_id = loop {
        match insert_profile(conn, role, identity_id, input, &human_id) {
            Ok(id) => break id,
            Err(e) => {
                let msg = e.to_string();
                if is_human_id_conflict(&msg) && id_regens < 3 {
                    // Advisory suffix collided under concurrent sign-ups;
                    // regenerate from the clock and retry.
                    id_regens += 1;
                    human_id =
                        format_human_id(role.id_prefix(), Utc::now(), time_derived_suffix(Utc::now()));
                    continue;
                }
                if is_permission_pattern(&msg) && !rls_retried {
                    tracing::warn!(role = role.as_str(), error = %msg, "profile insert hit a policy-shaped failure; retrying once");
                    rls_retried = true;
                    std::thread::sleep(std::time::Duration::from_secs(1));
                    continue;
                }
                return Err(DomainError::ProfileCreation(msg).into());
            }
        }
    };

    record_audit(
        conn,
        Some(identity_id),
        "profile.provisioned",
        role.profile_table(),
        &profile_id,
        Some(json!({ "humanId": human_id })),
    )?;

    Ok(json!({
        "role": role.as_str(),
        "profileId": profile_id,
        "humanId": human_id,
        "status": "PENDING",
        "created": true
    }))
}

fn input_from_params(params: &serde_json::Value) -> ProfileInput {
    ProfileInput {
        full_name: get_optional_str(params, "fullName").unwrap_or_default(),
        class_level: get_optional_str(params, "classLevel"),
        guardian_name: get_optional_str(params, "guardianName"),
        guardian_phone: get_optional_str(params, "guardianPhone"),
        subjects: join_subject_list(&get_string_list(params, "subjects")),
        batches: join_subject_list(&get_string_list(params, "batches")),
        experience_years: params.get("experienceYears").and_then(|v| v.as_i64()),
    }
}

/// Registration data carried on the identity while confirmation is pending.
/// Collections are stored as comma-joined strings, not arrays.
fn metadata_from_input(role: Role, input: &ProfileInput) -> serde_json::Value {
    json!({
        "role": role.as_str(),
        "fullName": input.full_name,
        "classLevel": input.class_level,
        "guardianName": input.guardian_name,
        "guardianPhone": input.guardian_phone,
        "subjects": input.subjects,
        "batches": input.batches,
        "experienceYears": input.experience_years,
    })
}

/// Confirmation-callback re-entry: rebuild the registration input from the
/// identity metadata and provision. Identities without registration
/// metadata (plain sign-ups) provision nothing.
pub fn provision_from_metadata(
    conn: &Connection,
    identity_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let metadata: Option<String> = conn
        .query_row(
            "SELECT metadata FROM identities WHERE id = ?",
            [identity_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let Some(raw) = metadata else {
        return Ok(serde_json::Value::Null);
    };
    let parsed: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(identity_id, error = %e, "identity metadata is not valid json; skipping provisioning");
            return Ok(serde_json::Value::Null);
        }
    };
    let Some(role) = parsed
        .get("role")
        .and_then(|v| v.as_str())
        .and_then(Role::parse)
    else {
        return Ok(serde_json::Value::Null);
    };

    let input = ProfileInput {
        full_name: get_optional_str(&parsed, "fullName").unwrap_or_default(),
        class_level: get_optional_str(&parsed, "classLevel"),
        guardian_name: get_optional_str(&parsed, "guardianName"),
        guardian_phone: get_optional_str(&parsed, "guardianPhone"),
        subjects: get_optional_str(&parsed, "subjects").unwrap_or_default(),
        batches: get_optional_str(&parsed, "batches").unwrap_or_default(),
        experience_years: parsed.get("experienceYears").and_then(|v| v.as_i64()),
    };
    provision_profile(conn, role, identity_id, &input)
}

fn submit(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role_raw = get_required_str(params, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| HandlerErr::bad_params(format!("unknown role: {}", role_raw)))?;
    let email = get_required_str(params, "email")?;
    let password = get_required_str(params, "password")?;
    let require_confirmation = params
        .get("requireConfirmation")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let input = input_from_params(params);
    // Reject bad registrations before any identity is created.
    validate_input(role, &input)?;
    auth::validate_credentials(&email, &password)?;

    let metadata = metadata_from_input(role, &input);
    let (identity_id, token) =
        auth::create_identity(conn, &email, &password, Some(&metadata), require_confirmation)?;

    if let Some(token) = token {
        // Provisioning is deferred to the confirmation callback.
        return Ok(json!({
            "confirmationRequired": true,
            "identityId": identity_id,
            "confirmationToken": token
        }));
    }

    let profile = provision_profile(conn, role, &identity_id, &input)?;
    Ok(json!({
        "identityId": identity_id,
        "profile": profile
    }))
}

fn provision_pending(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let identity_id = get_required_str(params, "identityId")?;
    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM identities WHERE id = ?",
            [&identity_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(DomainError::NotFound(format!("unknown identity: {}", identity_id)).into());
    }
    let profile = provision_from_metadata(conn, &identity_id)?;
    Ok(json!({ "identityId": identity_id, "profile": profile }))
}

fn with_conn(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&rusqlite::Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
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
        "registration.submit" => Some(with_conn(state, req, submit)),
        "registration.provisionPending" => Some(with_conn(state, req, provision_pending)),
        _ => None,
    }
}
