use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("campus.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS identities(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            metadata TEXT,
            confirmation_token_hash TEXT,
            confirmed_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL,
            access_token TEXT NOT NULL UNIQUE,
            refresh_token TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(identity_id) REFERENCES identities(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_identity ON sessions(identity_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_profiles(
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            class_level TEXT NOT NULL,
            guardian_name TEXT,
            guardian_phone TEXT,
            selected_subjects TEXT NOT NULL,
            selected_batches TEXT NOT NULL,
            enrollment_no TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'PENDING',
            approved_by TEXT,
            approval_at TEXT,
            rejection_reason TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(identity_id) REFERENCES identities(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_profiles_status ON student_profiles(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_profiles(
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            subject_specialization TEXT NOT NULL,
            experience_years INTEGER,
            employee_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'PENDING',
            approved_by TEXT,
            approval_at TEXT,
            rejection_reason TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(identity_id) REFERENCES identities(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_profiles_status ON teacher_profiles(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS admin_profiles(
            id TEXT PRIMARY KEY,
            identity_id TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            employee_id TEXT NOT NULL UNIQUE,
            status TEXT NOT NULL DEFAULT 'PENDING',
            approved_by TEXT,
            approval_at TEXT,
            rejection_reason TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(identity_id) REFERENCES identities(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject TEXT NOT NULL,
            class_level TEXT NOT NULL,
            max_marks REAL NOT NULL,
            exam_date TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_results(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_profile_id TEXT NOT NULL,
            marks REAL NOT NULL,
            feedback TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_profile_id) REFERENCES student_profiles(id),
            UNIQUE(exam_id, student_profile_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_exam ON exam_results(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_results_student ON exam_results(student_profile_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_structures(
            id TEXT PRIMARY KEY,
            class_level TEXT NOT NULL,
            name TEXT NOT NULL,
            amount REAL NOT NULL,
            due_date TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS fee_payments(
            id TEXT PRIMARY KEY,
            fee_structure_id TEXT NOT NULL,
            student_profile_id TEXT NOT NULL,
            amount_paid REAL NOT NULL,
            method TEXT NOT NULL,
            reference TEXT,
            paid_at TEXT NOT NULL,
            FOREIGN KEY(fee_structure_id) REFERENCES fee_structures(id),
            FOREIGN KEY(student_profile_id) REFERENCES student_profiles(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_student ON fee_payments(student_profile_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_fee_payments_structure ON fee_payments(fee_structure_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications(
            id TEXT PRIMARY KEY,
            recipient_identity_id TEXT,
            channel TEXT NOT NULL,
            subject TEXT NOT NULL,
            body TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_identity_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            actor_identity_id TEXT,
            action TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            detail TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity, entity_id)",
        [],
    )?;

    // Workspaces created before guardian contacts and outbox statuses existed
    // need the columns added in place.
    ensure_student_profiles_guardian_phone(&conn)?;
    ensure_notifications_status(&conn)?;

    Ok(conn)
}

fn ensure_student_profiles_guardian_phone(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_profiles", "guardian_phone")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE student_profiles ADD COLUMN guardian_phone TEXT", [])?;
    Ok(())
}

fn ensure_notifications_status(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "notifications", "status")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE notifications ADD COLUMN status TEXT NOT NULL DEFAULT 'queued'",
        [],
    )?;
    Ok(())
}

/// Probe for a table. A failed probe does not prove absence (the same shape
/// of error covers a permission denial), so the fallback is to assume the
/// table exists and say so in the log.
pub fn table_exists(conn: &Connection, table: &str) -> bool {
    let probe: Result<Option<i64>, rusqlite::Error> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |r| r.get(0),
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        });
    match probe {
        Ok(v) => v.is_some(),
        Err(e) => {
            tracing::warn!(table, error = %e, "table probe failed; assuming table exists");
            true
        }
    }
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
