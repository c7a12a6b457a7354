use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::domain::DomainError;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::{
    get_optional_str, get_required_f64, get_required_str, new_id, non_empty_trimmed, now_rfc3339,
};
use crate::ipc::types::{AppState, Request};

pub const RESULT_CSV_COLUMNS: [&str; 6] = [
    "enrollment_no",
    "student_name",
    "subject",
    "exam_name",
    "marks",
    "feedback",
];

fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// A mark is accepted iff `0 <= marks <= max_marks`.
pub fn validate_marks(marks: f64, max_marks: f64) -> Result<(), DomainError> {
    if !marks.is_finite() || marks < 0.0 || marks > max_marks {
        return Err(DomainError::Validation(format!(
            "marks {} out of range 0..={}",
            marks, max_marks
        )));
    }
    Ok(())
}

fn exam_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let subject = get_required_str(params, "subject")?;
    let class_level = get_required_str(params, "classLevel")?;
    let max_marks = get_required_f64(params, "maxMarks")?;
    if name.trim().is_empty() || subject.trim().is_empty() {
        return Err(DomainError::Validation("exam name and subject are required".into()).into());
    }
    if !max_marks.is_finite() || max_marks <= 0.0 {
        return Err(DomainError::Validation("maxMarks must be positive".into()).into());
    }

    let exam_id = new_id();
    conn.execute(
        "INSERT INTO exams(id, name, subject, class_level, max_marks, exam_date, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &name,
            &subject,
            &class_level,
            max_marks,
            get_optional_str(params, "examDate"),
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "examId": exam_id }))
}

fn exam_list(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT id, name, subject, class_level, max_marks, exam_date FROM exams ORDER BY created_at",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "examId": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "subject": r.get::<_, String>(2)?,
                "classLevel": r.get::<_, String>(3)?,
                "maxMarks": r.get::<_, f64>(4)?,
                "examDate": r.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "exams": rows }))
}

struct ExamRow {
    id: String,
    name: String,
    max_marks: f64,
}

fn load_exam(conn: &Connection, exam_id: &str) -> Result<ExamRow, HandlerErr> {
    let row: Option<(String, String, f64)> = conn
        .query_row(
            "SELECT id, name, max_marks FROM exams WHERE id = ?",
            [exam_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((id, name, max_marks)) = row else {
        return Err(DomainError::NotFound(format!("exam not found: {}", exam_id)).into());
    };
    Ok(ExamRow { id, name, max_marks })
}

fn upsert_result(
    conn: &Connection,
    exam_id: &str,
    student_profile_id: &str,
    marks: f64,
    feedback: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO exam_results(id, exam_id, student_profile_id, marks, feedback, created_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(exam_id, student_profile_id) DO UPDATE SET
           marks = excluded.marks,
           feedback = excluded.feedback",
        (
            new_id(),
            exam_id,
            student_profile_id,
            marks,
            feedback,
            now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(())
}

fn result_submit(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let student_profile_id = get_required_str(params, "studentProfileId")?;
    let marks = get_required_f64(params, "marks")?;

    let exam = load_exam(conn, &exam_id)?;
    // Validation happens before any write.
    validate_marks(marks, exam.max_marks)?;

    let exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM student_profiles WHERE id = ?",
            [&student_profile_id],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_none() {
        return Err(
            DomainError::NotFound(format!("student profile not found: {}", student_profile_id))
                .into(),
        );
    }

    let feedback = get_optional_str(params, "feedback");
    upsert_result(conn, &exam.id, &student_profile_id, marks, feedback.as_deref())?;
    Ok(json!({ "examId": exam.id, "studentProfileId": student_profile_id, "marks": marks }))
}

struct CsvResultRow {
    row_no: usize,
    student_profile_id: String,
    exam_id: String,
    marks: f64,
    feedback: Option<String>,
}

/// Parses and resolves the fixed-column result sheet. Rows that fail lookup
/// or validation land in the invalid partition with their 1-based CSV row
/// number and are excluded from the applied count.
fn partition_result_rows(
    conn: &Connection,
    csv_text: &str,
    exam_filter: Option<&ExamRow>,
) -> Result<(Vec<CsvResultRow>, Vec<serde_json::Value>), HandlerErr> {
    let lines: Vec<&str> = csv_text.lines().collect();
    if lines.is_empty() {
        return Err(DomainError::Validation("csv is empty".into()).into());
    }

    let header: Vec<String> = parse_csv_record(lines[0])
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .collect();
    let mut col = HashMap::<String, usize>::new();
    for (i, name) in header.iter().enumerate() {
        col.insert(name.clone(), i);
    }
    for required in RESULT_CSV_COLUMNS.iter().take(5) {
        if !col.contains_key(*required) {
            return Err(
                DomainError::Validation(format!("missing csv column: {}", required)).into(),
            );
        }
    }

    let mut students = HashMap::<String, String>::new();
    {
        let mut stmt = conn.prepare("SELECT enrollment_no, id FROM student_profiles")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        for (enrollment_no, id) in rows {
            students.insert(enrollment_no, id);
        }
    }
    let mut exams_by_name = HashMap::<String, (String, f64)>::new();
    {
        let mut stmt = conn.prepare("SELECT name, id, max_marks FROM exams")?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
        for (name, id, max_marks) in rows {
            exams_by_name.insert(name.trim().to_ascii_lowercase(), (id, max_marks));
        }
    }

    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    let field = |fields: &Vec<String>, name: &str| -> String {
        col.get(name)
            .and_then(|i| fields.get(*i))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    };

    for (idx, raw_line) in lines.iter().enumerate().skip(1) {
        let row_no = idx + 1;
        if raw_line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(raw_line);

        let enrollment_no = field(&fields, "enrollment_no");
        let exam_name = field(&fields, "exam_name");
        let marks_raw = field(&fields, "marks");
        let feedback = non_empty_trimmed(&field(&fields, "feedback"));

        let Some(student_profile_id) = students.get(&enrollment_no).cloned() else {
            invalid.push(json!({
                "row": row_no,
                "message": format!("row {}: enrollment number {} not found in the student list", row_no, enrollment_no)
            }));
            continue;
        };

        let (exam_id, max_marks) = match exam_filter {
            Some(exam) => {
                if !exam_name.eq_ignore_ascii_case(&exam.name) {
                    invalid.push(json!({
                        "row": row_no,
                        "message": format!("row {}: exam name {:?} does not match the selected exam {:?}", row_no, exam_name, exam.name)
                    }));
                    continue;
                }
                (exam.id.clone(), exam.max_marks)
            }
            None => match exams_by_name.get(&exam_name.to_ascii_lowercase()) {
                Some((id, max)) => (id.clone(), *max),
                None => {
                    invalid.push(json!({
                        "row": row_no,
                        "message": format!("row {}: unknown exam {:?}", row_no, exam_name)
                    }));
                    continue;
                }
            },
        };

        let Ok(marks) = marks_raw.parse::<f64>() else {
            invalid.push(json!({
                "row": row_no,
                "message": format!("row {}: marks {:?} is not a number", row_no, marks_raw)
            }));
            continue;
        };
        if let Err(e) = validate_marks(marks, max_marks) {
            invalid.push(json!({
                "row": row_no,
                "message": format!("row {}: {}", row_no, e)
            }));
            continue;
        }

        valid.push(CsvResultRow {
            row_no,
            student_profile_id,
            exam_id,
            marks,
            feedback,
        });
    }

    Ok((valid, invalid))
}

fn result_import_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let csv_text = get_required_str(params, "csvText")?;
    let dry_run = params
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let exam_filter = match get_optional_str(params, "examId") {
        Some(exam_id) => Some(load_exam(conn, &exam_id)?),
        None => None,
    };

    let (valid, invalid) = partition_result_rows(conn, &csv_text, exam_filter.as_ref())?;
    let valid_rows: Vec<serde_json::Value> = valid.iter().map(|r| json!(r.row_no)).collect();

    if !dry_run {
        let tx = conn.unchecked_transaction().map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for row in &valid {
            upsert_result(
                &tx,
                &row.exam_id,
                &row.student_profile_id,
                row.marks,
                row.feedback.as_deref(),
            )?;
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;
    }

    Ok(json!({
        "dryRun": dry_run,
        "applied": if dry_run { 0 } else { valid.len() },
        "validRows": valid_rows,
        "invalid": invalid,
    }))
}

fn result_export_csv(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let exam = load_exam(conn, &exam_id)?;

    let mut stmt = conn.prepare(
        "SELECT s.enrollment_no, s.full_name, e.subject, e.name, r.marks, r.feedback
         FROM exam_results r
         JOIN student_profiles s ON s.id = r.student_profile_id
         JOIN exams e ON e.id = r.exam_id
         WHERE r.exam_id = ?
         ORDER BY s.enrollment_no",
    )?;
    let rows = stmt
        .query_map([&exam.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, f64>(4)?,
                r.get::<_, Option<String>>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut csv = String::from("enrollment_no,student_name,subject,exam_name,marks,feedback\n");
    for (enrollment_no, student_name, subject, exam_name, marks, feedback) in rows {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_quote(&enrollment_no),
            csv_quote(&student_name),
            csv_quote(&subject),
            csv_quote(&exam_name),
            marks,
            csv_quote(feedback.as_deref().unwrap_or(""))
        ));
    }
    Ok(json!({ "examId": exam.id, "csv": csv }))
}

fn result_student_report(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_profile_id = get_required_str(params, "studentProfileId")?;
    let mut stmt = conn.prepare(
        "SELECT e.name, e.subject, e.max_marks, r.marks, r.feedback
         FROM exam_results r JOIN exams e ON e.id = r.exam_id
         WHERE r.student_profile_id = ?
         ORDER BY e.created_at",
    )?;
    let rows = stmt
        .query_map([&student_profile_id], |r| {
            Ok(json!({
                "examName": r.get::<_, String>(0)?,
                "subject": r.get::<_, String>(1)?,
                "maxMarks": r.get::<_, f64>(2)?,
                "marks": r.get::<_, f64>(3)?,
                "feedback": r.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;
    Ok(json!({ "studentProfileId": student_profile_id, "results": rows }))
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
        "exams.create" => Some(with_conn(state, req, exam_create)),
        "exams.list" => Some(with_conn(state, req, exam_list)),
        "results.submit" => Some(with_conn(state, req, result_submit)),
        "results.importCsv" => Some(with_conn(state, req, result_import_csv)),
        "results.exportCsv" => Some(with_conn(state, req, result_export_csv)),
        "results.studentReport" => Some(with_conn(state, req, result_student_report)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_bounds_are_inclusive() {
        assert!(validate_marks(0.0, 100.0).is_ok());
        assert!(validate_marks(100.0, 100.0).is_ok());
        assert!(validate_marks(-0.5, 100.0).is_err());
        assert!(validate_marks(100.5, 100.0).is_err());
        assert!(validate_marks(f64::NAN, 100.0).is_err());
    }

    #[test]
    fn csv_record_parsing_handles_quotes() {
        assert_eq!(
            parse_csv_record("a,\"b,c\",\"d\"\"e\""),
            vec!["a", "b,c", "d\"e"]
        );
        assert_eq!(parse_csv_record("one"), vec!["one"]);
    }

    #[test]
    fn csv_quote_escapes_only_when_needed() {
        assert_eq!(csv_quote("plain"), "plain");
        assert_eq!(csv_quote("a,b"), "\"a,b\"");
        assert_eq!(csv_quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
