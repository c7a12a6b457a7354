use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn expect_ok(v: &serde_json::Value, method: &str) -> serde_json::Value {
    assert_eq!(
        v.get("ok").and_then(|x| x.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        v
    );
    v.get("result").cloned().expect("result")
}

fn error_code(v: &serde_json::Value) -> String {
    v.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string()
}

#[test]
fn bulk_delete_cascades_per_role_in_one_transaction() {
    let workspace = temp_dir("campus-bulk-delete");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let resp = request(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    expect_ok(&resp, "workspace.select");

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "registration.submit",
        json!({
            "role": "admin",
            "email": "admin@school.test",
            "password": "secret1",
            "fullName": "Site Admin"
        }),
    );
    let admin = expect_ok(&resp, "registration.submit admin");
    let admin_id = admin["identityId"].as_str().expect("identityId").to_string();
    let admin_actor = json!({ "identityId": admin_id, "role": "admin" });

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "registration.submit",
        json!({
            "role": "student",
            "email": "asha@school.test",
            "password": "secret1",
            "fullName": "Asha Verma",
            "classLevel": "11",
            "subjects": ["Physics"],
            "batches": ["JEE"]
        }),
    );
    let student = expect_ok(&resp, "registration.submit student");
    let student_id = student["profile"]["profileId"]
        .as_str()
        .expect("profileId")
        .to_string();

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "registration.submit",
        json!({
            "role": "teacher",
            "email": "iyer@school.test",
            "password": "secret1",
            "fullName": "R. Iyer",
            "subjects": ["Physics"]
        }),
    );
    let teacher = expect_ok(&resp, "registration.submit teacher");
    let teacher_id = teacher["profile"]["profileId"]
        .as_str()
        .expect("profileId")
        .to_string();

    // Give the student dependent fact rows in both tables.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "exams.create",
        json!({ "name": "Midterm", "subject": "Physics", "classLevel": "11", "maxMarks": 100.0 }),
    );
    let exam_id = expect_ok(&resp, "exams.create")["examId"]
        .as_str()
        .expect("examId")
        .to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "results.submit",
        json!({ "examId": exam_id, "studentProfileId": student_id.clone(), "marks": 70.0 }),
    );
    expect_ok(&resp, "results.submit");
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "fees.createStructure",
        json!({ "classLevel": "11", "name": "Tuition", "amount": 1000.0 }),
    );
    let fee_id = expect_ok(&resp, "fees.createStructure")["feeStructureId"]
        .as_str()
        .expect("feeStructureId")
        .to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "fees.recordPayment",
        json!({
            "feeStructureId": fee_id,
            "studentProfileId": student_id.clone(),
            "amountPaid": 400.0,
            "method": "cash"
        }),
    );
    expect_ok(&resp, "fees.recordPayment");

    // Non-admin actors cannot bulk delete.
    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "admin.bulkDelete",
        json!({
            "actor": { "identityId": "nobody", "role": "admin" },
            "profiles": [{ "role": "student", "profileId": student_id.clone() }]
        }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "admin.bulkDelete",
        json!({
            "actor": admin_actor.clone(),
            "profiles": [
                { "role": "student", "profileId": student_id.clone() },
                { "role": "teacher", "profileId": teacher_id.clone() },
                { "role": "student", "profileId": "missing-profile" }
            ]
        }),
    );
    let deleted = expect_ok(&resp, "admin.bulkDelete");
    assert_eq!(deleted["deleted"]["student"].as_i64(), Some(1));
    assert_eq!(deleted["deleted"]["teacher"].as_i64(), Some(1));
    let missing = deleted["missing"].as_array().expect("missing");
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0]["profileId"].as_str(), Some("missing-profile"));

    // Profiles and dependents are gone; the admin survives.
    let resp = request(&mut stdin, &mut reader, "10", "dashboard.adminOverview", json!({}));
    let overview = expect_ok(&resp, "dashboard.adminOverview");
    assert_eq!(overview["roles"]["student"]["total"].as_i64(), Some(0));
    assert_eq!(overview["roles"]["teacher"]["total"].as_i64(), Some(0));
    assert_eq!(overview["roles"]["admin"]["total"].as_i64(), Some(1));
    assert_eq!(overview["examResults"].as_i64(), Some(0));
    assert_eq!(overview["feePayments"].as_i64(), Some(0));

    let resp = request(
        &mut stdin,
        &mut reader,
        "11",
        "results.studentReport",
        json!({ "studentProfileId": student_id }),
    );
    let report = expect_ok(&resp, "results.studentReport");
    assert_eq!(report["results"].as_array().map(|v| v.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}
