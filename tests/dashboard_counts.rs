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

fn register_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    email: &str,
    subjects: serde_json::Value,
) -> String {
    let resp = request(
        stdin,
        reader,
        id,
        "registration.submit",
        json!({
            "role": "student",
            "email": email,
            "password": "secret1",
            "fullName": "Some Student",
            "classLevel": "11",
            "subjects": subjects,
            "batches": ["JEE"]
        }),
    );
    let result = expect_ok(&resp, "registration.submit student");
    result["profile"]["profileId"]
        .as_str()
        .expect("profileId")
        .to_string()
}

#[test]
fn admin_overview_tracks_per_role_and_entity_counts() {
    let workspace = temp_dir("campus-admin-dash");
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
    let actor = json!({ "identityId": admin_id, "role": "admin" });

    let approved = register_student(&mut stdin, &mut reader, "2", "a@s.test", json!(["Physics"]));
    let _pending = register_student(&mut stdin, &mut reader, "3", "b@s.test", json!(["Physics"]));
    let rejected = register_student(&mut stdin, &mut reader, "4", "c@s.test", json!(["Chemistry"]));

    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "approval.approve",
        json!({ "role": "student", "profileId": approved, "actor": actor.clone() }),
    );
    expect_ok(&resp, "approve student");
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "approval.reject",
        json!({ "role": "student", "profileId": rejected, "actor": actor.clone(), "reason": "duplicate" }),
    );
    expect_ok(&resp, "reject student");

    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "exams.create",
        json!({ "name": "Midterm", "subject": "Physics", "classLevel": "11", "maxMarks": 100.0 }),
    );
    expect_ok(&resp, "exams.create");

    let resp = request(&mut stdin, &mut reader, "8", "dashboard.adminOverview", json!({}));
    let overview = expect_ok(&resp, "dashboard.adminOverview");
    let students = &overview["roles"]["student"];
    assert_eq!(students["total"].as_i64(), Some(3));
    assert_eq!(students["approved"].as_i64(), Some(1));
    assert_eq!(students["pending"].as_i64(), Some(1));
    assert_eq!(students["rejected"].as_i64(), Some(1));
    assert_eq!(students["createdLast7Days"].as_i64(), Some(3));
    assert_eq!(overview["roles"]["admin"]["total"].as_i64(), Some(1));
    assert_eq!(overview["roles"]["teacher"]["total"].as_i64(), Some(0));
    assert_eq!(overview["exams"].as_i64(), Some(1));
    assert_eq!(overview["examResults"].as_i64(), Some(0));
    // Both decisions queued a notification to the affected student.
    assert!(overview["queuedNotifications"].as_i64().unwrap_or(0) >= 2);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn teacher_overview_counts_only_students_in_scope() {
    let workspace = temp_dir("campus-teacher-dash");
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
    let admin_actor = json!({
        "identityId": admin["identityId"].as_str().expect("identityId"),
        "role": "admin"
    });

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
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
    let teacher_actor = json!({
        "identityId": teacher["identityId"].as_str().expect("identityId"),
        "role": "teacher"
    });
    let teacher_profile = teacher["profile"]["profileId"]
        .as_str()
        .expect("profileId")
        .to_string();
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "approval.approve",
        json!({ "role": "teacher", "profileId": teacher_profile, "actor": admin_actor.clone() }),
    );
    expect_ok(&resp, "approve teacher");

    let in_scope = register_student(&mut stdin, &mut reader, "4", "p@s.test", json!(["Physics"]));
    let _out_of_scope =
        register_student(&mut stdin, &mut reader, "5", "c@s.test", json!(["Chemistry"]));
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "approval.approve",
        json!({ "role": "student", "profileId": in_scope, "actor": admin_actor.clone() }),
    );
    expect_ok(&resp, "approve student");
    let _scoped = register_student(&mut stdin, &mut reader, "7", "q@s.test", json!(["Physics", "Math"]));

    let resp = request(
        &mut stdin,
        &mut reader,
        "8",
        "dashboard.teacherOverview",
        json!({ "actor": teacher_actor.clone() }),
    );
    let overview = expect_ok(&resp, "dashboard.teacherOverview");
    assert_eq!(overview["pendingStudents"].as_i64(), Some(1));
    assert_eq!(overview["approvedStudents"].as_i64(), Some(1));
    let scope = overview["subjectScope"].as_str().expect("subjectScope");
    assert!(scope.contains("Physics"));

    // Admins do not get the teacher view.
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "dashboard.teacherOverview",
        json!({ "actor": admin_actor }),
    );
    assert_eq!(error_code(&resp), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}
