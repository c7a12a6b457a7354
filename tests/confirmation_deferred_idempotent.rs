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
fn deferred_provisioning_waits_for_confirmation_and_is_idempotent() {
    let workspace = temp_dir("campus-confirm");
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
            "role": "student",
            "email": "asha@school.test",
            "password": "secret1",
            "fullName": "Asha Verma",
            "classLevel": "11",
            "subjects": ["Physics", "Math"],
            "batches": ["JEE"],
            "requireConfirmation": true
        }),
    );
    let deferred = expect_ok(&resp, "registration.submit deferred");
    assert_eq!(deferred["confirmationRequired"].as_bool(), Some(true));
    let token = deferred["confirmationToken"].as_str().expect("token").to_string();
    let identity_id = deferred["identityId"].as_str().expect("identityId").to_string();

    // No profile yet.
    let resp = request(&mut stdin, &mut reader, "2", "dashboard.adminOverview", json!({}));
    let overview = expect_ok(&resp, "dashboard.adminOverview");
    assert_eq!(overview["roles"]["student"]["total"].as_i64(), Some(0));

    // Sign-in before confirmation is refused.
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "auth.signIn",
        json!({ "email": "asha@school.test", "password": "secret1" }),
    );
    assert_eq!(error_code(&resp), "auth_error");

    // A bogus token resolves no identity.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.confirm",
        json!({ "token": "not-a-real-token" }),
    );
    assert_eq!(error_code(&resp), "auth_error");

    // The real token confirms and provisions from the stored metadata.
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.confirm",
        json!({ "token": token.clone(), "type": "signup" }),
    );
    let confirmed = expect_ok(&resp, "auth.confirm");
    assert_eq!(confirmed["identityId"].as_str(), Some(identity_id.as_str()));
    let profile = &confirmed["profile"];
    assert_eq!(profile["created"].as_bool(), Some(true));
    assert_eq!(profile["status"].as_str(), Some("PENDING"));
    assert_eq!(profile["role"].as_str(), Some("student"));
    let enrollment = profile["humanId"].as_str().expect("humanId").to_string();

    // Confirming again re-runs provisioning as a no-op.
    let resp = request(
        &mut stdin,
        &mut reader,
        "6",
        "auth.confirm",
        json!({ "token": token }),
    );
    let again = expect_ok(&resp, "auth.confirm repeat");
    assert_eq!(again["profile"]["created"].as_bool(), Some(false));
    assert_eq!(again["profile"]["humanId"].as_str(), Some(enrollment.as_str()));

    // Manual re-entry is also a no-op.
    let resp = request(
        &mut stdin,
        &mut reader,
        "7",
        "registration.provisionPending",
        json!({ "identityId": identity_id }),
    );
    let manual = expect_ok(&resp, "registration.provisionPending");
    assert_eq!(manual["profile"]["created"].as_bool(), Some(false));

    // Exactly one row exists.
    let resp = request(&mut stdin, &mut reader, "8", "dashboard.adminOverview", json!({}));
    let overview = expect_ok(&resp, "dashboard.adminOverview after confirm");
    assert_eq!(overview["roles"]["student"]["total"].as_i64(), Some(1));

    // Session-token strategy also resolves the identity post-confirmation.
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.signIn",
        json!({ "email": "asha@school.test", "password": "secret1" }),
    );
    let session = expect_ok(&resp, "auth.signIn after confirm");
    let access = session["session"]["accessToken"].as_str().expect("accessToken");
    let refresh = session["session"]["refreshToken"].as_str().expect("refreshToken");
    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "auth.confirm",
        json!({ "accessToken": access, "refreshToken": refresh }),
    );
    let via_session = expect_ok(&resp, "auth.confirm via session tokens");
    assert_eq!(via_session["profile"]["created"].as_bool(), Some(false));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn confirmation_token_lands_on_the_email_outbox() {
    let workspace = temp_dir("campus-confirm-outbox");
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
            "role": "teacher",
            "email": "iyer@school.test",
            "password": "secret1",
            "fullName": "R. Iyer",
            "subjects": ["Chemistry"],
            "requireConfirmation": true
        }),
    );
    let deferred = expect_ok(&resp, "registration.submit deferred");
    let token = deferred["confirmationToken"].as_str().expect("token");
    let identity_id = deferred["identityId"].as_str().expect("identityId");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "notifications.list",
        json!({ "recipientIdentityId": identity_id }),
    );
    let listed = expect_ok(&resp, "notifications.list");
    let items = listed["notifications"].as_array().expect("notifications");
    assert!(items.iter().any(|n| {
        n["channel"].as_str() == Some("email")
            && n["body"].as_str().is_some_and(|b| b.contains(token))
    }));

    drop(stdin);
    let _ = child.wait();
}
