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
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err_code(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> String {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_str())
        .expect("error code")
        .to_string()
}

#[test]
fn router_smoke() {
    let workspace = temp_dir("gradebook-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request_ok(&mut stdin, &mut reader, "1", "health", json!({}));
    assert!(health.get("version").and_then(|v| v.as_str()).is_some());
    assert!(health.get("workspacePath").map(|v| v.is_null()).unwrap_or(false));

    // Everything except health needs a workspace.
    let code = request_err_code(&mut stdin, &mut reader, "2", "students.list", json!({}));
    assert_eq!(code, "no_workspace");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let code = request_err_code(&mut stdin, &mut reader, "4", "bogus.method", json!({}));
    assert_eq!(code, "not_implemented");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "subjects.create",
        json!({ "code": "C1022", "name": "NATURAL SCIENCES I" }),
    );
    assert!(created.get("subjectId").and_then(|v| v.as_str()).is_some());

    // Subject codes are unique, case-insensitively.
    let code = request_err_code(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.create",
        json!({ "code": "c1022", "name": "DUPLICATE" }),
    );
    assert_eq!(code, "db_insert_failed");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({
            "enrollmentNo": "21001",
            "firstName": "MARIA",
            "lastName": "GARCIA",
            "term": "FIRST",
            "groupCode": "A"
        }),
    );
    let student_id = created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "students.create",
        json!({ "enrollmentNo": "21002", "lastName": "PEREZ", "term": "THIRD" }),
    );

    let listed = request_ok(&mut stdin, &mut reader, "9", "students.list", json!({}));
    let students = listed
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 2);
    assert_eq!(
        students[0].get("enrollmentNo").and_then(|v| v.as_str()),
        Some("21001")
    );
    assert_eq!(
        students[0].get("displayName").and_then(|v| v.as_str()),
        Some("MARIA GARCIA")
    );

    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.list",
        json!({ "term": "THIRD" }),
    );
    let students = filtered
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 1);
    assert_eq!(
        students[0].get("enrollmentNo").and_then(|v| v.as_str()),
        Some("21002")
    );

    let searched = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "students.list",
        json!({ "search": "GARC" }),
    );
    let students = searched
        .get("students")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(students.len(), 1);

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "students.update",
        json!({ "studentId": student_id, "patch": { "groupCode": "B" } }),
    );
    assert_eq!(
        updated
            .get("student")
            .and_then(|s| s.get("groupCode"))
            .and_then(|v| v.as_str()),
        Some("B")
    );

    let subjects = request_ok(&mut stdin, &mut reader, "13", "subjects.list", json!({}));
    let subjects = subjects
        .get("subjects")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(subjects.len(), 1);
    assert_eq!(
        subjects[0].get("gradeCount").and_then(|v| v.as_i64()),
        Some(0)
    );

    let _ = child.kill();
}
