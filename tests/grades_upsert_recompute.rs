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

fn request_ok(
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
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn upsert_recomputes_derived_fields_and_stays_keyed() {
    let workspace = temp_dir("gradebook-upsert");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "enrollmentNo": "21001", "lastName": "GARCIA", "term": "FIRST" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "subjects.create",
        json!({ "code": "C1022", "name": "NATURAL SCIENCES I" }),
    );

    // P1=8, P2=7, P3=9, exam=8: mean is exactly 8, final is (8+8)/2.
    let upsert = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectCode": "C1022",
            "term": "FIRST",
            "patch": { "p1": 8.0, "p2": 7.0, "p3": 9.0, "finalExam": 8.0 }
        }),
    );
    assert_eq!(upsert.get("created").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        upsert.get("partialAverage").and_then(|v| v.as_i64()),
        Some(8)
    );
    assert_eq!(upsert.get("finalGrade").and_then(|v| v.as_i64()), Some(8));

    // Editing one partial re-derives both stored values from current inputs:
    // mean (8 + 9.5 + 9) / 3 = 8.83 -> 9, final (8.83 + 8) / 2 = 8.42 -> 8.
    let upsert = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectCode": "C1022",
            "term": "FIRST",
            "patch": { "p2": 9.5 }
        }),
    );
    assert_eq!(upsert.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        upsert.get("partialAverage").and_then(|v| v.as_i64()),
        Some(9)
    );
    assert_eq!(upsert.get("finalGrade").and_then(|v| v.as_i64()), Some(8));

    // Dirty input nulls that field alone and the rest proceeds:
    // mean (9.5 + 9) / 2 = 9.25 -> 9, final (9.25 + 8) / 2 = 8.63 -> 9.
    let upsert = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectCode": "C1022",
            "term": "FIRST",
            "patch": { "p1": "not a number" }
        }),
    );
    assert_eq!(
        upsert.get("partialAverage").and_then(|v| v.as_i64()),
        Some(9)
    );
    assert_eq!(upsert.get("finalGrade").and_then(|v| v.as_i64()), Some(9));

    // Three upserts, one (student, subject, term) key, one row.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.listForStudent",
        json!({ "studentId": student_id }),
    );
    let grades = listed
        .get("grades")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(grades.len(), 1);
    assert_eq!(grades[0].get("p1").map(|v| v.is_null()), Some(true));
    assert_eq!(grades[0].get("p2").and_then(|v| v.as_f64()), Some(9.5));

    // The same subject code in a different term is a separate record.
    let upsert = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectCode": "C1022",
            "term": "SECOND",
            "patch": { "p1": 6.0 }
        }),
    );
    assert_eq!(upsert.get("created").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(upsert.get("finalGrade").map(|v| v.is_null()), Some(true));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.listForStudent",
        json!({ "studentId": student_id }),
    );
    let grades = listed
        .get("grades")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(grades.len(), 2);

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.listForStudent",
        json!({ "studentId": student_id, "term": "FIRST" }),
    );
    let grades = listed
        .get("grades")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(grades.len(), 1);

    let _ = child.kill();
}
