use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_calc_settings, optional_str, patch_score, recompute_enrollment_row, recompute_student_row,
    require_db, require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.listForStudent" => Some(handle_list_for_student(state, req)),
        "grades.upsert" => Some(handle_upsert(state, req)),
        "grades.recomputeAll" => Some(handle_recompute_all(state, req)),
        _ => None,
    }
}

fn resolve_subject_id(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<String, HandlerErr> {
    if let Some(subject_id) = optional_str(params, "subjectId") {
        let found: Option<String> = conn
            .query_row("SELECT id FROM subjects WHERE id = ?", [&subject_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db)?;
        return found.ok_or_else(|| HandlerErr::new("not_found", "subject not found"));
    }
    if let Some(code) = optional_str(params, "subjectCode") {
        let found: Option<String> = conn
            .query_row("SELECT id FROM subjects WHERE code = ?", [&code], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::db)?;
        return found.ok_or_else(|| HandlerErr::new("not_found", "subject not found"));
    }
    Err(HandlerErr::new(
        "bad_params",
        "missing subjectId or subjectCode",
    ))
}

fn require_student(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    if found.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(())
}

fn handle_list_for_student(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }

    let mut sql = String::from(
        "SELECT g.id, g.subject_id, s.code, s.name, g.term,
                g.p1, g.p2, g.p3, g.partial_average, g.final_exam, g.final_grade, g.updated_at
         FROM enrollment_grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.student_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id)];
    if let Some(term) = optional_str(&req.params, "term") {
        sql.push_str(" AND g.term = ?");
        binds.push(Value::Text(term));
    }
    sql.push_str(" ORDER BY s.code, g.term");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "subjectId": r.get::<_, String>(1)?,
                "subjectCode": r.get::<_, String>(2)?,
                "subjectName": r.get::<_, String>(3)?,
                "term": r.get::<_, String>(4)?,
                "p1": r.get::<_, Option<f64>>(5)?,
                "p2": r.get::<_, Option<f64>>(6)?,
                "p3": r.get::<_, Option<f64>>(7)?,
                "partialAverage": r.get::<_, Option<i64>>(8)?,
                "finalExam": r.get::<_, Option<f64>>(9)?,
                "finalGrade": r.get::<_, Option<i64>>(10)?,
                "updatedAt": r.get::<_, Option<String>>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(grades) => ok(&req.id, json!({ "grades": grades })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_upsert(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = require_student(conn, &student_id) {
        return e.response(&req.id);
    }
    let subject_id = match resolve_subject_id(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term = optional_str(&req.params, "term").unwrap_or_default();
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM enrollment_grades
             WHERE student_id = ? AND subject_id = ? AND term = ?",
            (&student_id, &subject_id, &term),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let score_fields = [
        ("p1", "p1"),
        ("p2", "p2"),
        ("p3", "p3"),
        ("finalExam", "final_exam"),
    ];

    let (grade_id, created) = match existing {
        Some(grade_id) => {
            let mut set_parts: Vec<String> = Vec::new();
            let mut binds: Vec<Value> = Vec::new();
            for (key, column) in score_fields {
                if let Some(v) = patch_score(patch, key) {
                    set_parts.push(format!("{} = ?", column));
                    binds.push(match v {
                        Some(x) => Value::Real(x),
                        None => Value::Null,
                    });
                }
            }
            if set_parts.is_empty() {
                return err(&req.id, "bad_params", "patch has no recognized fields", None);
            }
            let sql = format!(
                "UPDATE enrollment_grades SET {} WHERE id = ?",
                set_parts.join(", ")
            );
            binds.push(Value::Text(grade_id.clone()));
            if let Err(e) = conn.execute(&sql, params_from_iter(binds)) {
                return HandlerErr::db(e).response(&req.id);
            }
            (grade_id, false)
        }
        None => {
            let grade_id = Uuid::new_v4().to_string();
            let score = |key: &str| patch_score(patch, key).flatten();
            let insert = conn.execute(
                "INSERT INTO enrollment_grades(
                    id, student_id, subject_id, term, p1, p2, p3, final_exam,
                    created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?,
                    strftime('%Y-%m-%dT%H:%M:%SZ','now'),
                    strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
                rusqlite::params![
                    grade_id,
                    student_id,
                    subject_id,
                    term,
                    score("p1"),
                    score("p2"),
                    score("p3"),
                    score("finalExam"),
                ],
            );
            if let Err(e) = insert {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "enrollment_grades" })),
                );
            }
            (grade_id, true)
        }
    };

    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = recompute_enrollment_row(conn, &settings, &grade_id) {
        return e.response(&req.id);
    }

    let derived: Result<(Option<i64>, Option<i64>), _> = conn.query_row(
        "SELECT partial_average, final_grade FROM enrollment_grades WHERE id = ?",
        [&grade_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    );
    match derived {
        Ok((partial_average, final_grade)) => ok(
            &req.id,
            json!({
                "gradeId": grade_id,
                "created": created,
                "partialAverage": partial_average,
                "finalGrade": final_grade,
            }),
        ),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_recompute_all(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let grade_ids: Result<Vec<String>, _> = tx
        .prepare("SELECT id FROM enrollment_grades")
        .and_then(|mut s| {
            s.query_map([], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect())
        });
    let grade_ids = match grade_ids {
        Ok(v) => v,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    for grade_id in &grade_ids {
        if let Err(e) = recompute_enrollment_row(&tx, &settings, grade_id) {
            return e.response(&req.id);
        }
    }

    let student_ids: Result<Vec<String>, _> =
        tx.prepare("SELECT id FROM students").and_then(|mut s| {
            s.query_map([], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect())
        });
    let student_ids = match student_ids {
        Ok(v) => v,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    for student_id in &student_ids {
        if let Err(e) = recompute_student_row(&tx, &settings, student_id) {
            return e.response(&req.id);
        }
    }

    if let Err(e) = tx.commit() {
        return HandlerErr::db(e).response(&req.id);
    }

    ok(
        &req.id,
        json!({
            "gradeRowsRecomputed": grade_ids.len(),
            "studentsRecomputed": student_ids.len(),
        }),
    )
}
