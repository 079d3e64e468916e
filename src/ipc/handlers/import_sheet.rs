use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_calc_settings, optional_str, recompute_enrollment_row, recompute_student_row, require_db,
    require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::sheet::{self, SheetRow};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "import.gradeSheet" => Some(handle_import_grade_sheet(state, req)),
        _ => None,
    }
}

#[derive(Default)]
struct ImportStats {
    students_created: usize,
    students_updated: usize,
    subjects_created: usize,
    grades_upserted: usize,
}

fn upsert_student(
    conn: &Connection,
    row: &SheetRow,
    term: &str,
) -> Result<(String, bool), HandlerErr> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE enrollment_no = ?",
            [&row.enrollment_no],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    if let Some(student_id) = existing {
        // Re-import refreshes identity fields and reactivates the student;
        // absent cells leave the stored value alone.
        let mut set_parts: Vec<String> = vec!["active = 1".into()];
        let mut binds: Vec<Value> = Vec::new();
        for (value, column) in [
            (&row.first_name, "first_name"),
            (&row.middle_name, "middle_name"),
            (&row.last_name, "last_name"),
            (&row.second_last_name, "second_last_name"),
            (&row.group_code, "group_code"),
            (&row.sex, "sex"),
        ] {
            if let Some(v) = value {
                set_parts.push(format!("{} = ?", column));
                binds.push(Value::Text(v.clone()));
            }
        }
        if !term.is_empty() {
            set_parts.push("term = ?".into());
            binds.push(Value::Text(term.to_string()));
        }
        for (value, column) in [
            (row.p1_average, "p1_average"),
            (row.p2_average, "p2_average"),
            (row.p3_average, "p3_average"),
            (row.final_exam, "final_exam"),
        ] {
            if let Some(v) = value {
                set_parts.push(format!("{} = ?", column));
                binds.push(Value::Real(v));
            }
        }
        set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());
        let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
        binds.push(Value::Text(student_id.clone()));
        conn.execute(&sql, params_from_iter(binds))
            .map_err(HandlerErr::db)?;
        return Ok((student_id, false));
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
            id, enrollment_no, first_name, middle_name, last_name, second_last_name,
            term, group_code, sex, active, registered_at,
            p1_average, p2_average, p3_average, final_exam
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, 1, strftime('%Y-%m-%dT%H:%M:%SZ','now'), ?, ?, ?, ?)",
        rusqlite::params![
            student_id,
            row.enrollment_no,
            row.first_name,
            row.middle_name,
            row.last_name,
            row.second_last_name,
            if term.is_empty() { None } else { Some(term) },
            row.group_code,
            row.sex,
            row.p1_average,
            row.p2_average,
            row.p3_average,
            row.final_exam,
        ],
    )
    .map_err(HandlerErr::db)?;
    Ok((student_id, true))
}

fn handle_import_grade_sheet(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let path = match require_str(&req.params, "path") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term = optional_str(&req.params, "term").unwrap_or_default();

    let mut subject_names: HashMap<String, String> = HashMap::new();
    if let Some(obj) = req.params.get("subjectNames").and_then(|v| v.as_object()) {
        for (code, name) in obj {
            if let Some(name) = name.as_str() {
                subject_names.insert(code.trim().to_string(), name.trim().to_string());
            }
        }
    }

    let parsed = match sheet::parse_grade_sheet(Path::new(&path)) {
        Ok(s) => s,
        Err(e) => {
            return err(
                &req.id,
                "sheet_parse_failed",
                format!("{e:#}"),
                Some(json!({ "path": path })),
            )
        }
    };

    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let mut stats = ImportStats::default();
    let mut subject_ids: HashMap<String, String> = HashMap::new();
    for code in &parsed.subject_codes {
        let existing: Result<Option<String>, _> = tx
            .query_row("SELECT id FROM subjects WHERE code = ?", [code], |r| {
                r.get(0)
            })
            .optional();
        match existing {
            Ok(Some(id)) => {
                subject_ids.insert(code.clone(), id);
            }
            Ok(None) => {
                let id = Uuid::new_v4().to_string();
                let name = subject_names.get(code).cloned().unwrap_or_else(|| code.clone());
                if let Err(e) = tx.execute(
                    "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
                    (&id, code, &name),
                ) {
                    return HandlerErr::db(e).response(&req.id);
                }
                stats.subjects_created += 1;
                subject_ids.insert(code.clone(), id);
            }
            Err(e) => return HandlerErr::db(e).response(&req.id),
        }
    }

    for row in &parsed.rows {
        let (student_id, created) = match upsert_student(&tx, row, &term) {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        if created {
            stats.students_created += 1;
        } else {
            stats.students_updated += 1;
        }
        if let Err(e) = recompute_student_row(&tx, &settings, &student_id) {
            return e.response(&req.id);
        }

        for (code, marks) in &row.marks {
            let Some(subject_id) = subject_ids.get(code) else {
                continue;
            };
            let existing: Result<Option<String>, _> = tx
                .query_row(
                    "SELECT id FROM enrollment_grades
                     WHERE student_id = ? AND subject_id = ? AND term = ?",
                    (&student_id, subject_id, &term),
                    |r| r.get(0),
                )
                .optional();
            let grade_id = match existing {
                // Re-import is last-write-wins on the whole score row.
                Ok(Some(grade_id)) => {
                    if let Err(e) = tx.execute(
                        "UPDATE enrollment_grades
                         SET p1 = ?, p2 = ?, p3 = ?, final_exam = ?,
                             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
                         WHERE id = ?",
                        rusqlite::params![marks.p1, marks.p2, marks.p3, marks.exam, grade_id],
                    ) {
                        return HandlerErr::db(e).response(&req.id);
                    }
                    grade_id
                }
                Ok(None) => {
                    let grade_id = Uuid::new_v4().to_string();
                    if let Err(e) = tx.execute(
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
                            marks.p1,
                            marks.p2,
                            marks.p3,
                            marks.exam,
                        ],
                    ) {
                        return HandlerErr::db(e).response(&req.id);
                    }
                    grade_id
                }
                Err(e) => return HandlerErr::db(e).response(&req.id),
            };
            if let Err(e) = recompute_enrollment_row(&tx, &settings, &grade_id) {
                return e.response(&req.id);
            }
            stats.grades_upserted += 1;
        }
    }

    if let Err(e) = tx.commit() {
        return HandlerErr::db(e).response(&req.id);
    }

    if parsed.degraded_cells > 0 {
        warn!(
            degraded_cells = parsed.degraded_cells,
            path = %path,
            "grade sheet contained unusable score cells"
        );
    }
    info!(
        students_created = stats.students_created,
        students_updated = stats.students_updated,
        subjects_created = stats.subjects_created,
        grades_upserted = stats.grades_upserted,
        skipped_rows = parsed.skipped_rows,
        "grade sheet import finished"
    );

    ok(
        &req.id,
        json!({
            "studentsCreated": stats.students_created,
            "studentsUpdated": stats.students_updated,
            "subjectsCreated": stats.subjects_created,
            "gradesUpserted": stats.grades_upserted,
            "degradedCells": parsed.degraded_cells,
            "skippedRows": parsed.skipped_rows,
        }),
    )
}
