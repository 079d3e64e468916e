use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_calc_settings, optional_str, patch_score, patch_text, recompute_student_row, require_db,
    require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.setActive" => Some(handle_set_active(state, req)),
        "students.lookup" => Some(handle_lookup(state, req)),
        _ => None,
    }
}

const STUDENT_COLUMNS: &str = "id, enrollment_no, first_name, middle_name, last_name, \
     second_last_name, term, group_code, sex, active, registered_at, \
     p1_average, p2_average, p3_average, final_exam, final_average, updated_at";

fn display_name(parts: [&Option<String>; 4]) -> String {
    parts
        .iter()
        .filter_map(|p| p.as_deref())
        .collect::<Vec<_>>()
        .join(" ")
}

fn student_row_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let first: Option<String> = r.get(2)?;
    let middle: Option<String> = r.get(3)?;
    let last: Option<String> = r.get(4)?;
    let second_last: Option<String> = r.get(5)?;
    let display = display_name([&first, &middle, &last, &second_last]);
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "enrollmentNo": r.get::<_, String>(1)?,
        "firstName": first,
        "middleName": middle,
        "lastName": last,
        "secondLastName": second_last,
        "displayName": display,
        "term": r.get::<_, Option<String>>(6)?,
        "groupCode": r.get::<_, Option<String>>(7)?,
        "sex": r.get::<_, Option<String>>(8)?,
        "active": r.get::<_, i64>(9)? != 0,
        "registeredAt": r.get::<_, String>(10)?,
        "p1Average": r.get::<_, Option<f64>>(11)?,
        "p2Average": r.get::<_, Option<f64>>(12)?,
        "p3Average": r.get::<_, Option<f64>>(13)?,
        "finalExam": r.get::<_, Option<f64>>(14)?,
        "finalAverage": r.get::<_, Option<i64>>(15)?,
        "updatedAt": r.get::<_, Option<String>>(16)?,
    }))
}

fn fetch_student(conn: &Connection, student_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS);
    conn.query_row(&sql, [student_id], |r| student_row_json(r))
        .optional()
        .map_err(HandlerErr::db)?
        .ok_or_else(|| HandlerErr::new("not_found", "student not found"))
}

fn handle_list(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let mut sql = format!("SELECT {} FROM students", STUDENT_COLUMNS);
    let mut conds: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(term) = optional_str(&req.params, "term") {
        conds.push("term = ?".into());
        binds.push(Value::Text(term));
    }
    if let Some(group) = optional_str(&req.params, "groupCode") {
        conds.push("group_code = ?".into());
        binds.push(Value::Text(group));
    }
    if req
        .params
        .get("activeOnly")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        conds.push("active = 1".into());
    }
    if let Some(search) = optional_str(&req.params, "search") {
        conds.push("(enrollment_no LIKE ? OR last_name LIKE ? OR first_name LIKE ?)".into());
        let pattern = format!("%{}%", search);
        binds.push(Value::Text(pattern.clone()));
        binds.push(Value::Text(pattern.clone()));
        binds.push(Value::Text(pattern));
    }
    if !conds.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conds.join(" AND "));
    }
    sql.push_str(" ORDER BY enrollment_no");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |r| student_row_json(r))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_create(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let enrollment_no = match require_str(&req.params, "enrollmentNo") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let p = &req.params;
    let score = |key: &str| p.get(key).and_then(|v| crate::calc::parse_score(v));
    let active = p.get("active").and_then(|v| v.as_bool()).unwrap_or(true);

    let student_id = Uuid::new_v4().to_string();
    let insert = conn.execute(
        "INSERT INTO students(
            id, enrollment_no, first_name, middle_name, last_name, second_last_name,
            term, group_code, sex, active, registered_at,
            p1_average, p2_average, p3_average, final_exam
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, strftime('%Y-%m-%dT%H:%M:%SZ','now'), ?, ?, ?, ?)",
        rusqlite::params![
            student_id,
            enrollment_no,
            optional_str(p, "firstName"),
            optional_str(p, "middleName"),
            optional_str(p, "lastName"),
            optional_str(p, "secondLastName"),
            optional_str(p, "term"),
            optional_str(p, "groupCode"),
            optional_str(p, "sex"),
            active as i64,
            score("p1Average"),
            score("p2Average"),
            score("p3Average"),
            score("finalExam"),
        ],
    );
    if let Err(e) = insert {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = recompute_student_row(conn, &settings, &student_id) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_update(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match require_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(v) = patch_text(patch, "enrollmentNo") {
        let Some(v) = v else {
            return err(&req.id, "bad_params", "enrollmentNo must not be empty", None);
        };
        set_parts.push("enrollment_no = ?".into());
        binds.push(Value::Text(v));
    }
    for (key, column) in [
        ("firstName", "first_name"),
        ("middleName", "middle_name"),
        ("lastName", "last_name"),
        ("secondLastName", "second_last_name"),
        ("term", "term"),
        ("groupCode", "group_code"),
        ("sex", "sex"),
    ] {
        if let Some(v) = patch_text(patch, key) {
            set_parts.push(format!("{} = ?", column));
            binds.push(match v {
                Some(s) => Value::Text(s),
                None => Value::Null,
            });
        }
    }
    if let Some(active) = patch.get("active").and_then(|v| v.as_bool()) {
        set_parts.push("active = ?".into());
        binds.push(Value::Integer(active as i64));
    }
    for (key, column) in [
        ("p1Average", "p1_average"),
        ("p2Average", "p2_average"),
        ("p3Average", "p3_average"),
        ("finalExam", "final_exam"),
    ] {
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

    set_parts.push("updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')".into());
    let sql = format!(
        "UPDATE students SET {} WHERE id = ?",
        set_parts.join(", ")
    );
    binds.push(Value::Text(student_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(binds)) {
        Ok(n) => n,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    // Derived values are a function of the raw inputs; recompute on every edit.
    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = recompute_student_row(conn, &settings, &student_id) {
        return e.response(&req.id);
    }

    match fetch_student(conn, &student_id) {
        Ok(student) => ok(&req.id, json!({ "student": student })),
        Err(e) => e.response(&req.id),
    }
}

fn handle_set_active(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing active flag", None);
    };
    let ids: Vec<String> = match req.params.get("studentIds").and_then(|v| v.as_array()) {
        Some(arr) if !arr.is_empty() => {
            let mut out = Vec::with_capacity(arr.len());
            for v in arr {
                match v.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return err(
                            &req.id,
                            "bad_params",
                            "studentIds must be an array of strings",
                            None,
                        )
                    }
                }
            }
            out
        }
        _ => {
            return err(
                &req.id,
                "bad_params",
                "missing studentIds array",
                None,
            )
        }
    };

    let placeholders = std::iter::repeat("?")
        .take(ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "UPDATE students
         SET active = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id IN ({})",
        placeholders
    );
    let mut binds: Vec<Value> = Vec::with_capacity(ids.len() + 1);
    binds.push(Value::Integer(active as i64));
    for id in ids {
        binds.push(Value::Text(id));
    }

    match conn.execute(&sql, params_from_iter(binds)) {
        Ok(updated) => ok(&req.id, json!({ "updated": updated })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_lookup(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let enrollment_no = match require_str(&req.params, "enrollmentNo") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // enrollment_no is NOCASE so the lookup matches regardless of case.
    let sql = format!(
        "SELECT {} FROM students WHERE enrollment_no = ?",
        STUDENT_COLUMNS
    );
    let row = conn
        .query_row(&sql, [&enrollment_no], |r| student_row_json(r))
        .optional();

    match row {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(
            &req.id,
            "not_found",
            format!("enrollment number '{}' not found", enrollment_no),
            Some(json!({ "enrollmentNo": enrollment_no })),
        ),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}
