use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{patch_text, require_db, require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::params_from_iter;
use serde_json::json;
use uuid::Uuid;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_list(state, req)),
        "subjects.create" => Some(handle_create(state, req)),
        "subjects.update" => Some(handle_update(state, req)),
        _ => None,
    }
}

fn handle_list(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.code,
           s.name,
           (SELECT COUNT(*) FROM enrollment_grades g WHERE g.subject_id = s.id) AS grade_count
         FROM subjects s
         ORDER BY s.code",
    ) {
        Ok(s) => s,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "gradeCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_create(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let code = match require_str(&req.params, "code") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match require_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(&req.id, json!({ "subjectId": subject_id, "code": code }))
}

fn handle_update(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let subject_id = match require_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    for (key, column) in [("code", "code"), ("name", "name")] {
        if let Some(v) = patch_text(patch, key) {
            let Some(v) = v else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                );
            };
            set_parts.push(format!("{} = ?", column));
            binds.push(Value::Text(v));
        }
    }
    if set_parts.is_empty() {
        return err(&req.id, "bad_params", "patch has no recognized fields", None);
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    binds.push(Value::Text(subject_id.clone()));

    match conn.execute(&sql, params_from_iter(binds)) {
        Ok(0) => err(&req.id, "not_found", "subject not found", None),
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}
