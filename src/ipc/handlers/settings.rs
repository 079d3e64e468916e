use crate::calc::{self, FinalWeighting, RoundPolicy};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{load_calc_settings, require_db, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_get(state, req)),
        "settings.update" => Some(handle_update(state, req)),
        "exclusions.list" => Some(handle_exclusions_list(state, req)),
        "exclusions.update" => Some(handle_exclusions_update(state, req)),
        _ => None,
    }
}

fn settings_json(policy: RoundPolicy, weighting: FinalWeighting) -> serde_json::Value {
    json!({
        "roundPolicy": policy.as_str(),
        "partialsWeight": weighting.partials,
        "examWeight": weighting.exam,
    })
}

fn handle_get(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match load_calc_settings(conn) {
        Ok(s) => ok(&req.id, settings_json(s.policy, s.weighting)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_update(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let Some(patch) = req.params.get("patch").filter(|v| v.is_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let current = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };

    let policy = match patch.get("roundPolicy") {
        None => current.policy,
        Some(v) => {
            let Some(parsed) = v.as_str().and_then(RoundPolicy::parse) else {
                return err(
                    &req.id,
                    "bad_params",
                    "roundPolicy must be 'half_up' or 'floor_below_pass'",
                    None,
                );
            };
            parsed
        }
    };

    let has_explicit_weights =
        patch.get("partialsWeight").is_some() || patch.get("examWeight").is_some();
    let weighting = match patch.get("weightingPreset") {
        None => FinalWeighting {
            partials: patch
                .get("partialsWeight")
                .and_then(|v| v.as_f64())
                .unwrap_or(current.weighting.partials),
            exam: patch
                .get("examWeight")
                .and_then(|v| v.as_f64())
                .unwrap_or(current.weighting.exam),
        },
        Some(v) => {
            if has_explicit_weights {
                return err(
                    &req.id,
                    "bad_params",
                    "weightingPreset cannot be combined with explicit weights",
                    None,
                );
            }
            match v.as_str() {
                Some("even_split") => calc::EVEN_SPLIT,
                Some("partials_heavy") => calc::PARTIALS_HEAVY,
                _ => {
                    return err(
                        &req.id,
                        "bad_params",
                        "weightingPreset must be 'even_split' or 'partials_heavy'",
                        None,
                    )
                }
            }
        }
    };
    if !weighting.is_valid() {
        return err(
            &req.id,
            "bad_params",
            "weights must be non-negative and sum to 1",
            Some(json!({ "partialsWeight": weighting.partials, "examWeight": weighting.exam })),
        );
    }

    // Stored derived values keep the policy they were written under;
    // grades.recomputeAll is the explicit way to re-derive everything.
    if let Err(e) = conn.execute(
        "UPDATE calc_settings SET round_policy = ?, partials_weight = ?, exam_weight = ? WHERE id = 1",
        (policy.as_str(), weighting.partials, weighting.exam),
    ) {
        return HandlerErr::db(e).response(&req.id);
    }

    ok(&req.id, settings_json(policy, weighting))
}

fn handle_exclusions_list(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let mut stmt = match conn.prepare(
        "SELECT scope_term, subject_code FROM excluded_subjects ORDER BY scope_term, subject_code",
    ) {
        Ok(s) => s,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let rows = stmt
        .query_map([], |r| {
            Ok(json!({
                "scopeTerm": r.get::<_, String>(0)?,
                "subjectCode": r.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(exclusions) => ok(&req.id, json!({ "exclusions": exclusions })),
        Err(e) => HandlerErr::db(e).response(&req.id),
    }
}

fn handle_exclusions_update(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    // '' scopes the exclusion to every term.
    let scope_term = req
        .params
        .get("scopeTerm")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let Some(codes) = req.params.get("subjectCodes").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing subjectCodes array", None);
    };
    let mut subject_codes: Vec<String> = Vec::with_capacity(codes.len());
    for v in codes {
        match v.as_str().map(|s| s.trim()).filter(|s| !s.is_empty()) {
            Some(s) => subject_codes.push(s.to_string()),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "subjectCodes must be non-empty strings",
                    None,
                )
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM excluded_subjects WHERE scope_term = ?",
        [&scope_term],
    ) {
        return HandlerErr::db(e).response(&req.id);
    }
    for code in &subject_codes {
        if let Err(e) = tx.execute(
            "INSERT OR IGNORE INTO excluded_subjects(scope_term, subject_code) VALUES(?, ?)",
            (&scope_term, code),
        ) {
            return HandlerErr::db(e).response(&req.id);
        }
    }
    if let Err(e) = tx.commit() {
        return HandlerErr::db(e).response(&req.id);
    }

    ok(
        &req.id,
        json!({ "scopeTerm": scope_term, "count": subject_codes.len() }),
    )
}
