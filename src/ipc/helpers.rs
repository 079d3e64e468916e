use crate::calc::{self, FinalWeighting, RoundPolicy};
use crate::ipc::error::err;
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashSet;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn require_db(db: Option<&Connection>) -> Result<&Connection, HandlerErr> {
    db.ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))?;
    if v.is_empty() {
        return Err(HandlerErr::new(
            "bad_params",
            format!("{} must not be empty", key),
        ));
    }
    Ok(v)
}

pub fn optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Tri-state score patch: absent key leaves the field alone, a present key
/// sets it (dirty or null input clears, per the degrade-to-absent policy).
pub fn patch_score(patch: &serde_json::Value, key: &str) -> Option<Option<f64>> {
    patch.get(key).map(calc::parse_score)
}

/// Tri-state text patch: absent key leaves the field alone, null or empty
/// clears it.
pub fn patch_text(patch: &serde_json::Value, key: &str) -> Option<Option<String>> {
    patch.get(key).map(|v| {
        v.as_str()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

#[derive(Debug, Clone, Copy)]
pub struct CalcSettings {
    pub policy: RoundPolicy,
    pub weighting: FinalWeighting,
}

impl Default for CalcSettings {
    fn default() -> Self {
        Self {
            policy: RoundPolicy::default(),
            weighting: FinalWeighting::default(),
        }
    }
}

pub fn load_calc_settings(conn: &Connection) -> Result<CalcSettings, HandlerErr> {
    let row: Option<(String, f64, f64)> = conn
        .query_row(
            "SELECT round_policy, partials_weight, exam_weight FROM calc_settings WHERE id = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    let Some((policy_s, partials, exam)) = row else {
        return Ok(CalcSettings::default());
    };

    let policy = RoundPolicy::parse(&policy_s).unwrap_or_default();
    let weighting = FinalWeighting { partials, exam };
    Ok(CalcSettings {
        policy,
        weighting: if weighting.is_valid() {
            weighting
        } else {
            FinalWeighting::default()
        },
    })
}

/// Excluded subject codes resolved for one cohort term. Scope '' rows apply
/// to every term.
pub fn resolve_excluded_codes(
    conn: &Connection,
    term: Option<&str>,
) -> Result<HashSet<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT subject_code FROM excluded_subjects WHERE scope_term = '' OR scope_term = ?")
        .map_err(HandlerErr::db)?;
    let codes = stmt
        .query_map([term.unwrap_or("")], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;
    Ok(codes.into_iter().collect())
}

/// Re-derive the stored partial average and final grade of one
/// enrollment-grade row from its current raw inputs.
pub fn recompute_enrollment_row(
    conn: &Connection,
    settings: &CalcSettings,
    grade_id: &str,
) -> Result<(), HandlerErr> {
    let row: Option<(Option<f64>, Option<f64>, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT p1, p2, p3, final_exam FROM enrollment_grades WHERE id = ?",
            [grade_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((p1, p2, p3, exam)) = row else {
        return Err(HandlerErr::new("not_found", "grade record not found"));
    };

    let clean = |v: Option<f64>| v.and_then(calc::clean_score);
    let derived = calc::derive_enrollment_marks(
        settings.policy,
        settings.weighting,
        clean(p1),
        clean(p2),
        clean(p3),
        clean(exam),
    );
    conn.execute(
        "UPDATE enrollment_grades
         SET partial_average = ?, final_grade = ?,
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (derived.partial_average, derived.final_grade, grade_id),
    )
    .map_err(HandlerErr::db)?;
    Ok(())
}

/// Re-derive a student's cohort-level final average from the stored partial
/// averages and exam score.
pub fn recompute_student_row(
    conn: &Connection,
    settings: &CalcSettings,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let row: Option<(Option<f64>, Option<f64>, Option<f64>, Option<f64>)> = conn
        .query_row(
            "SELECT p1_average, p2_average, p3_average, final_exam FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((p1, p2, p3, exam)) = row else {
        return Err(HandlerErr::new("not_found", "student not found"));
    };

    let clean = |v: Option<f64>| v.and_then(calc::clean_score);
    let final_average = calc::final_grade(
        settings.policy,
        settings.weighting,
        calc::average_partials(clean(p1), clean(p2), clean(p3)),
        clean(exam),
    );
    conn.execute(
        "UPDATE students
         SET final_average = ?, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')
         WHERE id = ?",
        (final_average, student_id),
    )
    .map_err(HandlerErr::db)?;
    Ok(())
}
