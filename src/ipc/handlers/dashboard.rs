use crate::calc::{self, SubjectMarks};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    load_calc_settings, optional_str, require_db, resolve_excluded_codes, require_str, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.open" => Some(handle_open(state, req)),
        _ => None,
    }
}

struct GradeRow {
    subject_code: String,
    subject_name: String,
    term: String,
    p1: Option<f64>,
    p2: Option<f64>,
    p3: Option<f64>,
    partial_average: Option<i64>,
    final_exam: Option<f64>,
    final_grade: Option<i64>,
}

fn handle_open(state: &AppState, req: &Request) -> serde_json::Value {
    let conn = match require_db(state.db.as_ref()) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    let enrollment_no = match require_str(&req.params, "enrollmentNo") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student = conn
        .query_row(
            "SELECT id, enrollment_no, first_name, middle_name, last_name, second_last_name,
                    term, group_code, active,
                    p1_average, p2_average, p3_average, final_exam, final_average
             FROM students WHERE enrollment_no = ?",
            [&enrollment_no],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, Option<String>>(5)?,
                    r.get::<_, Option<String>>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, i64>(8)? != 0,
                    r.get::<_, Option<f64>>(9)?,
                    r.get::<_, Option<f64>>(10)?,
                    r.get::<_, Option<f64>>(11)?,
                    r.get::<_, Option<f64>>(12)?,
                    r.get::<_, Option<i64>>(13)?,
                ))
            },
        )
        .optional();
    let student = match student {
        Ok(Some(s)) => s,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                format!("enrollment number '{}' not found", enrollment_no),
                Some(json!({ "enrollmentNo": enrollment_no })),
            )
        }
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let (
        student_id,
        enrollment_no,
        first_name,
        middle_name,
        last_name,
        second_last_name,
        student_term,
        group_code,
        active,
        p1_average,
        p2_average,
        p3_average,
        final_exam,
        final_average,
    ) = student;

    let settings = match load_calc_settings(conn) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    // Exclusion policy is cohort-dependent; resolve it for this student's
    // term and hand the set to the aggregator.
    let excluded = match resolve_excluded_codes(conn, student_term.as_deref()) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut sql = String::from(
        "SELECT s.code, s.name, g.term, g.p1, g.p2, g.p3,
                g.partial_average, g.final_exam, g.final_grade
         FROM enrollment_grades g
         JOIN subjects s ON s.id = g.subject_id
         WHERE g.student_id = ?",
    );
    let mut binds: Vec<Value> = vec![Value::Text(student_id.clone())];
    if let Some(term) = optional_str(&req.params, "term") {
        sql.push_str(" AND g.term = ?");
        binds.push(Value::Text(term));
    }
    sql.push_str(" ORDER BY s.code, g.term");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };
    let rows: Result<Vec<GradeRow>, _> = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(GradeRow {
                subject_code: r.get(0)?,
                subject_name: r.get(1)?,
                term: r.get(2)?,
                p1: r.get(3)?,
                p2: r.get(4)?,
                p3: r.get(5)?,
                partial_average: r.get(6)?,
                final_exam: r.get(7)?,
                final_grade: r.get(8)?,
            })
        })
        .and_then(|it| it.collect());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return HandlerErr::db(e).response(&req.id),
    };

    let records: Vec<SubjectMarks> = rows
        .iter()
        .map(|r| SubjectMarks {
            subject_code: r.subject_code.clone(),
            p1: r.p1,
            p2: r.p2,
            p3: r.p3,
            final_grade: r.final_grade,
        })
        .collect();
    let aggregate = calc::aggregate_across_subjects(settings.policy, &records, &excluded);

    let lowered: std::collections::HashSet<String> = excluded
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .collect();
    let subject_rows: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| {
            let exempt = lowered.contains(&r.subject_code.trim().to_ascii_lowercase());
            if exempt {
                // Policy-excluded subjects display a sentinel, not numbers.
                json!({
                    "subjectCode": r.subject_code,
                    "subjectName": r.subject_name,
                    "term": r.term,
                    "standing": "exempt",
                    "p1": null,
                    "p2": null,
                    "p3": null,
                    "partialAverage": null,
                    "finalExam": null,
                    "finalGrade": null,
                })
            } else {
                json!({
                    "subjectCode": r.subject_code,
                    "subjectName": r.subject_name,
                    "term": r.term,
                    "standing": "graded",
                    "p1": r.p1,
                    "p2": r.p2,
                    "p3": r.p3,
                    "partialAverage": r.partial_average,
                    "finalExam": r.final_exam,
                    "finalGrade": r.final_grade,
                })
            }
        })
        .collect();

    let period_means: Vec<serde_json::Value> = aggregate
        .period_means
        .iter()
        .map(|m| match m {
            Some(v) => json!(calc::round_to_tenth(*v)),
            None => json!(null),
        })
        .collect();

    let partials_mean = calc::average_partials(
        p1_average.and_then(calc::clean_score),
        p2_average.and_then(calc::clean_score),
        p3_average.and_then(calc::clean_score),
    );

    ok(
        &req.id,
        json!({
            "student": {
                "id": student_id,
                "enrollmentNo": enrollment_no,
                "firstName": first_name,
                "middleName": middle_name,
                "lastName": last_name,
                "secondLastName": second_last_name,
                "term": student_term,
                "groupCode": group_code,
                "active": active,
                "p1Average": p1_average,
                "p2Average": p2_average,
                "p3Average": p3_average,
                "finalExam": final_exam,
                "finalAverage": final_average,
                "partialsMean": partials_mean.map(calc::round_to_tenth),
            },
            "subjects": subject_rows,
            "periodMeans": period_means,
            "overallFinal": aggregate.overall_final,
            "includedCount": aggregate.included_count,
            "excludedCount": aggregate.excluded_count,
        }),
    )
}
