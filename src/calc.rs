use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// All scores, raw or derived, live on the 0-10 scale.
pub const SCALE_MIN: f64 = 0.0;
pub const SCALE_MAX: f64 = 10.0;

/// Lowest passing grade on the scale.
pub const PASS_MARK: f64 = 6.0;
/// What a failing grade displays as under `RoundPolicy::FloorBelowPass`.
pub const FAIL_DISPLAY: i64 = 5;

/// How a raw value becomes a displayed integer grade.
///
/// `HalfUp` rounds to the nearest integer with halves going up (7.5 -> 8,
/// 7.4 -> 7). `FloorBelowPass` is the same above the pass mark, but any value
/// below it displays as the fixed failing grade 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPolicy {
    #[default]
    HalfUp,
    FloorBelowPass,
}

impl RoundPolicy {
    pub fn parse(s: &str) -> Option<RoundPolicy> {
        match s {
            "half_up" => Some(RoundPolicy::HalfUp),
            "floor_below_pass" => Some(RoundPolicy::FloorBelowPass),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoundPolicy::HalfUp => "half_up",
            RoundPolicy::FloorBelowPass => "floor_below_pass",
        }
    }
}

/// Blend ratio between the partial average and the end-of-term exam when
/// deriving a final grade. Weights must be non-negative and sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalWeighting {
    pub partials: f64,
    pub exam: f64,
}

pub const EVEN_SPLIT: FinalWeighting = FinalWeighting {
    partials: 0.5,
    exam: 0.5,
};

pub const PARTIALS_HEAVY: FinalWeighting = FinalWeighting {
    partials: 0.7,
    exam: 0.3,
};

impl Default for FinalWeighting {
    fn default() -> Self {
        EVEN_SPLIT
    }
}

impl FinalWeighting {
    pub fn is_valid(&self) -> bool {
        self.partials >= 0.0 && self.exam >= 0.0 && (self.partials + self.exam - 1.0).abs() < 1e-9
    }
}

/// Non-finite or out-of-scale values are absent, not errors.
pub fn clean_score(v: f64) -> Option<f64> {
    if v.is_finite() && (SCALE_MIN..=SCALE_MAX).contains(&v) {
        Some(v)
    } else {
        None
    }
}

/// Total conversion from a raw cell to an in-scale score. Accepts numeric
/// text with either decimal separator; anything unusable degrades to None.
pub fn parse_score_text(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    t.replace(',', ".").parse::<f64>().ok().and_then(clean_score)
}

pub fn parse_score(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(n) => n.as_f64().and_then(clean_score),
        serde_json::Value::String(s) => parse_score_text(s),
        _ => None,
    }
}

/// Half-up rounding to one decimal, for displayed period means:
/// `Int(10*x + 0.5) / 10`.
pub fn round_to_tenth(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

pub fn round_grade(policy: RoundPolicy, value: Option<f64>) -> Option<i64> {
    let v = value.and_then(clean_score)?;
    match policy {
        RoundPolicy::FloorBelowPass if v < PASS_MARK => Some(FAIL_DISPLAY),
        _ => Some((v + 0.5).floor() as i64),
    }
}

/// Raw mean of the present partials; None only when all three are absent.
/// The stored partial average is this mean passed through `round_grade`.
pub fn average_partials(p1: Option<f64>, p2: Option<f64>, p3: Option<f64>) -> Option<f64> {
    let mut sum = 0.0_f64;
    let mut count = 0_usize;
    for v in [p1, p2, p3].into_iter().flatten() {
        if let Some(v) = clean_score(v) {
            sum += v;
            count += 1;
        }
    }
    if count > 0 {
        Some(sum / count as f64)
    } else {
        None
    }
}

/// Weighted blend of the (unrounded) partial average and the end-of-term
/// exam, then rounded. None if either side is absent.
pub fn final_grade(
    policy: RoundPolicy,
    weighting: FinalWeighting,
    partial_average: Option<f64>,
    exam: Option<f64>,
) -> Option<i64> {
    let pa = partial_average.and_then(clean_score)?;
    let ef = exam.and_then(clean_score)?;
    round_grade(policy, Some(pa * weighting.partials + ef * weighting.exam))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMarks {
    pub partial_average: Option<i64>,
    pub final_grade: Option<i64>,
}

/// Both derived fields of one enrollment-grade row. The final blends the
/// unrounded partial mean so a half-point is not rounded twice.
pub fn derive_enrollment_marks(
    policy: RoundPolicy,
    weighting: FinalWeighting,
    p1: Option<f64>,
    p2: Option<f64>,
    p3: Option<f64>,
    exam: Option<f64>,
) -> DerivedMarks {
    let raw_avg = average_partials(p1, p2, p3);
    DerivedMarks {
        partial_average: round_grade(policy, raw_avg),
        final_grade: final_grade(policy, weighting, raw_avg, exam),
    }
}

/// One subject's marks as seen by the cross-subject aggregate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectMarks {
    pub subject_code: String,
    pub p1: Option<f64>,
    pub p2: Option<f64>,
    pub p3: Option<f64>,
    pub final_grade: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAggregate {
    pub period_means: [Option<f64>; 3],
    pub overall_final: Option<i64>,
    pub included_count: usize,
    pub excluded_count: usize,
}

/// Per-period means and overall final across one student's subjects.
///
/// Excluded codes (matched case-insensitively) contribute to no numerator or
/// denominator; which codes are excluded for a given cohort is the caller's
/// decision. Means are over score-present records only.
pub fn aggregate_across_subjects(
    policy: RoundPolicy,
    records: &[SubjectMarks],
    excluded_codes: &HashSet<String>,
) -> StudentAggregate {
    let lowered: HashSet<String> = excluded_codes
        .iter()
        .map(|c| c.trim().to_ascii_lowercase())
        .collect();

    let mut sums = [0.0_f64; 3];
    let mut counts = [0_usize; 3];
    let mut final_sum = 0.0_f64;
    let mut final_count = 0_usize;
    let mut included_count = 0_usize;
    let mut excluded_count = 0_usize;

    for r in records {
        if lowered.contains(&r.subject_code.trim().to_ascii_lowercase()) {
            excluded_count += 1;
            continue;
        }
        included_count += 1;

        for (slot, p) in [r.p1, r.p2, r.p3].into_iter().enumerate() {
            if let Some(v) = p.and_then(clean_score) {
                sums[slot] += v;
                counts[slot] += 1;
            }
        }
        if let Some(f) = r.final_grade {
            final_sum += f as f64;
            final_count += 1;
        }
    }

    let mut period_means = [None; 3];
    for slot in 0..3 {
        if counts[slot] > 0 {
            period_means[slot] = Some(sums[slot] / counts[slot] as f64);
        }
    }

    let overall_final = if final_count > 0 {
        round_grade(policy, Some(final_sum / final_count as f64))
    } else {
        None
    };

    StudentAggregate {
        period_means,
        overall_final,
        included_count,
        excluded_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_grade_is_total_over_absent_and_dirty_input() {
        assert_eq!(round_grade(RoundPolicy::HalfUp, None), None);
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(f64::NAN)), None);
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(12.0)), None);
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(-0.5)), None);
        assert_eq!(round_grade(RoundPolicy::FloorBelowPass, None), None);
    }

    #[test]
    fn round_grade_half_up_not_bankers() {
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(7.5)), Some(8));
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(7.4)), Some(7));
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(8.5)), Some(9));
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(10.0)), Some(10));
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(0.0)), Some(0));
    }

    #[test]
    fn floor_below_pass_pins_failing_display() {
        assert_eq!(round_grade(RoundPolicy::FloorBelowPass, Some(5.9)), Some(5));
        assert_eq!(round_grade(RoundPolicy::HalfUp, Some(5.9)), Some(6));
        assert_eq!(round_grade(RoundPolicy::FloorBelowPass, Some(1.2)), Some(5));
        assert_eq!(round_grade(RoundPolicy::FloorBelowPass, Some(6.0)), Some(6));
        assert_eq!(round_grade(RoundPolicy::FloorBelowPass, Some(7.5)), Some(8));
    }

    #[test]
    fn average_partials_ignores_absent_entries() {
        assert_eq!(average_partials(Some(8.0), Some(9.0), None), Some(8.5));
        assert_eq!(average_partials(None, Some(7.0), None), Some(7.0));
        assert_eq!(average_partials(None, None, None), None);
    }

    #[test]
    fn average_partials_nulls_out_dirty_entries_locally() {
        // An out-of-scale partial degrades alone; the rest still average.
        assert_eq!(
            average_partials(Some(8.0), Some(99.0), Some(6.0)),
            Some(7.0)
        );
    }

    #[test]
    fn final_grade_even_split() {
        assert_eq!(
            final_grade(RoundPolicy::HalfUp, EVEN_SPLIT, Some(8.5), Some(9.0)),
            Some(9)
        );
        assert_eq!(
            final_grade(RoundPolicy::HalfUp, EVEN_SPLIT, None, Some(9.0)),
            None
        );
        assert_eq!(
            final_grade(RoundPolicy::HalfUp, EVEN_SPLIT, Some(8.5), None),
            None
        );
    }

    #[test]
    fn final_grade_partials_heavy() {
        // 8 * 0.7 + 10 * 0.3 = 8.6 -> 9
        assert_eq!(
            final_grade(RoundPolicy::HalfUp, PARTIALS_HEAVY, Some(8.0), Some(10.0)),
            Some(9)
        );
    }

    #[test]
    fn weighting_validation() {
        assert!(EVEN_SPLIT.is_valid());
        assert!(PARTIALS_HEAVY.is_valid());
        assert!(FinalWeighting {
            partials: 0.6,
            exam: 0.4
        }
        .is_valid());
        assert!(!FinalWeighting {
            partials: 0.8,
            exam: 0.3
        }
        .is_valid());
        assert!(!FinalWeighting {
            partials: -0.1,
            exam: 1.1
        }
        .is_valid());
    }

    #[test]
    fn parse_score_text_degrades_dirty_input() {
        assert_eq!(parse_score_text("7,5"), Some(7.5));
        assert_eq!(parse_score_text(" 8.0 "), Some(8.0));
        assert_eq!(parse_score_text(""), None);
        assert_eq!(parse_score_text("N/A"), None);
        assert_eq!(parse_score_text("11"), None);
        assert_eq!(parse_score_text("-1"), None);
    }

    #[test]
    fn derive_enrollment_marks_end_to_end() {
        // P1=8, P2=7, P3=9, exam=8: average is exactly 8, final is (8+8)/2.
        let d = derive_enrollment_marks(
            RoundPolicy::HalfUp,
            EVEN_SPLIT,
            Some(8.0),
            Some(7.0),
            Some(9.0),
            Some(8.0),
        );
        assert_eq!(d.partial_average, Some(8));
        assert_eq!(d.final_grade, Some(8));
    }

    #[test]
    fn derive_enrollment_marks_without_exam_has_no_final() {
        let d = derive_enrollment_marks(
            RoundPolicy::HalfUp,
            EVEN_SPLIT,
            Some(8.0),
            Some(9.0),
            None,
            None,
        );
        assert_eq!(d.partial_average, Some(9)); // 8.5 rounds up
        assert_eq!(d.final_grade, None);
    }

    fn finals_only(code: &str, final_grade: Option<i64>) -> SubjectMarks {
        SubjectMarks {
            subject_code: code.to_string(),
            final_grade,
            ..Default::default()
        }
    }

    #[test]
    fn excluded_subject_never_contributes() {
        let records = vec![
            SubjectMarks {
                subject_code: "C1022".into(),
                p1: Some(9.0),
                final_grade: Some(9),
                ..Default::default()
            },
            SubjectMarks {
                subject_code: "C1301".into(),
                p1: Some(10.0),
                final_grade: Some(10),
                ..Default::default()
            },
            SubjectMarks {
                subject_code: "C1061".into(),
                p1: Some(7.0),
                final_grade: Some(7),
                ..Default::default()
            },
        ];
        let excluded: HashSet<String> = ["c1301".to_string()].into_iter().collect();

        let agg = aggregate_across_subjects(RoundPolicy::HalfUp, &records, &excluded);
        assert_eq!(agg.overall_final, Some(8)); // (9 + 7) / 2, never influenced by 10
        assert_eq!(agg.period_means[0], Some(8.0));
        assert_eq!(agg.included_count, 2);
        assert_eq!(agg.excluded_count, 1);
    }

    #[test]
    fn aggregate_skips_absent_periods_per_slot() {
        let records = vec![
            SubjectMarks {
                subject_code: "A".into(),
                p1: Some(8.0),
                p2: Some(6.0),
                ..Default::default()
            },
            SubjectMarks {
                subject_code: "B".into(),
                p1: Some(10.0),
                ..Default::default()
            },
        ];
        let agg = aggregate_across_subjects(RoundPolicy::HalfUp, &records, &HashSet::new());
        assert_eq!(agg.period_means[0], Some(9.0));
        assert_eq!(agg.period_means[1], Some(6.0));
        assert_eq!(agg.period_means[2], None);
        assert_eq!(agg.overall_final, None);
    }

    #[test]
    fn aggregate_is_idempotent_over_identical_input() {
        let records = vec![
            finals_only("A", Some(9)),
            finals_only("B", Some(7)),
            finals_only("C", None),
        ];
        let excluded: HashSet<String> = HashSet::new();
        let first = aggregate_across_subjects(RoundPolicy::HalfUp, &records, &excluded);
        let second = aggregate_across_subjects(RoundPolicy::HalfUp, &records, &excluded);
        assert_eq!(first, second);
    }

    #[test]
    fn round_to_tenth_half_up() {
        assert_eq!(round_to_tenth(3.54), 3.5);
        assert_eq!(round_to_tenth(3.55), 3.6);
        assert_eq!(round_to_tenth(8.25), 8.3);
    }
}
