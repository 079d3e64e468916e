use crate::calc;
use anyhow::Context;
use std::collections::HashMap;
use std::path::Path;

// Fixed identity headers. Grade columns are CODE_P1 / CODE_P2 / CODE_P3 /
// CODE_EF per subject; optional student-level columns carry the cohort
// average block. Header normalization is the exporter's problem, not ours.
const COL_ENROLLMENT_NO: &str = "ENROLLMENT_NO";
const COL_LAST_NAME: &str = "LAST_NAME";
const COL_SECOND_LAST_NAME: &str = "SECOND_LAST_NAME";
const COL_FIRST_NAMES: &str = "FIRST_NAMES";
const COL_GROUP: &str = "GROUP";
const COL_SEX: &str = "SEX";
const COL_P1_AVG: &str = "P1_AVG";
const COL_P2_AVG: &str = "P2_AVG";
const COL_P3_AVG: &str = "P3_AVG";
const COL_FINAL_EXAM: &str = "FINAL_EXAM";

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawMarks {
    pub p1: Option<f64>,
    pub p2: Option<f64>,
    pub p3: Option<f64>,
    pub exam: Option<f64>,
}

impl RawMarks {
    pub fn any_present(&self) -> bool {
        self.p1.is_some() || self.p2.is_some() || self.p3.is_some() || self.exam.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SheetRow {
    pub enrollment_no: String,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub second_last_name: Option<String>,
    pub group_code: Option<String>,
    pub sex: Option<String>,
    pub p1_average: Option<f64>,
    pub p2_average: Option<f64>,
    pub p3_average: Option<f64>,
    pub final_exam: Option<f64>,
    /// Subject code -> raw marks, in column order, only where any mark is present.
    pub marks: Vec<(String, RawMarks)>,
}

#[derive(Debug, Default)]
pub struct GradeSheet {
    pub subject_codes: Vec<String>,
    pub rows: Vec<SheetRow>,
    /// Cells that held text but no usable in-scale number.
    pub degraded_cells: usize,
    /// Data rows dropped for having no enrollment number.
    pub skipped_rows: usize,
}

enum MarkSlot {
    P1,
    P2,
    P3,
    Exam,
}

fn split_grade_header(header: &str) -> Option<(String, MarkSlot)> {
    let h = header.trim();
    let (code, suffix) = h.rsplit_once('_')?;
    if code.is_empty() {
        return None;
    }
    let slot = match suffix {
        "P1" => MarkSlot::P1,
        "P2" => MarkSlot::P2,
        "P3" => MarkSlot::P3,
        "EF" => MarkSlot::Exam,
        // Derived columns in exports (_PP partial average, _CF final) are
        // ignored: derived values are recomputed, never imported.
        _ => return None,
    };
    Some((code.to_string(), slot))
}

fn clean_enrollment_no(raw: &str) -> String {
    let t = raw.trim();
    // Spreadsheet exports render numeric ids as floats.
    let t = t.strip_suffix(".0").unwrap_or(t);
    t.to_string()
}

fn non_empty(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        None
    } else {
        Some(t.to_string())
    }
}

pub fn parse_grade_sheet(path: &Path) -> anyhow::Result<GradeSheet> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open grade sheet {}", path.to_string_lossy()))?;

    let headers = rdr
        .headers()
        .context("grade sheet has no header row")?
        .clone();

    let mut col_index: HashMap<String, usize> = HashMap::new();
    let mut grade_cols: Vec<(usize, String, MarkSlot)> = Vec::new();
    let mut subject_codes: Vec<String> = Vec::new();
    for (i, h) in headers.iter().enumerate() {
        let name = h.trim().to_string();
        if let Some((code, slot)) = split_grade_header(&name) {
            if !subject_codes.iter().any(|c| c.eq_ignore_ascii_case(&code)) {
                subject_codes.push(code.clone());
            }
            grade_cols.push((i, code, slot));
        } else {
            col_index.insert(name.to_ascii_uppercase(), i);
        }
    }

    if !col_index.contains_key(COL_ENROLLMENT_NO) {
        anyhow::bail!("grade sheet is missing the {} column", COL_ENROLLMENT_NO);
    }

    let mut sheet = GradeSheet {
        subject_codes,
        ..Default::default()
    };

    for record in rdr.records() {
        let record = record.context("failed to read grade sheet row")?;
        let field = |name: &str| -> &str {
            col_index
                .get(name)
                .and_then(|&i| record.get(i))
                .unwrap_or("")
        };

        let enrollment_no = clean_enrollment_no(field(COL_ENROLLMENT_NO));
        if enrollment_no.is_empty() {
            sheet.skipped_rows += 1;
            continue;
        }

        let mut degraded = 0_usize;
        let mut score_cell = |raw: &str| -> Option<f64> {
            let v = calc::parse_score_text(raw);
            if v.is_none() && !raw.trim().is_empty() {
                degraded += 1;
            }
            v
        };

        // First word is the given name, the rest are middle names.
        let first_names = non_empty(field(COL_FIRST_NAMES));
        let (first_name, middle_name) = match &first_names {
            Some(all) => {
                let mut parts = all.split_whitespace();
                let first = parts.next().map(|s| s.to_string());
                let rest = parts.collect::<Vec<_>>().join(" ");
                (first, non_empty(&rest))
            }
            None => (None, None),
        };

        let mut row = SheetRow {
            enrollment_no,
            first_name,
            middle_name,
            last_name: non_empty(field(COL_LAST_NAME)),
            second_last_name: non_empty(field(COL_SECOND_LAST_NAME)),
            group_code: non_empty(field(COL_GROUP)),
            sex: non_empty(field(COL_SEX)).map(|s| s.to_ascii_uppercase()),
            p1_average: score_cell(field(COL_P1_AVG)),
            p2_average: score_cell(field(COL_P2_AVG)),
            p3_average: score_cell(field(COL_P3_AVG)),
            final_exam: score_cell(field(COL_FINAL_EXAM)),
            marks: Vec::new(),
        };

        let mut by_code: HashMap<String, RawMarks> = HashMap::new();
        for (i, code, slot) in &grade_cols {
            let raw = record.get(*i).unwrap_or("");
            let v = score_cell(raw);
            let entry = by_code.entry(code.clone()).or_default();
            match slot {
                MarkSlot::P1 => entry.p1 = v,
                MarkSlot::P2 => entry.p2 = v,
                MarkSlot::P3 => entry.p3 = v,
                MarkSlot::Exam => entry.exam = v,
            }
        }
        for code in &sheet.subject_codes {
            if let Some(marks) = by_code.get(code) {
                if marks.any_present() {
                    row.marks.push((code.clone(), *marks));
                }
            }
        }

        sheet.degraded_cells += degraded;
        sheet.rows.push(row);
    }

    Ok(sheet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_csv(name: &str, contents: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "gradebook-sheet-{}-{}.csv",
            name,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        let mut f = std::fs::File::create(&p).expect("create temp csv");
        f.write_all(contents.as_bytes()).expect("write temp csv");
        p
    }

    #[test]
    fn parses_rows_and_grade_columns() {
        let p = write_temp_csv(
            "basic",
            "ENROLLMENT_NO,LAST_NAME,SECOND_LAST_NAME,FIRST_NAMES,GROUP,SEX,C1022_P1,C1022_P2,C1022_P3,C1022_EF,C1061_P1\n\
             21001.0,GARCIA,LOPEZ,MARIA FERNANDA,A,f,8.0,\"7,5\",9,8,6\n\
             ,X,Y,Z,A,H,1,2,3,4,5\n",
        );
        let sheet = parse_grade_sheet(&p).expect("parse");
        assert_eq!(sheet.subject_codes, vec!["C1022", "C1061"]);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.skipped_rows, 1);

        let row = &sheet.rows[0];
        assert_eq!(row.enrollment_no, "21001");
        assert_eq!(row.first_name.as_deref(), Some("MARIA"));
        assert_eq!(row.middle_name.as_deref(), Some("FERNANDA"));
        assert_eq!(row.sex.as_deref(), Some("F"));
        assert_eq!(row.marks.len(), 2);
        let (code, m) = &row.marks[0];
        assert_eq!(code, "C1022");
        assert_eq!(m.p2, Some(7.5));
        assert_eq!(m.exam, Some(8.0));
    }

    #[test]
    fn dirty_cells_degrade_and_are_counted() {
        let p = write_temp_csv(
            "dirty",
            "ENROLLMENT_NO,C1022_P1,C1022_P2,C1022_CF\n21002,N/A,12,9\n",
        );
        let sheet = parse_grade_sheet(&p).expect("parse");
        let row = &sheet.rows[0];
        // Both cells held text but no usable score; the derived _CF column
        // is not even read.
        assert_eq!(sheet.degraded_cells, 2);
        assert!(row.marks.is_empty());
    }

    #[test]
    fn student_average_block_is_optional() {
        let p = write_temp_csv(
            "cohort",
            "ENROLLMENT_NO,P1_AVG,P2_AVG,P3_AVG,FINAL_EXAM\n21003,8,7,9,8.5\n",
        );
        let sheet = parse_grade_sheet(&p).expect("parse");
        let row = &sheet.rows[0];
        assert_eq!(row.p1_average, Some(8.0));
        assert_eq!(row.final_exam, Some(8.5));
        assert!(row.marks.is_empty());
    }

    #[test]
    fn missing_enrollment_column_is_an_error() {
        let p = write_temp_csv("nocol", "LAST_NAME,C1022_P1\nGARCIA,8\n");
        assert!(parse_grade_sheet(&p).is_err());
    }
}
