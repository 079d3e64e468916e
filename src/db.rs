use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            enrollment_no TEXT NOT NULL UNIQUE COLLATE NOCASE,
            first_name TEXT,
            middle_name TEXT,
            last_name TEXT,
            second_last_name TEXT,
            term TEXT,
            group_code TEXT,
            sex TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            registered_at TEXT NOT NULL,
            p1_average REAL,
            p2_average REAL,
            p3_average REAL,
            final_exam REAL,
            final_average INTEGER,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_term_group ON students(term, group_code)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE COLLATE NOCASE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    // term is '' for unscoped records: SQLite treats NULLs as distinct in
    // unique indexes, which would break the keyed upsert.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollment_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term TEXT NOT NULL DEFAULT '',
            p1 REAL,
            p2 REAL,
            p3 REAL,
            partial_average INTEGER,
            final_exam REAL,
            final_grade INTEGER,
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(student_id, subject_id, term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_grades_student ON enrollment_grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollment_grades_subject ON enrollment_grades(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS calc_settings(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            round_policy TEXT NOT NULL DEFAULT 'half_up',
            partials_weight REAL NOT NULL DEFAULT 0.5,
            exam_weight REAL NOT NULL DEFAULT 0.5
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO calc_settings(id, round_policy, partials_weight, exam_weight)
         VALUES(1, 'half_up', 0.5, 0.5)",
        [],
    )?;

    // scope_term '' applies the exclusion to every term.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS excluded_subjects(
            scope_term TEXT NOT NULL DEFAULT '',
            subject_code TEXT NOT NULL COLLATE NOCASE,
            PRIMARY KEY(scope_term, subject_code)
        )",
        [],
    )?;

    ensure_students_updated_at(&conn)?;

    Ok(conn)
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
