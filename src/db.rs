use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("quantum.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_templates(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS category_types(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            code TEXT NOT NULL,
            weight_percentage REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(template_id) REFERENCES assessment_templates(id),
            UNIQUE(template_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_category_types_template ON category_types(template_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aspects(
            id TEXT PRIMARY KEY,
            template_id TEXT NOT NULL,
            category_type_id TEXT NOT NULL,
            code TEXT NOT NULL,
            weight_percentage REAL NOT NULL,
            standard_rating REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(template_id) REFERENCES assessment_templates(id),
            FOREIGN KEY(category_type_id) REFERENCES category_types(id),
            UNIQUE(template_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aspects_template ON aspects(template_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aspects_category ON aspects(category_type_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_aspects(
            id TEXT PRIMARY KEY,
            aspect_id TEXT NOT NULL,
            code TEXT NOT NULL,
            standard_rating REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(aspect_id) REFERENCES aspects(id),
            UNIQUE(aspect_id, code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_aspects_aspect ON sub_aspects(aspect_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS custom_standards(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            code TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            category_weights TEXT NOT NULL DEFAULT '{}',
            aspect_configs TEXT NOT NULL DEFAULT '{}',
            sub_aspect_configs TEXT NOT NULL DEFAULT '{}',
            created_at TEXT,
            updated_at TEXT,
            FOREIGN KEY(template_id) REFERENCES assessment_templates(id),
            UNIQUE(institution_id, code)
        )",
        [],
    )?;
    ensure_custom_standards_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_custom_standards_institution
         ON custom_standards(institution_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_custom_standards_template
         ON custom_standards(template_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS position_formations(
            id TEXT PRIMARY KEY,
            institution_id TEXT NOT NULL,
            template_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(template_id) REFERENCES assessment_templates(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_position_formations_institution
         ON position_formations(institution_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participants(
            id TEXT PRIMARY KEY,
            event_id TEXT NOT NULL,
            position_formation_id TEXT NOT NULL,
            name TEXT NOT NULL,
            FOREIGN KEY(position_formation_id) REFERENCES position_formations(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participants_event_position
         ON participants(event_id, position_formation_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aspect_assessments(
            id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            aspect_id TEXT NOT NULL,
            individual_rating REAL NOT NULL,
            FOREIGN KEY(participant_id) REFERENCES participants(id),
            FOREIGN KEY(aspect_id) REFERENCES aspects(id),
            UNIQUE(participant_id, aspect_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aspect_assessments_participant
         ON aspect_assessments(participant_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aspect_assessments_aspect
         ON aspect_assessments(aspect_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sub_aspect_assessments(
            id TEXT PRIMARY KEY,
            participant_id TEXT NOT NULL,
            sub_aspect_id TEXT NOT NULL,
            individual_rating REAL NOT NULL,
            FOREIGN KEY(participant_id) REFERENCES participants(id),
            FOREIGN KEY(sub_aspect_id) REFERENCES sub_aspects(id),
            UNIQUE(participant_id, sub_aspect_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_aspect_assessments_participant
         ON sub_aspect_assessments(participant_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sub_aspect_assessments_sub_aspect
         ON sub_aspect_assessments(sub_aspect_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_custom_standards_updated_at(conn: &Connection) -> anyhow::Result<()> {
    // Early workspaces predate the updated_at column. Add it if needed.
    if table_has_column(conn, "custom_standards", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE custom_standards ADD COLUMN updated_at TEXT", [])?;
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
