#![allow(dead_code)]

use quantumrank::db::open_db;
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TEMPLATE_ID: &str = "t1";
pub const INSTITUTION_ID: &str = "inst-1";
pub const EVENT_ID: &str = "e1";
pub const POSITION_ID: &str = "pf1";

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

/// One managerial template: potensi 40 / kompetensi 60.
///
/// potensi:    intel (w40, sub-aspects a=2 b=3 c=4), sikap (w30, r3), motiv (w30, r4)
/// kompetensi: integ (w40, r4), kerja (w30, r3), komun (w30, r3.5)
pub fn seed_template(conn: &Connection) {
    conn.execute(
        "INSERT INTO assessment_templates(id, code, name) VALUES('t1', 'MGR', 'Managerial')",
        [],
    )
    .expect("template");

    conn.execute(
        "INSERT INTO category_types(id, template_id, code, weight_percentage, sort_order)
         VALUES('c-pot', 't1', 'potensi', 40.0, 0), ('c-kom', 't1', 'kompetensi', 60.0, 1)",
        [],
    )
    .expect("categories");

    conn.execute(
        "INSERT INTO aspects(id, template_id, category_type_id, code, weight_percentage, standard_rating, sort_order) VALUES
         ('a-intel', 't1', 'c-pot', 'intel', 40.0, NULL, 0),
         ('a-sikap', 't1', 'c-pot', 'sikap', 30.0, 3.0, 1),
         ('a-motiv', 't1', 'c-pot', 'motiv', 30.0, 4.0, 2),
         ('a-integ', 't1', 'c-kom', 'integ', 40.0, 4.0, 3),
         ('a-kerja', 't1', 'c-kom', 'kerja', 30.0, 3.0, 4),
         ('a-komun', 't1', 'c-kom', 'komun', 30.0, 3.5, 5)",
        [],
    )
    .expect("aspects");

    conn.execute(
        "INSERT INTO sub_aspects(id, aspect_id, code, standard_rating, sort_order) VALUES
         ('s-intel-a', 'a-intel', 'intel-a', 2.0, 0),
         ('s-intel-b', 'a-intel', 'intel-b', 3.0, 1),
         ('s-intel-c', 'a-intel', 'intel-c', 4.0, 2)",
        [],
    )
    .expect("sub aspects");
}

/// Three participants on one formation.
///
/// Andi:  intel subs 4/4/4, sikap 4, motiv 4, integ 4, kerja 4, komun 4
/// Budi:  intel subs 3/3/3, sikap 3, motiv 3, integ 3, kerja 3, komun 3
/// Citra: intel subs 2/3/4, sikap 4, motiv 2, integ 4, kerja 3, komun 3
pub fn seed_participants(conn: &Connection) {
    conn.execute(
        "INSERT INTO position_formations(id, institution_id, template_id, name)
         VALUES('pf1', 'inst-1', 't1', 'Analyst')",
        [],
    )
    .expect("formation");

    conn.execute(
        "INSERT INTO participants(id, event_id, position_formation_id, name) VALUES
         ('p-andi', 'e1', 'pf1', 'Andi'),
         ('p-budi', 'e1', 'pf1', 'Budi'),
         ('p-citra', 'e1', 'pf1', 'Citra')",
        [],
    )
    .expect("participants");

    let aspect_rows: &[(&str, &str, f64)] = &[
        ("p-andi", "a-sikap", 4.0),
        ("p-andi", "a-motiv", 4.0),
        ("p-andi", "a-integ", 4.0),
        ("p-andi", "a-kerja", 4.0),
        ("p-andi", "a-komun", 4.0),
        ("p-budi", "a-sikap", 3.0),
        ("p-budi", "a-motiv", 3.0),
        ("p-budi", "a-integ", 3.0),
        ("p-budi", "a-kerja", 3.0),
        ("p-budi", "a-komun", 3.0),
        ("p-citra", "a-sikap", 4.0),
        ("p-citra", "a-motiv", 2.0),
        ("p-citra", "a-integ", 4.0),
        ("p-citra", "a-kerja", 3.0),
        ("p-citra", "a-komun", 3.0),
    ];
    for (i, (participant, aspect, rating)) in aspect_rows.iter().enumerate() {
        conn.execute(
            "INSERT INTO aspect_assessments(id, participant_id, aspect_id, individual_rating)
             VALUES(?, ?, ?, ?)",
            (format!("aa-{}", i), participant, aspect, rating),
        )
        .expect("aspect assessment");
    }

    let sub_rows: &[(&str, &str, f64)] = &[
        ("p-andi", "s-intel-a", 4.0),
        ("p-andi", "s-intel-b", 4.0),
        ("p-andi", "s-intel-c", 4.0),
        ("p-budi", "s-intel-a", 3.0),
        ("p-budi", "s-intel-b", 3.0),
        ("p-budi", "s-intel-c", 3.0),
        ("p-citra", "s-intel-a", 2.0),
        ("p-citra", "s-intel-b", 3.0),
        ("p-citra", "s-intel-c", 4.0),
    ];
    for (i, (participant, sub, rating)) in sub_rows.iter().enumerate() {
        conn.execute(
            "INSERT INTO sub_aspect_assessments(id, participant_id, sub_aspect_id, individual_rating)
             VALUES(?, ?, ?, ?)",
            (format!("sa-{}", i), participant, sub, rating),
        )
        .expect("sub-aspect assessment");
    }
}

pub fn seeded_workspace(prefix: &str) -> (PathBuf, Connection) {
    let workspace = temp_dir(prefix);
    let conn = open_db(&workspace).expect("open workspace db");
    seed_template(&conn);
    seed_participants(&conn);
    (workspace, conn)
}
