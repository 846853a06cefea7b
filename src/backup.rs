use crate::standards::CustomStandard;
use anyhow::{anyhow, Context};
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const STANDARDS_ENTRY: &str = "standards.json";
pub const BUNDLE_FORMAT_V1: &str = "quantum-standards-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub standard_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub imported: usize,
    pub updated: usize,
}

fn payload_sha256(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Writes all of one institution's custom standards (active and inactive)
/// into a portable zip bundle with a checksummed payload.
pub fn export_standards_bundle(
    conn: &Connection,
    institution_id: &str,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let mut stmt = conn
        .prepare(
            "SELECT id, institution_id, template_id, code, name, description,
                    is_active, category_weights, aspect_configs, sub_aspect_configs,
                    created_at, updated_at
             FROM custom_standards
             WHERE institution_id = ?
             ORDER BY code",
        )
        .context("failed to prepare standards query")?;
    let standards: Vec<CustomStandard> = stmt
        .query_map([institution_id], |r| {
            let category_weights: String = r.get(7)?;
            let aspect_configs: String = r.get(8)?;
            let sub_aspect_configs: String = r.get(9)?;
            Ok(CustomStandard {
                id: r.get(0)?,
                institution_id: r.get(1)?,
                template_id: r.get(2)?,
                code: r.get(3)?,
                name: r.get(4)?,
                description: r.get(5)?,
                is_active: r.get::<_, i64>(6)? != 0,
                category_weights: serde_json::from_str(&category_weights).unwrap_or_default(),
                aspect_configs: serde_json::from_str(&aspect_configs).unwrap_or_default(),
                sub_aspect_configs: serde_json::from_str(&sub_aspect_configs).unwrap_or_default(),
                created_at: r.get(10)?,
                updated_at: r.get(11)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .context("failed to read custom standards")?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let payload =
        serde_json::to_string_pretty(&standards).context("failed to serialize standards")?;
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "institutionId": institution_id,
        "standardCount": standards.len(),
        "payloadSha256": payload_sha256(&payload),
    });

    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(STANDARDS_ENTRY, opts)
        .context("failed to start standards entry")?;
    zip.write_all(payload.as_bytes())
        .context("failed to write standards entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        standard_count: standards.len(),
    })
}

/// Restores standards from a bundle, upserting by (institution, code).
/// Format and checksum mismatches are hard failures: a bad bundle must not
/// half-apply.
pub fn import_standards_bundle(conn: &Connection, in_path: &Path) -> anyhow::Result<ImportSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut payload = String::new();
    archive
        .by_name(STANDARDS_ENTRY)
        .context("bundle missing standards.json")?
        .read_to_string(&mut payload)
        .context("failed to read standards.json")?;

    let expected = manifest
        .get("payloadSha256")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let actual = payload_sha256(&payload);
    if expected != actual {
        return Err(anyhow!(
            "bundle payload checksum mismatch: expected {}, got {}",
            expected,
            actual
        ));
    }

    let standards: Vec<CustomStandard> =
        serde_json::from_str(&payload).context("standards.json is invalid")?;

    let mut imported = 0usize;
    let mut updated = 0usize;
    let tx = conn.unchecked_transaction().context("failed to open transaction")?;
    for standard in &standards {
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM custom_standards WHERE institution_id = ? AND code = ?",
                (&standard.institution_id, &standard.code),
                |r| r.get(0),
            )
            .ok();
        let category_weights = serde_json::to_string(&standard.category_weights)
            .context("failed to serialize category weights")?;
        let aspect_configs = serde_json::to_string(&standard.aspect_configs)
            .context("failed to serialize aspect configs")?;
        let sub_aspect_configs = serde_json::to_string(&standard.sub_aspect_configs)
            .context("failed to serialize sub-aspect configs")?;
        match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE custom_standards
                     SET template_id = ?, name = ?, description = ?, is_active = ?,
                         category_weights = ?, aspect_configs = ?, sub_aspect_configs = ?,
                         updated_at = ?
                     WHERE id = ?",
                    (
                        &standard.template_id,
                        &standard.name,
                        &standard.description,
                        standard.is_active as i64,
                        &category_weights,
                        &aspect_configs,
                        &sub_aspect_configs,
                        chrono::Utc::now().to_rfc3339(),
                        &id,
                    ),
                )
                .context("failed to update standard")?;
                updated += 1;
            }
            None => {
                tx.execute(
                    "INSERT INTO custom_standards(
                        id, institution_id, template_id, code, name, description, is_active,
                        category_weights, aspect_configs, sub_aspect_configs, created_at)
                     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        &standard.id,
                        &standard.institution_id,
                        &standard.template_id,
                        &standard.code,
                        &standard.name,
                        &standard.description,
                        standard.is_active as i64,
                        &category_weights,
                        &aspect_configs,
                        &sub_aspect_configs,
                        chrono::Utc::now().to_rfc3339(),
                    ),
                )
                .context("failed to insert standard")?;
                imported += 1;
            }
        }
    }
    tx.commit().context("failed to commit import")?;

    Ok(ImportSummary { imported, updated })
}
