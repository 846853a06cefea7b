use crate::adjust::AdjustmentContext;
use crate::cache::RankingCache;
use crate::error::CoreError;
use crate::quantum::{TemplateInfo, TemplateSnapshot};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-aspect override entry of a custom standard. `rating` is present only
/// for aspects without sub-aspects; its absence is an explicit state, not a
/// missing-key convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectConfig {
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAspectConfig {
    pub rating: f64,
    pub active: bool,
}

/// An institution-owned, persisted override set for one template (layer 2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomStandard {
    pub id: String,
    pub institution_id: String,
    pub template_id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub category_weights: BTreeMap<String, f64>,
    pub aspect_configs: BTreeMap<String, AspectConfig>,
    pub sub_aspect_configs: BTreeMap<String, SubAspectConfig>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl CustomStandard {
    pub fn category_weight(&self, code: &str) -> Option<f64> {
        self.category_weights.get(code).copied()
    }

    pub fn aspect_weight(&self, code: &str) -> Option<f64> {
        self.aspect_configs.get(code).map(|c| c.weight)
    }

    pub fn aspect_rating(&self, code: &str) -> Option<f64> {
        self.aspect_configs.get(code).and_then(|c| c.rating)
    }

    pub fn aspect_active(&self, code: &str) -> Option<bool> {
        self.aspect_configs.get(code).map(|c| c.active)
    }

    pub fn sub_aspect_rating(&self, code: &str) -> Option<f64> {
        self.sub_aspect_configs.get(code).map(|c| c.rating)
    }

    pub fn sub_aspect_active(&self, code: &str) -> Option<bool> {
        self.sub_aspect_configs.get(code).map(|c| c.active)
    }
}

/// Creation payload; also the shape `validate` checks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardDraft {
    pub institution_id: String,
    pub template_id: String,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub category_weights: BTreeMap<String, f64>,
    pub aspect_configs: BTreeMap<String, AspectConfig>,
    pub sub_aspect_configs: BTreeMap<String, SubAspectConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomStandardPatch {
    pub code: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub is_active: Option<bool>,
    pub category_weights: Option<BTreeMap<String, f64>>,
    pub aspect_configs: Option<BTreeMap<String, AspectConfig>>,
    pub sub_aspect_configs: Option<BTreeMap<String, SubAspectConfig>>,
}

/// Quantum-seeded maps in custom-standard shape, the starting point an
/// administrator edits from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardDefaults {
    pub category_weights: BTreeMap<String, f64>,
    pub aspect_configs: BTreeMap<String, AspectConfig>,
    pub sub_aspect_configs: BTreeMap<String, SubAspectConfig>,
}

/// `"null"` and `""` arrive from form posts meaning "no standard".
pub fn normalize_standard_id(raw: Option<&str>) -> Option<String> {
    match raw {
        None => None,
        Some(s) => {
            let t = s.trim();
            if t.is_empty() || t.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(t.to_string())
            }
        }
    }
}

pub struct CustomStandardStore<'a> {
    conn: &'a Connection,
    cache: Option<&'a dyn RankingCache>,
}

impl<'a> CustomStandardStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn, cache: None }
    }

    pub fn with_cache(mut self, cache: &'a dyn RankingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn invalidate(&self, template_id: &str) {
        if let Some(cache) = self.cache {
            cache.invalidate_template(template_id);
        }
    }

    fn read_standard(row: &Row<'_>) -> rusqlite::Result<CustomStandard> {
        let category_weights: String = row.get(7)?;
        let aspect_configs: String = row.get(8)?;
        let sub_aspect_configs: String = row.get(9)?;
        Ok(CustomStandard {
            id: row.get(0)?,
            institution_id: row.get(1)?,
            template_id: row.get(2)?,
            code: row.get(3)?,
            name: row.get(4)?,
            description: row.get(5)?,
            is_active: row.get::<_, i64>(6)? != 0,
            category_weights: serde_json::from_str(&category_weights).unwrap_or_default(),
            aspect_configs: serde_json::from_str(&aspect_configs).unwrap_or_default(),
            sub_aspect_configs: serde_json::from_str(&sub_aspect_configs).unwrap_or_default(),
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    const SELECT_COLUMNS: &'static str = "id, institution_id, template_id, code, name, description,
         is_active, category_weights, aspect_configs, sub_aspect_configs, created_at, updated_at";

    pub fn get(&self, id: &str) -> Result<Option<CustomStandard>, CoreError> {
        let sql = format!(
            "SELECT {} FROM custom_standards WHERE id = ?",
            Self::SELECT_COLUMNS
        );
        self.conn
            .query_row(&sql, [id], Self::read_standard)
            .optional()
            .map_err(CoreError::db)
    }

    /// Active standards for one institution and template, name order.
    pub fn get_for_institution(
        &self,
        institution_id: &str,
        template_id: &str,
    ) -> Result<Vec<CustomStandard>, CoreError> {
        let sql = format!(
            "SELECT {} FROM custom_standards
             WHERE institution_id = ? AND template_id = ? AND is_active = 1
             ORDER BY name",
            Self::SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).map_err(CoreError::db)?;
        stmt.query_map([institution_id, template_id], Self::read_standard)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CoreError::db)
    }

    /// Templates the institution actually assesses against (has position
    /// formations for), deduplicated, name order.
    pub fn get_available_templates(
        &self,
        institution_id: &str,
    ) -> Result<Vec<TemplateInfo>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT t.id, t.code, t.name
                 FROM assessment_templates t
                 JOIN position_formations pf ON pf.template_id = t.id
                 WHERE pf.institution_id = ?
                 ORDER BY t.name",
            )
            .map_err(CoreError::db)?;
        stmt.query_map([institution_id], |r| {
            Ok(TemplateInfo {
                id: r.get(0)?,
                code: r.get(1)?,
                name: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CoreError::db)
    }

    /// The custom-standard shape seeded from quantum data. A nonexistent
    /// template here is a hard error: the UI only offers templates it was
    /// given.
    pub fn get_template_defaults(&self, template_id: &str) -> Result<StandardDefaults, CoreError> {
        let snapshot = TemplateSnapshot::load(self.conn, template_id)?;

        let mut category_weights = BTreeMap::new();
        for category in &snapshot.categories {
            category_weights.insert(category.code.clone(), category.weight_percentage);
        }

        let mut aspect_configs = BTreeMap::new();
        let mut sub_aspect_configs = BTreeMap::new();
        for aspect in &snapshot.aspects {
            let rating = if aspect.has_sub_aspects() {
                None
            } else {
                Some(aspect.standard_rating.unwrap_or(0.0))
            };
            aspect_configs.insert(
                aspect.code.clone(),
                AspectConfig {
                    weight: aspect.weight_percentage,
                    rating,
                    active: true,
                },
            );
            for sub in &aspect.sub_aspects {
                sub_aspect_configs.insert(
                    sub.code.clone(),
                    SubAspectConfig {
                        rating: sub.standard_rating,
                        active: true,
                    },
                );
            }
        }

        Ok(StandardDefaults {
            category_weights,
            aspect_configs,
            sub_aspect_configs,
        })
    }

    // --- CRUD -------------------------------------------------------------

    pub fn create(&self, draft: &StandardDraft) -> Result<CustomStandard, CoreError> {
        if !self.is_code_unique(&draft.institution_id, &draft.code, None)? {
            return Err(CoreError::new(
                "code_taken",
                format!("standard code '{}' already exists", draft.code),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let category_weights = serde_json::to_string(&draft.category_weights)
            .map_err(|e| CoreError::new("bad_config", e.to_string()))?;
        let aspect_configs = serde_json::to_string(&draft.aspect_configs)
            .map_err(|e| CoreError::new("bad_config", e.to_string()))?;
        let sub_aspect_configs = serde_json::to_string(&draft.sub_aspect_configs)
            .map_err(|e| CoreError::new("bad_config", e.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO custom_standards(
                    id, institution_id, template_id, code, name, description, is_active,
                    category_weights, aspect_configs, sub_aspect_configs, created_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &id,
                    &draft.institution_id,
                    &draft.template_id,
                    &draft.code,
                    &draft.name,
                    &draft.description,
                    draft.is_active as i64,
                    &category_weights,
                    &aspect_configs,
                    &sub_aspect_configs,
                    &created_at,
                ),
            )
            .map_err(|e| CoreError::new("db_insert_failed", e.to_string()))?;

        self.invalidate(&draft.template_id);
        self.get(&id)?
            .ok_or_else(|| CoreError::not_found("custom standard"))
    }

    pub fn update(
        &self,
        id: &str,
        patch: &CustomStandardPatch,
    ) -> Result<CustomStandard, CoreError> {
        let Some(existing) = self.get(id)? else {
            return Err(CoreError::not_found("custom standard"));
        };

        if let Some(code) = &patch.code {
            if !self.is_code_unique(&existing.institution_id, code, Some(id))? {
                return Err(CoreError::new(
                    "code_taken",
                    format!("standard code '{}' already exists", code),
                ));
            }
        }

        let mut set_parts: Vec<String> = Vec::new();
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(code) = &patch.code {
            set_parts.push("code = ?".into());
            bind_values.push(Value::Text(code.clone()));
        }
        if let Some(name) = &patch.name {
            set_parts.push("name = ?".into());
            bind_values.push(Value::Text(name.clone()));
        }
        if let Some(description) = &patch.description {
            set_parts.push("description = ?".into());
            if description.is_empty() {
                bind_values.push(Value::Null);
            } else {
                bind_values.push(Value::Text(description.clone()));
            }
        }
        if let Some(is_active) = patch.is_active {
            set_parts.push("is_active = ?".into());
            bind_values.push(Value::Integer(is_active as i64));
        }
        if let Some(weights) = &patch.category_weights {
            set_parts.push("category_weights = ?".into());
            bind_values.push(Value::Text(
                serde_json::to_string(weights)
                    .map_err(|e| CoreError::new("bad_config", e.to_string()))?,
            ));
        }
        if let Some(configs) = &patch.aspect_configs {
            set_parts.push("aspect_configs = ?".into());
            bind_values.push(Value::Text(
                serde_json::to_string(configs)
                    .map_err(|e| CoreError::new("bad_config", e.to_string()))?,
            ));
        }
        if let Some(configs) = &patch.sub_aspect_configs {
            set_parts.push("sub_aspect_configs = ?".into());
            bind_values.push(Value::Text(
                serde_json::to_string(configs)
                    .map_err(|e| CoreError::new("bad_config", e.to_string()))?,
            ));
        }

        if set_parts.is_empty() {
            return Ok(existing);
        }

        set_parts.push("updated_at = ?".into());
        bind_values.push(Value::Text(chrono::Utc::now().to_rfc3339()));
        bind_values.push(Value::Text(id.to_string()));

        let sql = format!(
            "UPDATE custom_standards SET {} WHERE id = ?",
            set_parts.join(", ")
        );
        self.conn
            .execute(&sql, params_from_iter(bind_values))
            .map_err(|e| CoreError::new("db_update_failed", e.to_string()))?;

        self.invalidate(&existing.template_id);
        self.get(id)?
            .ok_or_else(|| CoreError::not_found("custom standard"))
    }

    pub fn delete(&self, id: &str) -> Result<(), CoreError> {
        let Some(existing) = self.get(id)? else {
            return Err(CoreError::not_found("custom standard"));
        };
        self.conn
            .execute("DELETE FROM custom_standards WHERE id = ?", [id])
            .map_err(|e| CoreError::new("db_delete_failed", e.to_string()))?;
        self.invalidate(&existing.template_id);
        Ok(())
    }

    // --- session selection ------------------------------------------------

    /// Sets (or clears) the selected standard for a template and discards any
    /// in-progress session adjustments for it; overrides recorded against the
    /// old baseline have no meaning under the new one.
    pub fn select(
        &self,
        ctx: &mut AdjustmentContext,
        template_id: &str,
        raw_standard_id: Option<&str>,
    ) {
        let standard_id = normalize_standard_id(raw_standard_id);
        tracing::info!(template_id, standard_id = ?standard_id, "custom standard selected");
        {
            let adj = ctx.template_mut(template_id);
            adj.clear_overrides();
            adj.selected_standard_id = standard_id;
        }
        ctx.prune(template_id);
        self.invalidate(template_id);
    }

    pub fn selected_id(&self, ctx: &AdjustmentContext, template_id: &str) -> Option<String> {
        ctx.template(template_id)
            .and_then(|a| a.selected_standard_id.clone())
    }

    /// Hydrates the selected standard; a stale or mismatched id reads as no
    /// selection.
    pub fn selected_standard(
        &self,
        ctx: &AdjustmentContext,
        template_id: &str,
    ) -> Result<Option<CustomStandard>, CoreError> {
        let Some(id) = self.selected_id(ctx, template_id) else {
            return Ok(None);
        };
        Ok(self
            .get(&id)?
            .filter(|s| s.template_id == template_id && s.is_active))
    }

    pub fn clear_selection(&self, ctx: &mut AdjustmentContext, template_id: &str) {
        ctx.remove_template(template_id);
        self.invalidate(template_id);
    }

    // --- per-standard getters (graceful on unknown id/code) ----------------

    pub fn aspect_weight(&self, standard_id: &str, code: &str) -> Result<Option<f64>, CoreError> {
        Ok(self.get(standard_id)?.and_then(|s| s.aspect_weight(code)))
    }

    pub fn aspect_rating(&self, standard_id: &str, code: &str) -> Result<Option<f64>, CoreError> {
        Ok(self.get(standard_id)?.and_then(|s| s.aspect_rating(code)))
    }

    pub fn sub_aspect_rating(
        &self,
        standard_id: &str,
        code: &str,
    ) -> Result<Option<f64>, CoreError> {
        Ok(self
            .get(standard_id)?
            .and_then(|s| s.sub_aspect_rating(code)))
    }

    pub fn category_weight(&self, standard_id: &str, code: &str) -> Result<Option<f64>, CoreError> {
        Ok(self.get(standard_id)?.and_then(|s| s.category_weight(code)))
    }

    pub fn is_aspect_active(&self, standard_id: &str, code: &str) -> Result<bool, CoreError> {
        Ok(self
            .get(standard_id)?
            .and_then(|s| s.aspect_active(code))
            .unwrap_or(true))
    }

    pub fn is_sub_aspect_active(&self, standard_id: &str, code: &str) -> Result<bool, CoreError> {
        Ok(self
            .get(standard_id)?
            .and_then(|s| s.sub_aspect_active(code))
            .unwrap_or(true))
    }

    // --- validation -------------------------------------------------------

    /// Field-keyed soft validation of a draft. Structure-aware checks only
    /// run when the template exists; a missing template is itself a field
    /// error here, not a hard failure.
    pub fn validate(&self, draft: &StandardDraft) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();

        if draft.code.trim().is_empty() {
            errors.insert("code".to_string(), "code must not be empty".to_string());
        }
        if draft.name.trim().is_empty() {
            errors.insert("name".to_string(), "name must not be empty".to_string());
        }

        for (code, config) in &draft.aspect_configs {
            if let Some(rating) = config.rating {
                if !(1.0..=5.0).contains(&rating) {
                    errors.insert(
                        format!("aspectConfigs.{}", code),
                        "rating must be between 1 and 5".to_string(),
                    );
                }
            }
        }
        for (code, config) in &draft.sub_aspect_configs {
            if !(1.0..=5.0).contains(&config.rating) {
                errors.insert(
                    format!("subAspectConfigs.{}", code),
                    "rating must be between 1 and 5".to_string(),
                );
            }
        }

        match TemplateSnapshot::load(self.conn, &draft.template_id) {
            Err(_) => {
                errors.insert("templateId".to_string(), "unknown template".to_string());
            }
            Ok(snapshot) => {
                if !draft.category_weights.is_empty() {
                    let total: f64 = snapshot
                        .categories
                        .iter()
                        .map(|c| {
                            draft
                                .category_weights
                                .get(&c.code)
                                .copied()
                                .unwrap_or(c.weight_percentage)
                        })
                        .sum();
                    if (total - 100.0).abs() > 1e-9 {
                        errors.insert(
                            "categoryWeights".to_string(),
                            format!("category weights must total 100, got {}", total),
                        );
                    }
                }

                for category in &snapshot.categories {
                    let active_count = snapshot
                        .aspects_in_category(&category.code)
                        .filter(|a| {
                            draft
                                .aspect_configs
                                .get(&a.code)
                                .map(|c| c.active)
                                .unwrap_or(true)
                        })
                        .count();
                    if active_count < 3 {
                        errors.insert(
                            format!("aspectConfigs.{}", category.code),
                            format!("at least 3 active aspects required, got {}", active_count),
                        );
                    }
                }
            }
        }

        errors
    }

    pub fn is_code_unique(
        &self,
        institution_id: &str,
        code: &str,
        exclude_id: Option<&str>,
    ) -> Result<bool, CoreError> {
        let existing: Option<String> = match exclude_id {
            Some(exclude) => self
                .conn
                .query_row(
                    "SELECT id FROM custom_standards
                     WHERE institution_id = ? AND code = ? AND id != ?",
                    (institution_id, code, exclude),
                    |r| r.get(0),
                )
                .optional()
                .map_err(CoreError::db)?,
            None => self
                .conn
                .query_row(
                    "SELECT id FROM custom_standards WHERE institution_id = ? AND code = ?",
                    (institution_id, code),
                    |r| r.get(0),
                )
                .optional()
                .map_err(CoreError::db)?,
        };
        Ok(existing.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_treats_null_strings_as_none() {
        assert_eq!(normalize_standard_id(None), None);
        assert_eq!(normalize_standard_id(Some("")), None);
        assert_eq!(normalize_standard_id(Some("  ")), None);
        assert_eq!(normalize_standard_id(Some("null")), None);
        assert_eq!(normalize_standard_id(Some("NULL")), None);
        assert_eq!(
            normalize_standard_id(Some("cs-1")),
            Some("cs-1".to_string())
        );
    }

    #[test]
    fn standard_getters_read_config_maps() {
        let mut aspect_configs = BTreeMap::new();
        aspect_configs.insert(
            "intel".to_string(),
            AspectConfig {
                weight: 40.0,
                rating: None,
                active: false,
            },
        );
        let standard = CustomStandard {
            id: "cs-1".to_string(),
            institution_id: "inst".to_string(),
            template_id: "t1".to_string(),
            code: "CS".to_string(),
            name: "Custom".to_string(),
            description: None,
            is_active: true,
            category_weights: BTreeMap::new(),
            aspect_configs,
            sub_aspect_configs: BTreeMap::new(),
            created_at: None,
            updated_at: None,
        };

        assert_eq!(standard.aspect_weight("intel"), Some(40.0));
        // Absent rating stays absent, it is not a zero.
        assert_eq!(standard.aspect_rating("intel"), None);
        assert_eq!(standard.aspect_active("intel"), Some(false));
        assert_eq!(standard.aspect_weight("ghost"), None);
        assert_eq!(standard.sub_aspect_active("ghost"), None);
    }
}
