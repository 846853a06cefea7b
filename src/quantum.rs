use crate::error::CoreError;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub id: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDef {
    pub id: String,
    pub code: String,
    pub weight_percentage: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAspectDef {
    pub id: String,
    pub code: String,
    pub standard_rating: f64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AspectDef {
    pub id: String,
    pub category_code: String,
    pub code: String,
    pub weight_percentage: f64,
    /// None means the aspect is rated through its sub-aspects.
    pub standard_rating: Option<f64>,
    pub sort_order: i64,
    pub sub_aspects: Vec<SubAspectDef>,
}

impl AspectDef {
    pub fn has_sub_aspects(&self) -> bool {
        !self.sub_aspects.is_empty()
    }
}

/// The quantum-default view of one template: categories and the full
/// aspect/sub-aspect tree, untouched by any override layer. Serves both as
/// the resolver's layer-3 input and as the "no customization" display data.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSnapshot {
    pub template: TemplateInfo,
    pub categories: Vec<CategoryDef>,
    pub aspects: Vec<AspectDef>,
}

impl TemplateSnapshot {
    pub fn load(conn: &Connection, template_id: &str) -> Result<Self, CoreError> {
        let template: Option<TemplateInfo> = conn
            .query_row(
                "SELECT id, code, name FROM assessment_templates WHERE id = ?",
                [template_id],
                |r| {
                    Ok(TemplateInfo {
                        id: r.get(0)?,
                        code: r.get(1)?,
                        name: r.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(CoreError::db)?;
        let Some(template) = template else {
            return Err(CoreError::not_found("template"));
        };

        let mut categories_stmt = conn
            .prepare(
                "SELECT id, code, weight_percentage, sort_order
                 FROM category_types
                 WHERE template_id = ?
                 ORDER BY sort_order",
            )
            .map_err(CoreError::db)?;
        let categories: Vec<CategoryDef> = categories_stmt
            .query_map([template_id], |r| {
                Ok(CategoryDef {
                    id: r.get(0)?,
                    code: r.get(1)?,
                    weight_percentage: r.get(2)?,
                    sort_order: r.get(3)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CoreError::db)?;

        let mut aspects_stmt = conn
            .prepare(
                "SELECT a.id, c.code, a.code, a.weight_percentage, a.standard_rating, a.sort_order
                 FROM aspects a
                 JOIN category_types c ON c.id = a.category_type_id
                 WHERE a.template_id = ?
                 ORDER BY a.sort_order",
            )
            .map_err(CoreError::db)?;
        let mut aspects: Vec<AspectDef> = aspects_stmt
            .query_map([template_id], |r| {
                Ok(AspectDef {
                    id: r.get(0)?,
                    category_code: r.get(1)?,
                    code: r.get(2)?,
                    weight_percentage: r.get(3)?,
                    standard_rating: r.get(4)?,
                    sort_order: r.get(5)?,
                    sub_aspects: Vec::new(),
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CoreError::db)?;

        let mut subs_stmt = conn
            .prepare(
                "SELECT s.aspect_id, s.id, s.code, s.standard_rating, s.sort_order
                 FROM sub_aspects s
                 JOIN aspects a ON a.id = s.aspect_id
                 WHERE a.template_id = ?
                 ORDER BY s.sort_order",
            )
            .map_err(CoreError::db)?;
        let subs: Vec<(String, SubAspectDef)> = subs_stmt
            .query_map([template_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    SubAspectDef {
                        id: r.get(1)?,
                        code: r.get(2)?,
                        standard_rating: r.get(3)?,
                        sort_order: r.get(4)?,
                    },
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(CoreError::db)?;
        for (aspect_id, sub) in subs {
            if let Some(aspect) = aspects.iter_mut().find(|a| a.id == aspect_id) {
                aspect.sub_aspects.push(sub);
            }
        }

        Ok(Self {
            template,
            categories,
            aspects,
        })
    }

    pub fn category(&self, code: &str) -> Option<&CategoryDef> {
        self.categories.iter().find(|c| c.code == code)
    }

    pub fn aspect(&self, code: &str) -> Option<&AspectDef> {
        self.aspects.iter().find(|a| a.code == code)
    }

    pub fn aspect_by_id(&self, id: &str) -> Option<&AspectDef> {
        self.aspects.iter().find(|a| a.id == id)
    }

    pub fn aspects_in_category<'a>(
        &'a self,
        category_code: &'a str,
    ) -> impl Iterator<Item = &'a AspectDef> {
        self.aspects
            .iter()
            .filter(move |a| a.category_code == category_code)
    }

    /// Locate the sub-aspect and its owning aspect for a sub-aspect code.
    pub fn sub_aspect(&self, code: &str) -> Option<(&AspectDef, &SubAspectDef)> {
        for aspect in &self.aspects {
            if let Some(sub) = aspect.sub_aspects.iter().find(|s| s.code == code) {
                return Some((aspect, sub));
            }
        }
        None
    }
}
