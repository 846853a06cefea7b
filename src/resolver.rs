use crate::adjust::{AdjustmentBundle, AdjustmentContext, TemplateAdjustments};
use crate::cache::RankingCache;
use crate::error::CoreError;
use crate::quantum::TemplateSnapshot;
use crate::standards::CustomStandard;
use serde::Serialize;
use std::collections::BTreeMap;

const MIN_RATING: f64 = 1.0;
const MAX_RATING: f64 = 5.0;
const MIN_ACTIVE_ASPECTS: usize = 3;
const EPSILON: f64 = 1e-9;

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < EPSILON
}

/// Session > custom standard > quantum, in exactly one place. Every getter
/// routes through this so the priority order cannot drift per attribute.
fn resolve_layers<T>(session: Option<T>, custom: Option<T>, quantum: impl FnOnce() -> T) -> T {
    session.or(custom).unwrap_or_else(quantum)
}

/// A sub-aspect after full three-layer resolution of its rating and active
/// flag. The first pass of the two-pass aspect-rating computation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSubAspect {
    pub code: String,
    pub rating: f64,
    pub active: bool,
}

/// Resolves every assessment attribute through the three-layer chain and
/// manages the session layer. Pure over `(context, snapshot, selected)`:
/// storage is consulted only when the snapshot and standard are loaded.
pub struct StandardResolver<'a> {
    snapshot: &'a TemplateSnapshot,
    selected: Option<&'a CustomStandard>,
    cache: Option<&'a dyn RankingCache>,
}

impl<'a> StandardResolver<'a> {
    pub fn new(snapshot: &'a TemplateSnapshot, selected: Option<&'a CustomStandard>) -> Self {
        Self {
            snapshot,
            selected,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: &'a dyn RankingCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn template_id(&self) -> &str {
        &self.snapshot.template.id
    }

    pub fn selected_standard(&self) -> Option<&CustomStandard> {
        self.selected
    }

    /// Pure quantum-default structure, bypassing every override layer.
    pub fn original_template_data(&self) -> &TemplateSnapshot {
        self.snapshot
    }

    fn adj<'c>(&self, ctx: &'c AdjustmentContext) -> Option<&'c TemplateAdjustments> {
        ctx.template(self.template_id())
    }

    fn invalidate_cache(&self) {
        if let Some(cache) = self.cache {
            tracing::debug!(template_id = %self.template_id(), "invalidating rankings after adjustment");
            cache.invalidate_template(self.template_id());
        }
    }

    // --- resolution -------------------------------------------------------
    //
    // The *_with functions take the session layer as an Option so the same
    // code path answers both the effective value (session present) and the
    // baseline used for write-avoidance (session stripped).

    fn category_weight_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> f64 {
        resolve_layers(
            adj.and_then(|a| a.category_weights.get(code).copied()),
            self.selected.and_then(|s| s.category_weight(code)),
            || {
                self.snapshot
                    .category(code)
                    .map(|c| c.weight_percentage)
                    .unwrap_or(0.0)
            },
        )
    }

    fn aspect_weight_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> f64 {
        resolve_layers(
            adj.and_then(|a| a.aspect_weights.get(code).copied()),
            self.selected.and_then(|s| s.aspect_weight(code)),
            || {
                self.snapshot
                    .aspect(code)
                    .map(|a| a.weight_percentage)
                    .unwrap_or(0.0)
            },
        )
    }

    fn sub_aspect_rating_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> f64 {
        resolve_layers(
            adj.and_then(|a| a.sub_aspect_ratings.get(code).copied()),
            self.selected.and_then(|s| s.sub_aspect_rating(code)),
            || {
                self.snapshot
                    .sub_aspect(code)
                    .map(|(_, s)| s.standard_rating)
                    .unwrap_or(0.0)
            },
        )
    }

    fn is_sub_aspect_active_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> bool {
        resolve_layers(
            adj.and_then(|a| a.active_sub_aspects.get(code).copied()),
            self.selected.and_then(|s| s.sub_aspect_active(code)),
            || true,
        )
    }

    fn is_aspect_active_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> bool {
        resolve_layers(
            adj.and_then(|a| a.active_aspects.get(code).copied()),
            self.selected.and_then(|s| s.aspect_active(code)),
            || true,
        )
    }

    fn resolved_sub_aspects_with(
        &self,
        adj: Option<&TemplateAdjustments>,
        aspect_code: &str,
    ) -> Vec<ResolvedSubAspect> {
        let Some(aspect) = self.snapshot.aspect(aspect_code) else {
            return Vec::new();
        };
        aspect
            .sub_aspects
            .iter()
            .map(|s| ResolvedSubAspect {
                code: s.code.clone(),
                rating: self.sub_aspect_rating_with(adj, &s.code),
                active: self.is_sub_aspect_active_with(adj, &s.code),
            })
            .collect()
    }

    fn aspect_rating_with(&self, adj: Option<&TemplateAdjustments>, code: &str) -> f64 {
        let session = adj.and_then(|a| a.aspect_ratings.get(code).copied());
        let custom = self.selected.and_then(|s| s.aspect_rating(code));
        if let Some(direct) = session.or(custom) {
            return direct;
        }
        let Some(aspect) = self.snapshot.aspect(code) else {
            return 0.0;
        };
        if aspect.has_sub_aspects() {
            // Second pass: fold the already-resolved sub-aspects. Zero
            // active sub-aspects yields a zero rating, not an error.
            let resolved = self.resolved_sub_aspects_with(adj, code);
            let active: Vec<&ResolvedSubAspect> = resolved.iter().filter(|s| s.active).collect();
            if active.is_empty() {
                return 0.0;
            }
            active.iter().map(|s| s.rating).sum::<f64>() / active.len() as f64
        } else {
            aspect.standard_rating.unwrap_or(0.0)
        }
    }

    // --- public getters ---------------------------------------------------

    pub fn category_weight(&self, ctx: &AdjustmentContext, code: &str) -> f64 {
        self.category_weight_with(self.adj(ctx), code)
    }

    /// Resolved weight. An aspect whose resolved active flag is false has
    /// effective weight 0 and drops out of every aggregation.
    pub fn aspect_weight(&self, ctx: &AdjustmentContext, code: &str) -> f64 {
        if !self.is_aspect_active(ctx, code) {
            return 0.0;
        }
        self.aspect_weight_with(self.adj(ctx), code)
    }

    pub fn aspect_rating(&self, ctx: &AdjustmentContext, code: &str) -> f64 {
        self.aspect_rating_with(self.adj(ctx), code)
    }

    pub fn sub_aspect_rating(&self, ctx: &AdjustmentContext, code: &str) -> f64 {
        self.sub_aspect_rating_with(self.adj(ctx), code)
    }

    pub fn is_aspect_active(&self, ctx: &AdjustmentContext, code: &str) -> bool {
        self.is_aspect_active_with(self.adj(ctx), code)
    }

    pub fn is_sub_aspect_active(&self, ctx: &AdjustmentContext, code: &str) -> bool {
        self.is_sub_aspect_active_with(self.adj(ctx), code)
    }

    pub fn resolved_sub_aspects(
        &self,
        ctx: &AdjustmentContext,
        aspect_code: &str,
    ) -> Vec<ResolvedSubAspect> {
        self.resolved_sub_aspects_with(self.adj(ctx), aspect_code)
    }

    pub fn active_aspect_ids(&self, ctx: &AdjustmentContext, category_code: &str) -> Vec<String> {
        self.snapshot
            .aspects_in_category(category_code)
            .filter(|a| self.is_aspect_active(ctx, &a.code))
            .map(|a| a.id.clone())
            .collect()
    }

    pub fn active_aspect_codes(&self, ctx: &AdjustmentContext, category_code: &str) -> Vec<String> {
        self.snapshot
            .aspects_in_category(category_code)
            .filter(|a| self.is_aspect_active(ctx, &a.code))
            .map(|a| a.code.clone())
            .collect()
    }

    // --- mutators ---------------------------------------------------------

    fn finish_mutation(&self, ctx: &mut AdjustmentContext) {
        {
            let adj = ctx.template_mut(self.template_id());
            if adj.has_overrides() {
                adj.stamp();
            } else {
                adj.adjusted_at = None;
            }
        }
        ctx.prune(self.template_id());
        self.invalidate_cache();
    }

    fn save_f64(
        &self,
        ctx: &mut AdjustmentContext,
        code: &str,
        value: f64,
        baseline: f64,
        map: fn(&mut TemplateAdjustments) -> &mut BTreeMap<String, f64>,
    ) {
        {
            let adj = ctx.template_mut(self.template_id());
            if approx_eq(value, baseline) {
                map(adj).remove(code);
            } else {
                map(adj).insert(code.to_string(), value);
            }
        }
        self.finish_mutation(ctx);
    }

    /// Saving a value equal to the effective baseline removes any override
    /// for that key instead of writing it, so the session map stays sparse.
    pub fn save_category_weight(&self, ctx: &mut AdjustmentContext, code: &str, value: f64) {
        let baseline = self.category_weight_with(None, code);
        self.save_f64(ctx, code, value, baseline, |a| &mut a.category_weights);
    }

    /// Both category weights in one call. The pair must total 100; anything
    /// else is a caller contract violation, not a user-form problem.
    pub fn save_both_category_weights(
        &self,
        ctx: &mut AdjustmentContext,
        code_a: &str,
        weight_a: f64,
        code_b: &str,
        weight_b: f64,
    ) -> Result<(), CoreError> {
        if !approx_eq(weight_a + weight_b, 100.0) {
            return Err(CoreError::new(
                "invalid_weights",
                format!(
                    "category weights must total 100, got {} + {}",
                    weight_a, weight_b
                ),
            ));
        }
        self.save_category_weight(ctx, code_a, weight_a);
        self.save_category_weight(ctx, code_b, weight_b);
        Ok(())
    }

    pub fn save_aspect_weight(&self, ctx: &mut AdjustmentContext, code: &str, value: f64) {
        let baseline = self.aspect_weight_with(None, code);
        self.save_f64(ctx, code, value, baseline, |a| &mut a.aspect_weights);
    }

    pub fn save_aspect_rating(&self, ctx: &mut AdjustmentContext, code: &str, value: f64) {
        let baseline = self.aspect_rating_with(None, code);
        self.save_f64(ctx, code, value, baseline, |a| &mut a.aspect_ratings);
    }

    pub fn save_sub_aspect_rating(&self, ctx: &mut AdjustmentContext, code: &str, value: f64) {
        let baseline = self.sub_aspect_rating_with(None, code);
        self.save_f64(ctx, code, value, baseline, |a| &mut a.sub_aspect_ratings);
    }

    /// Deactivating records an override and forces the effective weight to 0.
    /// Re-activating removes the override unless the selected custom standard
    /// itself marks the aspect inactive, in which case explicit `true` is
    /// recorded to override it.
    pub fn set_aspect_active(&self, ctx: &mut AdjustmentContext, code: &str, active: bool) {
        let baseline = self.is_aspect_active_with(None, code);
        {
            let adj = ctx.template_mut(self.template_id());
            if active == baseline {
                adj.active_aspects.remove(code);
            } else {
                adj.active_aspects.insert(code.to_string(), active);
            }
        }
        self.finish_mutation(ctx);
    }

    /// Same rule as aspects; an inactive sub-aspect additionally drops out of
    /// its aspect's rating average.
    pub fn set_sub_aspect_active(&self, ctx: &mut AdjustmentContext, code: &str, active: bool) {
        let baseline = self.is_sub_aspect_active_with(None, code);
        {
            let adj = ctx.template_mut(self.template_id());
            if active == baseline {
                adj.active_sub_aspects.remove(code);
            } else {
                adj.active_sub_aspects.insert(code.to_string(), active);
            }
        }
        self.finish_mutation(ctx);
    }

    /// Restore path: writes every provided key verbatim, no baseline
    /// filtering, and always stamps the bucket.
    pub fn save_bulk_adjustments(&self, ctx: &mut AdjustmentContext, bundle: &AdjustmentBundle) {
        {
            let adj = ctx.template_mut(self.template_id());
            for (code, value) in &bundle.category_weights {
                adj.category_weights.insert(code.clone(), *value);
            }
            for (code, value) in &bundle.aspect_weights {
                adj.aspect_weights.insert(code.clone(), *value);
            }
            for (code, value) in &bundle.aspect_ratings {
                adj.aspect_ratings.insert(code.clone(), *value);
            }
            for (code, value) in &bundle.sub_aspect_ratings {
                adj.sub_aspect_ratings.insert(code.clone(), *value);
            }
            for (code, value) in &bundle.active_aspects {
                adj.active_aspects.insert(code.clone(), *value);
            }
            for (code, value) in &bundle.active_sub_aspects {
                adj.active_sub_aspects.insert(code.clone(), *value);
            }
            adj.stamp();
        }
        ctx.prune(self.template_id());
        self.invalidate_cache();
    }

    /// Form-submission path: each entry is filtered against the effective
    /// baseline exactly like the single-key saves.
    pub fn save_bulk_selection(&self, ctx: &mut AdjustmentContext, bundle: &AdjustmentBundle) {
        {
            let adj = ctx.template_mut(self.template_id());
            for (code, value) in &bundle.category_weights {
                if approx_eq(*value, self.category_weight_with(None, code)) {
                    adj.category_weights.remove(code);
                } else {
                    adj.category_weights.insert(code.clone(), *value);
                }
            }
            for (code, value) in &bundle.aspect_weights {
                if approx_eq(*value, self.aspect_weight_with(None, code)) {
                    adj.aspect_weights.remove(code);
                } else {
                    adj.aspect_weights.insert(code.clone(), *value);
                }
            }
            for (code, value) in &bundle.aspect_ratings {
                if approx_eq(*value, self.aspect_rating_with(None, code)) {
                    adj.aspect_ratings.remove(code);
                } else {
                    adj.aspect_ratings.insert(code.clone(), *value);
                }
            }
            for (code, value) in &bundle.sub_aspect_ratings {
                if approx_eq(*value, self.sub_aspect_rating_with(None, code)) {
                    adj.sub_aspect_ratings.remove(code);
                } else {
                    adj.sub_aspect_ratings.insert(code.clone(), *value);
                }
            }
            for (code, value) in &bundle.active_aspects {
                if *value == self.is_aspect_active_with(None, code) {
                    adj.active_aspects.remove(code);
                } else {
                    adj.active_aspects.insert(code.clone(), *value);
                }
            }
            for (code, value) in &bundle.active_sub_aspects {
                if *value == self.is_sub_aspect_active_with(None, code) {
                    adj.active_sub_aspects.remove(code);
                } else {
                    adj.active_sub_aspects.insert(code.clone(), *value);
                }
            }
        }
        self.finish_mutation(ctx);
    }

    /// Removes only the overrides belonging to the given category: its weight
    /// override plus its aspects' weights/ratings/active flags and their
    /// sub-aspects' ratings/active flags.
    pub fn reset_category_adjustments(&self, ctx: &mut AdjustmentContext, category_code: &str) {
        let aspect_codes: Vec<String> = self
            .snapshot
            .aspects_in_category(category_code)
            .map(|a| a.code.clone())
            .collect();
        let sub_codes: Vec<String> = self
            .snapshot
            .aspects_in_category(category_code)
            .flat_map(|a| a.sub_aspects.iter().map(|s| s.code.clone()))
            .collect();
        {
            let adj = ctx.template_mut(self.template_id());
            adj.category_weights.remove(category_code);
            for code in &aspect_codes {
                adj.aspect_weights.remove(code);
                adj.aspect_ratings.remove(code);
                adj.active_aspects.remove(code);
            }
            for code in &sub_codes {
                adj.sub_aspect_ratings.remove(code);
                adj.active_sub_aspects.remove(code);
            }
        }
        self.finish_mutation(ctx);
    }

    /// Removes only the category-weight overrides; aspect and sub-aspect
    /// overrides stay.
    pub fn reset_category_weights(&self, ctx: &mut AdjustmentContext) {
        {
            let adj = ctx.template_mut(self.template_id());
            adj.category_weights.clear();
        }
        self.finish_mutation(ctx);
    }

    /// Drops this template's whole bucket, selection pointer included.
    pub fn reset_template(&self, ctx: &mut AdjustmentContext) {
        ctx.remove_template(self.template_id());
        self.invalidate_cache();
    }

    // --- validation -------------------------------------------------------

    /// Soft validation of a proposed adjustment bundle against the current
    /// effective state. Returns a field-keyed error map; an empty map means
    /// the bundle is acceptable. Never errors.
    pub fn validate_adjustments(
        &self,
        ctx: &AdjustmentContext,
        bundle: &AdjustmentBundle,
    ) -> BTreeMap<String, String> {
        let mut errors = BTreeMap::new();

        for (code, value) in &bundle.aspect_ratings {
            if self.snapshot.aspect(code).is_none() {
                errors.insert(
                    format!("aspectRatings.{}", code),
                    "unknown aspect code".to_string(),
                );
            } else if *value < MIN_RATING - EPSILON || *value > MAX_RATING + EPSILON {
                errors.insert(
                    format!("aspectRatings.{}", code),
                    format!("rating must be between {} and {}", MIN_RATING, MAX_RATING),
                );
            }
        }
        for (code, value) in &bundle.sub_aspect_ratings {
            if self.snapshot.sub_aspect(code).is_none() {
                errors.insert(
                    format!("subAspectRatings.{}", code),
                    "unknown sub-aspect code".to_string(),
                );
            } else if *value < MIN_RATING - EPSILON || *value > MAX_RATING + EPSILON {
                errors.insert(
                    format!("subAspectRatings.{}", code),
                    format!("rating must be between {} and {}", MIN_RATING, MAX_RATING),
                );
            }
        }
        for code in bundle.aspect_weights.keys() {
            if self.snapshot.aspect(code).is_none() {
                errors.insert(
                    format!("aspectWeights.{}", code),
                    "unknown aspect code".to_string(),
                );
            }
        }
        for code in bundle.category_weights.keys() {
            if self.snapshot.category(code).is_none() {
                errors.insert(
                    format!("categoryWeights.{}", code),
                    "unknown category code".to_string(),
                );
            }
        }

        if !bundle.category_weights.is_empty() {
            let total: f64 = self
                .snapshot
                .categories
                .iter()
                .map(|c| {
                    bundle
                        .category_weights
                        .get(&c.code)
                        .copied()
                        .unwrap_or_else(|| self.category_weight(ctx, &c.code))
                })
                .sum();
            if !approx_eq(total, 100.0) {
                errors.insert(
                    "categoryWeights".to_string(),
                    format!("category weights must total 100, got {}", total),
                );
            }
        }

        for category in &self.snapshot.categories {
            let active_count = self
                .snapshot
                .aspects_in_category(&category.code)
                .filter(|a| {
                    bundle
                        .active_aspects
                        .get(&a.code)
                        .copied()
                        .unwrap_or_else(|| self.is_aspect_active(ctx, &a.code))
                })
                .count();
            if active_count < MIN_ACTIVE_ASPECTS {
                errors.insert(
                    format!("activeAspects.{}", category.code),
                    format!(
                        "at least {} active aspects required, got {}",
                        MIN_ACTIVE_ASPECTS, active_count
                    ),
                );
            }
        }

        for aspect in &self.snapshot.aspects {
            if !aspect.has_sub_aspects() {
                continue;
            }
            let aspect_active = bundle
                .active_aspects
                .get(&aspect.code)
                .copied()
                .unwrap_or_else(|| self.is_aspect_active(ctx, &aspect.code));
            if !aspect_active {
                continue;
            }
            let any_sub_active = aspect.sub_aspects.iter().any(|s| {
                bundle
                    .active_sub_aspects
                    .get(&s.code)
                    .copied()
                    .unwrap_or_else(|| self.is_sub_aspect_active(ctx, &s.code))
            });
            if !any_sub_active {
                errors.insert(
                    format!("activeSubAspects.{}", aspect.code),
                    "an active aspect needs at least one active sub-aspect".to_string(),
                );
            }
        }

        errors
    }

    /// Same contract as `validate_adjustments`; the name matches the
    /// form-submission path that feeds `save_bulk_selection`.
    pub fn validate_selection(
        &self,
        ctx: &AdjustmentContext,
        bundle: &AdjustmentBundle,
    ) -> BTreeMap<String, String> {
        self.validate_adjustments(ctx, bundle)
    }
}
