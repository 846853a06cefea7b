use crate::adjust::AdjustmentContext;
use crate::cache::{cache_key, BaseRow, CachedRanking, RankingCache};
use crate::conclusion::ConclusionClassifier;
use crate::error::CoreError;
use crate::quantum::{AspectDef, TemplateSnapshot};
use crate::resolver::StandardResolver;
use crate::standards::CustomStandardStore;
use rusqlite::{params_from_iter, types::Value, Connection};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub const POTENSI: &str = "potensi";
pub const KOMPETENSI: &str = "kompetensi";

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct RankingRequest {
    pub event_id: String,
    pub position_id: String,
    pub template_id: String,
    pub category_code: String,
    pub tolerance_percent: f64,
}

#[derive(Debug, Clone)]
pub struct CombinedRequest {
    pub event_id: String,
    pub position_id: String,
    pub template_id: String,
    pub tolerance_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedParticipant {
    pub rank: usize,
    pub participant_id: String,
    pub participant_name: String,
    pub individual_rating: f64,
    pub individual_score: f64,
    pub original_standard_rating: f64,
    pub original_standard_score: f64,
    pub adjusted_standard_rating: f64,
    pub adjusted_standard_score: f64,
    pub original_gap_rating: f64,
    pub original_gap_score: f64,
    pub adjusted_gap_rating: f64,
    pub adjusted_gap_score: f64,
    pub percentage: f64,
    pub conclusion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedRankedParticipant {
    pub rank: usize,
    pub participant_id: String,
    pub participant_name: String,
    pub potensi_weight: f64,
    pub kompetensi_weight: f64,
    pub potensi_score: f64,
    pub kompetensi_score: f64,
    pub total_individual_score: f64,
    pub total_standard_score: f64,
    pub total_original_standard_score: f64,
    pub total_gap_score: f64,
    pub total_original_gap_score: f64,
    pub percentage: f64,
    pub conclusion: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRank {
    pub rank: usize,
    pub total: usize,
    pub row: RankedParticipant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedParticipantRank {
    pub rank: usize,
    pub total: usize,
    pub row: CombinedRankedParticipant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingPage {
    pub total: usize,
    pub offset: usize,
    pub rows: Vec<RankedParticipant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardAggregate {
    pub rating: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassingSummary {
    pub total: usize,
    pub passing: usize,
    pub percentage: f64,
}

#[derive(Debug, Clone)]
struct ParticipantRow {
    id: String,
    name: String,
}

/// Computes ordered, gap-annotated participant rankings under the currently
/// resolved configuration. Assessment rows are read-only inputs; every
/// derived value is recomputed in memory. The tolerance-independent base is
/// cached; tolerance, percentage, and conclusions are applied on every read.
pub struct RankingEngine<'a> {
    conn: &'a Connection,
    cache: &'a dyn RankingCache,
    classifier: &'a dyn ConclusionClassifier,
}

impl<'a> RankingEngine<'a> {
    pub fn new(
        conn: &'a Connection,
        cache: &'a dyn RankingCache,
        classifier: &'a dyn ConclusionClassifier,
    ) -> Self {
        Self {
            conn,
            cache,
            classifier,
        }
    }

    pub fn get_rankings(
        &self,
        req: &RankingRequest,
        ctx: &AdjustmentContext,
    ) -> Result<Vec<RankedParticipant>, CoreError> {
        let base = self.base_rows(req, ctx)?;
        Ok(self.hydrate(&base, req.tolerance_percent, 0))
    }

    /// Full lightweight sort over all participants, per-row hydration only
    /// for the requested window.
    pub fn get_rankings_page(
        &self,
        req: &RankingRequest,
        ctx: &AdjustmentContext,
        offset: usize,
        limit: usize,
    ) -> Result<RankingPage, CoreError> {
        let base = self.base_rows(req, ctx)?;
        let total = base.len();
        let start = offset.min(total);
        let end = start.saturating_add(limit).min(total);
        let rows = self.hydrate(&base[start..end], req.tolerance_percent, start);
        Ok(RankingPage {
            total,
            offset: start,
            rows,
        })
    }

    pub fn get_participant_rank(
        &self,
        req: &RankingRequest,
        ctx: &AdjustmentContext,
        participant_id: &str,
    ) -> Result<Option<ParticipantRank>, CoreError> {
        let rankings = self.get_rankings(req, ctx)?;
        let total = rankings.len();
        Ok(rankings
            .into_iter()
            .find(|r| r.participant_id == participant_id)
            .map(|row| ParticipantRank {
                rank: row.rank,
                total,
                row,
            }))
    }

    /// Aggregate standard rating/score for an explicit active-aspect id set,
    /// with the tolerance already applied. An empty id list yields (0, 0).
    pub fn calculate_adjusted_standards(
        &self,
        resolver: &StandardResolver<'_>,
        ctx: &AdjustmentContext,
        active_aspect_ids: &[String],
        tolerance_percent: f64,
    ) -> StandardAggregate {
        if active_aspect_ids.is_empty() {
            return StandardAggregate {
                rating: 0.0,
                score: 0.0,
            };
        }
        let snapshot = resolver.original_template_data();
        let aspects: Vec<&AspectDef> = active_aspect_ids
            .iter()
            .filter_map(|id| snapshot.aspect_by_id(id))
            .collect();
        if aspects.is_empty() {
            return StandardAggregate {
                rating: 0.0,
                score: 0.0,
            };
        }
        let (rating, score) = standard_aggregate(resolver, ctx, &aspects);
        let factor = 1.0 - tolerance_percent / 100.0;
        StandardAggregate {
            rating: round2(rating * factor),
            score: round2(score * factor),
        }
    }

    pub fn get_combined_rankings(
        &self,
        req: &CombinedRequest,
        ctx: &AdjustmentContext,
    ) -> Result<Vec<CombinedRankedParticipant>, CoreError> {
        let potensi = self.get_rankings(&self.category_request(req, POTENSI), ctx)?;
        let kompetensi = self.get_rankings(&self.category_request(req, KOMPETENSI), ctx)?;
        // A combined board needs both halves; a single empty category reads
        // as "nothing to combine", not an error.
        if potensi.is_empty() || kompetensi.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = TemplateSnapshot::load(self.conn, &req.template_id)?;
        let store = CustomStandardStore::new(self.conn);
        let selected = store.selected_standard(ctx, &req.template_id)?;
        let resolver = StandardResolver::new(&snapshot, selected.as_ref());
        let potensi_weight = resolver.category_weight(ctx, POTENSI);
        let kompetensi_weight = resolver.category_weight(ctx, KOMPETENSI);

        let by_id: HashMap<&str, &RankedParticipant> = kompetensi
            .iter()
            .map(|r| (r.participant_id.as_str(), r))
            .collect();

        let mut rows: Vec<CombinedRankedParticipant> = potensi
            .iter()
            .filter_map(|p| {
                let k = by_id.get(p.participant_id.as_str())?;
                let total_individual_score = round2(
                    p.individual_score * potensi_weight / 100.0
                        + k.individual_score * kompetensi_weight / 100.0,
                );
                let total_standard_score = round2(
                    p.adjusted_standard_score * potensi_weight / 100.0
                        + k.adjusted_standard_score * kompetensi_weight / 100.0,
                );
                let total_original_standard_score = round2(
                    p.original_standard_score * potensi_weight / 100.0
                        + k.original_standard_score * kompetensi_weight / 100.0,
                );
                let total_gap_score = round2(total_individual_score - total_standard_score);
                let total_original_gap_score =
                    round2(total_individual_score - total_original_standard_score);
                let percentage = if total_standard_score > 0.0 {
                    round2(total_individual_score / total_standard_score * 100.0)
                } else {
                    0.0
                };
                Some(CombinedRankedParticipant {
                    rank: 0,
                    participant_id: p.participant_id.clone(),
                    participant_name: p.participant_name.clone(),
                    potensi_weight,
                    kompetensi_weight,
                    potensi_score: p.individual_score,
                    kompetensi_score: k.individual_score,
                    total_individual_score,
                    total_standard_score,
                    total_original_standard_score,
                    total_gap_score,
                    total_original_gap_score,
                    percentage,
                    conclusion: self.classifier.classify(total_gap_score, percentage),
                })
            })
            .collect();

        rows.sort_by(|a, b| {
            b.total_individual_score
                .partial_cmp(&a.total_individual_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.participant_name.cmp(&b.participant_name))
        });
        for (i, row) in rows.iter_mut().enumerate() {
            row.rank = i + 1;
        }
        Ok(rows)
    }

    pub fn get_participant_combined_rank(
        &self,
        req: &CombinedRequest,
        ctx: &AdjustmentContext,
        participant_id: &str,
    ) -> Result<Option<CombinedParticipantRank>, CoreError> {
        let rankings = self.get_combined_rankings(req, ctx)?;
        let total = rankings.len();
        Ok(rankings
            .into_iter()
            .find(|r| r.participant_id == participant_id)
            .map(|row| CombinedParticipantRank {
                rank: row.rank,
                total,
                row,
            }))
    }

    /// Count and share of participants at or above the adjusted standard.
    /// A pure fold over an already-computed ranking list.
    pub fn get_passing_summary(&self, rankings: &[RankedParticipant]) -> PassingSummary {
        let total = rankings.len();
        let passing = rankings
            .iter()
            .filter(|r| r.adjusted_gap_score >= -1e-9)
            .count();
        let percentage = if total > 0 {
            round2(passing as f64 / total as f64 * 100.0)
        } else {
            0.0
        };
        PassingSummary {
            total,
            passing,
            percentage,
        }
    }

    /// Participants per conclusion label, zero counts included.
    pub fn get_conclusion_summary(&self, rankings: &[RankedParticipant]) -> BTreeMap<String, usize> {
        let mut summary: BTreeMap<String, usize> = self
            .classifier
            .labels()
            .into_iter()
            .map(|label| (label, 0))
            .collect();
        for row in rankings {
            *summary.entry(row.conclusion.clone()).or_insert(0) += 1;
        }
        summary
    }

    // --- internals --------------------------------------------------------

    fn category_request(&self, req: &CombinedRequest, category_code: &str) -> RankingRequest {
        RankingRequest {
            event_id: req.event_id.clone(),
            position_id: req.position_id.clone(),
            template_id: req.template_id.clone(),
            category_code: category_code.to_string(),
            tolerance_percent: req.tolerance_percent,
        }
    }

    /// Read-through: the cached base carries everything tolerance does not
    /// touch, already in final sort order.
    fn base_rows(
        &self,
        req: &RankingRequest,
        ctx: &AdjustmentContext,
    ) -> Result<Vec<BaseRow>, CoreError> {
        let snapshot = TemplateSnapshot::load(self.conn, &req.template_id)?;
        let store = CustomStandardStore::new(self.conn);
        let selected = store.selected_standard(ctx, &req.template_id)?;
        let resolver = StandardResolver::new(&snapshot, selected.as_ref());

        let active_codes = resolver.active_aspect_codes(ctx, &req.category_code);
        if active_codes.is_empty() {
            return Ok(Vec::new());
        }

        let key = cache_key(
            &req.event_id,
            &req.position_id,
            &req.template_id,
            &req.category_code,
            selected.as_ref(),
            ctx.template(&req.template_id),
        );
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.rows);
        }

        tracing::info!(
            template_id = %req.template_id,
            category = %req.category_code,
            "recomputing ranking base"
        );
        let rows = self.compute_base_rows(&resolver, ctx, req, &active_codes)?;
        self.cache.put(&key, CachedRanking { rows: rows.clone() });
        Ok(rows)
    }

    fn compute_base_rows(
        &self,
        resolver: &StandardResolver<'_>,
        ctx: &AdjustmentContext,
        req: &RankingRequest,
        active_codes: &[String],
    ) -> Result<Vec<BaseRow>, CoreError> {
        let participants = self.load_participants(&req.event_id, &req.position_id)?;
        if participants.is_empty() {
            return Ok(Vec::new());
        }

        let snapshot = resolver.original_template_data();
        let aspects: Vec<&AspectDef> = active_codes
            .iter()
            .filter_map(|code| snapshot.aspect(code))
            .collect();

        let (standard_rating, standard_score) = standard_aggregate(resolver, ctx, &aspects);

        // Active sub-aspect ids per aspect, resolved once for the whole set
        // so individual and standard values share the identical filter.
        let mut active_sub_ids: HashMap<&str, Vec<String>> = HashMap::new();
        let mut all_sub_ids: Vec<String> = Vec::new();
        let mut direct_aspect_ids: Vec<String> = Vec::new();
        for aspect in &aspects {
            if aspect.has_sub_aspects() {
                let resolved = resolver.resolved_sub_aspects(ctx, &aspect.code);
                let ids: Vec<String> = aspect
                    .sub_aspects
                    .iter()
                    .filter(|s| {
                        resolved
                            .iter()
                            .any(|r| r.code == s.code && r.active)
                    })
                    .map(|s| s.id.clone())
                    .collect();
                all_sub_ids.extend(ids.iter().cloned());
                active_sub_ids.insert(aspect.code.as_str(), ids);
            } else {
                direct_aspect_ids.push(aspect.id.clone());
            }
        }

        let participant_ids: Vec<String> = participants.iter().map(|p| p.id.clone()).collect();
        let aspect_scores =
            self.load_ratings("aspect_assessments", "aspect_id", &participant_ids, &direct_aspect_ids)?;
        let sub_scores = self.load_ratings(
            "sub_aspect_assessments",
            "sub_aspect_id",
            &participant_ids,
            &all_sub_ids,
        )?;

        let mut rows: Vec<BaseRow> = Vec::with_capacity(participants.len());
        for participant in &participants {
            let mut rating_sum = 0.0;
            let mut score_sum = 0.0;
            for aspect in &aspects {
                let individual = if aspect.has_sub_aspects() {
                    // Always a fresh average over the currently active
                    // sub-aspects, never a stored aggregate.
                    let ids = active_sub_ids
                        .get(aspect.code.as_str())
                        .map(Vec::as_slice)
                        .unwrap_or(&[]);
                    let values: Vec<f64> = ids
                        .iter()
                        .filter_map(|sid| {
                            sub_scores
                                .get(&(participant.id.clone(), sid.clone()))
                                .copied()
                        })
                        .collect();
                    if values.is_empty() {
                        0.0
                    } else {
                        values.iter().sum::<f64>() / values.len() as f64
                    }
                } else {
                    aspect_scores
                        .get(&(participant.id.clone(), aspect.id.clone()))
                        .copied()
                        .unwrap_or(0.0)
                };
                let weight = resolver.aspect_weight(ctx, &aspect.code);
                rating_sum += individual;
                score_sum += individual * weight / 100.0;
            }
            let individual_rating = round2(rating_sum / aspects.len() as f64);
            let individual_score = round2(score_sum);
            rows.push(BaseRow {
                participant_id: participant.id.clone(),
                participant_name: participant.name.clone(),
                individual_rating,
                individual_score,
                original_standard_rating: round2(standard_rating),
                original_standard_score: round2(standard_score),
            });
        }

        rows.sort_by(|a, b| {
            b.individual_score
                .partial_cmp(&a.individual_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.participant_name.cmp(&b.participant_name))
        });
        Ok(rows)
    }

    fn hydrate(
        &self,
        base: &[BaseRow],
        tolerance_percent: f64,
        rank_offset: usize,
    ) -> Vec<RankedParticipant> {
        let factor = 1.0 - tolerance_percent / 100.0;
        base.iter()
            .enumerate()
            .map(|(i, row)| {
                let adjusted_standard_rating = round2(row.original_standard_rating * factor);
                let adjusted_standard_score = round2(row.original_standard_score * factor);
                let original_gap_rating =
                    round2(row.individual_rating - row.original_standard_rating);
                let original_gap_score = round2(row.individual_score - row.original_standard_score);
                let adjusted_gap_rating = round2(row.individual_rating - adjusted_standard_rating);
                let adjusted_gap_score = round2(row.individual_score - adjusted_standard_score);
                let percentage = if adjusted_standard_score > 0.0 {
                    round2(row.individual_score / adjusted_standard_score * 100.0)
                } else {
                    0.0
                };
                RankedParticipant {
                    rank: rank_offset + i + 1,
                    participant_id: row.participant_id.clone(),
                    participant_name: row.participant_name.clone(),
                    individual_rating: row.individual_rating,
                    individual_score: row.individual_score,
                    original_standard_rating: row.original_standard_rating,
                    original_standard_score: row.original_standard_score,
                    adjusted_standard_rating,
                    adjusted_standard_score,
                    original_gap_rating,
                    original_gap_score,
                    adjusted_gap_rating,
                    adjusted_gap_score,
                    percentage,
                    conclusion: self.classifier.classify(adjusted_gap_score, percentage),
                }
            })
            .collect()
    }

    fn load_participants(
        &self,
        event_id: &str,
        position_id: &str,
    ) -> Result<Vec<ParticipantRow>, CoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name FROM participants
                 WHERE event_id = ? AND position_formation_id = ?
                 ORDER BY name",
            )
            .map_err(CoreError::db)?;
        stmt.query_map([event_id, position_id], |r| {
            Ok(ParticipantRow {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(CoreError::db)
    }

    /// Batch-loads stored ratings for participant × unit pairs. Read-only:
    /// these rows are the immutable assessment inputs.
    fn load_ratings(
        &self,
        table: &str,
        unit_column: &str,
        participant_ids: &[String],
        unit_ids: &[String],
    ) -> Result<HashMap<(String, String), f64>, CoreError> {
        let mut out = HashMap::new();
        if participant_ids.is_empty() || unit_ids.is_empty() {
            return Ok(out);
        }
        let participant_placeholders = std::iter::repeat("?")
            .take(participant_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let unit_placeholders = std::iter::repeat("?")
            .take(unit_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT participant_id, {}, individual_rating
             FROM {}
             WHERE participant_id IN ({}) AND {} IN ({})",
            unit_column, table, participant_placeholders, unit_column, unit_placeholders
        );
        let mut bind_values: Vec<Value> =
            Vec::with_capacity(participant_ids.len() + unit_ids.len());
        for id in participant_ids {
            bind_values.push(Value::Text(id.clone()));
        }
        for id in unit_ids {
            bind_values.push(Value::Text(id.clone()));
        }

        let mut stmt = self.conn.prepare(&sql).map_err(CoreError::db)?;
        let rows = stmt
            .query_map(params_from_iter(bind_values), |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, f64>(2)?,
                ))
            })
            .map_err(CoreError::db)?;
        for row in rows {
            let (participant_id, unit_id, rating) = row.map_err(CoreError::db)?;
            out.insert((participant_id, unit_id), rating);
        }
        Ok(out)
    }
}

/// Unweighted mean of resolved aspect standard ratings plus the weighted
/// standard score, over one shared active-aspect slice.
fn standard_aggregate(
    resolver: &StandardResolver<'_>,
    ctx: &AdjustmentContext,
    aspects: &[&AspectDef],
) -> (f64, f64) {
    if aspects.is_empty() {
        return (0.0, 0.0);
    }
    let mut rating_sum = 0.0;
    let mut score_sum = 0.0;
    for aspect in aspects {
        let rating = resolver.aspect_rating(ctx, &aspect.code);
        let weight = resolver.aspect_weight(ctx, &aspect.code);
        rating_sum += rating;
        score_sum += rating * weight / 100.0;
    }
    (rating_sum / aspects.len() as f64, score_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::conclusion::{GapBandClassifier, ABOVE_STANDARD, BELOW_STANDARD, MEETS_STANDARD};

    #[test]
    fn round2_half_away() {
        assert_eq!(round2(3.144), 3.14);
        assert_eq!(round2(3.145), 3.15);
        assert_eq!(round2(0.0), 0.0);
    }

    fn row(id: &str, gap: f64, conclusion: &str) -> RankedParticipant {
        RankedParticipant {
            rank: 1,
            participant_id: id.to_string(),
            participant_name: id.to_string(),
            individual_rating: 3.0,
            individual_score: 3.0,
            original_standard_rating: 3.0,
            original_standard_score: 3.0,
            adjusted_standard_rating: 3.0,
            adjusted_standard_score: 3.0,
            original_gap_rating: gap,
            original_gap_score: gap,
            adjusted_gap_rating: gap,
            adjusted_gap_score: gap,
            percentage: 100.0,
            conclusion: conclusion.to_string(),
        }
    }

    #[test]
    fn summaries_fold_the_computed_list() {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        let cache = MemoryCache::new();
        let classifier = GapBandClassifier;
        let engine = RankingEngine::new(&conn, &cache, &classifier);

        let rankings = vec![
            row("p1", 0.5, ABOVE_STANDARD),
            row("p2", 0.0, MEETS_STANDARD),
            row("p3", -0.4, BELOW_STANDARD),
            row("p4", -0.1, BELOW_STANDARD),
        ];

        let passing = engine.get_passing_summary(&rankings);
        assert_eq!(passing.total, 4);
        assert_eq!(passing.passing, 2);
        assert_eq!(passing.percentage, 50.0);

        let summary = engine.get_conclusion_summary(&rankings);
        assert_eq!(summary.get(ABOVE_STANDARD), Some(&1));
        assert_eq!(summary.get(MEETS_STANDARD), Some(&1));
        assert_eq!(summary.get(BELOW_STANDARD), Some(&2));

        let empty = engine.get_conclusion_summary(&[]);
        // Zero counts stay visible for every label.
        assert_eq!(empty.get(ABOVE_STANDARD), Some(&0));
        assert_eq!(empty.get(BELOW_STANDARD), Some(&0));
        assert_eq!(engine.get_passing_summary(&[]).percentage, 0.0);
    }
}
