use crate::adjust::TemplateAdjustments;
use crate::standards::CustomStandard;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// One participant's tolerance-independent ranking inputs, in final sort
/// order. Everything tolerance touches is recomputed on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseRow {
    pub participant_id: String,
    pub participant_name: String,
    pub individual_rating: f64,
    pub individual_score: f64,
    pub original_standard_rating: f64,
    pub original_standard_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedRanking {
    pub rows: Vec<BaseRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub template_id: String,
    pub key: String,
}

/// Deterministic key over every input that can change the base result.
/// Tolerance is deliberately absent: it is applied after the cache on every
/// read, so changing it must never force a recompute. The fingerprint covers
/// the selected standard's id *and* full config content, so two institutions
/// with content-identical quantum layers still get distinct keys when their
/// private standards differ.
pub fn cache_key(
    event_id: &str,
    position_id: &str,
    template_id: &str,
    category_code: &str,
    selected: Option<&CustomStandard>,
    adj: Option<&TemplateAdjustments>,
) -> CacheKey {
    // BTreeMap-backed structs serialize in key order, so this payload is
    // canonical without extra normalization.
    let fingerprint_payload = json!({
        "standard": selected.map(|s| json!({
            "id": s.id,
            "categoryWeights": s.category_weights,
            "aspectConfigs": s.aspect_configs,
            "subAspectConfigs": s.sub_aspect_configs,
        })),
        "adjustments": adj.map(|a| json!({
            "categoryWeights": a.category_weights,
            "aspectWeights": a.aspect_weights,
            "aspectRatings": a.aspect_ratings,
            "subAspectRatings": a.sub_aspect_ratings,
            "activeAspects": a.active_aspects,
            "activeSubAspects": a.active_sub_aspects,
        })),
    });
    let mut hasher = Sha256::new();
    hasher.update(fingerprint_payload.to_string().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let standard_id = selected.map(|s| s.id.as_str()).unwrap_or("none");
    CacheKey {
        template_id: template_id.to_string(),
        key: format!(
            "rankings:{}:{}:{}:{}:{}:{}",
            template_id, event_id, position_id, category_code, standard_id, hex
        ),
    }
}

/// Shared read-through cache for base ranking results. Injectable so tests
/// substitute their own instance; correctness relies on explicit
/// invalidation from every mutator, not on expiry.
pub trait RankingCache {
    fn get(&self, key: &CacheKey) -> Option<CachedRanking>;
    fn put(&self, key: &CacheKey, value: CachedRanking);
    fn invalidate_template(&self, template_id: &str);
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, CachedRanking)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RankingCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CachedRanking> {
        let entries = self.entries.lock().ok()?;
        let hit = entries.get(&key.key).map(|(_, v)| v.clone());
        tracing::debug!(key = %key.key, hit = hit.is_some(), "ranking cache lookup");
        hit
    }

    fn put(&self, key: &CacheKey, value: CachedRanking) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.key.clone(), (key.template_id.clone(), value));
        }
    }

    fn invalidate_template(&self, template_id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            let before = entries.len();
            entries.retain(|_, (tid, _)| tid.as_str() != template_id);
            tracing::debug!(
                template_id,
                dropped = before - entries.len(),
                "ranking cache invalidated"
            );
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
