use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One template's session-layer overrides. Sparse: only entries that differ
/// from the active baseline (selected custom standard, else quantum) are
/// present. The selected-standard pointer lives here too and is cleared
/// together with the adjustment maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateAdjustments {
    pub selected_standard_id: Option<String>,
    pub category_weights: BTreeMap<String, f64>,
    pub aspect_weights: BTreeMap<String, f64>,
    pub aspect_ratings: BTreeMap<String, f64>,
    pub sub_aspect_ratings: BTreeMap<String, f64>,
    pub active_aspects: BTreeMap<String, bool>,
    pub active_sub_aspects: BTreeMap<String, bool>,
    pub adjusted_at: Option<String>,
}

impl TemplateAdjustments {
    pub fn is_empty(&self) -> bool {
        self.selected_standard_id.is_none() && !self.has_overrides()
    }

    /// True when any override entry exists, ignoring the selection pointer.
    pub fn has_overrides(&self) -> bool {
        !(self.category_weights.is_empty()
            && self.aspect_weights.is_empty()
            && self.aspect_ratings.is_empty()
            && self.sub_aspect_ratings.is_empty()
            && self.active_aspects.is_empty()
            && self.active_sub_aspects.is_empty())
    }

    pub fn clear_overrides(&mut self) {
        self.category_weights.clear();
        self.aspect_weights.clear();
        self.aspect_ratings.clear();
        self.sub_aspect_ratings.clear();
        self.active_aspects.clear();
        self.active_sub_aspects.clear();
        self.adjusted_at = None;
    }

    pub fn stamp(&mut self) {
        self.adjusted_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Per-user-session adjustment state, scoped by (session id, template id).
/// An explicit value the caller threads through every resolver call; the
/// engine keeps no hidden session global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentContext {
    pub session_id: String,
    buckets: HashMap<String, TemplateAdjustments>,
}

impl AdjustmentContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buckets: HashMap::new(),
        }
    }

    pub fn template(&self, template_id: &str) -> Option<&TemplateAdjustments> {
        self.buckets.get(template_id)
    }

    pub fn template_mut(&mut self, template_id: &str) -> &mut TemplateAdjustments {
        self.buckets.entry(template_id.to_string()).or_default()
    }

    pub fn is_adjusted(&self, template_id: &str) -> bool {
        self.buckets
            .get(template_id)
            .map(|b| b.has_overrides())
            .unwrap_or(false)
    }

    pub fn remove_template(&mut self, template_id: &str) {
        self.buckets.remove(template_id);
    }

    /// Drop the bucket entirely once nothing is left in it, so "is adjusted?"
    /// stays answerable by key presence alone.
    pub fn prune(&mut self, template_id: &str) {
        if self
            .buckets
            .get(template_id)
            .map(|b| b.is_empty())
            .unwrap_or(false)
        {
            self.buckets.remove(template_id);
        }
    }
}

/// Multi-field adjustment payload, the shape a settings form submits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentBundle {
    pub category_weights: BTreeMap<String, f64>,
    pub aspect_weights: BTreeMap<String, f64>,
    pub aspect_ratings: BTreeMap<String, f64>,
    pub sub_aspect_ratings: BTreeMap<String, f64>,
    pub active_aspects: BTreeMap<String, bool>,
    pub active_sub_aspects: BTreeMap<String, bool>,
}

impl AdjustmentBundle {
    pub fn is_empty(&self) -> bool {
        self.category_weights.is_empty()
            && self.aspect_weights.is_empty()
            && self.aspect_ratings.is_empty()
            && self.sub_aspect_ratings.is_empty()
            && self.active_aspects.is_empty()
            && self.active_sub_aspects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prune_removes_only_empty_buckets() {
        let mut ctx = AdjustmentContext::new("sess-1");
        ctx.template_mut("t1");
        ctx.template_mut("t2").aspect_ratings.insert("intel".into(), 4.0);

        ctx.prune("t1");
        ctx.prune("t2");

        assert!(ctx.template("t1").is_none());
        assert!(ctx.template("t2").is_some());
        assert!(ctx.is_adjusted("t2"));
        assert!(!ctx.is_adjusted("t1"));
    }

    #[test]
    fn selection_pointer_keeps_bucket_alive() {
        let mut ctx = AdjustmentContext::new("sess-1");
        ctx.template_mut("t1").selected_standard_id = Some("cs-1".into());
        ctx.prune("t1");
        assert!(ctx.template("t1").is_some());
        // Selection alone is not an adjustment.
        assert!(!ctx.is_adjusted("t1"));
    }
}
