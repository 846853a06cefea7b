mod test_support;

use quantumrank::adjust::AdjustmentContext;
use quantumrank::cache::MemoryCache;
use quantumrank::conclusion::GapBandClassifier;
use quantumrank::quantum::TemplateSnapshot;
use quantumrank::ranking::{round2, CombinedRequest, RankingEngine};
use quantumrank::resolver::StandardResolver;
use test_support::{seeded_workspace, EVENT_ID, POSITION_ID, TEMPLATE_ID};

fn request(tolerance: f64) -> CombinedRequest {
    CombinedRequest {
        event_id: EVENT_ID.to_string(),
        position_id: POSITION_ID.to_string(),
        template_id: TEMPLATE_ID.to_string(),
        tolerance_percent: tolerance,
    }
}

#[test]
fn combined_rankings_weight_both_categories() {
    let (_ws, conn) = seeded_workspace("quantum-combined-basic");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let ctx = AdjustmentContext::new("sess-1");

    let rows = engine.get_combined_rankings(&request(0.0), &ctx).expect("combined");
    assert_eq!(rows.len(), 3);

    // Quantum split 40/60. Citra: 3.0×0.4 + 3.4×0.6 = 3.24 beats Budi's 3.0.
    assert_eq!(rows[0].participant_name, "Andi");
    assert_eq!(rows[1].participant_name, "Citra");
    assert_eq!(rows[2].participant_name, "Budi");

    let andi = &rows[0];
    assert_eq!(andi.potensi_weight, 40.0);
    assert_eq!(andi.kompetensi_weight, 60.0);
    assert_eq!(andi.potensi_score, 4.0);
    assert_eq!(andi.kompetensi_score, 4.0);
    assert_eq!(andi.total_individual_score, 4.0);
    // potensi std 3.3, kompetensi std 3.55: 3.3×0.4 + 3.55×0.6 = 3.45.
    assert_eq!(andi.total_original_standard_score, 3.45);
    assert_eq!(andi.total_standard_score, 3.45);
    assert_eq!(andi.total_gap_score, 0.55);
    assert_eq!(andi.total_original_gap_score, 0.55);
    assert_eq!(andi.conclusion, "Above Standard");

    let citra = &rows[1];
    assert_eq!(citra.total_individual_score, 3.24);
    assert_eq!(citra.rank, 2);
}

#[test]
fn a_zero_weight_category_produces_a_clean_split() {
    let (_ws, conn) = seeded_workspace("quantum-combined-zero-weight");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let snapshot = TemplateSnapshot::load(&conn, TEMPLATE_ID).expect("snapshot");
    let resolver = StandardResolver::new(&snapshot, None).with_cache(&cache);
    let mut ctx = AdjustmentContext::new("sess-1");

    resolver
        .save_both_category_weights(&mut ctx, "potensi", 0.0, "kompetensi", 100.0)
        .expect("weights");

    let rows = engine.get_combined_rankings(&request(0.0), &ctx).expect("combined");
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.potensi_weight, 0.0);
        assert_eq!(row.kompetensi_weight, 100.0);
        // Total collapses to the kompetensi-only score.
        assert_eq!(row.total_individual_score, row.kompetensi_score);
    }
    assert_eq!(rows[0].participant_name, "Andi");
    assert_eq!(rows[0].total_individual_score, 4.0);
    assert_eq!(rows[1].participant_name, "Citra");
    assert_eq!(rows[1].total_individual_score, 3.4);
}

#[test]
fn combined_requires_both_categories_nonempty() {
    let (_ws, conn) = seeded_workspace("quantum-combined-empty");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let snapshot = TemplateSnapshot::load(&conn, TEMPLATE_ID).expect("snapshot");
    let resolver = StandardResolver::new(&snapshot, None).with_cache(&cache);
    let mut ctx = AdjustmentContext::new("sess-1");

    for code in ["integ", "kerja", "komun"] {
        resolver.set_aspect_active(&mut ctx, code, false);
    }

    let rows = engine.get_combined_rankings(&request(0.0), &ctx).expect("combined");
    assert!(rows.is_empty());
}

#[test]
fn combined_tolerance_applies_to_the_standard_side_only() {
    let (_ws, conn) = seeded_workspace("quantum-combined-tolerance");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let ctx = AdjustmentContext::new("sess-1");

    let plain = engine.get_combined_rankings(&request(0.0), &ctx).expect("combined");
    let discounted = engine.get_combined_rankings(&request(10.0), &ctx).expect("combined");

    for (a, b) in plain.iter().zip(discounted.iter()) {
        assert_eq!(a.total_individual_score, b.total_individual_score);
        assert_eq!(a.total_original_standard_score, b.total_original_standard_score);
        // Per-category adjusted scores round before combining, so allow one
        // cent of drift against the directly-discounted total.
        let direct = round2(b.total_original_standard_score * 0.9);
        assert!((b.total_standard_score - direct).abs() <= 0.01);
    }
}

#[test]
fn participant_combined_rank_lookup() {
    let (_ws, conn) = seeded_workspace("quantum-combined-lookup");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let ctx = AdjustmentContext::new("sess-1");

    let found = engine
        .get_participant_combined_rank(&request(0.0), &ctx, "p-citra")
        .expect("lookup")
        .expect("citra present");
    assert_eq!(found.rank, 2);
    assert_eq!(found.total, 3);
    assert_eq!(found.row.participant_name, "Citra");

    let missing = engine
        .get_participant_combined_rank(&request(0.0), &ctx, "p-ghost")
        .expect("lookup");
    assert!(missing.is_none());
}
