mod test_support;

use quantumrank::adjust::AdjustmentContext;
use quantumrank::cache::MemoryCache;
use quantumrank::conclusion::GapBandClassifier;
use quantumrank::quantum::TemplateSnapshot;
use quantumrank::ranking::{RankingEngine, RankingRequest};
use quantumrank::resolver::StandardResolver;
use rusqlite::Connection;
use test_support::{seeded_workspace, EVENT_ID, POSITION_ID, TEMPLATE_ID};

fn request(tolerance: f64) -> RankingRequest {
    RankingRequest {
        event_id: EVENT_ID.to_string(),
        position_id: POSITION_ID.to_string(),
        template_id: TEMPLATE_ID.to_string(),
        category_code: "potensi".to_string(),
        tolerance_percent: tolerance,
    }
}

fn assessment_fingerprint(conn: &Connection) -> (i64, f64, i64, f64) {
    conn.query_row(
        "SELECT (SELECT COUNT(*) FROM aspect_assessments),
                (SELECT COALESCE(SUM(individual_rating), 0) FROM aspect_assessments),
                (SELECT COUNT(*) FROM sub_aspect_assessments),
                (SELECT COALESCE(SUM(individual_rating), 0) FROM sub_aspect_assessments)",
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
    )
    .expect("fingerprint")
}

#[test]
fn repeated_reads_hit_one_cache_entry_across_tolerances() {
    let (_ws, conn) = seeded_workspace("quantum-cache-tolerance");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let ctx = AdjustmentContext::new("sess-1");

    let first = engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 1);

    // Same request again: served from the same entry, identical output.
    let second = engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 1);
    assert_eq!(first, second);

    // A different tolerance shares the key: no second entry, no recompute,
    // but the adjusted side moves.
    let discounted = engine.get_rankings(&request(20.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 1);
    assert_eq!(
        discounted[0].original_standard_score,
        first[0].original_standard_score
    );
    assert!(discounted[0].adjusted_standard_score < first[0].adjusted_standard_score);
}

#[test]
fn resolver_mutation_invalidates_and_recompute_reflects_it() {
    let (_ws, conn) = seeded_workspace("quantum-cache-invalidate");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let snapshot = TemplateSnapshot::load(&conn, TEMPLATE_ID).expect("snapshot");
    let resolver = StandardResolver::new(&snapshot, None).with_cache(&cache);
    let mut ctx = AdjustmentContext::new("sess-1");

    let before = engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 1);

    resolver.set_sub_aspect_active(&mut ctx, "intel-c", false);
    assert!(cache.is_empty());

    let after = engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_ne!(
        before[0].original_standard_score,
        after[0].original_standard_score
    );
}

#[test]
fn a_session_adjustment_changes_the_cache_key_not_the_entry() {
    let (_ws, conn) = seeded_workspace("quantum-cache-keying");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let snapshot = TemplateSnapshot::load(&conn, TEMPLATE_ID).expect("snapshot");
    // No cache attached to the resolver here: only the key content protects
    // correctness, which is exactly what this exercises.
    let resolver = StandardResolver::new(&snapshot, None);
    let mut ctx = AdjustmentContext::new("sess-1");

    engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 1);

    resolver.save_aspect_weight(&mut ctx, "sikap", 60.0);
    let adjusted = engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    assert_eq!(cache.len(), 2);
    // intel 3.0×0.4 + sikap 3.0×0.6 + motiv 4.0×0.3.
    assert_eq!(adjusted[0].original_standard_score, 4.2);
}

#[test]
fn no_call_path_writes_to_assessment_rows() {
    let (_ws, conn) = seeded_workspace("quantum-immutability");
    let cache = MemoryCache::new();
    let classifier = GapBandClassifier;
    let engine = RankingEngine::new(&conn, &cache, &classifier);
    let snapshot = TemplateSnapshot::load(&conn, TEMPLATE_ID).expect("snapshot");
    let resolver = StandardResolver::new(&snapshot, None).with_cache(&cache);
    let mut ctx = AdjustmentContext::new("sess-1");

    let before = assessment_fingerprint(&conn);

    resolver.set_sub_aspect_active(&mut ctx, "intel-b", false);
    resolver.save_aspect_rating(&mut ctx, "sikap", 5.0);
    resolver.save_aspect_weight(&mut ctx, "motiv", 10.0);
    resolver.save_aspect_weight(&mut ctx, "intel", 60.0);
    engine.get_rankings(&request(0.0), &ctx).expect("rankings");
    engine.get_rankings(&request(15.0), &ctx).expect("rankings");
    resolver.reset_category_adjustments(&mut ctx, "potensi");
    engine.get_rankings(&request(0.0), &ctx).expect("rankings");

    assert_eq!(assessment_fingerprint(&conn), before);
}
