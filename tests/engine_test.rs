//! End-to-end: build indexes over real files, query through the engine, and
//! hold every plan to the full-scan reference.

use csvquery::block::IndexReader;
use csvquery::executor::{Ctx, Engine, OrderBy, QueryRequest};
use csvquery::indexer::{IndexOptions, Indexer};
use csvquery::meta;
use csvquery::predicate::Predicate;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

fn write_csv(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

fn build_indexes(csv: &Path, columns: &[&[&str]]) {
    let opts = IndexOptions {
        columns: columns
            .iter()
            .map(|set| set.iter().map(|s| s.to_string()).collect())
            .collect(),
        workers: 2,
        force: true,
        ..IndexOptions::default()
    };
    Indexer::new(opts).build(csv).unwrap();
}

fn pred(json: &str) -> Predicate {
    Predicate::from_json(&serde_json::from_str(json).unwrap()).unwrap()
}

fn query(engine: &Engine, where_json: &str) -> csvquery::executor::QueryResult {
    let req = QueryRequest { predicate: Some(pred(where_json)), ..Default::default() };
    engine.query(&req).unwrap()
}

/// The planner-correctness property: indexed execution returns exactly the
/// offsets the row-by-row reference returns.
fn assert_equivalent(engine: &Engine, where_json: &str) {
    let p = pred(where_json);
    let req = QueryRequest { predicate: Some(p.clone()), ..Default::default() };
    let mut got = engine.query(&req).unwrap().rows;
    got.sort_unstable();
    let mut want = engine.full_scan(Some(&p), &Ctx::new(None)).unwrap();
    want.sort_unstable();
    assert_eq!(got, want, "plans disagree for {where_json}");
}

// ── Literal scenarios ────────────────────────────────────────────────────────

#[test]
fn equality_hit_with_bloom() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(&dir, "s1.csv", "ID,STATUS\n1,active\n2,inactive\n3,active\n");
    build_indexes(&csv, &[&["STATUS"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let result = query(&engine, r#"{"op":"=","column":"STATUS","value":"active"}"#);
    assert_eq!(result.rows, vec![(10, 9), (30, 9)]);
    assert!(result.warnings.is_empty());

    let count = engine
        .count(&QueryRequest {
            predicate: Some(pred(r#"{"op":"=","column":"STATUS","value":"active"}"#)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(count.count, 2);
}

#[test]
fn equality_bloom_miss_reads_no_blocks() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(&dir, "s2.csv", "ID,STATUS\n1,active\n2,inactive\n3,active\n");
    build_indexes(&csv, &[&["STATUS"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let result = query(&engine, r#"{"op":"=","column":"STATUS","value":"pending"}"#);
    assert!(result.rows.is_empty());
    assert_eq!(result.blocks_read, 0, "a definitive negative must not decompress");
}

#[test]
fn range_query_over_uniform_scores() {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,SCORE\n");
    // 37 is coprime to 51, so scores cycle uniformly through 50..=100.
    for i in 0..10_000u64 {
        content.push_str(&format!("{i},{}\n", 50 + (i * 37) % 51));
    }
    let csv = write_csv(&dir, "s3.csv", &content);
    build_indexes(&csv, &[&["SCORE"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let result = query(&engine, r#"{"op":">=","column":"SCORE","value":"90"}"#);
    let expected = 10_000.0 * 11.0 / 51.0;
    let got = result.rows.len() as f64;
    assert!(
        (got - expected).abs() <= expected * 0.01,
        "{got} matches vs expected ≈{expected}"
    );
    for &(offset, _) in &result.rows {
        let (record, _) = engine.source().record_at(offset).unwrap();
        let score: f64 = std::str::from_utf8(csvquery::source::field_at(record, b',', 1).unwrap())
            .unwrap()
            .parse()
            .unwrap();
        assert!(score >= 90.0);
    }
    assert_equivalent(&engine, r#"{"op":">=","column":"SCORE","value":"90"}"#);
}

#[test]
fn and_with_mixed_indexed_and_unindexed() {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,STATUS,SCORE\n");
    for i in 0..1000u64 {
        let status = if i % 3 == 0 { "active" } else { "idle" };
        content.push_str(&format!("{i},{status},{}\n", (i * 7) % 100));
    }
    let csv = write_csv(&dir, "s4.csv", &content);
    build_indexes(&csv, &[&["STATUS"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let where_json = r#"{"op":"and","children":[
        {"op":"=","column":"STATUS","value":"active"},
        {"op":">","column":"SCORE","value":"70"}
    ]}"#;
    assert_equivalent(&engine, where_json);
    let result = query(&engine, where_json);
    assert!(!result.rows.is_empty());
}

#[test]
fn composite_prefix_match() {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,DEPT,LEVEL\n");
    for i in 0..300u64 {
        let dept = ["ENG", "OPS", "FIN"][(i % 3) as usize];
        content.push_str(&format!("{i},{dept},{}\n", i % 5));
    }
    let csv = write_csv(&dir, "s5.csv", &content);
    build_indexes(&csv, &[&["DEPT", "LEVEL"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let both = r#"{"op":"and","children":[
        {"op":"=","column":"DEPT","value":"ENG"},
        {"op":"=","column":"LEVEL","value":"3"}
    ]}"#;
    let result = query(&engine, both);
    assert!(result.blocks_read > 0, "the composite index must serve this");
    assert!(result.warnings.is_empty());
    assert_equivalent(&engine, both);

    // LEVEL alone cannot use the composite: full scan with an advisory.
    let level_only = r#"{"op":"=","column":"LEVEL","value":"3"}"#;
    let fallback = query(&engine, level_only);
    assert!(fallback.warnings.iter().any(|w| w.starts_with("NoUsableIndex")));
    assert_equivalent(&engine, level_only);

    // Under strict mode the advisory becomes an error.
    let strict = QueryRequest {
        predicate: Some(pred(level_only)),
        strict: true,
        ..Default::default()
    };
    assert!(matches!(
        engine.query(&strict),
        Err(csvquery::Error::NoUsableIndex(_))
    ));
}

#[test]
fn staleness_warns_on_query_and_force_rebuilds() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(&dir, "s6.csv", "ID,STATUS\n1,active\n2,inactive\n3,active\n");
    build_indexes(&csv, &[&["STATUS"]]);

    // Truncate the source by one byte.
    let len = std::fs::metadata(&csv).unwrap().len();
    let f = std::fs::OpenOptions::new().write(true).open(&csv).unwrap();
    f.set_len(len - 1).unwrap();
    drop(f);

    let engine = Engine::open(&csv, b',').unwrap();
    let result = query(&engine, r#"{"op":"=","column":"STATUS","value":"active"}"#);
    assert!(
        result.warnings.iter().any(|w| w.starts_with("SourceStale")),
        "{:?}",
        result.warnings
    );

    // A plain rebuild refuses; --force succeeds and clears the staleness.
    let plain = IndexOptions {
        columns: vec![vec!["STATUS".into()]],
        workers: 1,
        ..IndexOptions::default()
    };
    assert!(matches!(
        Indexer::new(plain).build(&csv),
        Err(csvquery::Error::SourceStale(_))
    ));
    build_indexes(&csv, &[&["STATUS"]]);
    let engine = Engine::open(&csv, b',').unwrap();
    let fresh = query(&engine, r#"{"op":"=","column":"STATUS","value":"active"}"#);
    assert!(fresh.warnings.is_empty());
}

// ── Broader engine behavior ──────────────────────────────────────────────────

fn equivalence_fixture() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,STATUS,SCORE,NAME,NOTE\n");
    let statuses = ["active", "idle", "failed", "done"];
    let mut x = 7u64;
    for i in 0..2000u64 {
        // Small deterministic LCG keeps the fixture reproducible.
        x = x.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let status = statuses[(x >> 33) as usize % 4];
        let score = (x >> 17) % 101;
        let name = format!("user_{:03}", (x >> 41) % 500);
        let note = if x % 5 == 0 { "" } else { "n" };
        content.push_str(&format!("{i},{status},{score},{name},{note}\n"));
    }
    let csv = write_csv(&dir, "equiv.csv", &content);
    build_indexes(&csv, &[&["STATUS"], &["SCORE"], &["NAME"], &["STATUS", "SCORE"]]);
    (dir, csv)
}

#[test]
fn every_plan_matches_the_reference() {
    let (_dir, csv) = equivalence_fixture();
    let engine = Engine::open(&csv, b',').unwrap();

    let cases = [
        r#"{"op":"=","column":"STATUS","value":"active"}"#,
        r#"{"op":"=","column":"STATUS","value":"missing"}"#,
        r#"{"op":"!=","column":"STATUS","value":"active"}"#,
        r#"{"op":">","column":"SCORE","value":"80"}"#,
        r#"{"op":"<","column":"SCORE","value":"15"}"#,
        r#"{"op":">=","column":"SCORE","value":"100"}"#,
        r#"{"op":"<=","column":"SCORE","value":"0"}"#,
        r#"{"op":"=","column":"SCORE","value":"42"}"#,
        r#"{"op":"in","column":"STATUS","values":["active","failed"]}"#,
        r#"{"op":"like","column":"NAME","pattern":"user_0%"}"#,
        r#"{"op":"like","column":"NAME","pattern":"user_00_"}"#,
        r#"{"op":"like","column":"NAME","pattern":"%_499"}"#,
        r#"{"op":"isnull","column":"NOTE"}"#,
        r#"{"op":"and","children":[
            {"op":"=","column":"STATUS","value":"idle"},
            {"op":">=","column":"SCORE","value":"50"}
        ]}"#,
        r#"{"op":"and","children":[
            {"op":"=","column":"STATUS","value":"done"},
            {"op":"=","column":"SCORE","value":"7"}
        ]}"#,
        r#"{"op":"and","children":[
            {"op":"=","column":"STATUS","value":"active"},
            {"op":"isnull","column":"NOTE"}
        ]}"#,
        r#"{"op":"or","children":[
            {"op":"=","column":"STATUS","value":"failed"},
            {"op":">","column":"SCORE","value":"95"}
        ]}"#,
        r#"{"op":"or","children":[
            {"op":"=","column":"STATUS","value":"failed"},
            {"op":"isnull","column":"NOTE"}
        ]}"#,
        r#"{"op":"and","children":[
            {"op":"in","column":"STATUS","values":["active","idle"]},
            {"op":"like","column":"NAME","pattern":"user_1%"},
            {"op":"<","column":"SCORE","value":"90"}
        ]}"#,
    ];
    for case in cases {
        assert_equivalent(&engine, case);
    }
}

#[test]
fn order_limit_offset() {
    let (_dir, csv) = equivalence_fixture();
    let engine = Engine::open(&csv, b',').unwrap();

    let base = QueryRequest {
        predicate: Some(pred(r#"{"op":"=","column":"STATUS","value":"active"}"#)),
        order_by: Some(OrderBy { column: "SCORE".into(), desc: true }),
        ..Default::default()
    };
    let all = engine.query(&base).unwrap().rows;
    assert!(!all.is_empty());

    // Scores must descend along the result.
    let score_at = |offset: u64| -> f64 {
        let (record, _) = engine.source().record_at(offset).unwrap();
        std::str::from_utf8(csvquery::source::field_at(record, b',', 2).unwrap())
            .unwrap()
            .parse()
            .unwrap()
    };
    for pair in all.windows(2) {
        assert!(score_at(pair[0].0) >= score_at(pair[1].0));
    }

    let paged = QueryRequest { limit: Some(10), offset: 5, ..base.clone() };
    let page = engine.query(&paged).unwrap().rows;
    assert_eq!(page.as_slice(), &all[5..15]);
}

#[test]
fn footer_only_count_for_distinct_keys() {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,V\n");
    for i in 0..3000u64 {
        content.push_str(&format!("{i:05},{}\n", i % 2));
    }
    let csv = write_csv(&dir, "distinct.csv", &content);
    build_indexes(&csv, &[&["ID"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    // Pick a key that opens a block: provably present without decompression.
    let reader = IndexReader::open(&meta::index_path(&csv, &["ID".into()])).unwrap();
    assert!(reader.blocks().len() > 1);
    let probe = reader.blocks()[1].start_key.clone();

    let result = engine
        .count(&QueryRequest {
            predicate: Some(pred(&format!(
                r#"{{"op":"=","column":"ID","value":"{probe}"}}"#
            ))),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.blocks_read, 0, "footer-only count must not decompress");

    // Bloom-negative count is also free.
    let missing = engine
        .count(&QueryRequest {
            predicate: Some(pred(r#"{"op":"=","column":"ID","value":"zzzzz"}"#)),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(missing.count, 0);
    assert_eq!(missing.blocks_read, 0);
}

#[test]
fn bare_count_uses_meta_totals() {
    let dir = TempDir::new().unwrap();
    let csv = write_csv(&dir, "bare.csv", "A,B\n1,x\n2,y\n3,z\n");
    build_indexes(&csv, &[&["A"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let result = engine.count(&QueryRequest::default()).unwrap();
    assert_eq!(result.count, 3);
    assert_eq!(result.blocks_read, 0);
}

#[test]
fn raised_cancel_flag_aborts_the_query() {
    let (_dir, csv) = equivalence_fixture();
    let engine = Engine::open(&csv, b',').unwrap();

    let req = QueryRequest {
        predicate: Some(pred(r#"{"op":"=","column":"STATUS","value":"active"}"#)),
        cancel: Some(Arc::new(AtomicBool::new(true))),
        ..Default::default()
    };
    assert!(matches!(engine.query(&req), Err(csvquery::Error::Canceled)));
    assert!(matches!(engine.count(&req), Err(csvquery::Error::Canceled)));
}

#[test]
fn duplicate_run_straddling_blocks_stays_complete() {
    let dir = TempDir::new().unwrap();
    let mut content = String::from("ID,TAG\n");
    for i in 0..5000u64 {
        // One giant duplicate run surrounded by unique keys.
        let tag = if (1000..4000).contains(&i) { "hot".to_string() } else { format!("t{i:04}") };
        content.push_str(&format!("{i},{tag}\n"));
    }
    let csv = write_csv(&dir, "dups.csv", &content);
    build_indexes(&csv, &[&["TAG"]]);
    let engine = Engine::open(&csv, b',').unwrap();

    let result = query(&engine, r#"{"op":"=","column":"TAG","value":"hot"}"#);
    assert_eq!(result.rows.len(), 3000);
    assert_equivalent(&engine, r#"{"op":"=","column":"TAG","value":"hot"}"#);
}
