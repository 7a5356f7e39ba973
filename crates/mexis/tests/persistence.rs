//! Build, persist, reopen, and query every secondary-memory index.
//!
//! A reopened index must answer queries with results and counters identical
//! to the freshly built one.

use std::sync::Arc;

use mexis::dataset::ObjectDb;
use mexis::metric::Lp;
use mexis::sm::{Cpt, DIndex, Egnat, ListOfClusters, MIndex, MTree, MbPlusTree, OmniRTree, PmTree, SpbTree};
use mexis::MetricIndex;

/// A 20-point 2-D dataset with three separated clumps.
fn clumped_db() -> Arc<ObjectDb> {
    let mut rows = Vec::new();
    for i in 0..7 {
        rows.push(vec![f64::from(i) * 0.3, 0.0]);
    }
    for i in 0..7 {
        rows.push(vec![20.0 + f64::from(i) * 0.3, 1.0]);
    }
    for i in 0..6 {
        rows.push(vec![10.0, 40.0 + f64::from(i) * 0.3]);
    }
    Arc::new(ObjectDb::Vectors {
        rows,
        dim: 2,
        lp: Lp::L2,
    })
}

/// Runs the fresh/reopened comparison for one index pair.
fn assert_round_trip(
    built: &mut dyn MetricIndex,
    reopened: &mut dyn MetricIndex,
) -> Result<(), String> {
    let name = built.name();
    assert_eq!(name, reopened.name(), "names must survive reopening");

    for q in [0, 5, 9, 14, 19] {
        for r in [0.0, 0.5, 3.0, 25.0] {
            built.clear_counters();
            reopened.clear_counters();
            let a = built.range_search(q, r)?;
            let b = reopened.range_search(q, r)?;
            assert_eq!(a, b, "{name}: MRQ(q={q}, r={r})");
            assert_eq!(built.counters(), reopened.counters(), "{name}: MRQ counters");
        }

        for k in [1, 4, 20] {
            built.clear_counters();
            reopened.clear_counters();
            let a = built.knn_search(q, k)?;
            let b = reopened.knn_search(q, k)?;
            assert_eq!(a, b, "{name}: MkNN(q={q}, k={k})");
            assert_eq!(built.counters(), reopened.counters(), "{name}: MkNN counters");
        }
    }
    Ok(())
}

#[test]
fn lc_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("lc");
    let db = clumped_db();

    let mut built = ListOfClusters::build(db.clone(), &base, 32)?;
    let mut reopened = ListOfClusters::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn mtree_round_trip_and_root_offset() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let path = tmp.path().join("t.mtree_index");
    let db = clumped_db();

    let mut built = MTree::build(db.clone(), &path, 4)?;
    let mut reopened = MTree::open(db, &path)?;
    assert_eq!(built.root_offset(), reopened.root_offset());
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn pmtree_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let path = tmp.path().join("t.pmtree_index");
    let db = clumped_db();

    let mut built = PmTree::build(db.clone(), &path, 4, 3, &[])?;
    let mut reopened = PmTree::open(db, &path)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn egnat_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("egnat");
    let db = clumped_db();

    let mut built = Egnat::build(db.clone(), &base, 3, 96, 42)?;
    let mut reopened = Egnat::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn dindex_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("dindex");
    let db = clumped_db();

    let mut built = DIndex::build(db.clone(), &base, 3, 0.5, 42)?;
    let mut reopened = DIndex::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn omni_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("omni");
    let db = clumped_db();

    let mut built = OmniRTree::build(db.clone(), &base, 3, &[], 4, 42)?;
    let mut reopened = OmniRTree::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn spb_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("spb");
    let db = clumped_db();

    let mut built = SpbTree::build(db.clone(), &base, 3, &[], 42)?;
    let mut reopened = SpbTree::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn mindex_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("midx");
    let db = clumped_db();

    let mut built = MIndex::build(db.clone(), &base, 3, 42)?;
    let mut reopened = MIndex::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn mbpt_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("mbpt");
    let db = clumped_db();

    let mut built = MbPlusTree::build(db.clone(), &base, 0.5, 4, 42)?;
    let mut reopened = MbPlusTree::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn cpt_round_trip() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let base = tmp.path().join("cpt");
    let db = clumped_db();

    let mut built = Cpt::build(db.clone(), &base, 3, &[], 4)?;
    let mut reopened = Cpt::open(db, &base)?;
    assert_round_trip(&mut built, &mut reopened)
}

#[test]
fn hfi_pivots_are_honored() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-persist").map_err(|e| e.to_string())?;
    let db = clumped_db();

    // Supplying an explicit pivot set must produce an index that differs
    // from the default choice only in its pivots, and the pivots must
    // survive a reopen.
    let base = tmp.path().join("spb-hfi");
    let built = SpbTree::build(db.clone(), &base, 0, &[2, 9, 17], 42)?;
    drop(built);
    let mut reopened = SpbTree::open(db.clone(), &base)?;

    let mut linear_hits = Vec::new();
    for o in 0..db.size() {
        if db.distance(5, o) <= 3.0 {
            linear_hits.push(o);
        }
    }
    let mut hits = reopened.range_search(5, 3.0)?;
    hits.sort_unstable();
    assert_eq!(hits, linear_hits);
    Ok(())
}
