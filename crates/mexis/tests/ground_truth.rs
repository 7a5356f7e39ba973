//! Every index against the brute-force linear scan.
//!
//! Each index is built over small vector and string datasets and checked for
//! soundness, completeness, k-NN ordering, idempotence, and the boundary
//! behaviors shared by the whole catalog.

use std::sync::Arc;

use mexis::dataset::ObjectDb;
use mexis::metric::Lp;
use mexis::mm::{Bkt, Bst, DsaclTree, Ept, FqTree, Gnat, Laesa, LinearScan, Mvpt, Sat};
use mexis::sm::{Cpt, DIndex, Egnat, ListOfClusters, MIndex, MTree, MbPlusTree, OmniRTree, PmTree, SpbTree};
use mexis::MetricIndex;

/// Six 2-D points: a tight cluster at the origin and another at (10, 10).
fn vector_db() -> Arc<ObjectDb> {
    Arc::new(ObjectDb::Vectors {
        rows: vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![10.0, 10.0],
            vec![10.0, 11.0],
            vec![11.0, 10.0],
        ],
        dim: 2,
        lp: Lp::L2,
    })
}

/// Four strings under the edit distance.
fn string_db() -> Arc<ObjectDb> {
    Arc::new(ObjectDb::Strings {
        rows: vec![
            "abc".to_string(),
            "abd".to_string(),
            "xyz".to_string(),
            "abcd".to_string(),
        ],
    })
}

/// A 30-point 1-D dataset with duplicates and an uneven spread.
fn line_db() -> Arc<ObjectDb> {
    let rows = (0..30)
        .map(|i| vec![f64::from(i % 17) * 1.5 + f64::from(i / 17)])
        .collect();
    Arc::new(ObjectDb::Vectors {
        rows,
        dim: 1,
        lp: Lp::L1,
    })
}

/// Builds the whole catalog over `db`, each index persisting under `dir`.
fn catalog(db: &Arc<ObjectDb>, dir: &std::path::Path) -> Result<Vec<Box<dyn MetricIndex>>, String> {
    Ok(vec![
        Box::new(Bkt::build(db.clone(), 4, 1.0)?),
        Box::new(Bst::build(db.clone(), 4, 10, 42)?),
        Box::new(Mvpt::build(db.clone(), 4, 2, 0, &[], 42)?),
        Box::new(Mvpt::build(db.clone(), 2, 3, 0, &[], 42)?),
        Box::new(Gnat::build(db.clone(), 2, 4, 42)?),
        Box::new(Sat::build(db.clone())?),
        Box::new(DsaclTree::build(db.clone(), 4, 2)?),
        Box::new(FqTree::build(db.clone(), 4, 2)?),
        Box::new(Ept::build(db.clone(), 2, 42)?),
        Box::new(Laesa::build(db.clone(), 2, &[])?),
        Box::new(ListOfClusters::build(db.clone(), dir.join("lc"), 32)?),
        Box::new(MTree::build(db.clone(), dir.join("t.mtree_index"), 4)?),
        Box::new(PmTree::build(db.clone(), dir.join("t.pmtree_index"), 4, 2, &[])?),
        Box::new(Egnat::build(db.clone(), dir.join("egnat"), 2, 64, 42)?),
        Box::new(DIndex::build(db.clone(), dir.join("dindex"), 2, 0.5, 42)?),
        Box::new(OmniRTree::build(db.clone(), dir.join("omni"), 2, &[], 4, 42)?),
        Box::new(SpbTree::build(db.clone(), dir.join("spb"), 2, &[], 42)?),
        Box::new(MIndex::build(db.clone(), dir.join("midx"), 2, 42)?),
        Box::new(MbPlusTree::build(db.clone(), dir.join("mbpt"), 0.5, 4, 42)?),
        Box::new(Cpt::build(db.clone(), dir.join("cpt"), 2, &[], 4)?),
    ])
}

/// Checks one index against the linear scan on every query, radius, and k.
fn check_against_linear(
    index: &mut Box<dyn MetricIndex>,
    linear: &mut LinearScan,
    n: usize,
    radii: &[f64],
    ks: &[usize],
) -> Result<(), String> {
    let name = index.name();

    for q in 0..n {
        for &r in radii {
            let mut expected = linear.range_search(q, r)?;
            expected.sort_unstable();
            let mut got = index.range_search(q, r)?;
            got.sort_unstable();
            assert_eq!(got, expected, "{name}: MRQ(q={q}, r={r})");
        }

        for &k in ks {
            let expected = linear.knn_search(q, k)?;
            let got = index.knn_search(q, k)?;
            assert_eq!(got.len(), expected.len(), "{name}: MkNN(q={q}, k={k}) size");
            for (g, e) in got.iter().zip(expected.iter()) {
                assert_eq!(g.0, e.0, "{name}: MkNN(q={q}, k={k}) ids");
                assert!((g.1 - e.1).abs() < 1e-9, "{name}: MkNN(q={q}, k={k}) dists");
            }
        }
    }
    Ok(())
}

#[test]
fn vectors_match_linear_scan() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = vector_db();
    let mut linear = LinearScan::new(db.clone());

    for mut index in catalog(&db, tmp.path())? {
        check_against_linear(&mut index, &mut linear, db.size(), &[0.0, 0.5, 1.0, 2.0, 15.0], &[1, 2, 3, 6])?;
    }
    Ok(())
}

#[test]
fn strings_match_linear_scan() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = string_db();
    let mut linear = LinearScan::new(db.clone());

    for mut index in catalog(&db, tmp.path())? {
        check_against_linear(&mut index, &mut linear, db.size(), &[0.0, 1.0, 2.0, 4.0], &[1, 2, 4])?;
    }
    Ok(())
}

#[test]
fn line_with_duplicates_matches_linear_scan() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = line_db();
    let mut linear = LinearScan::new(db.clone());

    for mut index in catalog(&db, tmp.path())? {
        check_against_linear(&mut index, &mut linear, db.size(), &[0.0, 1.5, 4.5], &[1, 5, 10])?;
    }
    Ok(())
}

#[test]
fn expected_neighborhoods_on_vectors() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = vector_db();

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();

        let mut hits = index.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2], "{name}");

        assert_eq!(index.range_search(0, 0.5)?, vec![0], "{name}");

        let knn = index.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0), "{name}");
        assert_eq!((knn[1].0, knn[2].0), (1, 2), "{name}: tie-break by id");
    }
    Ok(())
}

#[test]
fn expected_neighborhoods_on_strings() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = string_db();

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();

        let mut hits = index.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 3], "{name}");

        let knn = index.knn_search(0, 2)?;
        assert_eq!(knn, vec![(0, 0.0), (1, 1.0)], "{name}");
    }
    Ok(())
}

#[test]
fn boundary_behavior() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = vector_db();

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();

        // Radius zero returns exactly the query itself.
        assert_eq!(index.range_search(3, 0.0)?, vec![3], "{name}");

        // k = 0 is empty; k >= N returns everything, sorted.
        assert!(index.knn_search(0, 0)?.is_empty(), "{name}");
        let all = index.knn_search(0, 100)?;
        assert_eq!(all.len(), 6, "{name}");
        for w in all.windows(2) {
            assert!(w[0].1 <= w[1].1, "{name}: ascending distances");
        }
    }
    Ok(())
}

#[test]
fn singleton_database() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = Arc::new(ObjectDb::Vectors {
        rows: vec![vec![2.5, -1.0]],
        dim: 2,
        lp: Lp::L2,
    });

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();
        assert_eq!(index.range_search(0, 0.0)?, vec![0], "{name}");
        assert_eq!(index.knn_search(0, 1)?, vec![(0, 0.0)], "{name}");
    }
    Ok(())
}

#[test]
fn queries_are_idempotent() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = vector_db();

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();

        index.clear_counters();
        let first_hits = index.range_search(2, 2.0)?;
        let first = index.counters();

        index.clear_counters();
        let second_hits = index.range_search(2, 2.0)?;
        let second = index.counters();

        assert_eq!(first_hits, second_hits, "{name}");
        assert_eq!(first, second, "{name}: no hidden caching");
    }
    Ok(())
}

#[test]
fn pruning_beats_linear_scan_on_average() -> Result<(), String> {
    let tmp = tempdir::TempDir::new("mexis-gt").map_err(|e| e.to_string())?;
    let db = line_db();
    let n = db.size();

    for mut index in catalog(&db, tmp.path())? {
        let name = index.name();

        index.clear_counters();
        for q in 0..n {
            index.range_search(q, 1.0)?;
        }
        let total = index.counters().comp_dist;
        assert!(
            total < (n * n) as u64,
            "{name}: {total} distance evaluations over {n} queries"
        );
    }

    // The baseline, by contrast, always pays the full scan.
    let mut linear = LinearScan::new(db);
    linear.clear_counters();
    for q in 0..n {
        linear.range_search(q, 1.0)?;
    }
    assert_eq!(linear.counters().comp_dist, (n * n) as u64);
    Ok(())
}
