//! The benchmark driver: index configurations, query sweeps, and the JSON
//! records they produce.

use std::path::{Path, PathBuf};
use std::time::Instant;

use mexis::mm::{Bkt, Bst, DsaclTree, Ept, FqTree, Gnat, Laesa, LinearScan, Mvpt, Sat};
use mexis::sm::{Cpt, DIndex, Egnat, ListOfClusters, MIndex, MTree, MbPlusTree, OmniRTree, PmTree, SpbTree};
use mexis::MetricIndex;
use mt_logger::{mt_log, Level};
use serde::{Deserialize, Serialize};

use crate::datasets::Dataset;

/// The selectivities swept by every range-query workload.
pub const SELECTIVITIES: &[f64] = &[0.02, 0.04, 0.08, 0.16, 0.32];

/// The neighbor counts swept by every k-NN workload.
pub const K_VALUES: &[usize] = &[5, 10, 20, 50, 100];

/// The pivot counts swept by pivot-table indexes.
pub const PIVOT_COUNTS: &[usize] = &[3, 5, 10, 15, 20];

/// The height caps swept by depth-capped trees.
pub const MAX_HEIGHTS: &[usize] = &[3, 5, 10, 15, 20];

/// The seed used for every index build.
pub const BUILD_SEED: u64 = 42;

/// One emitted measurement: the average cost of one workload against one
/// index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// The index name, including its key parameters.
    pub index: String,
    /// The dataset name.
    pub dataset: String,
    /// The index category: MM, HFI, DM, or D.
    pub category: String,
    /// Number of pivots, for pivot-parameterized indexes.
    pub num_pivots: Option<usize>,
    /// Height cap / path length, for depth-capped trees.
    pub num_centers_path: Option<usize>,
    /// Arity, for fixed-fanout trees.
    pub arity: Option<usize>,
    /// The query type: `"MRQ"` or `"MkNN"`.
    pub query_type: String,
    /// The swept selectivity, for MRQ workloads.
    pub selectivity: Option<f64>,
    /// The radius matching the selectivity, for MRQ workloads.
    pub radius: Option<f64>,
    /// The neighbor count, for MkNN workloads.
    pub k: Option<usize>,
    /// Average distance evaluations per query.
    pub compdists: f64,
    /// Average elapsed milliseconds per query.
    pub time_ms: f64,
    /// Average logical page reads per query.
    pub pages: f64,
    /// Number of queries averaged over.
    pub n_queries: usize,
    /// The run identifier.
    pub run_id: u32,
}

/// One index configuration: how to build it and how to label its records.
pub struct IndexConfig {
    /// A short label used in result file names.
    pub label: String,
    /// The index category: MM, HFI, DM, or D.
    pub category: String,
    /// The pivot-count column, when applicable.
    pub num_pivots: Option<usize>,
    /// The height-cap column, when applicable.
    pub num_centers_path: Option<usize>,
    /// The arity column, when applicable.
    pub arity: Option<usize>,
    /// Builds the index over the dataset.
    pub build: Box<dyn Fn(&Dataset, &Path) -> Result<Box<dyn MetricIndex>, String>>,
}

/// The full catalog of index configurations driven by the benchmark.
#[must_use]
#[expect(clippy::too_many_lines)]
pub fn index_catalog() -> Vec<IndexConfig> {
    let mut configs: Vec<IndexConfig> = Vec::new();

    configs.push(IndexConfig {
        label: "LinearScan".to_string(),
        category: "MM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, _| Ok(Box::new(LinearScan::new(data.db.clone())))),
    });

    configs.push(IndexConfig {
        label: "BKT".to_string(),
        category: "MM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, _| Ok(Box::new(Bkt::build(data.db.clone(), 10, 1.0)?))),
    });

    for &max_height in MAX_HEIGHTS {
        configs.push(IndexConfig {
            label: format!("BST_h{max_height}"),
            category: "MM".to_string(),
            num_pivots: None,
            num_centers_path: Some(max_height),
            arity: None,
            build: Box::new(move |data, _| Ok(Box::new(Bst::build(data.db.clone(), 10, max_height, BUILD_SEED)?))),
        });
    }

    for arity in [2_usize, 3, 5] {
        configs.push(IndexConfig {
            label: format!("MVPT_a{arity}"),
            category: "MM".to_string(),
            num_pivots: None,
            num_centers_path: None,
            arity: Some(arity),
            build: Box::new(move |data, _| {
                Ok(Box::new(Mvpt::build(data.db.clone(), 10, arity, 0, &[], BUILD_SEED)?))
            }),
        });
    }

    for &pivots in PIVOT_COUNTS {
        configs.push(IndexConfig {
            label: format!("GNAT_p{pivots}"),
            category: "MM".to_string(),
            num_pivots: Some(pivots),
            num_centers_path: None,
            arity: None,
            build: Box::new(move |data, _| Ok(Box::new(Gnat::build(data.db.clone(), pivots.max(2), 5, BUILD_SEED)?))),
        });
    }

    configs.push(IndexConfig {
        label: "SAT".to_string(),
        category: "MM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, _| Ok(Box::new(Sat::build(data.db.clone())?))),
    });

    configs.push(IndexConfig {
        label: "DSACL".to_string(),
        category: "MM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, _| Ok(Box::new(DsaclTree::build(data.db.clone(), 32, 10)?))),
    });

    configs.push(IndexConfig {
        label: "FQT".to_string(),
        category: "MM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: Some(5),
        build: Box::new(|data, _| Ok(Box::new(FqTree::build(data.db.clone(), 10, 5)?))),
    });

    for &pivots in PIVOT_COUNTS {
        configs.push(IndexConfig {
            label: format!("EPT_p{pivots}"),
            category: "MM".to_string(),
            num_pivots: Some(pivots),
            num_centers_path: None,
            arity: None,
            build: Box::new(move |data, _| Ok(Box::new(Ept::build(data.db.clone(), pivots, BUILD_SEED)?))),
        });
    }

    for &pivots in PIVOT_COUNTS {
        configs.push(IndexConfig {
            label: format!("LAESA_p{pivots}"),
            category: "HFI".to_string(),
            num_pivots: Some(pivots),
            num_centers_path: None,
            arity: None,
            build: Box::new(move |data, _| {
                let hfi = data.hfi_pivots(pivots);
                Ok(Box::new(Laesa::build(data.db.clone(), pivots, &hfi)?))
            }),
        });
    }

    configs.push(IndexConfig {
        label: "LC".to_string(),
        category: "DM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            Ok(Box::new(ListOfClusters::build(data.db.clone(), dir.join(&data.name), 4096)?))
        }),
    });

    configs.push(IndexConfig {
        label: "MTree".to_string(),
        category: "DM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            let path = dir.join(format!("{}.mtree_index", data.name));
            Ok(Box::new(MTree::build(data.db.clone(), path, 64)?))
        }),
    });

    configs.push(IndexConfig {
        label: "PMTree_p5".to_string(),
        category: "DM".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            let path = dir.join(format!("{}.pmtree_index", data.name));
            let hfi = data.hfi_pivots(5);
            Ok(Box::new(PmTree::build(data.db.clone(), path, 64, 5, &hfi)?))
        }),
    });

    configs.push(IndexConfig {
        label: "EGNAT_p5".to_string(),
        category: "DM".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            Ok(Box::new(Egnat::build(data.db.clone(), dir.join(&data.name), 5, 4096, BUILD_SEED)?))
        }),
    });

    configs.push(IndexConfig {
        label: "DIndex_p5".to_string(),
        category: "D".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            // The band half-width follows the tightest prepared radius, so
            // the exclusion zone stays meaningful across datasets.
            let rho = data.radius_for(0.02).map_or(1.0, |r| r / 2.0);
            Ok(Box::new(DIndex::build(data.db.clone(), dir.join(&data.name), 5, rho, BUILD_SEED)?))
        }),
    });

    configs.push(IndexConfig {
        label: "OmniRTree_p5".to_string(),
        category: "DM".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            let hfi = data.hfi_pivots(5);
            Ok(Box::new(OmniRTree::build(data.db.clone(), dir.join(&data.name), 5, &hfi, 16, BUILD_SEED)?))
        }),
    });

    configs.push(IndexConfig {
        label: "SPBTree_p5".to_string(),
        category: "DM".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            let hfi = data.hfi_pivots(5);
            Ok(Box::new(SpbTree::build(data.db.clone(), dir.join(&data.name), 5, &hfi, BUILD_SEED)?))
        }),
    });

    configs.push(IndexConfig {
        label: "MIndex_p5".to_string(),
        category: "DM".to_string(),
        num_pivots: Some(5),
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            Ok(Box::new(MIndex::build(data.db.clone(), dir.join(&data.name), 5, BUILD_SEED)?))
        }),
    });

    configs.push(IndexConfig {
        label: "MBPlusTree".to_string(),
        category: "DM".to_string(),
        num_pivots: None,
        num_centers_path: None,
        arity: None,
        build: Box::new(|data, dir| {
            let rho = data.radius_for(0.02).map_or(1.0, |r| r / 2.0);
            Ok(Box::new(MbPlusTree::build(data.db.clone(), dir.join(&data.name), rho, 50, BUILD_SEED)?))
        }),
    });

    for &pivots in PIVOT_COUNTS {
        configs.push(IndexConfig {
            label: format!("CPT_p{pivots}"),
            category: "DM".to_string(),
            num_pivots: Some(pivots),
            num_centers_path: None,
            arity: None,
            build: Box::new(move |data, dir| {
                let hfi = data.hfi_pivots(pivots);
                Ok(Box::new(Cpt::build(data.db.clone(), dir.join(&data.name), pivots, &hfi, 64)?))
            }),
        });
    }

    configs
}

/// Runs the full sweep for one dataset and one configuration; returns the
/// records of every completed workload.
///
/// # Errors
///
/// - If the index cannot be built or a query fails (I/O on a
///   secondary-memory index). The caller skips only this configuration.
pub fn run_config(data: &Dataset, config: &IndexConfig, indexes_dir: &Path) -> Result<Vec<Record>, String> {
    std::fs::create_dir_all(indexes_dir)
        .map_err(|e| format!("Could not create '{}': {e}", indexes_dir.display()))?;

    let start = Instant::now();
    let mut index = (config.build)(data, indexes_dir)?;
    let build_time = start.elapsed().as_secs_f64();
    let build = index.build_counters();
    mt_log!(
        Level::Info,
        "Built {} on {} in {build_time:.3} s ({} build distances, {} page writes)",
        index.name(),
        data.name,
        build.comp_dist,
        build.page_writes
    );

    let n_queries = data.queries.len();
    let mut records = Vec::new();

    for &selectivity in SELECTIVITIES {
        let Some(radius) = data.radius_for(selectivity) else {
            mt_log!(
                Level::Warning,
                "No radius for selectivity {selectivity} on {}; skipping",
                data.name
            );
            continue;
        };

        let mut total_dists = 0_u64;
        let mut total_pages = 0_u64;
        let mut total_micros = 0_u128;
        for &q in &data.queries {
            index.clear_counters();
            let start = Instant::now();
            index.range_search(q, radius)?;
            total_micros += start.elapsed().as_micros();
            let counters = index.counters();
            total_dists += counters.comp_dist;
            total_pages += counters.page_reads;
        }

        records.push(make_record(
            data,
            config,
            &index.name(),
            "MRQ",
            Some(selectivity),
            Some(radius),
            None,
            total_dists,
            total_pages,
            total_micros,
            n_queries,
        ));
    }

    for &k in K_VALUES {
        let mut total_dists = 0_u64;
        let mut total_pages = 0_u64;
        let mut total_micros = 0_u128;
        for &q in &data.queries {
            index.clear_counters();
            let start = Instant::now();
            index.knn_search(q, k)?;
            total_micros += start.elapsed().as_micros();
            let counters = index.counters();
            total_dists += counters.comp_dist;
            total_pages += counters.page_reads;
        }

        records.push(make_record(
            data,
            config,
            &index.name(),
            "MkNN",
            None,
            None,
            Some(k),
            total_dists,
            total_pages,
            total_micros,
            n_queries,
        ));
    }

    Ok(records)
}

/// Assembles one record from accumulated workload totals.
#[expect(clippy::too_many_arguments, clippy::cast_precision_loss)]
fn make_record(
    data: &Dataset,
    config: &IndexConfig,
    index_name: &str,
    query_type: &str,
    selectivity: Option<f64>,
    radius: Option<f64>,
    k: Option<usize>,
    total_dists: u64,
    total_pages: u64,
    total_micros: u128,
    n_queries: usize,
) -> Record {
    let n = n_queries.max(1) as f64;
    Record {
        index: index_name.to_string(),
        dataset: data.name.clone(),
        category: config.category.clone(),
        num_pivots: config.num_pivots,
        num_centers_path: config.num_centers_path,
        arity: config.arity,
        query_type: query_type.to_string(),
        selectivity,
        radius,
        k,
        compdists: total_dists as f64 / n,
        time_ms: total_micros as f64 / (1000.0 * n),
        pages: total_pages as f64 / n,
        n_queries,
        run_id: 1,
    }
}

/// Writes one configuration's records to `results/<label>_<dataset>.json`.
///
/// # Errors
///
/// - If the output directory or file cannot be written.
pub fn write_records(output_dir: &Path, label: &str, dataset: &str, records: &[Record]) -> Result<PathBuf, String> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| format!("Could not create '{}': {e}", output_dir.display()))?;
    let path = output_dir.join(format!("{label}_{dataset}.json"));
    let json = serde_json::to_string_pretty(records).map_err(|e| e.to_string())?;
    std::fs::write(&path, json).map_err(|e| format!("Could not write '{}': {e}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use mexis::dataset::ObjectDb;
    use mexis::metric::Lp;

    use super::*;

    /// A tiny in-memory dataset with two prepared selectivities.
    fn tiny_dataset(tmp: &tempdir::TempDir) -> Dataset {
        let db = Arc::new(ObjectDb::Vectors {
            rows: (0..10).map(|i| vec![f64::from(i)]).collect(),
            dim: 1,
            lp: Lp::L2,
        });
        let mut radii = HashMap::new();
        radii.insert("0.02".to_string(), 1.0);
        radii.insert("0.04".to_string(), 2.0);
        Dataset {
            name: "tiny".to_string(),
            db,
            queries: vec![2, 7],
            radii,
            pivots_dir: tmp.path().to_path_buf(),
        }
    }

    #[test]
    fn records_average_observed_counters() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-harness").map_err(|e| e.to_string())?;
        let data = tiny_dataset(&tmp);

        let config = IndexConfig {
            label: "LinearScan".to_string(),
            category: "MM".to_string(),
            num_pivots: None,
            num_centers_path: None,
            arity: None,
            build: Box::new(|data, _| Ok(Box::new(LinearScan::new(data.db.clone())))),
        };

        let records = run_config(&data, &config, tmp.path())?;
        // Two selectivities present out of five, plus the five k values.
        assert_eq!(records.len(), 2 + K_VALUES.len());

        for record in &records {
            assert_eq!(record.n_queries, 2);
            // The linear scan evaluates every distance on every query.
            float_cmp::assert_approx_eq!(f64, record.compdists, 10.0);
        }

        let path = write_records(tmp.path(), &config.label, &data.name, &records)?;
        let json = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let parsed: Vec<Record> = serde_json::from_str(&json).map_err(|e| e.to_string())?;
        assert_eq!(parsed.len(), records.len());
        Ok(())
    }
}
