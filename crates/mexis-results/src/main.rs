//! CLI for running the metric-index benchmarks.
//!
//! Drives the cartesian product of datasets, index configurations, and
//! query workloads, and writes one JSON record array per (index, dataset)
//! pair under the output directory.

use std::path::PathBuf;

use clap::Parser;
use mt_logger::{mt_flush, mt_log, mt_new, Level, OutputStream};

mod datasets;
mod harness;

use datasets::{Dataset, DEFAULT_DATASETS};

/// CLI for running the metric-index benchmarks.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Names of the datasets to benchmark; the built-in list when empty.
    datasets: Vec<String>,

    /// Directory holding the dataset files and their prepared side-files.
    #[arg(long, default_value = "datasets")]
    input_dir: PathBuf,

    /// Directory for the emitted JSON reports.
    #[arg(long, default_value = "results")]
    output_dir: PathBuf,
}

fn main() -> Result<(), String> {
    mt_new!(None, Level::Info, OutputStream::Both);

    let cli = Cli::parse();
    if !cli.input_dir.is_dir() {
        return Err(format!("Input directory '{}' does not exist.", cli.input_dir.display()));
    }

    let names = if cli.datasets.is_empty() {
        DEFAULT_DATASETS.iter().map(ToString::to_string).collect()
    } else {
        cli.datasets.clone()
    };

    for name in &names {
        // A missing dataset or side-file skips the tuple, never the run.
        let data = match Dataset::resolve(&cli.input_dir, name) {
            Ok(data) => data,
            Err(e) => {
                mt_log!(Level::Warning, "Skipping dataset {name}: {e}");
                continue;
            }
        };
        if data.queries.is_empty() {
            mt_log!(Level::Warning, "Skipping dataset {name}: no prepared queries");
            continue;
        }

        for config in harness::index_catalog() {
            let indexes_dir = PathBuf::from(format!("{}_indexes", config.label));
            match harness::run_config(&data, &config, &indexes_dir) {
                Ok(records) => {
                    let path = harness::write_records(&cli.output_dir, &config.label, &data.name, &records)?;
                    mt_log!(
                        Level::Info,
                        "{} on {name}: {} records -> {}",
                        config.label,
                        records.len(),
                        path.display()
                    );
                }
                Err(e) => {
                    // One broken index run must not poison its siblings.
                    mt_log!(Level::Warning, "{} on {name} failed: {e}", config.label);
                }
            }
        }
    }

    mt_flush!().map_err(|e| e.to_string())?;
    Ok(())
}
