//! Dataset resolution: source files and their prepared side-files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use mexis::dataset::{load_pivots, load_queries, load_radii, ObjectDb, ObjId};
use mexis::metric::Lp;
use mt_logger::{mt_log, Level};
use num_format::ToFormattedString;

/// The built-in dataset list used when no names are given on the command
/// line.
pub const DEFAULT_DATASETS: &[&str] = &["LA", "Synthetic", "Words"];

/// One resolved dataset: the loaded objects plus the prepared queries and
/// selectivity-to-radius map.
pub struct Dataset {
    /// The dataset name.
    pub name: String,
    /// The loaded object database.
    pub db: Arc<ObjectDb>,
    /// The prepared query object ids.
    pub queries: Vec<ObjId>,
    /// Radii keyed by stringified selectivity.
    pub radii: HashMap<String, f64>,
    /// The directory holding the prepared pivot side-files.
    pub(crate) pivots_dir: PathBuf,
}

impl Dataset {
    /// Resolves and loads a dataset by name from `input_dir`.
    ///
    /// The source file is `<input_dir>/<name>_2k.txt`; queries and radii come
    /// from the `queries2k/` and `radii2k/` side-file directories. String
    /// datasets are recognized by name (`Words`); everything else loads as
    /// vectors under L2 unless the file header overrides the metric.
    ///
    /// # Errors
    ///
    /// - If the source file, queries file, or radii file is missing or
    ///   malformed.
    pub fn resolve(input_dir: &Path, name: &str) -> Result<Self, String> {
        let source = input_dir.join(format!("{name}_2k.txt"));
        let db = if name == "Words" {
            ObjectDb::load_strings(&source)?
        } else {
            ObjectDb::load_vectors(&source, Lp::L2)?
        };
        mt_log!(
            Level::Info,
            "Loaded {name}: {} objects under {}{}",
            db.size().to_formatted_string(&num_format::Locale::en),
            db.metric_name(),
            db.dimensionality().map_or_else(String::new, |d| format!(", {d}D"))
        );

        let mut queries = load_queries(input_dir.join("queries2k").join(format!("{name}_queries.json")))?;
        let before = queries.len();
        queries.retain(|&q| q < db.size());
        if queries.len() < before {
            mt_log!(
                Level::Warning,
                "Dropped {} out-of-range query ids for {name}",
                before - queries.len()
            );
        }
        let radii = load_radii(input_dir.join("radii2k").join(format!("{name}_radii.json")))?;

        Ok(Self {
            name: name.to_string(),
            db: Arc::new(db),
            queries,
            radii,
            pivots_dir: input_dir.join("pivots2k"),
        })
    }

    /// The precomputed HFI pivots for `count` pivots, when the side-file
    /// exists; an empty list otherwise (indexes then pick their own).
    #[must_use]
    pub fn hfi_pivots(&self, count: usize) -> Vec<ObjId> {
        let path = self.pivots_dir.join(format!("{}_pivots_{count}.json", self.name));
        match load_pivots(&path) {
            Ok(pivots) => pivots,
            Err(_) => {
                mt_log!(
                    Level::Warning,
                    "No HFI pivot file for {} with {count} pivots; indexes fall back to their own choice",
                    self.name
                );
                Vec::new()
            }
        }
    }

    /// The radius that yields `selectivity`, if the side-file recorded it.
    #[must_use]
    pub fn radius_for(&self, selectivity: f64) -> Option<f64> {
        self.radii.get(&format!("{selectivity}")).copied()
    }
}
