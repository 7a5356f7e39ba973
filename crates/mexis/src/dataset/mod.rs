//! The object database: the only owner of raw objects and the only supplier
//! of distances between them.

mod sidecar;

use std::io::BufRead;

use rayon::prelude::*;

use crate::metric::{levenshtein, Lp};

pub use sidecar::{load_pivots, load_queries, load_radii};

/// A dense identifier of an object in an [`ObjectDb`], assigned by load order.
pub type ObjId = usize;

/// An immutable collection of objects paired with a metric.
///
/// The database is built once from a text file and lives for the whole
/// benchmark run. Indexes never touch raw objects; they see only `size` and
/// `distance`.
pub enum ObjectDb {
    /// Fixed-dimension numeric vectors under a Minkowski norm.
    Vectors {
        /// The vectors, one per object.
        rows: Vec<Vec<f64>>,
        /// The shared dimensionality of all vectors.
        dim: usize,
        /// The norm used for distances.
        lp: Lp,
    },
    /// Variable-length strings under the Levenshtein edit distance.
    Strings {
        /// The strings, one per object.
        rows: Vec<String>,
    },
}

impl ObjectDb {
    /// Loads a vector dataset from a whitespace-separated text file.
    ///
    /// The file either begins with a header line `dim n p`, where `p` selects
    /// the norm (`1` = L1, `2` = L2, `5` = L5, anything else = L-infinity),
    /// or has no header, in which case the first line is data, the
    /// dimensionality is inferred from it, and `default_lp` is used.
    ///
    /// # Errors
    ///
    /// - If the file cannot be opened or read.
    /// - If the file contains no data rows.
    /// - If any data row fails to parse or disagrees on dimensionality.
    pub fn load_vectors<P: AsRef<std::path::Path>>(path: P, default_lp: Lp) -> Result<Self, String> {
        let path = path.as_ref();
        let lines = read_non_empty_lines(path)?;
        if lines.is_empty() {
            return Err(format!("Dataset file '{}' is empty.", path.display()));
        }

        let (lp, data_lines) = match parse_int_header(&lines[0], 3) {
            Some(header) => (Lp::from_code(header[2]), &lines[1..]),
            None => (default_lp, &lines[..]),
        };

        let rows = data_lines
            .par_iter()
            .map(|line| {
                line.split_whitespace()
                    .map(|tok| {
                        tok.parse::<f64>()
                            .map_err(|e| format!("Bad vector component '{tok}' in '{}': {e}", path.display()))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        if rows.is_empty() {
            return Err(format!("Dataset file '{}' has no data rows.", path.display()));
        }

        let dim = rows[0].len();
        if let Some(bad) = rows.iter().position(|row| row.len() != dim) {
            return Err(format!(
                "Row {bad} of '{}' has {} components, expected {dim}.",
                path.display(),
                rows[bad].len()
            ));
        }

        Ok(Self::Vectors { rows, dim, lp })
    }

    /// Loads a string dataset from a text file, one string per line.
    ///
    /// The file may begin with a header line `n p`; `p` is ignored because
    /// the metric for strings is always the Levenshtein edit distance.
    ///
    /// # Errors
    ///
    /// - If the file cannot be opened or read.
    /// - If the file contains no data rows.
    pub fn load_strings<P: AsRef<std::path::Path>>(path: P) -> Result<Self, String> {
        let path = path.as_ref();
        let lines = read_non_empty_lines(path)?;
        if lines.is_empty() {
            return Err(format!("Dataset file '{}' is empty.", path.display()));
        }

        let rows = match parse_int_header(&lines[0], 2) {
            Some(_) => lines[1..].to_vec(),
            None => lines,
        };

        if rows.is_empty() {
            return Err(format!("Dataset file '{}' has no data rows.", path.display()));
        }

        Ok(Self::Strings { rows })
    }

    /// The number of objects in the database.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::Vectors { rows, .. } => rows.len(),
            Self::Strings { rows } => rows.len(),
        }
    }

    /// The distance between two objects under the database's metric.
    ///
    /// Symmetric, non-negative, and obeys the triangle inequality. Both ids
    /// must be in `[0, size())`.
    #[must_use]
    pub fn distance(&self, a: ObjId, b: ObjId) -> f64 {
        match self {
            Self::Vectors { rows, lp, .. } => lp.eval(&rows[a], &rows[b]),
            Self::Strings { rows } => levenshtein(&rows[a], &rows[b]),
        }
    }

    /// A human-readable rendering of one object, for diagnostics only.
    #[must_use]
    pub fn render(&self, id: ObjId) -> String {
        match self {
            Self::Vectors { rows, .. } => rows[id]
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" "),
            Self::Strings { rows } => rows[id].clone(),
        }
    }

    /// The dimensionality of a vector database; `None` for strings.
    #[must_use]
    pub fn dimensionality(&self) -> Option<usize> {
        match self {
            Self::Vectors { dim, .. } => Some(*dim),
            Self::Strings { .. } => None,
        }
    }

    /// The name of the metric in use, for reports.
    #[must_use]
    pub fn metric_name(&self) -> String {
        match self {
            Self::Vectors { lp, .. } => lp.to_string(),
            Self::Strings { .. } => "levenshtein".to_string(),
        }
    }
}

/// Reads all non-empty lines of a text file.
fn read_non_empty_lines(path: &std::path::Path) -> Result<Vec<String>, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Could not open dataset file '{}': {e}", path.display()))?;
    std::io::BufReader::new(file)
        .lines()
        .map(|line| line.map_err(|e| format!("Could not read '{}': {e}", path.display())))
        .filter(|line| !matches!(line, Ok(l) if l.trim().is_empty()))
        .collect()
}

/// Parses a header line consisting of exactly `arity` integer tokens.
///
/// Returns `None` when the line is anything else, in which case it is data.
fn parse_int_header(line: &str, arity: usize) -> Option<Vec<i64>> {
    let tokens = line.split_whitespace().collect::<Vec<_>>();
    if tokens.len() != arity {
        return None;
    }
    tokens
        .into_iter()
        .map(|tok| tok.parse::<i64>().ok())
        .collect::<Option<Vec<_>>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes `contents` to a fresh file under `dir` and returns its path.
    fn write_file(dir: &tempdir::TempDir, name: &str, contents: &str) -> Result<std::path::PathBuf, String> {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).map_err(|e| e.to_string())?;
        Ok(path)
    }

    #[test]
    fn headered_vectors() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dataset").map_err(|e| e.to_string())?;
        let path = write_file(&tmp, "vecs.txt", "2 3 1\n0 0\n3 4\n1 1\n")?;

        let db = ObjectDb::load_vectors(&path, Lp::L2)?;
        assert_eq!(db.size(), 3);
        // Header selected L1, overriding the default.
        float_cmp::assert_approx_eq!(f64, db.distance(0, 1), 7.0);
        Ok(())
    }

    #[test]
    fn headerless_vectors_infer_dim() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dataset").map_err(|e| e.to_string())?;
        let path = write_file(&tmp, "vecs.txt", "0.0 0.0\n3.0 4.0\n")?;

        let db = ObjectDb::load_vectors(&path, Lp::L2)?;
        assert_eq!(db.size(), 2);
        float_cmp::assert_approx_eq!(f64, db.distance(0, 1), 5.0);
        Ok(())
    }

    #[test]
    fn headered_strings_ignore_p() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dataset").map_err(|e| e.to_string())?;
        let path = write_file(&tmp, "words.txt", "3 2\nabc\nabd\nxyz\n")?;

        let db = ObjectDb::load_strings(&path)?;
        assert_eq!(db.size(), 3);
        float_cmp::assert_approx_eq!(f64, db.distance(0, 1), 1.0);
        float_cmp::assert_approx_eq!(f64, db.distance(0, 2), 3.0);
        Ok(())
    }

    #[test]
    fn ragged_vectors_are_rejected() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-dataset").map_err(|e| e.to_string())?;
        let path = write_file(&tmp, "vecs.txt", "0.0 0.0\n1.0\n")?;

        assert!(ObjectDb::load_vectors(&path, Lp::L2).is_err());
        Ok(())
    }
}
