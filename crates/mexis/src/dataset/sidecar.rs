//! Loaders for the JSON side-files prepared by the external dataset pipeline.
//!
//! The pipeline emits plain arrays (`[1, 2, 3]`) for query and pivot ids, and
//! flat objects (`{"0.02": 123.4}`) mapping stringified selectivities to
//! radii. Both forms are accepted here regardless of which file they appear
//! in.

use std::collections::HashMap;

use crate::dataset::ObjId;

/// Loads query object ids from a sidecar JSON file.
///
/// # Errors
///
/// - If the file cannot be read or is not valid JSON.
/// - If the JSON holds anything other than non-negative integers.
pub fn load_queries<P: AsRef<std::path::Path>>(path: P) -> Result<Vec<ObjId>, String> {
    load_id_list(path.as_ref())
}

/// Loads HFI pivot object ids from a sidecar JSON file.
///
/// # Errors
///
/// Same conditions as [`load_queries`].
pub fn load_pivots<P: AsRef<std::path::Path>>(path: P) -> Result<Vec<ObjId>, String> {
    load_id_list(path.as_ref())
}

/// Loads the selectivity-to-radius map from a sidecar JSON file.
///
/// Keys are stringified selectivities such as `"0.02"`; values are the query
/// radii that yield that fractional selectivity on the dataset.
///
/// # Errors
///
/// - If the file cannot be read or is not valid JSON.
/// - If the JSON is not an object of numbers (or an array of
///   `[selectivity, radius]` pairs, which is also accepted).
pub fn load_radii<P: AsRef<std::path::Path>>(path: P) -> Result<HashMap<String, f64>, String> {
    let path = path.as_ref();
    let value = read_json(path)?;

    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(key, val)| {
                val.as_f64()
                    .map(|radius| (key.clone(), radius))
                    .ok_or_else(|| format!("Non-numeric radius for '{key}' in '{}'.", path.display()))
            })
            .collect(),
        serde_json::Value::Array(pairs) => pairs
            .into_iter()
            .map(|pair| {
                let pair = pair
                    .as_array()
                    .ok_or_else(|| format!("Expected [selectivity, radius] pairs in '{}'.", path.display()))?;
                match (pair.first().and_then(serde_json::Value::as_f64), pair.get(1).and_then(serde_json::Value::as_f64)) {
                    (Some(sel), Some(radius)) => Ok((format!("{sel}"), radius)),
                    _ => Err(format!("Malformed radius pair in '{}'.", path.display())),
                }
            })
            .collect(),
        _ => Err(format!("Radii file '{}' is neither an object nor an array.", path.display())),
    }
}

/// Reads a JSON file into a `serde_json::Value`.
fn read_json(path: &std::path::Path) -> Result<serde_json::Value, String> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| format!("Could not read '{}': {e}", path.display()))?;
    serde_json::from_str(&contents).map_err(|e| format!("Invalid JSON in '{}': {e}", path.display()))
}

/// Loads a list of object ids from either an array or an object of ids.
fn load_id_list(path: &std::path::Path) -> Result<Vec<ObjId>, String> {
    let value = read_json(path)?;

    let items = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        _ => return Err(format!("Id file '{}' is neither an array nor an object.", path.display())),
    };

    items
        .into_iter()
        .map(|item| {
            item.as_u64()
                .and_then(|id| ObjId::try_from(id).ok())
                .ok_or_else(|| format!("Non-integer id in '{}'.", path.display()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queries_and_radii_round_trip() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-sidecar").map_err(|e| e.to_string())?;

        let q_path = tmp.path().join("q.json");
        std::fs::write(&q_path, "[3, 1, 4, 1, 5]").map_err(|e| e.to_string())?;
        assert_eq!(load_queries(&q_path)?, vec![3, 1, 4, 1, 5]);

        let r_path = tmp.path().join("r.json");
        std::fs::write(&r_path, r#"{"0.02": 1.25, "0.04": 2.5}"#).map_err(|e| e.to_string())?;
        let radii = load_radii(&r_path)?;
        assert_eq!(radii.len(), 2);
        float_cmp::assert_approx_eq!(f64, radii["0.02"], 1.25);
        float_cmp::assert_approx_eq!(f64, radii["0.04"], 2.5);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_queries("no/such/file.json").is_err());
        assert!(load_radii("no/such/file.json").is_err());
    }
}
