//! The list of clusters.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use mt_logger::{mt_log, Level};

use crate::dataset::{ObjId, ObjectDb};
use crate::scope::{pages_for, Counters, DbScope};
use crate::utils::{tau_of, SizedHeap};
use crate::MetricIndex;

/// One cluster header, resident in RAM and mirrored in the index file.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
struct ClusterInfo {
    /// The center object.
    center: ObjId,
    /// Distance from the center to its farthest member.
    radius: f64,
    /// Number of members (the center is not a member).
    count: u32,
    /// Byte offset of the member ids in the member file.
    offset: u64,
}

/// Build parameters and cluster headers, persisted in the index file.
#[derive(serde::Serialize, serde::Deserialize)]
struct Meta {
    /// Number of objects in the database at build time.
    n: u64,
    /// The logical cluster size in bytes.
    page_bytes: u64,
    /// The cluster headers, in build order.
    clusters: Vec<ClusterInfo>,
}

/// A list of clusters.
///
/// Built offline by repeatedly peeling a cluster off the remaining set: the
/// next center is the remaining object with the largest accumulated sum of
/// distances to all previous centers, and it claims its `bucket_size`
/// closest remaining objects. Queries prune whole clusters with the ball
/// cover test before touching the member file.
pub struct ListOfClusters {
    /// The counted route to the database.
    scope: DbScope,
    /// The cluster headers, in build order.
    clusters: Vec<ClusterInfo>,
    /// The open member file.
    members: std::fs::File,
    /// The logical cluster size in bytes.
    page_bytes: u64,
    /// Logical 4 KB pages charged per cluster access.
    pages_per_cluster: u64,
    /// Counters accumulated during the build.
    build: Counters,
}

/// The two files of a list of clusters: `<base>.lc_index` holds the headers,
/// `<base>.lc_node` the member ids.
fn paths(base: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    (base.with_extension("lc_index"), base.with_extension("lc_node"))
}

/// Derives per-cluster capacity and page accounting from the page size.
const fn derive(page_bytes: u64) -> (usize, u64) {
    let bucket_size = (page_bytes / 4) as usize;
    let bucket_size = if bucket_size == 0 { 1 } else { bucket_size };
    let pages = page_bytes.div_ceil(4096);
    (bucket_size, if pages == 0 { 1 } else { pages })
}

impl ListOfClusters {
    /// Builds a list of clusters and persists it under `base`.
    ///
    /// # Errors
    ///
    /// - If `page_bytes` is zero.
    /// - If the index files cannot be written.
    pub fn build<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P, page_bytes: u64) -> Result<Self, String> {
        if page_bytes == 0 {
            return Err("LC page size must be positive.".to_string());
        }
        let (bucket_size, pages_per_cluster) = derive(page_bytes);
        let (index_path, node_path) = paths(base.as_ref());

        let mut scope = DbScope::new(db);
        let n = scope.size();

        let node_tmp = node_path.with_extension("lc_node.tmp");
        let mut node_out = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&node_tmp)
            .map_err(|e| format!("Could not create '{}': {e}", node_tmp.display()))?;

        // Remaining objects with their accumulated distance to all centers
        // chosen so far.
        let mut remaining = (0..n).map(|id| (id, 0.0_f64)).collect::<Vec<_>>();
        let mut clusters = Vec::new();
        let mut offset = 0_u64;

        while !remaining.is_empty() {
            // Farthest-first by total distance; ties toward the smaller id.
            let pick = remaining
                .iter()
                .enumerate()
                .max_by(|(_, (i, a)), (_, (j, b))| {
                    a.partial_cmp(b).unwrap_or(core::cmp::Ordering::Equal).then(j.cmp(i))
                })
                .map_or(0, |(pos, _)| pos);
            let (center, _) = remaining.swap_remove(pick);

            let mut by_dist = Vec::with_capacity(remaining.len());
            for (id, tdist) in &mut remaining {
                let d = scope.d(center, *id);
                *tdist += d;
                by_dist.push((d, *id));
            }
            by_dist.sort_by(|a, b| {
                a.0.partial_cmp(&b.0)
                    .unwrap_or(core::cmp::Ordering::Equal)
                    .then(a.1.cmp(&b.1))
            });

            let count = by_dist.len().min(bucket_size);
            let members = &by_dist[..count];
            let radius = members.last().map_or(0.0, |&(d, _)| d);

            let mut bytes = Vec::with_capacity(count * 4);
            for &(_, id) in members {
                let id = u32::try_from(id).map_err(|_| "Object id exceeds u32.".to_string())?;
                bytes.extend_from_slice(&id.to_le_bytes());
            }
            node_out
                .write_all(&bytes)
                .map_err(|e| format!("Could not write '{}': {e}", node_tmp.display()))?;

            clusters.push(ClusterInfo {
                center,
                radius,
                count: u32::try_from(count).map_err(|_| "Cluster count exceeds u32.".to_string())?,
                offset,
            });
            offset += bytes.len() as u64;
            scope.page_writes(pages_per_cluster);

            let taken = members.iter().map(|&(_, id)| id).collect::<std::collections::HashSet<_>>();
            remaining.retain(|(id, _)| !taken.contains(id));
        }

        node_out
            .sync_all()
            .map_err(|e| format!("Could not sync '{}': {e}", node_tmp.display()))?;

        let meta = Meta {
            n: n as u64,
            page_bytes,
            clusters: clusters.clone(),
        };
        let index_tmp = index_path.with_extension("lc_index.tmp");
        let encoded = bincode::serialize(&meta).map_err(|e| format!("Could not serialize LC headers: {e}"))?;
        std::fs::write(&index_tmp, &encoded)
            .map_err(|e| format!("Could not write '{}': {e}", index_tmp.display()))?;
        scope.page_writes(pages_for(encoded.len() as u64));

        std::fs::rename(&node_tmp, &node_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", node_tmp.display()))?;
        std::fs::rename(&index_tmp, &index_path)
            .map_err(|e| format!("Could not rename '{}' into place: {e}", index_tmp.display()))?;

        let members = std::fs::File::open(&node_path)
            .map_err(|e| format!("Could not open '{}': {e}", node_path.display()))?;

        mt_log!(Level::Info, "LC build done: {} clusters over {n} objects", clusters.len());

        let build = scope.counters;
        scope.clear_counters();
        Ok(Self {
            scope,
            clusters,
            members,
            page_bytes,
            pages_per_cluster,
            build,
        })
    }

    /// Reopens a persisted list of clusters from `base`.
    ///
    /// # Errors
    ///
    /// - If either file is missing or the header file is corrupt.
    pub fn open<P: AsRef<Path>>(db: Arc<ObjectDb>, base: P) -> Result<Self, String> {
        let (index_path, node_path) = paths(base.as_ref());

        let encoded = std::fs::read(&index_path)
            .map_err(|e| format!("Could not read '{}': {e}", index_path.display()))?;
        let meta: Meta = bincode::deserialize(&encoded)
            .map_err(|e| format!("Corrupt LC headers in '{}': {e}", index_path.display()))?;

        let members = std::fs::File::open(&node_path)
            .map_err(|e| format!("Could not open '{}': {e}", node_path.display()))?;
        let (_, pages_per_cluster) = derive(meta.page_bytes);

        Ok(Self {
            scope: DbScope::new(db),
            clusters: meta.clusters,
            members,
            page_bytes: meta.page_bytes,
            pages_per_cluster,
            build: Counters::default(),
        })
    }

    /// Reads the member ids of one cluster from the member file.
    fn read_members(&mut self, cluster: &ClusterInfo) -> Result<Vec<ObjId>, String> {
        self.members
            .seek(SeekFrom::Start(cluster.offset))
            .map_err(|e| format!("Could not seek LC member file: {e}"))?;
        let mut bytes = vec![0_u8; cluster.count as usize * 4];
        self.members
            .read_exact(&mut bytes)
            .map_err(|e| format!("Short read in LC member file: {e}"))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as ObjId)
            .collect())
    }
}

impl MetricIndex for ListOfClusters {
    fn name(&self) -> String {
        format!("LC(pageBytes={})", self.page_bytes)
    }

    fn range_search(&mut self, query: ObjId, radius: f64) -> Result<Vec<ObjId>, String> {
        let mut hits = Vec::new();

        for c in self.clusters.clone() {
            let d = self.scope.d(query, c.center);
            if d > c.radius + radius {
                continue;
            }
            self.scope.page_reads(self.pages_per_cluster);

            if d <= radius {
                hits.push(c.center);
            }
            if c.count == 0 {
                continue;
            }
            for id in self.read_members(&c)? {
                if self.scope.d(query, id) <= radius {
                    hits.push(id);
                }
            }
        }
        Ok(hits)
    }

    fn knn_search(&mut self, query: ObjId, k: usize) -> Result<Vec<(ObjId, f64)>, String> {
        let mut heap = SizedHeap::new(Some(k));
        if k == 0 {
            return Ok(Vec::new());
        }

        for c in self.clusters.clone() {
            let d = self.scope.d(query, c.center);
            if heap.is_full() && d - c.radius > tau_of(&heap) {
                continue;
            }
            self.scope.page_reads(self.pages_per_cluster);

            heap.push((c.center, d));
            if c.count == 0 {
                continue;
            }
            for id in self.read_members(&c)? {
                let dm = self.scope.d(query, id);
                heap.push((id, dm));
            }
        }
        Ok(heap.into_sorted())
    }

    fn counters(&self) -> Counters {
        self.scope.counters
    }

    fn clear_counters(&mut self) {
        self.scope.clear_counters();
    }

    fn build_counters(&self) -> Counters {
        self.build
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Lp;

    fn two_cluster_db() -> Arc<ObjectDb> {
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

    #[test]
    fn searches_match_brute_force() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-lc").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut lc = ListOfClusters::build(two_cluster_db(), &base, 16)?;

        let mut hits = lc.range_search(0, 1.0)?;
        hits.sort_unstable();
        assert_eq!(hits, vec![0, 1, 2]);

        let knn = lc.knn_search(0, 3)?;
        assert_eq!(knn[0], (0, 0.0));
        assert_eq!((knn[1].0, knn[2].0), (1, 2));
        Ok(())
    }

    #[test]
    fn reopen_gives_identical_results() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-lc").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let db = two_cluster_db();

        let mut built = ListOfClusters::build(db.clone(), &base, 16)?;
        built.clear_counters();
        let fresh_hits = built.knn_search(1, 4)?;
        let fresh_counters = built.counters();

        let mut reopened = ListOfClusters::open(db, &base)?;
        let reopened_hits = reopened.knn_search(1, 4)?;
        assert_eq!(fresh_hits, reopened_hits);
        assert_eq!(fresh_counters, reopened.counters());
        Ok(())
    }

    #[test]
    fn queries_touch_fewer_pages_than_clusters() -> Result<(), String> {
        let tmp = tempdir::TempDir::new("mexis-lc").map_err(|e| e.to_string())?;
        let base = tmp.path().join("toy");
        let mut lc = ListOfClusters::build(two_cluster_db(), &base, 16)?;

        lc.clear_counters();
        lc.range_search(0, 0.5)?;
        // The far cluster is ball-pruned without a page read.
        assert!(lc.counters().page_reads < lc.clusters.len() as u64 * lc.pages_per_cluster);
        Ok(())
    }
}
