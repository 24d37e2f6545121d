//! Embedding index over pending intents.
//!
//! An insert-only HNSW graph plus a fingerprint→label map. Removing a
//! fingerprint only drops the mapping; the underlying vector stays behind as
//! a tombstone that candidate construction filters out. When tombstones pass
//! half the graph, the next save rebuilds from the live set.

pub mod graph;
pub mod metric;

use crate::error::{MediatorError, MediatorResult};
use crate::persist::atomic_write;
use crate::types::{pair_key, AlignmentCandidate, Fingerprint, Intent};
use graph::HnswGraph;
use metric::clipped_similarity;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.bin";
const MAP_FILE: &str = "intent-map.json";
const HNSW_M: usize = 12;
const HNSW_EF_CONSTRUCTION: usize = 64;
/// Local neighbours fetched per intent during candidate construction.
const NEIGHBORS_PER_QUERY: usize = 8;
/// Tombstone share that triggers a rebuild at the next save.
const REBUILD_RATIO: f64 = 0.5;

/// ANN index over intent embeddings under cosine distance.
pub struct VectorIndex {
    graph: HnswGraph,
    labels: HashMap<Fingerprint, u64>,
    records: HashMap<u64, Intent>,
    dimension: usize,
    min_similarity: f64,
    max_elements: usize,
    dir: PathBuf,
}

impl VectorIndex {
    /// Open (or create) the index under `data_dir/vectors`. Idempotent:
    /// loads persisted state when present; corrupt or mismatched files are
    /// logged and replaced with an empty index that refills as embeddings
    /// recur.
    pub fn initialize(
        data_dir: &Path,
        max_elements: usize,
        dimension: usize,
        min_similarity: f64,
    ) -> MediatorResult<Self> {
        let dir = data_dir.join("vectors");
        fs::create_dir_all(&dir).map_err(|e| {
            MediatorError::Persistence(format!("creating {}: {e}", dir.display()))
        })?;
        let mut index = Self {
            graph: HnswGraph::new(dimension, HNSW_M, HNSW_EF_CONSTRUCTION),
            labels: HashMap::new(),
            records: HashMap::new(),
            dimension,
            min_similarity,
            max_elements,
            dir,
        };
        index.load();
        Ok(index)
    }

    /// Live fingerprints.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Logically removed vectors still occupying the graph.
    pub fn tombstones(&self) -> usize {
        self.graph.len() - self.labels.len()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.labels.contains_key(fingerprint)
    }

    /// Insert or replace the embedding for an intent. Replacement tombstones
    /// the old vector.
    pub fn upsert(&mut self, intent: &Intent, vector: &[f32]) -> MediatorResult<()> {
        if vector.len() != self.dimension {
            return Err(MediatorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if let Some(old) = self.labels.remove(&intent.fingerprint) {
            self.records.remove(&old);
        }
        if self.graph.len() >= self.max_elements {
            warn!(
                max_elements = self.max_elements,
                "vector index at capacity hint"
            );
        }
        let label = self.graph.insert(vector.to_vec())?;
        self.labels.insert(intent.fingerprint.clone(), label);
        self.records.insert(label, intent.clone());
        Ok(())
    }

    /// Drop a fingerprint from the map. The graph keeps the vector as a
    /// tombstone until the next rebuild.
    pub fn remove(&mut self, fingerprint: &str) -> bool {
        match self.labels.remove(fingerprint) {
            Some(label) => {
                self.records.remove(&label);
                true
            }
            None => false,
        }
    }

    /// Top-k live neighbours above the similarity floor, sorted by
    /// similarity descending; ties broken by higher offered fee, earlier
    /// timestamp, then fingerprint.
    pub fn query_top_k(
        &self,
        vector: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> Vec<(Fingerprint, f64)> {
        if vector.len() != self.dimension || k == 0 {
            return Vec::new();
        }
        // Over-fetch so tombstones and the excluded fingerprint cannot
        // starve the result set.
        let fetch = (k + self.tombstones() + 1).min(self.graph.len().max(1));
        let ef = (fetch * 4).max(48);
        let mut hits: Vec<(&Intent, f64)> = self
            .graph
            .search(vector, fetch, ef)
            .into_iter()
            .filter_map(|(label, distance)| {
                let intent = self.records.get(&label)?;
                if exclude == Some(intent.fingerprint.as_str()) {
                    return None;
                }
                let similarity = clipped_similarity(distance);
                (similarity >= self.min_similarity).then_some((intent, similarity))
            })
            .collect();
        hits.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    ib.fee()
                        .partial_cmp(&ia.fee())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| ia.timestamp.cmp(&ib.timestamp))
                .then_with(|| ia.fingerprint.cmp(&ib.fingerprint))
        });
        hits.truncate(k);
        hits.into_iter()
            .map(|(intent, similarity)| (intent.fingerprint.clone(), similarity))
            .collect()
    }

    /// For each embedded intent, query its local neighbourhood, flatten into
    /// unordered pairs, rank by priority and truncate.
    pub fn top_alignment_candidates(
        &self,
        items: &[(Arc<Intent>, Arc<Vec<f32>>)],
        top_k: usize,
    ) -> Vec<AlignmentCandidate> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates: Vec<AlignmentCandidate> = Vec::new();

        for (intent, vector) in items {
            let neighbours = self.query_top_k(
                vector,
                NEIGHBORS_PER_QUERY,
                Some(intent.fingerprint.as_str()),
            );
            for (neighbour_fp, similarity) in neighbours {
                let key = pair_key(&intent.fingerprint, &neighbour_fp);
                if !seen.insert(key) {
                    continue;
                }
                let Some(&label) = self.labels.get(&neighbour_fp) else {
                    continue;
                };
                let Some(record) = self.records.get(&label) else {
                    continue;
                };
                candidates.push(AlignmentCandidate {
                    a: intent.clone(),
                    b: Arc::new(record.clone()),
                    similarity,
                });
            }
        }

        candidates.sort_by(|x, y| {
            y.priority()
                .partial_cmp(&x.priority())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    y.similarity
                        .partial_cmp(&x.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| x.pair_key().cmp(&y.pair_key()))
        });
        candidates.truncate(top_k);
        candidates
    }

    /// Persist the graph and the label map atomically. Rebuilds first when
    /// tombstones dominate.
    pub fn save(&mut self) -> MediatorResult<()> {
        if self.graph.len() > 0
            && self.tombstones() as f64 / self.graph.len() as f64 > REBUILD_RATIO
        {
            self.rebuild();
        }

        let graph_bytes = bincode::serialize(&self.graph)
            .map_err(|e| MediatorError::Persistence(format!("encoding index: {e}")))?;
        atomic_write(&self.dir.join(INDEX_FILE), &graph_bytes)?;

        let map: HashMap<String, &Intent> = self
            .labels
            .iter()
            .filter_map(|(_, label)| {
                self.records
                    .get(label)
                    .map(|intent| (label.to_string(), intent))
            })
            .collect();
        let map_bytes = serde_json::to_vec_pretty(&map)
            .map_err(|e| MediatorError::Persistence(format!("encoding intent map: {e}")))?;
        atomic_write(&self.dir.join(MAP_FILE), &map_bytes)?;

        debug!(
            live = self.labels.len(),
            tombstones = self.tombstones(),
            "vector index saved"
        );
        Ok(())
    }

    /// Re-insert every live vector into a fresh graph, shedding tombstones.
    fn rebuild(&mut self) {
        info!(
            live = self.labels.len(),
            tombstones = self.tombstones(),
            "rebuilding vector index"
        );
        let mut graph = HnswGraph::new(self.dimension, HNSW_M, HNSW_EF_CONSTRUCTION);
        let mut labels = HashMap::new();
        let mut records = HashMap::new();
        for (fingerprint, old_label) in &self.labels {
            let Some(vector) = self.graph.vector(*old_label) else {
                continue;
            };
            let Some(intent) = self.records.get(old_label) else {
                continue;
            };
            match graph.insert(vector.to_vec()) {
                Ok(label) => {
                    labels.insert(fingerprint.clone(), label);
                    records.insert(label, intent.clone());
                }
                Err(err) => {
                    warn!(error = %err, fingerprint = %fingerprint, "dropping vector during rebuild")
                }
            }
        }
        self.graph = graph;
        self.labels = labels;
        self.records = records;
    }

    /// Best-effort load; any unreadable file leaves the index empty.
    fn load(&mut self) {
        let index_path = self.dir.join(INDEX_FILE);
        let map_path = self.dir.join(MAP_FILE);
        if !index_path.exists() {
            return;
        }

        let graph: Option<HnswGraph> = fs::read(&index_path)
            .ok()
            .and_then(|bytes| bincode::deserialize(&bytes).ok());
        let Some(graph) = graph else {
            warn!(path = %index_path.display(), "unreadable vector index, starting empty");
            return;
        };
        if graph.dimension() != self.dimension {
            warn!(
                persisted = graph.dimension(),
                configured = self.dimension,
                "vector index dimension changed, starting empty"
            );
            return;
        }

        let map: HashMap<String, Intent> = match fs::read(&map_path)
            .map_err(MediatorError::from)
            .and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| MediatorError::Persistence(e.to_string()))
            }) {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "corrupt intent map, proceeding with empty map");
                HashMap::new()
            }
        };

        self.graph = graph;
        for (label_str, intent) in map {
            let Ok(label) = label_str.parse::<u64>() else {
                warn!(label = %label_str, "skipping malformed label in intent map");
                continue;
            };
            if self.graph.vector(label).is_none() {
                continue;
            }
            self.labels.insert(intent.fingerprint.clone(), label);
            self.records.insert(label, intent);
        }
        info!(
            live = self.labels.len(),
            tombstones = self.tombstones(),
            "vector index loaded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntentStatus;
    use tempfile::TempDir;

    fn intent(fingerprint: &str, fee: f64, timestamp: i64) -> Intent {
        Intent {
            fingerprint: fingerprint.to_string(),
            author: "alice".to_string(),
            prose: "prose".to_string(),
            desires: vec![],
            constraints: vec![],
            offered_fee: Some(fee),
            timestamp,
            status: IntentStatus::Pending,
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    fn test_index(dir: &TempDir) -> VectorIndex {
        VectorIndex::initialize(dir.path(), 1_000, 4, 0.5).unwrap()
    }

    #[test]
    fn similarity_floor_filters_neighbours() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        index.upsert(&intent("intent-aaaa-0001", 1.0, 1), &unit(4, 0)).unwrap();
        index.upsert(&intent("intent-aaaa-0002", 1.0, 2), &unit(4, 1)).unwrap();
        index
            .upsert(&intent("intent-aaaa-0003", 1.0, 3), &[0.9, 0.1, 0.0, 0.0])
            .unwrap();

        let hits = index.query_top_k(&unit(4, 0), 5, Some("intent-aaaa-0001"));
        // The orthogonal vector falls below the 0.5 floor.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "intent-aaaa-0003");
        assert!(hits[0].1 > 0.9);
    }

    #[test]
    fn ties_break_by_fee_then_timestamp_then_fingerprint() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        let v = unit(4, 0);
        index.upsert(&intent("intent-aaaa-0002", 1.0, 5), &v).unwrap();
        index.upsert(&intent("intent-aaaa-0003", 3.0, 9), &v).unwrap();
        index.upsert(&intent("intent-aaaa-0004", 1.0, 2), &v).unwrap();

        let hits = index.query_top_k(&v, 3, None);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].0, "intent-aaaa-0003"); // highest fee
        assert_eq!(hits[1].0, "intent-aaaa-0004"); // earlier timestamp
        assert_eq!(hits[2].0, "intent-aaaa-0002");
    }

    #[test]
    fn removed_fingerprints_become_tombstones() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        index.upsert(&intent("intent-aaaa-0001", 1.0, 1), &unit(4, 0)).unwrap();
        index.upsert(&intent("intent-aaaa-0002", 1.0, 2), &unit(4, 0)).unwrap();

        assert!(index.remove("intent-aaaa-0002"));
        assert_eq!(index.len(), 1);
        assert_eq!(index.tombstones(), 1);

        let hits = index.query_top_k(&unit(4, 0), 5, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "intent-aaaa-0001");
    }

    #[test]
    fn upsert_remove_upsert_behaves_like_single_upsert() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        let record = intent("intent-aaaa-0001", 1.0, 1);
        index.upsert(&record, &unit(4, 0)).unwrap();
        index.remove("intent-aaaa-0001");
        index.upsert(&record, &unit(4, 0)).unwrap();

        let hits = index.query_top_k(&unit(4, 0), 5, None);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "intent-aaaa-0001");
        assert!(hits[0].1 > 0.99);
    }

    #[test]
    fn save_load_round_trip_preserves_queries() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = test_index(&dir);
            index.upsert(&intent("intent-aaaa-0001", 1.0, 1), &unit(4, 0)).unwrap();
            index
                .upsert(&intent("intent-aaaa-0002", 2.0, 2), &[0.8, 0.2, 0.0, 0.0])
                .unwrap();
            index.upsert(&intent("intent-aaaa-0003", 1.0, 3), &unit(4, 2)).unwrap();
            index.save().unwrap();
        }
        let reloaded = test_index(&dir);
        assert_eq!(reloaded.len(), 3);
        let hits = reloaded.query_top_k(&unit(4, 0), 2, None);
        assert_eq!(hits[0].0, "intent-aaaa-0001");
        assert_eq!(hits[1].0, "intent-aaaa-0002");
    }

    #[test]
    fn corrupt_map_file_is_tolerated() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = test_index(&dir);
            index.upsert(&intent("intent-aaaa-0001", 1.0, 1), &unit(4, 0)).unwrap();
            index.save().unwrap();
        }
        fs::write(dir.path().join("vectors").join(MAP_FILE), b"{not json").unwrap();
        let reloaded = test_index(&dir);
        // Graph survives, map is empty; the index refills as embeddings recur.
        assert_eq!(reloaded.len(), 0);
    }

    #[test]
    fn dimension_change_starts_empty() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = test_index(&dir);
            index.upsert(&intent("intent-aaaa-0001", 1.0, 1), &unit(4, 0)).unwrap();
            index.save().unwrap();
        }
        let reloaded = VectorIndex::initialize(dir.path(), 1_000, 8, 0.5).unwrap();
        assert!(reloaded.is_empty());
    }

    #[test]
    fn rebuild_sheds_tombstones_on_save() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        for i in 0..4 {
            index
                .upsert(&intent(&format!("intent-aaaa-000{i}"), 1.0, i as i64), &unit(4, i))
                .unwrap();
        }
        for i in 0..3 {
            index.remove(&format!("intent-aaaa-000{i}"));
        }
        assert_eq!(index.tombstones(), 3);
        index.save().unwrap();
        assert_eq!(index.tombstones(), 0);
        assert_eq!(index.len(), 1);
        let hits = index.query_top_k(&unit(4, 3), 1, None);
        assert_eq!(hits[0].0, "intent-aaaa-0003");
    }

    #[test]
    fn candidates_respect_floor_distinctness_and_priority() {
        let dir = TempDir::new().unwrap();
        let mut index = test_index(&dir);
        let a = Arc::new(intent("intent-aaaa-0001", 5.0, 1));
        let b = Arc::new(intent("intent-aaaa-0002", 8.0, 2));
        let c = Arc::new(intent("intent-aaaa-0003", 0.0, 3));
        let va = Arc::new(unit(4, 0));
        let vb = Arc::new(vec![0.95f32, 0.05, 0.0, 0.0]);
        let vc = Arc::new(unit(4, 2));
        index.upsert(&a, &va).unwrap();
        index.upsert(&b, &vb).unwrap();
        index.upsert(&c, &vc).unwrap();

        let items = vec![
            (a.clone(), va.clone()),
            (b.clone(), vb.clone()),
            (c.clone(), vc.clone()),
        ];
        let candidates = index.top_alignment_candidates(&items, 20);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert!(candidate.similarity >= 0.5);
        assert_ne!(candidate.a.fingerprint, candidate.b.fingerprint);
        assert_eq!(
            pair_key(&candidate.a.fingerprint, &candidate.b.fingerprint),
            pair_key("intent-aaaa-0001", "intent-aaaa-0002")
        );
    }
}
