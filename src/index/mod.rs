//! Corpus generations and the store that swaps them
//!
//! An `IndexGeneration` owns the chunk texts, their sparse tokens and their
//! dense vectors, all positionally aligned. `IndexStore` builds a complete new
//! generation off to the side and swaps the `Arc` in one step, so readers see
//! either the old generation or the new one, never a mix.

mod snapshot;

pub use snapshot::{
    read_snapshot, snapshot_path, write_snapshot, PersistedSnapshot, SNAPSHOT_FORMAT_VERSION,
};

use crate::embedding::{tokenize, Bm25Params, DenseIndex, EmbeddingProvider, SparseIndex};
use crate::error::{DocqaError, Result};
use crate::workers::WorkerPool;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One slot of the corpus; `index` is its only identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

/// Hash of the embedding model name, the chunk count and every chunk's content
pub fn generation_id(model_name: &str, chunks: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model_name.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(chunks.len() as u64).to_le_bytes());
    for chunk in chunks {
        hasher.update(&(chunk.len() as u64).to_le_bytes());
        hasher.update(chunk.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Split a chunk file into chunk strings
///
/// A file starting with `[` is read as a JSON array of strings; anything else
/// is plain text with chunks separated by blank lines.
pub fn parse_chunk_file(content: &str) -> Result<Vec<String>> {
    let trimmed = content.trim_start();
    if trimmed.starts_with('[') {
        let chunks: Vec<String> = serde_json::from_str(trimmed).map_err(|e| DocqaError::Json {
            source: e,
            context: "Failed to parse chunk array".to_string(),
        })?;
        return Ok(chunks
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect());
    }

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }
    Ok(chunks)
}

/// A fully built, immutable corpus generation
#[derive(Debug)]
pub struct IndexGeneration {
    id: String,
    embedding_model: String,
    chunks: Vec<Chunk>,
    tokens: Vec<Vec<String>>,
    sparse: SparseIndex,
    dense: DenseIndex,
}

impl IndexGeneration {
    /// Generation with no chunks, served until the first rebuild or load
    pub fn empty(embedding_model: &str, dimension: usize, params: Bm25Params) -> Self {
        Self {
            id: String::new(),
            embedding_model: embedding_model.to_string(),
            chunks: Vec::new(),
            tokens: Vec::new(),
            sparse: SparseIndex::empty(params),
            dense: DenseIndex::empty(dimension),
        }
    }

    /// Embed, normalize and tokenize every chunk
    ///
    /// Any embedding failure or count/dimension mismatch aborts the build.
    pub fn build(
        provider: &dyn EmbeddingProvider,
        texts: Vec<String>,
        params: Bm25Params,
        batch_size: usize,
    ) -> Result<Self> {
        let dimension = provider.dimension();
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(batch_size.max(1)) {
            let vectors = provider.embed_batch(batch)?;
            if vectors.len() != batch.len() {
                return Err(crate::embedding::EmbeddingError::GenerationError(format!(
                    "Embedding count mismatch: expected {}, got {}",
                    batch.len(),
                    vectors.len()
                ))
                .into());
            }
            embeddings.extend(vectors);
            debug!("Embedded {}/{} chunks", embeddings.len(), texts.len());
        }

        let dense = DenseIndex::build(&embeddings, dimension)?;
        let tokens: Vec<Vec<String>> = texts.iter().map(|t| tokenize(t)).collect();
        let sparse = SparseIndex::build(&tokens, params);
        let id = generation_id(provider.model_name(), &texts);

        let chunks = texts
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect();

        Ok(Self {
            id,
            embedding_model: provider.model_name().to_string(),
            chunks,
            tokens,
            sparse,
            dense,
        })
    }

    /// Restore from a snapshot after checking it belongs to `model_name`
    pub fn from_snapshot(
        snapshot: PersistedSnapshot,
        model_name: &str,
        dimension: usize,
        params: Bm25Params,
    ) -> Result<Self> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(DocqaError::SnapshotMismatch(format!(
                "format version {} (expected {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if snapshot.embedding_model != model_name {
            return Err(DocqaError::SnapshotMismatch(format!(
                "snapshot model '{}' differs from configured '{}'",
                snapshot.embedding_model, model_name
            )));
        }
        if snapshot.dimension != dimension {
            return Err(DocqaError::SnapshotMismatch(format!(
                "dimension {} differs from configured {}",
                snapshot.dimension, dimension
            )));
        }
        let count = snapshot.chunks.len();
        if snapshot.vector_bits.len() != count || snapshot.tokens.len() != count {
            return Err(DocqaError::SnapshotMismatch(format!(
                "misaligned snapshot: {} chunks, {} vectors, {} token lists",
                count,
                snapshot.vector_bits.len(),
                snapshot.tokens.len()
            )));
        }
        let expected_id = generation_id(model_name, &snapshot.chunks);
        if expected_id != snapshot.generation_id {
            return Err(DocqaError::SnapshotMismatch(
                "generation id does not match snapshot content".to_string(),
            ));
        }

        let dense = DenseIndex::from_normalized(snapshot.vectors(), dimension)
            .map_err(|e| DocqaError::SnapshotMismatch(e.to_string()))?;
        let sparse = SparseIndex::build(&snapshot.tokens, params);
        let chunks = snapshot
            .chunks
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect();

        Ok(Self {
            id: snapshot.generation_id,
            embedding_model: snapshot.embedding_model,
            chunks,
            tokens: snapshot.tokens,
            sparse,
            dense,
        })
    }

    pub fn to_snapshot(&self) -> PersistedSnapshot {
        PersistedSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generation_id: self.id.clone(),
            embedding_model: self.embedding_model.clone(),
            dimension: self.dense.dimension(),
            created_at: chrono::Utc::now(),
            chunks: self.chunks.iter().map(|c| c.text.clone()).collect(),
            vector_bits: PersistedSnapshot::encode_vectors(&self.dense.rows()),
            tokens: self.tokens.clone(),
        }
    }

    /// Empty string for the cold-start generation
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(index)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn sparse(&self) -> &SparseIndex {
        &self.sparse
    }

    pub fn dense(&self) -> &DenseIndex {
        &self.dense
    }
}

/// Result of a rebuild request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RebuildOutcome {
    /// `None` when the request was an empty no-op
    pub generation_id: Option<String>,
    pub indexed: usize,
}

/// Clears the in-progress flag when a rebuild or load ends, however it ends
struct RebuildGuard<'a>(&'a AtomicBool);

impl Drop for RebuildGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of the live corpus generation
pub struct IndexStore {
    provider: Arc<dyn EmbeddingProvider>,
    params: Bm25Params,
    batch_size: usize,
    snapshot_dir: Option<PathBuf>,
    pool: WorkerPool,
    current: RwLock<Arc<IndexGeneration>>,
    rebuilding: AtomicBool,
}

impl IndexStore {
    /// Create a store serving an empty generation
    ///
    /// With `snapshot_dir == None` nothing is persisted.
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        params: Bm25Params,
        batch_size: usize,
        snapshot_dir: Option<PathBuf>,
        pool: WorkerPool,
    ) -> Self {
        let empty = IndexGeneration::empty(provider.model_name(), provider.dimension(), params);
        Self {
            provider,
            params,
            batch_size,
            snapshot_dir,
            pool,
            current: RwLock::new(Arc::new(empty)),
            rebuilding: AtomicBool::new(false),
        }
    }

    /// Handle on the live generation; hold it for the whole query
    pub async fn current(&self) -> Arc<IndexGeneration> {
        self.current.read().await.clone()
    }

    /// Live generation, or `EmptyCorpus` when there is nothing to search
    pub async fn searchable(&self) -> Result<Arc<IndexGeneration>> {
        let generation = self.current().await;
        if generation.is_empty() {
            return Err(DocqaError::EmptyCorpus);
        }
        Ok(generation)
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn is_rebuilding(&self) -> bool {
        self.rebuilding.load(Ordering::Acquire)
    }

    /// Replace the corpus wholesale
    ///
    /// Empty input is a no-op. Concurrent calls are rejected with
    /// `RebuildInProgress`. On failure the previous generation keeps serving.
    pub async fn rebuild(&self, chunks: Vec<String>) -> Result<RebuildOutcome> {
        if chunks.is_empty() {
            info!("Rebuild requested with no chunks; keeping current index");
            return Ok(RebuildOutcome {
                generation_id: None,
                indexed: 0,
            });
        }

        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Rejected rebuild: another rebuild is in progress");
            return Err(DocqaError::RebuildInProgress);
        }
        let _guard = RebuildGuard(&self.rebuilding);

        let start = std::time::Instant::now();
        let count = chunks.len();
        info!("Rebuilding index from {} chunks", count);

        let provider = self.provider.clone();
        let params = self.params;
        let batch_size = self.batch_size;
        let generation = self
            .pool
            .run(move || IndexGeneration::build(provider.as_ref(), chunks, params, batch_size))
            .await??;
        let generation = Arc::new(generation);

        {
            let mut current = self.current.write().await;
            *current = generation.clone();
        }

        info!(
            "Index generation {} live: {} chunks in {}ms",
            generation.id(),
            count,
            start.elapsed().as_millis()
        );

        self.persist(generation.clone()).await;

        Ok(RebuildOutcome {
            generation_id: Some(generation.id().to_string()),
            indexed: count,
        })
    }

    /// Best-effort snapshot write; failures are logged and never undo the swap
    async fn persist(&self, generation: Arc<IndexGeneration>) {
        let Some(dir) = self.snapshot_dir.clone() else {
            return;
        };

        let result = self
            .pool
            .run(move || write_snapshot(&dir, &generation.to_snapshot()))
            .await;

        match result {
            Ok(Ok(path)) => info!("Snapshot written to {}", path.display()),
            Ok(Err(e)) => warn!("Snapshot persistence failed, serving from memory: {}", e),
            Err(e) => warn!("Snapshot persistence task failed: {}", e),
        }
    }

    /// Restore the snapshot for the configured model, if one matches
    ///
    /// Returns the number of restored chunks. Any mismatch or damage is
    /// logged and leaves the store empty until the next rebuild. Skipped
    /// while a rebuild runs, so an older snapshot never replaces its result.
    pub async fn load(&self) -> usize {
        let Some(dir) = self.snapshot_dir.clone() else {
            return 0;
        };

        if self
            .rebuilding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Skipping snapshot load: a rebuild is in progress");
            return 0;
        }
        let _guard = RebuildGuard(&self.rebuilding);

        let model_name = self.provider.model_name().to_string();
        let dimension = self.provider.dimension();
        let params = self.params;

        let restored = self
            .pool
            .run(move || -> Result<Option<IndexGeneration>> {
                match read_snapshot(&dir, &model_name)? {
                    Some(snapshot) => Ok(Some(IndexGeneration::from_snapshot(
                        snapshot,
                        &model_name,
                        dimension,
                        params,
                    )?)),
                    None => Ok(None),
                }
            })
            .await;

        match restored {
            Ok(Ok(Some(generation))) => {
                let count = generation.len();
                info!(
                    "Restored index generation {} ({} chunks)",
                    generation.id(),
                    count
                );
                *self.current.write().await = Arc::new(generation);
                count
            }
            Ok(Ok(None)) => {
                info!("No snapshot for model {}; starting empty", self.provider.model_name());
                0
            }
            Ok(Err(e)) => {
                warn!("Ignoring snapshot, starting empty: {}", e);
                0
            }
            Err(e) => {
                warn!("Snapshot load task failed, starting empty: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingProvider;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_generation_id_depends_on_model_count_and_content() {
        let a = generation_id("m", &texts(&["x", "y"]));
        assert_eq!(a, generation_id("m", &texts(&["x", "y"])));
        assert_ne!(a, generation_id("other", &texts(&["x", "y"])));
        assert_ne!(a, generation_id("m", &texts(&["x"])));
        assert_ne!(a, generation_id("m", &texts(&["xy"])));
        assert_ne!(a, generation_id("m", &texts(&["y", "x"])));
    }

    #[test]
    fn test_parse_chunk_file_formats() {
        let json = parse_chunk_file(r#"[" first ", "", "second"]"#).unwrap();
        assert_eq!(json, texts(&["first", "second"]));

        let plain = parse_chunk_file("line one\nline two\n\n\nnext chunk\n").unwrap();
        assert_eq!(plain, texts(&["line one\nline two", "next chunk"]));

        assert!(parse_chunk_file("").unwrap().is_empty());
        assert!(parse_chunk_file("[not json").is_err());
    }

    #[test]
    fn test_build_keeps_structures_aligned() {
        let provider = HashingProvider::new(64);
        let generation = IndexGeneration::build(
            &provider,
            texts(&["alpha beta", "gamma", "delta epsilon zeta"]),
            Bm25Params::default(),
            2,
        )
        .unwrap();

        assert_eq!(generation.len(), 3);
        assert_eq!(generation.sparse().len(), 3);
        assert_eq!(generation.dense().len(), 3);
        assert_eq!(generation.chunk(2).unwrap().index, 2);
    }

    #[test]
    fn test_snapshot_model_mismatch() {
        let provider = HashingProvider::new(32);
        let generation = IndexGeneration::build(
            &provider,
            texts(&["alpha"]),
            Bm25Params::default(),
            8,
        )
        .unwrap();

        let result = IndexGeneration::from_snapshot(
            generation.to_snapshot(),
            "some-other-model",
            32,
            Bm25Params::default(),
        );
        assert!(matches!(result, Err(DocqaError::SnapshotMismatch(_))));
    }

    #[test]
    fn test_snapshot_tampered_content() {
        let provider = HashingProvider::new(32);
        let generation = IndexGeneration::build(
            &provider,
            texts(&["alpha", "beta"]),
            Bm25Params::default(),
            8,
        )
        .unwrap();

        let mut snapshot = generation.to_snapshot();
        snapshot.chunks[1] = "changed".to_string();
        let result =
            IndexGeneration::from_snapshot(snapshot, provider.model_name(), 32, Bm25Params::default());
        assert!(matches!(result, Err(DocqaError::SnapshotMismatch(_))));
    }

    #[tokio::test]
    async fn test_empty_rebuild_is_noop() {
        let store = IndexStore::new(
            Arc::new(HashingProvider::new(16)),
            Bm25Params::default(),
            8,
            None,
            WorkerPool::new(2),
        );

        let outcome = store.rebuild(Vec::new()).await.unwrap();
        assert_eq!(outcome.indexed, 0);
        assert!(outcome.generation_id.is_none());
        assert!(store.current().await.is_empty());
    }

    #[tokio::test]
    async fn test_searchable_reports_empty_corpus() {
        let store = IndexStore::new(
            Arc::new(HashingProvider::new(16)),
            Bm25Params::default(),
            8,
            None,
            WorkerPool::new(2),
        );
        assert!(matches!(store.searchable().await, Err(DocqaError::EmptyCorpus)));

        store.rebuild(texts(&["one"])).await.unwrap();
        assert_eq!(store.searchable().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_load_skipped_during_rebuild() {
        let temp = tempfile::TempDir::new().unwrap();
        let open = || {
            IndexStore::new(
                Arc::new(HashingProvider::new(16)),
                Bm25Params::default(),
                8,
                Some(temp.path().to_path_buf()),
                WorkerPool::new(2),
            )
        };
        open().rebuild(texts(&["one", "two"])).await.unwrap();

        let store = open();
        store.rebuilding.store(true, Ordering::Release);
        assert_eq!(store.load().await, 0);
        assert!(store.current().await.is_empty());
        assert!(store.is_rebuilding());

        store.rebuilding.store(false, Ordering::Release);
        assert_eq!(store.load().await, 2);
        assert!(!store.is_rebuilding());
    }

    #[tokio::test]
    async fn test_rebuild_swaps_generation() {
        let store = IndexStore::new(
            Arc::new(HashingProvider::new(16)),
            Bm25Params::default(),
            8,
            None,
            WorkerPool::new(2),
        );

        let before = store.current().await;
        let outcome = store.rebuild(texts(&["one", "two"])).await.unwrap();
        let after = store.current().await;

        assert_eq!(outcome.indexed, 2);
        assert!(before.is_empty());
        assert_eq!(after.len(), 2);
        assert_eq!(Some(after.id().to_string()), outcome.generation_id);
        assert!(!store.is_rebuilding());
    }
}
