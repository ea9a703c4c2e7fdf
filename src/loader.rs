//! Cache-then-network loading of gene expression rows.

use crate::array::{ArrayBackend, RowArray};
use crate::cache::ExpressionCache;
use crate::error::{CacheError, LoadError, Result};
use crate::expression::ExpressionVector;
use crate::store::DataStore;
use futures::future::join_all;
use log::{debug, info, warn};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

pub const DEFAULT_STRAIN: &str = "wildtype";

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Strain used initially and as the manifest fallback.
    pub default_strain: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            default_strain: DEFAULT_STRAIN.to_string(),
        }
    }
}

/// The active strain. Scopes both the array handles and the cache keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrainContext {
    strain: String,
}

impl StrainContext {
    pub fn new(strain: impl Into<String>) -> Self {
        StrainContext {
            strain: strain.into(),
        }
    }

    pub fn strain(&self) -> &str {
        &self.strain
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub cached_count: usize,
}

/// Result of a batched load: the genes that resolved plus the ones that did not.
#[derive(Debug, Clone, Default)]
pub struct BatchLoad {
    pub data: FxHashMap<usize, ExpressionVector>,
    pub failed_indices: Vec<usize>,
}

/// Generation counter used to discard results of superseded requests.
#[derive(Debug, Default)]
pub struct RequestFence {
    latest: AtomicU64,
}

impl RequestFence {
    /// Start a new generation; every earlier one becomes stale.
    pub fn begin(&self) -> u64 {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.latest.load(Ordering::SeqCst) == generation
    }
}

struct Handles<B: ArrayBackend> {
    store: Option<Arc<B::Store>>,
    array: Option<Arc<B::Array>>,
}

impl<B: ArrayBackend> Default for Handles<B> {
    fn default() -> Self {
        Handles {
            store: None,
            array: None,
        }
    }
}

type CacheKey = (String, usize);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The one place cache failures are handled: log and fall back to a miss.
fn soft<T: Default>(op: &str, result: std::result::Result<T, CacheError>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("cache {} failed, continuing without cache: {}", op, e);
            T::default()
        }
    }
}

pub struct ExpressionLoader<B: ArrayBackend, C: ExpressionCache> {
    backend: Arc<B>,
    cache: Arc<C>,
    context: StrainContext,
    handles: Mutex<Handles<B>>,
    /// Vectors handed to the cache whose write has not finished yet.
    pending: Arc<Mutex<FxHashMap<CacheKey, ExpressionVector>>>,
    writes: Mutex<Vec<JoinHandle<()>>>,
    fence: RequestFence,
}

impl<B: ArrayBackend, C: ExpressionCache> ExpressionLoader<B, C> {
    pub fn new(backend: B, cache: C, config: &LoaderConfig) -> Self {
        ExpressionLoader {
            backend: Arc::new(backend),
            cache: Arc::new(cache),
            context: StrainContext::new(config.default_strain.clone()),
            handles: Mutex::new(Handles::default()),
            pending: Arc::new(Mutex::new(FxHashMap::default())),
            writes: Mutex::new(Vec::new()),
            fence: RequestFence::default(),
        }
    }

    pub fn strain(&self) -> &str {
        self.context.strain()
    }

    /// Switch the active strain. Drops the array handles so they are
    /// re-acquired lazily; the persistent cache is left alone.
    pub fn set_strain(&mut self, strain: &str) {
        if self.context.strain() == strain {
            return;
        }
        info!("Switching strain {} -> {}", self.context.strain(), strain);
        self.context = StrainContext::new(strain);
        *lock(&self.handles) = Handles::default();
    }

    /// Current array handle, opening the store and array if needed.
    ///
    /// Concurrent callers may both open the array; the first one stored wins.
    async fn array(&self) -> Result<Arc<B::Array>> {
        let store = {
            let mut handles = lock(&self.handles);
            if let Some(array) = &handles.array {
                return Ok(Arc::clone(array));
            }
            let strain = self.context.strain();
            let backend = &self.backend;
            Arc::clone(
                handles
                    .store
                    .get_or_insert_with(|| Arc::new(backend.open_store(strain))),
            )
        };
        let array = Arc::new(self.backend.open_array(&store).await?);
        debug!(
            "Opened expression array for {} ({} genes x {} cells)",
            self.context.strain(),
            array.gene_count(),
            array.cell_count()
        );
        let mut handles = lock(&self.handles);
        Ok(Arc::clone(handles.array.get_or_insert(array)))
    }

    async fn run_cache<T, F>(&self, op: F) -> std::result::Result<T, CacheError>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> std::result::Result<T, CacheError> + Send + 'static,
    {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || op(&cache))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }

    async fn cached(&self, gene: usize) -> Option<ExpressionVector> {
        let key = (self.context.strain().to_string(), gene);
        if let Some(vector) = lock(&*self.pending).get(&key) {
            return Some(vector.clone());
        }
        let (strain, index) = key;
        let hit = soft(
            "read",
            self.run_cache(move |cache| cache.get(&strain, index)).await,
        );
        hit.map(ExpressionVector::from)
    }

    /// Hand a fetched vector to the cache without waiting for the write.
    fn persist(&self, gene: usize, vector: ExpressionVector) {
        let key = (self.context.strain().to_string(), gene);
        lock(&*self.pending).insert(key.clone(), vector.clone());

        let cache = Arc::clone(&self.cache);
        let pending = Arc::clone(&self.pending);
        let handle = tokio::task::spawn_blocking(move || {
            soft("write", cache.put(&key.0, key.1, &vector));
            lock(&*pending).remove(&key);
        });

        let mut writes = lock(&self.writes);
        writes.retain(|h| !h.is_finished());
        writes.push(handle);
    }

    async fn fetch(&self, gene: usize) -> Result<ExpressionVector> {
        let array = self.array().await?;
        let payload = array.fetch_row(gene).await?;
        let values = payload.into_values()?;
        if values.len() != array.cell_count() {
            return Err(LoadError::Decode(format!(
                "gene {} has {} values, expected {} cells",
                gene,
                values.len(),
                array.cell_count()
            )));
        }
        debug!("fetched gene {} for {}", gene, self.context.strain());
        let vector = ExpressionVector::from(values);
        self.persist(gene, vector.clone());
        Ok(vector)
    }

    /// Load one gene row, from the cache when possible.
    pub async fn load_gene_expression(&self, gene: usize) -> Result<ExpressionVector> {
        if let Some(hit) = self.cached(gene).await {
            debug!("cache hit for gene {} ({})", gene, self.context.strain());
            return Ok(hit);
        }
        self.fetch(gene).await
    }

    /// Load several genes concurrently, tolerating partial failure.
    ///
    /// Fails only when every gene that had to be fetched failed.
    pub async fn load_multiple_genes_expression(&self, indices: &[usize]) -> Result<BatchLoad> {
        let mut seen = FxHashSet::default();
        let unique: Vec<usize> = indices.iter().copied().filter(|g| seen.insert(*g)).collect();

        let lookups = join_all(
            unique
                .iter()
                .map(|&gene| async move { (gene, self.cached(gene).await) }),
        )
        .await;

        let mut batch = BatchLoad::default();
        let mut misses = Vec::new();
        for (gene, hit) in lookups {
            match hit {
                Some(vector) => {
                    batch.data.insert(gene, vector);
                }
                None => misses.push(gene),
            }
        }
        debug!(
            "{} of {} genes cached for {}",
            batch.data.len(),
            unique.len(),
            self.context.strain()
        );

        let fetched = join_all(
            misses
                .iter()
                .map(|&gene| async move { (gene, self.fetch(gene).await) }),
        )
        .await;
        for (gene, result) in fetched {
            match result {
                Ok(vector) => {
                    batch.data.insert(gene, vector);
                }
                Err(e) => {
                    warn!("{}", e);
                    batch.failed_indices.push(gene);
                }
            }
        }

        if !misses.is_empty() && batch.failed_indices.len() == misses.len() {
            return Err(LoadError::AllFetchesFailed {
                failed_indices: batch.failed_indices,
            });
        }
        Ok(batch)
    }

    /// Load the genes for a new display selection.
    ///
    /// Returns `None` when another selection was started before this one
    /// resolved; its result (or error) is discarded.
    pub async fn load_for_display(&self, indices: &[usize]) -> Result<Option<BatchLoad>> {
        let generation = self.fence.begin();
        let result = self.load_multiple_genes_expression(indices).await;
        if !self.fence.is_current(generation) {
            debug!("discarding stale expression request {}", generation);
            return Ok(None);
        }
        result.map(Some)
    }

    /// Empty the cache. Outstanding writes land first so none of them can
    /// re-create a cleared entry.
    pub async fn clear_cache(&self) {
        self.flush().await;
        lock(&*self.pending).clear();
        soft("clear", self.run_cache(|cache| cache.clear()).await);
    }

    pub async fn cache_stats(&self) -> CacheStats {
        CacheStats {
            cached_count: soft("count", self.run_cache(|cache| cache.count()).await),
        }
    }

    /// Wait for every outstanding cache write.
    pub async fn flush(&self) {
        let handles = std::mem::take(&mut *lock(&self.writes));
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("cache write task failed: {}", e);
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Manifest {
    List(Vec<String>),
    Wrapped { strains: Vec<String> },
}

/// Read `strains.json`, falling back to `[default_strain]` on any failure.
pub async fn list_available_strains(store: &DataStore, default_strain: &str) -> Vec<String> {
    match store.get_json::<Manifest>("strains.json").await {
        Ok(Manifest::List(strains)) | Ok(Manifest::Wrapped { strains }) if !strains.is_empty() => {
            strains
        }
        Ok(_) => {
            warn!("strain manifest is empty, using '{}'", default_strain);
            vec![default_strain.to_string()]
        }
        Err(e) => {
            warn!("strain manifest unavailable ({}), using '{}'", e, default_strain);
            vec![default_strain.to_string()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{RowPayload, ZarrBackend};
    use crate::cache::{DiskCache, MemoryCache};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    const CELLS: usize = 4;

    #[derive(Default)]
    struct MockState {
        fetches: AtomicUsize,
        opens: AtomicUsize,
        failing: Mutex<FxHashSet<usize>>,
        delays_ms: Mutex<FxHashMap<usize, u64>>,
    }

    struct MockBackend {
        state: Arc<MockState>,
    }

    struct MockArray {
        strain: String,
        state: Arc<MockState>,
    }

    impl RowArray for MockArray {
        fn gene_count(&self) -> usize {
            100
        }

        fn cell_count(&self) -> usize {
            CELLS
        }

        async fn fetch_row(&self, row: usize) -> Result<RowPayload> {
            self.state.fetches.fetch_add(1, Ordering::SeqCst);
            let delay = lock(&self.state.delays_ms).get(&row).copied();
            if let Some(ms) = delay {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            if lock(&self.state.failing).contains(&row) {
                return Err(LoadError::gene(row, "injected failure"));
            }
            if row == 99 {
                return Ok(RowPayload::Scalar(1.0));
            }
            let base = if self.strain == "mutant" { 100.0 } else { 0.0 };
            let value = base + row as f32;
            match row % 3 {
                0 => Ok(RowPayload::Flat(vec![value; CELLS])),
                1 => Ok(RowPayload::Nested(vec![vec![value; CELLS]])),
                _ => Ok(RowPayload::Wrapped {
                    data: vec![value; CELLS],
                    shape: vec![1, CELLS],
                }),
            }
        }
    }

    impl ArrayBackend for MockBackend {
        type Store = String;
        type Array = MockArray;

        fn open_store(&self, strain: &str) -> String {
            strain.to_string()
        }

        async fn open_array(&self, store: &String) -> Result<MockArray> {
            self.state.opens.fetch_add(1, Ordering::SeqCst);
            Ok(MockArray {
                strain: store.clone(),
                state: Arc::clone(&self.state),
            })
        }
    }

    fn mock_loader() -> (ExpressionLoader<MockBackend, MemoryCache>, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let backend = MockBackend {
            state: Arc::clone(&state),
        };
        let loader = ExpressionLoader::new(backend, MemoryCache::new(), &LoaderConfig::default());
        (loader, state)
    }

    struct BrokenCache;

    impl ExpressionCache for BrokenCache {
        fn get(&self, _: &str, _: usize) -> std::result::Result<Option<Vec<f32>>, CacheError> {
            Err(CacheError::Corrupt("unreadable".to_string()))
        }
        fn put(&self, _: &str, _: usize, _: &[f32]) -> std::result::Result<(), CacheError> {
            Err(CacheError::Corrupt("read-only".to_string()))
        }
        fn clear(&self) -> std::result::Result<(), CacheError> {
            Err(CacheError::Corrupt("read-only".to_string()))
        }
        fn count(&self) -> std::result::Result<usize, CacheError> {
            Err(CacheError::Corrupt("unreadable".to_string()))
        }
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let (loader, state) = mock_loader();
        let first = loader.load_gene_expression(5).await.unwrap();
        let second = loader.load_gene_expression(5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(*first, [5.0; CELLS]);
        assert_eq!(state.fetches.load(Ordering::SeqCst), 1);

        loader.flush().await;
        assert_eq!(loader.cache_stats().await.cached_count, 1);
        loader.load_gene_expression(5).await.unwrap();
        assert_eq!(state.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn strain_switch_uses_a_separate_key_space() {
        let (mut loader, state) = mock_loader();
        loader.load_gene_expression(2).await.unwrap();
        loader.flush().await;
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);

        loader.set_strain("mutant");
        let mutant = loader.load_gene_expression(2).await.unwrap();
        assert_eq!(*mutant, [102.0; CELLS]);
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(state.opens.load(Ordering::SeqCst), 2);

        // Switching back finds the original entry still cached.
        loader.flush().await;
        loader.set_strain(DEFAULT_STRAIN);
        let wildtype = loader.load_gene_expression(2).await.unwrap();
        assert_eq!(*wildtype, [2.0; CELLS]);
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(loader.cache_stats().await.cached_count, 2);
    }

    #[tokio::test]
    async fn set_strain_to_same_value_keeps_handles() {
        let (mut loader, state) = mock_loader();
        loader.load_gene_expression(0).await.unwrap();
        loader.set_strain(DEFAULT_STRAIN);
        loader.load_gene_expression(1).await.unwrap();
        assert_eq!(state.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scalar_payload_is_a_decode_error() {
        let (loader, _) = mock_loader();
        assert!(matches!(
            loader.load_gene_expression(99).await,
            Err(LoadError::Decode(_))
        ));
        assert_eq!(loader.cache_stats().await.cached_count, 0);
    }

    #[tokio::test]
    async fn batch_reports_partial_failures() {
        let (loader, state) = mock_loader();
        lock(&state.failing).insert(1);

        let batch = loader.load_multiple_genes_expression(&[0, 1]).await.unwrap();
        assert_eq!(batch.data.len(), 1);
        assert_eq!(*batch.data[&0], [0.0; CELLS]);
        assert_eq!(batch.failed_indices, vec![1]);
    }

    #[tokio::test]
    async fn batch_fails_when_every_fetch_fails() {
        let (loader, state) = mock_loader();
        lock(&state.failing).extend([0, 1]);

        match loader.load_multiple_genes_expression(&[0, 1]).await {
            Err(LoadError::AllFetchesFailed { mut failed_indices }) => {
                failed_indices.sort_unstable();
                assert_eq!(failed_indices, vec![0, 1]);
            }
            other => panic!("expected AllFetchesFailed, got {:?}", other.map(|b| b.data.len())),
        }
    }

    #[tokio::test]
    async fn batch_mixes_cached_and_fetched_genes() {
        let (loader, state) = mock_loader();
        loader.load_gene_expression(0).await.unwrap();
        lock(&state.failing).insert(1);

        let batch = loader.load_multiple_genes_expression(&[0, 1, 2, 0]).await.unwrap();
        assert!(batch.data.contains_key(&0));
        assert!(batch.data.contains_key(&2));
        assert_eq!(batch.failed_indices, vec![1]);
        assert_eq!(state.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cache_hits_do_not_mask_a_total_fetch_failure() {
        let (loader, state) = mock_loader();
        loader.load_gene_expression(0).await.unwrap();
        lock(&state.failing).insert(1);

        assert!(matches!(
            loader.load_multiple_genes_expression(&[0, 1]).await,
            Err(LoadError::AllFetchesFailed { ref failed_indices }) if failed_indices == &[1]
        ));
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let (loader, _) = mock_loader();
        let batch = loader.load_multiple_genes_expression(&[]).await.unwrap();
        assert!(batch.data.is_empty());
        assert!(batch.failed_indices.is_empty());
    }

    #[tokio::test]
    async fn superseded_display_requests_are_discarded() {
        let (loader, state) = mock_loader();
        lock(&state.delays_ms).insert(0, 50);

        let (first, second) = tokio::join!(loader.load_for_display(&[0]), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            loader.load_for_display(&[1]).await
        });
        assert!(first.unwrap().is_none());
        let second = second.unwrap().expect("latest request resolves");
        assert!(second.data.contains_key(&1));
    }

    #[tokio::test]
    async fn broken_cache_never_fails_a_load() {
        let state = Arc::new(MockState::default());
        let backend = MockBackend {
            state: Arc::clone(&state),
        };
        let loader = ExpressionLoader::new(backend, BrokenCache, &LoaderConfig::default());

        let vector = loader.load_gene_expression(3).await.unwrap();
        assert_eq!(*vector, [3.0; CELLS]);
        loader.flush().await;
        assert_eq!(loader.cache_stats().await.cached_count, 0);
        loader.clear_cache().await;

        loader.load_gene_expression(3).await.unwrap();
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    }

    /// Memory cache whose writes take a while to land.
    struct SlowCache {
        inner: MemoryCache,
    }

    impl ExpressionCache for SlowCache {
        fn get(
            &self,
            strain: &str,
            gene: usize,
        ) -> std::result::Result<Option<Vec<f32>>, CacheError> {
            self.inner.get(strain, gene)
        }
        fn put(
            &self,
            strain: &str,
            gene: usize,
            values: &[f32],
        ) -> std::result::Result<(), CacheError> {
            std::thread::sleep(Duration::from_millis(100));
            self.inner.put(strain, gene, values)
        }
        fn clear(&self) -> std::result::Result<(), CacheError> {
            self.inner.clear()
        }
        fn count(&self) -> std::result::Result<usize, CacheError> {
            self.inner.count()
        }
    }

    #[tokio::test]
    async fn clear_waits_for_in_flight_writes() {
        let state = Arc::new(MockState::default());
        let backend = MockBackend {
            state: Arc::clone(&state),
        };
        let cache = SlowCache {
            inner: MemoryCache::new(),
        };
        let loader = ExpressionLoader::new(backend, cache, &LoaderConfig::default());

        loader.load_gene_expression(4).await.unwrap();
        loader.clear_cache().await;
        loader.flush().await;
        assert_eq!(loader.cache_stats().await.cached_count, 0);

        loader.load_gene_expression(4).await.unwrap();
        assert_eq!(state.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zarr_backend_with_disk_cache() {
        let td = tempdir().unwrap();
        let rows = vec![vec![0.0, 1.0, 0.0], vec![2.0, 0.0, 3.0]];
        crate::array::tests::write_expression(td.path(), "wt", &rows, false);
        let store = DataStore::new(td.path().to_str().unwrap());
        let config = LoaderConfig {
            default_strain: "wt".to_string(),
        };
        let loader = ExpressionLoader::new(
            ZarrBackend::new(store),
            DiskCache::new(td.path().join("cache")),
            &config,
        );

        let batch = loader.load_multiple_genes_expression(&[0, 1, 7]).await.unwrap();
        assert_eq!(*batch.data[&1], [2.0, 0.0, 3.0]);
        assert_eq!(batch.failed_indices, vec![7]);
        loader.flush().await;
        assert_eq!(loader.cache_stats().await.cached_count, 2);

        // Remove the remote array: cached rows still load.
        std::fs::remove_dir_all(td.path().join("wt/arrays")).unwrap();
        let reloaded = loader.load_gene_expression(0).await.unwrap();
        assert_eq!(*reloaded, [0.0, 1.0, 0.0]);

        loader.clear_cache().await;
        assert_eq!(loader.cache_stats().await.cached_count, 0);
    }

    #[tokio::test]
    async fn manifest_falls_back_to_default_strain() {
        let td = tempdir().unwrap();
        let store = DataStore::new(td.path().to_str().unwrap());
        assert_eq!(list_available_strains(&store, "wt").await, vec!["wt"]);

        std::fs::write(td.path().join("strains.json"), "{broken").unwrap();
        assert_eq!(list_available_strains(&store, "wt").await, vec!["wt"]);

        std::fs::write(td.path().join("strains.json"), "[]").unwrap();
        assert_eq!(list_available_strains(&store, "wt").await, vec!["wt"]);

        std::fs::write(td.path().join("strains.json"), r#"["wt","mutant"]"#).unwrap();
        assert_eq!(list_available_strains(&store, "wt").await, vec!["wt", "mutant"]);

        std::fs::write(td.path().join("strains.json"), r#"{"strains":["a"]}"#).unwrap();
        assert_eq!(list_available_strains(&store, "wt").await, vec!["a"]);
    }
}
