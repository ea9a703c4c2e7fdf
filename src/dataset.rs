//! Per-strain metadata: gene names, cell annotations and the 2D embedding.

use crate::error::{LoadError, Result};
use crate::store::DataStore;
use log::info;
use rustc_hash::FxHashMap;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatasetInfo {
    pub strain: String,
    #[serde(rename = "n_genes")]
    pub gene_count: usize,
    #[serde(rename = "n_cells")]
    pub cell_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UmapCoord {
    pub x: f64,
    pub y: f64,
}

/// One cell positioned in data space.
#[derive(Debug, Clone, PartialEq)]
pub struct ScatterPoint {
    pub id: usize,
    pub x: f64,
    pub y: f64,
    pub tag: String,
    pub time: Option<String>,
    pub cell_type: Option<String>,
}

/// Immutable snapshot of one strain's metadata.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub gene_ids: Vec<String>,
    pub gene_symbols: Vec<String>,
    pub cell_tags: Vec<String>,
    pub cell_times: Vec<Option<String>>,
    pub cell_types: Vec<Option<String>>,
    pub umap: Vec<UmapCoord>,
    pub info: DatasetInfo,
    id_index: FxHashMap<String, usize>,
    symbol_index: FxHashMap<String, usize>,
}

impl Dataset {
    /// Assemble a dataset, checking that per-gene and per-cell arrays agree
    /// with `info`.
    pub fn from_parts(
        gene_ids: Vec<String>,
        gene_symbols: Vec<String>,
        cell_tags: Vec<String>,
        cell_times: Vec<Option<String>>,
        cell_types: Vec<Option<String>>,
        umap: Vec<UmapCoord>,
        info: DatasetInfo,
    ) -> Result<Self> {
        let genes = info.gene_count;
        let cells = info.cell_count;
        for (document, len, expected) in [
            ("genes/names.json", gene_ids.len(), genes),
            ("genes/symbols.json", gene_symbols.len(), genes),
            ("cells/tags.json", cell_tags.len(), cells),
            ("cells/time.json", cell_times.len(), cells),
            ("cells/type.json", cell_types.len(), cells),
            ("cells/umap.json", umap.len(), cells),
        ] {
            if len != expected {
                return Err(LoadError::metadata(
                    document,
                    format!("{} entries, info.json declares {}", len, expected),
                ));
            }
        }

        let mut id_index = FxHashMap::default();
        for (i, id) in gene_ids.iter().enumerate() {
            id_index.entry(id.clone()).or_insert(i);
        }
        let mut symbol_index = FxHashMap::default();
        for (i, symbol) in gene_symbols.iter().enumerate() {
            symbol_index.entry(symbol.to_lowercase()).or_insert(i);
        }

        Ok(Dataset {
            gene_ids,
            gene_symbols,
            cell_tags,
            cell_times,
            cell_types,
            umap,
            info,
            id_index,
            symbol_index,
        })
    }

    /// Load every metadata document for `strain` from `store`.
    pub async fn load(store: &DataStore, strain: &str) -> Result<Self> {
        info!("Loading dataset '{}' from {}", strain, store.describe());

        let doc = |name: &str| format!("{}/{}", strain, name);
        let fetch_strings = |name: &'static str| {
            let path = doc(name);
            async move {
                store
                    .get_json::<Vec<String>>(&path)
                    .await
                    .map_err(|e| LoadError::metadata(path.clone(), e))
            }
        };
        let fetch_optional = |name: &'static str| {
            let path = doc(name);
            async move {
                store
                    .get_json::<Vec<Option<String>>>(&path)
                    .await
                    .map_err(|e| LoadError::metadata(path.clone(), e))
            }
        };
        let umap_path = doc("cells/umap.json");
        let info_path = doc("info.json");

        let (gene_ids, gene_symbols, cell_tags, cell_times, cell_types, umap, info) =
            tokio::try_join!(
                fetch_strings("genes/names.json"),
                fetch_strings("genes/symbols.json"),
                fetch_strings("cells/tags.json"),
                fetch_optional("cells/time.json"),
                fetch_optional("cells/type.json"),
                async {
                    store
                        .get_json::<Vec<[f64; 2]>>(&umap_path)
                        .await
                        .map_err(|e| LoadError::metadata(umap_path.clone(), e))
                },
                async {
                    store
                        .get_json::<DatasetInfo>(&info_path)
                        .await
                        .map_err(|e| LoadError::metadata(info_path.clone(), e))
                },
            )?;

        let umap = umap.into_iter().map(|[x, y]| UmapCoord { x, y }).collect();
        let dataset = Dataset::from_parts(
            gene_ids,
            gene_symbols,
            cell_tags,
            cell_times,
            cell_types,
            umap,
            info,
        )
        .map_err(|e| match e {
            LoadError::MetadataFetch { document, reason } => LoadError::MetadataFetch {
                document: doc(&document),
                reason,
            },
            other => other,
        })?;
        info!(
            "Dataset '{}': {} genes, {} cells",
            dataset.info.strain, dataset.info.gene_count, dataset.info.cell_count
        );
        Ok(dataset)
    }

    pub fn cell_count(&self) -> usize {
        self.info.cell_count
    }

    pub fn gene_count(&self) -> usize {
        self.info.gene_count
    }

    /// Resolve a gene id (exact) or symbol (case-insensitive) to its row.
    pub fn gene_index(&self, id_or_symbol: &str) -> Option<usize> {
        self.id_index
            .get(id_or_symbol)
            .or_else(|| self.symbol_index.get(&id_or_symbol.to_lowercase()))
            .copied()
    }

    pub fn gene_symbol(&self, index: usize) -> Option<&str> {
        self.gene_symbols.get(index).map(String::as_str)
    }

    /// Derive the scatter points, one per cell, in cell order.
    pub fn points(&self) -> Vec<ScatterPoint> {
        self.umap
            .iter()
            .enumerate()
            .map(|(i, coord)| ScatterPoint {
                id: i,
                x: coord.x,
                y: coord.y,
                tag: self.cell_tags[i].clone(),
                time: self.cell_times[i].clone(),
                cell_type: self.cell_types[i].clone(),
            })
            .collect()
    }
}
