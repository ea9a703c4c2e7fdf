//! Row-chunked remote expression array (Zarr v2 layout, one gene per chunk).

use crate::error::{LoadError, Result};
use crate::store::DataStore;
use flate2::read::{GzDecoder, ZlibDecoder};
use log::debug;
use serde::Deserialize;
use std::future::Future;
use std::io::Read;

/// A row as handed back by an array client, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPayload {
    /// Values plus the logical shape of the block they came from.
    Wrapped { data: Vec<f32>, shape: Vec<usize> },
    Nested(Vec<Vec<f32>>),
    Flat(Vec<f32>),
    Scalar(f32),
}

impl RowPayload {
    /// Collapse the payload into one flat vector of values.
    pub fn into_values(self) -> Result<Vec<f32>> {
        match self {
            RowPayload::Wrapped { data, shape } => {
                let expected: usize = shape.iter().product();
                if expected != data.len() {
                    return Err(LoadError::Decode(format!(
                        "shape {:?} does not match {} values",
                        shape,
                        data.len()
                    )));
                }
                if shape.iter().filter(|&&d| d > 1).count() > 1 {
                    return Err(LoadError::Decode(format!("shape {:?} is not a single row", shape)));
                }
                Ok(data)
            }
            RowPayload::Nested(rows) => Ok(rows.into_iter().flatten().collect()),
            RowPayload::Flat(values) => Ok(values),
            RowPayload::Scalar(v) => Err(LoadError::Decode(format!("scalar payload {}", v))),
        }
    }
}

/// An opened array whose rows can be fetched independently.
pub trait RowArray: Send + Sync + 'static {
    fn gene_count(&self) -> usize;
    fn cell_count(&self) -> usize;
    fn fetch_row(&self, row: usize) -> impl Future<Output = Result<RowPayload>> + Send;
}

/// Opens strain-scoped array handles.
///
/// Two handles are involved: a cheap strain-scoped store and the array opened
/// from it (which reads metadata). The loader caches both until the strain
/// changes.
pub trait ArrayBackend: Send + Sync + 'static {
    type Store: Send + Sync + 'static;
    type Array: RowArray;

    fn open_store(&self, strain: &str) -> Self::Store;
    fn open_array(&self, store: &Self::Store) -> impl Future<Output = Result<Self::Array>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Int,
    UInt,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dtype {
    kind: Kind,
    size: usize,
    big_endian: bool,
}

impl Dtype {
    fn parse(raw: &str) -> Result<Self> {
        let bytes = raw.as_bytes();
        if bytes.len() < 3 {
            return Err(LoadError::Decode(format!("unsupported dtype {}", raw)));
        }
        let big_endian = match bytes[0] {
            b'<' | b'|' => false,
            b'>' => true,
            _ => return Err(LoadError::Decode(format!("unsupported dtype {}", raw))),
        };
        let kind = match bytes[1] {
            b'i' => Kind::Int,
            b'u' => Kind::UInt,
            b'f' => Kind::Float,
            _ => return Err(LoadError::Decode(format!("unsupported dtype {}", raw))),
        };
        let size: usize = raw[2..]
            .parse()
            .map_err(|_| LoadError::Decode(format!("unsupported dtype {}", raw)))?;
        let valid = match kind {
            Kind::Float => matches!(size, 4 | 8),
            _ => matches!(size, 1 | 2 | 4 | 8),
        };
        if !valid {
            return Err(LoadError::Decode(format!("unsupported dtype {}", raw)));
        }
        Ok(Dtype { kind, size, big_endian })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<f32>> {
        if bytes.len() % self.size != 0 {
            return Err(LoadError::Decode(format!(
                "{} bytes is not a multiple of element size {}",
                bytes.len(),
                self.size
            )));
        }
        let values = bytes
            .chunks_exact(self.size)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf[..self.size].copy_from_slice(chunk);
                if self.big_endian {
                    buf[..self.size].reverse();
                }
                match (self.kind, self.size) {
                    (Kind::Float, 4) => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
                    (Kind::Float, _) => f64::from_le_bytes(buf) as f32,
                    (Kind::Int, 1) => buf[0] as i8 as f32,
                    (Kind::Int, 2) => i16::from_le_bytes([buf[0], buf[1]]) as f32,
                    (Kind::Int, 4) => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f32,
                    (Kind::Int, _) => i64::from_le_bytes(buf) as f32,
                    (Kind::UInt, 1) => buf[0] as f32,
                    (Kind::UInt, 2) => u16::from_le_bytes([buf[0], buf[1]]) as f32,
                    (Kind::UInt, 4) => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f32,
                    (Kind::UInt, _) => u64::from_le_bytes(buf) as f32,
                }
            })
            .collect();
        Ok(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Raw,
    Gzip,
    Zlib,
}

impl Codec {
    fn inflate(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let result = match self {
            Codec::Raw => return Ok(bytes),
            Codec::Gzip => GzDecoder::new(bytes.as_slice()).read_to_end(&mut out),
            Codec::Zlib => ZlibDecoder::new(bytes.as_slice()).read_to_end(&mut out),
        };
        result.map_err(|e| LoadError::Decode(format!("chunk decompression failed: {}", e)))?;
        Ok(out)
    }
}

#[derive(Debug, Deserialize)]
struct CompressorMeta {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ZarrMeta {
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    compressor: Option<CompressorMeta>,
    #[serde(default)]
    dimension_separator: Option<String>,
}

/// A genes x cells Zarr v2 array chunked by row.
#[derive(Clone)]
pub struct ZarrArray {
    store: DataStore,
    path: String,
    genes: usize,
    cells: usize,
    chunk_cells: usize,
    dtype: Dtype,
    codec: Codec,
    separator: char,
}

impl ZarrArray {
    /// Read `{path}/.zarray` and validate that the layout is one gene per chunk.
    pub async fn open(store: DataStore, path: &str) -> Result<Self> {
        let meta_path = format!("{}/.zarray", path);
        let meta: ZarrMeta = store
            .get_json(&meta_path)
            .await
            .map_err(|e| LoadError::metadata(meta_path.clone(), e))?;

        if meta.shape.len() != 2 || meta.chunks.len() != 2 {
            return Err(LoadError::Decode(format!(
                "expected a 2D array, got shape {:?}",
                meta.shape
            )));
        }
        if meta.chunks[0] != 1 || meta.chunks[1] < meta.shape[1] {
            return Err(LoadError::Decode(format!(
                "chunks {:?} do not hold one full gene row each",
                meta.chunks
            )));
        }
        let dtype = Dtype::parse(&meta.dtype)?;
        let codec = match meta.compressor.as_ref().map(|c| c.id.as_str()) {
            None => Codec::Raw,
            Some("gzip") => Codec::Gzip,
            Some("zlib") => Codec::Zlib,
            Some(other) => {
                return Err(LoadError::Decode(format!("unsupported compressor {}", other)))
            }
        };
        let separator = match meta.dimension_separator.as_deref() {
            Some("/") => '/',
            _ => '.',
        };
        debug!(
            "Opened {} ({} x {}, {}, {:?})",
            path, meta.shape[0], meta.shape[1], meta.dtype, codec
        );

        Ok(ZarrArray {
            store,
            path: path.to_string(),
            genes: meta.shape[0],
            cells: meta.shape[1],
            chunk_cells: meta.chunks[1],
            dtype,
            codec,
            separator,
        })
    }
}

impl RowArray for ZarrArray {
    fn gene_count(&self) -> usize {
        self.genes
    }

    fn cell_count(&self) -> usize {
        self.cells
    }

    async fn fetch_row(&self, row: usize) -> Result<RowPayload> {
        if row >= self.genes {
            return Err(LoadError::gene(
                row,
                format!("row out of range (array has {} genes)", self.genes),
            ));
        }
        let key = format!("{}/{}{}0", self.path, row, self.separator);
        let raw = self
            .store
            .get_bytes(&key)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    LoadError::gene(row, format!("chunk {} is missing", key))
                } else {
                    LoadError::gene(row, e)
                }
            })?;
        let mut data = self.dtype.decode(&self.codec.inflate(raw)?)?;
        // Edge chunks are padded to the chunk size.
        if self.chunk_cells > self.cells && data.len() == self.chunk_cells {
            data.truncate(self.cells);
        }
        Ok(RowPayload::Wrapped {
            data,
            shape: vec![1, self.cells],
        })
    }
}

/// Strain-scoped handle onto the data store.
#[derive(Clone)]
pub struct StrainStore {
    store: DataStore,
    strain: String,
}

/// Opens `{base}/{strain}/arrays/expression`.
pub struct ZarrBackend {
    store: DataStore,
}

impl ZarrBackend {
    pub fn new(store: DataStore) -> Self {
        ZarrBackend { store }
    }
}

impl ArrayBackend for ZarrBackend {
    type Store = StrainStore;
    type Array = ZarrArray;

    fn open_store(&self, strain: &str) -> StrainStore {
        StrainStore {
            store: self.store.clone(),
            strain: strain.to_string(),
        }
    }

    async fn open_array(&self, store: &StrainStore) -> Result<ZarrArray> {
        let path = format!("{}/arrays/expression", store.strain);
        ZarrArray::open(store.store.clone(), &path).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::{json, Value};
    use std::io::Write;
    use std::path::Path;
    use tempfile::tempdir;

    /// Write a little-endian f4 expression array under `{root}/{strain}`.
    pub(crate) fn write_expression(root: &Path, strain: &str, rows: &[Vec<f32>], gzip: bool) {
        let dir = root.join(strain).join("arrays/expression");
        std::fs::create_dir_all(&dir).unwrap();
        let cells = rows.first().map(Vec::len).unwrap_or(0);
        let compressor = if gzip {
            json!({"id": "gzip", "level": 1})
        } else {
            Value::Null
        };
        let meta = json!({
            "zarr_format": 2,
            "shape": [rows.len(), cells],
            "chunks": [1, cells],
            "dtype": "<f4",
            "compressor": compressor,
            "fill_value": 0.0,
            "order": "C",
            "filters": null
        });
        std::fs::write(dir.join(".zarray"), meta.to_string()).unwrap();
        for (i, row) in rows.iter().enumerate() {
            let bytes: Vec<u8> = row.iter().flat_map(|v| v.to_le_bytes()).collect();
            let bytes = if gzip {
                let mut enc = GzEncoder::new(Vec::new(), Compression::default());
                enc.write_all(&bytes).unwrap();
                enc.finish().unwrap()
            } else {
                bytes
            };
            std::fs::write(dir.join(format!("{}.0", i)), bytes).unwrap();
        }
    }

    #[test]
    fn normalizes_every_payload_shape() {
        let wrapped = RowPayload::Wrapped {
            data: vec![1.0, 2.0],
            shape: vec![1, 2],
        };
        assert_eq!(wrapped.into_values().unwrap(), vec![1.0, 2.0]);
        let nested = RowPayload::Nested(vec![vec![1.0, 2.0, 3.0]]);
        assert_eq!(nested.into_values().unwrap(), vec![1.0, 2.0, 3.0]);
        assert_eq!(RowPayload::Flat(vec![4.0]).into_values().unwrap(), vec![4.0]);
        assert!(matches!(
            RowPayload::Scalar(1.0).into_values(),
            Err(LoadError::Decode(_))
        ));
    }

    #[test]
    fn wrapped_shape_must_describe_a_single_row() {
        let mismatch = RowPayload::Wrapped {
            data: vec![1.0, 2.0, 3.0],
            shape: vec![1, 2],
        };
        assert!(mismatch.into_values().is_err());
        let matrix = RowPayload::Wrapped {
            data: vec![1.0; 4],
            shape: vec![2, 2],
        };
        assert!(matrix.into_values().is_err());
    }

    #[test]
    fn decodes_integer_and_big_endian_dtypes() {
        let be = Dtype::parse(">i2").unwrap();
        assert_eq!(be.decode(&[0x01, 0x00, 0xFF, 0xFE]).unwrap(), vec![256.0, -2.0]);
        let u1 = Dtype::parse("|u1").unwrap();
        assert_eq!(u1.decode(&[7, 255]).unwrap(), vec![7.0, 255.0]);
        let f8 = Dtype::parse("<f8").unwrap();
        assert_eq!(f8.decode(&2.5f64.to_le_bytes()).unwrap(), vec![2.5]);
        assert!(Dtype::parse("<f2").is_err());
        assert!(Dtype::parse("<c8").is_err());
        assert!(Dtype::parse("<f4").unwrap().decode(&[0, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn fetches_rows_from_raw_and_gzip_arrays() {
        let td = tempdir().unwrap();
        let rows = vec![vec![0.0, 1.0, 2.0], vec![3.0, 0.0, 5.5]];
        write_expression(td.path(), "wt", &rows, false);
        write_expression(td.path(), "mut", &rows, true);
        let backend = ZarrBackend::new(DataStore::new(td.path().to_str().unwrap()));

        for strain in ["wt", "mut"] {
            let store = backend.open_store(strain);
            let array = backend.open_array(&store).await.unwrap();
            assert_eq!(array.gene_count(), 2);
            assert_eq!(array.cell_count(), 3);
            let row = array.fetch_row(1).await.unwrap().into_values().unwrap();
            assert_eq!(row, vec![3.0, 0.0, 5.5]);
            assert!(matches!(
                array.fetch_row(2).await,
                Err(LoadError::GeneFetch { index: 2, .. })
            ));
        }
    }

    #[tokio::test]
    async fn rejects_multi_gene_chunks() {
        let td = tempdir().unwrap();
        let dir = td.path().join("wt/arrays/expression");
        std::fs::create_dir_all(&dir).unwrap();
        let meta = json!({"shape": [4, 3], "chunks": [2, 3], "dtype": "<f4", "compressor": null});
        std::fs::write(dir.join(".zarray"), meta.to_string()).unwrap();

        let store = DataStore::new(td.path().to_str().unwrap());
        let result = ZarrArray::open(store, "wt/arrays/expression").await;
        assert!(matches!(result, Err(LoadError::Decode(_))));
    }
}
