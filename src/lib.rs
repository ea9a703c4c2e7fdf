//! Gene expression scatter viewer: a cache-backed loader for per-gene
//! expression rows and an interactive point renderer for 2D embeddings.

pub mod array;
pub mod cache;
pub mod color;
pub mod dataset;
pub mod error;
pub mod expression;
pub mod font;
pub mod loader;
pub mod render;
pub mod store;
pub mod view;
pub mod viewport;

pub use array::{ArrayBackend, RowArray, RowPayload, ZarrArray, ZarrBackend};
pub use cache::{DiskCache, ExpressionCache, MemoryCache};
pub use color::{ColorCache, ColorMode, Rgb};
pub use dataset::{Dataset, ScatterPoint};
pub use error::{CacheError, LoadError, StoreError};
pub use expression::{aggregate, transform, AggregationMode, ExpressionVector, TransformMode};
pub use loader::{list_available_strains, BatchLoad, CacheStats, ExpressionLoader, LoaderConfig};
pub use render::{GeneRecord, Legend, RenderOptions, Tooltip};
pub use store::DataStore;
pub use view::{Interaction, Scene, ScatterView};
pub use viewport::{Bounds, ViewTransform, Viewport};
