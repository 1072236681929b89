pub mod error;
pub mod framework;
pub mod lookup;
pub mod pipeline;
pub mod transformers;
pub mod writer;

pub use crate::error::{EnrichError, RowError};
pub use crate::framework::CancellationToken;
pub use crate::lookup::{Lookup, ProductRegistry};
pub use crate::pipeline::{enrich, EnrichConfig, EnrichStats};
