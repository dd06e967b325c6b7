//! Bottleneck adapters
//!
//! Per-layer bottleneck points (`mh_adapter`, `output_adapter`), their
//! optional PHM projections, and embedding-level invertible adapters.

pub mod adapter;
pub mod invertible;
pub mod layer;
pub mod phm;

pub use adapter::{AdapterOutput, BottleneckAdapter};
pub use invertible::{CouplingBlock, CouplingNet, InvertibleAdaptersLayer};
pub use layer::{BottleneckLayer, BottleneckLocation};
pub use phm::{kronecker_sum, PHMLayer};
