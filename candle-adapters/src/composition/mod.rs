//! # Adapter Composition
//!
//! Composition blocks describe how named adapters combine at each injection point.

pub mod block;

pub use block::{
    fusion_name_of, normalize_setup, parse_composition, AdapterCompositionBlock, BlockKind,
};
