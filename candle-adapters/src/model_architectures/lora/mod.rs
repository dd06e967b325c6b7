//! LoRA (Low-Rank Adaptation) injection points
//!
//! `LoRAAdapter` is the per-adapter parameter pair, `LoRALinear` the dense
//! projection hosting any number of them.

pub mod lora_adapter;
pub mod lora_linear;

pub use lora_adapter::LoRAAdapter;
pub use lora_linear::{LoRALinear, LoRALocation, QKV};

#[cfg(test)]
pub mod lora_linear_test;
