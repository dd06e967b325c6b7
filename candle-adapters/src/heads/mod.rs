//! # Prediction Heads
//!
//! Task layers applied to the host's last hidden state: classification,
//! multi-label classification, tagging, question answering, multiple
//! choice and sequence-to-sequence language modeling, plus user-registered
//! custom heads.

pub mod dispatch;
pub mod losses;
pub mod pooling;
pub mod prediction_head;

pub use dispatch::{DispatchOutput, HeadDispatch};
pub use pooling::PoolingStrategy;
pub use prediction_head::{
    CustomHead, CustomHeadBuilder, HeadBuildContext, HeadConfig, HeadInputs, HeadOutput, Label2Id, PredictionHead,
};

#[cfg(test)]
pub mod dispatch_test;
#[cfg(test)]
pub mod losses_test;
#[cfg(test)]
pub mod prediction_head_test;
