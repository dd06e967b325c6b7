//! Adapter composition blocks
//!
//! A composition block is a small tree describing how named adapters are
//! combined at every injection point: leaves are adapter names, inner nodes
//! are the operators Stack, Fuse, Split, Parallel, BatchSplit and Average.
//! Blocks are pure data; the injection points interpret them.

use crate::config_error;
use crate::core::{AdapterError, AdapterResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Composition tree over adapter names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AdapterCompositionBlock {
    /// A single adapter
    Adapter(String),
    /// Sequential application, output of one child feeds the next
    Stack(Vec<AdapterCompositionBlock>),
    /// Outputs of all children combined by a fusion layer
    Fuse(Vec<AdapterCompositionBlock>),
    /// Sequence dimension split at the given boundary indices
    Split {
        children: Vec<AdapterCompositionBlock>,
        splits: Vec<usize>,
    },
    /// Input batch replicated once per child
    Parallel(Vec<AdapterCompositionBlock>),
    /// Input batch partitioned by the given sizes
    BatchSplit {
        children: Vec<AdapterCompositionBlock>,
        batch_sizes: Vec<usize>,
    },
    /// Weighted sum of children outputs
    Average {
        children: Vec<AdapterCompositionBlock>,
        weights: Vec<f64>,
    },
}

/// Operator kinds, used by the nesting table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    Adapter,
    Stack,
    Fuse,
    Split,
    Parallel,
    BatchSplit,
    Average,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::Adapter => "Adapter",
            BlockKind::Stack => "Stack",
            BlockKind::Fuse => "Fuse",
            BlockKind::Split => "Split",
            BlockKind::Parallel => "Parallel",
            BlockKind::BatchSplit => "BatchSplit",
            BlockKind::Average => "Average",
        };
        write!(f, "{}", name)
    }
}

impl BlockKind {
    /// Child kinds allowed directly below a block of this kind
    pub fn allowed_children(&self) -> &'static [BlockKind] {
        use BlockKind::*;
        match self {
            Adapter => &[],
            Stack => &[Adapter, Fuse, Split, Parallel, BatchSplit, Average],
            Fuse => &[Adapter, Stack],
            Split => &[Adapter, Split, Stack, BatchSplit, Average],
            Parallel => &[Adapter, Stack, BatchSplit, Average],
            BatchSplit => &[Adapter, Stack, Split, BatchSplit, Average],
            Average => &[Adapter, Stack, Split, BatchSplit],
        }
    }
}

impl From<&str> for AdapterCompositionBlock {
    fn from(name: &str) -> Self {
        AdapterCompositionBlock::Adapter(name.to_string())
    }
}

impl From<String> for AdapterCompositionBlock {
    fn from(name: String) -> Self {
        AdapterCompositionBlock::Adapter(name)
    }
}

fn collect<I, B>(children: I) -> Vec<AdapterCompositionBlock>
where
    I: IntoIterator<Item = B>,
    B: Into<AdapterCompositionBlock>,
{
    children.into_iter().map(Into::into).collect()
}

impl AdapterCompositionBlock {
    /// Build a validated Stack
    pub fn stack<I, B>(children: I) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        Self::checked(AdapterCompositionBlock::Stack(collect(children)))
    }

    /// Build a validated Fuse
    pub fn fuse<I, B>(children: I) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        Self::checked(AdapterCompositionBlock::Fuse(collect(children)))
    }

    /// Build a validated Parallel
    pub fn parallel<I, B>(children: I) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        Self::checked(AdapterCompositionBlock::Parallel(collect(children)))
    }

    /// Build a validated Split with `children.len() - 1` increasing boundaries
    pub fn split<I, B>(children: I, splits: Vec<usize>) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        Self::checked(AdapterCompositionBlock::Split {
            children: collect(children),
            splits,
        })
    }

    /// Build a validated BatchSplit with one batch size per child
    pub fn batch_split<I, B>(children: I, batch_sizes: Vec<usize>) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        Self::checked(AdapterCompositionBlock::BatchSplit {
            children: collect(children),
            batch_sizes,
        })
    }

    /// Build a validated Average. Weights default to uniform; `normalize`
    /// rescales them to sum to one.
    pub fn average<I, B>(children: I, weights: Option<Vec<f64>>, normalize: bool) -> AdapterResult<Self>
    where
        I: IntoIterator<Item = B>,
        B: Into<AdapterCompositionBlock>,
    {
        let children = collect(children);
        let n = children.len();
        let mut weights = weights.unwrap_or_else(|| vec![1.0 / n.max(1) as f64; n]);
        if normalize {
            let total: f64 = weights.iter().sum();
            if total == 0.0 {
                return Err(config_error!("Average", "weights sum to zero, cannot normalize"));
            }
            weights.iter_mut().for_each(|w| *w /= total);
        }
        Self::checked(AdapterCompositionBlock::Average { children, weights })
    }

    fn checked(block: Self) -> AdapterResult<Self> {
        block.validate()?;
        Ok(block)
    }

    pub fn kind(&self) -> BlockKind {
        match self {
            AdapterCompositionBlock::Adapter(_) => BlockKind::Adapter,
            AdapterCompositionBlock::Stack(_) => BlockKind::Stack,
            AdapterCompositionBlock::Fuse(_) => BlockKind::Fuse,
            AdapterCompositionBlock::Split { .. } => BlockKind::Split,
            AdapterCompositionBlock::Parallel(_) => BlockKind::Parallel,
            AdapterCompositionBlock::BatchSplit { .. } => BlockKind::BatchSplit,
            AdapterCompositionBlock::Average { .. } => BlockKind::Average,
        }
    }

    /// Direct children; empty for a leaf
    pub fn children(&self) -> &[AdapterCompositionBlock] {
        match self {
            AdapterCompositionBlock::Adapter(_) => &[],
            AdapterCompositionBlock::Stack(c)
            | AdapterCompositionBlock::Fuse(c)
            | AdapterCompositionBlock::Parallel(c) => c,
            AdapterCompositionBlock::Split { children, .. }
            | AdapterCompositionBlock::BatchSplit { children, .. }
            | AdapterCompositionBlock::Average { children, .. } => children,
        }
    }

    pub fn adapter_name(&self) -> Option<&str> {
        match self {
            AdapterCompositionBlock::Adapter(name) => Some(name),
            _ => None,
        }
    }

    /// Check structure and nesting rules from the root
    pub fn validate(&self) -> AdapterResult<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, level: usize) -> AdapterResult<()> {
        let kind = self.kind();
        if level > 1 && !matches!(kind, BlockKind::Stack | BlockKind::Adapter) {
            return Err(config_error!(
                "composition validation",
                format!("{} is not allowed below nesting level 1: {}", kind, self)
            ));
        }
        if let AdapterCompositionBlock::Adapter(name) = self {
            if name.is_empty() {
                return Err(config_error!("composition validation", "empty adapter name"));
            }
            return Ok(());
        }

        let children = self.children();
        if children.is_empty() {
            return Err(config_error!(
                "composition validation",
                format!("{} requires at least one child", kind)
            ));
        }
        let allowed = kind.allowed_children();
        for child in children {
            if !allowed.contains(&child.kind()) {
                return Err(config_error!(
                    "composition validation",
                    format!("{} cannot be nested inside {}", child.kind(), kind),
                    format!("block: {}", self)
                ));
            }
            child.validate_at(level + 1)?;
        }

        match self {
            AdapterCompositionBlock::Split { children, splits } => {
                if splits.len() + 1 != children.len() {
                    return Err(config_error!(
                        "composition validation",
                        format!(
                            "Split over {} children needs {} boundaries, got {}",
                            children.len(),
                            children.len() - 1,
                            splits.len()
                        )
                    ));
                }
                if splits.windows(2).any(|w| w[0] >= w[1]) || splits.first() == Some(&0) {
                    return Err(config_error!(
                        "composition validation",
                        format!("Split boundaries must be positive and strictly increasing: {:?}", splits)
                    ));
                }
            }
            AdapterCompositionBlock::BatchSplit {
                children,
                batch_sizes,
            } => {
                if batch_sizes.len() != children.len() {
                    return Err(config_error!(
                        "composition validation",
                        format!(
                            "BatchSplit over {} children needs as many batch sizes, got {}",
                            children.len(),
                            batch_sizes.len()
                        )
                    ));
                }
            }
            AdapterCompositionBlock::Average { children, weights } => {
                if weights.len() != children.len() {
                    return Err(config_error!(
                        "composition validation",
                        format!(
                            "Average over {} children needs as many weights, got {}",
                            children.len(),
                            weights.len()
                        )
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// All leaf adapter names in first-seen order, without duplicates
    pub fn flatten(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_leaves(&mut names);
        names
    }

    fn collect_leaves(&self, names: &mut Vec<String>) {
        match self {
            AdapterCompositionBlock::Adapter(name) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.clone());
                }
            }
            _ => self.children().iter().for_each(|c| c.collect_leaves(names)),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            AdapterCompositionBlock::Adapter(n) => n == name,
            _ => self.children().iter().any(|c| c.contains(name)),
        }
    }

    /// First leaf in traversal order
    pub fn first(&self) -> Option<&str> {
        match self {
            AdapterCompositionBlock::Adapter(name) => Some(name),
            _ => self.children().first().and_then(|c| c.first()),
        }
    }

    /// Last leaf in traversal order; names the prediction head to activate
    pub fn last(&self) -> Option<&str> {
        match self {
            AdapterCompositionBlock::Adapter(name) => Some(name),
            _ => self.children().last().and_then(|c| c.last()),
        }
    }

    /// Key of the fusion layer serving a Fuse block
    pub fn fusion_name(&self) -> Option<String> {
        match self {
            AdapterCompositionBlock::Fuse(_) => Some(fusion_name_of(&self.flatten())),
            _ => None,
        }
    }

    /// Number of batch replicas a Parallel block produces; 1 for anything else
    pub fn parallel_channels(&self) -> usize {
        match self {
            AdapterCompositionBlock::Parallel(children) => children.len(),
            _ => 1,
        }
    }
}

/// Sorted, comma-joined adapter names identifying a fusion layer
pub fn fusion_name_of<S: AsRef<str>>(names: &[S]) -> String {
    let mut sorted: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// Turn a list of adapter names into a validated Stack
pub fn parse_composition<S: AsRef<str>>(names: &[S]) -> AdapterResult<AdapterCompositionBlock> {
    if names.is_empty() {
        return Err(config_error!("parse_composition", "empty adapter list"));
    }
    AdapterCompositionBlock::stack(names.iter().map(|n| n.as_ref().to_string()))
}

/// Normalize an activation request: a single adapter becomes a one-element Stack
pub fn normalize_setup(block: AdapterCompositionBlock) -> AdapterResult<AdapterCompositionBlock> {
    let block = match block {
        AdapterCompositionBlock::Adapter(name) => AdapterCompositionBlock::Stack(vec![
            AdapterCompositionBlock::Adapter(name),
        ]),
        other => other,
    };
    block.validate()?;
    Ok(block)
}

impl fmt::Display for AdapterCompositionBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let AdapterCompositionBlock::Adapter(name) = self {
            return write!(f, "{}", name);
        }
        let children: Vec<String> = self.children().iter().map(|c| c.to_string()).collect();
        write!(f, "{}[{}", self.kind(), children.join(", "))?;
        match self {
            AdapterCompositionBlock::Split { splits, .. } => write!(f, ", splits={:?}", splits)?,
            AdapterCompositionBlock::BatchSplit { batch_sizes, .. } => {
                write!(f, ", batch_sizes={:?}", batch_sizes)?
            }
            AdapterCompositionBlock::Average { weights, .. } => write!(f, ", weights={:?}", weights)?,
            _ => {}
        }
        write!(f, "]")
    }
}

impl TryFrom<Vec<&str>> for AdapterCompositionBlock {
    type Error = AdapterError;

    fn try_from(names: Vec<&str>) -> Result<Self, Self::Error> {
        parse_composition(&names)
    }
}
