//! Model intermediate representation.
//!
//! The [`Model`] is the validated in-memory form of a trained ensemble:
//! ordered trees, ensemble metadata, and (after quantization) the per-feature
//! cut tables. It has no behavior beyond validated storage and reference
//! evaluation; lowering lives in [`crate::codegen`], serving in
//! [`crate::runtime`].

pub mod eval;
pub mod tree;

pub use tree::{MissingPolicy, Node, NodeId, SplitCondition, SplitTest, Tree, TreeBuilder};

use crate::quantize::QuantTables;

// =============================================================================
// Task type and output transform
// =============================================================================

/// The prediction task the ensemble was trained for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Regression,
    BinaryClassification,
    MulticlassClassification,
    Ranking,
}

impl TaskType {
    /// Stable numeric code used in the compiled artifact's metadata symbol.
    pub fn code(self) -> u32 {
        match self {
            TaskType::Regression => 0,
            TaskType::BinaryClassification => 1,
            TaskType::MulticlassClassification => 2,
            TaskType::Ranking => 3,
        }
    }

    /// Inverse of [`TaskType::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(TaskType::Regression),
            1 => Some(TaskType::BinaryClassification),
            2 => Some(TaskType::MulticlassClassification),
            3 => Some(TaskType::Ranking),
            _ => None,
        }
    }
}

/// Transform applied to raw margins after tree aggregation.
///
/// Generated code never applies the transform; the predictor runtime does,
/// so generated code stays free of transcendental-function dependencies and
/// the policy lives in exactly one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputTransform {
    /// No transform (regression, ranking).
    Identity,
    /// Elementwise logistic sigmoid `1 / (1 + exp(-alpha * x))`.
    Sigmoid,
    /// Row-wise softmax over the class scores.
    Softmax,
    /// Margins are the final output by definition; `pred_margin` has no effect.
    RawMargin,
}

impl OutputTransform {
    /// Stable numeric code used in the compiled artifact's metadata symbol.
    pub fn code(self) -> u32 {
        match self {
            OutputTransform::Identity => 0,
            OutputTransform::Sigmoid => 1,
            OutputTransform::Softmax => 2,
            OutputTransform::RawMargin => 3,
        }
    }

    /// Inverse of [`OutputTransform::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(OutputTransform::Identity),
            1 => Some(OutputTransform::Sigmoid),
            2 => Some(OutputTransform::Softmax),
            3 => Some(OutputTransform::RawMargin),
            _ => None,
        }
    }

    /// Apply the transform to one output row in place.
    ///
    /// `sigmoid_alpha` is only consulted by [`OutputTransform::Sigmoid`].
    pub fn apply(self, row: &mut [f64], sigmoid_alpha: f64) {
        match self {
            OutputTransform::Identity | OutputTransform::RawMargin => {}
            OutputTransform::Sigmoid => {
                for val in row.iter_mut() {
                    *val = sigmoid(*val, sigmoid_alpha);
                }
            }
            OutputTransform::Softmax => softmax_inplace(row),
        }
    }
}

/// Sigmoid with slope `alpha`: `1 / (1 + exp(-alpha * x))`.
#[inline]
pub(crate) fn sigmoid(x: f64, alpha: f64) -> f64 {
    1.0 / (1.0 + (-alpha * x).exp())
}

/// Softmax in-place over a slice, max-subtracted for stability.
pub(crate) fn softmax_inplace(values: &mut [f64]) {
    if values.is_empty() {
        return;
    }
    let max_val = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0f64;
    for val in values.iter_mut() {
        *val = (*val - max_val).exp();
        sum += *val;
    }
    if sum > 0.0 {
        for val in values.iter_mut() {
            *val /= sum;
        }
    }
}

// =============================================================================
// Model metadata
// =============================================================================

/// Ensemble-level metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    /// Number of input features the ensemble was trained on.
    pub num_feature: u32,
    /// Number of classes; 1 unless multiclass.
    pub num_class: u32,
    /// Prediction task.
    pub task_type: TaskType,
    /// Transform applied by the runtime after aggregation.
    pub output_transform: OutputTransform,
    /// Sigmoid slope (LightGBM's `sigmoid:k` objective parameter). 1.0 when
    /// unused.
    pub sigmoid_alpha: f64,
    /// Global bias added once per output group before the transform.
    pub base_score: f64,
    /// Whether per-group tree outputs are averaged rather than summed
    /// (random-forest style ensembles).
    pub average_tree_output: bool,
}

impl ModelMeta {
    /// Metadata for a regression ensemble.
    pub fn regression(num_feature: u32) -> Self {
        Self {
            num_feature,
            num_class: 1,
            task_type: TaskType::Regression,
            output_transform: OutputTransform::Identity,
            sigmoid_alpha: 1.0,
            base_score: 0.0,
            average_tree_output: false,
        }
    }

    /// Metadata for a binary classifier (sigmoid transform).
    pub fn binary(num_feature: u32) -> Self {
        Self {
            num_class: 1,
            task_type: TaskType::BinaryClassification,
            output_transform: OutputTransform::Sigmoid,
            ..Self::regression(num_feature)
        }
    }

    /// Metadata for a K-class classifier (softmax transform).
    pub fn multiclass(num_feature: u32, num_class: u32) -> Self {
        Self {
            num_class,
            task_type: TaskType::MulticlassClassification,
            output_transform: OutputTransform::Softmax,
            ..Self::regression(num_feature)
        }
    }

    /// Metadata for a ranking ensemble (raw scores, higher = better).
    pub fn ranking(num_feature: u32) -> Self {
        Self {
            task_type: TaskType::Ranking,
            ..Self::regression(num_feature)
        }
    }
}

// =============================================================================
// Model
// =============================================================================

/// A validated tree ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    /// Ordered trees. For multiclass, tree `i` scores class
    /// `i % num_class` (round-robin grouping).
    pub trees: Vec<Tree>,
    /// Ensemble metadata.
    pub meta: ModelMeta,
    /// Per-feature cut tables; present only after quantization.
    pub quant: Option<QuantTables>,
}

impl Model {
    /// Assemble a model. Call [`Model::validate`] before trusting it.
    pub fn new(trees: Vec<Tree>, meta: ModelMeta) -> Self {
        Self {
            trees,
            meta,
            quant: None,
        }
    }

    /// Number of trees, constant single-leaf trees included.
    #[inline]
    pub fn num_tree(&self) -> usize {
        self.trees.len()
    }

    /// Number of output groups (1 except multiclass).
    #[inline]
    pub fn num_groups(&self) -> usize {
        self.meta.num_class.max(1) as usize
    }

    /// Number of input features.
    #[inline]
    pub fn num_feature(&self) -> usize {
        self.meta.num_feature as usize
    }

    /// Which output group a tree contributes to.
    #[inline]
    pub fn tree_group(&self, tree_idx: usize) -> usize {
        tree_idx % self.num_groups()
    }

    /// Trees contributing to each group; the averaging divisor when
    /// `average_tree_output` is set.
    #[inline]
    pub fn trees_per_group(&self) -> usize {
        self.num_tree() / self.num_groups()
    }

    /// Whether numeric thresholds have been rewritten to bin indices.
    #[inline]
    pub fn is_quantized(&self) -> bool {
        self.quant.is_some()
    }

    /// Check every structural invariant of the IR.
    ///
    /// Loaders call this on every parsed model; anything constructing a
    /// [`Model`] by hand should too.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::NoTrees);
        }
        let num_groups = self.num_groups();
        if self.meta.num_class == 0 {
            return Err(ModelError::BadClassCount);
        }
        if self.num_tree() % num_groups != 0 {
            return Err(ModelError::BadTreeCount {
                num_tree: self.num_tree(),
                num_class: num_groups,
            });
        }

        // Feature usage must be consistent: a feature tested numerically in
        // one node and categorically in another cannot be quantized or
        // lowered coherently.
        let mut usage = vec![FeatureUsage::Unused; self.num_feature()];

        for (tree_idx, tree) in self.trees.iter().enumerate() {
            self.validate_tree(tree_idx, tree, &mut usage)?;
        }
        Ok(())
    }

    fn validate_tree(
        &self,
        tree_idx: usize,
        tree: &Tree,
        usage: &mut [FeatureUsage],
    ) -> Result<(), ModelError> {
        let num_nodes = tree.num_nodes();
        if num_nodes == 0 {
            return Err(ModelError::EmptyTree { tree: tree_idx });
        }

        // Walk from the root; every node must be visited exactly once.
        let mut visited = vec![false; num_nodes];
        let mut stack = vec![0 as NodeId];
        visited[0] = true;
        while let Some(id) = stack.pop() {
            let node = tree.node(id);
            let (left, right) = match node.children() {
                Some(children) => children,
                None => continue,
            };
            let condition = match node.condition() {
                Some(c) => c,
                None => continue,
            };

            if condition.feature as usize >= self.num_feature() {
                return Err(ModelError::FeatureOutOfRange {
                    tree: tree_idx,
                    node: id,
                    feature: condition.feature,
                    num_feature: self.meta.num_feature,
                });
            }
            let slot = &mut usage[condition.feature as usize];
            let kind = if condition.test.is_numeric() {
                FeatureUsage::Numeric
            } else {
                FeatureUsage::Categorical
            };
            if *slot == FeatureUsage::Unused {
                *slot = kind;
            } else if *slot != kind {
                return Err(ModelError::MixedFeatureUsage {
                    feature: condition.feature,
                });
            }

            if let SplitTest::QuantizedNumeric { bin } = condition.test {
                let table_len = self
                    .quant
                    .as_ref()
                    .map(|q| q.cuts(condition.feature).len())
                    .ok_or(ModelError::QuantizedWithoutTables {
                        tree: tree_idx,
                        node: id,
                    })?;
                if bin as usize >= table_len * 2 {
                    return Err(ModelError::BinOutOfRange {
                        tree: tree_idx,
                        node: id,
                        bin,
                        table_len,
                    });
                }
            }

            for child in [left, right] {
                if child as usize >= num_nodes {
                    return Err(ModelError::InvalidChildIndex {
                        tree: tree_idx,
                        node: id,
                        child,
                        num_nodes,
                    });
                }
                if visited[child as usize] {
                    return Err(ModelError::ChildReferencedTwice {
                        tree: tree_idx,
                        node: child,
                    });
                }
                visited[child as usize] = true;
                stack.push(child);
            }
        }

        let reachable = visited.iter().filter(|&&v| v).count();
        if reachable != num_nodes {
            return Err(ModelError::UnreachableNodes {
                tree: tree_idx,
                reachable,
                total: num_nodes,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeatureUsage {
    Unused,
    Numeric,
    Categorical,
}

/// Structural violations detected by [`Model::validate`].
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model contains no trees")]
    NoTrees,
    #[error("num_class must be at least 1")]
    BadClassCount,
    #[error("tree count {num_tree} is not a multiple of num_class {num_class}")]
    BadTreeCount { num_tree: usize, num_class: usize },
    #[error("tree {tree} has no nodes")]
    EmptyTree { tree: usize },
    #[error("tree {tree}: node {node} references child {child} but tree has {num_nodes} nodes")]
    InvalidChildIndex {
        tree: usize,
        node: NodeId,
        child: NodeId,
        num_nodes: usize,
    },
    #[error("tree {tree}: node {node} is referenced as a child more than once")]
    ChildReferencedTwice { tree: usize, node: NodeId },
    #[error("tree {tree}: only {reachable} of {total} nodes reachable from the root")]
    UnreachableNodes {
        tree: usize,
        reachable: usize,
        total: usize,
    },
    #[error("tree {tree}: node {node} tests feature {feature} but model has {num_feature} features")]
    FeatureOutOfRange {
        tree: usize,
        node: NodeId,
        feature: u32,
        num_feature: u32,
    },
    #[error("feature {feature} is used in both numeric and categorical splits")]
    MixedFeatureUsage { feature: u32 },
    #[error("tree {tree}: node {node} holds a quantized threshold but the model has no cut tables")]
    QuantizedWithoutTables { tree: usize, node: NodeId },
    #[error("tree {tree}: node {node} bin {bin} exceeds cut table of length {table_len}")]
    BinOutOfRange {
        tree: usize,
        node: NodeId,
        bin: u32,
        table_len: usize,
    },
}

// =============================================================================
// Tests
// =============================================================================
