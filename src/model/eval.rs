//! Reference evaluation of the model IR.
//!
//! Traverses trees in process with exactly the semantics the generated code
//! implements: same missing-value handling, same bin encoding for quantized
//! splits, same aggregation. The compiled artifact and this evaluator must
//! agree on every input, which is what the end-to-end tests assert.
//!
//! Missing values are represented as NaN in the input slice; a slice shorter
//! than the model's feature count treats the absent tail as missing.

use super::tree::{MissingPolicy, Node, SplitCondition, SplitTest, Tree};
use super::Model;
use crate::quantize::QuantTables;

impl Model {
    /// Raw per-group margins for a single row (no output transform).
    pub fn predict_row(&self, features: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.num_groups()];
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            out[self.tree_group(tree_idx)] += eval_tree(tree, features, self.quant.as_ref());
        }
        if self.meta.average_tree_output {
            let divisor = self.trees_per_group() as f64;
            for val in out.iter_mut() {
                *val /= divisor;
            }
        }
        for val in out.iter_mut() {
            *val += self.meta.base_score;
        }
        out
    }

    /// Margins with the model's output transform applied.
    pub fn predict_row_transformed(&self, features: &[f64]) -> Vec<f64> {
        let mut out = self.predict_row(features);
        self.meta
            .output_transform
            .apply(&mut out, self.meta.sigmoid_alpha);
        out
    }
}

/// Walk one tree from the root to a leaf.
fn eval_tree(tree: &Tree, features: &[f64], quant: Option<&QuantTables>) -> f64 {
    let mut id = 0u32;
    loop {
        match tree.node(id) {
            Node::Leaf { value } => return *value,
            Node::Test {
                condition,
                left,
                right,
            } => {
                id = if go_left(condition, features, quant) {
                    *left
                } else {
                    *right
                };
            }
        }
    }
}

/// Decide the branch for one test node.
fn go_left(condition: &SplitCondition, features: &[f64], quant: Option<&QuantTables>) -> bool {
    let value = features
        .get(condition.feature as usize)
        .copied()
        .filter(|v| !v.is_nan());

    match (condition.missing, value) {
        // Zero substitution happens before the comparison; the default
        // direction is never consulted for these nodes.
        (MissingPolicy::TreatAsZero, None) => test_value(condition, 0.0, quant),
        (MissingPolicy::DefaultDirection, None) => condition.default_left,
        (_, Some(v)) => test_value(condition, v, quant),
    }
}

/// Evaluate the split on a present (or substituted) value.
fn test_value(condition: &SplitCondition, value: f64, quant: Option<&QuantTables>) -> bool {
    match &condition.test {
        SplitTest::Numeric { threshold } => value < *threshold,
        SplitTest::QuantizedNumeric { bin } => {
            let tables = quant.expect("quantized node in model without cut tables");
            tables.bin_of(condition.feature, value) < *bin as i64
        }
        SplitTest::Categorical {
            categories,
            goes_right,
        } => {
            let matched = match float_to_category(value) {
                Some(category) => categories.binary_search(&category).is_ok(),
                // Negative or out-of-range values match no category.
                None => false,
            };
            matched != *goes_right
        }
    }
}

/// Convert a feature value to a category index.
///
/// Trainers store categorical features as floats holding integer category
/// indices and compare them after truncation, so fractional values fall into
/// the category below them. Negative and out-of-range values are not valid
/// categories. Generated code performs the identical conversion.
#[inline]
fn float_to_category(value: f64) -> Option<u32> {
    if value >= 0.0 && value < 4294967296.0 {
        Some(value as u32)
    } else {
        None
    }
}
