//! Threshold quantization.
//!
//! Quantization replaces every floating-point threshold in a model's numeric
//! splits with an index into a per-feature table of distinct cut values. The
//! generated code then bins each incoming value once per row (binary search)
//! and evaluates splits with integer comparisons, which is semantically
//! identical to the original float comparisons.
//!
//! # Bin encoding
//!
//! For a feature with sorted cuts `c_0 < c_1 < ... < c_{n-1}`:
//!
//! - an input equal to `c_i` maps to bin `2i`,
//! - an input strictly between `c_i` and `c_{i+1}` maps to `2i + 1`,
//! - an input below `c_0` maps to `-1`,
//! - an input above `c_{n-1}` maps to `2(n-1) + 1`.
//!
//! A threshold `c_i` is stored as `2i`, so `value < threshold` holds exactly
//! when `bin(value) < 2i`. The doubling keeps "equal to a cut" and "between
//! two cuts" distinguishable, which is what makes the integer comparison
//! exact.

use std::cmp::Ordering;

use crate::model::{Model, Node, SplitTest};

/// Float ordering for cut values. NaN never reaches the tables (thresholds
/// are parsed finite, missing values are resolved before binning), so the
/// partial order is total here; unlike `total_cmp` it treats `-0.0 == 0.0`,
/// matching the float comparisons the bins must reproduce.
#[inline]
fn cmp_cut(a: &f64, b: &f64) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

// =============================================================================
// QuantTables
// =============================================================================

/// Per-feature sorted, deduplicated threshold tables.
///
/// Features never referenced by a numeric split (including categorical
/// features) have empty tables, which are never consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantTables {
    tables: Vec<Box<[f64]>>,
}

impl QuantTables {
    /// Cut values for a feature, ascending. Empty for features with no
    /// numeric splits.
    #[inline]
    pub fn cuts(&self, feature: u32) -> &[f64] {
        &self.tables[feature as usize]
    }

    /// Number of features covered (equals the model's feature count).
    #[inline]
    pub fn num_features(&self) -> usize {
        self.tables.len()
    }

    /// Map a concrete value to its bin for `feature` using the doubled
    /// encoding described at module level.
    ///
    /// Must not be called for a feature with an empty table, nor with NaN;
    /// missing values are resolved by the caller's missing policy first.
    #[inline]
    pub fn bin_of(&self, feature: u32, value: f64) -> i64 {
        let cuts = self.cuts(feature);
        debug_assert!(!cuts.is_empty(), "bin_of on feature without cuts");
        debug_assert!(!value.is_nan(), "bin_of on missing value");
        match cuts.binary_search_by(|c| cmp_cut(c, &value)) {
            Ok(idx) => 2 * idx as i64,
            Err(0) => -1,
            Err(idx) => 2 * (idx as i64 - 1) + 1,
        }
    }

    /// Position of an exact threshold within a feature's table.
    fn position(&self, feature: u32, threshold: f64) -> Option<usize> {
        self.cuts(feature)
            .binary_search_by(|c| cmp_cut(c, &threshold))
            .ok()
    }
}

// =============================================================================
// quantize
// =============================================================================

/// Produce a quantized copy of `model`.
///
/// Pure and deterministic: the input is untouched, and quantizing the same
/// model twice yields bit-identical tables (thresholds sorted ascending,
/// duplicates removed by exact float equality). Categorical splits are left
/// alone. Never fails; an already-quantized model is returned as a clone.
pub fn quantize(model: &Model) -> Model {
    if model.is_quantized() {
        return model.clone();
    }

    // Pass 1: collect every numeric threshold per feature.
    let mut raw: Vec<Vec<f64>> = vec![Vec::new(); model.num_feature()];
    for tree in &model.trees {
        for node in tree.nodes() {
            if let Node::Test { condition, .. } = node {
                if let SplitTest::Numeric { threshold } = condition.test {
                    raw[condition.feature as usize].push(threshold);
                }
            }
        }
    }
    let tables: Vec<Box<[f64]>> = raw
        .into_iter()
        .map(|mut cuts| {
            cuts.sort_by(cmp_cut);
            cuts.dedup();
            cuts.into_boxed_slice()
        })
        .collect();
    let quant = QuantTables { tables };

    // Pass 2: rewrite thresholds to doubled table positions.
    let mut out = model.clone();
    for tree in &mut out.trees {
        for id in 0..tree.num_nodes() {
            let node = tree.node_mut(id as u32);
            if let Node::Test { condition, .. } = node {
                if let SplitTest::Numeric { threshold } = condition.test {
                    // The table was built from these exact values, so the
                    // lookup cannot miss.
                    let idx = quant
                        .position(condition.feature, threshold)
                        .expect("threshold missing from its own cut table");
                    condition.test = SplitTest::QuantizedNumeric {
                        bin: 2 * idx as u32,
                    };
                }
            }
        }
    }
    out.quant = Some(quant);

    log::debug!(
        "quantized {} trees over {} features",
        out.num_tree(),
        out.num_feature()
    );
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelMeta, SplitCondition, TreeBuilder};

    fn numeric_model() -> Model {
        // Two trees sharing feature 0, one threshold repeated across trees.
        let mut b0 = TreeBuilder::new();
        b0.add_numeric_split(0, 1.5, true, 1, 2);
        b0.add_leaf(-1.0);
        b0.add_numeric_split(1, 0.25, false, 3, 4);
        b0.add_leaf(1.0);
        b0.add_leaf(2.0);

        let mut b1 = TreeBuilder::new();
        b1.add_numeric_split(0, 0.5, true, 1, 2);
        b1.add_leaf(10.0);
        b1.add_numeric_split(0, 1.5, true, 3, 4);
        b1.add_leaf(20.0);
        b1.add_leaf(30.0);

        let model = Model::new(vec![b0.build(), b1.build()], ModelMeta::regression(2));
        model.validate().expect("fixture must validate");
        model
    }

    #[test]
    fn tables_are_sorted_and_deduplicated() {
        let quantized = quantize(&numeric_model());
        let quant = quantized.quant.as_ref().expect("tables present");
        assert_eq!(quant.cuts(0), &[0.5, 1.5]);
        assert_eq!(quant.cuts(1), &[0.25]);
    }

    #[test]
    fn thresholds_rewritten_to_doubled_positions() {
        let quantized = quantize(&numeric_model());
        // Tree 0 root split on feature 0 at 1.5 → position 1 → bin 2.
        let condition = quantized.trees[0].node(0).condition().unwrap();
        assert_eq!(condition.test, SplitTest::QuantizedNumeric { bin: 2 });
        // Tree 1 root split on feature 0 at 0.5 → position 0 → bin 0.
        let condition = quantized.trees[1].node(0).condition().unwrap();
        assert_eq!(condition.test, SplitTest::QuantizedNumeric { bin: 0 });
        quantized.validate().expect("quantized model must validate");
    }

    #[test]
    fn deterministic() {
        let model = numeric_model();
        assert_eq!(quantize(&model), quantize(&model));
    }

    #[test]
    fn input_model_untouched() {
        let model = numeric_model();
        let before = model.clone();
        let _ = quantize(&model);
        assert_eq!(model, before);
    }

    #[test]
    fn quantizing_twice_is_identity() {
        let once = quantize(&numeric_model());
        let twice = quantize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn categorical_splits_untouched() {
        let mut builder = TreeBuilder::new();
        builder.add_test(SplitCondition::categorical(0, vec![0, 2], false, true), 1, 2);
        builder.add_leaf(1.0);
        builder.add_leaf(2.0);
        let model = Model::new(vec![builder.build()], ModelMeta::regression(1));

        let quantized = quantize(&model);
        assert_eq!(quantized.trees, model.trees);
        // The categorical feature gets an empty (never consulted) table.
        assert_eq!(quantized.quant.as_ref().unwrap().cuts(0), &[] as &[f64]);
    }

    #[test]
    fn bin_encoding() {
        let quantized = quantize(&numeric_model());
        let quant = quantized.quant.as_ref().unwrap();
        // cuts(0) == [0.5, 1.5]
        assert_eq!(quant.bin_of(0, 0.2), -1); // below all cuts
        assert_eq!(quant.bin_of(0, 0.5), 0); // equal to cut 0
        assert_eq!(quant.bin_of(0, 1.0), 1); // between cuts
        assert_eq!(quant.bin_of(0, 1.5), 2); // equal to cut 1
        assert_eq!(quant.bin_of(0, 9.0), 3); // above all cuts
    }

    #[test]
    fn bin_comparison_matches_float_comparison() {
        let quantized = quantize(&numeric_model());
        let quant = quantized.quant.as_ref().unwrap();
        let cuts = [0.5, 1.5];
        let probes = [-1.0, 0.0, 0.5, 0.6, 1.49, 1.5, 1.51, 100.0];
        for &threshold in &cuts {
            let stored = 2 * cuts.iter().position(|&c| c == threshold).unwrap() as i64;
            for &value in &probes {
                assert_eq!(
                    quant.bin_of(0, value) < stored,
                    value < threshold,
                    "value {value} vs threshold {threshold}"
                );
            }
        }
    }
}
