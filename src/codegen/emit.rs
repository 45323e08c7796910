//! C emission for individual trees.
//!
//! Each tree lowers to one `static double` function walking nested if/else
//! blocks from the root to a `return <leaf>`. The branch condition of every
//! test node is a single boolean expression computing "go left", built by
//! [`left_condition`]; the shapes it produces are fixed so the runtime, the
//! reference evaluator, and the generated code cannot drift apart.

use std::fmt::Write;

use crate::model::{MissingPolicy, Node, NodeId, SplitCondition, SplitTest, Tree};
use crate::quantize::QuantTables;

/// Render an `f64` as a C double literal.
///
/// Rust's shortest round-trip formatting re-parses to the identical double
/// under C's `strtod`, so thresholds and leaf values survive the trip through
/// source text exactly.
pub(crate) fn fmt_double(value: f64) -> String {
    if value.is_infinite() {
        return if value > 0.0 {
            "INFINITY".to_owned()
        } else {
            "-INFINITY".to_owned()
        };
    }
    debug_assert!(!value.is_nan(), "NaN constant in generated code");
    format!("{value:?}")
}

/// Whether any node of the tree performs a categorical test (and therefore
/// needs the scratch category variable).
fn has_categorical(tree: &Tree) -> bool {
    tree.nodes().any(|node| {
        matches!(
            node.condition().map(|c| &c.test),
            Some(SplitTest::Categorical { .. })
        )
    })
}

/// Emit one tree as a `static double <name>(const union Entry* row)`.
pub(crate) fn emit_tree(
    out: &mut String,
    name: &str,
    tree: &Tree,
    quant: Option<&QuantTables>,
    annotate: bool,
) {
    let _ = writeln!(out, "static double {name}(const union Entry* row) {{");
    if has_categorical(tree) {
        out.push_str("  int64_t ctmp;\n");
    }
    emit_node(out, tree, 0, quant, annotate, 1);
    out.push_str("}\n");
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn emit_node(
    out: &mut String,
    tree: &Tree,
    id: NodeId,
    quant: Option<&QuantTables>,
    annotate: bool,
    depth: usize,
) {
    match tree.node(id) {
        Node::Leaf { value } => {
            indent(out, depth);
            let _ = writeln!(out, "return {};", fmt_double(*value));
        }
        Node::Test {
            condition,
            left,
            right,
        } => {
            if annotate {
                indent(out, depth);
                let _ = writeln!(out, "/* node {id}: feature {} */", condition.feature);
            }
            indent(out, depth);
            let _ = writeln!(out, "if ({}) {{", left_condition(condition, quant));
            emit_node(out, tree, *left, quant, annotate, depth + 1);
            indent(out, depth);
            out.push_str("} else {\n");
            emit_node(out, tree, *right, quant, annotate, depth + 1);
            indent(out, depth);
            out.push_str("}\n");
        }
    }
}

/// Build the "go left" expression for a test node.
pub(crate) fn left_condition(condition: &SplitCondition, quant: Option<&QuantTables>) -> String {
    let f = condition.feature;
    let present = format!("(row[{f}].missing != -1)");

    match (&condition.test, condition.missing) {
        (SplitTest::Numeric { threshold }, MissingPolicy::DefaultDirection) => {
            let cmp = format!("row[{f}].fvalue < {}", fmt_double(*threshold));
            wrap_default_direction(&present, &cmp, condition.default_left)
        }
        (SplitTest::Numeric { threshold }, MissingPolicy::TreatAsZero) => {
            format!(
                "({present} ? row[{f}].fvalue : 0.0) < {}",
                fmt_double(*threshold)
            )
        }
        (SplitTest::QuantizedNumeric { bin }, MissingPolicy::DefaultDirection) => {
            let cmp = format!("row[{f}].qvalue < {bin}");
            wrap_default_direction(&present, &cmp, condition.default_left)
        }
        (SplitTest::QuantizedNumeric { bin }, MissingPolicy::TreatAsZero) => {
            let zero_bin = quant
                .expect("quantized node in model without cut tables")
                .bin_of(f, 0.0);
            format!("({present} ? row[{f}].qvalue : ({zero_bin})) < {bin}")
        }
        (
            SplitTest::Categorical {
                categories,
                goes_right,
            },
            missing,
        ) => {
            let go_left = category_go_left(f, categories, *goes_right);
            match missing {
                MissingPolicy::DefaultDirection => {
                    wrap_default_direction(&present, &go_left, condition.default_left)
                }
                MissingPolicy::TreatAsZero => {
                    // Missing becomes category 0; its routing is a constant.
                    let matched_zero = categories.first() == Some(&0);
                    let missing_goes_left = matched_zero != *goes_right;
                    format!(
                        "({present} ? ({go_left}) : {})",
                        if missing_goes_left { 1 } else { 0 }
                    )
                }
            }
        }
    }
}

/// Combine a presence check with a value comparison under the
/// default-direction missing policy.
fn wrap_default_direction(present: &str, cmp: &str, default_left: bool) -> String {
    if default_left {
        format!("!{present} || ({cmp})")
    } else {
        format!("{present} && ({cmp})")
    }
}

/// Membership test routed to a "go left" boolean.
///
/// Lowered as one equality chain over the matched set; huge category sets
/// therefore produce huge conditional expressions, which some toolchains
/// refuse at high optimization levels. That is a toolchain limit, not a
/// lowering bug; callers work around it with `extra_flags` such as `-O0`.
fn category_go_left(feature: u32, categories: &[u32], goes_right: bool) -> String {
    // Truncating cast with range guard; matches the reference evaluator.
    let convert = format!(
        "ctmp = (row[{feature}].fvalue >= 0.0 && row[{feature}].fvalue < 4294967296.0) \
         ? (int64_t)(row[{feature}].fvalue) : (int64_t)-1"
    );
    let matched = if categories.is_empty() {
        "0".to_owned()
    } else {
        categories
            .iter()
            .map(|c| format!("ctmp == {c}"))
            .collect::<Vec<_>>()
            .join(" || ")
    };
    if goes_right {
        format!("({convert}, !({matched}))")
    } else {
        format!("({convert}, ({matched}))")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelMeta, TreeBuilder};
    use crate::quantize::quantize;
    use crate::Model;

    #[test]
    fn doubles_round_trip_through_text() {
        assert_eq!(fmt_double(0.5), "0.5");
        assert_eq!(fmt_double(-1.0), "-1.0");
        assert_eq!(fmt_double(1e300), "1e300");
        assert_eq!(fmt_double(f64::INFINITY), "INFINITY");
        assert_eq!(fmt_double(f64::NEG_INFINITY), "-INFINITY");
        // Shortest repr of a non-terminating binary fraction still
        // round-trips exactly.
        let v = 0.1f64;
        assert_eq!(fmt_double(v).parse::<f64>().unwrap(), v);
    }

    #[test]
    fn numeric_default_left() {
        let cond = SplitCondition::numeric(2, 1.5, true);
        assert_eq!(
            left_condition(&cond, None),
            "!(row[2].missing != -1) || (row[2].fvalue < 1.5)"
        );
    }

    #[test]
    fn numeric_default_right() {
        let cond = SplitCondition::numeric(2, 1.5, false);
        assert_eq!(
            left_condition(&cond, None),
            "(row[2].missing != -1) && (row[2].fvalue < 1.5)"
        );
    }

    #[test]
    fn numeric_treat_as_zero() {
        let cond =
            SplitCondition::numeric(0, 0.5, true).with_missing_policy(MissingPolicy::TreatAsZero);
        assert_eq!(
            left_condition(&cond, None),
            "((row[0].missing != -1) ? row[0].fvalue : 0.0) < 0.5"
        );
    }

    #[test]
    fn categorical_matched_set_goes_left() {
        let cond = SplitCondition::categorical(1, vec![0, 2], false, true);
        let expr = left_condition(&cond, None);
        assert!(expr.contains("ctmp == 0 || ctmp == 2"), "{expr}");
        assert!(expr.starts_with("!(row[1].missing != -1) ||"), "{expr}");
    }

    #[test]
    fn categorical_goes_right_negates_membership() {
        let cond = SplitCondition::categorical(1, vec![3], true, false);
        let expr = left_condition(&cond, None);
        assert!(expr.contains("!(ctmp == 3)"), "{expr}");
    }

    #[test]
    fn categorical_treat_as_zero_routes_by_constant() {
        let matched = SplitCondition::categorical(0, vec![0, 2], false, false)
            .with_missing_policy(MissingPolicy::TreatAsZero);
        // Category 0 is matched and matched goes left.
        assert!(left_condition(&matched, None).ends_with(": 1)"));

        let unmatched = SplitCondition::categorical(0, vec![2], false, false)
            .with_missing_policy(MissingPolicy::TreatAsZero);
        assert!(left_condition(&unmatched, None).ends_with(": 0)"));
    }

    #[test]
    fn quantized_conditions_compare_bins() {
        let mut builder = TreeBuilder::new();
        builder.add_numeric_split(0, 1.5, true, 1, 2);
        builder.add_leaf(-1.0);
        builder.add_leaf(1.0);
        let model = quantize(&Model::new(
            vec![builder.build()],
            ModelMeta::regression(1),
        ));

        let cond = model.trees[0].node(0).condition().unwrap();
        assert_eq!(
            left_condition(cond, model.quant.as_ref()),
            "!(row[0].missing != -1) || (row[0].qvalue < 0)"
        );
    }

    #[test]
    fn quantized_treat_as_zero_uses_zero_bin() {
        let mut builder = TreeBuilder::new();
        builder.add_test(
            SplitCondition::numeric(0, 1.5, true).with_missing_policy(MissingPolicy::TreatAsZero),
            1,
            2,
        );
        builder.add_leaf(-1.0);
        builder.add_leaf(1.0);
        let model = quantize(&Model::new(
            vec![builder.build()],
            ModelMeta::regression(1),
        ));

        let cond = model.trees[0].node(0).condition().unwrap();
        // 0.0 sits below the only cut (1.5), so its bin is -1.
        assert_eq!(
            left_condition(cond, model.quant.as_ref()),
            "((row[0].missing != -1) ? row[0].qvalue : (-1)) < 0"
        );
    }

    #[test]
    fn tree_emission_shape() {
        let mut builder = TreeBuilder::new();
        builder.add_numeric_split(0, 0.5, true, 1, 2);
        builder.add_leaf(-1.0);
        builder.add_leaf(1.0);
        let tree = builder.build();

        let mut out = String::new();
        emit_tree(&mut out, "tree0", &tree, None, false);

        assert!(out.starts_with("static double tree0(const union Entry* row) {"));
        assert!(out.contains("return -1.0;"));
        assert!(out.contains("return 1.0;"));
        assert!(out.ends_with("}\n"));
        // No categorical nodes, no scratch variable.
        assert!(!out.contains("ctmp"));
    }

    #[test]
    fn annotation_marks_nodes() {
        let mut builder = TreeBuilder::new();
        builder.add_numeric_split(3, 0.5, true, 1, 2);
        builder.add_leaf(-1.0);
        builder.add_leaf(1.0);
        let tree = builder.build();

        let mut out = String::new();
        emit_tree(&mut out, "tree0", &tree, None, true);
        assert!(out.contains("/* node 0: feature 3 */"));
    }
}
