//! LightGBM text model loader.
//!
//! Parses the line-based `key=value` format written by LightGBM's
//! `save_model()` and converts it to the model IR.
//!
//! # Missing values
//!
//! LightGBM records a per-node `missing_type`. When it is `NaN` the node
//! carries a default direction like XGBoost; for `None` and `Zero` the
//! trainer substitutes 0.0 for missing values before comparing, so those
//! nodes map to [`MissingPolicy::TreatAsZero`].
//!
//! # Comparison operator
//!
//! LightGBM numeric splits send `value <= threshold` left; the IR comparison
//! is strict `<`. Thresholds are therefore stored as the next representable
//! double up, which preserves the decision for every representable input.

use std::collections::HashMap;
use std::path::Path;

use super::ParseError;
use crate::model::{
    MissingPolicy, Model, ModelMeta, Node, NodeId, OutputTransform, SplitCondition, TaskType, Tree,
};

/// Parse a LightGBM text model from a file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Model, ParseError> {
    let content = std::fs::read_to_string(path)?;
    load_str(&content)
}

/// Parse a LightGBM text model from a string.
pub fn load_str(content: &str) -> Result<Model, ParseError> {
    let mut lines = content.lines().peekable();
    let header = Header::parse(&mut lines)?;

    let mut trees = Vec::new();
    while let Some(line) = lines.peek() {
        if line.starts_with("Tree=") {
            lines.next();
            let fields = Fields::parse_section(&mut lines);
            trees.push(convert_tree(trees.len(), &fields)?);
        } else if line.trim() == "end of trees" {
            break;
        } else {
            lines.next();
        }
    }

    let model = Model::new(trees, header.into_meta());
    model.validate()?;
    log::debug!(
        "parsed LightGBM model: {} trees, {} features, {} classes",
        model.num_tree(),
        model.num_feature(),
        model.meta.num_class
    );
    Ok(model)
}

// =============================================================================
// Header
// =============================================================================

struct Header {
    num_class: u32,
    num_feature: u32,
    objective: Objective,
    average_output: bool,
}

impl Header {
    fn parse(lines: &mut std::iter::Peekable<std::str::Lines>) -> Result<Self, ParseError> {
        let mut average_output = false;
        let mut kv = HashMap::new();
        while let Some(line) = lines.peek() {
            if line.starts_with("Tree=") {
                break;
            }
            let line = lines.next().unwrap_or_default();
            if let Some((key, value)) = line.split_once('=') {
                kv.insert(key.to_owned(), value.to_owned());
            } else if line.trim() == "average_output" {
                average_output = true;
            }
        }
        let fields = Fields(kv);

        Ok(Self {
            num_class: fields.required("num_class")?,
            num_feature: fields
                .required::<u32>("max_feature_idx")
                .map(|idx| idx + 1)?,
            objective: Objective::parse(fields.raw("objective").unwrap_or("regression")),
            average_output,
        })
    }

    fn into_meta(self) -> ModelMeta {
        let (task_type, output_transform, sigmoid_alpha) = match self.objective {
            Objective::Regression => (TaskType::Regression, OutputTransform::Identity, 1.0),
            Objective::Binary { sigmoid } => (
                TaskType::BinaryClassification,
                OutputTransform::Sigmoid,
                sigmoid,
            ),
            Objective::Multiclass => (
                TaskType::MulticlassClassification,
                OutputTransform::Softmax,
                1.0,
            ),
            Objective::MulticlassOva { sigmoid } => (
                TaskType::MulticlassClassification,
                OutputTransform::Sigmoid,
                sigmoid,
            ),
            Objective::Ranking => (TaskType::Ranking, OutputTransform::Identity, 1.0),
        };
        ModelMeta {
            num_feature: self.num_feature,
            num_class: self.num_class,
            task_type,
            output_transform,
            sigmoid_alpha,
            // LightGBM folds the initial score into the leaf values.
            base_score: 0.0,
            average_tree_output: self.average_output,
        }
    }
}

/// Objective line, e.g. `binary sigmoid:1` or `multiclass num_class:3`.
enum Objective {
    Regression,
    Binary { sigmoid: f64 },
    Multiclass,
    MulticlassOva { sigmoid: f64 },
    Ranking,
}

impl Objective {
    fn parse(value: &str) -> Self {
        let mut parts = value.split_whitespace();
        let name = parts.next().unwrap_or("");
        let sigmoid = value
            .split_whitespace()
            .find_map(|p| p.strip_prefix("sigmoid:"))
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0);

        match name {
            "binary" | "cross_entropy" | "cross_entropy_lambda" | "xentropy" | "xentlambda" => {
                Objective::Binary { sigmoid }
            }
            "multiclass" | "softmax" => Objective::Multiclass,
            "multiclassova" | "multiclass_ova" | "ova" | "ovr" => {
                Objective::MulticlassOva { sigmoid }
            }
            "lambdarank" | "rank_xendcg" | "xendcg" => Objective::Ranking,
            name => {
                if !name.starts_with("regression")
                    && !matches!(name, "huber" | "fair" | "poisson" | "quantile" | "mape" | "gamma" | "tweedie" | "")
                {
                    log::warn!("unrecognized LightGBM objective {name:?}; treating as regression");
                }
                Objective::Regression
            }
        }
    }
}

// =============================================================================
// Field access
// =============================================================================

/// `key=value` fields of one model section with typed accessors.
struct Fields(HashMap<String, String>);

impl Fields {
    /// Consume lines up to the next section boundary.
    fn parse_section(lines: &mut std::iter::Peekable<std::str::Lines>) -> Self {
        let mut kv = HashMap::new();
        while let Some(line) = lines.peek() {
            if line.starts_with("Tree=") || line.trim() == "end of trees" {
                break;
            }
            let line = lines.next().unwrap_or_default();
            if line.trim().is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once('=') {
                kv.insert(key.to_owned(), value.to_owned());
            }
        }
        Self(kv)
    }

    fn raw(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn required<T: std::str::FromStr>(&self, key: &'static str) -> Result<T, ParseError> {
        let raw = self.raw(key).ok_or(ParseError::MissingField(key))?;
        raw.trim().parse().map_err(|_| ParseError::InvalidValue {
            field: key,
            message: format!("cannot parse {raw:?}"),
        })
    }

    fn optional<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ParseError> {
        match self.raw(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ParseError::InvalidValue {
                    field: key,
                    message: format!("cannot parse {raw:?}"),
                }),
        }
    }

    fn array<T: std::str::FromStr>(&self, key: &'static str) -> Result<Vec<T>, ParseError> {
        let raw = self.raw(key).ok_or(ParseError::MissingField(key))?;
        raw.split_whitespace()
            .map(|item| {
                item.parse().map_err(|_| ParseError::InvalidValue {
                    field: key,
                    message: format!("invalid element {item:?}"),
                })
            })
            .collect()
    }

    fn array_sized<T: std::str::FromStr>(
        &self,
        key: &'static str,
        expected: usize,
    ) -> Result<Vec<T>, ParseError> {
        let values = self.array(key)?;
        if values.len() != expected {
            return Err(ParseError::ArraySizeMismatch {
                field: key,
                expected,
                actual: values.len(),
            });
        }
        Ok(values)
    }
}

// =============================================================================
// Tree conversion
// =============================================================================

/// Decoded per-node `decision_type` bitfield.
///
/// Bit 0: categorical split; bit 1: default left; bits 2-3: missing type
/// (0 = None, 1 = Zero, 2 = NaN).
#[derive(Debug, Clone, Copy)]
struct DecisionType {
    is_categorical: bool,
    default_left: bool,
    missing: MissingPolicy,
}

impl DecisionType {
    fn from_bits(value: i8) -> Self {
        let v = value as u8;
        Self {
            is_categorical: (v & 1) != 0,
            default_left: (v & 2) != 0,
            missing: match (v >> 2) & 3 {
                2 => MissingPolicy::DefaultDirection,
                _ => MissingPolicy::TreatAsZero,
            },
        }
    }
}

fn convert_tree(tree_idx: usize, fields: &Fields) -> Result<Tree, ParseError> {
    let num_leaves: usize = fields.required("num_leaves")?;

    // A constant tree serializes as a single leaf_value and no split arrays.
    if num_leaves <= 1 {
        let value = fields
            .optional::<f64>("leaf_value")?
            .ok_or(ParseError::MissingField("leaf_value"))?;
        return Ok(Tree::constant(value));
    }

    let num_internal = num_leaves - 1;
    let split_feature: Vec<u32> = fields.array_sized("split_feature", num_internal)?;
    let threshold: Vec<f64> = fields.array_sized("threshold", num_internal)?;
    let decision_type: Vec<i8> = match fields.raw("decision_type") {
        Some(_) => fields.array_sized("decision_type", num_internal)?,
        None => vec![0; num_internal],
    };
    let left_child: Vec<i64> = fields.array_sized("left_child", num_internal)?;
    let right_child: Vec<i64> = fields.array_sized("right_child", num_internal)?;
    let leaf_value: Vec<f64> = fields.array_sized("leaf_value", num_leaves)?;
    let num_cat: usize = fields.optional("num_cat")?.unwrap_or(0);
    let (cat_boundaries, cat_threshold): (Vec<u32>, Vec<u32>) = if num_cat > 0 {
        (
            fields.array_sized("cat_boundaries", num_cat + 1)?,
            fields.array("cat_threshold")?,
        )
    } else {
        (Vec::new(), Vec::new())
    };

    // Internal nodes occupy arena slots 0..num_internal, leaves follow.
    // LightGBM references leaves as negative child values, `~child`.
    let child_slot = |tree: usize, child: i64| -> Result<NodeId, ParseError> {
        if child >= 0 {
            let idx = child as usize;
            if idx >= num_internal {
                return Err(ParseError::InvalidChildRef { tree, child });
            }
            Ok(idx as NodeId)
        } else {
            let leaf_idx = !child as usize;
            if leaf_idx >= num_leaves {
                return Err(ParseError::InvalidChildRef { tree, child });
            }
            Ok((num_internal + leaf_idx) as NodeId)
        }
    };

    let mut nodes = Vec::with_capacity(num_internal + num_leaves);
    for node_idx in 0..num_internal {
        let decision = DecisionType::from_bits(decision_type[node_idx]);
        let left = child_slot(tree_idx, left_child[node_idx])?;
        let right = child_slot(tree_idx, right_child[node_idx])?;

        let condition = if decision.is_categorical {
            let slot = threshold[node_idx] as usize;
            let categories =
                decode_category_bitset(tree_idx, slot, &cat_boundaries, &cat_threshold)?;
            // LightGBM routes matched categories to the left child.
            SplitCondition::categorical(split_feature[node_idx], categories, false, decision.default_left)
        } else {
            SplitCondition::numeric(
                split_feature[node_idx],
                next_up(threshold[node_idx]),
                decision.default_left,
            )
        }
        .with_missing_policy(decision.missing);

        nodes.push(Node::Test {
            condition,
            left,
            right,
        });
    }
    for &value in &leaf_value {
        nodes.push(Node::Leaf { value });
    }
    Ok(Tree::new(nodes))
}

/// Expand one categorical split's bitset into its category list.
fn decode_category_bitset(
    tree: usize,
    slot: usize,
    boundaries: &[u32],
    words: &[u32],
) -> Result<Vec<u32>, ParseError> {
    let out_of_range = || ParseError::InvalidValue {
        field: "cat_boundaries",
        message: format!("categorical slot {slot} out of range in tree {tree}"),
    };
    let start = *boundaries.get(slot).ok_or_else(out_of_range)? as usize;
    let end = *boundaries.get(slot + 1).ok_or_else(out_of_range)? as usize;
    let words = words.get(start..end).ok_or(ParseError::InvalidValue {
        field: "cat_threshold",
        message: format!("bitset {start}..{end} out of range in tree {tree}"),
    })?;

    let mut categories = Vec::new();
    for (word_idx, &word) in words.iter().enumerate() {
        for bit in 0..32 {
            if word & (1 << bit) != 0 {
                categories.push((word_idx * 32 + bit) as u32);
            }
        }
    }
    Ok(categories)
}

/// Next representable double above `value`.
fn next_up(value: f64) -> f64 {
    if value.is_nan() || value == f64::INFINITY {
        return value;
    }
    if value == 0.0 {
        return f64::from_bits(1);
    }
    let bits = value.to_bits();
    f64::from_bits(if value > 0.0 { bits + 1 } else { bits - 1 })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SplitTest;

    /// Two-tree regression model over 3 features:
    ///   tree 0: f0 <= 0.5 ? (f1 <= 0.25 ? 1 : 2) : 3, NaN-style missing
    ///   tree 1: constant 0.125
    const REGRESSION_MODEL: &str = "\
tree
version=v4
num_class=1
num_tree_per_iteration=1
label_index=0
max_feature_idx=2
objective=regression
feature_names=f0 f1 f2
tree_sizes=400 100

Tree=0
num_leaves=3
num_cat=0
split_feature=0 1
split_gain=10 5
threshold=0.5 0.25
decision_type=10 10
left_child=1 -1
right_child=-3 -2
leaf_value=1 2 3
leaf_weight=1 1 1
leaf_count=4 4 4
internal_value=0 0
internal_weight=0 0
internal_count=12 8
is_linear=0
shrinkage=0.1


Tree=1
num_leaves=1
num_cat=0
leaf_value=0.125
is_linear=0
shrinkage=1


end of trees

feature_importances:
f0=10
f1=5

parameters:
[boosting: gbdt]
end of parameters
";

    #[test]
    fn parses_regression_model() {
        let model = load_str(REGRESSION_MODEL).expect("model should parse");
        assert_eq!(model.num_tree(), 2);
        assert_eq!(model.num_feature(), 3);
        assert_eq!(model.meta.num_class, 1);
        assert_eq!(model.meta.task_type, TaskType::Regression);
        assert_eq!(model.meta.output_transform, OutputTransform::Identity);
        assert!(!model.meta.average_tree_output);
    }

    #[test]
    fn constant_tree_counts_toward_num_tree() {
        let model = load_str(REGRESSION_MODEL).expect("model should parse");
        assert_eq!(model.num_tree(), 2);
        assert_eq!(model.trees[1].num_nodes(), 1);
        assert_eq!(model.trees[1].node(0).leaf_value(), Some(0.125));
    }

    #[test]
    fn converted_tree_predicts_like_the_trainer() {
        let model = load_str(REGRESSION_MODEL).expect("model should parse");
        // f0 <= 0.5 and f1 <= 0.25 → leaf 1; constant tree adds 0.125.
        assert_eq!(model.predict_row(&[0.5, 0.25, 0.0]), vec![1.125]);
        // f0 <= 0.5, f1 > 0.25 → leaf 2.
        assert_eq!(model.predict_row(&[0.5, 0.3, 0.0]), vec![2.125]);
        // f0 > 0.5 → leaf 3.
        assert_eq!(model.predict_row(&[0.6, 0.0, 0.0]), vec![3.125]);
    }

    #[test]
    fn nan_missing_type_maps_to_default_direction() {
        let model = load_str(REGRESSION_MODEL).expect("model should parse");
        let condition = model.trees[0].node(0).condition().unwrap();
        // decision_type=10: bit1 set (default left), missing type NaN.
        assert_eq!(condition.missing, MissingPolicy::DefaultDirection);
        assert!(condition.default_left);
        // Missing f0 follows the default-left branch.
        assert_eq!(model.predict_row(&[f64::NAN, 0.25, 0.0]), vec![1.125]);
    }

    #[test]
    fn none_missing_type_maps_to_treat_as_zero() {
        let model_text = REGRESSION_MODEL.replace("decision_type=10 10", "decision_type=0 0");
        let model = load_str(&model_text).expect("model should parse");
        let condition = model.trees[0].node(0).condition().unwrap();
        assert_eq!(condition.missing, MissingPolicy::TreatAsZero);
        // Missing f0 behaves exactly like 0.0 (0.0 <= 0.5 → left subtree).
        assert_eq!(
            model.predict_row(&[f64::NAN, 0.3, 0.0]),
            model.predict_row(&[0.0, 0.3, 0.0]),
        );
    }

    #[test]
    fn le_threshold_becomes_strict_lt() {
        let model = load_str(REGRESSION_MODEL).expect("model should parse");
        let condition = model.trees[0].node(0).condition().unwrap();
        match condition.test {
            SplitTest::Numeric { threshold } => {
                assert!(threshold > 0.5);
                assert_eq!(threshold, next_up(0.5));
            }
            _ => panic!("expected numeric split"),
        }
        // Boundary value 0.5 still goes left, first value above goes right.
        assert_eq!(model.predict_row(&[0.5, 1.0, 0.0]), vec![2.125]);
        assert_eq!(model.predict_row(&[next_up(0.5), 1.0, 0.0]), vec![3.125]);
    }

    #[test]
    fn multiclass_header() {
        let text = REGRESSION_MODEL
            .replace("num_class=1", "num_class=2")
            .replace("objective=regression", "objective=multiclass num_class:2");
        let model = load_str(&text).expect("model should parse");
        assert_eq!(model.meta.num_class, 2);
        assert_eq!(model.meta.task_type, TaskType::MulticlassClassification);
        assert_eq!(model.meta.output_transform, OutputTransform::Softmax);
        // 2 trees round-robin over 2 classes.
        assert_eq!(model.trees_per_group(), 1);
    }

    #[test]
    fn binary_objective_reads_sigmoid_slope() {
        let text = REGRESSION_MODEL.replace("objective=regression", "objective=binary sigmoid:2");
        let model = load_str(&text).expect("model should parse");
        assert_eq!(model.meta.task_type, TaskType::BinaryClassification);
        assert_eq!(model.meta.output_transform, OutputTransform::Sigmoid);
        assert_eq!(model.meta.sigmoid_alpha, 2.0);
    }

    #[test]
    fn ranking_objective_keeps_raw_scores() {
        let text = REGRESSION_MODEL.replace("objective=regression", "objective=lambdarank");
        let model = load_str(&text).expect("model should parse");
        assert_eq!(model.meta.task_type, TaskType::Ranking);
        assert_eq!(model.meta.output_transform, OutputTransform::Identity);
    }

    #[test]
    fn average_output_flag() {
        let text = REGRESSION_MODEL.replace("label_index=0", "label_index=0\naverage_output");
        let model = load_str(&text).expect("model should parse");
        assert!(model.meta.average_tree_output);
    }

    #[test]
    fn categorical_split_decodes_bitset() {
        // One tree: f1 in {0, 2, 33} → leaf 1, else leaf 2.
        let text = "\
tree
version=v4
num_class=1
num_tree_per_iteration=1
max_feature_idx=1
objective=regression

Tree=0
num_leaves=2
num_cat=1
split_feature=1
split_gain=1
threshold=0
decision_type=1
left_child=-1
right_child=-2
leaf_value=1 2
cat_boundaries=0 2
cat_threshold=5 2

end of trees
";
        let model = load_str(text).expect("model should parse");
        let condition = model.trees[0].node(0).condition().unwrap();
        match &condition.test {
            SplitTest::Categorical {
                categories,
                goes_right,
            } => {
                // word 0 = 5 (bits 0, 2); word 1 = 2 (bit 1 → category 33).
                assert_eq!(&**categories, &[0, 2, 33]);
                assert!(!goes_right, "matched categories go left");
            }
            _ => panic!("expected categorical split"),
        }
        assert_eq!(model.predict_row(&[0.0, 2.0]), vec![1.0]);
        assert_eq!(model.predict_row(&[0.0, 33.0]), vec![1.0]);
        assert_eq!(model.predict_row(&[0.0, 1.0]), vec![2.0]);
    }

    #[test]
    fn missing_header_field_is_reported() {
        let text = REGRESSION_MODEL.replace("max_feature_idx=2\n", "");
        let err = load_str(&text).unwrap_err();
        assert!(matches!(err, ParseError::MissingField("max_feature_idx")));
    }

    #[test]
    fn array_size_mismatch_is_reported() {
        let text = REGRESSION_MODEL.replace("threshold=0.5 0.25", "threshold=0.5");
        let err = load_str(&text).unwrap_err();
        assert!(matches!(
            err,
            ParseError::ArraySizeMismatch {
                field: "threshold",
                expected: 2,
                actual: 1,
            }
        ));
    }

    #[test]
    fn bad_child_reference_is_reported() {
        let text = REGRESSION_MODEL.replace("right_child=-3 -2", "right_child=9 -2");
        let err = load_str(&text).unwrap_err();
        assert!(matches!(err, ParseError::InvalidChildRef { tree: 0, child: 9 }));
    }

    #[test]
    fn next_up_steps_one_ulp() {
        assert!(next_up(0.5) > 0.5);
        assert_eq!(next_up(0.5), f64::from_bits(0.5f64.to_bits() + 1));
        assert!(next_up(0.0) > 0.0);
        assert!(next_up(-1.0) > -1.0);
        assert_eq!(next_up(f64::INFINITY), f64::INFINITY);
    }
}
