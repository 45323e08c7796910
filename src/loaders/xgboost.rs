//! XGBoost JSON model loader.
//!
//! Parses the JSON document written by XGBoost >= 1.0 `save_model()` into the
//! model IR. Only tree boosters (`gbtree`) are supported.
//!
//! XGBoost always records a per-node default branch for missing values, so
//! every node maps to [`MissingPolicy::DefaultDirection`]. Numeric splits
//! already use strict `<`; thresholds are taken verbatim. Categorical splits
//! route the recorded category set to the right child.
//!
//! XGBoost serializes many numeric scalars as strings (`"num_class": "3"`),
//! so the scalar fields go through string-tolerant deserializers.

use std::path::Path;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::ParseError;
use crate::model::{
    MissingPolicy, Model, ModelMeta, Node, OutputTransform, SplitCondition, TaskType, Tree,
};

/// Parse an XGBoost JSON model from a file.
pub fn load_file(path: impl AsRef<Path>) -> Result<Model, ParseError> {
    let content = std::fs::read_to_string(path)?;
    load_str(&content)
}

/// Parse an XGBoost JSON model from a string.
pub fn load_str(content: &str) -> Result<Model, ParseError> {
    let doc: XgbJson = serde_json::from_str(content)?;
    convert(doc)
}

// =============================================================================
// JSON document types
// =============================================================================

#[derive(Debug, Deserialize)]
struct XgbJson {
    learner: Learner,
}

#[derive(Debug, Deserialize)]
struct Learner {
    gradient_booster: GradientBooster,
    learner_model_param: LearnerModelParam,
    objective: Objective,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "name")]
enum GradientBooster {
    #[serde(rename = "gbtree")]
    Gbtree { model: TreeModel },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Deserialize)]
struct LearnerModelParam {
    #[serde(deserialize_with = "scalar_f64", default)]
    base_score: f64,
    #[serde(deserialize_with = "scalar_u32", default)]
    num_class: u32,
    #[serde(deserialize_with = "scalar_u32", default)]
    num_feature: u32,
}

#[derive(Debug, Deserialize)]
struct Objective {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TreeModel {
    trees: Vec<XgbTree>,
    #[serde(default)]
    tree_info: Vec<i32>,
}

#[derive(Debug, Deserialize)]
struct XgbTree {
    base_weights: Vec<f64>,
    left_children: Vec<i64>,
    right_children: Vec<i64>,
    split_conditions: Vec<f64>,
    split_indices: Vec<u32>,
    default_left: Vec<i32>,
    #[serde(default)]
    split_type: Vec<i32>,
    #[serde(default)]
    categories: Vec<i64>,
    #[serde(default)]
    categories_nodes: Vec<i32>,
    #[serde(default)]
    categories_segments: Vec<i64>,
    #[serde(default)]
    categories_sizes: Vec<i64>,
}

/// Accept a JSON number or a stringified number (`0.5` or `"5E-1"`).
fn scalar_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    use serde::de::Error as SerdeError;
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().ok_or_else(|| SerdeError::custom("invalid number")),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| SerdeError::custom(format!("cannot parse number from {s:?}"))),
        other => Err(SerdeError::custom(format!(
            "expected number or string, got {other}"
        ))),
    }
}

fn scalar_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    use serde::de::Error as SerdeError;
    let value = scalar_f64(deserializer)?;
    if value >= 0.0 && value == value.trunc() {
        Ok(value as u32)
    } else {
        Err(SerdeError::custom(format!("invalid integer {value}")))
    }
}

// =============================================================================
// Conversion
// =============================================================================

fn convert(doc: XgbJson) -> Result<Model, ParseError> {
    let tree_model = match doc.learner.gradient_booster {
        GradientBooster::Gbtree { model } => model,
        GradientBooster::Unsupported => {
            return Err(ParseError::InvalidValue {
                field: "gradient_booster",
                message: "only gbtree boosters are supported".to_owned(),
            })
        }
    };

    let param = &doc.learner.learner_model_param;
    let num_class = param.num_class.max(1);
    let objective = doc.learner.objective.name.as_str();

    // Trees must be grouped round-robin over classes; XGBoost training
    // produces exactly that order and records it in tree_info.
    for (tree_idx, &group) in tree_model.tree_info.iter().enumerate() {
        if group != (tree_idx % num_class as usize) as i32 {
            return Err(ParseError::InvalidValue {
                field: "tree_info",
                message: format!("tree {tree_idx} assigned to group {group}, expected round-robin"),
            });
        }
    }

    let trees = tree_model
        .trees
        .iter()
        .enumerate()
        .map(|(tree_idx, tree)| convert_tree(tree_idx, tree))
        .collect::<Result<Vec<_>, _>>()?;

    let (task_type, output_transform) = classify_objective(objective, num_class);
    let meta = ModelMeta {
        num_feature: param.num_feature,
        num_class,
        task_type,
        output_transform,
        sigmoid_alpha: 1.0,
        base_score: margin_base_score(param.base_score, objective),
        average_tree_output: false,
    };

    let model = Model::new(trees, meta);
    model.validate()?;
    log::debug!(
        "parsed XGBoost model: {} trees, {} features, objective {objective}",
        model.num_tree(),
        model.num_feature()
    );
    Ok(model)
}

fn classify_objective(objective: &str, num_class: u32) -> (TaskType, OutputTransform) {
    match objective {
        "binary:logistic" | "reg:logistic" => {
            (TaskType::BinaryClassification, OutputTransform::Sigmoid)
        }
        "binary:logitraw" => (TaskType::BinaryClassification, OutputTransform::RawMargin),
        "multi:softprob" | "multi:softmax" => {
            (TaskType::MulticlassClassification, OutputTransform::Softmax)
        }
        "rank:pairwise" | "rank:ndcg" | "rank:map" => (TaskType::Ranking, OutputTransform::Identity),
        name => {
            if !name.starts_with("reg:") && !name.starts_with("survival:") {
                log::warn!("unrecognized XGBoost objective {name:?}; treating as regression");
            }
            if num_class > 1 {
                (TaskType::MulticlassClassification, OutputTransform::Softmax)
            } else {
                (TaskType::Regression, OutputTransform::Identity)
            }
        }
    }
}

/// XGBoost stores `base_score` in probability space for logistic objectives;
/// margins need it in logit space.
fn margin_base_score(base_score: f64, objective: &str) -> f64 {
    match objective {
        "binary:logistic" | "reg:logistic" => {
            let p = base_score.clamp(1e-7, 1.0 - 1e-7);
            (p / (1.0 - p)).ln()
        }
        "reg:gamma" | "reg:tweedie" => base_score.max(1e-7).ln(),
        _ => base_score,
    }
}

fn convert_tree(tree_idx: usize, tree: &XgbTree) -> Result<Tree, ParseError> {
    let num_nodes = tree.left_children.len();
    let check = |field: &'static str, len: usize| {
        if len != num_nodes {
            Err(ParseError::ArraySizeMismatch {
                field,
                expected: num_nodes,
                actual: len,
            })
        } else {
            Ok(())
        }
    };
    check("right_children", tree.right_children.len())?;
    check("base_weights", tree.base_weights.len())?;
    check("split_conditions", tree.split_conditions.len())?;
    check("split_indices", tree.split_indices.len())?;
    check("default_left", tree.default_left.len())?;
    if !tree.split_type.is_empty() {
        check("split_type", tree.split_type.len())?;
    }

    let mut nodes = Vec::with_capacity(num_nodes);
    for node_idx in 0..num_nodes {
        let left = tree.left_children[node_idx];
        let right = tree.right_children[node_idx];

        // XGBoost marks leaves with child index -1.
        if left == -1 {
            nodes.push(Node::Leaf {
                value: tree.base_weights[node_idx],
            });
            continue;
        }
        for child in [left, right] {
            if child < 0 || child as usize >= num_nodes {
                return Err(ParseError::InvalidChildRef {
                    tree: tree_idx,
                    child,
                });
            }
        }

        let feature = tree.split_indices[node_idx];
        let default_left = tree.default_left[node_idx] != 0;
        let categorical = tree.split_type.get(node_idx).copied() == Some(1);

        let condition = if categorical {
            let categories = node_categories(tree_idx, tree, node_idx as i32)?;
            // XGBoost's recorded set is the categories that go right.
            SplitCondition::categorical(feature, categories, true, default_left)
        } else {
            SplitCondition::numeric(feature, tree.split_conditions[node_idx], default_left)
        }
        .with_missing_policy(MissingPolicy::DefaultDirection);

        nodes.push(Node::Test {
            condition,
            left: left as u32,
            right: right as u32,
        });
    }
    Ok(Tree::new(nodes))
}

/// Resolve the category list of one categorical node from the tree's
/// segment arrays.
fn node_categories(tree_idx: usize, tree: &XgbTree, node: i32) -> Result<Vec<u32>, ParseError> {
    let slot = tree
        .categories_nodes
        .iter()
        .position(|&n| n == node)
        .ok_or(ParseError::InvalidValue {
            field: "categories_nodes",
            message: format!("tree {tree_idx}: node {node} has no category segment"),
        })?;
    let segment = tree.categories_segments.get(slot).copied().zip(
        tree.categories_sizes.get(slot).copied(),
    );
    let (start, size) = segment.ok_or(ParseError::ArraySizeMismatch {
        field: "categories_segments",
        expected: tree.categories_nodes.len(),
        actual: tree.categories_segments.len().min(tree.categories_sizes.len()),
    })?;
    let bad_segment = || ParseError::InvalidValue {
        field: "categories_segments",
        message: format!("tree {tree_idx}: segment {start}+{size} out of range"),
    };
    let raw = usize::try_from(start)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(start, size)| start.checked_add(size).map(|end| (start, end)))
        .and_then(|(start, end)| tree.categories.get(start..end))
        .ok_or_else(bad_segment)?;

    raw.iter()
        .map(|&category| {
            u32::try_from(category).map_err(|_| ParseError::NegativeCategory {
                tree: tree_idx,
                category,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
