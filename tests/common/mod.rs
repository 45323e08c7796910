//! Shared fixtures for the end-to-end pipeline tests.

use std::path::PathBuf;

use lumber::model::{MissingPolicy, ModelMeta, SplitCondition, Tree, TreeBuilder};
use lumber::toolchain::{BuildConfig, Toolchain};
use lumber::Model;

/// Build config for the platform default toolchain, or `None` (with a
/// notice) when no compiler is installed.
pub fn build_config_or_skip() -> Option<BuildConfig> {
    let toolchain = Toolchain::default();
    if !toolchain.is_available() {
        eprintln!(
            "skipping: toolchain {:?} not available on this machine",
            toolchain
        );
        return None;
    }
    Some(BuildConfig {
        toolchain,
        ..Default::default()
    })
}

/// Platform-appropriate library path inside `dir`.
pub fn lib_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path()
        .join(format!("{name}.{}", std::env::consts::DLL_EXTENSION))
}

/// Regression ensemble with two depth-2 numeric trees over 3 features,
/// default-direction missing handling.
pub fn numeric_model() -> Model {
    let mut t0 = TreeBuilder::new();
    t0.add_numeric_split(0, 0.5, true, 1, 2);
    t0.add_numeric_split(1, -1.25, false, 3, 4);
    t0.add_leaf(2.0);
    t0.add_leaf(-3.0);
    t0.add_leaf(0.5);

    let mut t1 = TreeBuilder::new();
    t1.add_numeric_split(2, 10.0, false, 1, 2);
    t1.add_leaf(1.0);
    t1.add_numeric_split(0, 0.5, true, 3, 4);
    t1.add_leaf(-0.25);
    t1.add_leaf(4.0);

    let model = Model::new(vec![t0.build(), t1.build()], ModelMeta::regression(3));
    model.validate().expect("fixture must validate");
    model
}

/// Single-tree ensemble whose nodes substitute zero for missing values.
pub fn treat_as_zero_model() -> Model {
    let mut builder = TreeBuilder::new();
    builder.add_test(
        SplitCondition::numeric(0, 0.5, false).with_missing_policy(MissingPolicy::TreatAsZero),
        1,
        2,
    );
    builder.add_test(
        SplitCondition::numeric(1, -2.0, false).with_missing_policy(MissingPolicy::TreatAsZero),
        3,
        4,
    );
    builder.add_leaf(7.0);
    builder.add_leaf(-1.0);
    builder.add_leaf(1.0);

    let model = Model::new(vec![builder.build()], ModelMeta::regression(2));
    model.validate().expect("fixture must validate");
    model
}

/// Categorical-only ensemble: f0 in {0, 2} goes left, f1 in {1} goes right.
pub fn categorical_model() -> Model {
    let mut builder = TreeBuilder::new();
    builder.add_categorical_split(0, vec![0, 2], false, true, 1, 2);
    builder.add_leaf(-5.0);
    builder.add_categorical_split(1, vec![1], true, false, 3, 4);
    builder.add_leaf(1.0);
    builder.add_leaf(5.0);

    let model = Model::new(vec![builder.build()], ModelMeta::regression(2));
    model.validate().expect("fixture must validate");
    model
}

/// Three-class softmax ensemble: two rounds of trees, round-robin groups.
pub fn multiclass_model() -> Model {
    let mut trees = Vec::new();
    for round in 0..2 {
        for class in 0..3 {
            let mut builder = TreeBuilder::new();
            builder.add_numeric_split(class, 0.0, true, 1, 2);
            builder.add_leaf(0.25 * (class + 1) as f64 + round as f64);
            builder.add_leaf(-0.5 * (class + 1) as f64);
            trees.push(builder.build());
        }
    }
    let model = Model::new(trees, ModelMeta::multiclass(3, 3));
    model.validate().expect("fixture must validate");
    model
}

/// Random-forest style binary model: averaged trees, sigmoid transform,
/// non-zero base score, plus a constant tree.
pub fn averaged_binary_model() -> Model {
    let mut t0 = TreeBuilder::new();
    t0.add_numeric_split(0, 0.0, true, 1, 2);
    t0.add_leaf(-2.0);
    t0.add_leaf(2.0);

    let mut meta = ModelMeta::binary(1);
    meta.average_tree_output = true;
    meta.base_score = 0.5;
    let model = Model::new(vec![t0.build(), Tree::constant(1.0)], meta);
    model.validate().expect("fixture must validate");
    model
}

/// Probe rows exercising both branches of every fixture split, missing
/// values included.
pub fn probe_rows(num_features: usize) -> Vec<Vec<f64>> {
    let patterns: &[&[f64]] = &[
        &[0.0, 0.0, 0.0, 0.0],
        &[1.0, 2.0, 3.0, 4.0],
        &[-1.0, -2.0, -3.0, -4.0],
        &[0.5, -1.25, 10.0, 0.5],
        &[0.49, -1.26, 9.9, 2.0],
        &[f64::NAN, 0.0, 0.0, 0.0],
        &[0.0, f64::NAN, 0.0, 0.0],
        &[f64::NAN, f64::NAN, f64::NAN, f64::NAN],
        &[2.0, 1.0, 0.0, 3.0],
        &[100.0, -100.0, 1e-9, -1e-9],
    ];
    patterns
        .iter()
        .map(|p| p[..num_features].to_vec())
        .collect()
}
