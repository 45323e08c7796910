//! lumber: a decision-tree-ensemble compiler and inference runtime.
//!
//! This crate takes tree ensembles trained by external boosting libraries
//! (LightGBM, XGBoost), lowers them to C source that reproduces the ensemble's
//! decision logic exactly, builds that source into a native shared library,
//! and loads the library to serve batched predictions.
//!
//! # Pipeline
//!
//! ```text
//! model file ──load──► Model IR ──[quantize]──► C source units ──build──► .so
//!                                                                          │
//!                        DenseMatrix / CsrMatrix ──predict──► Predictor ◄──┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lumber::{loaders, codegen::CompileOptions, toolchain::BuildConfig};
//! use lumber::runtime::{DenseMatrix, Predictor};
//!
//! let model = loaders::load("model.txt", "lightgbm")?;
//! let libpath = lumber::export_lib(
//!     &model,
//!     "model.so",
//!     &CompileOptions { quantize: true, ..Default::default() },
//!     &BuildConfig::default(),
//! )?;
//! let predictor = Predictor::load(&libpath)?;
//! let features = DenseMatrix::from_vec(data, num_rows, num_features);
//! let predictions = predictor.predict(&features, false)?;
//! ```

pub mod codegen;
pub mod loaders;
pub mod model;
pub mod quantize;
pub mod runtime;
pub mod toolchain;

mod export;

pub use export::{export_lib, ExportError};
pub use model::{Model, ModelMeta, OutputTransform, TaskType};
