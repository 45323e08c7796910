//! Predictor runtime.
//!
//! Loads a compiled model library and serves batched predictions from it.
//! The [`Predictor`] owns the OS library handle exclusively; once loaded it
//! is immutable, so concurrent [`Predictor::predict`] calls need no locking.
//! Dropping the predictor closes the handle.

mod dmatrix;
mod entry;
mod output;

pub use dmatrix::{CsrMatrix, DataMatrix, DenseMatrix};
pub use entry::Entry;
pub use output::PredictionOutput;

use std::path::Path;

use libloading::Library;
use rayon::prelude::*;

use crate::codegen::{ABI_VERSION, ENTRY_SYMBOL, INFO_SYMBOL};
use crate::model::{OutputTransform, TaskType};

/// Signature of the generated per-row entry point.
type PredictFn = unsafe extern "C" fn(*mut Entry, *mut f64);

// =============================================================================
// Metadata
// =============================================================================

/// Wire layout of the exported metadata symbol. Must match the
/// `struct ModelInfo` the code generator emits.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RawModelInfo {
    abi_version: u32,
    num_tree: u32,
    num_class: u32,
    num_feature: u32,
    task_type: u32,
    output_transform: u32,
    average_tree_output: u32,
    reserved: u32,
    sigmoid_alpha: f64,
    base_score: f64,
}

/// Ensemble metadata read from a compiled artifact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub num_tree: u32,
    pub num_class: u32,
    pub num_feature: u32,
    pub task_type: TaskType,
    pub output_transform: OutputTransform,
    pub average_tree_output: bool,
    pub sigmoid_alpha: f64,
    pub base_score: f64,
}

impl TryFrom<RawModelInfo> for ModelInfo {
    type Error = LoadError;

    fn try_from(raw: RawModelInfo) -> Result<Self, LoadError> {
        if raw.abi_version != ABI_VERSION {
            return Err(LoadError::AbiMismatch {
                expected: ABI_VERSION,
                found: raw.abi_version,
            });
        }
        Ok(Self {
            num_tree: raw.num_tree,
            num_class: raw.num_class,
            num_feature: raw.num_feature,
            task_type: TaskType::from_code(raw.task_type)
                .ok_or(LoadError::UnknownTaskType(raw.task_type))?,
            output_transform: OutputTransform::from_code(raw.output_transform)
                .ok_or(LoadError::UnknownTransform(raw.output_transform))?,
            average_tree_output: raw.average_tree_output != 0,
            sigmoid_alpha: raw.sigmoid_alpha,
            base_score: raw.base_score,
        })
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error type for loading compiled artifacts.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: libloading::Error,
    },
    #[error("artifact is missing symbol {symbol:?} (stale or incompatible build?): {source}")]
    MissingSymbol {
        symbol: &'static str,
        source: libloading::Error,
    },
    #[error("artifact ABI version {found} does not match runtime version {expected}; rebuild the model")]
    AbiMismatch { expected: u32, found: u32 },
    #[error("artifact declares unknown task type code {0}")]
    UnknownTaskType(u32),
    #[error("artifact declares unknown output transform code {0}")]
    UnknownTransform(u32),
}

/// Error type for prediction calls.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("feature count mismatch: model expects {expected} features, matrix has {actual}")]
    FeatureCountMismatch { expected: usize, actual: usize },
}

// =============================================================================
// Predictor
// =============================================================================

/// A loaded compiled model.
///
/// Safe to share across threads; `predict` never mutates the predictor.
/// Loading and dropping are the only points touching the OS handle, and
/// exclusive ownership serializes them by construction.
pub struct Predictor {
    entry: PredictFn,
    info: ModelInfo,
    // Kept alive for the duration of `entry`; dropped last on teardown.
    _lib: Library,
}

impl std::fmt::Debug for Predictor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Predictor").field("info", &self.info).finish()
    }
}

impl Predictor {
    /// Load a compiled model library.
    ///
    /// Resolves the metadata symbol first and validates the ABI version, so
    /// a stale artifact fails here rather than at the first prediction.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let lib = unsafe { Library::new(path) }.map_err(|source| LoadError::Open {
            path: path.display().to_string(),
            source,
        })?;

        let raw = unsafe {
            let info: libloading::Symbol<*const RawModelInfo> =
                lib.get(INFO_SYMBOL.as_bytes())
                    .map_err(|source| LoadError::MissingSymbol {
                        symbol: INFO_SYMBOL,
                        source,
                    })?;
            **info
        };
        let info = ModelInfo::try_from(raw)?;

        let entry = unsafe {
            let symbol: libloading::Symbol<PredictFn> =
                lib.get(ENTRY_SYMBOL.as_bytes())
                    .map_err(|source| LoadError::MissingSymbol {
                        symbol: ENTRY_SYMBOL,
                        source,
                    })?;
            *symbol
        };

        log::debug!(
            "loaded {}: {} trees, {} classes, {} features",
            path.display(),
            info.num_tree,
            info.num_class,
            info.num_feature
        );
        Ok(Self {
            entry,
            info,
            _lib: lib,
        })
    }

    /// Metadata the artifact was built with.
    #[inline]
    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Number of features the model expects.
    #[inline]
    pub fn num_feature(&self) -> usize {
        self.info.num_feature as usize
    }

    /// Values per output row (1 except multiclass).
    #[inline]
    pub fn output_width(&self) -> usize {
        self.info.num_class.max(1) as usize
    }

    /// Predict a batch.
    ///
    /// Returns raw margins when `pred_margin` is set, transformed outputs
    /// otherwise. The matrix is only borrowed; rejecting a feature-count
    /// mismatch happens before any native call.
    pub fn predict<M: DataMatrix>(
        &self,
        features: &M,
        pred_margin: bool,
    ) -> Result<PredictionOutput, PredictionError> {
        self.check_shape(features)?;
        let num_rows = features.num_rows();
        let mut output = PredictionOutput::zeros(num_rows, self.output_width());

        let mut row_buf = vec![Entry::MISSING; self.num_feature()];
        for row in 0..num_rows {
            features.fill_row(row, &mut row_buf);
            self.predict_into(&mut row_buf, output.row_mut(row), pred_margin);
        }
        Ok(output)
    }

    /// Predict a batch with rows distributed over the rayon thread pool.
    ///
    /// Same results as [`Predictor::predict`]; worthwhile for large batches.
    pub fn par_predict<M: DataMatrix + Sync>(
        &self,
        features: &M,
        pred_margin: bool,
    ) -> Result<PredictionOutput, PredictionError> {
        self.check_shape(features)?;
        let num_rows = features.num_rows();
        let width = self.output_width();
        let mut output = PredictionOutput::zeros(num_rows, width);

        output
            .as_mut_slice()
            .par_chunks_mut(width)
            .enumerate()
            .for_each_init(
                || vec![Entry::MISSING; self.num_feature()],
                |row_buf, (row, out_row)| {
                    features.fill_row(row, row_buf);
                    self.predict_into(row_buf, out_row, pred_margin);
                },
            );
        Ok(output)
    }

    fn check_shape<M: DataMatrix>(&self, features: &M) -> Result<(), PredictionError> {
        if features.num_features() != self.num_feature() {
            return Err(PredictionError::FeatureCountMismatch {
                expected: self.num_feature(),
                actual: features.num_features(),
            });
        }
        Ok(())
    }

    fn predict_into(&self, row_buf: &mut [Entry], out_row: &mut [f64], pred_margin: bool) {
        // The entry point only reads/writes the row buffer (requantizing in
        // place for quantized models) and writes output_width() doubles.
        unsafe { (self.entry)(row_buf.as_mut_ptr(), out_row.as_mut_ptr()) };
        if !pred_margin {
            self.info
                .output_transform
                .apply(out_row, self.info.sigmoid_alpha);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
