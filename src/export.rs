//! One-shot model export: compile + build.

use std::path::{Path, PathBuf};

use crate::codegen::{self, CompileOptions};
use crate::model::Model;
use crate::toolchain::{self, BuildConfig, BuildError};

/// Error type for [`export_lib`].
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

/// Lower `model` to source and build it into a shared library at `libpath`.
///
/// Equivalent to [`codegen::compile`] followed by [`toolchain::build`]; the
/// common path for callers that do not need to inspect the generated source.
pub fn export_lib(
    model: &Model,
    libpath: impl AsRef<Path>,
    options: &CompileOptions,
    config: &BuildConfig,
) -> Result<PathBuf, ExportError> {
    let units = codegen::compile(model, options);
    let path = toolchain::build(&units, libpath, config)?;
    Ok(path)
}
