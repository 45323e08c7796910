//! Native toolchain invocation.
//!
//! The compiler pipeline hands this module a set of source units; it writes
//! them to a scratch directory, compiles every `.c` unit independently — a
//! rayon fan-out with a join before linking — and links one shared library.
//! The first failing unit aborts the whole build; nothing is retried.
//! Callers wanting different compiler behavior (say `-O0` for a model whose
//! categorical splits produced enormous conditionals) pass `extra_flags`.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

use rayon::prelude::*;

use crate::codegen::SourceUnit;

// =============================================================================
// Toolchain identity
// =============================================================================

/// Supported toolchain identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    Gcc,
    Clang,
    Msvc,
}

impl Default for Toolchain {
    fn default() -> Self {
        if cfg!(windows) {
            Toolchain::Msvc
        } else {
            Toolchain::Gcc
        }
    }
}

impl FromStr for Toolchain {
    type Err = UnknownToolchain;

    fn from_str(name: &str) -> Result<Self, UnknownToolchain> {
        match name {
            "gcc" => Ok(Toolchain::Gcc),
            "clang" => Ok(Toolchain::Clang),
            "msvc" | "cl" => Ok(Toolchain::Msvc),
            _ => Err(UnknownToolchain(name.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown toolchain {0:?} (expected gcc, clang, or msvc)")]
pub struct UnknownToolchain(pub String);

impl Toolchain {
    /// Compiler executable name.
    pub fn program(self) -> &'static str {
        match self {
            Toolchain::Gcc => "gcc",
            Toolchain::Clang => "clang",
            Toolchain::Msvc => "cl",
        }
    }

    /// Whether this toolchain is runnable on the current machine.
    pub fn is_available(self) -> bool {
        let probe = match self {
            // cl has no --version; a bare invocation prints a banner.
            Toolchain::Msvc => Command::new(self.program()).output(),
            _ => Command::new(self.program()).arg("--version").output(),
        };
        probe.is_ok()
    }

    fn compile_command(self, source: &Path, object: &Path, extra_flags: &[String]) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Toolchain::Gcc | Toolchain::Clang => {
                cmd.args(["-std=c99", "-O2", "-fPIC", "-c"])
                    .args(extra_flags)
                    .arg(source)
                    .arg("-o")
                    .arg(object);
            }
            Toolchain::Msvc => {
                cmd.args(["/nologo", "/c", "/O2"])
                    .args(extra_flags)
                    .arg(source)
                    .arg(format!("/Fo{}", object.display()));
            }
        }
        cmd
    }

    fn link_command(self, objects: &[PathBuf], libpath: &Path) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            Toolchain::Gcc | Toolchain::Clang => {
                cmd.arg("-shared").args(objects).arg("-o").arg(libpath);
            }
            Toolchain::Msvc => {
                cmd.args(["/nologo", "/LD"])
                    .args(objects)
                    .arg(format!("/Fe{}", libpath.display()));
            }
        }
        cmd
    }

    fn object_extension(self) -> &'static str {
        match self {
            Toolchain::Msvc => "obj",
            _ => "o",
        }
    }
}

// =============================================================================
// Build configuration and errors
// =============================================================================

/// How to build the generated source.
#[derive(Debug, Clone, Default)]
pub struct BuildConfig {
    /// Which compiler to invoke.
    pub toolchain: Toolchain,
    /// Flags forwarded verbatim to every compile invocation.
    pub extra_flags: Vec<String>,
}

/// Error type for toolchain builds.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to run {program}: {source}")]
    ToolchainNotFound {
        program: &'static str,
        source: std::io::Error,
    },
    #[error("compilation of {unit} failed:\n{stderr}")]
    CompileFailed { unit: String, stderr: String },
    #[error("linking failed:\n{stderr}")]
    LinkFailed { stderr: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// build
// =============================================================================

/// Compile source units and link them into a shared library at `libpath`.
///
/// Units are compiled concurrently; the join happens before the link, and
/// the first failure wins. On success the scratch directory next to the
/// library is removed; on failure it is left behind for inspection.
pub fn build(
    units: &[SourceUnit],
    libpath: impl AsRef<Path>,
    config: &BuildConfig,
) -> Result<PathBuf, BuildError> {
    let libpath = libpath.as_ref();
    let workdir = scratch_dir(libpath);
    std::fs::create_dir_all(&workdir)?;

    for unit in units {
        std::fs::write(workdir.join(&unit.filename), &unit.content)?;
    }

    let compiled: Vec<&SourceUnit> = units.iter().filter(|u| !u.is_header()).collect();
    log::debug!(
        "compiling {} units with {} in {}",
        compiled.len(),
        config.toolchain.program(),
        workdir.display()
    );

    let objects = compiled
        .par_iter()
        .map(|unit| compile_unit(unit, &workdir, config))
        .collect::<Result<Vec<_>, _>>()?;

    let output = config
        .toolchain
        .link_command(&objects, libpath)
        .current_dir(&workdir)
        .output()
        .map_err(|source| BuildError::ToolchainNotFound {
            program: config.toolchain.program(),
            source,
        })?;
    if !output.status.success() {
        return Err(BuildError::LinkFailed {
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    if let Err(err) = std::fs::remove_dir_all(&workdir) {
        log::warn!("failed to clean {}: {err}", workdir.display());
    }
    log::debug!("linked {}", libpath.display());
    Ok(libpath.to_owned())
}

fn compile_unit(
    unit: &SourceUnit,
    workdir: &Path,
    config: &BuildConfig,
) -> Result<PathBuf, BuildError> {
    let source = workdir.join(&unit.filename);
    let object = source.with_extension(config.toolchain.object_extension());
    let output = config
        .toolchain
        .compile_command(&source, &object, &config.extra_flags)
        .current_dir(workdir)
        .output()
        .map_err(|source| BuildError::ToolchainNotFound {
            program: config.toolchain.program(),
            source,
        })?;
    if !output.status.success() {
        // MSVC reports errors on stdout.
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.trim().is_empty() {
            stderr = String::from_utf8_lossy(&output.stdout).into_owned();
        }
        return Err(BuildError::CompileFailed {
            unit: unit.filename.clone(),
            stderr,
        });
    }
    Ok(object)
}

/// Scratch directory next to the target library.
fn scratch_dir(libpath: &Path) -> PathBuf {
    let stem = libpath
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("lumber");
    libpath.with_file_name(format!("{stem}.build"))
}

// =============================================================================
// Tests
// =============================================================================
