//! Lowering the model IR to C source.
//!
//! [`compile`] turns a [`Model`] into a set of [`SourceUnit`]s: a shared
//! header, one translation unit per slice of trees, and a main unit holding
//! the exported entry point, the metadata symbol, and (for quantized models)
//! the cut tables. Unit boundaries exist purely so the toolchain can compile
//! big ensembles in parallel; splitting never changes results because each
//! unit just adds its trees' outputs into the shared accumulator.
//!
//! Generated code returns raw margins only. The output transform is applied
//! by the predictor runtime, which keeps the generated source portable across
//! toolchains (no libm dependency) and the transform policy in one place.

mod emit;

use std::fmt::Write;

use crate::model::Model;
use crate::quantize;

use emit::{emit_tree, fmt_double};

/// ABI version stamped into (and checked against) compiled artifacts.
pub const ABI_VERSION: u32 = 2;

/// Exported per-row scoring entry point.
pub const ENTRY_SYMBOL: &str = "lumber_predict";

/// Exported ensemble metadata symbol.
pub const INFO_SYMBOL: &str = "lumber_model_info";

/// Filename of the shared header every unit includes.
pub const HEADER_FILENAME: &str = "lumber_model.h";

// =============================================================================
// Options and source units
// =============================================================================

/// Code generation options.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Quantize numeric thresholds before lowering (see [`crate::quantize`]).
    pub quantize: bool,
    /// Trees per translation unit; 0 puts the whole ensemble in one unit.
    pub parallel_comp: u32,
    /// Add tree/node comments to the generated source.
    pub annotate: bool,
}

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    /// Filename within the build directory (e.g. `unit0.c`).
    pub filename: String,
    /// Complete file content.
    pub content: String,
}

impl SourceUnit {
    /// Whether this unit is a header (written but not compiled on its own).
    pub fn is_header(&self) -> bool {
        self.filename.ends_with(".h")
    }
}

// =============================================================================
// compile
// =============================================================================

/// Lower a model to C source units.
///
/// The model must be valid (see [`Model::validate`]); loaders guarantee this
/// for anything they produce. When `options.quantize` is set and the model
/// is not yet quantized, the quantization pass runs first.
pub fn compile(model: &Model, options: &CompileOptions) -> Vec<SourceUnit> {
    let quantized_holder;
    let model = if options.quantize && !model.is_quantized() {
        quantized_holder = quantize::quantize(model);
        &quantized_holder
    } else {
        model
    };

    let ranges = unit_ranges(model.num_tree(), options.parallel_comp);
    log::debug!(
        "lowering {} trees into {} translation units",
        model.num_tree(),
        ranges.len()
    );

    let mut units = Vec::with_capacity(ranges.len() + 2);
    units.push(SourceUnit {
        filename: HEADER_FILENAME.to_owned(),
        content: emit_header(ranges.len()),
    });
    for (unit_idx, range) in ranges.iter().enumerate() {
        units.push(SourceUnit {
            filename: format!("unit{unit_idx}.c"),
            content: emit_unit(model, unit_idx, range.clone(), options.annotate),
        });
    }
    units.push(SourceUnit {
        filename: "main.c".to_owned(),
        content: emit_main(model, ranges.len()),
    });
    units
}

/// Split `num_tree` trees into contiguous per-unit ranges.
fn unit_ranges(num_tree: usize, parallel_comp: u32) -> Vec<std::ops::Range<usize>> {
    let per_unit = if parallel_comp == 0 {
        num_tree.max(1)
    } else {
        parallel_comp as usize
    };
    let mut ranges = Vec::new();
    let mut start = 0;
    while start < num_tree {
        let end = (start + per_unit).min(num_tree);
        ranges.push(start..end);
        start = end;
    }
    if ranges.is_empty() {
        // Degenerate: no trees. Loaders reject this, but keep the unit list
        // well-formed for hand-assembled models.
        ranges.push(0..0);
    }
    ranges
}

// =============================================================================
// Header
// =============================================================================

fn emit_header(num_units: usize) -> String {
    let mut out = String::new();
    out.push_str("/* Generated by lumber. Do not edit. */\n");
    out.push_str("#ifndef LUMBER_MODEL_H_\n#define LUMBER_MODEL_H_\n\n");
    out.push_str("#include <math.h>\n#include <stddef.h>\n#include <stdint.h>\n\n");

    // One slot per feature. The runtime writes either `missing = -1` or a
    // real `fvalue`; NaN payloads never appear as fvalue, so the -1 bit
    // pattern is unambiguous. `qvalue` is filled in by the entry point for
    // quantized models.
    out.push_str(
        "union Entry {\n\
         \x20 int64_t missing;\n\
         \x20 double fvalue;\n\
         \x20 int64_t qvalue;\n\
         };\n\n",
    );

    out.push_str(
        "struct ModelInfo {\n\
         \x20 uint32_t abi_version;\n\
         \x20 uint32_t num_tree;\n\
         \x20 uint32_t num_class;\n\
         \x20 uint32_t num_feature;\n\
         \x20 uint32_t task_type;\n\
         \x20 uint32_t output_transform;\n\
         \x20 uint32_t average_tree_output;\n\
         \x20 uint32_t reserved;\n\
         \x20 double sigmoid_alpha;\n\
         \x20 double base_score;\n\
         };\n\n",
    );

    for unit_idx in 0..num_units {
        let _ = writeln!(
            out,
            "void lumber_unit{unit_idx}(const union Entry* row, double* out);"
        );
    }
    out.push_str("\n#endif /* LUMBER_MODEL_H_ */\n");
    out
}

// =============================================================================
// Tree units
// =============================================================================

fn emit_unit(
    model: &Model,
    unit_idx: usize,
    trees: std::ops::Range<usize>,
    annotate: bool,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#include \"{HEADER_FILENAME}\"\n");

    for tree_idx in trees.clone() {
        if annotate {
            let _ = writeln!(
                out,
                "/* tree {tree_idx} (group {}) */",
                model.tree_group(tree_idx)
            );
        }
        emit_tree(
            &mut out,
            &format!("tree{tree_idx}"),
            &model.trees[tree_idx],
            model.quant.as_ref(),
            annotate,
        );
        out.push('\n');
    }

    let _ = writeln!(
        out,
        "void lumber_unit{unit_idx}(const union Entry* row, double* out) {{"
    );
    for tree_idx in trees {
        let _ = writeln!(
            out,
            "  out[{}] += tree{tree_idx}(row);",
            model.tree_group(tree_idx)
        );
    }
    out.push_str("}\n");
    out
}

// =============================================================================
// Main unit
// =============================================================================

fn emit_main(model: &Model, num_units: usize) -> String {
    let meta = &model.meta;
    let num_groups = model.num_groups();
    let num_feature = model.num_feature();

    let mut out = String::new();
    let _ = writeln!(out, "#include \"{HEADER_FILENAME}\"\n");
    out.push_str(
        "#if defined(_WIN32)\n\
         #define LUMBER_EXPORT __declspec(dllexport)\n\
         #else\n\
         #define LUMBER_EXPORT __attribute__((visibility(\"default\")))\n\
         #endif\n\n",
    );

    let quantized = emit_quant_tables(&mut out, model);

    let _ = writeln!(
        out,
        "LUMBER_EXPORT const struct ModelInfo {INFO_SYMBOL} = {{\n\
         \x20 {ABI_VERSION}u, {}u, {}u, {}u, {}u, {}u, {}u, 0u,\n\
         \x20 {}, {}\n\
         }};\n",
        model.num_tree(),
        meta.num_class,
        meta.num_feature,
        meta.task_type.code(),
        meta.output_transform.code(),
        u32::from(meta.average_tree_output),
        fmt_double(meta.sigmoid_alpha),
        fmt_double(meta.base_score),
    );

    let _ = writeln!(
        out,
        "LUMBER_EXPORT void {ENTRY_SYMBOL}(union Entry* row, double* out) {{"
    );
    out.push_str("  size_t k;\n");
    let _ = writeln!(out, "  for (k = 0; k < {num_groups}; ++k) out[k] = 0.0;");
    if quantized {
        let _ = writeln!(
            out,
            "  for (k = 0; k < {num_feature}; ++k) {{\n\
             \x20   if (row[k].missing != -1 && cuts_len[k] > 0) {{\n\
             \x20     row[k].qvalue = quantize_value(row[k].fvalue, k);\n\
             \x20   }}\n\
             \x20 }}"
        );
    }
    for unit_idx in 0..num_units {
        let _ = writeln!(
            out,
            "  lumber_unit{unit_idx}((const union Entry*)row, out);"
        );
    }
    let averaged = meta.average_tree_output;
    let biased = meta.base_score != 0.0;
    if averaged || biased {
        let mut post = String::from("out[k]");
        if averaged {
            let _ = write!(post, " / {}", fmt_double(model.trees_per_group() as f64));
        }
        if biased {
            let _ = write!(post, " + {}", fmt_double(meta.base_score));
        }
        let _ = writeln!(out, "  for (k = 0; k < {num_groups}; ++k) out[k] = {post};");
    }
    out.push_str("}\n");
    out
}

/// Emit cut tables plus the row binning routine. Returns false (emitting
/// nothing) for unquantized models.
fn emit_quant_tables(out: &mut String, model: &Model) -> bool {
    let tables = match &model.quant {
        Some(tables) => tables,
        None => return false,
    };
    let num_feature = model.num_feature();
    if num_feature == 0 {
        return false;
    }

    for feature in 0..num_feature {
        let cuts = tables.cuts(feature as u32);
        if cuts.is_empty() {
            continue;
        }
        let rendered: Vec<String> = cuts.iter().map(|&c| fmt_double(c)).collect();
        let _ = writeln!(
            out,
            "static const double cuts_{feature}[] = {{{}}};",
            rendered.join(", ")
        );
    }

    let pointers: Vec<String> = (0..num_feature)
        .map(|feature| {
            if tables.cuts(feature as u32).is_empty() {
                "NULL".to_owned()
            } else {
                format!("cuts_{feature}")
            }
        })
        .collect();
    let lens: Vec<String> = (0..num_feature)
        .map(|feature| tables.cuts(feature as u32).len().to_string())
        .collect();
    let _ = writeln!(
        out,
        "static const double* const cuts[] = {{{}}};",
        pointers.join(", ")
    );
    let _ = writeln!(out, "static const size_t cuts_len[] = {{{}}};\n", lens.join(", "));

    // Same doubled encoding as quantize::QuantTables::bin_of: equal to cut i
    // maps to 2i, strictly between cuts i and i+1 maps to 2i+1, below all
    // cuts maps to -1.
    out.push_str(
        "static int64_t quantize_value(double v, size_t fid) {\n\
         \x20 const double* c = cuts[fid];\n\
         \x20 size_t len = cuts_len[fid];\n\
         \x20 size_t low = 0, high = len, mid;\n\
         \x20 if (v < c[0]) return -1;\n\
         \x20 while (low + 1 < high) {\n\
         \x20   mid = (low + high) / 2;\n\
         \x20   if (c[mid] <= v) low = mid; else high = mid;\n\
         \x20 }\n\
         \x20 return c[low] == v ? (int64_t)(low * 2) : (int64_t)(low * 2 + 1);\n\
         }\n\n",
    );
    true
}

// =============================================================================
// Tests
// =============================================================================
