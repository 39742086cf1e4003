//! Optional diagnostic dumps of generated kernels.

use std::path::{Path, PathBuf};

use tilefuse::config::DebugOptions;
use tilefuse::ir::{print_module, Module};
use tracing::{debug, info, warn};

pub(crate) const MODULE_SUFFIX: &str = "triton_ir.ttir";
pub(crate) const LOWERING_LOG_SUFFIX: &str = "lowering.log";

pub(crate) fn dump_path(dir: &Path, fusion_name: &str, suffix: &str) -> PathBuf {
    let sanitized: String = fusion_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("{sanitized}.{suffix}"))
}

/// Writes the module text to the dump directory, or to the log when only
/// `dump_ir_to_log` is set.
pub(crate) fn dump_module(debug_options: &DebugOptions, fusion_name: &str, module: &Module) {
    if debug_options.dump_dir.is_none() && !debug_options.dump_ir_to_log {
        return;
    }
    let text = print_module(module);
    match &debug_options.dump_dir {
        Some(dir) => write_dump(dir, fusion_name, MODULE_SUFFIX, &text),
        None => info!(fusion = fusion_name, "triton module:\n{text}"),
    }
}

pub(crate) fn dump_lowering_log(debug_options: &DebugOptions, fusion_name: &str, log: &str) {
    if log.is_empty() {
        return;
    }
    match &debug_options.dump_dir {
        Some(dir) => write_dump(dir, fusion_name, LOWERING_LOG_SUFFIX, log),
        None if debug_options.dump_ir_to_log => {
            info!(fusion = fusion_name, "triton lowering log:\n{log}")
        }
        None => {}
    }
}

fn write_dump(dir: &Path, fusion_name: &str, suffix: &str, contents: &str) {
    let path = dump_path(dir, fusion_name, suffix);
    let result = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, contents));
    match result {
        Ok(()) => debug!(path = %path.display(), "wrote kernel dump"),
        Err(err) => warn!(path = %path.display(), error = %err, "failed to write kernel dump"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dump_names_are_file_safe() {
        let path = dump_path(Path::new("/tmp/dumps"), "fusion.3/gemm", MODULE_SUFFIX);
        assert_eq!(path, PathBuf::from("/tmp/dumps/fusion.3_gemm.triton_ir.ttir"));
    }
}
