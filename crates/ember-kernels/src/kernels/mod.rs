//! OpenCL C kernel sources.
//!
//! Sources are embedded at compile time via `include_str!`. A kernel
//! directory configured at runtime takes precedence, so kernels can be
//! iterated on without rebuilding.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Normalization of NCHW tensors with per-channel statistics.
pub const BATCH_NORM_SRC: &str = include_str!("batch_norm.cl");

/// Embedded sources, keyed by program name.
const EMBEDDED: &[(&str, &str)] = &[("batch_norm", BATCH_NORM_SRC)];

/// Looks up program sources by name.
#[derive(Debug, Clone, Default)]
pub struct KernelLibrary {
    override_dir: Option<PathBuf>,
}

impl KernelLibrary {
    pub fn new(override_dir: Option<PathBuf>) -> Self {
        Self { override_dir }
    }

    pub fn override_dir(&self) -> Option<&Path> {
        self.override_dir.as_deref()
    }

    /// Source of `program`, preferring `<override_dir>/<program>.cl`.
    pub fn source(&self, program: &str) -> Option<Cow<'static, str>> {
        if let Some(dir) = &self.override_dir {
            let path = dir.join(format!("{program}.cl"));
            match std::fs::read_to_string(&path) {
                Ok(source) => {
                    debug!(program, path = %path.display(), "using kernel source override");
                    return Some(Cow::Owned(source));
                }
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                    debug!(program, path = %path.display(), error = %e, "override unreadable");
                }
                Err(_) => {}
            }
        }
        EMBEDDED.iter().find(|(name, _)| *name == program).map(|(_, src)| Cow::Borrowed(*src))
    }

    /// Names of the embedded programs.
    pub fn programs() -> impl Iterator<Item = &'static str> {
        EMBEDDED.iter().map(|(name, _)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn embedded_source_declares_its_kernel() {
        let src = KernelLibrary::default().source("batch_norm").unwrap();
        assert!(src.contains("__kernel void batch_norm("));
        assert!(KernelLibrary::default().source("conv_2d").is_none());
        assert_eq!(KernelLibrary::programs().collect::<Vec<_>>(), vec!["batch_norm"]);
    }

    #[test]
    fn override_directory_takes_precedence() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("batch_norm.cl"), "// patched").unwrap();
        let library = KernelLibrary::new(Some(tmp.path().to_path_buf()));
        assert_eq!(library.source("batch_norm").unwrap(), "// patched");

        let empty = TempDir::new().unwrap();
        let library = KernelLibrary::new(Some(empty.path().to_path_buf()));
        assert_eq!(library.source("batch_norm").unwrap(), BATCH_NORM_SRC);
    }
}
