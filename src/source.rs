//! Kernel source scanning
//!
//! Specialization keys are declared in kernel source with
//! `TILING_KEY_IS(<digits>)`. Each distinct key becomes one compiled
//! variant and one exported symbol.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{KernelPackError, Result};

/// `TILING_KEY_IS(<digits>)`, capturing the digits.
static KEY_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"TILING_KEY_IS\(([0-9]+)\)").expect("valid key marker pattern"));

/// Kernel source file plus the names it is built and registered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    /// Path to the device source.
    pub path: PathBuf,
    /// Exported kernel symbol, redefined per variant at compile time.
    pub symbol: String,
    /// Identifier the runtime registry looks the kernel up by.
    pub kernel_id: String,
}

impl KernelSource {
    pub fn new(path: impl Into<PathBuf>, symbol: impl Into<String>, kernel_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            symbol: symbol.into(),
            kernel_id: kernel_id.into(),
        }
    }

    /// Read the source and extract its specialization keys.
    pub fn specialization_keys(&self) -> Result<Vec<u64>> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| KernelPackError::io(&self.path, e))?;
        specialization_keys(&text, &self.path)
    }
}

/// Extract specialization keys from kernel source text.
///
/// Keys come back deduplicated in first-seen order. A source without any
/// marker has exactly one specialization, key 0. Markers whose argument is
/// not a plain decimal literal (macros, expressions) are skipped.
pub fn specialization_keys(text: &str, path: &Path) -> Result<Vec<u64>> {
    let mut keys = Vec::new();

    for captures in KEY_MARKER.captures_iter(text) {
        let literal = &captures[1];
        let key: u64 = literal
            .parse()
            .map_err(|_| KernelPackError::InvalidSpecializationKey {
                path: path.to_path_buf(),
                key: literal.to_string(),
            })?;
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    if keys.is_empty() {
        keys.push(0);
    }
    log::trace!("{}: specialization keys {:?}", path.display(), keys);
    Ok(keys)
}

/// Symbol name a kernel is exported under for one specialization key.
pub fn variant_symbol(symbol: &str, key: u64) -> String {
    format!("{}_{}", symbol, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(text: &str) -> Vec<u64> {
        specialization_keys(text, Path::new("k.cpp")).unwrap()
    }

    #[test]
    fn test_no_marker_means_key_zero() {
        assert_eq!(keys("extern \"C\" __global__ void add() {}"), vec![0]);
    }

    #[test]
    fn test_keys_in_order_and_deduplicated() {
        let src = r#"
            if (TILING_KEY_IS(30)) { a(); }
            else if (TILING_KEY_IS(31)) { b(); }
            else if (TILING_KEY_IS(30)) { c(); }
            if (TILING_KEY_IS(2000000000)) { d(); }
        "#;
        assert_eq!(keys(src), vec![30, 31, 2_000_000_000]);
    }

    #[test]
    fn test_non_literal_markers_are_skipped() {
        let src = "TILING_KEY_IS(KEY_BASE) TILING_KEY_IS( 3) TILING_KEY_IS(4 ) TILING_KEY_IS(5)";
        assert_eq!(keys(src), vec![5]);
    }

    #[test]
    fn test_adjacent_markers() {
        assert_eq!(keys("TILING_KEY_IS(7)TILING_KEY_IS(8)TILING_KEY_IS(()"), vec![7, 8]);
    }

    #[test]
    fn test_overflowing_key_is_an_error() {
        let err = specialization_keys("TILING_KEY_IS(99999999999999999999999)", Path::new("k.cpp"))
            .unwrap_err();
        assert!(matches!(err, KernelPackError::InvalidSpecializationKey { .. }));
    }

    #[test]
    fn test_variant_symbol() {
        assert_eq!(variant_symbol("add_custom", 5), "add_custom_5");
    }
}
