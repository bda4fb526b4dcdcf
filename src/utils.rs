use std::path::{Path, PathBuf};

pub const TOOL_NAME: &str = env!("CARGO_PKG_NAME");
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// `dir/name.ext` -> `dir/name-<suffix>.fits`
pub fn derived_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    input.with_file_name(format!("{}-{}.fits", stem, suffix))
}

/// Output name for a decompressed copy: the basename of `input` with its last
/// extension removed, placed in the current directory
pub fn uncompressed_output_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    PathBuf::from(format!("{}-uncompressed.fits", stem))
}

/// True for file names with a FITS extension
pub fn is_fits_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext_lower = ext.to_lowercase();
            ext_lower == "fits" || ext_lower == "fit" || ext_lower == "fts"
        })
        .unwrap_or(false)
}

/// HISTORY lines recording which tool touched a file and how it was invoked
pub fn provenance(command_line: &[String]) -> Vec<String> {
    vec![
        format!(
            "fits file updated by: {} {} on {}",
            TOOL_NAME,
            TOOL_VERSION,
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S")
        ),
        format!("command: {}", command_line.join(" ")),
    ]
}
