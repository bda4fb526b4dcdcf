use anyhow::{Context, Result};
use fitsio::FitsFile;
use std::fs;
use std::path::{Path, PathBuf};

use crate::beam::Beam;
use crate::fits::{self, HduKind};

/// Write BMAJ/BMIN/BPA into HDU `hdu_index` of `input`.
///
/// Without `output` the file is updated in place. cfitsio edits the header
/// records directly, so every other card and HDU stays byte for byte.
pub fn set_beam(
    input: &Path,
    output: Option<&Path>,
    beam: &Beam,
    hdu_index: usize,
    overwrite: bool,
    history: &[String],
) -> Result<()> {
    if !input.is_file() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }

    // Work on a copy: the target itself with -o, a sibling temp file otherwise
    let output = output.filter(|path| !same_file(path, input));
    let (target, in_place) = match output {
        Some(path) => {
            if path.exists() && !overwrite {
                anyhow::bail!(
                    "Output {} already exists (use --overwrite to replace it)",
                    path.display()
                );
            }
            (path.to_path_buf(), false)
        }
        None => (temp_sibling(input), true),
    };
    fs::copy(input, &target)
        .with_context(|| format!("Failed to copy {} to {}", input.display(), target.display()))?;

    let result = stamp(&target, input, beam, hdu_index, history).and_then(|_| {
        if in_place {
            fs::rename(&target, input)
                .with_context(|| format!("Failed to update {}", input.display()))?;
        }
        Ok(())
    });
    if result.is_err() {
        let _ = fs::remove_file(&target);
    }
    result.with_context(|| format!("Failed to set the beam of {}", input.display()))
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out.fits".to_string());
    path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()))
}

/// `name` is the file the user gave, `path` the copy being edited
fn stamp(path: &Path, name: &Path, beam: &Beam, hdu_index: usize, history: &[String]) -> Result<()> {
    let mut fptr = FitsFile::edit(path)?;

    let hdu_count = fits::hdu_count(&mut fptr)?;
    if hdu_index >= hdu_count {
        anyhow::bail!(
            "{} has {} HDU(s); there is no HDU {}",
            name.display(),
            hdu_count,
            hdu_index
        );
    }

    let header = fits::read_header(&mut fptr, hdu_index)?;
    match header.kind() {
        HduKind::Primary | HduKind::Image => {}
        _ if header.is_compressed_image() => {}
        other => tracing::warn!("HDU {} is a {}, not an image", hdu_index, other),
    }

    if let Some(old) = Beam::from_header(&header) {
        tracing::info!("Replacing beam {} with {}", old, beam);
    } else {
        tracing::info!("Setting beam {}", beam);
    }

    beam.apply(&mut fptr, hdu_index)?;
    fits::write_history(&mut fptr, hdu_index, history)?;
    Ok(())
}
