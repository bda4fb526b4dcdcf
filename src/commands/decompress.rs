use anyhow::{Context, Result};
use fitsio::FitsFile;
use std::fs;
use std::path::Path;

use crate::fits::{self, Card, Header};

/// Keywords of the compressed table that must not reach the image header
fn is_table_keyword(keyword: &str) -> bool {
    const EXACT: &[&str] = &[
        "XTENSION", "BITPIX", "NAXIS", "PCOUNT", "GCOUNT", "TFIELDS", "THEAP", "ZIMAGE",
        "ZSIMPLE", "ZTENSION", "ZBITPIX", "ZNAXIS", "ZCMPTYPE", "ZQUANTIZ", "ZDITHER0",
        "ZPCOUNT", "ZGCOUNT", "ZEXTEND", "ZBLOCKED", "ZHECKSUM", "ZDATASUM", "ZBLANK",
        "ZSCALE", "ZZERO", "CHECKSUM", "DATASUM", "EXTEND",
    ];
    const INDEXED: &[&str] = &[
        "NAXIS", "TTYPE", "TFORM", "TUNIT", "TDIM", "TNULL", "TSCAL", "TZERO", "TDISP", "ZNAXIS",
        "ZTILE", "ZNAME", "ZVAL",
    ];
    EXACT.contains(&keyword)
        || INDEXED.iter().any(|prefix| {
            keyword
                .strip_prefix(prefix)
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
}

/// Keywords cfitsio writes itself when it creates an image HDU
fn is_image_structure(keyword: &str) -> bool {
    matches!(
        keyword,
        "SIMPLE" | "XTENSION" | "BITPIX" | "EXTEND" | "PCOUNT" | "GCOUNT"
    ) || keyword
        .strip_prefix("NAXIS")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

/// Cards to copy into the image rebuilt from `header`, after the structural
/// ones cfitsio writes
fn image_cards(header: &Header) -> Result<Vec<Card>> {
    let compressed = header.is_compressed_image();
    let mut cards = Vec::with_capacity(header.len());

    if compressed && header.image_bitpix()? > 0 && !header.contains("BLANK") {
        if let Some(blank) = header.get_i64("ZBLANK") {
            cards.push(Card::integer("BLANK", blank, Some("null pixel value"))?);
        }
    }

    for card in header.cards() {
        if card.is_boilerplate() {
            continue;
        }
        let key = card.keyword();
        if !card.is_commentary() {
            let skip = if compressed {
                is_table_keyword(key)
                    || (key == "EXTNAME"
                        && header.get_str("EXTNAME").map(str::trim) == Some("COMPRESSED_IMAGE"))
            } else {
                is_image_structure(key)
            };
            if skip {
                continue;
            }
        }
        cards.push(card.clone());
    }
    Ok(cards)
}

/// Summary of a whole-file decompression
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecompressReport {
    /// Indices (in the input) of HDUs that were decompressed
    pub decompressed: Vec<usize>,
    /// Indices of HDUs copied unchanged
    pub copied: Vec<usize>,
}

/// An empty primary followed by a compressed copy of the original primary
/// array (ZSIMPLE = T) collapses back into a single primary HDU
fn restores_primary(headers: &[Header]) -> Result<bool> {
    let Some(second) = headers.get(1) else {
        return Ok(false);
    };
    Ok(second.is_compressed_image()
        && second.get_bool("ZSIMPLE") == Some(true)
        && headers[0].pixel_count()? == 0)
}

/// Expand every tile-compressed HDU of `input` into a plain image in `output`
pub fn decompress(
    input: &Path,
    output: &Path,
    overwrite: bool,
    history: &[String],
) -> Result<DecompressReport> {
    let mut fptr = FitsFile::open(input)
        .with_context(|| format!("Failed to open FITS file: {}", input.display()))?;
    let headers = fits::read_headers(&mut fptr)
        .with_context(|| format!("Failed to read headers of {}", input.display()))?;

    if headers.first().and_then(|h| h.get_bool("GROUPS")) == Some(true) {
        anyhow::bail!("{} is a random-groups file, which cannot be decompressed", input.display());
    }
    if !headers.iter().any(Header::is_compressed_image) {
        tracing::warn!("{} holds no tile-compressed HDUs; writing a plain copy", input.display());
    }

    let first = if restores_primary(&headers)? { 1 } else { 0 };
    let primary = &headers[first];
    let out = fits::create_file(
        output,
        overwrite,
        primary.image_bitpix()?,
        &primary.image_axes()?,
    )
    .with_context(|| format!("Failed to create {}", output.display()))?;

    match write_decompressed(&mut fptr, &headers, first, out, history) {
        Ok(report) => {
            tracing::info!(
                "Wrote {} ({} HDU(s) decompressed, {} copied)",
                output.display(),
                report.decompressed.len(),
                report.copied.len()
            );
            Ok(report)
        }
        Err(e) => {
            let _ = fs::remove_file(output);
            Err(e.context(format!("Failed to decompress {}", input.display())))
        }
    }
}

fn write_decompressed(
    input: &mut FitsFile,
    headers: &[Header],
    first: usize,
    mut out: FitsFile,
    history: &[String],
) -> Result<DecompressReport> {
    let mut report = DecompressReport::default();

    let primary = &headers[first];
    fits::write_cards(&mut out, 0, &image_cards(primary)?)?;
    fits::write_history(&mut out, 0, history)?;
    if primary.pixel_count()? > 0 {
        let pixels = fits::read_pixels(input, first, primary)?;
        fits::write_pixels(&mut out, 0, &pixels)?;
    }
    if primary.is_compressed_image() {
        tracing::debug!("Restored HDU {} as the primary array", first);
        report.decompressed.push(first);
    } else {
        report.copied.push(first);
    }

    for (index, header) in headers.iter().enumerate().skip(first + 1) {
        if header.is_compressed_image() {
            let new_index =
                fits::create_image_extension(&mut out, header.image_bitpix()?, &header.image_axes()?)?;
            fits::write_cards(&mut out, new_index, &image_cards(header)?)?;
            let pixels = fits::read_pixels(input, index, header)
                .with_context(|| format!("Failed to read the pixels of HDU {}", index))?;
            fits::write_pixels(&mut out, new_index, &pixels)?;
            tracing::debug!("Decompressed HDU {}", index);
            report.decompressed.push(index);
        } else {
            fits::copy_hdu(input, index, &mut out)?;
            report.copied.push(index);
        }
    }
    Ok(report)
}
