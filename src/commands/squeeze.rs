use anyhow::{Context, Result};
use fitsio::FitsFile;
use std::fs;
use std::path::Path;

use crate::fits::{self, Card, HduKind, Header, Pixels};
use crate::wcs;

/// Keywords needed to interpret the pixel values, kept even in a minimal header
const DATA_KEYWORDS: &[&str] = &[
    "BSCALE", "BZERO", "BLANK", "BUNIT", "BTYPE", "BMAJ", "BMIN", "BPA",
];

/// Keywords that describe the data layout and are regenerated on output
fn is_structural(keyword: &str) -> bool {
    matches!(
        keyword,
        "SIMPLE" | "XTENSION" | "BITPIX" | "EXTEND" | "PCOUNT" | "GCOUNT" | "GROUPS" | "END"
    ) || keyword
        .strip_prefix("NAXIS")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Debug, Clone, Default)]
pub struct SqueezeOptions {
    /// Keep every non-structural card, not only WCS and data-description ones
    pub full_header: bool,
    pub overwrite: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqueezeReport {
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// 1-based axes removed from the input
    pub dropped_axes: Vec<usize>,
}

/// Strip length-1 axes from the primary HDU of `input` and write `output`
pub fn squeeze_file(
    input: &Path,
    output: &Path,
    options: &SqueezeOptions,
    history: &[String],
) -> Result<SqueezeReport> {
    let mut fptr = FitsFile::open(input)
        .with_context(|| format!("Failed to open FITS file: {}", input.display()))?;

    let hdu_count = fits::hdu_count(&mut fptr)?;
    if hdu_count > 1 {
        tracing::info!(
            "Only the primary HDU is processed; dropping {} extension(s) of {}",
            hdu_count - 1,
            input.display()
        );
    }

    let header = fits::read_header(&mut fptr, 0)
        .with_context(|| format!("Failed to read header of {}", input.display()))?;
    let (cards, report) = squeeze_header(&header, options.full_header)?;
    let pixels = fits::read_pixels(&mut fptr, 0, &header)
        .with_context(|| format!("Failed to read pixels of {}", input.display()))?;

    let out = fits::create_file(output, options.overwrite, header.bitpix()?, &report.output_shape)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    if let Err(e) = write_squeezed(out, &cards, history, &pixels) {
        let _ = fs::remove_file(output);
        return Err(e.context(format!("Failed to write {}", output.display())));
    }

    tracing::info!(
        "Wrote {} with shape {:?} (was {:?})",
        output.display(),
        report.output_shape,
        report.input_shape
    );
    Ok(report)
}

fn write_squeezed(
    mut out: FitsFile,
    cards: &[Card],
    history: &[String],
    pixels: &Pixels,
) -> Result<()> {
    fits::write_cards(&mut out, 0, cards)?;
    fits::write_history(&mut out, 0, history)?;
    fits::write_pixels(&mut out, 0, pixels)?;
    Ok(())
}

/// Cards for a primary header without the degenerate axes of `header`.
///
/// cfitsio writes the structural keywords itself; the returned cards follow
/// them. Dropping unit-length axes never reorders pixels.
pub fn squeeze_header(header: &Header, full_header: bool) -> Result<(Vec<Card>, SqueezeReport)> {
    if !matches!(header.kind(), HduKind::Primary | HduKind::Image) {
        anyhow::bail!("HDU is a {} and not an image", header.kind());
    }

    let axes = header.axes()?;
    if header.pixel_count()? == 0 {
        anyhow::bail!("Image has no data to squeeze");
    }

    let kept: Vec<usize> = (1..=axes.len()).filter(|&i| axes[i - 1] != 1).collect();
    let dropped: Vec<usize> = (1..=axes.len()).filter(|&i| axes[i - 1] == 1).collect();
    if kept.is_empty() {
        anyhow::bail!("Every axis has length 1; nothing would remain after squeezing");
    }
    let shape: Vec<usize> = kept.iter().map(|&i| axes[i - 1]).collect();

    let celestial = wcs::celestial_axes(header);
    if !kept.iter().any(|a| celestial.contains(a)) {
        tracing::warn!("No celestial axis survives the squeeze; output has no sky coordinates");
    }
    for axis in &dropped {
        tracing::debug!(
            "Dropping axis {} ({})",
            axis,
            wcs::axis_type(header, *axis).unwrap_or_else(|| "untyped".to_string())
        );
    }

    let mut cards = wcs::subset(header, &kept)?;
    for key in DATA_KEYWORDS {
        if let Some(card) = header.card(key) {
            cards.push(card.clone());
        }
    }

    if full_header {
        for card in header.cards() {
            let key = card.keyword();
            let keep = if card.is_commentary() {
                !card.is_boilerplate()
            } else {
                !(is_structural(key) || wcs::is_wcs_keyword(key) || DATA_KEYWORDS.contains(&key))
            };
            if keep {
                cards.push(card.clone());
            }
        }
    }

    let report = SqueezeReport {
        input_shape: axes,
        output_shape: shape,
        dropped_axes: dropped,
    };
    Ok((cards, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::Value;

    fn header(records: &[&str]) -> Header {
        Header::from_cards(
            records
                .iter()
                .map(|r| Card::from_record(r).unwrap())
                .collect(),
        )
    }

    fn casa_style_cube() -> Header {
        header(&[
            "SIMPLE  =                    T",
            "BITPIX  =                  -32",
            "NAXIS   =                    4",
            "NAXIS1  =                    4",
            "NAXIS2  =                    3",
            "NAXIS3  =                    1",
            "NAXIS4  =                    1",
            "EXTEND  =                    T",
            "BUNIT   = 'JY/BEAM '",
            "BMAJ    =                 0.01",
            "CTYPE1  = 'RA---SIN'",
            "CTYPE2  = 'DEC--SIN'",
            "CTYPE3  = 'FREQ    '",
            "CTYPE4  = 'STOKES  '",
            "CRVAL3  =         1400000000.0",
            "OBJECT  = 'SNR     '",
            "",
            "HISTORY imaged",
        ])
    }

    fn find<'a>(cards: &'a [Card], keyword: &str) -> Option<&'a Card> {
        cards.iter().find(|c| c.keyword() == keyword)
    }

    #[test]
    fn test_squeeze_drops_unit_axes() {
        let (cards, report) = squeeze_header(&casa_style_cube(), false).unwrap();
        assert_eq!(report.input_shape, vec![4, 3, 1, 1]);
        assert_eq!(report.output_shape, vec![4, 3]);
        assert_eq!(report.dropped_axes, vec![3, 4]);
        assert_eq!(
            find(&cards, "CTYPE2").and_then(Card::value),
            Some(&Value::Str("DEC--SIN".into()))
        );
        assert!(find(&cards, "CTYPE3").is_none());
        assert!(find(&cards, "CRVAL3").is_none());
        assert!(find(&cards, "BUNIT").is_some());
        assert!(find(&cards, "OBJECT").is_none());
        assert!(find(&cards, "NAXIS1").is_none());
    }

    #[test]
    fn test_full_header_keeps_other_cards() {
        let (cards, _) = squeeze_header(&casa_style_cube(), true).unwrap();
        assert_eq!(
            find(&cards, "OBJECT").and_then(Card::value),
            Some(&Value::Str("SNR".into()))
        );
        assert!(find(&cards, "HISTORY").is_some());
        assert!(cards.iter().any(Card::is_blank));
        assert!(find(&cards, "CTYPE3").is_none());
        assert!(find(&cards, "NAXIS").is_none());
        assert!(find(&cards, "EXTEND").is_none());
    }

    #[test]
    fn test_all_unit_axes_is_an_error() {
        let h = header(&[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    2",
            "NAXIS1  =                    1",
            "NAXIS2  =                    1",
        ]);
        assert!(squeeze_header(&h, false).is_err());
    }

    #[test]
    fn test_empty_primary_is_an_error() {
        let h = header(&[
            "SIMPLE  =                    T",
            "BITPIX  =                    8",
            "NAXIS   =                    0",
        ]);
        let err = squeeze_header(&h, false).unwrap_err();
        assert!(err.to_string().contains("no data"));
    }

    #[test]
    fn test_structural_keywords() {
        assert!(is_structural("NAXIS12"));
        assert!(is_structural("GCOUNT"));
        assert!(!is_structural("NAXISX"));
        assert!(!is_structural("BUNIT"));
    }
}
