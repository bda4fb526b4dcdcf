//! Selection of world-coordinate keywords for a subset of image axes.

use regex::Regex;
use std::sync::OnceLock;

use crate::fits::{Card, FitsError, Header};

/// Keywords describing the coordinate system as a whole
const GLOBAL_KEYWORDS: &[&str] = &[
    "WCSAXES", "RADESYS", "RADECSYS", "EQUINOX", "EPOCH", "LONPOLE", "LATPOLE", "MJD-OBS",
    "MJDREF", "DATE-OBS", "RESTFRQ", "RESTFREQ", "RESTWAV", "SPECSYS", "SSYSOBS", "VELREF",
    "WCSNAME",
];

/// How a header keyword relates to the image axes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WcsKeyword {
    /// CTYPEi, CRVALi, ... for axis i
    Axis { prefix: String, axis: usize, alt: String },
    /// PCi_j / CDi_j
    Matrix { prefix: String, i: usize, j: usize, alt: String },
    /// PVi_m / PSi_m, parameters attached to axis i
    Param { prefix: String, axis: usize, m: usize, alt: String },
    /// Not tied to one axis
    Global,
}

fn axis_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(CTYPE|CRVAL|CDELT|CRPIX|CUNIT|CROTA|CNAME|CRDER|CSYER)([1-9][0-9]?)([A-Z]?)$")
            .expect("valid regex")
    })
}

fn indexed_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(PC|CD|PV|PS)([1-9][0-9]?)_([0-9]{1,2})([A-Z]?)$").expect("valid regex")
    })
}

/// Classify a keyword, `None` when it is not a WCS keyword
pub fn classify(keyword: &str) -> Option<WcsKeyword> {
    if let Some(c) = axis_regex().captures(keyword) {
        return Some(WcsKeyword::Axis {
            prefix: c[1].to_string(),
            axis: c[2].parse().ok()?,
            alt: c[3].to_string(),
        });
    }

    if let Some(c) = indexed_regex().captures(keyword) {
        let prefix = c[1].to_string();
        let first: usize = c[2].parse().ok()?;
        let second: usize = c[3].parse().ok()?;
        let alt = c[4].to_string();
        return Some(match prefix.as_str() {
            "PC" | "CD" => WcsKeyword::Matrix {
                prefix,
                i: first,
                j: second,
                alt,
            },
            _ => WcsKeyword::Param {
                prefix,
                axis: first,
                m: second,
                alt,
            },
        });
    }

    // alternate descriptions append one letter, e.g. RADESYSA
    let base = match keyword.len() {
        8 if keyword.ends_with(|c: char| c.is_ascii_uppercase()) => &keyword[..7],
        _ => keyword,
    };
    if GLOBAL_KEYWORDS.contains(&keyword) || GLOBAL_KEYWORDS.contains(&base) {
        return Some(WcsKeyword::Global);
    }
    None
}

pub fn is_wcs_keyword(keyword: &str) -> bool {
    classify(keyword).is_some()
}

/// WCS cards for the 1-based `kept` axes, renumbered 1..k in the given order.
///
/// Matrix terms survive only when both axes do; WCSAXES is rewritten to k.
pub fn subset(header: &Header, kept: &[usize]) -> Result<Vec<Card>, FitsError> {
    let new_index = |axis: usize| kept.iter().position(|&a| a == axis).map(|p| p + 1);
    let mut out = Vec::new();

    for card in header.cards() {
        if card.is_commentary() {
            continue;
        }
        let Some(class) = classify(card.keyword()) else {
            continue;
        };

        match class {
            WcsKeyword::Axis { prefix, axis, alt } => {
                if let Some(n) = new_index(axis) {
                    out.push(card.renamed(&format!("{}{}{}", prefix, n, alt))?);
                }
            }
            WcsKeyword::Matrix { prefix, i, j, alt } => {
                if let (Some(ni), Some(nj)) = (new_index(i), new_index(j)) {
                    out.push(card.renamed(&format!("{}{}_{}{}", prefix, ni, nj, alt))?);
                }
            }
            WcsKeyword::Param { prefix, axis, m, alt } => {
                if let Some(n) = new_index(axis) {
                    out.push(card.renamed(&format!("{}{}_{}{}", prefix, n, m, alt))?);
                }
            }
            WcsKeyword::Global if card.keyword().starts_with("WCSAXES") => {
                out.push(Card::integer(card.keyword(), kept.len() as i64, card.comment())?);
            }
            WcsKeyword::Global => out.push(card.clone()),
        }
    }
    Ok(out)
}

/// CTYPE of axis `i` (1-based), upper-cased
pub fn axis_type(header: &Header, axis: usize) -> Option<String> {
    header
        .get_str(&format!("CTYPE{}", axis))
        .map(|s| s.trim().to_ascii_uppercase())
}

/// True for longitude/latitude coordinate types such as RA---SIN or GLAT-CAR
pub fn is_celestial_type(ctype: &str) -> bool {
    let base = ctype.split('-').next().unwrap_or("");
    matches!(base, "RA" | "DEC" | "HPLN" | "HPLT")
        || (base.len() == 4 && (base.ends_with("LON") || base.ends_with("LAT")))
}

/// 1-based axes carrying celestial coordinates
pub fn celestial_axes(header: &Header) -> Vec<usize> {
    let naxis = header.naxis().unwrap_or(0);
    (1..=naxis)
        .filter(|&i| axis_type(header, i).is_some_and(|t| is_celestial_type(&t)))
        .collect()
}
