use anyhow::{Context, Result};
use fitsio::FitsFile;
use serde::Serialize;
use std::path::Path;

use crate::fits::{self, Header, Value};
use crate::utils::truncate_string;

#[derive(Debug, Serialize)]
pub struct CardListing {
    pub keyword: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HduListing {
    pub index: usize,
    pub kind: String,
    pub bitpix: Option<i64>,
    pub shape: Vec<usize>,
    /// Shape of the image held by a tile-compressed table
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_image: Option<Vec<usize>>,
    pub cards: Vec<CardListing>,
}

pub fn list_hdus(headers: &[Header]) -> Vec<HduListing> {
    headers
        .iter()
        .enumerate()
        .map(|(index, header)| HduListing {
            index,
            kind: header.kind().to_string(),
            bitpix: header.get_i64("BITPIX"),
            shape: header.axes().unwrap_or_default(),
            compressed_image: if header.is_compressed_image() {
                header.image_axes().ok()
            } else {
                None
            },
            cards: header
                .cards()
                .iter()
                .map(|card| CardListing {
                    keyword: card.keyword().to_string(),
                    value: card.value().cloned(),
                    comment: card.comment().map(str::to_string),
                })
                .collect(),
        })
        .collect()
}

fn shape_text(shape: &[usize]) -> String {
    if shape.is_empty() {
        "no data".to_string()
    } else {
        shape
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(" x ")
    }
}

/// Print every HDU of `path` as text or JSON
pub fn show_headers(path: &Path, format: &str) -> Result<()> {
    let mut fptr = FitsFile::open(path)
        .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;
    let headers = fits::read_headers(&mut fptr)
        .with_context(|| format!("Failed to read headers of {}", path.display()))?;
    let listing = list_hdus(&headers);

    match format.to_lowercase().as_str() {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        _ => {
            println!("FITS file: {}", path.display());
            for (header, entry) in headers.iter().zip(&listing) {
                println!();
                println!(
                    "HDU {}: {} BITPIX={} shape {}",
                    entry.index,
                    entry.kind,
                    entry
                        .bitpix
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "?".to_string()),
                    shape_text(&entry.shape)
                );
                if let Some(image) = &entry.compressed_image {
                    println!("  compressed image {}", shape_text(image));
                }
                println!("{}", "-".repeat(80));
                for card in header.cards() {
                    println!("{}", truncate_string(card.record(), 80));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fits::Card;

    #[test]
    fn test_listing_reports_shape_and_cards() {
        let records = [
            "SIMPLE  =                    T",
            "BITPIX  =                  -32",
            "NAXIS   =                    3",
            "NAXIS1  =                    4",
            "NAXIS2  =                    3",
            "NAXIS3  =                    1",
            "BUNIT   = 'JY/BEAM '           / pixel units",
        ];
        let header =
            Header::from_cards(records.iter().map(|r| Card::from_record(r).unwrap()).collect());

        let listing = list_hdus(&[header]);
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].kind, "PRIMARY");
        assert_eq!(listing[0].bitpix, Some(-32));
        assert_eq!(listing[0].shape, vec![4, 3, 1]);
        assert!(listing[0].compressed_image.is_none());

        let bunit = listing[0].cards.iter().find(|c| c.keyword == "BUNIT").unwrap();
        assert_eq!(bunit.value, Some(Value::Str("JY/BEAM".into())));
        assert_eq!(bunit.comment.as_deref(), Some("pixel units"));
    }

    #[test]
    fn test_shape_text() {
        assert_eq!(shape_text(&[]), "no data");
        assert_eq!(shape_text(&[10, 20]), "10 x 20");
    }
}
