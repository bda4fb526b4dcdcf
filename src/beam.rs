//! Restoring-beam sizes: parsing user input and the BMAJ/BMIN/BPA keywords.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;

use fitsio::FitsFile;

use crate::fits::{self, FitsError, Header};

#[derive(Debug, Error, PartialEq)]
pub enum BeamError {
    #[error("cannot read '{0}' as an angle")]
    InvalidAngle(String),

    #[error("unknown angle unit '{0}' (use deg, arcmin, arcsec, mas or rad)")]
    UnknownUnit(String),

    #[error("{0} must be a positive, finite angle")]
    NotPositive(&'static str),

    #[error("BMIN ({bmin} deg) is larger than BMAJ ({bmaj} deg)")]
    MinorExceedsMajor { bmaj: f64, bmin: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleUnit {
    Degree,
    Arcminute,
    Arcsecond,
    Milliarcsecond,
    Radian,
}

impl AngleUnit {
    pub fn parse(unit: &str) -> Option<Self> {
        match unit.to_ascii_lowercase().as_str() {
            "deg" | "degree" | "degrees" | "d" | "°" => Some(AngleUnit::Degree),
            "arcmin" | "amin" | "'" => Some(AngleUnit::Arcminute),
            "arcsec" | "asec" | "\"" => Some(AngleUnit::Arcsecond),
            "mas" => Some(AngleUnit::Milliarcsecond),
            "rad" | "radian" | "radians" => Some(AngleUnit::Radian),
            _ => None,
        }
    }

    pub fn to_degrees(self, value: f64) -> f64 {
        match self {
            AngleUnit::Degree => value,
            AngleUnit::Arcminute => value / 60.0,
            AngleUnit::Arcsecond => value / 3600.0,
            AngleUnit::Milliarcsecond => value / 3.6e6,
            AngleUnit::Radian => value.to_degrees(),
        }
    }
}

fn angle_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*([+-]?(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?)\s*([A-Za-z°'"]*)\s*$"#)
            .expect("valid regex")
    })
}

/// Parse `"45arcsec"`, `"0.5 deg"`, `"2'"` or a bare number in `default_unit`,
/// returning degrees
pub fn parse_angle(text: &str, default_unit: AngleUnit) -> Result<f64, BeamError> {
    let caps = angle_regex()
        .captures(text)
        .ok_or_else(|| BeamError::InvalidAngle(text.to_string()))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|_| BeamError::InvalidAngle(text.to_string()))?;
    let unit = match &caps[2] {
        "" => default_unit,
        u => AngleUnit::parse(u).ok_or_else(|| BeamError::UnknownUnit(u.to_string()))?,
    };
    Ok(unit.to_degrees(value))
}

/// Elliptical Gaussian restoring beam, all angles in degrees
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beam {
    pub bmaj: f64,
    pub bmin: f64,
    pub bpa: f64,
}

impl Beam {
    pub fn new(bmaj: f64, bmin: f64, bpa: f64) -> Result<Self, BeamError> {
        if !(bmaj.is_finite() && bmaj > 0.0) {
            return Err(BeamError::NotPositive("BMAJ"));
        }
        if !(bmin.is_finite() && bmin > 0.0) {
            return Err(BeamError::NotPositive("BMIN"));
        }
        if bmin > bmaj {
            return Err(BeamError::MinorExceedsMajor { bmaj, bmin });
        }
        if !bpa.is_finite() {
            return Err(BeamError::InvalidAngle(bpa.to_string()));
        }
        Ok(Beam { bmaj, bmin, bpa })
    }

    /// Sizes default to arcseconds and the position angle to degrees
    pub fn from_args(bmaj: &str, bmin: &str, bpa: Option<&str>) -> Result<Self, BeamError> {
        let bmaj = parse_angle(bmaj, AngleUnit::Arcsecond)?;
        let bmin = parse_angle(bmin, AngleUnit::Arcsecond)?;
        let bpa = match bpa {
            Some(text) => parse_angle(text, AngleUnit::Degree)?,
            None => 0.0,
        };
        Beam::new(bmaj, bmin, bpa)
    }

    pub fn from_header(header: &Header) -> Option<Self> {
        Some(Beam {
            bmaj: header.get_f64("BMAJ")?,
            bmin: header.get_f64("BMIN")?,
            bpa: header.get_f64("BPA").unwrap_or(0.0),
        })
    }

    /// Write BMAJ/BMIN/BPA into HDU `index`, replacing existing values in place
    pub fn apply(&self, fptr: &mut FitsFile, index: usize) -> Result<(), FitsError> {
        fits::update_real(fptr, index, "BMAJ", self.bmaj, Some("beam major axis FWHM [deg]"))?;
        fits::update_real(fptr, index, "BMIN", self.bmin, Some("beam minor axis FWHM [deg]"))?;
        fits::update_real(fptr, index, "BPA", self.bpa, Some("beam position angle [deg]"))?;
        Ok(())
    }
}

impl fmt::Display for Beam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}\" x {:.3}\" at {:.2} deg",
            self.bmaj * 3600.0,
            self.bmin * 3600.0,
            self.bpa
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_angle_units() {
        assert_relative_eq!(parse_angle("45arcsec", AngleUnit::Degree).unwrap(), 0.0125);
        assert_relative_eq!(parse_angle("0.5 deg", AngleUnit::Arcsecond).unwrap(), 0.5);
        assert_relative_eq!(parse_angle("2'", AngleUnit::Arcsecond).unwrap(), 2.0 / 60.0);
        assert_relative_eq!(parse_angle("1.5\"", AngleUnit::Degree).unwrap(), 1.5 / 3600.0);
        assert_relative_eq!(parse_angle("36", AngleUnit::Arcsecond).unwrap(), 0.01);
        assert_relative_eq!(
            parse_angle("1e-4rad", AngleUnit::Degree).unwrap(),
            1e-4_f64.to_degrees()
        );
        assert_relative_eq!(parse_angle("-30", AngleUnit::Degree).unwrap(), -30.0);
    }

    #[test]
    fn test_parse_angle_errors() {
        assert_eq!(
            parse_angle("12 parsec", AngleUnit::Degree),
            Err(BeamError::UnknownUnit("parsec".into()))
        );
        assert!(matches!(
            parse_angle("big", AngleUnit::Degree),
            Err(BeamError::InvalidAngle(_))
        ));
    }

    #[test]
    fn test_beam_validation() {
        assert!(Beam::from_args("45", "30", Some("12")).is_ok());
        assert!(matches!(
            Beam::from_args("30", "45", None),
            Err(BeamError::MinorExceedsMajor { .. })
        ));
        assert_eq!(Beam::from_args("0", "0", None), Err(BeamError::NotPositive("BMAJ")));
    }

    #[test]
    fn test_apply_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beam.fits");
        let beam = Beam::from_args("45arcsec", "30arcsec", Some("-10deg")).unwrap();
        {
            let mut fptr = fits::create_file(&path, false, -32, &[2, 2]).unwrap();
            beam.apply(&mut fptr, 0).unwrap();
            // a second stamp replaces rather than duplicates
            beam.apply(&mut fptr, 0).unwrap();
        }

        let mut fptr = FitsFile::open(&path).unwrap();
        let header = fits::read_header(&mut fptr, 0).unwrap();
        assert_eq!(header.cards().iter().filter(|c| c.keyword() == "BMAJ").count(), 1);
        let back = Beam::from_header(&header).unwrap();
        assert_relative_eq!(back.bmaj, 0.0125, max_relative = 1e-12);
        assert_relative_eq!(back.bmin, 30.0 / 3600.0, max_relative = 1e-12);
        assert_relative_eq!(back.bpa, -10.0);
    }
}
