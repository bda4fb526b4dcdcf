//! Weighted power-law fit across matched images.
//!
//! Each pixel is fitted with ln S = a + alpha ln nu, weighting image i by
//! 1/sigma_i^2. The frequency-only sums are computed here; the sums that
//! involve pixel values are left to `maths` as image expressions.

use regex::Regex;
use serde::Serialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

use crate::miriad::ImageStats;

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("a spectral index needs at least two images, got {0}")]
    TooFewImages(usize),

    #[error("image {index}: frequency must be positive, got {value}")]
    BadFrequency { index: usize, value: f64 },

    #[error("image {index}: noise estimate must be positive, got {value}")]
    BadSigma { index: usize, value: f64 },

    #[error("all images are at the same frequency; the fit is degenerate")]
    Degenerate,
}

/// Frequency sums of the least-squares normal equations
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitSums {
    /// ln(frequency / GHz) per image
    pub log_freq: Vec<f64>,
    /// sigma^2 per image
    pub variance: Vec<f64>,
    pub s: f64,
    pub sx: f64,
    pub sxx: f64,
    pub delta: f64,
}

impl FitSums {
    pub fn new(freqs_ghz: &[f64], sigmas: &[f64]) -> Result<Self, FitError> {
        if freqs_ghz.len() < 2 {
            return Err(FitError::TooFewImages(freqs_ghz.len()));
        }
        if let Some((index, &value)) = freqs_ghz.iter().enumerate().find(|(_, f)| !(**f > 0.0)) {
            return Err(FitError::BadFrequency { index, value });
        }
        if let Some((index, &value)) = sigmas.iter().enumerate().find(|(_, s)| !(**s > 0.0)) {
            return Err(FitError::BadSigma { index, value });
        }

        let log_freq: Vec<f64> = freqs_ghz.iter().map(|f| f.ln()).collect();
        let variance: Vec<f64> = sigmas.iter().map(|s| s * s).collect();

        let s: f64 = variance.iter().map(|v| 1.0 / v).sum();
        let sx: f64 = log_freq.iter().zip(&variance).map(|(x, v)| x / v).sum();
        let sxx: f64 = log_freq.iter().zip(&variance).map(|(x, v)| x * x / v).sum();
        let delta = s * sxx - sx * sx;

        // relative test: delta is a difference of nearly equal terms
        if delta.abs() <= 1e-12 * (s * sxx).abs() {
            return Err(FitError::Degenerate);
        }

        Ok(FitSums {
            log_freq,
            variance,
            s,
            sx,
            sxx,
            delta,
        })
    }

    /// `maths` expression for Sy = sum ln(S_i) / sigma_i^2
    pub fn sy_expression(&self, logs: &[String]) -> String {
        logs.iter()
            .zip(&self.variance)
            .map(|(name, v)| format!("+(<{}>/{:.6e})", name, v))
            .collect()
    }

    /// `maths` expression for Sxy = sum ln(nu_i) ln(S_i) / sigma_i^2
    pub fn sxy_expression(&self, logs: &[String]) -> String {
        logs.iter()
            .zip(self.log_freq.iter().zip(&self.variance))
            .map(|(name, (x, v))| format!("+({:.6e}*<{}>/{:.6e})", x, name, v))
            .collect()
    }

    /// `maths` expression for the slope given the Sy and Sxy images
    pub fn index_expression(&self, sy: &str, sxy: &str) -> String {
        format!(
            "({:.6e}*<{}>-<{}>*({:.6e}))/{:.6e}",
            self.s, sxy, sy, self.sx, self.delta
        )
    }

    /// Slope for explicit flux densities, matching what the image
    /// expressions compute per pixel
    pub fn slope(&self, fluxes: &[f64]) -> f64 {
        let sy: f64 = fluxes.iter().zip(&self.variance).map(|(f, v)| f.ln() / v).sum();
        let sxy: f64 = fluxes
            .iter()
            .zip(self.log_freq.iter().zip(&self.variance))
            .map(|(f, (x, v))| x * f.ln() / v)
            .sum();
        (self.s * sxy - sy * self.sx) / self.delta
    }
}

fn gleam_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[^_]+_[^_]+_(\d+(?:\.\d+)?)-(\d+(?:\.\d+)?)MHz").expect("valid regex")
    })
}

/// Band centre in GHz of a GLEAM cutout such as
/// `gleam_cutout_072-103MHz_133_-46333_STACKED.fits`
pub fn gleam_frequency_ghz(path: &Path) -> Option<f64> {
    let name = path.file_name()?.to_str()?;
    let caps = gleam_regex().captures(name)?;
    let low: f64 = caps[1].parse().ok()?;
    let high: f64 = caps[2].parse().ok()?;
    Some(1e-3 * (low + high) / 2.0)
}

/// Image with the smallest pixel increment; the first one wins ties
pub fn finest_grid(measured: &[ImageStats]) -> Option<usize> {
    measured
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, inc)) if inc <= p.increment => best,
            _ => Some((i, p.increment)),
        })
        .map(|(i, _)| i)
}

/// Image with the largest beam major axis; the first one wins ties
pub fn biggest_beam(measured: &[ImageStats]) -> Option<usize> {
    measured
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f64)>, (i, p)| match best {
            Some((_, bmaj)) if bmaj >= p.bmaj => best,
            _ => Some((i, p.bmaj)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stats(bmaj: f64, increment: f64) -> ImageStats {
        ImageStats {
            bmaj,
            bmin: bmaj / 2.0,
            bpa: 0.0,
            increment,
            freq_ghz: 1.0,
            sigma: 1.0,
        }
    }

    #[test]
    fn test_sums_for_two_images() {
        let fit = FitSums::new(&[1.0, std::f64::consts::E], &[1.0, 1.0]).unwrap();
        assert_relative_eq!(fit.s, 2.0);
        assert_relative_eq!(fit.sx, 1.0, epsilon = 1e-12);
        assert_relative_eq!(fit.sxx, 1.0, epsilon = 1e-12);
        assert_relative_eq!(fit.delta, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_slope_recovers_power_law() {
        let freqs = [0.088, 0.2, 1.4, 5.5];
        let sigmas = [0.02, 0.01, 0.001, 0.0005];
        let alpha = -0.7;
        let fluxes: Vec<f64> = freqs.iter().map(|f: &f64| 3.0 * f.powf(alpha)).collect();

        let fit = FitSums::new(&freqs, &sigmas).unwrap();
        assert_relative_eq!(fit.slope(&fluxes), alpha, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_inputs() {
        assert_eq!(FitSums::new(&[1.0], &[1.0]), Err(FitError::TooFewImages(1)));
        assert_eq!(
            FitSums::new(&[1.0, 0.0], &[1.0, 1.0]),
            Err(FitError::BadFrequency { index: 1, value: 0.0 })
        );
        assert_eq!(
            FitSums::new(&[1.0, 2.0], &[-1.0, 1.0]),
            Err(FitError::BadSigma { index: 0, value: -1.0 })
        );
        assert_eq!(FitSums::new(&[1.4, 1.4], &[1.0, 2.0]), Err(FitError::Degenerate));
    }

    #[test]
    fn test_expressions() {
        let fit = FitSums::new(&[1.0, std::f64::consts::E], &[1.0, 0.5]).unwrap();
        let logs = vec!["f00.log".to_string(), "f01.log".to_string()];

        assert_eq!(
            fit.sy_expression(&logs),
            "+(<f00.log>/1.000000e0)+(<f01.log>/2.500000e-1)"
        );
        assert_eq!(
            fit.sxy_expression(&logs),
            "+(0.000000e0*<f00.log>/1.000000e0)+(1.000000e0*<f01.log>/2.500000e-1)"
        );
        // S = 5, Sx = 4, Sxx = 4, delta = 4
        assert_eq!(
            fit.index_expression("Sy", "Sxy"),
            "(5.000000e0*<Sxy>-<Sy>*(4.000000e0))/4.000000e0"
        );
    }

    #[test]
    fn test_gleam_frequency() {
        let f = gleam_frequency_ghz(Path::new("data/gleam_cutout_072-103MHz_133_-46333_STACKED.fits"));
        assert_relative_eq!(f.unwrap(), 0.0875);
        assert_eq!(gleam_frequency_ghz(Path::new("snr-askap.fits")), None);
    }

    #[test]
    fn test_grid_and_beam_selection() {
        let measured = vec![stats(45.0, 10.0), stats(120.0, 4.0), stats(120.0, 4.0), stats(10.0, 2.0)];
        assert_eq!(finest_grid(&measured), Some(3));
        assert_eq!(biggest_beam(&measured), Some(1));
        assert_eq!(finest_grid(&[]), None);
    }
}
