//! Driving the MIRIAD toolkit and reading what its tasks print.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiriadError {
    #[error("failed to start MIRIAD task {task}: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    #[error("MIRIAD task {task} failed ({status}): {stderr}")]
    Failed {
        task: String,
        status: String,
        stderr: String,
    },

    #[error("{item} not found in {task} output for {dataset}")]
    MissingItem {
        dataset: String,
        task: &'static str,
        item: &'static str,
    },

    #[error("cannot read {item} of {dataset} from {text:?}")]
    Parse {
        dataset: String,
        item: &'static str,
        text: String,
    },
}

/// Something that can run MIRIAD tasks.
///
/// Arguments are `key=value` strings; the task runs with `cwd` as its
/// working directory and its standard output is returned.
pub trait Toolkit {
    fn run(&self, task: &str, args: &[String], cwd: &Path) -> Result<String, MiriadError>;
}

/// Runs the real task binaries, from `bin_dir` when given, otherwise from PATH
#[derive(Debug, Clone, Default)]
pub struct MiriadRunner {
    pub bin_dir: Option<PathBuf>,
}

impl MiriadRunner {
    pub fn new(bin_dir: Option<PathBuf>) -> Self {
        MiriadRunner { bin_dir }
    }

    fn program(&self, task: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(task),
            None => PathBuf::from(task),
        }
    }
}

impl Toolkit for MiriadRunner {
    fn run(&self, task: &str, args: &[String], cwd: &Path) -> Result<String, MiriadError> {
        let program = self.program(task);
        tracing::debug!("Running {} {} (in {})", program.display(), args.join(" "), cwd.display());

        let output = Command::new(&program)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|source| MiriadError::Spawn {
                task: task.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(MiriadError::Failed {
                task: task.to_string(),
                status: output.status.to_string(),
                stderr: if stderr.is_empty() { stdout.trim().to_string() } else { stderr },
            });
        }
        tracing::trace!("{} output:\n{}", task, stdout);
        Ok(stdout)
    }
}

/// `key=value` argument
pub fn arg(key: &str, value: impl std::fmt::Display) -> String {
    format!("{}={}", key, value)
}

fn number(dataset: &str, item: &'static str, token: Option<&str>) -> Result<f64, MiriadError> {
    let text = token.unwrap_or("");
    // Fortran writes double-precision exponents with D
    text.replace(|c: char| c == 'D' || c == 'd', "E")
        .parse::<f64>()
        .map_err(|_| MiriadError::Parse {
            dataset: dataset.to_string(),
            item,
            text: text.to_string(),
        })
}

fn missing(dataset: &str, task: &'static str, item: &'static str) -> MiriadError {
    MiriadError::MissingItem {
        dataset: dataset.to_string(),
        task,
        item,
    }
}

/// Major and minor FWHM in arcsec from `Beam Size: A by B arcsec.`
pub fn parse_beam(dataset: &str, prthd: &str) -> Result<(f64, f64), MiriadError> {
    let line = prthd
        .lines()
        .find(|l| l.contains("Beam Size"))
        .ok_or_else(|| missing(dataset, "prthd", "beam size"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let bmaj = number(dataset, "beam major axis", tokens.get(2).copied())?;
    let bmin = number(dataset, "beam minor axis", tokens.get(4).copied())?;
    Ok((bmaj, bmin))
}

/// Beam position angle in degrees
pub fn parse_position_angle(dataset: &str, prthd: &str) -> Result<f64, MiriadError> {
    let line = prthd
        .lines()
        .find(|l| l.contains("Position ang"))
        .ok_or_else(|| missing(dataset, "prthd", "position angle"))?;
    number(dataset, "position angle", line.split_whitespace().nth(2))
}

/// Absolute coordinate increment of the RA axis (arcsec)
pub fn parse_pixel_increment(dataset: &str, prthd: &str) -> Result<f64, MiriadError> {
    let line = prthd
        .lines()
        .find(|l| l.starts_with("RA"))
        .ok_or_else(|| missing(dataset, "prthd", "RA axis"))?;
    Ok(number(dataset, "pixel increment", line.split_whitespace().nth(4))?.abs())
}

/// Reference frequency (GHz) of the spectral axis, if the image has one.
///
/// FREQ-LSR wins over other FREQ axes, which win over MeerKAT's SPECLNMF.
pub fn parse_frequency(dataset: &str, prthd: &str) -> Result<Option<f64>, MiriadError> {
    let rows: Vec<Vec<&str>> = prthd
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|t| !t.is_empty())
        .collect();

    let matchers: [fn(&str) -> bool; 3] = [
        |t| t == "FREQ-LSR",
        |t| t.starts_with("FREQ"),
        |t| t == "SPECLNMF",
    ];
    for matches in matchers {
        if let Some(row) = rows.iter().find(|t| matches(t[0])) {
            return number(dataset, "frequency", row.get(2).copied()).map(Some);
        }
    }
    Ok(None)
}

/// Value printed by `gethd`
pub fn parse_gethd(dataset: &str, item: &'static str, output: &str) -> Result<f64, MiriadError> {
    let token = output.split_whitespace().next();
    if token.is_none() {
        return Err(missing(dataset, "gethd", item));
    }
    number(dataset, item, token)
}

/// Noise estimate from `sigest` (`Estimated rms is ...`)
pub fn parse_sigest(dataset: &str, output: &str) -> Result<f64, MiriadError> {
    let line = output
        .lines()
        .find(|l| l.contains("Estim"))
        .ok_or_else(|| missing(dataset, "sigest", "estimated rms"))?;
    number(dataset, "estimated rms", line.split_whitespace().last())
}

/// What the spectral-index fit needs to know about one image
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImageStats {
    /// Beam FWHM, arcsec
    pub bmaj: f64,
    pub bmin: f64,
    /// Beam position angle, degrees
    pub bpa: f64,
    /// RA pixel increment, arcsec
    pub increment: f64,
    pub freq_ghz: f64,
    pub sigma: f64,
}

/// Read beam, grid, frequency and noise of `dataset`.
///
/// With `freq_ghz` given the header frequency is not consulted.
pub fn measure(
    toolkit: &dyn Toolkit,
    dataset: &str,
    cwd: &Path,
    freq_ghz: Option<f64>,
) -> Result<ImageStats, MiriadError> {
    let header = toolkit.run("prthd", &[arg("in", dataset)], cwd)?;
    let (bmaj, bmin) = parse_beam(dataset, &header)?;
    let bpa = parse_position_angle(dataset, &header)?;
    let increment = parse_pixel_increment(dataset, &header)?;

    let freq_ghz = match freq_ghz {
        Some(f) => f,
        None => match parse_frequency(dataset, &header)? {
            Some(f) => f,
            None => {
                let out = toolkit.run("gethd", &[arg("in", format!("{}/restfreq", dataset))], cwd)?;
                parse_gethd(dataset, "restfreq", &out)?
            }
        },
    };

    let sigma = parse_sigest(dataset, &toolkit.run("sigest", &[arg("in", dataset)], cwd)?)?;

    tracing::info!(
        "{}: beam {:.2}\" x {:.2}\" pa {:.1}, pixel {:.3}\", {:.4} GHz, rms {:.3e}",
        dataset,
        bmaj,
        bmin,
        bpa,
        increment,
        freq_ghz,
        sigma
    );
    Ok(ImageStats {
        bmaj,
        bmin,
        bpa,
        increment,
        freq_ghz,
        sigma,
    })
}
