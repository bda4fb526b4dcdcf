use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::miriad::{self, arg, ImageStats, MiriadRunner, Toolkit};
use crate::spectral::{self, FitSums};
use crate::utils::{is_fits_file, truncate_string};

pub const DEFAULT_OUTPUT: &str = "specindx.mir";

/// Name of the fitted map inside the working directory
const RESULT: &str = "specindx.mir";

/// One image taking part in the fit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputImage {
    pub path: PathBuf,
    /// Overrides the frequency read from the image header
    pub freq_ghz: Option<f64>,
}

impl InputImage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        InputImage {
            path: path.into(),
            freq_ghz: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JobInput {
    Path(PathBuf),
    Detailed {
        path: PathBuf,
        #[serde(default)]
        freq_ghz: Option<f64>,
    },
}

/// JSON job description accepted by `--config`
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobFile {
    #[serde(default)]
    inputs: Vec<JobInput>,
    output: Option<PathBuf>,
    workdir: Option<PathBuf>,
    miriad_bin: Option<PathBuf>,
    fits_out: Option<PathBuf>,
    summary: Option<PathBuf>,
    #[serde(default)]
    keep_intermediates: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecIndexOptions {
    pub inputs: Vec<InputImage>,
    pub output: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    pub miriad_bin: Option<PathBuf>,
    pub fits_out: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub keep_intermediates: bool,
    pub overwrite: bool,
}

impl SpecIndexOptions {
    /// Load a job file; relative paths in it are taken relative to the file
    pub fn from_job_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        Self::from_job_json(&text, path.parent().unwrap_or_else(|| Path::new("")))
            .with_context(|| format!("Invalid job file: {}", path.display()))
    }

    pub fn from_job_json(text: &str, base: &Path) -> Result<Self> {
        let job: JobFile = serde_json::from_str(text)?;
        let rebase = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

        Ok(SpecIndexOptions {
            inputs: job
                .inputs
                .into_iter()
                .map(|input| match input {
                    JobInput::Path(path) => InputImage::new(rebase(path)),
                    JobInput::Detailed { path, freq_ghz } => InputImage {
                        path: rebase(path),
                        freq_ghz,
                    },
                })
                .collect(),
            output: job.output.map(rebase),
            workdir: job.workdir.map(rebase),
            miriad_bin: job.miriad_bin.map(rebase),
            fits_out: job.fits_out.map(rebase),
            summary: job.summary.map(rebase),
            keep_intermediates: job.keep_intermediates,
            overwrite: false,
        })
    }

    /// Combine with command-line values, which take precedence
    pub fn merge(self, cli: SpecIndexOptions) -> Self {
        SpecIndexOptions {
            inputs: if cli.inputs.is_empty() { self.inputs } else { cli.inputs },
            output: cli.output.or(self.output),
            workdir: cli.workdir.or(self.workdir),
            miriad_bin: cli.miriad_bin.or(self.miriad_bin),
            fits_out: cli.fits_out.or(self.fits_out),
            summary: cli.summary.or(self.summary),
            keep_intermediates: cli.keep_intermediates || self.keep_intermediates,
            overwrite: cli.overwrite || self.overwrite,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageSummary {
    pub path: PathBuf,
    #[serde(flatten)]
    pub stats: ImageStats,
}

/// What was measured and fitted; written as JSON with `--summary`
#[derive(Debug, Clone, Serialize)]
pub struct SpecIndexSummary {
    pub images: Vec<ImageSummary>,
    /// Index of the image whose grid the others were regridded onto
    pub reference_grid: usize,
    /// Index of the image whose beam the others were convolved to
    pub reference_beam: usize,
    pub fit: FitSums,
    pub output: PathBuf,
    pub fits_output: Option<PathBuf>,
    pub created: String,
}

/// A dataset name as passed to the tasks, and whether it lives in the
/// working directory (and so may be renamed)
#[derive(Debug, Clone)]
struct Dataset {
    name: String,
    owned: bool,
}

/// Working directory holding the intermediate datasets.
///
/// On drop it is removed if it was created here, otherwise only the
/// entries claimed in it are removed. A name can only be claimed while
/// nothing exists under it, so files already in the directory are never
/// touched. Nothing is removed with `keep`.
struct WorkDir {
    path: PathBuf,
    created: bool,
    keep: bool,
    entries: Vec<String>,
}

impl WorkDir {
    fn open(path: PathBuf, keep: bool) -> Result<Self> {
        let created = !path.exists();
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create working directory: {}", path.display()))?;
        tracing::debug!("Working directory {}", path.display());
        Ok(WorkDir {
            path,
            created,
            keep,
            entries: Vec::new(),
        })
    }

    /// Reserve `name` for an intermediate this run is about to create
    fn claim(&mut self, name: &str) -> Result<()> {
        let path = self.path.join(name);
        if path.exists() {
            anyhow::bail!(
                "{} already exists in working directory {}; choose another --workdir or remove it",
                name,
                self.path.display()
            );
        }
        if !self.entries.iter().any(|e| e == name) {
            self.entries.push(name.to_string());
        }
        Ok(())
    }

    fn untrack(&mut self, name: &str) {
        self.entries.retain(|e| e != name);
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            tracing::info!("Intermediate files kept in {}", self.path.display());
            return;
        }
        let result = if self.created {
            fs::remove_dir_all(&self.path)
        } else {
            self.entries
                .iter()
                .map(|name| self.path.join(name))
                .filter(|p| p.exists())
                .try_for_each(|p| remove_path(&p))
        };
        if let Err(e) = result {
            tracing::warn!("Failed to clean up {}: {}", self.path.display(), e);
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("Failed to determine the current directory")?
            .join(path))
    }
}

fn check_target(path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        anyhow::bail!(
            "Output {} already exists; use --overwrite to replace it",
            path.display()
        );
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// MIRIAD datasets are directories
fn copy_dir_all(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn move_dir(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_err() {
        // rename fails across filesystems
        copy_dir_all(from, to)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        fs::remove_dir_all(from)?;
    }
    Ok(())
}

fn puthd(toolkit: &dyn Toolkit, cwd: &Path, dataset: &str, item: &str, value: &str) -> Result<()> {
    toolkit.run(
        "puthd",
        &[arg("in", format!("{}/{}", dataset, item)), arg("value", value)],
        cwd,
    )?;
    Ok(())
}

/// FITS inputs are imported into the working directory and labelled as
/// intensity maps; MIRIAD datasets are used where they are
fn stage_input(
    toolkit: &dyn Toolkit,
    work: &mut WorkDir,
    index: usize,
    input: &InputImage,
) -> Result<Dataset> {
    let source = absolute(&input.path)?;
    if !source.exists() {
        anyhow::bail!("Input image not found: {}", source.display());
    }
    if !is_fits_file(&source) {
        return Ok(Dataset {
            name: source.display().to_string(),
            owned: false,
        });
    }

    let name = format!("in{:02}.mir", index);
    work.claim(&name)?;
    tracing::info!("Importing {} as {}", source.display(), name);
    toolkit.run(
        "fits",
        &[
            arg("in", source.display()),
            arg("out", &name),
            arg("op", "xyin"),
        ],
        &work.path,
    )?;
    puthd(toolkit, &work.path, &name, "bunit", "JY/BEAM")?;
    puthd(toolkit, &work.path, &name, "btype", "intensity")?;
    if let Some(freq) = spectral::gleam_frequency_ghz(&source) {
        puthd(toolkit, &work.path, &name, "restfreq", &format!("{:.6}", freq))?;
    }

    Ok(Dataset { name, owned: true })
}

/// Build a spectral-index map from `options.inputs` with `toolkit`
pub fn run_pipeline(toolkit: &dyn Toolkit, options: &SpecIndexOptions) -> Result<SpecIndexSummary> {
    let count = options.inputs.len();
    if count < 2 {
        anyhow::bail!("A spectral index needs at least two input images, got {}", count);
    }

    let output = absolute(&options.output_path())?;
    check_target(&output, options.overwrite)?;
    let fits_out = options.fits_out.as_deref().map(absolute).transpose()?;
    if let Some(path) = &fits_out {
        check_target(path, options.overwrite)?;
    }
    if let Some(path) = &options.summary {
        check_target(path, options.overwrite)?;
    }

    let workdir = match &options.workdir {
        Some(dir) => absolute(dir)?,
        None => output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(format!(".specindx-{}", std::process::id())),
    };
    let mut work = WorkDir::open(workdir, options.keep_intermediates)?;
    if output.starts_with(&work.path) {
        // the result stays inside; only clear our own entries
        work.created = false;
    }
    let cwd = work.path.clone();

    let mut datasets = Vec::with_capacity(count);
    for (index, input) in options.inputs.iter().enumerate() {
        let dataset = stage_input(toolkit, &mut work, index, input)
            .with_context(|| format!("Failed to prepare {}", input.path.display()))?;
        datasets.push(dataset);
    }

    let mut measured = Vec::with_capacity(count);
    for (dataset, input) in datasets.iter().zip(&options.inputs) {
        let stats = miriad::measure(toolkit, &dataset.name, &cwd, input.freq_ghz)
            .with_context(|| format!("Failed to inspect {}", input.path.display()))?;
        measured.push(stats);
    }

    let freqs: Vec<f64> = measured.iter().map(|p| p.freq_ghz).collect();
    let sigmas: Vec<f64> = measured.iter().map(|p| p.sigma).collect();
    let fit = FitSums::new(&freqs, &sigmas)?;

    let finest = spectral::finest_grid(&measured).context("No images to regrid")?;
    let biggest = spectral::biggest_beam(&measured).context("No images to convolve")?;
    tracing::info!(
        "Regridding onto {} and convolving to the beam of {}",
        options.inputs[finest].path.display(),
        options.inputs[biggest].path.display()
    );

    for index in (0..count).filter(|&i| i != finest) {
        let out = format!("in{:02}.rg", index);
        work.claim(&out)?;
        toolkit.run(
            "regrid",
            &[
                arg("in", &datasets[index].name),
                arg("tin", &datasets[finest].name),
                arg("axes", "1,2"),
                arg("out", &out),
            ],
            &cwd,
        )?;
        datasets[index] = Dataset {
            name: out,
            owned: true,
        };
    }

    let target = measured[biggest];
    for index in (0..count).filter(|&i| i != biggest) {
        let out = format!("in{:02}.cv", index);
        work.claim(&out)?;
        toolkit.run(
            "convol",
            &[
                arg("map", &datasets[index].name),
                arg("fwhm", format!("{:.6e},{:.6e}", target.bmaj, target.bmin)),
                arg("pa", format!("{:.6e}", target.bpa)),
                arg("options", "final"),
                arg("out", &out),
            ],
            &cwd,
        )?;
        datasets[index] = Dataset {
            name: out,
            owned: true,
        };
    }

    // maths limits the expression length, so the matched maps get short names
    let mut logs = Vec::with_capacity(count);
    for (index, dataset) in datasets.iter().enumerate() {
        let short = format!("f{:02}", index);
        let short_path = cwd.join(&short);
        work.claim(&short)?;
        if dataset.owned {
            fs::rename(cwd.join(&dataset.name), &short_path)
                .with_context(|| format!("Failed to rename {} to {}", dataset.name, short))?;
            work.untrack(&dataset.name);
        } else {
            copy_dir_all(Path::new(&dataset.name), &short_path)
                .with_context(|| format!("Failed to copy {} to {}", dataset.name, short))?;
        }

        let log = format!("{}.log", short);
        work.claim(&log)?;
        toolkit.run(
            "maths",
            &[
                arg("exp", format!("log(<{}>)", short)),
                arg("mask", format!("<{}>.gt.0", short)),
                arg("out", &log),
            ],
            &cwd,
        )?;
        logs.push(log);
    }

    tracing::debug!(
        "Fit sums: S={:e} Sx={:e} Sxx={:e} delta={:e}",
        fit.s,
        fit.sx,
        fit.sxx,
        fit.delta
    );
    work.claim("Sy")?;
    toolkit.run("maths", &[arg("exp", fit.sy_expression(&logs)), arg("out", "Sy")], &cwd)?;
    work.claim("Sxy")?;
    toolkit.run("maths", &[arg("exp", fit.sxy_expression(&logs)), arg("out", "Sxy")], &cwd)?;
    let result = cwd.join(RESULT);
    if result == output && output.exists() {
        // --overwrite was given for exactly this dataset
        remove_path(&output)
            .with_context(|| format!("Failed to remove old {}", output.display()))?;
    }
    work.claim(RESULT)?;
    toolkit.run(
        "maths",
        &[arg("exp", fit.index_expression("Sy", "Sxy")), arg("out", RESULT)],
        &cwd,
    )?;
    puthd(toolkit, &cwd, RESULT, "btype", "spectral_index")?;
    puthd(toolkit, &cwd, RESULT, "bunit", "SpectralIndex")?;

    if result != output {
        if output.exists() {
            remove_path(&output)
                .with_context(|| format!("Failed to remove old {}", output.display()))?;
        }
        move_dir(&result, &output)?;
    }
    work.untrack(RESULT);
    tracing::info!("Spectral index map written to {}", output.display());

    if let Some(path) = &fits_out {
        if path.exists() {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove old {}", path.display()))?;
        }
        toolkit.run(
            "fits",
            &[
                arg("in", output.display()),
                arg("out", path.display()),
                arg("op", "xyout"),
            ],
            &cwd,
        )?;
        tracing::info!("FITS copy written to {}", path.display());
    }

    let summary = SpecIndexSummary {
        images: options
            .inputs
            .iter()
            .zip(&measured)
            .map(|(input, stats)| ImageSummary {
                path: input.path.clone(),
                stats: *stats,
            })
            .collect(),
        reference_grid: finest,
        reference_beam: biggest,
        fit,
        output,
        fits_output: fits_out,
        created: chrono::Utc::now().to_rfc3339(),
    };

    if let Some(path) = &options.summary {
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write summary: {}", path.display()))?;
    }

    Ok(summary)
}

/// Run the pipeline against the installed MIRIAD and print what was fitted
pub fn spectral_index(options: &SpecIndexOptions) -> Result<()> {
    let runner = MiriadRunner::new(options.miriad_bin.clone());
    let summary = run_pipeline(&runner, options)?;

    println!(
        "{:<40} {:>10} {:>20} {:>9} {:>11}",
        "Image", "Freq (GHz)", "Beam (arcsec)", "Pixel", "RMS"
    );
    println!("{}", "-".repeat(94));
    for (index, image) in summary.images.iter().enumerate() {
        let marks = match (index == summary.reference_grid, index == summary.reference_beam) {
            (true, true) => " [grid, beam]",
            (true, false) => " [grid]",
            (false, true) => " [beam]",
            (false, false) => "",
        };
        println!(
            "{:<40} {:>10.4} {:>20} {:>9.3} {:>11.3e}{}",
            truncate_string(&image.path.display().to_string(), 40),
            image.stats.freq_ghz,
            format!("{:.2} x {:.2}", image.stats.bmaj, image.stats.bmin),
            image.stats.increment,
            image.stats.sigma,
            marks
        );
    }
    println!();
    println!("Spectral index map: {}", summary.output.display());
    if let Some(path) = &summary.fits_output {
        println!("FITS copy: {}", path.display());
    }
    Ok(())
}
