use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "radfits")]
#[command(version, about = "Small FITS and MIRIAD utilities for radio astronomy images", long_about = None)]
pub struct Cli {
    /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Remove length-1 axes from a FITS image, keeping the matching WCS
    Squeeze {
        /// Input FITS image
        input: PathBuf,

        /// Output file (default: <input>-drop.fits next to the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep every header card, not only WCS and data-description ones
        #[arg(long)]
        full_header: bool,

        /// Replace the output file if it exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Write the restoring beam (BMAJ, BMIN, BPA) into a FITS header
    Beam {
        /// FITS file to update
        input: PathBuf,

        /// Major axis FWHM, e.g. 45, 45arcsec, 0.75arcmin, 0.0125deg (default arcsec)
        #[arg(long, allow_hyphen_values = true)]
        bmaj: String,

        /// Minor axis FWHM (same units as --bmaj)
        #[arg(long, allow_hyphen_values = true)]
        bmin: String,

        /// Position angle, east of north (default unit degrees)
        #[arg(long, allow_hyphen_values = true)]
        bpa: Option<String>,

        /// HDU to update
        #[arg(long, default_value_t = 0)]
        hdu: usize,

        /// Write a copy instead of updating the input in place
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace the output copy if it exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Expand tile-compressed (.fz) FITS images
    Decompress {
        /// Compressed FITS file
        input: PathBuf,

        /// Output file (default: <name minus its last extension>-uncompressed.fits
        /// in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace the output file if it exists
        #[arg(long)]
        overwrite: bool,
    },

    /// Build a spectral-index map from images at several frequencies using MIRIAD
    Specindx {
        /// Input images: FITS files or MIRIAD datasets
        inputs: Vec<PathBuf>,

        /// JSON job file listing inputs and options
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output MIRIAD dataset (default: specindx.mir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory for intermediate datasets; existing entries are never touched
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Directory holding the MIRIAD task binaries (default: search PATH)
        #[arg(long)]
        miriad_bin: Option<PathBuf>,

        /// Also export the result as FITS
        #[arg(long)]
        fits_out: Option<PathBuf>,

        /// Write a JSON summary of the measured images and the fit
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Leave the working directory in place
        #[arg(long)]
        keep_intermediates: bool,

        /// Replace existing outputs
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the HDUs and header cards of a FITS file
    Headers {
        /// FITS file to inspect
        input: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}
