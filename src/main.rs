use anyhow::Context;
use clap::Parser;

use radfits::beam::Beam;
use radfits::cli::{Cli, Commands};
use radfits::commands::{
    decompress, set_beam, show_headers, spectral_index, squeeze_file, InputImage, SpecIndexOptions,
    SqueezeOptions,
};
use radfits::logging;
use radfits::utils::{derived_output_path, provenance, uncompressed_output_path};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let command_line: Vec<String> = std::env::args().collect();
    let history = provenance(&command_line);

    match cli.command {
        Commands::Squeeze {
            input,
            output,
            full_header,
            overwrite,
        } => {
            let output = output.unwrap_or_else(|| derived_output_path(&input, "drop"));
            let options = SqueezeOptions {
                full_header,
                overwrite,
            };
            let report = squeeze_file(&input, &output, &options, &history)?;
            println!(
                "{}: {:?} -> {:?}, written to {}",
                input.display(),
                report.input_shape,
                report.output_shape,
                output.display()
            );
        }
        Commands::Beam {
            input,
            bmaj,
            bmin,
            bpa,
            hdu,
            output,
            overwrite,
        } => {
            let beam = Beam::from_args(&bmaj, &bmin, bpa.as_deref())
                .context("Invalid beam parameters")?;
            set_beam(&input, output.as_deref(), &beam, hdu, overwrite, &history)?;
            println!(
                "{}: beam set to {}",
                output.as_deref().unwrap_or(input.as_path()).display(),
                beam
            );
        }
        Commands::Decompress {
            input,
            output,
            overwrite,
        } => {
            let output = output.unwrap_or_else(|| uncompressed_output_path(&input));
            decompress(&input, &output, overwrite, &history)?;
            println!("{} -> {}", input.display(), output.display());
        }
        Commands::Specindx {
            inputs,
            config,
            output,
            workdir,
            miriad_bin,
            fits_out,
            summary,
            keep_intermediates,
            overwrite,
        } => {
            let from_cli = SpecIndexOptions {
                inputs: inputs.into_iter().map(InputImage::new).collect(),
                output,
                workdir,
                miriad_bin,
                fits_out,
                summary,
                keep_intermediates,
                overwrite,
            };
            let options = match config {
                Some(path) => SpecIndexOptions::from_job_file(&path)?.merge(from_cli),
                None => from_cli,
            };
            spectral_index(&options)?;
        }
        Commands::Headers { input, format } => {
            show_headers(&input, &format)?;
        }
    }

    Ok(())
}
