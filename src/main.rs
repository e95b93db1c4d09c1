use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "imageforge",
    about = "Customize a pre-built Linux disk image from a declarative config"
)]
struct Cli {
    /// Directory for intermediate build artifacts (sacrificial).
    #[arg(long, default_value = "build")]
    build_dir: PathBuf,

    /// Path to the customization config document.
    #[arg(short, long)]
    config_file: PathBuf,

    /// Base image to customize (raw, vhd, vhdx or qcow2).
    #[arg(short, long)]
    image_file: PathBuf,

    /// An RPM source: a directory of *.rpm files, a tarball of packages,
    /// or a repo .conf file. Repeatable; list highest priority first.
    #[arg(long = "rpm-source")]
    rpm_sources: Vec<PathBuf>,

    /// Path of the customized output image.
    #[arg(short, long)]
    output_image_file: PathBuf,

    /// Output image format: vhd, vhdx, raw or qcow2.
    #[arg(long)]
    output_image_format: String,

    /// Also use the base image's own package repositories.
    #[arg(long)]
    use_base_image_repos: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IMAGEFORGE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    imageforge::customizer::customize_image_with_config_file(
        &cli.build_dir,
        &cli.config_file,
        &cli.image_file,
        &cli.rpm_sources,
        &cli.output_image_file,
        &cli.output_image_format,
        cli.use_base_image_repos,
    )
}
