use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tube_volume::{
    CpuKernels, DeviceCapabilities, GpuContext, GpuKernels, PipelineOutput, PipelineSupervisor,
    TubeConfig, TubeKernels, metaimage::write_metaimage,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DeviceChoice {
    Gpu,
    Host,
}

/// Enhance tubular structures in a MetaImage volume.
#[derive(Debug, Parser)]
#[command(name = "tube-volume", version)]
struct Cli {
    /// MetaImage header (.mhd) of the dataset
    header: PathBuf,

    /// Parameter preset, e.g. Lung-Airways-CT; replaces the values from --config
    #[arg(long)]
    preset: Option<String>,

    /// JSON configuration file with kebab-case option names
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override a single option, e.g. --set radius-max=12
    #[arg(long = "set", value_name = "NAME=VALUE")]
    overrides: Vec<String>,

    #[arg(long, value_enum, default_value = "gpu")]
    device: DeviceChoice,

    /// Cap on a single device allocation in MiB
    #[arg(long)]
    max_alloc_mb: Option<u64>,

    #[arg(long, default_value = "out")]
    output_dir: PathBuf,
}

fn build_config(cli: &Cli) -> Result<TubeConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => TubeConfig::from_json_file(path)?,
        None => TubeConfig::default(),
    };
    if let Some(preset) = &cli.preset {
        config.set_option("parameters", preset)?;
    }
    for assignment in &cli.overrides {
        let (name, value) = assignment.split_once('=').unwrap_or((assignment, ""));
        config.set_option(name, value)?;
    }
    Ok(config)
}

fn capped(mut capabilities: DeviceCapabilities, max_alloc_mb: Option<u64>) -> DeviceCapabilities {
    if let Some(mb) = max_alloc_mb {
        capabilities.max_alloc_bytes = capabilities.max_alloc_bytes.min(mb.saturating_mul(1 << 20));
    }
    capabilities
}

fn run<K: TubeKernels>(
    kernels: K,
    capabilities: DeviceCapabilities,
    config: TubeConfig,
    cli: &Cli,
) -> Result<(), Box<dyn std::error::Error>> {
    let supervisor = PipelineSupervisor::new(kernels, capabilities, config);
    let PipelineOutput {
        fields,
        cropping,
        spacing,
        attempts,
        downstream,
        ..
    } = supervisor.run(&cli.header)?;

    let tdf = write_metaimage(&cli.output_dir, "tdf", &fields.tdf.to_f32(), spacing)?;
    let radius = write_metaimage(&cli.output_dir, "radius", &fields.radius, spacing)?;
    info!(
        tdf = %tdf.display(),
        radius = %radius.display(),
        shift = ?cropping.shift,
        attempts,
        centerline = downstream.centerline,
        segmentation = downstream.segmentation,
        "results written"
    );
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    match cli.device {
        DeviceChoice::Gpu => match GpuContext::acquire().await {
            Ok(context) => {
                let capabilities = capped(context.capabilities().clone(), cli.max_alloc_mb);
                run(GpuKernels::new(context), capabilities, config, &cli)
            }
            Err(err) => {
                warn!(error = %err, "no usable GPU, running on the host");
                let capabilities = capped(DeviceCapabilities::host(None), cli.max_alloc_mb);
                run(CpuKernels, capabilities, config, &cli)
            }
        },
        DeviceChoice::Host => {
            let capabilities = capped(DeviceCapabilities::host(None), cli.max_alloc_mb);
            run(CpuKernels, capabilities, config, &cli)
        }
    }
}
