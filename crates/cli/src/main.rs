use std::path::{Path, PathBuf};

use adapters_cli::config::CliConfig;
use adapters_cli::inspect;
use adapters_cli::logging;
use adapters_core::adapters::{AdapterConfig, AdapterModel};
use adapters_core::config::ModelConfig;
use adapters_core::model::{ModelWithHeads, TransformerModel};
use anyhow::{bail, Context};
use candle_core::{DType, Device};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "adapters", about = "Create and inspect transformer adapters")]
struct Cli {
    /// Log level when RUST_LOG is unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print built-in adapter configs as JSON
    Configs {
        /// Print only this preset
        name: Option<String>,
    },

    /// Attach an adapter to a randomly initialised host and save it
    Create {
        /// Adapter name
        #[arg(long)]
        name: String,

        /// Preset name (see `configs`) or an inline JSON config
        #[arg(long, default_value = "pfeiffer")]
        config: String,

        /// Host config JSON (defaults to BERT-base dimensions)
        #[arg(long)]
        host_config: Option<PathBuf>,

        /// Output directory (default: <output_dir>/<name>)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Parameter dtype (f32, f16, bf16)
        #[arg(long)]
        dtype: Option<String>,

        /// Also save a classification head with this many labels
        #[arg(long)]
        num_labels: Option<usize>,
    },

    /// Summarise a saved adapter directory
    Inspect {
        dir: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Persist defaults to the config file
    Config {
        #[arg(long)]
        host_config: Option<PathBuf>,

        #[arg(long)]
        output_dir: Option<PathBuf>,

        #[arg(long)]
        dtype: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = CliConfig::load();
    cfg.merge(&CliConfig {
        log_level: cli.log_level.clone(),
        ..Default::default()
    });
    logging::init_with_level(cfg.log_level.as_deref().unwrap_or("info"));

    match cli.command {
        Command::Configs { name } => print_configs(name.as_deref()),
        Command::Create {
            name,
            config,
            host_config,
            output,
            dtype,
            num_labels,
        } => {
            cfg.merge(&CliConfig {
                host_config,
                dtype,
                ..Default::default()
            });
            let output = output.unwrap_or_else(|| {
                cfg.output_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(&name)
            });
            create(&cfg, &name, &config, &output, num_labels)
        }
        Command::Inspect { dir, json } => {
            let summary = inspect::summarize(&dir)
                .with_context(|| format!("inspecting {}", dir.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print!("{summary}");
            }
            Ok(())
        }
        Command::Config {
            host_config,
            output_dir,
            dtype,
        } => {
            cfg.merge(&CliConfig {
                host_config,
                output_dir,
                dtype,
                log_level: None,
            });
            let path = cfg.save()?;
            info!(path = %path.display(), "Saved CLI config");
            Ok(())
        }
    }
}

fn print_configs(name: Option<&str>) -> anyhow::Result<()> {
    match name {
        Some(name) => {
            let config: AdapterConfig = name.parse()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        None => {
            let all: serde_json::Map<String, serde_json::Value> = AdapterConfig::known_configs()
                .map(|(name, config)| {
                    Ok::<_, serde_json::Error>((name.to_string(), serde_json::to_value(config)?))
                })
                .collect::<serde_json::Result<_>>()?;
            println!("{}", serde_json::to_string_pretty(&all)?);
        }
    }
    Ok(())
}

fn create(
    cfg: &CliConfig,
    name: &str,
    config: &str,
    output: &Path,
    num_labels: Option<usize>,
) -> anyhow::Result<()> {
    let adapter_config = parse_adapter_config(config)?;
    let host_config = match &cfg.host_config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading host config {}", path.display()))?;
            serde_json::from_str::<ModelConfig>(&content)?
        }
        None => ModelConfig::default(),
    };
    let dtype = parse_dtype(cfg.dtype.as_deref().unwrap_or("f32"))?;

    let mut model = TransformerModel::new(&host_config, &Device::Cpu, dtype)?;
    model.add_adapter(name, adapter_config)?;
    let num_parameters = model.adapter_manager().num_parameters(name)?;

    match num_labels {
        Some(num_labels) => {
            let mut model = ModelWithHeads::new(model);
            model.add_classification_head(name, num_labels)?;
            model.save_adapter(output, name, true)?;
        }
        None => model.save_adapter(output, name, false)?,
    }

    info!(
        adapter = name,
        parameters = num_parameters,
        path = %output.display(),
        "Created adapter"
    );
    Ok(())
}

/// Preset name, or a JSON config.
fn parse_adapter_config(value: &str) -> anyhow::Result<AdapterConfig> {
    if let Ok(config) = value.parse() {
        return Ok(config);
    }
    serde_json::from_str(value)
        .with_context(|| format!("{value:?} is neither a known config nor valid config JSON"))
}

fn parse_dtype(value: &str) -> anyhow::Result<DType> {
    Ok(match value.to_lowercase().as_str() {
        "f32" | "fp32" | "float32" => DType::F32,
        "f16" | "fp16" | "float16" | "half" => DType::F16,
        "bf16" | "bfloat16" => DType::BF16,
        other => bail!("unsupported dtype {other:?}"),
    })
}
