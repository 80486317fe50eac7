//! placeholder-anonymizer command-line interface
//!
//! Reads text on stdin, writes one JSON document on stdout. Logs go to stderr.

use anyhow::Result;
use clap::Parser;
use placeholder_anonymizer_core::{Config, Engine, Error, InvocationRequest, Mode, PromptLoader};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(value_enum, help = "Operation to perform")]
    pub mode: Mode,

    #[arg(long, help = "Path to the entity mapping store (overrides the configured path)")]
    pub entity_mapping_file: Option<PathBuf>,

    #[arg(long, default_value = "warn", help = "Log level (error, warn, info, debug, trace)")]
    pub log_level: String,

    #[arg(long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Keep trailing newlines of the input instead of stripping them")]
    pub preserve_trailing_newlines: bool,
}

impl Args {
    pub fn normalize_input(&self, mut text: String) -> String {
        if !self.preserve_trailing_newlines {
            let trimmed = text.trim_end_matches(['\n', '\r']).len();
            text.truncate(trimmed);
        }
        text
    }
}

/// First-run companion to the default config: a copy of the built-in prompt
/// users can edit and select with `llm.prompt_template = "default"`.
fn install_default_prompt(loader: &PromptLoader) {
    match loader.install_default() {
        Ok(path) => info!("Default prompt template available at: {}", path.display()),
        Err(e) => warn!("Could not install default prompt template: {:#}", e),
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match args.config.as_ref() {
        Some(config_path) => {
            info!("Loading configuration from: {}", config_path.display());
            Config::from_file(config_path)?
        }
        None => {
            // Try to load from default location, fallback to default config
            match Config::get_default_config_path() {
                Ok(default_path) if default_path.exists() => {
                    info!("Loading configuration from default location: {}", default_path.display());
                    Config::from_file(&default_path)?
                }
                Ok(default_path) => {
                    info!("Creating default configuration at: {}", default_path.display());
                    let mut config = Config::default();
                    config.to_file(&default_path)?;
                    if let Ok(loader) = PromptLoader::from_app_dirs() {
                        install_default_prompt(&loader);
                    }
                    config.resolve_paths()?;
                    config
                }
                Err(_) => {
                    info!("Using default configuration (could not determine config directory)");
                    let mut config = Config::default();
                    config.resolve_paths()?;
                    config
                }
            }
        }
    };

    if let Some(path) = args.entity_mapping_file.as_ref() {
        config.mapping.path = path.clone();
    }

    config.validate()?;
    info!("Configuration validated successfully");
    Ok(config)
}

async fn read_stdin() -> std::io::Result<String> {
    let mut buffer = Vec::new();
    tokio::io::stdin().read_to_end(&mut buffer).await?;
    String::from_utf8(buffer).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

async fn run(args: &Args) -> std::result::Result<String, Error> {
    let config = load_config(args).map_err(|e| Error::Config(format!("{:#}", e)))?;
    let engine = Engine::from_config(&config)?;

    let text = match args.mode {
        Mode::Stats => String::new(),
        _ => {
            let raw = read_stdin()
                .await
                .map_err(|e| Error::Invocation(format!("failed to read stdin: {}", e)))?;
            args.normalize_input(raw)
        }
    };
    debug!("Read {} bytes of input", text.len());

    let response = engine.invoke(&InvocationRequest { mode: args.mode, text }).await?;
    response.to_json()
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = args.log_level.parse::<tracing::Level>()
        .unwrap_or_else(|_| {
            eprintln!("Invalid log level '{}', defaulting to 'info'", args.log_level);
            tracing::Level::INFO
        });

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting placeholder-anonymizer in {:?} mode", args.mode);

    match run(&args).await {
        Ok(json) => {
            print!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error [{}]: {}", e.kind(), e);
            ExitCode::from(e.exit_code())
        }
    }
}
