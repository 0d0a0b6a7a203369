use clap::{Parser, Subcommand};
use image_variants::batch::{self, BatchOptions};
use image_variants::config::{self, ServiceConfig};
use image_variants::dimensions::DimensionSpec;
use image_variants::generator::DerivativeGenerator;
use image_variants::imaging::{MagickEngine, OutputFormat, TransformEngine};
use image_variants::markup::{ImageRef, MarkupBuilder, MarkupOptions, PictureOverrides};
use image_variants::matrix::{self, MatrixFilter};
use image_variants::output;
use image_variants::server::{self, ServeState};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "image-variants")]
#[command(about = "Resized image derivatives, on demand and in batch")]
#[command(long_about = "\
Resized image derivatives, on demand and in batch

Every derivative lives at a URL that is also its cache path:

  {cache root}/{dimensions}/{source dir}/{source name}.{format}
  /cache/images/800x600/library/2024/dawn.webp

'serve' generates missing derivatives when they are first requested.
'generate' precomputes every preset variation for the source library.
'picture' prints the <picture> markup a preset produces for one image,
and with --generate also precomputes every derivative it references.

Transforms run through ImageMagick ('convert' by default).

Run 'image-variants gen-config' to generate a documented config.toml.")]
#[command(version)]
struct Cli {
    /// Config file (optional; stock defaults apply when missing)
    #[arg(long, default_value = "config.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve derivatives over HTTP, generating them on first request
    Serve {
        /// Address to listen on (overrides [serve] bind)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Precompute derivatives for every preset variation
    Generate(GenerateArgs),
    /// Print the <picture> markup for one image
    Picture {
        /// Image path relative to the public root, or a JSON object with
        /// `path` and optional `focal_x`/`focal_y`
        image: String,
        /// Preset to render
        #[arg(long)]
        preset: String,
        /// Render with loading="eager" (no lazy-load attributes)
        #[arg(long)]
        eager: bool,
        /// Also generate every derivative the markup references
        #[arg(long)]
        generate: bool,
    },
    /// Print a stock config.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct GenerateArgs {
    /// Only these presets (comma-separated)
    #[arg(long, value_delimiter = ',')]
    preset: Vec<String>,
    /// Only these dimensions (comma-separated, e.g. 800x600,400)
    #[arg(long, value_delimiter = ',')]
    dimension: Vec<DimensionSpec>,
    /// Only these formats (comma-separated)
    #[arg(long, value_delimiter = ',')]
    format: Vec<OutputFormat>,
    /// Only sources whose path contains this string
    #[arg(long)]
    path: Option<String>,
    /// Regenerate derivatives that already exist
    #[arg(long)]
    force: bool,
    /// Show what would be generated without running the engine
    #[arg(long)]
    dry_run: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(ExitCode::SUCCESS);
    }

    let config = config::load_config(&cli.config)?;

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.serve.bind.clone());
            let state = Arc::new(ServeState::from_config(&config, engine(&config)));
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::run(state, &bind))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Generate(args) => generate(&config, args),
        Command::Picture {
            image,
            preset,
            eager,
            generate,
        } => {
            let value = if image.trim_start().starts_with('{') {
                serde_json::from_str(&image)?
            } else {
                serde_json::Value::String(image)
            };
            let image = ImageRef::from_value(&value)?;
            let options = if eager {
                MarkupOptions::Custom(PictureOverrides::preset(preset).with_img_attr("loading", "eager"))
            } else {
                MarkupOptions::Preset(preset)
            };
            let builder = MarkupBuilder::from_config(&config);
            let picture = builder.build(&image, &options)?;
            if generate {
                let generator = DerivativeGenerator::from_config(&config, engine(&config));
                for request in picture.derivatives() {
                    let path = generator.ensure(&request, false)?;
                    tracing::debug!(path = %path.display(), "derivative ready");
                }
            }
            println!("{}", builder.render(&picture).into_string());
            Ok(ExitCode::SUCCESS)
        }
        Command::GenConfig => Ok(ExitCode::SUCCESS),
    }
}

fn generate(config: &ServiceConfig, args: GenerateArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    init_thread_pool(&config.processing);

    let filter = MatrixFilter {
        presets: args.preset,
        dimensions: args.dimension,
        formats: args.format,
    };
    let variations = matrix::build(&config.presets, &config.default_formats, &filter);
    let sources = batch::discover_sources(
        &config.public_root,
        &config.batch.source_dir,
        args.path.as_deref(),
    )?;
    output::print_batch_plan(&variations, sources.len(), &config.batch.source_dir);

    let generator = DerivativeGenerator::from_config(config, engine(config));
    let options = BatchOptions {
        force: args.force,
        dry_run: args.dry_run,
    };

    let (tx, rx) = std::sync::mpsc::channel();
    let printer = std::thread::spawn(move || {
        for event in rx {
            for line in output::format_batch_event(&event) {
                println!("{}", line);
            }
        }
    });
    let stats = batch::run(&generator, &variations, &sources, options, Some(&tx));
    drop(tx);
    if printer.join().is_err() {
        tracing::warn!("progress printer panicked");
    }

    output::print_batch_summary(&stats, options.dry_run);
    Ok(if stats.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn engine(config: &ServiceConfig) -> Arc<dyn TransformEngine> {
    Arc::new(MagickEngine::new(
        &config.engine.binary,
        config.engine_timeout(),
    ))
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; the config can constrain
/// down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}
