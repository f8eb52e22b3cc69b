//! PixelPilot CLI
//!
//! Runs the element locator against a screenshot and manages template
//! directories and config files.
//!
//! Usage from workspace root:
//!   cargo run --bin pixelpilot -- locate --descriptor '{"template_id":"import_button"}' --screenshot shot.png
//!   cargo run --bin pixelpilot -- templates list --dir templates
//!   cargo run --bin pixelpilot -- templates capture --id import_button --phase import --screenshot shot.png --region 10,20,64,32
//!   cargo run --bin pixelpilot -- config check pixelpilot.toml

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use pixelpilot::{
    init_logging, ActionDescriptor, BoundingBox, ConfigHandle, ElementLocator,
    FileDiagnosticsSink, LocateError, ScreenCapture, Screenshot, Settings, TemplateStore,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "pixelpilot")]
#[command(about = "Locate elements and detect completion in pixel-based desktop apps")]
struct Cli {
    /// Settings file (TOML). Defaults apply when omitted.
    #[clap(long, short = 'c', global = true, env = "PIXELPILOT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve an action descriptor and print the result as JSON
    Locate(LocateArgs),
    /// Inspect or extend a template directory
    #[command(subcommand)]
    Templates(TemplateCommands),
    /// Validate configuration files
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Args, Debug)]
struct LocateArgs {
    /// Descriptor as inline JSON, or a path to a JSON file
    #[clap(long, short = 'd')]
    descriptor: String,

    /// Search this PNG instead of capturing the live screen
    #[clap(long, short = 's')]
    screenshot: Option<PathBuf>,

    /// Template directory (overrides `template_dir` from settings)
    #[clap(long, short = 't')]
    templates: Option<PathBuf>,

    /// Write failure screenshots and the JSONL journal here (overrides `diagnostics_dir`)
    #[clap(long)]
    diagnostics: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum TemplateCommands {
    /// List template ids with their variants
    List {
        #[clap(long, default_value = "templates")]
        dir: PathBuf,
    },
    /// Crop a region out of a screenshot and store it as a new variant
    Capture {
        #[clap(long)]
        id: String,
        #[clap(long)]
        phase: String,
        #[clap(long)]
        screenshot: PathBuf,
        /// Region as x,y,width,height
        #[clap(long, value_parser = parse_region)]
        region: BoundingBox,
        #[clap(long, default_value = "templates")]
        dir: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Parse and validate a settings file, then print the effective values
    Check { file: PathBuf },
}

fn parse_region(value: &str) -> Result<BoundingBox, String> {
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    let [x, y, w, h] = parts.as_slice() else {
        return Err(format!("expected x,y,width,height, got '{value}'"));
    };
    let x = x.parse::<i32>().map_err(|e| format!("bad x: {e}"))?;
    let y = y.parse::<i32>().map_err(|e| format!("bad y: {e}"))?;
    let w = w.parse::<u32>().map_err(|e| format!("bad width: {e}"))?;
    let h = h.parse::<u32>().map_err(|e| format!("bad height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("width and height must be positive".to_string());
    }
    Ok(BoundingBox::new(x, y, w, h))
}

/// Serves one screenshot loaded from disk.
struct FileScreen(Screenshot);

impl ScreenCapture for FileScreen {
    fn capture_screen(&self) -> Result<Screenshot, LocateError> {
        Ok(self.0.clone())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match &cli.config {
        Some(path) => ConfigHandle::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => ConfigHandle::default(),
    };

    match cli.command {
        Commands::Locate(args) => run_locate(args, config),
        Commands::Templates(TemplateCommands::List { dir }) => list_templates(&dir),
        Commands::Templates(TemplateCommands::Capture {
            id,
            phase,
            screenshot,
            region,
            dir,
        }) => capture_template(&id, &phase, &screenshot, region, &dir),
        Commands::Config(ConfigCommands::Check { file }) => check_config(&file),
    }
}

fn read_descriptor(raw: &str) -> Result<ActionDescriptor> {
    let path = Path::new(raw);
    let json = if !raw.trim_start().starts_with('{') && path.is_file() {
        fs::read_to_string(path)
            .with_context(|| format!("Failed to read descriptor file {}", path.display()))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&json).context("Invalid action descriptor")
}

fn screen_source(screenshot: Option<&Path>) -> Result<Arc<dyn ScreenCapture>> {
    if let Some(path) = screenshot {
        let shot = Screenshot::load(path)
            .with_context(|| format!("Failed to load screenshot {}", path.display()))?;
        return Ok(Arc::new(FileScreen(shot)));
    }
    live_screen()
}

#[cfg(feature = "screen-capture")]
fn live_screen() -> Result<Arc<dyn ScreenCapture>> {
    Ok(Arc::new(pixelpilot::XcapScreenCapture))
}

#[cfg(not(feature = "screen-capture"))]
fn live_screen() -> Result<Arc<dyn ScreenCapture>> {
    anyhow::bail!("no --screenshot given and live capture is disabled (build with --features screen-capture)")
}

fn run_locate(args: LocateArgs, config: ConfigHandle) -> Result<()> {
    let descriptor = read_descriptor(&args.descriptor)?;
    if descriptor.target_text().is_some() {
        info!("Text recognition needs an OCR backend; the text method is skipped");
    }
    let settings = config.current();
    let template_dir = args
        .templates
        .unwrap_or_else(|| PathBuf::from(&settings.template_dir));
    let diagnostics_dir = args
        .diagnostics
        .unwrap_or_else(|| PathBuf::from(&settings.diagnostics_dir));

    let mut builder = ElementLocator::builder(screen_source(args.screenshot.as_deref())?)
        .config(config.clone())
        .diagnostics(Arc::new(FileDiagnosticsSink::new(diagnostics_dir)));
    if template_dir.is_dir() {
        let store = TemplateStore::load(&template_dir).with_context(|| {
            format!("Failed to load templates from {}", template_dir.display())
        })?;
        builder = builder.templates(Arc::new(store));
    } else {
        debug!(dir = %template_dir.display(), "Template directory not found; template method disabled");
    }
    let locator = builder.build();

    let result = locator.locate(&descriptor);
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn list_templates(dir: &Path) -> Result<()> {
    let store = TemplateStore::load(dir)
        .with_context(|| format!("Failed to load templates from {}", dir.display()))?;
    let ids = store.ids();
    if ids.is_empty() {
        println!("No templates in {}", dir.display());
        return Ok(());
    }
    for id in ids {
        let Some(template) = store.get(&id) else {
            continue;
        };
        println!("{id}");
        for variant in template.variants() {
            let (w, h) = variant.image().dimensions();
            println!("  {}/{} ({w}x{h})", variant.phase, variant.file_name);
        }
    }
    Ok(())
}

fn capture_template(
    id: &str,
    phase: &str,
    screenshot: &Path,
    region: BoundingBox,
    dir: &Path,
) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let store = TemplateStore::load(dir)
        .with_context(|| format!("Failed to load templates from {}", dir.display()))?;
    let shot = Screenshot::load(screenshot)
        .with_context(|| format!("Failed to load screenshot {}", screenshot.display()))?;
    let variant = store
        .capture_variant(id, phase, &shot, region)
        .with_context(|| format!("Failed to capture template '{id}'"))?;
    println!("Saved {}", variant.source.display());
    Ok(())
}

fn check_config(file: &Path) -> Result<()> {
    let settings = Settings::load(file)
        .with_context(|| format!("Invalid settings file {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}
