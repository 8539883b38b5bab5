use anyhow::{bail, Context, Result};
use apkinject::android::binary_xml::ManifestDocument;
use apkinject::config::{InjectionTable, PipelineOptions};
use apkinject::extract::read_entry;
use apkinject::inject::InjectionAssets;
use apkinject::pipeline::{read_embedded_config, Pipeline, RunSummary};
use clap::{Args, Parser, Subcommand};
use env_logger::Env;
use log::{info, warn};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// Repackage an APK with injected code and components, then re-sign it
#[derive(Parser)]
#[command(name = "apkinject")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log every entry and patch decision
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone an APK: patch its manifest, inject the payload and sign
    Inject(InjectArgs),

    /// Replace the embedded configuration of a cloned APK and re-sign
    UpdateConfig(UpdateConfigArgs),

    /// Print the decoded AndroidManifest.xml of an APK as text XML
    Manifest(ManifestArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Base directory for scratch trees
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// JSON file overriding the injected component names
    #[arg(long)]
    table: Option<PathBuf>,

    /// Skip post-signing verification
    #[arg(long)]
    no_verify: bool,
}

#[derive(Args)]
struct InjectArgs {
    /// Input APK
    input: PathBuf,

    /// Output APK
    output: PathBuf,

    /// Compiled code unit to add
    #[arg(long)]
    dex: PathBuf,

    /// Clone configuration (JSON object)
    #[arg(long)]
    config: PathBuf,

    /// Directory of `.so` files to stage under the injected ABI
    #[arg(long)]
    native_libs: PathBuf,

    /// Optional ZIP of app data to embed
    #[arg(long)]
    bundled_data: Option<PathBuf>,

    /// Bundled data size ceiling in bytes
    #[arg(long)]
    bundle_limit: Option<u64>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct UpdateConfigArgs {
    /// Previously cloned APK
    input: PathBuf,

    /// Output APK
    output: PathBuf,

    /// New clone configuration (JSON object)
    #[arg(long)]
    config: PathBuf,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Args)]
struct ManifestArgs {
    /// APK to read
    input: PathBuf,

    /// Also print the embedded clone configuration, if any
    #[arg(long)]
    with_config: bool,
}

impl RunArgs {
    fn table(&self) -> Result<InjectionTable> {
        match &self.table {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                InjectionTable::from_json(&text)
                    .with_context(|| format!("parsing {}", path.display()))
            }
            None => Ok(InjectionTable::standard().clone()),
        }
    }

    fn options(&self, bundle_limit: Option<u64>) -> PipelineOptions {
        let mut options = PipelineOptions {
            scratch_root: self.scratch_dir.clone(),
            ..PipelineOptions::default()
        };
        if let Some(limit) = bundle_limit {
            options.bundle_limit = limit;
        }
        if self.no_verify {
            options.verify = false;
        }
        options
    }
}

fn inject(args: InjectArgs) -> Result<()> {
    let table = args.run.table()?;
    let options = args.run.options(args.bundle_limit);
    let assets = InjectionAssets {
        code_unit: args.dex,
        config: args.config,
        native_lib_dir: args.native_libs,
        bundled_data: args.bundled_data,
    };
    let summary = Pipeline::new(&table, &options)
        .run_files(&args.input, &args.output, &assets)
        .with_context(|| format!("cloning {}", args.input.display()))?;
    report_written(&args.output, &summary)
}

/// A clone that fails its own verification is still a finished run; the
/// mismatch is only logged.
fn report_written(output: &Path, summary: &RunSummary) -> Result<()> {
    info!(
        "wrote {} ({} bytes, verified: {:?})",
        output.display(),
        summary.output_len,
        summary.verified
    );
    if summary.verified == Some(false) {
        warn!("{} was written but does not verify", output.display());
    }
    Ok(())
}

fn update_config(args: UpdateConfigArgs) -> Result<()> {
    let table = args.run.table()?;
    let options = args.run.options(None);
    let summary = Pipeline::new(&table, &options)
        .update_config_files(&args.input, &args.output, &args.config)
        .with_context(|| format!("re-packing {}", args.input.display()))?;
    info!(
        "wrote {} for {} ({} bytes)",
        args.output.display(),
        summary.package,
        summary.output_len
    );
    Ok(())
}

fn manifest(args: ManifestArgs) -> Result<()> {
    let file = File::open(&args.input).with_context(|| format!("opening {}", args.input.display()))?;
    let Some(bytes) = read_entry(file, "AndroidManifest.xml")? else {
        bail!("{} has no AndroidManifest.xml", args.input.display());
    };
    let document = ManifestDocument::decode(&bytes)?;
    println!("{}", document.to_xml_string()?);
    if args.with_config {
        match read_embedded_config(&args.input)? {
            Some(config) => println!("{}", serde_json::to_string_pretty(&config)?),
            None => println!("(no embedded configuration)"),
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Inject(args) => inject(args),
        Commands::UpdateConfig(args) => update_config(args),
        Commands::Manifest(args) => manifest(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unverified_clone_still_succeeds() {
        let summary = RunSummary {
            package: "com.example.app".to_string(),
            verified: Some(false),
            output_len: 4096,
            ..RunSummary::default()
        };
        assert!(report_written(Path::new("clone.apk"), &summary).is_ok());
    }

    #[test]
    fn inject_arguments_parse() {
        let cli = Cli::try_parse_from([
            "apkinject",
            "inject",
            "in.apk",
            "out.apk",
            "--dex",
            "payload.dex",
            "--config",
            "clone.json",
            "--native-libs",
            "libs",
        ])
        .expect("parse");
        assert!(matches!(cli.command, Commands::Inject(args) if args.bundle_limit.is_none()));
    }
}
