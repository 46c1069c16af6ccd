use batchup::{run, RawConfig, UploadConfig};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "batchup")]
#[command(about = "Validate a submission manifest and upload its files as a tracked batch", long_about = None)]
#[command(version)]
struct Args {
    /// Backend GraphQL endpoint
    #[arg(long)]
    api_url: Option<String>,

    /// API token
    #[arg(long)]
    token: Option<String>,

    /// Submission ID
    #[arg(long)]
    submission: Option<String>,

    /// Upload type: "data file" or "metadata"
    #[arg(long = "type")]
    upload_type: Option<String>,

    /// Data folder, or s3://bucket/prefix for files already in a bucket
    #[arg(long)]
    data: Option<String>,

    /// Manifest file, local path or s3:// URL
    #[arg(long)]
    manifest: Option<String>,

    /// Manifest describing the contents of archive files
    #[arg(long)]
    archive_manifest: Option<String>,

    /// Overwrite files that already exist in the destination
    #[arg(long)]
    overwrite: bool,

    /// Validate files only, do not upload
    #[arg(long)]
    dry_run: bool,

    /// Attempts per file
    #[arg(long)]
    retries: Option<u32>,

    /// YAML configuration file; command line values take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Skip checking archive contents
    #[arg(long)]
    bypass_archive_validation: bool,

    /// What to do with invalid files: "abort" or "skip"
    #[arg(long)]
    invalid_policy: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_raw(self) -> RawConfig {
        RawConfig {
            api_url: self.api_url,
            token: self.token,
            submission: self.submission,
            upload_type: self.upload_type,
            data: self.data,
            manifest: self.manifest,
            archive_manifest: self.archive_manifest,
            overwrite: self.overwrite.then_some(true),
            dry_run: self.dry_run.then_some(true),
            retries: self.retries,
            bypass_archive_validation: self.bypass_archive_validation.then_some(true),
            invalid_policy: self.invalid_policy,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("batchup={}", log_level))
        .init();

    info!("🚀 Batchup v{}", env!("CARGO_PKG_VERSION"));

    let file_config = match &args.config {
        Some(path) => RawConfig::from_yaml_file(path),
        None => Ok(RawConfig::default()),
    };
    let config = file_config
        .map(|file| file.merge(args.into_raw()))
        .and_then(UploadConfig::from_raw);
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("❌ {}", e);
            eprintln!("❌ Error: {}\n{}", e, e.hint());
            std::process::exit(1);
        }
    };

    match run(config).await {
        Ok(summary) => std::process::exit(summary.exit_code()),
        Err(e) => {
            error!("❌ Failed to upload files: {}", e);
            eprintln!("❌ Error: {}\n{}", e, e.hint());
            std::process::exit(1);
        }
    }
}
