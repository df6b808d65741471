//! FAIROps Publish CLI
//!
//! Entry point for the `fairops` command-line tool.

use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use fairops_publish::config::{ConfigError, ZENODO_SANDBOX_ENV};
use fairops_publish::rocrate::Author;
use fairops_publish::{
    build_client, ArtifactExporter, Backend, CancelToken, Credentials, DockerCli, ExitCode, ImageRef,
    PublishConfig, PublishError, PublishFailure, PublishOrchestrator, PublishOutcome, PublishRequest,
    RepositoryClient, RepositoryRecord,
};

#[derive(Parser)]
#[command(name = "fairops")]
#[command(about = "Archive container images in research data repositories", version)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Path to config file (default: ~/.config/fairops/publish.toml)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export an image, describe it, upload it and publish the record
    Publish(PublishArgs),

    /// Export an image to a tar archive without publishing
    Package {
        /// Image repository (e.g. ghcr.io/lab/model)
        repository: String,

        /// Image tag
        tag: String,

        /// Output directory
        output: PathBuf,

        /// Pull the image before exporting
        #[arg(long)]
        pull: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Load an exported archive into the local image store
    Load {
        /// Archive produced by `package` or `publish`
        archive: PathBuf,
    },

    /// Show the state of a repository record
    Status {
        #[command(flatten)]
        target: TargetArgs,

        /// Record identifier
        record_id: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Publish an existing draft whose files are already uploaded
    Finalize {
        #[command(flatten)]
        target: TargetArgs,

        /// Record identifier
        record_id: String,

        /// Local archive the stored file must match
        #[arg(long, short = 'a')]
        archive: PathBuf,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Repository backend (zenodo, figshare)
    #[arg(long, short = 't')]
    target: Backend,

    /// Use the Zenodo sandbox
    #[arg(long)]
    sandbox: bool,
}

#[derive(Args)]
struct PublishArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Image repository (e.g. ghcr.io/lab/model)
    #[arg(long)]
    repository: String,

    /// Image tag
    #[arg(long, default_value = "latest")]
    tag: String,

    /// Directory for the archive and publish journal
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,

    /// Record title
    #[arg(long)]
    title: Option<String>,

    /// Author as "Name" or "Name,ORCID" (repeatable)
    #[arg(long = "author")]
    authors: Vec<String>,

    /// SPDX license identifier (e.g. CC-BY-4.0)
    #[arg(long)]
    license: Option<String>,

    /// Record description
    #[arg(long)]
    description: Option<String>,

    /// URI of an upstream pipeline run (repeatable)
    #[arg(long)]
    provenance: Vec<String>,

    /// Pull the image before exporting
    #[arg(long)]
    pull: bool,

    /// Upload chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Concurrent chunk uploads (backends that support it)
    #[arg(long)]
    parallelism: Option<usize>,

    /// Output in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Publish(args) => run_publish(cli.config.as_deref(), args),
        Commands::Package {
            repository,
            tag,
            output,
            pull,
            json,
        } => run_package(&repository, &tag, &output, pull, json),
        Commands::Load { archive } => run_load(&archive),
        Commands::Status {
            target,
            record_id,
            json,
        } => run_status(cli.config.as_deref(), &target, &record_id, json),
        Commands::Finalize {
            target,
            record_id,
            archive,
            json,
        } => run_finalize(cli.config.as_deref(), &target, &record_id, &archive, json),
    };
    process::exit(code.as_i32());
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn sandbox_from_env() -> bool {
    std::env::var(ZENODO_SANDBOX_ENV)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Load layered config; an explicit `--config` must exist.
fn load_config(path: Option<&Path>, overrides: Value) -> Result<PublishConfig, ConfigError> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: "file not found".to_string(),
            });
        }
    }
    let file = path.map(Path::to_path_buf).or_else(PublishConfig::user_config_path);
    let (config, sources) = PublishConfig::load(file.as_deref(), Some(overrides))?;
    for source in &sources {
        debug!(origin = ?source.origin, path = ?source.path, "config layer");
    }
    Ok(config)
}

fn target_overrides(target: &TargetArgs) -> Value {
    if target.sandbox || sandbox_from_env() {
        json!({ "zenodo": { "sandbox": true } })
    } else {
        json!({})
    }
}

fn connect(config: &PublishConfig, backend: Backend) -> Result<Arc<dyn RepositoryClient>, PublishError> {
    let credentials = Credentials::from_env();
    let client = build_client(backend, config, &credentials)?;
    Ok(Arc::from(client))
}

fn run_publish(config_path: Option<&Path>, args: PublishArgs) -> ExitCode {
    let mut overrides = target_overrides(&args.target);
    if let Some(chunk_size) = args.chunk_size {
        overrides["upload"]["chunk_size_bytes"] = json!(chunk_size);
    }
    if let Some(parallelism) = args.parallelism {
        overrides["upload"]["parallelism"] = json!(parallelism);
    }
    if let Some(output) = &args.output {
        overrides["output_dir"] = json!(output);
    }

    let config = match load_config(config_path, overrides) {
        Ok(c) => c,
        Err(e) => return report_error(&PublishError::Config(e), args.json),
    };
    let client = match connect(&config, args.target.target) {
        Ok(c) => c,
        Err(e) => return report_error(&e, args.json),
    };

    let image = ImageRef::new(args.repository, args.tag);
    let mut request = PublishRequest::new(image, config.output_dir.clone()).title(args.title.unwrap_or_default());
    for author in &args.authors {
        request = request.author(Author::parse(author));
    }
    if let Some(license) = args.license {
        request = request.license(license);
    }
    if let Some(description) = args.description {
        request = request.description(description);
    }
    for uri in args.provenance {
        request = request.provenance(uri);
    }

    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_signal_handler() {
        eprintln!("Warning: failed to install signal handler: {}", e);
    }

    let exporter = ArtifactExporter::new(Arc::new(DockerCli::new())).with_pull(args.pull);
    let orchestrator = PublishOrchestrator::new(exporter, client)
        .with_upload_config(config.upload.clone())
        .with_cancel(cancel);

    match orchestrator.publish(&request) {
        Ok(outcome) => {
            print_outcome(&outcome, args.json);
            ExitCode::Success
        }
        Err(failure) => report_failure(&failure, args.json),
    }
}

fn run_package(repository: &str, tag: &str, output: &Path, pull: bool, json: bool) -> ExitCode {
    let image = ImageRef::new(repository, tag);
    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_signal_handler() {
        eprintln!("Warning: failed to install signal handler: {}", e);
    }
    let exporter = ArtifactExporter::new(Arc::new(DockerCli::new()))
        .with_pull(pull)
        .with_cancel(cancel);

    match exporter.export(&image, output) {
        Ok(artifact) => {
            if json {
                print_json(&json!({
                    "image": artifact.image.to_string(),
                    "digest": artifact.digest,
                    "path": artifact.path,
                    "size": artifact.size,
                    "sha256": artifact.checksums.sha256.hex,
                    "md5": artifact.checksums.md5.hex,
                }));
            } else {
                println!("{}", artifact.path.display());
                println!("  size:   {} bytes", artifact.size);
                println!("  {}", artifact.checksums.sha256);
                println!("  {}", artifact.checksums.md5);
            }
            ExitCode::Success
        }
        Err(e) => report_error(&PublishError::Export(e), json),
    }
}

fn run_load(archive: &Path) -> ExitCode {
    let exporter = ArtifactExporter::new(Arc::new(DockerCli::new()));
    match exporter.load(archive) {
        Ok(loaded) => {
            for reference in loaded {
                println!("Loaded {}", reference);
            }
            ExitCode::Success
        }
        Err(e) => report_error(&PublishError::Export(e), false),
    }
}

fn run_status(config_path: Option<&Path>, target: &TargetArgs, record_id: &str, json: bool) -> ExitCode {
    let config = match load_config(config_path, target_overrides(target)) {
        Ok(c) => c,
        Err(e) => return report_error(&PublishError::Config(e), json),
    };
    let client = match connect(&config, target.target) {
        Ok(c) => c,
        Err(e) => return report_error(&e, json),
    };
    match client.fetch_record(record_id) {
        Ok(record) => {
            print_record(&record, json);
            ExitCode::Success
        }
        Err(e) => report_error(&e.into(), json),
    }
}

fn run_finalize(
    config_path: Option<&Path>,
    target: &TargetArgs,
    record_id: &str,
    archive: &Path,
    json: bool,
) -> ExitCode {
    let config = match load_config(config_path, target_overrides(target)) {
        Ok(c) => c,
        Err(e) => return report_error(&PublishError::Config(e), json),
    };
    let client = match connect(&config, target.target) {
        Ok(c) => c,
        Err(e) => return report_error(&e, json),
    };
    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_signal_handler() {
        eprintln!("Warning: failed to install signal handler: {}", e);
    }

    let exporter = ArtifactExporter::new(Arc::new(DockerCli::new()));
    let orchestrator = PublishOrchestrator::new(exporter, client).with_cancel(cancel);
    match orchestrator.finalize_only(record_id, archive) {
        Ok(record) => {
            print_record(&record, json);
            ExitCode::Success
        }
        Err(failure) => report_failure(&failure, json),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Error serializing output: {}", e),
    }
}

fn print_record(record: &RepositoryRecord, json: bool) {
    if json {
        print_json(&json!(record));
        return;
    }
    println!("{} record {}: {}", record.backend, record.id, record.state);
    if let Some(doi) = &record.doi {
        println!("  DOI: {}", doi);
    }
    if let Some(url) = &record.url {
        println!("  URL: {}", url);
    }
}

fn print_outcome(outcome: &PublishOutcome, json: bool) {
    if json {
        print_json(&json!({
            "status": "published",
            "record": outcome.record,
            "archive": {
                "path": outcome.artifact.path,
                "size": outcome.artifact.size,
                "sha256": outcome.artifact.checksums.sha256.hex,
                "md5": outcome.artifact.checksums.md5.hex,
            },
            "resumed": outcome.resumed,
            "bytes_sent": outcome.upload.as_ref().map(|u| u.bytes_sent),
            "transitions": outcome.transitions,
        }));
        return;
    }
    println!("Published {} as {} record {}", outcome.artifact.image, outcome.record.backend, outcome.record.id);
    if let Some(doi) = &outcome.record.doi {
        println!("  DOI: {}", doi);
    }
    if let Some(url) = &outcome.record.url {
        println!("  URL: {}", url);
    }
    println!("  Archive: {} ({} bytes)", outcome.artifact.path.display(), outcome.artifact.size);
    println!("  {}", outcome.artifact.checksums.sha256);
    if outcome.resumed {
        println!("  Resumed from an earlier attempt");
    }
}

fn report_error(error: &PublishError, json: bool) -> ExitCode {
    let kind = error.kind();
    if json {
        print_json(&json!({
            "status": "failed",
            "kind": kind,
            "exit_code": kind.exit_code().as_i32(),
            "error": error.to_string(),
        }));
    } else {
        eprintln!("Error: {}: {}", kind.description(), error);
    }
    kind.exit_code()
}

fn report_failure(failure: &PublishFailure, json: bool) -> ExitCode {
    let kind = failure.kind();
    if json {
        print_json(&json!({
            "status": "failed",
            "kind": kind,
            "exit_code": kind.exit_code().as_i32(),
            "error": failure.error.to_string(),
            "failed_step": failure.failed_step,
            "furthest_completed": failure.furthest_completed,
            "record_id": failure.record_id,
            "resume_offset": failure.resume_offset,
        }));
    } else {
        eprintln!("Error: {}: {}", kind.description(), failure.error);
        eprintln!("  Failed step: {}", failure.failed_step);
        if let Some(step) = failure.furthest_completed {
            eprintln!("  Completed through: {}", step);
        }
        if let Some(id) = &failure.record_id {
            eprintln!("  Draft record: {}", id);
        }
        if let Some(offset) = failure.resume_offset {
            eprintln!("  Bytes acknowledged: {}", offset);
        }
        if failure.record_id.is_some() {
            eprintln!("  Re-run the same command to resume.");
        }
    }
    kind.exit_code()
}
