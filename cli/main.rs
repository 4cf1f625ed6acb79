use aesdrive::commander::{BatchOptions, BatchProgress};
use aesdrive::config::Config;
use aesdrive::nonce;
use aesdrive::storagefile_ops::{BatchReport, DriveOps, ProgressCallback};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// aesdrive - AES-256-CTR encrypted drives shared between devices
#[derive(Parser)]
#[command(name = "aesdrive")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a drive, its key and this device's nonce sequence
    Init {
        /// Drive directory path
        #[arg(short, long, default_value = "./drive")]
        drive_dir: String,

        /// Drive key file path
        #[arg(short, long, default_value = "./aesdrive.key")]
        key_path: String,

        /// Nonce sequence table path
        #[arg(short, long, default_value = "./sequences.json")]
        sequence_path: String,
    },

    /// Encrypt files into the drive
    Import {
        /// Files to import
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Worker threads per file (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Write files without integrity tags
        #[arg(long)]
        no_integrity: bool,

        /// Rename on name collision instead of skipping
        #[arg(short, long)]
        rename: bool,

        /// Delete each source file after it was imported
        #[arg(long)]
        delete_source: bool,
    },

    /// Decrypt drive files into a directory
    Export {
        /// Drive file names to export
        #[arg(required = true)]
        names: Vec<String>,

        /// Output directory
        #[arg(short, long)]
        out: PathBuf,

        /// Worker threads per file (overrides config)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Rename on name collision instead of skipping
        #[arg(short, long)]
        rename: bool,
    },

    /// List all encrypted files
    List,

    /// Remove an encrypted file
    Remove {
        /// Encrypted filename to remove
        name: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Print this device's auth id for the drive
    AuthId,

    /// Grant another device half of this device's nonce range
    ExportAuth {
        /// Auth id printed by `auth-id` on the other device
        target_auth_id: String,

        /// Auth file to write
        file: PathBuf,
    },

    /// Activate this device from an auth file
    ImportAuth {
        /// Auth file written by `export-auth`
        file: PathBuf,
    },

    /// Revoke this device's nonce sequence
    Revoke {
        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Show drive and sequence status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG environment variable to control log level (e.g., RUST_LOG=info,aesdrive=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "aesdrive starting");

    match cli.command {
        Commands::Init {
            drive_dir,
            key_path,
            sequence_path,
        } => cmd_init(&cli.config, drive_dir, key_path, sequence_path).await,

        Commands::Import {
            files,
            threads,
            no_integrity,
            rename,
            delete_source,
        } => {
            let options = BatchOptions {
                delete_source,
                auto_rename: rename,
            };
            cmd_import(&cli.config, files, threads, no_integrity, options).await
        }

        Commands::Export {
            names,
            out,
            threads,
            rename,
        } => {
            let options = BatchOptions {
                delete_source: false,
                auto_rename: rename,
            };
            cmd_export(&cli.config, names, out, threads, options).await
        }

        Commands::List => cmd_list(&cli.config).await,

        Commands::Remove { name, yes } => cmd_remove(&cli.config, &name, yes).await,

        Commands::AuthId => cmd_auth_id(&cli.config).await,

        Commands::ExportAuth {
            target_auth_id,
            file,
        } => cmd_export_auth(&cli.config, &target_auth_id, file).await,

        Commands::ImportAuth { file } => cmd_import_auth(&cli.config, file).await,

        Commands::Revoke { yes } => cmd_revoke(&cli.config, yes).await,

        Commands::Status => cmd_status(&cli.config).await,
    }
}

fn load_config(config_path: &str, threads: Option<usize>) -> Result<Config> {
    let mut cfg = Config::load_with_env(Some(config_path))?;
    if let Some(threads) = threads {
        cfg.threads = threads;
        cfg.validate()?;
    }
    Ok(cfg)
}

/// Create a styled progress bar for file operations
fn create_progress_bar() -> Result<ProgressBar> {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Progress callback that drives `pb` from worker threads
fn progress_callback(pb: &ProgressBar) -> ProgressCallback {
    let pb = pb.clone();
    Arc::new(move |p: &BatchProgress<'_>| {
        pb.set_length(p.total);
        pb.set_position(p.processed);
        pb.set_message(format!("[{}/{}] {}", p.file_index + 1, p.file_count, p.file));
    })
}

/// Cancels the running transfer on Ctrl-C, which removes the partial target.
/// A second Ctrl-C exits immediately.
fn cancel_on_ctrl_c(ops: Arc<DriveOps>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        eprintln!("\nCancelling, press Ctrl-C again to abort");
        ops.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    })
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N]: ", prompt);
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().eq_ignore_ascii_case("y"))
}

fn print_report(verb: &str, report: &BatchReport) {
    for name in &report.done {
        println!("  {} {}", verb, name);
    }
    for (name, reason) in &report.failed {
        println!("  FAILED {}: {}", name, reason);
    }
}

/// Create the drive, its key and the config file
async fn cmd_init(
    config_path: &str,
    drive_dir: String,
    key_path: String,
    sequence_path: String,
) -> Result<()> {
    println!("Initializing aesdrive...");

    let cfg = Config::new(key_path, drive_dir, sequence_path);
    cfg.validate()?;

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    let ops = DriveOps::create(&cfg).await?;

    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:    {}", config_path);
    println!("Key:       {}", cfg.key_path);
    println!("Drive:     {}", cfg.drive_dir);
    println!("Sequences: {}", cfg.sequence_path);
    println!("Drive id:  {}", ops.drive_id().await);
    println!();
    println!("IMPORTANT: Keep your key file secure and backed up!");
    println!("Without it, your encrypted files cannot be recovered.");

    Ok(())
}

async fn cmd_import(
    config_path: &str,
    files: Vec<PathBuf>,
    threads: Option<usize>,
    no_integrity: bool,
    options: BatchOptions,
) -> Result<()> {
    let mut cfg = load_config(config_path, threads)?;
    if no_integrity {
        cfg.integrity = false;
    }
    let ops = Arc::new(DriveOps::open(&cfg).await?);

    let pb = create_progress_bar()?;
    let watcher = cancel_on_ctrl_c(Arc::clone(&ops));
    let report = ops
        .import_files(files, options, Some(progress_callback(&pb)))
        .await;
    watcher.abort();
    pb.finish_and_clear();
    let report = report?;

    println!("Imported {} file(s)", report.done.len());
    print_report("+", &report);
    if !report.failed.is_empty() {
        anyhow::bail!("{} file(s) failed", report.failed.len());
    }
    Ok(())
}

async fn cmd_export(
    config_path: &str,
    names: Vec<String>,
    out: PathBuf,
    threads: Option<usize>,
    options: BatchOptions,
) -> Result<()> {
    let cfg = load_config(config_path, threads)?;
    let ops = Arc::new(DriveOps::open(&cfg).await?);

    let pb = create_progress_bar()?;
    let watcher = cancel_on_ctrl_c(Arc::clone(&ops));
    let report = ops
        .export_files(names, out.clone(), options, Some(progress_callback(&pb)))
        .await;
    watcher.abort();
    pb.finish_and_clear();
    let report = report?;

    println!("Exported {} file(s) to {}", report.done.len(), out.display());
    print_report("->", &report);
    if !report.failed.is_empty() {
        anyhow::bail!("{} file(s) failed", report.failed.len());
    }
    Ok(())
}

async fn cmd_list(config_path: &str) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;

    let files = ops.list_files().await?;
    if files.is_empty() {
        println!("No encrypted files found");
        return Ok(());
    }

    println!("Encrypted files ({} total):", files.len());
    println!();
    println!("{:<40} {:>12}", "FILENAME", "SIZE (bytes)");
    println!("{}", "-".repeat(53));
    for (name, size) in files {
        println!("{:<40} {:>12}", name, size);
    }
    Ok(())
}

async fn cmd_remove(config_path: &str, name: &str, yes: bool) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;

    if !ops.exists(name).await {
        anyhow::bail!("File '{}' not found in drive", name);
    }
    if !yes && !confirm(&format!("Delete '{}'? This cannot be undone.", name))? {
        println!("Cancelled.");
        return Ok(());
    }

    ops.delete_file(name).await?;
    println!("Deleted '{}'", name);
    Ok(())
}

async fn cmd_auth_id(config_path: &str) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;
    println!("{}", ops.auth_id().await);
    Ok(())
}

async fn cmd_export_auth(config_path: &str, target_auth_id: &str, file: PathBuf) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;

    let auth = ops.export_auth(target_auth_id, file.clone()).await?;
    println!("Authorization written to {}", file.display());
    println!(
        "Granted nonces {:#x}..={:#x}",
        nonce::to_u64(&auth.start_nonce),
        nonce::to_u64(&auth.max_nonce)
    );
    Ok(())
}

async fn cmd_import_auth(config_path: &str, file: PathBuf) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;

    let auth = ops.import_auth(file).await?;
    println!("Device authorized");
    println!(
        "Nonce range {:#x}..={:#x}",
        nonce::to_u64(&auth.start_nonce),
        nonce::to_u64(&auth.max_nonce)
    );
    Ok(())
}

async fn cmd_revoke(config_path: &str, yes: bool) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let ops = DriveOps::open(&cfg).await?;

    if !yes
        && !confirm("Revoke this device? It cannot write until it is authorized again.")?
    {
        println!("Cancelled.");
        return Ok(());
    }
    let auth_id = ops.revoke().await?;
    println!("Device revoked. New auth id: {}", auth_id);
    Ok(())
}

async fn cmd_status(config_path: &str) -> Result<()> {
    let cfg = load_config(config_path, None)?;
    let key_exists = fs::try_exists(&cfg.key_path).await.unwrap_or(false);

    println!("aesdrive Status");
    println!();
    println!("Configuration:");
    println!("  Config file:   {}", config_path);
    println!("  Key file:      {}", cfg.key_path);
    println!("  Drive dir:     {}", cfg.drive_dir);
    println!("  Sequences:     {}", cfg.sequence_path);
    println!("  Threads:       {}", cfg.threads);
    println!(
        "  Integrity:     {}",
        if cfg.use_integrity() {
            format!("on ({} byte chunks)", cfg.chunk_size)
        } else {
            "off".to_string()
        }
    );
    println!();
    println!("Key Status:      {}", if key_exists { "Present" } else { "Missing" });
    if !key_exists {
        return Ok(());
    }

    let ops = DriveOps::open(&cfg).await?;
    let status = ops.status().await?;
    println!();
    println!("Drive:");
    println!("  Drive id:      {}", status.drive_id);
    println!("  Auth id:       {}", status.auth_id);
    match &status.sequence {
        Some(seq) => {
            println!("  Sequence:      {:?}", seq.status);
            if let (Some(next), Some(max)) = (seq.next_nonce, seq.max_nonce) {
                let left = nonce::to_u64(&max).saturating_sub(nonce::to_u64(&next));
                println!("  Nonces left:   {}", left);
            }
        }
        None => println!("  Sequence:      none"),
    }
    println!();
    println!("Storage Statistics:");
    println!("  Total files:   {}", status.files);
    println!(
        "  Total size:    {} bytes ({:.2} MB)",
        status.total_size,
        status.total_size as f64 / 1_048_576.0
    );
    if !status.is_authorized() {
        println!();
        println!(
            "WARNING: device is not authorized, run `{}` on an authorized device",
            "aesdrive export-auth <auth-id> <file>"
        );
    }
    Ok(())
}
