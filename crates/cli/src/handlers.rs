//! Command handlers for spmigrate CLI

use crate::wizard::run_init_wizard;
use anyhow::{Context, Result};
use clap::Command;
use clap_complete::{generate, Shell as ClapShell};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use spmigrate_core::scan::run_timestamp;
use spmigrate_core::{
    build_http_client, get_config_path, load_config_from, scan_folder, validate_config, ByteSource,
    ConfigFile, ConflictBehavior, FileSource, GraphTransport, Observer, PoolOptions, ProgressFn,
    SessionStore, TargetOutcome, TargetReport, TokenCache, UploadTarget, Uploader, WorkerPool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Flags of `upload-folder`
#[derive(Debug)]
pub struct FolderOptions {
    pub dir: PathBuf,
    pub dest_root: Option<String>,
    pub workers: Option<usize>,
    pub no_timestamp: bool,
    pub no_replace: bool,
    pub failed_list: PathBuf,
}

/// Configuration file in use: `--config` or the default location
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(get_config_path()?),
    }
}

/// Load the configuration, falling back to the environment when no file exists
pub fn load(explicit: Option<&Path>) -> Result<ConfigFile> {
    let path = config_path(explicit)?;
    load_config_from(&path).with_context(|| {
        format!(
            "Failed to load configuration from {} (run 'spmigrate init' or set MS_* variables)",
            path.display()
        )
    })
}

/// HTTP client, shared token cache and Graph transport wired into an uploader
fn build_uploader(config: &ConfigFile) -> Result<Uploader> {
    let http_client = build_http_client(config)?;
    let tokens = Arc::new(TokenCache::from_config(config, http_client.clone())?);
    let transport = GraphTransport::from_config(config, http_client, tokens)?;
    Ok(Uploader::from_config(config, Arc::new(transport))?)
}

/// Handle init command
pub async fn handle_init(explicit: Option<&Path>) -> Result<()> {
    run_init_wizard(&config_path(explicit)?).await
}

/// Handle config commands
pub async fn handle_config(action: &str, explicit: Option<&Path>) -> Result<()> {
    match action {
        "show" => {
            let config = load(explicit)?;

            println!("Current configuration:");
            println!();
            println!("Graph:");
            println!("  Tenant ID: {}", config.graph.tenant_id);
            println!("  Client ID: {}", config.graph.client_id);
            println!("  Client secret: {}", mask_secret(&config.graph.client_secret));
            match config.addressing() {
                Ok(addressing) => println!("  Drive root: {}", addressing.root_url(&config.graph.base_url)),
                Err(e) => println!("  ⚠️  {}", e),
            }
            println!();
            println!("Upload:");
            println!("  Destination root: {}", config.upload.destination_root);
            println!("  Chunk size: {} MB", config.upload.chunk_size_mb);
            println!("  Workers: {}", config.upload.max_concurrent_uploads);
            println!("  Conflict behavior: {}", config.upload.conflict_behavior.as_str());
            println!("  Timestamp folders: {}", config.upload.timestamp_folders);
            println!("  File attempts: {}", config.upload.file_attempts);
            println!("  State directory: {}", config.state_dir()?.display());

            let advanced = config.advanced();
            println!();
            println!("Advanced:");
            println!("  Timeout: {}s", advanced.timeout);
            println!("  Max retries: {}", advanced.max_retries);
            println!("  Retry delay: {}ms (max {}ms)", advanced.retry_delay, advanced.max_retry_delay);

            Ok(())
        }
        "validate" => {
            println!("Validating configuration...");

            let config = load(explicit)?;
            validate_config(&config)?;
            println!("  ✅ Valid configuration format");

            println!("  Requesting an access token...");
            let tokens = TokenCache::from_config(&config, build_http_client(&config)?)?;
            let credential = tokens.credential().await?;
            println!("  ✅ Credentials accepted (token valid for {}s)", credential.remaining().as_secs());

            Ok(())
        }
        "path" => {
            println!("{}", config_path(explicit)?.display());
            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: show, validate, path");
            Ok(())
        }
    }
}

/// Handle single-file upload
pub async fn handle_upload(
    file: &str,
    destination: &str,
    explicit: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = load(explicit)?;
    validate_config(&config)?;

    let source = FileSource::open(file)
        .await
        .with_context(|| format!("Cannot read {}", file))?;
    let size = source.len();
    let target = UploadTarget::new(source, destination);
    let uploader = build_uploader(&config)?;

    println!("Uploading {} -> {}...", file, destination);
    println!("  Size: {}", format_bytes(size));

    let pb = ProgressBar::new(size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")?
            .progress_chars("#>-"),
    );
    let bar = pb.clone();
    let progress: &ProgressFn<'_> = &move |sent: u64, _total: u64| bar.set_position(sent);

    let result = uploader.upload_with_progress(&target, &cancel, Some(progress)).await;
    pb.finish_and_clear();

    let remote_path = result?;
    println!("  ✅ Upload complete: {}", remote_path);

    Ok(())
}

/// Handle folder migration
pub async fn handle_upload_folder(
    options: FolderOptions,
    explicit: Option<&Path>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut config = load(explicit)?;
    if let Some(root) = options.dest_root {
        config.upload.destination_root = root;
    }
    if let Some(workers) = options.workers {
        config.upload.max_concurrent_uploads = workers;
    }
    if options.no_timestamp {
        config.upload.timestamp_folders = false;
    }
    if options.no_replace {
        config.upload.conflict_behavior = ConflictBehavior::Fail;
    }
    validate_config(&config)?;

    if !options.dir.is_dir() {
        return Err(anyhow::anyhow!("Not a directory: {}", options.dir.display()));
    }

    let uploader = Arc::new(build_uploader(&config)?);
    let timestamp = config.upload.timestamp_folders.then(run_timestamp);

    println!("Migrating {}...", options.dir.display());
    println!(
        "  Destination: {}{}",
        config.upload.destination_root,
        timestamp.as_deref().map(|t| format!("/{}", t)).unwrap_or_default()
    );
    println!("  Workers: {}", config.upload.max_concurrent_uploads);
    println!();

    let (targets, summary) = scan_folder(
        options.dir.clone(),
        config.upload.destination_root.clone(),
        timestamp,
    )
    .into_parts();

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files {msg}")?
            .progress_chars("#>-"),
    );

    // The total is known once the scan is over
    let scan_bar = pb.clone();
    let scan_done = tokio::spawn(async move {
        let summary = summary.await.ok()?;
        scan_bar.set_length(summary.files as u64);
        Some(summary)
    });

    let observer_bar = pb.clone();
    let observer: Observer = Arc::new(move |report: &TargetReport| {
        observer_bar.inc(1);
        match &report.outcome {
            TargetOutcome::Uploaded { .. } => observer_bar.set_message(report.destination.clone()),
            TargetOutcome::Conflict { .. } => {
                observer_bar.println(format!("  ⚠️  exists: {}", report.destination));
            }
            TargetOutcome::Failed { message, cancelled: false } => {
                observer_bar.println(format!("  {} {}: {}", style("❌").red(), report.source, message));
            }
            TargetOutcome::Failed { cancelled: true, .. } => {}
        }
    });

    let pool = WorkerPool::new(uploader, PoolOptions::from_config(&config)).with_observer(observer);
    let stats = pool.run(targets, cancel.clone()).await;
    pb.finish_and_clear();
    info!(
        dir = %options.dir.display(),
        success = stats.success,
        conflicts = stats.conflicts,
        failed = stats.failed,
        "Folder migration finished"
    );

    let scan = scan_done.await.ok().flatten().unwrap_or_default();

    #[derive(Tabled)]
    struct SummaryRow {
        metric: String,
        value: String,
    }

    let rows = vec![
        SummaryRow { metric: "Files found".into(), value: scan.files.to_string() },
        SummaryRow { metric: "Uploaded".into(), value: stats.success.to_string() },
        SummaryRow { metric: "Already existed".into(), value: stats.conflicts.to_string() },
        SummaryRow { metric: "Failed".into(), value: stats.failed.to_string() },
        SummaryRow { metric: "Skipped (empty)".into(), value: scan.skipped_empty.to_string() },
        SummaryRow { metric: "Skipped (unreadable)".into(), value: scan.skipped_unreadable.to_string() },
        SummaryRow { metric: "Bytes uploaded".into(), value: format_bytes(stats.bytes_uploaded) },
    ];
    println!("{}", Table::new(rows));

    if cancel.is_cancelled() {
        println!("  ⚠️  Run interrupted; run the same command again to resume");
    }

    if stats.has_failures() {
        let mut content = stats.failed_items.join("\n");
        content.push('\n');
        std::fs::write(&options.failed_list, content)
            .with_context(|| format!("Failed to write {}", options.failed_list.display()))?;
        println!(
            "  {} Failed files listed in {}",
            style("⚠️ ").yellow(),
            options.failed_list.display()
        );
        return Err(anyhow::anyhow!("{} of {} files failed", stats.failed, stats.total()));
    }

    println!("  {}", style("✅ Migration complete").green().bold());
    Ok(())
}

/// Handle sessions commands
pub async fn handle_sessions(action: &str, file: Option<&str>, explicit: Option<&Path>) -> Result<()> {
    let config = load(explicit)?;

    match action {
        "list" => {
            let store = SessionStore::new(config.state_dir()?);
            let sessions = store.list().await?;

            if sessions.is_empty() {
                println!("  No resumable uploads");
                return Ok(());
            }

            #[derive(Tabled)]
            struct SessionRow {
                source: String,
                destination: String,
                created: String,
                expires: String,
            }

            let rows: Vec<SessionRow> = sessions
                .iter()
                .map(|s| SessionRow {
                    source: s.source.clone(),
                    destination: s.destination.clone(),
                    created: s.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    expires: s
                        .expires_at
                        .map(|e| e.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
            Ok(())
        }
        "abandon" => {
            let file = file.ok_or_else(|| anyhow::anyhow!("Source file required"))?;
            // Records are keyed by canonical path; a deleted file falls back to the given text
            let identity = match FileSource::open(file).await {
                Ok(source) => source.identity().to_string(),
                Err(_) => file.to_string(),
            };

            let uploader = build_uploader(&config)?;
            if uploader.sessions().abandon_remote(&identity).await? {
                println!("  ✅ Session abandoned for {}", identity);
            } else {
                println!("  ⚠️  No session recorded for {}", identity);
            }
            Ok(())
        }
        "clear" => {
            let store = SessionStore::new(config.state_dir()?);
            let removed = store.clear().await?;
            println!("  ✅ Removed {} resume record(s)", removed);
            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: list, abandon, clear");
            Ok(())
        }
    }
}

/// Handle doctor commands
pub async fn handle_doctor(action: &str, explicit: Option<&Path>) -> Result<()> {
    match action {
        "check" => {
            println!("Checking spmigrate installation...");

            println!("  ✅ spmigrate is installed");
            println!("  Version: {}", env!("CARGO_PKG_VERSION"));

            let path = config_path(explicit)?;
            if path.exists() {
                println!("  ✅ Configuration found: {}", path.display());
            } else {
                println!("  ⚠️  Configuration not found (run 'spmigrate init' or set MS_* variables)");
            }

            let config = load(explicit)?;
            validate_config(&config)?;
            println!("  ✅ Configuration valid");

            let store = SessionStore::new(config.state_dir()?);
            let pending = store.list().await?.len();
            println!("  State directory: {}", store.dir().display());
            if pending > 0 {
                println!("  ⚠️  {} upload(s) can be resumed", pending);
            } else {
                println!("  ✅ No interrupted uploads");
            }

            Ok(())
        }
        "auth" => {
            println!("Testing authentication...");

            let config = load(explicit)?;
            let tokens = TokenCache::from_config(&config, build_http_client(&config)?)?;
            let credential = tokens.credential().await?;
            println!("  ✅ Token acquired (valid for {}s)", credential.remaining().as_secs());

            match config.addressing() {
                Ok(addressing) => println!("  Target drive: {}", addressing.root_url(&config.graph.base_url)),
                Err(e) => println!("  ⚠️  {}", e),
            }

            Ok(())
        }
        _ => {
            println!("Unknown action: {}", action);
            println!("Available actions: check, auth");
            Ok(())
        }
    }
}

/// Show the first characters of a secret only
fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return "(not set)".to_string();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}***", visible)
}

/// Format bytes to human-readable size
fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Handle shell completion generation
pub async fn handle_completion(shell: &str, cmd: &mut Command) -> Result<()> {
    use std::io;

    let clap_shell = match shell {
        "bash" => ClapShell::Bash,
        "zsh" => ClapShell::Zsh,
        "fish" => ClapShell::Fish,
        "elvish" => ClapShell::Elvish,
        "powershell" | "pwsh" => ClapShell::PowerShell,
        _ => {
            return Err(anyhow::anyhow!(
                "Unsupported shell: {}\nSupported shells: bash, zsh, fish, elvish, powershell",
                shell
            ));
        }
    };

    generate(clap_shell, cmd, "spmigrate", &mut io::stdout());

    // Instructions go to stderr so the script can be piped
    eprintln!();
    eprintln!("Installation instructions:");
    match shell {
        "bash" => {
            eprintln!("  source <(spmigrate completion bash)");
            eprintln!("  spmigrate completion bash > ~/.local/share/bash-completion/completions/spmigrate");
        }
        "zsh" => {
            eprintln!("  spmigrate completion zsh > ~/.zsh/completion/_spmigrate");
            eprintln!("  fpath=(~/.zsh/completion $fpath)");
            eprintln!("  autoload -U compinit && compinit");
        }
        "fish" => {
            eprintln!("  spmigrate completion fish > ~/.config/fish/completions/spmigrate.fish");
        }
        "elvish" => {
            eprintln!("  spmigrate completion elvish > ~/.elvish/lib/spmigrate.elv");
        }
        "powershell" | "pwsh" => {
            eprintln!("  spmigrate completion powershell | Out-String | Invoke-Expression");
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "(not set)");
        assert_eq!(mask_secret("abcdefgh"), "abcd***");
        assert_eq!(mask_secret("ab"), "ab***");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }
}
