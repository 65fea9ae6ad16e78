use anyhow::Result;
use clap::{CommandFactory, Parser};
use color_eyre::config::HookBuilder;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

mod handlers;
mod logging;
mod wizard;

/// spmigrate - resumable document migration to SharePoint and OneDrive
#[derive(Parser, Debug)]
#[command(name = "spmigrate")]
#[command(version)]
#[command(about = "Resumable chunked uploads of local documents to SharePoint / OneDrive", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/spmigrate/config.toml)
    #[arg(long, global = true, env = "SPMIGRATE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase console log verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Initial setup (interactive wizard)
    Init,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Upload a single file
    Upload {
        /// Local file to upload
        file: String,
        /// Destination path below the drive root, e.g. Documents/Migration/report.pdf
        destination: String,
    },

    /// Upload every non-empty file below a folder
    UploadFolder {
        /// Local folder to migrate
        dir: PathBuf,
        /// Destination root (default: upload.destination_root)
        #[arg(long)]
        dest_root: Option<String>,
        /// Concurrent uploads (default: upload.max_concurrent_uploads)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Do not insert a timestamp folder below the destination root
        #[arg(long)]
        no_timestamp: bool,
        /// Refuse to overwrite existing remote files
        #[arg(long)]
        no_replace: bool,
        /// Where to write the identifiers of failed files
        #[arg(long, default_value = "failed.txt")]
        failed_list: PathBuf,
    },

    /// Persisted resume records
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Diagnostics
    Doctor {
        #[command(subcommand)]
        action: DoctorAction,
    },

    /// Shell completion
    Completion {
        /// Shell type (bash, zsh, fish, elvish, powershell)
        shell: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the current configuration (secrets masked)
    Show,
    /// Validate the configuration and the credentials
    Validate,
    /// Print the configuration file path
    Path,
}

#[derive(clap::Subcommand, Debug)]
enum SessionAction {
    /// List resumable uploads
    List,
    /// Abandon the upload session of a file
    Abandon {
        /// Local file whose session should be dropped
        file: String,
    },
    /// Remove every local resume record
    Clear,
}

#[derive(clap::Subcommand, Debug)]
enum DoctorAction {
    /// Check installation and configuration
    Check,
    /// Test the token exchange
    Auth,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup error handling
    if let Err(e) = HookBuilder::default().install() {
        eprintln!("Warning: Failed to install error handler: {}", e);
    }

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    // Logging settings come from the config when one can be loaded
    let logging_config = handlers::load(config_path)
        .map(|config| config.logging())
        .unwrap_or_default();
    let _log_guard = logging::init_logging(&logging_config, cli.verbose)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, waiting for in-flight chunks (resume records are kept)...");
            signal_cancel.cancel();
        }
    });

    match cli.command {
        Commands::Init => handlers::handle_init(config_path).await,
        Commands::Config { action } => {
            let action_str = match action {
                ConfigAction::Show => "show",
                ConfigAction::Validate => "validate",
                ConfigAction::Path => "path",
            };
            handlers::handle_config(action_str, config_path).await
        }
        Commands::Upload { file, destination } => {
            handlers::handle_upload(&file, &destination, config_path, cancel).await
        }
        Commands::UploadFolder {
            dir,
            dest_root,
            workers,
            no_timestamp,
            no_replace,
            failed_list,
        } => {
            let options = handlers::FolderOptions {
                dir,
                dest_root,
                workers,
                no_timestamp,
                no_replace,
                failed_list,
            };
            handlers::handle_upload_folder(options, config_path, cancel).await
        }
        Commands::Sessions { action } => {
            let (action_str, file) = match action {
                SessionAction::List => ("list", None),
                SessionAction::Abandon { file } => ("abandon", Some(file)),
                SessionAction::Clear => ("clear", None),
            };
            handlers::handle_sessions(action_str, file.as_deref(), config_path).await
        }
        Commands::Doctor { action } => {
            let action_str = match action {
                DoctorAction::Check => "check",
                DoctorAction::Auth => "auth",
            };
            handlers::handle_doctor(action_str, config_path).await
        }
        Commands::Completion { shell } => {
            handlers::handle_completion(&shell, &mut Cli::command()).await
        }
    }
}
