//! Interactive setup wizard for spmigrate configuration

use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password, Select};
use indicatif::{ProgressBar, ProgressStyle};
use spmigrate_core::{save_config_to, ConfigFile, GraphConfig, UploadConfig};
use std::path::Path;

const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";
const DEFAULT_BASE_URL: &str = "https://graph.microsoft.com/v1.0";
const DEFAULT_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Run the interactive setup wizard, writing the result to `path`
pub async fn run_init_wizard(path: &Path) -> Result<()> {
    println!("🚀 Welcome to spmigrate setup!\n");

    println!("This wizard will guide you through the configuration process.");
    println!("You will need an Entra ID app registration with:");
    println!("  1. Its Tenant ID and Client ID");
    println!("  2. A client secret");
    println!("  3. The Sites.ReadWrite.All (or Files.ReadWrite.All) application permission\n");

    let tenant_id = prompt_id("Tenant ID (GUID or domain)", true)?;
    let client_id = prompt_id("Client ID", false)?;
    let client_secret = prompt_secret()?;
    let (site_id, drive_id) = prompt_target()?;
    let destination_root = prompt_destination_root()?;
    let chunk_size_mb = prompt_chunk_size()?;
    let max_concurrent_uploads = prompt_workers()?;

    println!("\n📋 Configuration summary:");
    println!("  Tenant ID: {}", tenant_id);
    println!("  Client ID: {}", client_id);
    match (&site_id, &drive_id) {
        (Some(site), _) => println!("  Site: {}", site),
        (_, Some(drive)) => println!("  Drive: {}", drive),
        _ => {}
    }
    println!("  Destination root: {}", destination_root);
    println!("  Chunk size: {} MB", chunk_size_mb);
    println!("  Workers: {}", max_concurrent_uploads);

    let confirm = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Save this configuration?")
        .default(false)
        .interact()?;

    if !confirm {
        println!("❌ Configuration cancelled");
        return Ok(());
    }

    let config = ConfigFile {
        graph: GraphConfig {
            tenant_id,
            client_id,
            client_secret,
            site_id,
            drive_id,
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            scope: DEFAULT_SCOPE.to_string(),
        },
        upload: UploadConfig {
            destination_root,
            chunk_size_mb,
            max_concurrent_uploads,
            ..UploadConfig::default()
        },
        advanced: None,
        logging: None,
    };

    let pb = ProgressBar::new(1);
    pb.set_style(
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] {msg}")?,
    );
    pb.set_message("Saving configuration...");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    save_config_to(&config, path)?;

    pb.inc(1);
    pb.finish_with_message("✅ Configuration saved!");

    println!("\n🎉 Setup complete!");
    println!("\nConfiguration saved to: {}", path.display());
    println!("\nYou can now use spmigrate:");
    println!("  $ spmigrate config validate");
    println!("  $ spmigrate upload report.pdf Documents/report.pdf");
    println!("  $ spmigrate upload-folder ./archive");

    Ok(())
}

fn is_guid(input: &str) -> bool {
    let groups: Vec<&str> = input.split('-').collect();
    groups.len() == 5
        && groups
            .iter()
            .zip([8, 4, 4, 4, 12])
            .all(|(g, len)| g.len() == len && g.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Tenants may also be addressed by a verified domain
fn prompt_id(label: &str, allow_domain: bool) -> Result<String> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt(label)
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.is_empty() {
                Err("Value cannot be empty")
            } else if !is_guid(input) && !(allow_domain && input.contains('.')) {
                Err("Expected a GUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get {}: {}", label, e))
}

fn prompt_secret() -> Result<String> {
    Password::with_theme(&ColorfulTheme::default())
        .with_prompt("Client secret")
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.is_empty() {
                Err("Client secret cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get client secret: {}", e))
}

/// Site ID or drive ID, exactly one of them
fn prompt_target() -> Result<(Option<String>, Option<String>)> {
    let targets = vec![
        "SharePoint site (default document library)",
        "Drive ID (OneDrive or a specific library)",
    ];

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Upload target")
        .items(&targets)
        .default(0)
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to select upload target: {}", e))?;

    let (label, example) = if selection == 0 {
        ("Site ID", "contoso.sharepoint.com,<site-guid>,<web-guid>")
    } else {
        ("Drive ID", "b!...")
    };
    println!("  Format: {}", example);

    let value: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt(label)
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Value cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get {}: {}", label, e))?;

    let value = value.trim().to_string();
    Ok(if selection == 0 {
        (Some(value), None)
    } else {
        (None, Some(value))
    })
}

fn prompt_destination_root() -> Result<String> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Destination root")
        .default(UploadConfig::default().destination_root)
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get destination root: {}", e))
}

fn prompt_chunk_size() -> Result<u64> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Chunk size in MB (multiple of 5, max 60)")
        .default(5u64)
        .validate_with(|input: &u64| -> Result<(), &str> {
            if *input == 0 || input % 5 != 0 {
                Err("Chunk size must be a multiple of 5")
            } else if *input > 60 {
                Err("Chunk size cannot exceed 60 MB")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get chunk size: {}", e))
}

fn prompt_workers() -> Result<usize> {
    Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Concurrent uploads")
        .default(5usize)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if *input == 0 {
                Err("At least one worker is required")
            } else if *input > 32 {
                Err("More than 32 workers only triggers throttling")
            } else {
                Ok(())
            }
        })
        .interact()
        .map_err(|e| anyhow::anyhow!("Failed to get worker count: {}", e))
}
