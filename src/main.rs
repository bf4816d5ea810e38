//! Streaming database backup/restore tool
//!
//! Moves mysqldump output between a live server and S3-compatible object
//! storage as a gzip stream, without ever holding the full dump in memory.

// dbshuttle/src/main.rs
mod config;
mod errors;
mod mysql;
mod pipeline;
mod progress;
mod s3;

use anyhow::{Context, Result};
use config::AppConfig;
use progress::{ProgressAggregator, ProgressSample};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // Expects config.json next to the executable, or in the project root
    // when running with `cargo run`.
    let config_path = PathBuf::from("config.json");
    let app_config = AppConfig::load_from_json(&config_path).context(format!(
        "Failed to load application configuration from {}",
        config_path.display()
    ))?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    let spaces_is_configured = app_config.spaces_config.is_some();

    match choice.as_str() {
        "1" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let backup_config = config::load_backup_config_from_json(
                &app_config.raw_json_config,
                spaces_is_configured,
            )
            .context("Failed to load backup configuration from JSON")?;

            let (handle, rx) = ProgressAggregator::channel(app_config.progress_interval);
            let printer = tokio::spawn(print_progress(rx));
            let outcome = pipeline::run_backup(&app_config, &backup_config, &handle)
                .await
                .context("Backup process failed")?;
            drop(handle);
            let _ = printer.await;
            println!(
                "📦 Wrote {} bytes to {}",
                outcome.bytes_written, outcome.location
            );
        }
        "2" | "restore" => {
            println!("🔄 Starting Restore Process...");
            let restore_config = config::load_restore_config_from_json(
                &app_config.raw_json_config,
                spaces_is_configured,
            )
            .context("Failed to load restore configuration from JSON")?;
            println!(
                "Restore target: {}, Archive: {}",
                restore_config.target_database, restore_config.archive_source
            );

            let (handle, rx) = ProgressAggregator::channel(app_config.progress_interval);
            let printer = tokio::spawn(print_progress(rx));
            pipeline::run_restore(&app_config, &restore_config, &handle)
                .await
                .context("Restore process failed")?;
            drop(handle);
            let _ = printer.await;
        }
        "3" | "list" => {
            let spaces = app_config
                .spaces_config
                .as_ref()
                .context("s3_storage must be configured in config.json to list backups")?;
            let client = s3::SpacesClient::connect(spaces).await;
            let backups = client.list(".sql.gz").await?;
            if backups.is_empty() {
                println!("No backups found.");
            }
            for descriptor in &backups {
                println!(
                    "{}  {:>12} bytes  {:<45} {}",
                    descriptor.last_modified.format("%Y-%m-%d %H:%M:%S"),
                    descriptor.size_bytes,
                    descriptor.display_name,
                    descriptor.key
                );
            }
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup), '2' (restore), or '3' (list).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::Receiver<ProgressSample>) {
    while let Some(sample) = rx.recv().await {
        match sample.percentage {
            Some(pct) => println!("   {:>5.1}% ({} bytes)", pct, sample.loaded_bytes),
            None => println!("   {} bytes…", sample.loaded_bytes),
        }
    }
}

/// Prompts user to select an operation
///
/// Returns the user's choice as String
fn prompt_choice() -> Result<String> {
    use std::io::{Write, stdin, stdout};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. List Backups (or type 'list')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin()
        .read_line(&mut input)
        .context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
