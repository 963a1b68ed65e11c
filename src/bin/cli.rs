// OfflineKit - Offline Media Downloads for Mobile Players
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use offline_core::{DownloadConfig, ItemState, PlayableItem, PlayerItemDownloadManager};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "offline-cli")]
#[command(about = "OfflineKit CLI - Desktop testing tool", long_about = None)]
struct Cli {
    /// Directory downloaded items are stored under
    #[arg(short, long, default_value = "./offline")]
    root: PathBuf,

    /// JSON configuration file; its storage root is replaced by --root
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download an item described by a JSON file and wait for it
    Download {
        /// Path to the item JSON
        item: PathBuf,
    },
    /// Print the lifecycle state of an item
    State {
        media_id: String,
    },
    /// Print the stored description of a downloaded item
    Show {
        media_id: String,
    },
    /// Delete a downloaded item
    Remove {
        media_id: String,
    },
    /// List downloaded items
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => DownloadConfig {
            storage_root: cli.root.clone(),
            ..DownloadConfig::load(&path)
                .await
                .with_context(|| format!("loading {}", path.display()))?
        },
        None => DownloadConfig::new(cli.root.clone()),
    };
    let manager = PlayerItemDownloadManager::new(config)?;

    match cli.command {
        Commands::Download { item } => {
            let json = tokio::fs::read_to_string(&item)
                .await
                .with_context(|| format!("reading {}", item.display()))?;
            let item = PlayableItem::from_json(&json)?;
            let media_id = item.id().unwrap_or_default().to_string();

            let Some(observer) = manager.download(&item).await else {
                let state = manager.state(&media_id).await;
                println!("Nothing to do, {} is {}", media_id, state_name(state));
                return Ok(());
            };

            println!("Downloading {} ({})", item.display_title(), media_id);
            observer.set_progress_tracker(Arc::new(|progress: f64| {
                print!("\r  {:5.1}%", progress * 100.0);
                let _ = std::io::stdout().flush();
            }));

            if let Some(error) = observer.wait().await {
                println!();
                bail!("download failed: {}", error.user_message());
            }
            println!("\n✓ Stored under {}", manager.storage().item_directory(&media_id).display());
        }
        Commands::State { media_id } => {
            println!("{}", state_name(manager.state(&media_id).await));
        }
        Commands::Show { media_id } => match manager.downloaded_item(&media_id).await {
            Some(item) => println!("{}", serde_json::to_string_pretty(&item)?),
            None => bail!("{} is not downloaded", media_id),
        },
        Commands::Remove { media_id } => {
            manager.remove(&media_id).await?;
            println!("Removed {}", media_id);
        }
        Commands::List => {
            let ids = manager.downloaded_ids().await;
            if ids.is_empty() {
                println!("No downloaded items");
            }
            for id in ids {
                let title = manager
                    .downloaded_item(&id)
                    .await
                    .map(|item| item.display_title().to_string())
                    .unwrap_or_default();
                println!("{}\t{}", id, title);
            }
        }
    }

    Ok(())
}

fn state_name(state: ItemState) -> &'static str {
    match state {
        ItemState::Online => "online",
        ItemState::Downloading => "downloading",
        ItemState::Local => "local",
    }
}
