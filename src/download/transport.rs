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


//! Network capabilities shared by all operations of a manager

use crate::config::DownloadConfig;
use crate::download::asset::AssetDownloader;
use crate::download::hls::HlsAssetDownloader;
use crate::error::Result;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("offline-core/", env!("CARGO_PKG_VERSION"));

/// HTTP client plus the streaming-asset capability
#[derive(Clone)]
pub struct Transport {
    client: Client,
    assets: Arc<dyn AssetDownloader>,
}

impl Transport {
    pub fn new(client: Client, assets: Arc<dyn AssetDownloader>) -> Self {
        Self { client, assets }
    }

    /// Default transport: one pooled client and HLS packaging
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        let client = build_http_client(config)?;
        let assets = Arc::new(HlsAssetDownloader::new(client.clone(), config.segment_concurrency));
        Ok(Self::new(client, assets))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn asset_downloader(&self) -> Arc<dyn AssetDownloader> {
        Arc::clone(&self.assets)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

/// Build the HTTP client used for every resource request
pub fn build_http_client(config: &DownloadConfig) -> Result<Client> {
    let client = Client::builder()
        .timeout(config.request_timeout())
        .user_agent(USER_AGENT)
        .pool_max_idle_per_host(10) // Connection pooling
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    Ok(client)
}
