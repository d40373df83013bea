use async_trait::async_trait;
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::GuestOsId;
use crate::error::{ProvisionError, Result};
use crate::types::{EsxiVersionsResponse, KickstartRequest};

/// HTTP contract of the kickstart installer service
#[async_trait]
pub trait InstallerService: Send + Sync {
    /// Resolve the guest-OS id for an ISO uploaded to the installer
    async fn guest_os_for_iso(&self, isofilename: &str) -> Result<GuestOsId>;

    /// Register a host so the installer answers its network boot
    async fn register_host(&self, req: &KickstartRequest) -> Result<()>;

    /// Drop the registration once the host is installed
    async fn deregister_host(&self, req: &KickstartRequest) -> Result<()>;
}

/// Map an ISO filename to a guest-OS id using the installer's catalog
pub fn resolve_guest_os(catalog: &HashMap<String, String>, isofilename: &str) -> Result<GuestOsId> {
    match catalog.get(isofilename).map(|version| version.trim()) {
        Some(version) if !version.is_empty() => Ok(GuestOsId::from_esxi_version(version)),
        _ => Err(ProvisionError::config(format!(
            "ISO {} is not uploaded to the installer service",
            isofilename
        ))),
    }
}

pub struct InstallerClient {
    base_url: String,
    client: Client,
}

impl InstallerClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProvisionError::installer(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn check(resp: Response, what: &str) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ProvisionError::installer(format!("{} failed ({}): {}", what, status, body)))
    }
}

#[async_trait]
impl InstallerService for InstallerClient {
    async fn guest_os_for_iso(&self, isofilename: &str) -> Result<GuestOsId> {
        let url = format!("{}/esxi-versions", self.base_url);
        debug!("Fetching ESXi versions from {}", url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProvisionError::installer(format!("failed to list ESXi versions: {}", e)))?;
        let resp = Self::check(resp, "list ESXi versions").await?;

        let versions = resp
            .json::<EsxiVersionsResponse>()
            .await
            .map_err(|e| ProvisionError::installer(format!("failed to parse ESXi versions: {}", e)))?;

        let guest_id = resolve_guest_os(&versions.uploaded_esxi_list, isofilename)?;
        debug!("ISO {} maps to guest id {}", isofilename, guest_id);
        Ok(guest_id)
    }

    async fn register_host(&self, req: &KickstartRequest) -> Result<()> {
        let url = format!("{}/ks", self.base_url);
        debug!("Registering {} ({}) at {}", req.hostname, req.macaddress, url);

        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .map_err(|e| ProvisionError::installer(format!("failed to send registration: {}", e)))?;

        info!("Sent POST request to kickstart config for {}. Response: {}", req.hostname, resp.status());
        Self::check(resp, "registration").await?;
        Ok(())
    }

    async fn deregister_host(&self, req: &KickstartRequest) -> Result<()> {
        let url = format!("{}/ks/{}", self.base_url, req.mac_path_segment());
        debug!("Deregistering {} at {}", req.hostname, url);

        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ProvisionError::installer(format!("failed to send deregistration: {}", e)))?;

        info!("Sent DELETE request to kickstart config for {}. Response: {}", req.hostname, resp.status());
        Self::check(resp, "deregistration").await?;
        Ok(())
    }
}
