// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! HTTP client for the device's firmware REST endpoints.

use std::io::Read;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Default timeout for REST calls. Bank erase runs tens of seconds, so the
/// upload POST gets its own, longer budget.
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const UPLOAD_TIMEOUT_SECS: u64 = 300;

/// Upload metadata travels in custom headers next to the raw body.
pub const HEADER_SIZE: &str = "X-Firmware-Size";
pub const HEADER_CRC32: &str = "X-Firmware-CRC32";
pub const HEADER_VERSION: &str = "X-Firmware-Version";

/// Mirror of the device's per-bank status block.
#[derive(Debug, Deserialize)]
pub struct BankInfo {
    pub bank: String,
    pub valid: bool,
    pub size: u32,
    pub crc32: u32,
    pub version: String,
    pub boot_count: u8,
}

/// Mirror of the device's in-RAM update status.
#[derive(Debug, Deserialize)]
pub struct UpdateInfo {
    pub state: String,
    pub bytes_received: u32,
    pub total_bytes: u32,
    pub progress_percent: u32,
    pub target_bank: Option<String>,
    pub error_message: String,
}

/// Mirror of the `firmware_status` response.
#[derive(Debug, Deserialize)]
pub struct FirmwareStatus {
    pub update: UpdateInfo,
    pub active_bank: Option<String>,
    pub bank_a: BankInfo,
    pub bank_b: BankInfo,
    pub rollback_occurred: bool,
    pub rollback_count: u8,
}

/// REST client bound to one device.
pub struct Client {
    base_url: String,
    agent: ureq::Agent,
}

impl Client {
    pub fn new(base_url: &str) -> Result<Self> {
        if !base_url.starts_with("http://") {
            bail!("device URL must start with http:// (got {base_url})");
        }
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET /rest/firmware_status
    pub fn firmware_status(&self) -> Result<FirmwareStatus> {
        let status: FirmwareStatus = self
            .agent
            .get(&self.url("/rest/firmware_status"))
            .call()
            .context("failed to fetch firmware status")?
            .into_json()
            .context("failed to decode firmware status")?;
        Ok(status)
    }

    /// POST /upload with the image body and metadata headers.
    pub fn upload(
        &self,
        body: impl Read + Send + 'static,
        size: u32,
        crc32: u32,
        version: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .agent
            .post(&self.url("/upload"))
            .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
            .set("Content-Type", "application/octet-stream")
            .set("Content-Length", &size.to_string())
            .set(HEADER_SIZE, &size.to_string())
            .set(HEADER_CRC32, &format!("{crc32:#010x}"));
        if let Some(version) = version {
            request = request.set(HEADER_VERSION, version);
        }

        request
            .send(body)
            .context("firmware upload request failed")?;
        Ok(())
    }

    /// GET /rest/firmware_download?url=...&crc32=...&version=...
    pub fn download(&self, image_url: &str, crc32: u32, version: Option<&str>) -> Result<()> {
        let mut request = self
            .agent
            .get(&self.url("/rest/firmware_download"))
            .query("url", image_url)
            .query("crc32", &format!("{crc32:#010x}"));
        if let Some(version) = version {
            request = request.query("version", version);
        }
        request.call().context("download request failed")?;
        Ok(())
    }

    /// POST /rest/firmware_activate. The device reboots on success, which
    /// usually surfaces as a dropped connection; that is treated as success.
    pub fn activate(&self) -> Result<()> {
        self.post_allowing_reboot("/rest/firmware_activate")
    }

    /// POST /rest/firmware_rollback.
    pub fn rollback(&self) -> Result<()> {
        self.post_allowing_reboot("/rest/firmware_rollback")
    }

    /// POST /rest/firmware_cancel.
    pub fn cancel(&self) -> Result<()> {
        self.agent
            .post(&self.url("/rest/firmware_cancel"))
            .call()
            .context("cancel request failed")?;
        Ok(())
    }

    fn post_allowing_reboot(&self, path: &str) -> Result<()> {
        match self.agent.post(&self.url(path)).call() {
            Ok(_) => Ok(()),
            // A transport error here usually means the watchdog reset won the
            // race against the HTTP response.
            Err(ureq::Error::Transport(_)) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("request to {path} failed")),
        }
    }
}
