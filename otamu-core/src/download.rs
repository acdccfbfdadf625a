// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! HTTP URL firmware pull.
//!
//! Downloads an image over plain HTTP and streams it straight into the
//! firmware manager. There is no image buffering; the TCP window is the only
//! backpressure. Name resolution and the TCP connection come from the
//! platform through the [`Connector`] seam; the connection itself is any
//! blocking [`embedded_io`] stream.

use core::fmt::Write as _;

use embedded_io::{Read, Write};
use heapless::String;
use log::{info, warn};
use serde::Serialize;

use crate::flash::{FlashDevice, Watchdog};
use crate::manager::{FirmwareManager, UpdateError};

/// Fixed capacities for URL components and the header scan buffer.
pub const MAX_URL_LENGTH: usize = 256;
pub const MAX_HOST_LENGTH: usize = 128;
pub const MAX_PATH_LENGTH: usize = 128;
const HEADER_BUFFER_SIZE: usize = 1024;
const BODY_CHUNK_SIZE: usize = 512;

/// Download state machine states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DownloadState {
    Idle,
    ParsingUrl,
    ResolvingDns,
    Connecting,
    SendingRequest,
    ReceivingHeaders,
    ReceivingBody,
    Validating,
    Complete,
    Error,
}

/// Download failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadError {
    /// Not an `http://` URL, or a component does not fit its buffer.
    InvalidUrl,
    /// DNS resolution failed.
    DnsFailed,
    /// TCP connect failed.
    ConnectFailed,
    /// Read/write on the connection failed or it closed early.
    Io,
    /// Server answered with a non-2xx status.
    HttpStatus(u16),
    /// Response carried no Content-Length.
    MissingContentLength,
    /// Header block exceeded the scan buffer.
    HeadersTooLarge,
    /// The firmware manager rejected the stream.
    Update(UpdateError),
}

impl From<UpdateError> for DownloadError {
    fn from(e: UpdateError) -> Self {
        DownloadError::Update(e)
    }
}

impl DownloadError {
    pub const fn as_str(self) -> &'static str {
        match self {
            DownloadError::InvalidUrl => "invalid URL format",
            DownloadError::DnsFailed => "DNS lookup failed",
            DownloadError::ConnectFailed => "failed to connect to server",
            DownloadError::Io => "connection error",
            DownloadError::HttpStatus(_) => "unexpected HTTP status",
            DownloadError::MissingContentLength => "missing Content-Length",
            DownloadError::HeadersTooLarge => "HTTP headers too large",
            DownloadError::Update(_) => "firmware update rejected",
        }
    }
}

impl core::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DownloadError::HttpStatus(code) => write!(f, "unexpected HTTP status {code}"),
            DownloadError::Update(e) => write!(f, "firmware update rejected: {e}"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Components of a parsed `http://host[:port]/path` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedUrl {
    pub host: String<MAX_HOST_LENGTH>,
    pub port: u16,
    pub path: String<MAX_PATH_LENGTH>,
}

/// Parse an HTTP URL. Only `http://` is supported; the port defaults to 80
/// and the path to `/`.
pub fn parse_url(url: &str) -> Result<ParsedUrl, DownloadError> {
    let rest = url.strip_prefix("http://").ok_or(DownloadError::InvalidUrl)?;
    if rest.is_empty() {
        return Err(DownloadError::InvalidUrl);
    }

    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };

    let (host, port) = match authority.find(':') {
        Some(i) => {
            let port = authority[i + 1..]
                .parse::<u16>()
                .map_err(|_| DownloadError::InvalidUrl)?;
            (&authority[..i], port)
        }
        None => (authority, 80),
    };

    if host.is_empty() {
        return Err(DownloadError::InvalidUrl);
    }

    let host = String::try_from(host).map_err(|_| DownloadError::InvalidUrl)?;
    let path = String::try_from(path).map_err(|_| DownloadError::InvalidUrl)?;

    Ok(ParsedUrl { host, port, path })
}

/// Platform seam for name resolution and TCP connection establishment.
pub trait Connector {
    /// Resolved peer address (opaque to the downloader).
    type Addr: Copy;
    /// Established connection.
    type Connection: Read + Write;

    fn resolve(&mut self, host: &str) -> Result<Self::Addr, DownloadError>;
    fn connect(&mut self, addr: Self::Addr, port: u16) -> Result<Self::Connection, DownloadError>;
}

/// Status snapshot for the download REST endpoint.
#[derive(Clone, Debug, Serialize)]
pub struct DownloadStatus {
    pub state: DownloadState,
    pub bytes_downloaded: u32,
    pub total_bytes: u32,
    pub progress_percent: u32,
    pub url: String<MAX_URL_LENGTH>,
    pub error_message: String<128>,
}

/// Result of the HTTP header scan.
struct ResponseHead {
    status: u16,
    content_length: Option<u32>,
    /// Body bytes that arrived in the same reads as the headers sit in the
    /// scan buffer at `body_start..body_end`.
    body_start: usize,
    body_end: usize,
}

/// Streams one firmware image from an HTTP URL into the manager.
pub struct Downloader {
    state: DownloadState,
    bytes_downloaded: u32,
    content_length: u32,
    url: String<MAX_URL_LENGTH>,
    error_message: String<128>,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new()
    }
}

impl Downloader {
    pub fn new() -> Self {
        Self {
            state: DownloadState::Idle,
            bytes_downloaded: 0,
            content_length: 0,
            url: String::new(),
            error_message: String::new(),
        }
    }

    pub fn state(&self) -> DownloadState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        !matches!(
            self.state,
            DownloadState::Idle | DownloadState::Complete | DownloadState::Error
        )
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus {
            state: self.state,
            bytes_downloaded: self.bytes_downloaded,
            total_bytes: self.content_length,
            progress_percent: if self.content_length == 0 {
                0
            } else {
                (self.bytes_downloaded as u64 * 100 / self.content_length as u64) as u32
            },
            url: self.url.clone(),
            error_message: self.error_message.clone(),
        }
    }

    fn fail(&mut self, err: DownloadError) -> DownloadError {
        self.state = DownloadState::Error;
        self.error_message.clear();
        let _ = write!(self.error_message, "{err}");
        warn!("download error: {err}");
        err
    }

    /// Run a blocking download: resolve, connect, GET, stream the body into
    /// the manager, finalize against `expected_crc32`.
    ///
    /// Transport failures cancel the update; a CRC mismatch at finalize does
    /// not (the operator chooses between retry and cancel, as with uploads).
    pub fn run<D, W, C>(
        &mut self,
        manager: &mut FirmwareManager<D, W>,
        net: &mut C,
        url: &str,
        expected_crc32: u32,
        expected_version: Option<&str>,
    ) -> Result<(), DownloadError>
    where
        D: FlashDevice,
        W: Watchdog,
        C: Connector,
    {
        if self.is_in_progress() {
            return Err(self.fail(DownloadError::Update(UpdateError::BadState)));
        }

        self.bytes_downloaded = 0;
        self.content_length = 0;
        self.error_message.clear();
        self.url.clear();
        if self.url.push_str(url).is_err() {
            return Err(self.fail(DownloadError::InvalidUrl));
        }

        info!("starting firmware download from {url}");

        self.state = DownloadState::ParsingUrl;
        let parsed = match parse_url(url) {
            Ok(p) => p,
            Err(e) => return Err(self.fail(e)),
        };

        self.state = DownloadState::ResolvingDns;
        let addr = match net.resolve(&parsed.host) {
            Ok(a) => a,
            Err(e) => return Err(self.fail(e)),
        };

        self.state = DownloadState::Connecting;
        let mut conn = match net.connect(addr, parsed.port) {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e)),
        };

        self.state = DownloadState::SendingRequest;
        let mut request: String<512> = String::new();
        let _ = write!(
            request,
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: otamu/1.0\r\n\r\n",
            parsed.path, parsed.host
        );
        if conn.write_all(request.as_bytes()).is_err() {
            return Err(self.fail(DownloadError::Io));
        }

        self.state = DownloadState::ReceivingHeaders;
        let mut header_buf = [0u8; HEADER_BUFFER_SIZE];
        let head = match read_response_head(&mut conn, &mut header_buf) {
            Ok(h) => h,
            Err(e) => return Err(self.fail(e)),
        };

        if !(200..300).contains(&head.status) {
            return Err(self.fail(DownloadError::HttpStatus(head.status)));
        }
        let Some(content_length) = head.content_length else {
            return Err(self.fail(DownloadError::MissingContentLength));
        };
        self.content_length = content_length;
        info!("Content-Length: {content_length}");

        if let Err(e) = manager.start_update(content_length, expected_version) {
            return Err(self.fail(e.into()));
        }

        self.state = DownloadState::ReceivingBody;

        // Body bytes that shared a segment with the headers.
        let leftover = &header_buf[head.body_start..head.body_end];
        if !leftover.is_empty() {
            let n = leftover.len().min(content_length as usize);
            if let Err(e) = manager.write_chunk(&leftover[..n]) {
                let _ = manager.cancel_update();
                return Err(self.fail(e.into()));
            }
            self.bytes_downloaded = n as u32;
        }

        let mut chunk = [0u8; BODY_CHUNK_SIZE];
        while self.bytes_downloaded < self.content_length {
            let remaining = (self.content_length - self.bytes_downloaded) as usize;
            let want = remaining.min(chunk.len());
            let n = match conn.read(&mut chunk[..want]) {
                Ok(0) => {
                    // Peer closed before Content-Length bytes arrived.
                    let _ = manager.cancel_update();
                    return Err(self.fail(DownloadError::Io));
                }
                Ok(n) => n,
                Err(_) => {
                    let _ = manager.cancel_update();
                    return Err(self.fail(DownloadError::Io));
                }
            };
            if let Err(e) = manager.write_chunk(&chunk[..n]) {
                let _ = manager.cancel_update();
                return Err(self.fail(e.into()));
            }
            self.bytes_downloaded += n as u32;
        }

        self.state = DownloadState::Validating;
        if let Err(e) = manager.finalize_update(expected_crc32) {
            return Err(self.fail(e.into()));
        }

        self.state = DownloadState::Complete;
        info!("download complete and validated");
        Ok(())
    }
}

/// Read from `conn` until the end of the HTTP header block, then parse the
/// status line and Content-Length. Body bytes already read stay in `buf`
/// starting at the returned `body_start`.
fn read_response_head<C: Read>(
    conn: &mut C,
    buf: &mut [u8],
) -> Result<ResponseHead, DownloadError> {
    let mut filled = 0;

    let header_end = loop {
        if filled == buf.len() {
            return Err(DownloadError::HeadersTooLarge);
        }
        let n = conn
            .read(&mut buf[filled..])
            .map_err(|_| DownloadError::Io)?;
        if n == 0 {
            return Err(DownloadError::Io);
        }
        filled += n;

        if let Some(pos) = find_subslice(&buf[..filled], b"\r\n\r\n") {
            break pos;
        }
    };

    let head = core::str::from_utf8(&buf[..header_end]).map_err(|_| DownloadError::Io)?;
    let mut lines = head.split("\r\n");

    // Status line: "HTTP/1.1 200 OK"
    let status_line = lines.next().ok_or(DownloadError::Io)?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(DownloadError::Io)?;

    let mut content_length = None;
    for line in lines {
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value.trim().parse::<u32>().ok();
        }
    }

    Ok(ResponseHead {
        status,
        content_length,
        body_start: (header_end + 4).min(filled),
        body_end: filled,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
