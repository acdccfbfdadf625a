// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! Download sink tests: URL parsing, HTTP response handling and the full
//! pull-into-flash path over a scripted connection.

use std::cell::RefCell;
use std::rc::Rc;

use crc::{Crc, CRC_32_ISO_HDLC};
use otamu_core::download::{parse_url, Connector, DownloadError, DownloadState, Downloader};
use otamu_core::flash::FlashOps;
use otamu_core::layout::Bank;
use otamu_core::manager::{FirmwareManager, UpdateState};
use otamu_core::metadata::MetadataStore;
use otamu_core::sim::SimFlash;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

fn fresh_manager() -> FirmwareManager<SimFlash> {
    let store = MetadataStore::init(FlashOps::new(SimFlash::new())).unwrap();
    FirmwareManager::new(store)
}

fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn http_response(body: &[u8], content_length: Option<usize>) -> Vec<u8> {
    let mut head = String::from("HTTP/1.1 200 OK\r\nServer: test\r\n");
    if let Some(len) = content_length {
        head.push_str(&format!("Content-Length: {len}\r\n"));
    }
    head.push_str("Connection: close\r\n\r\n");

    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    out
}

// --- Scripted connection ---------------------------------------------------

struct ScriptedConn {
    response: Vec<u8>,
    pos: usize,
    /// Largest read served at once, to exercise segmentation.
    max_read: usize,
    request: Rc<RefCell<Vec<u8>>>,
}

impl embedded_io::ErrorType for ScriptedConn {
    type Error = core::convert::Infallible;
}

impl embedded_io::Read for ScriptedConn {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = buf
            .len()
            .min(self.max_read)
            .min(self.response.len() - self.pos);
        buf[..n].copy_from_slice(&self.response[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl embedded_io::Write for ScriptedConn {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.request.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

struct MockNet {
    response: Vec<u8>,
    max_read: usize,
    fail_dns: bool,
    fail_connect: bool,
    request: Rc<RefCell<Vec<u8>>>,
    resolved_host: RefCell<String>,
    connected_port: RefCell<u16>,
}

impl MockNet {
    fn serving(response: Vec<u8>) -> Self {
        Self {
            response,
            max_read: 700,
            fail_dns: false,
            fail_connect: false,
            request: Rc::new(RefCell::new(Vec::new())),
            resolved_host: RefCell::new(String::new()),
            connected_port: RefCell::new(0),
        }
    }

    fn request_text(&self) -> String {
        String::from_utf8(self.request.borrow().clone()).unwrap()
    }
}

impl Connector for MockNet {
    type Addr = u32;
    type Connection = ScriptedConn;

    fn resolve(&mut self, host: &str) -> Result<Self::Addr, DownloadError> {
        if self.fail_dns {
            return Err(DownloadError::DnsFailed);
        }
        *self.resolved_host.borrow_mut() = host.to_string();
        Ok(0x0A00_0001)
    }

    fn connect(&mut self, _addr: Self::Addr, port: u16) -> Result<Self::Connection, DownloadError> {
        if self.fail_connect {
            return Err(DownloadError::ConnectFailed);
        }
        *self.connected_port.borrow_mut() = port;
        Ok(ScriptedConn {
            response: self.response.clone(),
            pos: 0,
            max_read: self.max_read,
            request: Rc::clone(&self.request),
        })
    }
}

// =============================================================================
// Full pull
// =============================================================================

#[test]
fn test_download_completes_an_update() {
    let mut manager = fresh_manager();
    let image = test_image(3000);
    let crc = CRC32.checksum(&image);
    let mut net = MockNet::serving(http_response(&image, Some(image.len())));

    let mut downloader = Downloader::new();
    downloader
        .run(
            &mut manager,
            &mut net,
            "http://fw.example.com/images/app.bin",
            crc,
            Some("v4"),
        )
        .unwrap();

    assert_eq!(downloader.state(), DownloadState::Complete);
    assert_eq!(manager.state(), UpdateState::Complete);
    assert_eq!(net.resolved_host.borrow().as_str(), "fw.example.com");
    assert_eq!(*net.connected_port.borrow(), 80);

    // Well-formed request line and headers.
    let request = net.request_text();
    assert!(request.starts_with("GET /images/app.bin HTTP/1.1\r\n"));
    assert!(request.contains("Host: fw.example.com\r\n"));
    assert!(request.contains("Connection: close\r\n"));
    assert!(request.ends_with("\r\n\r\n"));

    // The image landed in the inactive bank.
    let mut back = vec![0u8; image.len()];
    manager
        .metadata()
        .flash()
        .read(Bank::B.offset(), &mut back)
        .unwrap();
    assert_eq!(back, image);
    assert_eq!(manager.metadata().current().bank(Bank::B).version_str(), "v4");
}

#[test]
fn test_download_uses_explicit_port() {
    let mut manager = fresh_manager();
    let image = test_image(600);
    let crc = CRC32.checksum(&image);
    let mut net = MockNet::serving(http_response(&image, Some(image.len())));

    Downloader::new()
        .run(
            &mut manager,
            &mut net,
            "http://10.1.2.3:8080/fw.bin",
            crc,
            None,
        )
        .unwrap();

    assert_eq!(*net.connected_port.borrow(), 8080);
}

#[test]
fn test_download_progress_status() {
    let mut manager = fresh_manager();
    let image = test_image(1500);
    let crc = CRC32.checksum(&image);
    let mut net = MockNet::serving(http_response(&image, Some(image.len())));

    let mut downloader = Downloader::new();
    downloader
        .run(&mut manager, &mut net, "http://h/fw.bin", crc, None)
        .unwrap();

    let status = downloader.status();
    assert_eq!(status.bytes_downloaded, 1500);
    assert_eq!(status.total_bytes, 1500);
    assert_eq!(status.progress_percent, 100);
    assert_eq!(status.url.as_str(), "http://h/fw.bin");
}

// =============================================================================
// Failure paths
// =============================================================================

#[test]
fn test_invalid_url_never_touches_the_network() {
    let mut manager = fresh_manager();
    let mut net = MockNet::serving(Vec::new());

    let err = Downloader::new()
        .run(&mut manager, &mut net, "https://secure.example/fw", 0, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::InvalidUrl);
    assert!(net.resolved_host.borrow().is_empty());
    assert_eq!(manager.state(), UpdateState::Idle);
}

#[test]
fn test_dns_failure_reports_error() {
    let mut manager = fresh_manager();
    let mut net = MockNet::serving(Vec::new());
    net.fail_dns = true;

    let mut downloader = Downloader::new();
    let err = downloader
        .run(&mut manager, &mut net, "http://h/fw.bin", 0, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::DnsFailed);
    assert_eq!(downloader.state(), DownloadState::Error);
    assert_eq!(manager.state(), UpdateState::Idle);
}

#[test]
fn test_connect_failure_reports_error() {
    let mut manager = fresh_manager();
    let mut net = MockNet::serving(Vec::new());
    net.fail_connect = true;

    let err = Downloader::new()
        .run(&mut manager, &mut net, "http://h/fw.bin", 0, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::ConnectFailed);
}

#[test]
fn test_http_error_status_aborts_before_update() {
    let mut manager = fresh_manager();
    let response = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_vec();
    let mut net = MockNet::serving(response);

    let err = Downloader::new()
        .run(&mut manager, &mut net, "http://h/missing.bin", 0, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::HttpStatus(404));
    // start_update was never called.
    assert_eq!(manager.state(), UpdateState::Idle);
    assert!(!manager.metadata().current().is_update_in_progress());
}

#[test]
fn test_missing_content_length_is_rejected() {
    let mut manager = fresh_manager();
    let mut net = MockNet::serving(http_response(b"abc", None));

    let err = Downloader::new()
        .run(&mut manager, &mut net, "http://h/fw.bin", 0, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::MissingContentLength);
    assert_eq!(manager.state(), UpdateState::Idle);
}

#[test]
fn test_truncated_body_cancels_the_update() {
    let mut manager = fresh_manager();
    let image = test_image(3000);
    let crc = CRC32.checksum(&image);
    // Announce 3000 bytes but deliver only 1200.
    let mut response = http_response(&image, Some(image.len()));
    response.truncate(response.len() - 1800);
    let mut net = MockNet::serving(response);

    let mut downloader = Downloader::new();
    let err = downloader
        .run(&mut manager, &mut net, "http://h/fw.bin", crc, None)
        .unwrap_err();
    assert_eq!(err, DownloadError::Io);
    assert_eq!(downloader.state(), DownloadState::Error);

    // The update was cancelled: back to idle, staging flag cleared.
    assert_eq!(manager.state(), UpdateState::Idle);
    assert!(!manager.metadata().current().is_update_in_progress());
}

#[test]
fn test_crc_mismatch_leaves_manager_in_error() {
    let mut manager = fresh_manager();
    let image = test_image(3000);
    let mut net = MockNet::serving(http_response(&image, Some(image.len())));

    let mut downloader = Downloader::new();
    let err = downloader
        .run(&mut manager, &mut net, "http://h/fw.bin", 0xCAFE_BABE, None)
        .unwrap_err();
    assert!(matches!(err, DownloadError::Update(_)));
    assert_eq!(downloader.state(), DownloadState::Error);

    // Validation failure is not a transport failure: the update stays
    // pending so the operator can retry or cancel.
    assert_eq!(manager.state(), UpdateState::Error);
    assert!(manager.metadata().current().is_update_in_progress());
}

#[test]
fn test_oversized_content_length_is_refused() {
    let mut manager = fresh_manager();
    let response = http_response(b"", Some((Bank::A.size() + 1) as usize));
    let mut net = MockNet::serving(response);

    let err = Downloader::new()
        .run(&mut manager, &mut net, "http://h/fw.bin", 0, None)
        .unwrap_err();
    assert!(matches!(err, DownloadError::Update(_)));
    assert_eq!(manager.state(), UpdateState::Idle);
}

// =============================================================================
// URL parsing details
// =============================================================================

#[test]
fn test_parse_url_component_limits() {
    let long_host = format!("http://{}/x", "h".repeat(200));
    assert_eq!(parse_url(&long_host), Err(DownloadError::InvalidUrl));

    let long_path = format!("http://h/{}", "p".repeat(200));
    assert_eq!(parse_url(&long_path), Err(DownloadError::InvalidUrl));
}

#[test]
fn test_parse_url_port_edge_cases() {
    assert_eq!(parse_url("http://h:0/x").unwrap().port, 0);
    assert_eq!(parse_url("http://h:65535/x").unwrap().port, 65535);
    assert_eq!(parse_url("http://h:65536/x"), Err(DownloadError::InvalidUrl));
}
