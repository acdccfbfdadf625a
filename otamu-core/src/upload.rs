// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! HTTP POST upload sink.
//!
//! The HTTP server glue owns the socket and the header parsing; this adapter
//! owns the manager hand-off. It is deliberately stateless beyond the
//! expected CRC: `begin` on headers, `push` per body segment, `finish` on
//! connection close, `abort` on any lower-layer failure.

use crate::flash::{FlashDevice, Watchdog};
use crate::manager::{FirmwareManager, UpdateError};

/// One in-flight upload, borrowing the manager for its duration.
pub struct UploadSink<'a, D: FlashDevice, W: Watchdog> {
    manager: &'a mut FirmwareManager<D, W>,
    expected_crc32: u32,
}

impl<'a, D: FlashDevice, W: Watchdog> UploadSink<'a, D, W> {
    /// Start an upload from the request headers: announced body length,
    /// expected image CRC and optional version string.
    pub fn begin(
        manager: &'a mut FirmwareManager<D, W>,
        content_length: u32,
        expected_crc32: u32,
        version: Option<&str>,
    ) -> Result<Self, UpdateError> {
        manager.start_update(content_length, version)?;
        Ok(Self {
            manager,
            expected_crc32,
        })
    }

    /// Feed one body segment, exactly as it arrived from the transport.
    pub fn push(&mut self, data: &[u8]) -> Result<(), UpdateError> {
        self.manager.write_chunk(data)
    }

    /// The body is complete; validate and stage the image.
    pub fn finish(self) -> Result<(), UpdateError> {
        self.manager.finalize_update(self.expected_crc32)
    }

    /// The transport failed; drop the upload and return the manager to idle.
    pub fn abort(self) {
        let _ = self.manager.cancel_update();
    }

    pub fn bytes_received(&self) -> u32 {
        self.manager.status().bytes_received
    }
}
