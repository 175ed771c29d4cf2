// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport seam between the CAN layer and physical interfaces.
//!
//! The facade drives everything through [`BusTransport`] so the core
//! never touches raw sockets directly. Deployments bind SocketCAN (or
//! any other bus access) behind this trait; tests and simulation use
//! [`LoopbackTransport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::{CanError, CanResult};
use crate::frame::CanFrame;

/// A bound CAN interface.
///
/// `recv` is single-consumer: the facade owns one inbound pump task per
/// transport, which preserves per-interface arrival order. Error frames
/// are counted, never decoded.
pub trait BusTransport: Send + Sync {
    /// Physical interface name (`can0`, `vcan1`, ...).
    fn name(&self) -> &str;

    /// Write one frame to the bus.
    fn send(&self, frame: CanFrame) -> BoxFuture<'_, CanResult<()>>;

    /// Read the next frame; `None` once the interface is closed.
    fn recv(&self) -> BoxFuture<'_, Option<CanFrame>>;

    /// Error frames observed since bind.
    fn error_frame_count(&self) -> u64 {
        0
    }
}

/// Boxing helper so call sites can pass concrete transports directly.
pub trait Boxed {
    fn boxed(self) -> Box<dyn BusTransport>;
}

impl<T: BusTransport + 'static> Boxed for T {
    fn boxed(self) -> Box<dyn BusTransport> {
        Box::new(self)
    }
}

/// Logical-to-physical interface name mapping from the coach config.
///
/// Unmapped names resolve to themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMap {
    #[serde(default)]
    map: HashMap<String, String>,
}

impl InterfaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, logical: impl Into<String>, physical: impl Into<String>) {
        self.map.insert(logical.into(), physical.into());
    }

    pub fn resolve<'a>(&'a self, logical: &'a str) -> &'a str {
        self.map.get(logical).map(String::as_str).unwrap_or(logical)
    }

    /// Logical names with an explicit mapping.
    pub fn logical_names(&self) -> impl Iterator<Item = &str> {
        self.map.keys().map(String::as_str)
    }
}

/// In-process transport for tests and simulation.
///
/// Frames sent through it surface on the paired [`LoopbackHandle`];
/// frames injected through the handle surface on `recv`.
pub struct LoopbackTransport {
    name: String,
    inbound: Mutex<mpsc::Receiver<CanFrame>>,
    outbound: mpsc::Sender<CanFrame>,
    error_frames: Arc<AtomicU64>,
}

/// Test-side handle for a [`LoopbackTransport`].
pub struct LoopbackHandle {
    /// Feed a frame into the transport's receive path.
    pub inject: mpsc::Sender<CanFrame>,
    /// Frames the core wrote to the bus.
    pub sent: mpsc::Receiver<CanFrame>,
    error_frames: Arc<AtomicU64>,
}

impl LoopbackHandle {
    /// Record an error frame observation (simulating bus errors).
    pub fn bump_error_frames(&self) {
        self.error_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Build a loopback pair with the given channel capacity.
pub fn loopback(name: impl Into<String>, capacity: usize) -> (LoopbackTransport, LoopbackHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(capacity.max(1));
    let (sent_tx, sent_rx) = mpsc::channel(capacity.max(1));
    let error_frames = Arc::new(AtomicU64::new(0));
    let transport = LoopbackTransport {
        name: name.into(),
        inbound: Mutex::new(inject_rx),
        outbound: sent_tx,
        error_frames: Arc::clone(&error_frames),
    };
    let handle = LoopbackHandle { inject: inject_tx, sent: sent_rx, error_frames };
    (transport, handle)
}

impl BusTransport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, frame: CanFrame) -> BoxFuture<'_, CanResult<()>> {
        Box::pin(async move {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| CanError::internal(format!("loopback {} closed", self.name)))
        })
    }

    fn recv(&self) -> BoxFuture<'_, Option<CanFrame>> {
        Box::pin(async move { self.inbound.lock().await.recv().await })
    }

    fn error_frame_count(&self) -> u64 {
        self.error_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
