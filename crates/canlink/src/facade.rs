// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single coordinated surface over the CAN services.
//!
//! The facade owns the bounded transmit queue (producers fail fast on
//! saturation), one drain task that routes outbound frames to their
//! transport, and one inbound pump per transport feeding the pipeline:
//! decode -> analyzer tap -> filter -> recorder tap -> subscriber
//! broadcast. Frames from a single interface are processed in arrival
//! order; interfaces are independent of each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::analyzer::ProtocolAnalyzer;
use crate::anomaly::AnomalyDetector;
use crate::breaker::CircuitBreaker;
use crate::codec::Codec;
use crate::error::{CanError, CanResult};
use crate::filter::MessageFilter;
use crate::frame::{CanFrame, DecodedFrame};
use crate::recorder::CanRecorder;
use crate::safety::{EmergencyFlag, EmergencyOutcome, SafetyAware, SafetyStatus};
use crate::transport::{BusTransport, InterfaceMap};

/// Default transmit queue depth.
pub const DEFAULT_TRANSMIT_CAPACITY: usize = 1024;

/// Default decoded-frame fan-out depth per subscriber.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Bound on each service's emergency-stop handler.
pub const EMERGENCY_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Consecutive transport failures before an interface's circuit opens.
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;

/// Cooldown before an open circuit admits a probe.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(5);

/// Facade traffic counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacadeStats {
    pub frames_received: u64,
    pub frames_transmitted: u64,
    pub frames_blocked: u64,
    pub unknown_interface_drops: u64,
    pub pipeline_errors: u64,
    /// Outbound frames dropped while an interface's circuit was open.
    pub circuit_drops: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    transmitted: AtomicU64,
    blocked: AtomicU64,
    unknown_interface: AtomicU64,
    pipeline_errors: AtomicU64,
    circuit_drops: AtomicU64,
}

/// Coordinated CAN surface: transmit queue, transports, and the inbound
/// decode pipeline.
pub struct CanFacade {
    codec: Codec,
    interfaces: InterfaceMap,
    analyzer: Arc<ProtocolAnalyzer>,
    anomaly: Arc<AnomalyDetector>,
    filter: Arc<MessageFilter>,
    recorder: Arc<CanRecorder>,
    transports: SyncMutex<HashMap<String, Arc<dyn BusTransport>>>,
    breakers: SyncMutex<HashMap<String, Arc<CircuitBreaker>>>,
    transmit_tx: mpsc::Sender<CanFrame>,
    transmit_rx: SyncMutex<Option<mpsc::Receiver<CanFrame>>>,
    decoded_tx: broadcast::Sender<DecodedFrame>,
    extra_safety: SyncMutex<Vec<Arc<dyn SafetyAware>>>,
    counters: Counters,
    emergency: EmergencyFlag,
    started: std::sync::atomic::AtomicBool,
}

impl CanFacade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        codec: Codec,
        interfaces: InterfaceMap,
        analyzer: Arc<ProtocolAnalyzer>,
        anomaly: Arc<AnomalyDetector>,
        filter: Arc<MessageFilter>,
        recorder: Arc<CanRecorder>,
        emergency: EmergencyFlag,
        transmit_capacity: usize,
        broadcast_capacity: usize,
    ) -> Self {
        let (transmit_tx, transmit_rx) = mpsc::channel(transmit_capacity.max(1));
        let (decoded_tx, _) = broadcast::channel(broadcast_capacity.max(1));
        Self {
            codec,
            interfaces,
            analyzer,
            anomaly,
            filter,
            recorder,
            transports: SyncMutex::new(HashMap::new()),
            breakers: SyncMutex::new(HashMap::new()),
            transmit_tx,
            transmit_rx: SyncMutex::new(Some(transmit_rx)),
            decoded_tx,
            extra_safety: SyncMutex::new(Vec::new()),
            counters: Counters::default(),
            emergency,
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn analyzer(&self) -> &Arc<ProtocolAnalyzer> {
        &self.analyzer
    }

    pub fn anomaly(&self) -> &Arc<AnomalyDetector> {
        &self.anomaly
    }

    pub fn filter(&self) -> &Arc<MessageFilter> {
        &self.filter
    }

    pub fn recorder(&self) -> &Arc<CanRecorder> {
        &self.recorder
    }

    pub fn emergency_flag(&self) -> EmergencyFlag {
        self.emergency.clone()
    }

    /// Register a bound transport. Must happen before [`CanFacade::start`].
    pub fn add_transport(&self, transport: Arc<dyn BusTransport>) -> CanResult<()> {
        if self.started.load(Ordering::Acquire) {
            return Err(CanError::conflict("transports must be added before start"));
        }
        let name = transport.name().to_owned();
        let mut transports = self.transports.lock();
        if transports.contains_key(&name) {
            return Err(CanError::conflict(format!("interface {name} already bound")));
        }
        self.breakers.lock().insert(
            name.clone(),
            Arc::new(CircuitBreaker::new(BREAKER_FAILURE_THRESHOLD, BREAKER_COOLDOWN)),
        );
        transports.insert(name, transport);
        Ok(())
    }

    /// Names of bound physical interfaces.
    pub fn bound_interfaces(&self) -> Vec<String> {
        self.transports.lock().keys().cloned().collect()
    }

    /// Whether at least one interface is bound (startup probe).
    pub fn hardware_ready(&self) -> bool {
        !self.transports.lock().is_empty()
    }

    /// Producer handle onto the bounded transmit queue.
    pub fn transmit_handle(&self) -> mpsc::Sender<CanFrame> {
        self.transmit_tx.clone()
    }

    /// Enqueue one frame, failing fast when the queue is saturated.
    pub fn transmit(&self, frame: CanFrame) -> CanResult<()> {
        self.emergency.guard("transmit")?;
        self.transmit_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CanError::queue_full("transmit queue saturated"),
            mpsc::error::TrySendError::Closed(_) => CanError::internal("transmit queue closed"),
        })
    }

    /// Subscribe to decoded frames that passed the filter.
    ///
    /// Fan-out is best-effort in publish order; a subscriber that lags
    /// past its buffer observes `Lagged` and misses frames rather than
    /// blocking the pipeline.
    pub fn subscribe_decoded(&self) -> broadcast::Receiver<DecodedFrame> {
        self.decoded_tx.subscribe()
    }

    /// Spawn the drain task and one inbound pump per transport.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> CanResult<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(CanError::conflict("facade already started"));
        }
        let transmit_rx = self
            .transmit_rx
            .lock()
            .take()
            .ok_or_else(|| CanError::internal("transmit receiver already taken"))?;

        self.spawn_drain(transmit_rx, cancel.clone());
        let transports: Vec<Arc<dyn BusTransport>> =
            self.transports.lock().values().cloned().collect();
        for transport in transports {
            self.spawn_pump(transport, cancel.clone());
        }
        Ok(())
    }

    /// Single consumer of the transmit queue: resolves the logical
    /// interface and writes to its transport.
    fn spawn_drain(self: &Arc<Self>, mut rx: mpsc::Receiver<CanFrame>, cancel: CancellationToken) {
        let facade = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = rx.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                let physical = facade.interfaces.resolve(&frame.interface).to_owned();
                let transport = facade.transports.lock().get(&physical).cloned();
                match transport {
                    Some(transport) => {
                        let breaker = facade.breakers.lock().get(&physical).cloned();
                        if let Some(ref breaker) = breaker {
                            if breaker.admit().is_err() {
                                facade.counters.circuit_drops.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        }
                        let mut outbound = frame;
                        outbound.interface = physical;
                        match transport.send(outbound).await {
                            Ok(()) => {
                                facade.counters.transmitted.fetch_add(1, Ordering::Relaxed);
                                if let Some(ref breaker) = breaker {
                                    breaker.record_success();
                                }
                            }
                            Err(e) => {
                                tracing::warn!(err = %e, "transmit failed");
                                if let Some(ref breaker) = breaker {
                                    breaker.record_failure();
                                }
                            }
                        }
                    }
                    None => {
                        facade.counters.unknown_interface.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(interface = %physical, "dropping frame for unbound interface");
                    }
                }
            }
        });
    }

    /// Per-transport inbound pump; preserves arrival order for that
    /// interface.
    fn spawn_pump(self: &Arc<Self>, transport: Arc<dyn BusTransport>, cancel: CancellationToken) {
        let facade = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = transport.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                facade.process_inbound(frame);
            }
            tracing::debug!(interface = transport.name(), "inbound pump stopped");
        });
    }

    /// Run one raw frame through the inbound pipeline.
    pub fn process_inbound(&self, frame: CanFrame) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let decoded = self.codec.decode(frame);

        // Analyzer tap: classification refinement is advisory; a refusal
        // (emergency stop) drops the tap, not the frame.
        let mut decoded = decoded;
        if let Ok(protocol) = self.analyzer.observe(&decoded) {
            decoded.protocol = protocol;
        }
        let _ = self.anomaly.observe(&decoded);

        let verdict = match self.filter.process(decoded) {
            Ok(verdict) => verdict,
            Err(_) => {
                self.counters.pipeline_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if verdict.blocked {
            self.counters.blocked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for target in &verdict.forward_to {
            let mut copy = verdict.frame.frame.clone();
            copy.interface = target.clone();
            if self.transmit(copy).is_err() {
                tracing::warn!(interface = %target, "forward dropped, transmit queue saturated");
            }
        }

        self.recorder.record(&verdict.frame.frame);
        let _ = self.decoded_tx.send(verdict.frame);
    }

    /// Invoke `emergency_stop` on every registered CAN service in
    /// parallel, each under [`EMERGENCY_STOP_TIMEOUT`].
    pub async fn emergency_stop_all(&self, reason: &str) -> Vec<(String, EmergencyOutcome)> {
        let services = self.safety_services();
        let calls = services.iter().map(|service| {
            let name = service.name().to_owned();
            async move {
                match tokio::time::timeout(EMERGENCY_STOP_TIMEOUT, service.emergency_stop(reason))
                    .await
                {
                    Ok(outcome) => (name, outcome),
                    Err(_) => (name, EmergencyOutcome::TimedOut),
                }
            }
        });
        futures_util::future::join_all(calls).await
    }

    /// Safety view of every CAN service.
    pub fn safety_statuses(&self) -> Vec<SafetyStatus> {
        self.safety_services().iter().map(|s| s.safety_status()).collect()
    }

    /// Register an additional safety-aware service (the injector, which
    /// is built around this facade's transmit handle) into the cascade.
    pub fn register_safety_service(&self, service: Arc<dyn SafetyAware>) {
        self.extra_safety.lock().push(service);
    }

    fn safety_services(&self) -> Vec<Arc<dyn SafetyAware>> {
        let mut services = vec![
            Arc::clone(&self.analyzer) as Arc<dyn SafetyAware>,
            Arc::clone(&self.anomaly) as Arc<dyn SafetyAware>,
            Arc::clone(&self.filter) as Arc<dyn SafetyAware>,
            Arc::clone(&self.recorder) as Arc<dyn SafetyAware>,
        ];
        services.extend(self.extra_safety.lock().iter().cloned());
        services
    }

    pub fn statistics(&self) -> FacadeStats {
        FacadeStats {
            frames_received: self.counters.received.load(Ordering::Relaxed),
            frames_transmitted: self.counters.transmitted.load(Ordering::Relaxed),
            frames_blocked: self.counters.blocked.load(Ordering::Relaxed),
            unknown_interface_drops: self.counters.unknown_interface.load(Ordering::Relaxed),
            pipeline_errors: self.counters.pipeline_errors.load(Ordering::Relaxed),
            circuit_drops: self.counters.circuit_drops.load(Ordering::Relaxed),
        }
    }

    /// Circuit-breaker state per bound interface.
    pub fn breaker_states(&self) -> HashMap<String, crate::breaker::BreakerState> {
        self.breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect()
    }

    /// Total error frames across bound transports.
    pub fn error_frame_count(&self) -> u64 {
        self.transports.lock().values().map(|t| t.error_frame_count()).sum()
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
