// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon wiring and lifecycle.
//!
//! Builds every component from the boot configuration, registers them
//! with the service registry in spec layer order, starts the registry,
//! spawns the long-running tasks, and serves until the cancellation
//! token fires.

use std::collections::HashSet;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use canlink::analyzer::{AnalyzerConfig, ProtocolAnalyzer};
use canlink::anomaly::{Anomaly, AnomalyConfig, AnomalyDetector, AnomalySeverity};
use canlink::codec::Codec;
use canlink::diagnostics::DiagnosticRegistry;
use canlink::facade::CanFacade;
use canlink::filter::MessageFilter;
use canlink::injector::{default_dangerous_pgns, InjectionAudit, MessageInjector};
use canlink::recorder::CanRecorder;
use canlink::safety::{EmergencyAction, EmergencyFlag, SafetyAware, SafetyClassification};
use canlink::spec::SpecTable;
use canlink::transport::BusTransport;

use crate::config::{CoachConfig, DaemonConfig};
use crate::entity::control::ControlService;
use crate::entity::EntityManager;
use crate::error::{CoreError, CoreResult};
use crate::events::EventBus;
use crate::health::HealthProbes;
use crate::monitor::PerfMonitor;
use crate::registry::{HealthReport, ServiceInstance, ServiceRegistry, ServiceSpec};
use crate::repository::audit::{AuditKind, SecurityAuditRepository};
use crate::repository::auth::AuthRepository;
use crate::repository::entity::EntityRepository;
use crate::safety::interlock::InterlockEngine;
use crate::safety::pin::PinManager;
use crate::safety::SafetyService;
use crate::security::attempts::{PatternThresholds, SecurityOrchestrator};
use crate::security::ratelimit::RateLimiter;

/// Every assembled component of the platform.
pub struct Platform {
    pub coach: Arc<CoachConfig>,
    pub events: EventBus,
    pub emergency: EmergencyFlag,
    pub monitor: PerfMonitor,
    pub codec: Codec,
    pub facade: Arc<CanFacade>,
    pub injector: Arc<MessageInjector>,
    pub entities: Arc<EntityManager>,
    pub diagnostics: Arc<DiagnosticRegistry>,
    pub interlocks: Arc<InterlockEngine>,
    pub control: Arc<ControlService>,
    pub safety: Arc<SafetyService>,
    pub pins: Arc<PinManager>,
    pub orchestrator: Arc<SecurityOrchestrator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub entity_repo: Arc<EntityRepository>,
    pub auth_repo: Arc<AuthRepository>,
    pub audit: Arc<SecurityAuditRepository>,
    pub registry: Arc<ServiceRegistry>,
    pub probes: Arc<HealthProbes>,
    injection_audit_rx: parking_lot::Mutex<Option<tokio::sync::mpsc::Receiver<InjectionAudit>>>,
}

impl Platform {
    /// Assemble the platform from a validated coach config and bound
    /// transports.
    pub fn build(
        daemon: &DaemonConfig,
        coach: CoachConfig,
        transports: Vec<Box<dyn BusTransport>>,
    ) -> CoreResult<Arc<Self>> {
        let coach = Arc::new(coach);
        let events = EventBus::default();
        let emergency = EmergencyFlag::new();
        let monitor = PerfMonitor::new();

        let mut spec = SpecTable::builtin();
        spec.merge(coach.spec_extensions.clone());
        let codec = Codec::new(Arc::new(spec));

        let audit = Arc::new(SecurityAuditRepository::new(
            monitor.clone(),
            coach.retention.clone(),
        ));
        let entity_repo = Arc::new(EntityRepository::new(monitor.clone(), coach.retention.clone()));
        let auth_repo = Arc::new(AuthRepository::new(monitor.clone()));

        let analyzer = Arc::new(ProtocolAnalyzer::new(AnalyzerConfig::default(), emergency.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(AnomalyConfig::default(), emergency.clone()));
        let filter = Arc::new(MessageFilter::new(4096, 256, emergency.clone()));
        let recorder = Arc::new(CanRecorder::new(
            daemon.recordings_dir.clone(),
            daemon.recorder_capacity,
            daemon.autosave_interval(),
            emergency.clone(),
        ));
        let facade = Arc::new(CanFacade::new(
            codec.clone(),
            coach.interface_map.clone(),
            Arc::clone(&analyzer),
            Arc::clone(&anomaly),
            Arc::clone(&filter),
            Arc::clone(&recorder),
            emergency.clone(),
            daemon.transmit_capacity,
            canlink::facade::DEFAULT_BROADCAST_CAPACITY,
        ));
        for transport in transports {
            facade.add_transport(Arc::from(transport))?;
        }

        let mut dangerous = default_dangerous_pgns();
        dangerous.extend(coach.dangerous_pgns.iter().copied());
        let (injection_audit_tx, injection_audit_rx) = tokio::sync::mpsc::channel(256);
        let injector = Arc::new(MessageInjector::new(
            daemon.injector_safety_level()?,
            dangerous,
            facade.transmit_handle(),
            injection_audit_tx,
            emergency.clone(),
        ));
        facade.register_safety_service(Arc::clone(&injector) as Arc<dyn SafetyAware>);

        let entities = Arc::new(EntityManager::new(&coach.coach_mapping, events.clone()));
        for definition in &coach.coach_mapping {
            entity_repo.upsert_definition(definition.clone());
        }

        let diagnostics = Arc::new(DiagnosticRegistry::new());
        let interlocks = Arc::new(InterlockEngine::new());
        let orchestrator = Arc::new(SecurityOrchestrator::new(
            PatternThresholds::default(),
            Arc::clone(&audit),
            events.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(coach.rate_limits.clone()));
        let pins = Arc::new(PinManager::with_rate_limiter(
            coach.pin_policy.clone(),
            &coach.pins,
            Arc::clone(&orchestrator),
            Some(Arc::clone(&rate_limiter)),
        ));
        let safety = Arc::new(SafetyService::new(
            emergency.clone(),
            Arc::clone(&interlocks),
            Arc::clone(&pins),
            Arc::clone(&audit),
            events.clone(),
            daemon.health_check_interval(),
            daemon.watchdog_timeout(),
        ));
        for service in [
            Arc::clone(&analyzer) as Arc<dyn SafetyAware>,
            Arc::clone(&anomaly) as Arc<dyn SafetyAware>,
            Arc::clone(&filter) as Arc<dyn SafetyAware>,
            Arc::clone(&recorder) as Arc<dyn SafetyAware>,
            Arc::clone(&injector) as Arc<dyn SafetyAware>,
        ] {
            safety.register_target(service);
        }

        let control = Arc::new(ControlService::new(
            Arc::clone(&entities),
            Arc::clone(&interlocks),
            emergency.clone(),
            codec.clone(),
            facade.transmit_handle(),
            events.clone(),
            Arc::clone(&audit),
            Arc::clone(&coach),
            daemon.reconcile_deadline(),
            daemon.debounce_window(),
        ));
        control.attach_repository(Arc::clone(&entity_repo));

        let registry = Arc::new(ServiceRegistry::new(
            events.clone(),
            daemon.startup_timeout(),
            daemon.shutdown_timeout(),
        ));
        safety.attach_registry(Arc::clone(&registry));

        let probes = Arc::new(HealthProbes::new(
            Arc::clone(&registry),
            Arc::clone(&facade),
            Arc::clone(&entities),
            Arc::clone(&safety),
            coach.release_id.clone(),
        ));

        let platform = Arc::new(Self {
            coach,
            events,
            emergency,
            monitor,
            codec,
            facade,
            injector,
            entities,
            diagnostics,
            interlocks,
            control,
            safety,
            pins,
            orchestrator,
            rate_limiter,
            entity_repo,
            auth_repo,
            audit,
            registry,
            probes,
            injection_audit_rx: parking_lot::Mutex::new(Some(injection_audit_rx)),
        });
        platform.register_services()?;
        Ok(platform)
    }

    /// Register every component with the lifecycle kernel, layered the
    /// way the data flows: config and monitor first, repositories,
    /// codec and interfaces, the CAN services, the coordination layer,
    /// then safety on top.
    fn register_services(self: &Arc<Self>) -> CoreResult<()> {
        let registry = Arc::clone(&self.registry);

        fn provide<T: Send + Sync + 'static>(value: Arc<T>) -> crate::registry::InitFn {
            Box::new(move |_deps| {
                Box::pin(async move { Ok(value as ServiceInstance) })
            })
        }

        registry.register(
            ServiceSpec::new("config_provider", provide(Arc::clone(&self.coach)))
                .classification(SafetyClassification::Critical)
                .tag("core"),
        )?;
        registry.register(
            ServiceSpec::new("perf_monitor", provide(Arc::new(self.monitor.clone())))
                .classification(SafetyClassification::Informational)
                .tag("core"),
        )?;
        registry.register(
            ServiceSpec::new("entity_repository", provide(Arc::clone(&self.entity_repo)))
                .requires("config_provider")
                .optional("perf_monitor")
                .tag("repository"),
        )?;
        registry.register(
            ServiceSpec::new("auth_repository", provide(Arc::clone(&self.auth_repo)))
                .optional("perf_monitor")
                .tag("repository"),
        )?;
        registry.register(
            ServiceSpec::new("security_audit_repository", provide(Arc::clone(&self.audit)))
                .requires("config_provider")
                .optional("perf_monitor")
                .classification(SafetyClassification::SafetyRelated)
                .tag("repository"),
        )?;
        registry.register(
            ServiceSpec::new("protocol_codec", provide(Arc::new(self.codec.clone())))
                .requires("config_provider")
                .tag("can"),
        )?;
        {
            let facade = Arc::clone(&self.facade);
            registry.register(
                ServiceSpec::new("can_interface", provide(Arc::clone(&self.facade)))
                    .requires("config_provider")
                    .classification(SafetyClassification::Critical)
                    .emergency_action(EmergencyAction::StopImmediately)
                    .tag("can")
                    .health(move |_| facade.hardware_ready()),
            )?;
        }
        {
            let analyzer = Arc::clone(self.facade.analyzer());
            registry.register(
                ServiceSpec::new("protocol_analyzer", provide(Arc::clone(self.facade.analyzer())))
                    .requires("can_interface")
                    .emergency_action(EmergencyAction::EnterSafeMode)
                    .tag("can")
                    .health(move |_| analyzer.safety_status().running),
            )?;
        }
        {
            let anomaly = Arc::clone(self.facade.anomaly());
            registry.register(
                ServiceSpec::new("anomaly_detector", provide(Arc::clone(self.facade.anomaly())))
                    .requires("can_interface")
                    .emergency_action(EmergencyAction::EnterSafeMode)
                    .tag("can")
                    .tag("security")
                    .health(move |_| anomaly.safety_status().running),
            )?;
        }
        registry.register(
            ServiceSpec::new("message_filter", provide(Arc::clone(self.facade.filter())))
                .requires("can_interface")
                .emergency_action(EmergencyAction::EnterSafeMode)
                .tag("can"),
        )?;
        {
            let injector = Arc::clone(&self.injector);
            let stopper = Arc::clone(&self.injector);
            registry.register(
                ServiceSpec::new("message_injector", provide(Arc::clone(&self.injector)))
                    .requires("can_interface")
                    .classification(SafetyClassification::Critical)
                    .emergency_action(EmergencyAction::StopImmediately)
                    .tag("can")
                    .health(move |_| injector.safety_status().running)
                    .shutdown(move |_| {
                        let stopper = Arc::clone(&stopper);
                        Box::pin(async move {
                            stopper.stop(None);
                            Ok(())
                        })
                    }),
            )?;
        }
        {
            let recorder = Arc::clone(self.facade.recorder());
            registry.register(
                ServiceSpec::new("can_recorder", provide(Arc::clone(self.facade.recorder())))
                    .requires("can_interface")
                    .emergency_action(EmergencyAction::EnterSafeMode)
                    .tag("can")
                    .shutdown(move |_| {
                        let recorder = Arc::clone(&recorder);
                        Box::pin(async move {
                            recorder.stop_replay(None);
                            if recorder.mode() != canlink::recorder::RecorderMode::Idle {
                                recorder.stop_recording()?;
                            }
                            Ok(())
                        })
                    }),
            )?;
        }
        registry.register(
            ServiceSpec::new("diagnostic_registry", provide(Arc::clone(&self.diagnostics)))
                .requires("protocol_codec")
                .classification(SafetyClassification::Informational)
                .tag("can"),
        )?;
        registry.register(
            ServiceSpec::new("entity_manager", provide(Arc::clone(&self.entities)))
                .requires("config_provider")
                .requires("entity_repository")
                .requires("protocol_codec")
                .classification(SafetyClassification::Critical)
                .emergency_action(EmergencyAction::MaintainPosition)
                .tag("entity"),
        )?;
        registry.register(
            ServiceSpec::new("security_orchestrator", provide(Arc::clone(&self.orchestrator)))
                .requires("security_audit_repository")
                .classification(SafetyClassification::SafetyRelated)
                .tag("security"),
        )?;
        registry.register(
            ServiceSpec::new("entity_control", provide(Arc::clone(&self.control)))
                .requires("entity_manager")
                .requires("can_interface")
                .requires("safety_service")
                .classification(SafetyClassification::Critical)
                .emergency_action(EmergencyAction::StopImmediately)
                .tag("entity"),
        )?;
        {
            let safety = Arc::clone(&self.safety);
            registry.register(
                ServiceSpec::new("safety_service", provide(Arc::clone(&self.safety)))
                    .requires("security_audit_repository")
                    .optional("security_orchestrator")
                    .classification(SafetyClassification::Critical)
                    .emergency_action(EmergencyAction::ContinueOperation)
                    .tag("safety")
                    .health(move |_| !safety.watchdog_status().degraded),
            )?;
        }
        Ok(())
    }

    /// Bring the platform up: start the registry, then the long-running
    /// tasks. Fails when a CRITICAL service did not reach HEALTHY.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> CoreResult<HealthReport> {
        let report = self.registry.startup_all().await;
        let failed = report.failed_critical();
        if !failed.is_empty() {
            return Err(CoreError::unavailable(format!(
                "critical services failed at startup: {}",
                failed.join(", ")
            )));
        }

        self.facade.start(cancel.clone())?;
        self.facade.recorder().spawn_autosave(cancel.clone());
        self.control.spawn_reconciler(cancel.clone());
        self.safety.spawn_monitor(cancel.clone());
        self.spawn_entity_pipeline(cancel.clone());
        self.spawn_anomaly_bridge(cancel.clone());
        self.spawn_injection_audit_pump(cancel);
        Ok(report)
    }

    /// Bridge decoded bus traffic into the entity layer: chassis frames
    /// feed the interlocks, entity updates reconcile pending commands.
    pub fn spawn_entity_pipeline(self: &Arc<Self>, cancel: CancellationToken) {
        let platform = Arc::clone(self);
        let mut decoded = self.facade.subscribe_decoded();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = decoded.recv() => match frame {
                        Ok(frame) => frame,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("entity pipeline lagged by {n} frames");
                            continue;
                        }
                        Err(_) => break,
                    },
                };
                platform.interlocks.observe(&frame);
                platform.diagnostics.observe(&frame);
                if let Some(update) = platform.entities.apply_decoded(&frame) {
                    platform.control.on_entity_update(&update);
                    let snapshot = crate::repository::entity::StateSnapshot {
                        entity_id: update.entity_id.clone(),
                        state: update.state.clone(),
                        timestamp_ms: update.timestamp_ms,
                    };
                    if let Err(e) = platform.entity_repo.record_state(snapshot) {
                        tracing::debug!(err = %e, "state snapshot rejected");
                    }
                }
            }
        });
    }

    /// Bridge anomaly detections into the domain event bus and the
    /// audit trail so the safety and security layers see them.
    fn spawn_anomaly_bridge(self: &Arc<Self>, cancel: CancellationToken) {
        let platform = Arc::clone(self);
        let mut anomalies = self.facade.anomaly().subscribe();
        tokio::spawn(async move {
            loop {
                let anomaly: Anomaly = tokio::select! {
                    _ = cancel.cancelled() => break,
                    anomaly = anomalies.recv() => match anomaly {
                        Ok(anomaly) => anomaly,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("anomaly bridge lagged by {n} events");
                            continue;
                        }
                        Err(_) => break,
                    },
                };
                let severity = match anomaly.severity {
                    AnomalySeverity::Info => crate::security::ThreatSeverity::Low,
                    AnomalySeverity::Warning => crate::security::ThreatSeverity::Medium,
                    AnomalySeverity::Critical => crate::security::ThreatSeverity::High,
                };
                platform.audit.append(
                    AuditKind::Anomaly,
                    None,
                    serde_json::json!({
                        "kind": anomaly.kind.as_str(),
                        "severity": anomaly.severity.as_str(),
                        "interface": anomaly.interface,
                        "can_id": anomaly.can_id,
                        "detail": anomaly.detail,
                    }),
                    anomaly.severity == AnomalySeverity::Critical,
                );
                platform.events.publish(crate::events::DomainEvent::AnomalyDetected {
                    kind: anomaly.kind.as_str().to_owned(),
                    severity,
                    can_id: anomaly.can_id,
                    interface: anomaly.interface,
                    detail: anomaly.detail,
                });
            }
        });
    }

    /// Forward injector audit records into the audit repository.
    fn spawn_injection_audit_pump(self: &Arc<Self>, cancel: CancellationToken) {
        let Some(mut rx) = self.injection_audit_rx.lock().take() else {
            return;
        };
        let platform = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = cancel.cancelled() => break,
                    record = rx.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                platform.audit.append(
                    AuditKind::Injection,
                    Some(record.principal.clone()),
                    serde_json::json!({
                        "task_id": record.task_id,
                        "interface": record.interface,
                        "can_id": record.can_id,
                        "allowed": record.allowed,
                        "detail": record.detail,
                        "reason": record.reason,
                        "warnings": record.warnings,
                    }),
                    !record.allowed,
                );
            }
        });
    }

    /// Build the login/refresh surface for the HTTP collaborator.
    ///
    /// Credential verification is deployment-provided; lockout policy
    /// follows the security config (lock on the attempt after the
    /// suspicious-login threshold).
    pub fn session_service(
        &self,
        verifier: crate::security::auth::CredentialVerifier,
    ) -> crate::security::SessionService {
        let lockout = Arc::new(crate::security::LockoutService::new(
            6,
            std::time::Duration::from_secs(15 * 60),
            self.coach.pin_policy.lockout_duration(),
            self.coach.pin_policy.progressive_lockout,
        ));
        crate::security::SessionService::new(
            Arc::clone(&self.auth_repo),
            Arc::clone(&self.orchestrator),
            lockout,
            verifier,
            default_session_scopes(),
        )
    }

    /// Stop everything in reverse dependency order.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}

/// Run the daemon until shutdown.
///
/// Physical transport binding is deployment-specific; this entry point
/// expects the embedder's transports (SocketCAN or otherwise) already
/// bound to the configured interface names.
pub async fn run(
    daemon: DaemonConfig,
    transports: Vec<Box<dyn BusTransport>>,
) -> anyhow::Result<()> {
    let coach = CoachConfig::load(&daemon.config)?;
    let cancel = CancellationToken::new();

    let platform = Platform::build(&daemon, coach, transports)?;
    let report = platform.start(cancel.clone()).await?;
    tracing::info!(
        services = report.services.len(),
        entities = platform.entities.len(),
        "coachd up"
    );

    let shutdown_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            shutdown_signal.cancel();
        }
    });

    cancel.cancelled().await;
    platform.shutdown().await;
    Ok(())
}

/// Scopes granted to sessions issued by the default login flow.
pub fn default_session_scopes() -> HashSet<String> {
    [crate::entity::control::CONTROL_SCOPE.to_owned(), "entity:read".to_owned()]
        .into_iter()
        .collect()
}
