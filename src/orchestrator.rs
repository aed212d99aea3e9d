//! Top level discovery state machine.
//!
//! The orchestrator owns both discovery engines and the address resolution
//! coordinator. It is the only writer of [`DiscoveryState`]; engines and the
//! platform talk to it exclusively through [`Signal`]s.

use crate::config::DiscoveryConfig;
use crate::engine::{
    required_capability, AssistanceRadio, DiscoveryEngine, EngineContext, EngineFactory,
    PeerListEntry, Platform, Signal, SignalSink, Transport,
};
use crate::error::Result;
use crate::events::{EventQueue, HostEvent};
use crate::peer::{DiscoveryMethod, HardwareAddress, PeerIdentity};
use crate::protocol::RequestId;
use crate::registry::PeerRegistry;
use crate::resolution::{AddressResolutionCoordinator, Resolution};
use crate::state::{DiscoveryState, EngineStatus, Observable, OrchestratorState};
use crate::storage::SettingsStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MAX_DISCOVERABLE: Duration = Duration::from_secs(3600);
const DEFAULT_DISCOVERABLE: Duration = Duration::from_secs(120);

/// External collaborators the orchestrator is built with.
pub struct Collaborators {
    pub beacon: Arc<dyn EngineFactory>,
    pub session: Arc<dyn EngineFactory>,
    pub platform: Arc<dyn Platform>,
    pub radio: Box<dyn AssistanceRadio>,
    pub store: Arc<dyn SettingsStore>,
}

struct Inner {
    config: DiscoveryConfig,
    state: DiscoveryState,
    local: PeerIdentity,
    own_address: Option<HardwareAddress>,
    beacon: Option<Box<dyn DiscoveryEngine>>,
    session: Option<Box<dyn DiscoveryEngine>>,
    resolution: AddressResolutionCoordinator,
    discoverable_until: Option<Instant>,
}

impl Inner {
    fn engine(&self, transport: Transport) -> Option<&dyn DiscoveryEngine> {
        match transport {
            Transport::Beacon => self.beacon.as_deref(),
            Transport::Session => self.session.as_deref(),
        }
    }

    fn engine_slot(&mut self, transport: Transport) -> &mut Option<Box<dyn DiscoveryEngine>> {
        match transport {
            Transport::Beacon => &mut self.beacon,
            Transport::Session => &mut self.session,
        }
    }

    fn set_status(&mut self, transport: Transport, status: EngineStatus) {
        match transport {
            Transport::Beacon => self.state.beacon_status = status,
            Transport::Session => self.state.session_status = status,
        }
    }

    fn refresh_statuses(&mut self) {
        for transport in [Transport::Beacon, Transport::Session] {
            let status = self
                .engine(transport)
                .map(|engine| engine.status())
                .unwrap_or(EngineStatus::IDLE);
            self.set_status(transport, status);
        }
    }

    fn observable(&self) -> Observable {
        let beacon = self.state.beacon_status;
        let session = self.state.session_status;
        Observable {
            state: self.state.current,
            is_discovering: beacon.scanning || session.scanning,
            is_advertising: beacon.advertising || session.advertising,
        }
    }

    fn stop_engine(&mut self, transport: Transport) {
        if let Some(mut engine) = self.engine_slot(transport).take() {
            tracing::debug!(%transport, "Stopping engine");
            engine.stop();
        }
        self.set_status(transport, EngineStatus::IDLE);
    }
}

/// State for a single running transport.
fn running_state(transport: Transport, own_address_known: bool) -> OrchestratorState {
    match transport {
        Transport::Beacon if own_address_known => OrchestratorState::RunningBeacon,
        Transport::Beacon => OrchestratorState::WaitingForOwnAddress,
        Transport::Session => OrchestratorState::RunningSession,
    }
}

pub struct DiscoveryOrchestrator {
    inner: Mutex<Inner>,
    registry: Arc<PeerRegistry>,
    events: EventQueue,
    sink: SignalSink,
    beacon_factory: Arc<dyn EngineFactory>,
    session_factory: Arc<dyn EngineFactory>,
    platform: Arc<dyn Platform>,
}

impl DiscoveryOrchestrator {
    /// `local` is our own identity. Its hardware address is replaced by the
    /// configured or persisted one, or by the unknown sentinel.
    pub fn new(
        config: DiscoveryConfig,
        mut local: PeerIdentity,
        collaborators: Collaborators,
        events: EventQueue,
        sink: SignalSink,
    ) -> Self {
        let Collaborators {
            beacon,
            session,
            platform,
            radio,
            store,
        } = collaborators;

        let own_address = config
            .own_address
            .clone()
            .or_else(|| store.load_own_address())
            .filter(|address| address.is_valid());
        local.hardware_address = Some(own_address.clone().unwrap_or_else(HardwareAddress::unknown));
        if local.service_type.is_empty() {
            local.service_type = config.session.service_type.clone();
        }

        match &own_address {
            Some(address) => tracing::info!(%address, "Own hardware address known"),
            None => tracing::info!("Own hardware address unknown"),
        }

        let registry = Arc::new(PeerRegistry::new(config.peer_expiration(), events.clone()));
        let resolution = AddressResolutionCoordinator::new(
            radio,
            store,
            events.clone(),
            config.automate_address_resolution,
            config.assistance_timeout(),
        );

        Self {
            inner: Mutex::new(Inner {
                config,
                state: DiscoveryState::default(),
                local,
                own_address,
                beacon: None,
                session: None,
                resolution,
                discoverable_until: None,
            }),
            registry,
            events,
            sink,
            beacon_factory: beacon,
            session_factory: session,
            platform,
        }
    }

    /// Starts whatever the discovery mode allows. Returns whether anything runs.
    pub fn start(&self, want_discovery: bool, want_advertising: bool) -> bool {
        tracing::info!(want_discovery, want_advertising, "Starting discovery");
        let mut inner = self.inner.lock();
        inner.state.should_be_scanning = want_discovery;
        inner.state.should_be_advertising = want_advertising;
        self.start_locked(&mut inner)
    }

    /// Stops everything and forgets all peers.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        self.stop_locked(&mut inner);
    }

    /// Tears engines and assistance sessions down without telling the host.
    pub fn stop_for_restart(&self) {
        let mut inner = self.inner.lock();
        Self::stop_for_restart_locked(&mut inner);
    }

    pub fn stop_discovery(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.state.should_be_scanning = false;
        for engine in [inner.beacon.as_mut(), inner.session.as_mut()].into_iter().flatten() {
            engine.stop_scanning();
        }
        self.settle_after_partial_stop(inner);
    }

    pub fn stop_advertising(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.state.should_be_advertising = false;
        for engine in [inner.beacon.as_mut(), inner.session.as_mut()].into_iter().flatten() {
            engine.stop_advertising();
        }
        self.settle_after_partial_stop(inner);
    }

    pub fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::EngineStatusChanged { transport, status } => {
                let mut inner = self.inner.lock();
                if inner.engine(transport).is_none() {
                    tracing::debug!(%transport, "Status from a torn down engine, ignoring");
                    return;
                }
                inner.set_status(transport, status);
                self.notify_if_changed(&mut inner);
            }
            Signal::PeerDiscovered(identity) => self.record_peer(identity),
            Signal::PeerListChanged(entries) => self.record_peer_list(entries),
            Signal::AssistanceRequested(request_id) => {
                let mut inner = self.inner.lock();
                let outcome = inner
                    .resolution
                    .on_assistance_requested(request_id, Instant::now());
                self.apply_resolution(&mut inner, outcome);
            }
            Signal::HelperReady(request_id) => {
                let mut inner = self.inner.lock();
                let beacon_present = inner.beacon.is_some();
                let outcome = inner
                    .resolution
                    .on_helper_ready(request_id, beacon_present, Instant::now());
                self.apply_resolution(&mut inner, outcome);
            }
            Signal::AssistanceFinished {
                request_id,
                completed,
            } => {
                let mut inner = self.inner.lock();
                let outcome = inner
                    .resolution
                    .on_assistance_finished(request_id, completed);
                self.apply_resolution(&mut inner, outcome);
            }
            Signal::AddressAnswerObserved {
                request_id,
                address,
            } => {
                let mut inner = self.inner.lock();
                let outcome = inner.resolution.on_answer(request_id, &address);
                self.apply_resolution(&mut inner, outcome);
            }
            Signal::TransportToggled { transport, enabled } => {
                self.on_transport_toggled(transport, enabled)
            }
            Signal::ConfigChanged(config) => {
                if let Err(e) = self.apply_config(*config) {
                    tracing::warn!("Rejected config change: {}", e);
                }
            }
        }
    }

    pub fn apply_config(&self, config: DiscoveryConfig) -> Result<()> {
        config.validate()?;
        let mut inner = self.inner.lock();
        let old = std::mem::replace(&mut inner.config, config.clone());

        if old.peer_expiration_ms != config.peer_expiration_ms {
            self.registry.set_expiration(config.peer_expiration());
        }
        inner.resolution.set_automate(config.automate_address_resolution);
        inner.resolution.set_timeout(config.assistance_timeout());

        if old.beacon != config.beacon {
            if let Some(engine) = inner.beacon.as_mut() {
                engine.apply_beacon_settings(&config.beacon);
            }
        }

        let needs_restart =
            old.discovery_mode != config.discovery_mode || old.session != config.session;
        if needs_restart && inner.state.current.is_running() {
            tracing::info!(mode = ?config.discovery_mode, "Discovery settings changed, restarting");
            self.restart_locked(&mut inner);
        }
        Ok(())
    }

    /// Asks the platform to make this device discoverable. A new request is
    /// only issued once the previously requested window is over.
    pub fn make_discoverable(&self, duration: Duration) -> bool {
        let duration = if duration > MAX_DISCOVERABLE {
            DEFAULT_DISCOVERABLE
        } else {
            duration
        };

        let mut inner = self.inner.lock();
        let now = Instant::now();
        if let Some(until) = inner.discoverable_until {
            if now < until {
                tracing::debug!("Already discoverable, not asking again");
                return false;
            }
        }

        tracing::info!(?duration, "Making device discoverable");
        self.platform.make_discoverable(duration);
        inner.discoverable_until = Some(now + duration);
        true
    }

    /// A peer connected to us and identified itself.
    pub fn on_incoming_handshake(&self, identity: PeerIdentity) {
        self.record_peer(identity.with_discovery_method(DiscoveryMethod::IncomingHandshake));
    }

    pub fn tick(&self) {
        self.tick_at(Instant::now());
    }

    /// Sweeps expired peers and gives up on stalled assistance sessions.
    pub fn tick_at(&self, now: Instant) {
        self.registry.sweep_expired_at(now);

        let mut inner = self.inner.lock();
        let outcome = inner.resolution.tick(now);
        self.apply_resolution(&mut inner, outcome);
    }

    pub fn spawn_maintenance(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => orchestrator.tick(),
                }
            }
        })
    }

    /// Feeds engine and platform signals into [`Self::handle_signal`] until
    /// every sender is gone.
    pub fn spawn_signal_pump(
        self: &Arc<Self>,
        mut signals: mpsc::UnboundedReceiver<Signal>,
    ) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                orchestrator.handle_signal(signal);
            }
            tracing::debug!("Signal channel closed");
        })
    }

    pub fn state(&self) -> OrchestratorState {
        self.inner.lock().state.current
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn is_discovering(&self) -> bool {
        self.inner.lock().observable().is_discovering
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.lock().observable().is_advertising
    }

    pub fn missing_permission(&self) -> Option<String> {
        self.inner.lock().state.missing_permission.clone()
    }

    pub fn own_address(&self) -> Option<HardwareAddress> {
        self.inner.lock().own_address.clone()
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.inner.lock().local.clone()
    }

    pub fn pending_request_id(&self) -> RequestId {
        self.inner.lock().resolution.request_id()
    }

    pub fn config(&self) -> DiscoveryConfig {
        self.inner.lock().config.clone()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Sender for platform code that reports toggles and config changes.
    pub fn signal_sink(&self) -> SignalSink {
        self.sink.clone()
    }

    fn start_locked(&self, inner: &mut Inner) -> bool {
        if !inner.state.wants_anything() {
            tracing::info!("Neither discovery nor advertising requested");
            self.set_state(inner, OrchestratorState::NotStarted);
            return false;
        }

        let mode = inner.config.discovery_mode;
        let beacon_started = mode.uses_beacon() && self.start_engine(inner, Transport::Beacon);
        let session_started = mode.uses_session() && self.start_engine(inner, Transport::Session);

        if beacon_started && inner.own_address.is_none() {
            inner.resolution.arm_responder();
        }

        let next = match (beacon_started, session_started) {
            (true, true) => OrchestratorState::RunningBeaconAndSession,
            (true, false) if inner.own_address.is_none() => OrchestratorState::WaitingForOwnAddress,
            (true, false) => OrchestratorState::RunningBeacon,
            (false, true) => OrchestratorState::RunningSession,
            (false, false) => {
                tracing::warn!(?mode, "Failed to start any discovery engine");
                OrchestratorState::NotStarted
            }
        };

        inner.refresh_statuses();
        self.set_state(inner, next);
        next.is_running()
    }

    fn start_engine(&self, inner: &mut Inner, transport: Transport) -> bool {
        if !self.platform.is_enabled(transport) {
            tracing::info!(%transport, "Transport is switched off, not starting");
            return false;
        }

        let capability = required_capability(transport);
        if !self.platform.check_permission(capability) {
            tracing::warn!(%transport, capability, "Permission denied");
            inner.state.missing_permission = Some(capability.to_string());
            self.events.emit(HostEvent::PermissionDenied {
                transport,
                capability: capability.to_string(),
            });
            return false;
        }

        let scan = inner.state.should_be_scanning;
        let advertise = inner.state.should_be_advertising;
        let context = EngineContext {
            sink: self.sink.clone(),
            local: inner.local.clone(),
            request_id: inner.resolution.request_id(),
            beacon: inner.config.beacon.clone(),
        };
        let factory = match transport {
            Transport::Beacon => &self.beacon_factory,
            Transport::Session => &self.session_factory,
        };

        let slot = inner.engine_slot(transport);
        if slot.is_none() {
            match factory.create(context) {
                Ok(engine) => *slot = Some(engine),
                Err(e) => {
                    tracing::warn!(%transport, "Failed to create engine: {}", e);
                    return false;
                }
            }
        }
        let Some(engine) = slot.as_mut() else {
            return false;
        };

        match engine.start(scan, advertise) {
            Ok(()) => {
                tracing::info!(%transport, scan, advertise, "Engine started");
                true
            }
            Err(e) => {
                tracing::warn!(%transport, "Failed to start engine: {}", e);
                // A half started engine must not count as running.
                inner.stop_engine(transport);
                false
            }
        }
    }

    fn stop_locked(&self, inner: &mut Inner) {
        tracing::info!("Stopping discovery");
        inner.state.should_be_scanning = false;
        inner.state.should_be_advertising = false;
        Self::stop_for_restart_locked(inner);
        self.registry.clear();
        self.set_state(inner, OrchestratorState::NotStarted);
    }

    fn stop_for_restart_locked(inner: &mut Inner) {
        inner.stop_engine(Transport::Beacon);
        inner.stop_engine(Transport::Session);
        inner.resolution.stop_all();
    }

    fn restart_locked(&self, inner: &mut Inner) {
        Self::stop_for_restart_locked(inner);
        if inner.state.wants_anything() {
            self.start_locked(inner);
        } else {
            self.set_state(inner, OrchestratorState::NotStarted);
        }
    }

    fn settle_after_partial_stop(&self, inner: &mut Inner) {
        if inner.state.wants_anything() {
            inner.refresh_statuses();
            self.notify_if_changed(inner);
        } else {
            self.stop_locked(inner);
        }
    }

    fn on_transport_toggled(&self, transport: Transport, enabled: bool) {
        tracing::info!(%transport, enabled, "Transport toggled");
        let mut inner = self.inner.lock();
        let mode = inner.config.discovery_mode;

        if !mode.uses(transport) {
            tracing::debug!(%transport, ?mode, "Transport not used by the discovery mode");
        } else if enabled {
            let responder_busy =
                transport == Transport::Beacon && inner.resolution.is_responder_armed();
            if inner.state.wants_anything() && !responder_busy {
                self.start_locked(&mut inner);
            }
        } else if inner.state.current != OrchestratorState::WaitingForTransport
            && inner.state.current != OrchestratorState::NotStarted
        {
            inner.stop_engine(transport);
            if transport == Transport::Beacon {
                inner.resolution.stop_all();
            }

            let other = transport.other();
            let other_running = inner
                .engine(other)
                .is_some_and(|engine| !engine.status().is_idle());

            let next = if !mode.uses(other) || !self.platform.is_enabled(other) {
                OrchestratorState::WaitingForTransport
            } else if other_running {
                running_state(other, inner.own_address.is_some())
            } else {
                OrchestratorState::WaitingForTransport
            };
            self.set_state(&mut inner, next);
        }

        self.events
            .emit(HostEvent::TransportEnabledChanged { transport, enabled });
    }

    fn apply_resolution(&self, inner: &mut Inner, outcome: Resolution) {
        match outcome {
            Resolution::Nothing => {}
            Resolution::Assisting => {
                // The radio is busy helping; our own beacon activity pauses.
                inner.stop_engine(Transport::Beacon);
                self.set_state(inner, OrchestratorState::AssistingPeerAddressResolution);
            }
            Resolution::Receiving => {
                if let Some(engine) = inner.beacon.as_mut() {
                    engine.stop_scanning();
                }
                inner.refresh_statuses();
                self.notify_if_changed(inner);
            }
            Resolution::Resolved(address) => {
                inner.local.hardware_address = Some(address.clone());
                inner.own_address = Some(address);
                self.restart_locked(inner);
            }
            Resolution::Finished => self.restart_locked(inner),
        }
    }

    fn record_peer(&self, identity: PeerIdentity) {
        let own = self.inner.lock().own_address.clone();
        if own.is_some() && identity.known_address() == own.as_ref() {
            tracing::trace!("Ignoring our own advertisement");
            return;
        }
        self.registry.add_or_update(identity);
    }

    fn record_peer_list(&self, entries: Vec<PeerListEntry>) {
        for entry in entries {
            let identity = match self.registry.get_by_secondary_address(&entry.secondary_address) {
                Some(mut known) => {
                    if !entry.name.is_empty() {
                        known.name = entry.name;
                    }
                    known
                }
                None => PeerIdentity {
                    name: entry.name,
                    secondary_address: entry.secondary_address,
                    discovery_method: DiscoveryMethod::SessionPeerList,
                    ..Default::default()
                },
            };
            self.registry.add_or_update(identity);
        }
    }

    fn set_state(&self, inner: &mut Inner, next: OrchestratorState) {
        if inner.state.current != next {
            tracing::info!(from = ?inner.state.current, to = ?next, "State changed");
        }
        inner.state.current = next;
        inner.refresh_statuses();
        self.notify_if_changed(inner);
    }

    fn notify_if_changed(&self, inner: &mut Inner) {
        let observable = inner.observable();
        if observable == inner.state.last_notified {
            return;
        }
        inner.state.last_notified = observable;
        self.events.emit(HostEvent::StateChanged {
            state: observable.state,
            is_discovering: observable.is_discovering,
            is_advertising: observable.is_advertising,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiscoveryMode;
    use crate::resolution::tests::RecordingRadio;
    use crate::storage::MemoryStore;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeEngine {
        status: EngineStatus,
        fail_start: bool,
    }

    impl DiscoveryEngine for FakeEngine {
        fn start(&mut self, scan: bool, advertise: bool) -> Result<()> {
            if self.fail_start {
                return Err(crate::error::Error::Engine("radio busy".into()));
            }
            self.status.scanning |= scan;
            self.status.advertising |= advertise;
            Ok(())
        }
        fn stop_scanning(&mut self) {
            self.status.scanning = false;
        }
        fn stop_advertising(&mut self) {
            self.status.advertising = false;
        }
        fn status(&self) -> EngineStatus {
            self.status
        }
    }

    struct FakeFactory {
        fail_start: bool,
        created: Mutex<u32>,
    }

    impl FakeFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_start: false,
                created: Mutex::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail_start: true,
                created: Mutex::new(0),
            })
        }
    }

    impl EngineFactory for FakeFactory {
        fn create(&self, _context: EngineContext) -> Result<Box<dyn DiscoveryEngine>> {
            *self.created.lock() += 1;
            Ok(Box::new(FakeEngine {
                fail_start: self.fail_start,
                ..Default::default()
            }))
        }
    }

    #[derive(Default)]
    struct FakePlatform {
        disabled: Mutex<HashSet<Transport>>,
        denied: Mutex<HashSet<&'static str>>,
        discoverable: Mutex<Vec<Duration>>,
    }

    impl FakePlatform {
        fn set_enabled(&self, transport: Transport, enabled: bool) {
            let mut disabled = self.disabled.lock();
            if enabled {
                disabled.remove(&transport);
            } else {
                disabled.insert(transport);
            }
        }
    }

    impl Platform for FakePlatform {
        fn is_enabled(&self, transport: Transport) -> bool {
            !self.disabled.lock().contains(&transport)
        }
        fn check_permission(&self, capability: &str) -> bool {
            !self.denied.lock().contains(capability)
        }
        fn make_discoverable(&self, duration: Duration) {
            self.discoverable.lock().push(duration);
        }
    }

    struct Harness {
        orchestrator: DiscoveryOrchestrator,
        session: Arc<FakeFactory>,
        platform: Arc<FakePlatform>,
        radio: RecordingRadio,
        store: Arc<MemoryStore>,
        events: mpsc::UnboundedReceiver<HostEvent>,
    }

    impl Harness {
        fn drain(&mut self) -> Vec<HostEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn state_changes(&mut self) -> Vec<OrchestratorState> {
            self.drain()
                .into_iter()
                .filter_map(|event| match event {
                    HostEvent::StateChanged { state, .. } => Some(state),
                    _ => None,
                })
                .collect()
        }
    }

    fn own() -> HardwareAddress {
        HardwareAddress::parse("11:22:33:44:55:66").unwrap()
    }

    fn harness_with(
        mode: DiscoveryMode,
        store: MemoryStore,
        beacon: Arc<FakeFactory>,
        platform: FakePlatform,
    ) -> Harness {
        let config = DiscoveryConfig {
            discovery_mode: mode,
            ..Default::default()
        };
        let platform = Arc::new(platform);
        let radio = RecordingRadio::default();
        let store = Arc::new(store);
        let (events, rx) = EventQueue::unbounded();
        let (sink, _signals) = SignalSink::channel();
        let session = FakeFactory::new();

        let orchestrator = DiscoveryOrchestrator::new(
            config,
            PeerIdentity {
                name: "me".into(),
                ..Default::default()
            },
            Collaborators {
                beacon,
                session: session.clone(),
                platform: platform.clone(),
                radio: Box::new(radio.clone()),
                store: store.clone(),
            },
            events,
            sink,
        );

        Harness {
            orchestrator,
            session,
            platform,
            radio,
            store,
            events: rx,
        }
    }

    fn harness(mode: DiscoveryMode, store: MemoryStore) -> Harness {
        harness_with(
            mode,
            store,
            FakeFactory::new(),
            FakePlatform::default(),
        )
    }

    #[test]
    fn both_transports_run_together() {
        let mut h = harness(DiscoveryMode::BeaconAndSession, MemoryStore::with_address(own()));
        assert!(h.orchestrator.start(true, true));
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeaconAndSession);
        assert!(h.orchestrator.is_discovering());
        assert!(h.orchestrator.is_advertising());
        assert_eq!(h.state_changes(), vec![OrchestratorState::RunningBeaconAndSession]);
    }

    #[test]
    fn repeated_start_does_not_renotify() {
        let mut h = harness(DiscoveryMode::BeaconAndSession, MemoryStore::with_address(own()));
        h.orchestrator.start(true, true);
        h.drain();

        assert!(h.orchestrator.start(true, true));
        assert!(h.state_changes().is_empty());
    }

    #[test]
    fn beacon_without_own_address_waits_for_it() {
        let mut h = harness(DiscoveryMode::Beacon, MemoryStore::default());
        assert!(h.orchestrator.start(true, false));
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForOwnAddress);

        let request_id = h.orchestrator.pending_request_id();
        assert_eq!(
            h.radio.calls.lock().as_slice(),
            [format!("responder {request_id}")]
        );
        assert_eq!(h.state_changes(), vec![OrchestratorState::WaitingForOwnAddress]);
    }

    #[test]
    fn beacon_with_persisted_address_runs() {
        let h = harness(DiscoveryMode::Beacon, MemoryStore::with_address(own()));
        assert!(h.orchestrator.start(true, true));
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeacon);
        assert_eq!(h.orchestrator.own_address(), Some(own()));
        assert!(h.radio.calls.lock().is_empty());
    }

    #[test]
    fn switched_off_beacon_leaves_session_only() {
        let platform = FakePlatform::default();
        platform.set_enabled(Transport::Beacon, false);
        let h = harness_with(
            DiscoveryMode::BeaconAndSession,
            MemoryStore::default(),
            FakeFactory::new(),
            platform,
        );
        assert!(h.orchestrator.start(true, true));
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningSession);
    }

    #[test]
    fn nothing_started_is_reported_as_not_started() {
        let platform = FakePlatform::default();
        platform.denied.lock().insert(required_capability(Transport::Session));
        let mut h = harness_with(
            DiscoveryMode::BeaconAndSession,
            MemoryStore::default(),
            FakeFactory::failing(),
            platform,
        );

        assert!(!h.orchestrator.start(true, true));
        assert_eq!(h.orchestrator.state(), OrchestratorState::NotStarted);
        assert_eq!(
            h.orchestrator.missing_permission().as_deref(),
            Some(required_capability(Transport::Session))
        );

        let events = h.drain();
        assert!(events.iter().any(|event| matches!(
            event,
            HostEvent::PermissionDenied { transport: Transport::Session, .. }
        )));
        // Already NotStarted, nothing observable changed.
        assert!(!events.iter().any(|event| matches!(event, HostEvent::StateChanged { .. })));
    }

    #[test]
    fn losing_one_transport_downgrades() {
        let mut h = harness(DiscoveryMode::BeaconAndSession, MemoryStore::with_address(own()));
        h.orchestrator.start(true, true);
        h.drain();

        h.platform.set_enabled(Transport::Session, false);
        h.orchestrator.handle_signal(Signal::TransportToggled {
            transport: Transport::Session,
            enabled: false,
        });

        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeacon);
        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [
                HostEvent::StateChanged {
                    state: OrchestratorState::RunningBeacon,
                    ..
                },
                HostEvent::TransportEnabledChanged {
                    transport: Transport::Session,
                    enabled: false
                }
            ]
        ));
    }

    #[test]
    fn single_transport_mode_waits_and_resumes() {
        let mut h = harness(DiscoveryMode::Session, MemoryStore::default());
        h.orchestrator.start(true, true);

        h.platform.set_enabled(Transport::Session, false);
        h.orchestrator.handle_signal(Signal::TransportToggled {
            transport: Transport::Session,
            enabled: false,
        });
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForTransport);
        assert!(!h.orchestrator.is_running());

        h.platform.set_enabled(Transport::Session, true);
        h.orchestrator.handle_signal(Signal::TransportToggled {
            transport: Transport::Session,
            enabled: true,
        });
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningSession);
        assert_eq!(
            h.state_changes(),
            vec![
                OrchestratorState::RunningSession,
                OrchestratorState::WaitingForTransport,
                OrchestratorState::RunningSession
            ]
        );
    }

    #[test]
    fn stop_clears_peers_silently() {
        let mut h = harness(DiscoveryMode::Session, MemoryStore::default());
        h.orchestrator.start(true, true);
        h.orchestrator.handle_signal(Signal::PeerDiscovered(PeerIdentity::new(
            "peer",
            HardwareAddress::parse("AA:BB:CC:DD:EE:FF").unwrap(),
        )));
        assert_eq!(h.orchestrator.registry().len(), 1);
        h.drain();

        h.orchestrator.stop();
        assert!(h.orchestrator.registry().is_empty());
        assert_eq!(h.orchestrator.state(), OrchestratorState::NotStarted);
        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            HostEvent::StateChanged {
                state: OrchestratorState::NotStarted,
                is_discovering: false,
                is_advertising: false
            }
        ));
    }

    #[test]
    fn stopping_last_activity_stops_everything() {
        let h = harness(DiscoveryMode::Session, MemoryStore::default());
        h.orchestrator.start(true, true);

        h.orchestrator.stop_discovery();
        assert!(!h.orchestrator.is_discovering());
        assert!(h.orchestrator.is_advertising());
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningSession);

        h.orchestrator.stop_advertising();
        assert_eq!(h.orchestrator.state(), OrchestratorState::NotStarted);
    }

    #[test]
    fn helping_a_peer_then_resuming() {
        let mut h = harness(DiscoveryMode::Beacon, MemoryStore::with_address(own()));
        h.orchestrator.start(true, true);
        let (served, other) = (RequestId::generate(), RequestId::generate());

        h.orchestrator.handle_signal(Signal::AssistanceRequested(served));
        assert_eq!(
            h.orchestrator.state(),
            OrchestratorState::AssistingPeerAddressResolution
        );

        h.orchestrator.handle_signal(Signal::AssistanceRequested(other));
        h.orchestrator.handle_signal(Signal::AssistanceFinished {
            request_id: other,
            completed: true,
        });
        assert_eq!(
            h.orchestrator.state(),
            OrchestratorState::AssistingPeerAddressResolution
        );

        h.orchestrator.handle_signal(Signal::AssistanceFinished {
            request_id: served,
            completed: true,
        });
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeacon);
        assert_eq!(
            h.state_changes(),
            vec![
                OrchestratorState::RunningBeacon,
                OrchestratorState::AssistingPeerAddressResolution,
                OrchestratorState::RunningBeacon
            ]
        );
    }

    #[test]
    fn resolved_address_is_persisted_and_discovery_restarts() {
        let mut h = harness(DiscoveryMode::Beacon, MemoryStore::default());
        h.orchestrator.start(true, false);
        let request_id = h.orchestrator.pending_request_id();

        h.orchestrator.handle_signal(Signal::HelperReady(request_id));
        h.orchestrator.handle_signal(Signal::AddressAnswerObserved {
            request_id: RequestId::generate(),
            address: "11:22:33:44:55:66".into(),
        });
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForOwnAddress);

        h.orchestrator.handle_signal(Signal::AddressAnswerObserved {
            request_id,
            address: "11:22:33:44:55:66".into(),
        });
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeacon);
        assert_eq!(h.orchestrator.own_address(), Some(own()));
        assert_eq!(h.store.load_own_address(), Some(own()));
        assert_eq!(
            h.orchestrator.local_identity().hardware_address,
            Some(own())
        );
        assert!(h
            .drain()
            .iter()
            .any(|event| matches!(event, HostEvent::OwnAddressResolved(a) if *a == own())));
    }

    #[test]
    fn peer_list_entries_fold_into_known_peers() {
        let h = harness(DiscoveryMode::Session, MemoryStore::default());
        h.orchestrator.handle_signal(Signal::PeerListChanged(vec![PeerListEntry {
            name: "tablet".into(),
            secondary_address: "10.0.0.9:4000".into(),
        }]));
        let listed = h
            .orchestrator
            .registry()
            .get_by_secondary_address("10.0.0.9:4000")
            .unwrap();
        assert_eq!(listed.discovery_method, DiscoveryMethod::SessionPeerList);

        let mut handshake = PeerIdentity::new("tablet", HardwareAddress::parse("AA:BB:CC:DD:EE:FF").unwrap());
        handshake.secondary_address = "10.0.0.9:4000".into();
        h.orchestrator.on_incoming_handshake(handshake);

        assert_eq!(h.orchestrator.registry().len(), 1);
        let peer = h
            .orchestrator
            .registry()
            .get_by_secondary_address("10.0.0.9:4000")
            .unwrap();
        assert_eq!(peer.discovery_method, DiscoveryMethod::IncomingHandshake);
        assert!(peer.known_address().is_some());
    }

    #[test]
    fn own_advertisement_is_not_a_peer() {
        let h = harness(DiscoveryMode::Beacon, MemoryStore::with_address(own()));
        h.orchestrator
            .handle_signal(Signal::PeerDiscovered(PeerIdentity::new("me", own())));
        assert!(h.orchestrator.registry().is_empty());
    }

    #[test]
    fn discoverability_is_rate_limited_and_clamped() {
        let h = harness(DiscoveryMode::Beacon, MemoryStore::default());
        assert!(h.orchestrator.make_discoverable(Duration::from_secs(7200)));
        assert!(!h.orchestrator.make_discoverable(Duration::from_secs(10)));
        assert_eq!(
            h.platform.discoverable.lock().as_slice(),
            [DEFAULT_DISCOVERABLE]
        );
    }

    #[test]
    fn mode_change_restarts_running_discovery() {
        let h = harness(DiscoveryMode::Session, MemoryStore::with_address(own()));
        h.orchestrator.start(true, true);

        let config = DiscoveryConfig {
            discovery_mode: DiscoveryMode::BeaconAndSession,
            peer_expiration_ms: 5_000,
            ..Default::default()
        };
        h.orchestrator.apply_config(config).unwrap();

        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeaconAndSession);
        assert_eq!(h.orchestrator.registry().expiration(), Duration::from_secs(5));
    }

    #[test]
    fn stalled_assistance_times_out_on_tick() {
        let h = harness(DiscoveryMode::Beacon, MemoryStore::with_address(own()));
        h.orchestrator.start(true, true);
        h.orchestrator
            .handle_signal(Signal::AssistanceRequested(RequestId::generate()));

        h.orchestrator.tick_at(Instant::now() + Duration::from_secs(31));
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeacon);
    }

    fn toggle(h: &Harness, transport: Transport, enabled: bool) {
        h.platform.set_enabled(transport, enabled);
        h.orchestrator
            .handle_signal(Signal::TransportToggled { transport, enabled });
    }

    #[test]
    fn start_follows_the_state_table() {
        use DiscoveryMode::*;
        use OrchestratorState::*;

        let cases: &[(DiscoveryMode, bool, &[Transport], OrchestratorState)] = &[
            (BeaconAndSession, true, &[], RunningBeaconAndSession),
            (BeaconAndSession, false, &[], RunningBeaconAndSession),
            (BeaconAndSession, false, &[Transport::Beacon], RunningSession),
            (BeaconAndSession, true, &[Transport::Session], RunningBeacon),
            (BeaconAndSession, false, &[Transport::Session], WaitingForOwnAddress),
            (BeaconAndSession, true, &[Transport::Beacon, Transport::Session], NotStarted),
            (Beacon, true, &[], RunningBeacon),
            (Beacon, false, &[], WaitingForOwnAddress),
            (Beacon, true, &[Transport::Beacon], NotStarted),
            (Session, false, &[], RunningSession),
            (Session, true, &[Transport::Session], NotStarted),
        ];

        for &(mode, address_known, disabled, expected) in cases {
            let platform = FakePlatform::default();
            for &transport in disabled {
                platform.set_enabled(transport, false);
            }
            let store = if address_known {
                MemoryStore::with_address(own())
            } else {
                MemoryStore::default()
            };
            let h = harness_with(mode, store, FakeFactory::new(), platform);

            let running = h.orchestrator.start(true, true);
            assert_eq!(
                h.orchestrator.state(),
                expected,
                "{mode:?}, address known: {address_known}, disabled: {disabled:?}"
            );
            assert_eq!(running, expected.is_running());
        }
    }

    #[test]
    fn toggling_a_transport_the_mode_ignores_changes_nothing() {
        let mut h = harness(DiscoveryMode::Beacon, MemoryStore::default());
        h.orchestrator.start(true, false);
        h.drain();

        toggle(&h, Transport::Session, false);
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForOwnAddress);
        toggle(&h, Transport::Session, true);
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForOwnAddress);
        assert_eq!(*h.session.created.lock(), 0);

        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [
                HostEvent::TransportEnabledChanged {
                    transport: Transport::Session,
                    enabled: false
                },
                HostEvent::TransportEnabledChanged {
                    transport: Transport::Session,
                    enabled: true
                }
            ]
        ));
    }

    #[test]
    fn engine_that_failed_to_start_is_not_a_fallback() {
        let h = harness_with(
            DiscoveryMode::BeaconAndSession,
            MemoryStore::with_address(own()),
            FakeFactory::failing(),
            FakePlatform::default(),
        );
        assert!(h.orchestrator.start(true, true));
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningSession);

        toggle(&h, Transport::Session, false);
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForTransport);
        assert!(!h.orchestrator.is_running());
        assert!(!h.orchestrator.is_discovering());
        assert!(!h.orchestrator.is_advertising());
    }

    #[test]
    fn downgrade_to_beacon_without_address_waits_for_it() {
        let h = harness(DiscoveryMode::BeaconAndSession, MemoryStore::default());
        h.orchestrator.start(true, true);
        assert_eq!(h.orchestrator.state(), OrchestratorState::RunningBeaconAndSession);

        toggle(&h, Transport::Session, false);
        assert_eq!(h.orchestrator.state(), OrchestratorState::WaitingForOwnAddress);
        assert!(h.orchestrator.is_running());
    }
}
