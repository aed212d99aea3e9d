//! In-memory set of known peers.
//!
//! The registry owns every [`PeerIdentity`] it tracks and only hands out
//! clones. Notifications are enqueued on the host event queue while the
//! mutation is in progress, so they keep mutation order, but they are
//! delivered by the queue worker and never run under the registry lock.

use crate::events::{EventQueue, HostEvent};
use crate::peer::{merge_missing_fields, HardwareAddress, PeerIdentity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PeerKey {
    Hardware(HardwareAddress),
    /// Peer-list sightings that don't carry a hardware address yet.
    Secondary(String),
}

struct Entry {
    identity: PeerIdentity,
    last_seen: Instant,
}

/// Result of one [`PeerRegistry::add_or_update`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryChange {
    Added,
    Updated,
    Unchanged,
    /// Neither a hardware nor a secondary address, nothing to key on.
    Ignored,
}

struct Inner {
    entries: HashMap<PeerKey, Entry>,
    expiration: Duration,
}

pub struct PeerRegistry {
    inner: Mutex<Inner>,
    events: EventQueue,
}

impl PeerRegistry {
    pub fn new(expiration: Duration, events: EventQueue) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                expiration,
            }),
            events,
        }
    }

    pub fn add_or_update(&self, identity: PeerIdentity) -> RegistryChange {
        self.add_or_update_at(identity, Instant::now())
    }

    /// Inserts or merges `identity`, stamping it as seen at `now`.
    pub fn add_or_update_at(&self, mut identity: PeerIdentity, now: Instant) -> RegistryChange {
        let mut key = match identity.known_address() {
            Some(address) => PeerKey::Hardware(address.clone()),
            None if !identity.secondary_address.is_empty() => {
                PeerKey::Secondary(identity.secondary_address.clone())
            }
            None => {
                tracing::debug!(peer = %identity, "Ignoring peer without any address");
                return RegistryChange::Ignored;
            }
        };

        let mut inner = self.inner.lock();

        let mut folded = false;
        let mut previous = inner.entries.remove(&key);
        if previous.is_none() && !identity.secondary_address.is_empty() {
            match key {
                PeerKey::Hardware(_) => {
                    // First sighting with a hardware address of a peer we only
                    // knew from the peer list.
                    previous = inner
                        .entries
                        .remove(&PeerKey::Secondary(identity.secondary_address.clone()));
                    folded = previous.is_some();
                }
                PeerKey::Secondary(_) => {
                    // Address-less sighting of a peer already keyed by hardware.
                    let known = inner
                        .entries
                        .iter()
                        .find(|(k, entry)| {
                            matches!(k, PeerKey::Hardware(_))
                                && entry.identity.secondary_address == identity.secondary_address
                        })
                        .map(|(k, _)| k.clone());
                    if let Some(known) = known {
                        previous = inner.entries.remove(&known);
                        key = known;
                        identity.hardware_address = None;
                    }
                }
            }
        }

        match previous {
            Some(entry) => {
                let mut merged = identity;
                merged.merge_count = entry.identity.merge_count;
                merge_missing_fields(&entry.identity, &mut merged);

                let changed = folded || !merged.same_content(&entry.identity);
                if changed {
                    tracing::debug!(peer = %merged, "Peer updated");
                    self.events.emit(HostEvent::PeerUpdated(merged.clone()));
                }
                inner.entries.insert(
                    key,
                    Entry {
                        identity: merged,
                        last_seen: now,
                    },
                );

                if changed {
                    RegistryChange::Updated
                } else {
                    RegistryChange::Unchanged
                }
            }
            None => {
                tracing::info!(peer = %identity, "Peer discovered");
                self.events.emit(HostEvent::PeerDiscovered(identity.clone()));
                inner.entries.insert(
                    key,
                    Entry {
                        identity,
                        last_seen: now,
                    },
                );
                RegistryChange::Added
            }
        }
    }

    pub fn get_by_address(&self, address: &HardwareAddress) -> Option<PeerIdentity> {
        self.inner
            .lock()
            .entries
            .get(&PeerKey::Hardware(address.clone()))
            .map(|entry| entry.identity.clone())
    }

    pub fn get_by_secondary_address(&self, secondary_address: &str) -> Option<PeerIdentity> {
        self.inner
            .lock()
            .entries
            .values()
            .find(|entry| entry.identity.secondary_address == secondary_address)
            .map(|entry| entry.identity.clone())
    }

    pub fn peers(&self) -> Vec<PeerIdentity> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.identity.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expiration(&self) -> Duration {
        self.inner.lock().expiration
    }

    /// Takes effect on the next sweep.
    pub fn set_expiration(&self, expiration: Duration) {
        self.inner.lock().expiration = expiration;
    }

    pub fn sweep_expired(&self) -> Vec<PeerIdentity> {
        self.sweep_expired_at(Instant::now())
    }

    /// Removes every peer not seen for strictly longer than the expiration
    /// window and reports each one as lost.
    pub fn sweep_expired_at(&self, now: Instant) -> Vec<PeerIdentity> {
        let mut inner = self.inner.lock();
        let expiration = inner.expiration;

        let expired_keys: Vec<PeerKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_seen) > expiration)
            .map(|(key, _)| key.clone())
            .collect();

        let mut expired = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(entry) = inner.entries.remove(&key) {
                tracing::info!(peer = %entry.identity, "Peer expired");
                self.events.emit(HostEvent::PeerLost(entry.identity.clone()));
                expired.push(entry.identity);
            }
        }
        expired
    }

    /// Drops everything without per-peer events.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        if !inner.entries.is_empty() {
            tracing::debug!(count = inner.entries.len(), "Clearing peer registry");
        }
        inner.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::DiscoveryMethod;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn registry(expiration: Duration) -> (PeerRegistry, UnboundedReceiver<HostEvent>) {
        let (queue, rx) = EventQueue::unbounded();
        (PeerRegistry::new(expiration, queue), rx)
    }

    fn peer(name: &str, address: &str) -> PeerIdentity {
        PeerIdentity::new(name, HardwareAddress::parse(address).unwrap())
            .with_discovery_method(DiscoveryMethod::Beacon)
    }

    fn drain(rx: &mut UnboundedReceiver<HostEvent>) -> Vec<HostEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn repeated_identical_input_fires_added_once() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        let a = peer("A", "11:22:33:44:55:66");

        assert_eq!(registry.add_or_update(a.clone()), RegistryChange::Added);
        assert_eq!(registry.add_or_update(a.clone()), RegistryChange::Unchanged);
        assert_eq!(registry.add_or_update(a), RegistryChange::Unchanged);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], HostEvent::PeerDiscovered(_)));
    }

    #[test]
    fn update_fires_only_on_content_change_and_keeps_fields() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        let mut a = peer("A", "11:22:33:44:55:66");
        a.service_type = "svc".into();
        registry.add_or_update(a);

        let mut sparse = peer("A", "11:22:33:44:55:66");
        sparse.secondary_name = "phone".into();
        assert_eq!(registry.add_or_update(sparse.clone()), RegistryChange::Updated);
        assert_eq!(registry.add_or_update(sparse), RegistryChange::Unchanged);

        let stored = registry
            .get_by_address(&HardwareAddress::parse("11:22:33:44:55:66").unwrap())
            .unwrap();
        assert_eq!(stored.service_type, "svc");
        assert_eq!(stored.secondary_name, "phone");
        assert_eq!(stored.merge_count, 2);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], HostEvent::PeerUpdated(ref p) if p.secondary_name == "phone"));
    }

    #[test]
    fn callers_get_copies() {
        let (registry, _rx) = registry(Duration::from_secs(60));
        registry.add_or_update(peer("A", "11:22:33:44:55:66"));

        let address = HardwareAddress::parse("11:22:33:44:55:66").unwrap();
        let mut copy = registry.get_by_address(&address).unwrap();
        copy.name = "mutated".into();

        assert_eq!(registry.get_by_address(&address).unwrap().name, "A");
    }

    #[test]
    fn expiry_is_strictly_after_window() {
        let (registry, mut rx) = registry(Duration::from_secs(10));
        let t0 = Instant::now();
        registry.add_or_update_at(peer("A", "11:22:33:44:55:66"), t0);
        drain(&mut rx);

        assert!(registry.sweep_expired_at(t0 + Duration::from_secs(10)).is_empty());
        let expired = registry.sweep_expired_at(t0 + Duration::from_secs(11));
        assert_eq!(expired.len(), 1);
        assert!(registry.is_empty());
        assert!(registry.sweep_expired_at(t0 + Duration::from_secs(30)).is_empty());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], HostEvent::PeerLost(_)));
    }

    #[test]
    fn refresh_postpones_expiry() {
        let (registry, _rx) = registry(Duration::from_secs(10));
        let t0 = Instant::now();
        let a = peer("A", "11:22:33:44:55:66");
        registry.add_or_update_at(a.clone(), t0);
        registry.add_or_update_at(a, t0 + Duration::from_secs(8));

        assert!(registry.sweep_expired_at(t0 + Duration::from_secs(15)).is_empty());
        assert_eq!(registry.sweep_expired_at(t0 + Duration::from_secs(19)).len(), 1);
    }

    #[test]
    fn expiration_window_is_read_on_each_sweep() {
        let (registry, _rx) = registry(Duration::from_secs(60));
        let t0 = Instant::now();
        registry.add_or_update_at(peer("A", "11:22:33:44:55:66"), t0);

        assert!(registry.sweep_expired_at(t0 + Duration::from_secs(5)).is_empty());
        registry.set_expiration(Duration::from_secs(1));
        assert_eq!(registry.sweep_expired_at(t0 + Duration::from_secs(5)).len(), 1);
    }

    #[test]
    fn clear_is_silent() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        registry.add_or_update(peer("A", "11:22:33:44:55:66"));
        registry.add_or_update(peer("B", "AA:BB:CC:DD:EE:FF"));
        drain(&mut rx);

        registry.clear();
        assert!(registry.is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn peer_list_sighting_folds_into_hardware_entry() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        let listed = PeerIdentity {
            name: "phone".into(),
            secondary_address: "de:ad:be:ef:00:01".into(),
            discovery_method: DiscoveryMethod::SessionPeerList,
            ..Default::default()
        };
        assert_eq!(registry.add_or_update(listed), RegistryChange::Added);

        let mut full = peer("phone", "11:22:33:44:55:66");
        full.secondary_address = "de:ad:be:ef:00:01".into();
        assert_eq!(registry.add_or_update(full), RegistryChange::Updated);
        assert_eq!(registry.len(), 1);

        let events = drain(&mut rx);
        assert!(matches!(events[0], HostEvent::PeerDiscovered(_)));
        assert!(matches!(events[1], HostEvent::PeerUpdated(_)));
    }

    #[test]
    fn peer_without_any_address_is_ignored() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        let nobody = PeerIdentity {
            name: "ghost".into(),
            ..Default::default()
        };
        assert_eq!(registry.add_or_update(nobody), RegistryChange::Ignored);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn address_less_sighting_merges_into_hardware_entry() {
        let (registry, mut rx) = registry(Duration::from_secs(60));
        let mut known = peer("tablet", "AA:BB:CC:DD:EE:FF");
        known.secondary_address = "10.0.0.9:4000".into();
        registry.add_or_update(known);

        let sighting = PeerIdentity {
            name: "tablet".into(),
            hardware_address: Some(HardwareAddress::unknown()),
            secondary_address: "10.0.0.9:4000".into(),
            secondary_name: "tablet.local.".into(),
            discovery_method: DiscoveryMethod::Session,
            ..Default::default()
        };
        assert_eq!(registry.add_or_update(sighting), RegistryChange::Updated);
        assert_eq!(registry.len(), 1);

        let stored = registry
            .get_by_address(&HardwareAddress::parse("AA:BB:CC:DD:EE:FF").unwrap())
            .unwrap();
        assert_eq!(stored.secondary_name, "tablet.local.");

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], HostEvent::PeerDiscovered(_)));
        assert!(matches!(events[1], HostEvent::PeerUpdated(_)));
    }
}
