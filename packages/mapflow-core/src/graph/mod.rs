//! The replicated graph: every device, signal, map and link this process
//! has seen on the bus.
//!
//! Each device owns one graph. Local objects are authoritative; remote
//! objects are replicas refreshed by subscription pushes and bus
//! announcements, and expire when their device stops sending `/sync`.
//! Mutations queue change events which the device dispatches to
//! registered callbacks at the end of message processing, never from the
//! middle of a handler.

pub mod query;

pub use query::{Query, QueryOp, Record};

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use bitflags::bitflags;

use crate::id::Id;
use crate::link::LinkRecord;
use crate::map::MapRecord;
use crate::properties::{Property, PropertyTable, PropValue};
use crate::signal::SignalRecord;
use crate::time::Timetag;

/// Seconds without `/sync` before a device expires.
pub const DEFAULT_TIMEOUT_SEC: f64 = 10.0;

/// Auto-renewed subscription lease, seconds.
pub const AUTOSUBSCRIBE_LEASE_SEC: i32 = 60;

/// Renewal happens this many seconds before lease expiry.
pub const LEASE_RENEW_MARGIN_SEC: f64 = 10.0;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordAction {
    Added,
    Modified,
    Removed,
    Expired,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordType {
    Device,
    Signal,
    Map,
    Link,
}

/// A change to the replicated graph.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GraphEvent {
    pub kind: RecordType,
    pub id: Id,
    pub action: RecordAction,
}

bitflags! {
    /// What a subscriber wants pushed.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SubscribeFlags: u8 {
        const DEVICE = 1 << 0;
        const SIGNALS = 1 << 1;
        const MAPS_IN = 1 << 2;
        const MAPS_OUT = 1 << 3;
        const ALL = Self::DEVICE.bits()
            | Self::SIGNALS.bits()
            | Self::MAPS_IN.bits()
            | Self::MAPS_OUT.bits();
    }
}

impl SubscribeFlags {
    pub fn from_wire(word: &str) -> Option<SubscribeFlags> {
        Some(match word {
            "all" => SubscribeFlags::ALL,
            "device" => SubscribeFlags::DEVICE,
            "signals" | "inputs" | "outputs" => SubscribeFlags::SIGNALS,
            "maps" => SubscribeFlags::MAPS_IN | SubscribeFlags::MAPS_OUT,
            "incoming_maps" => SubscribeFlags::MAPS_IN,
            "outgoing_maps" => SubscribeFlags::MAPS_OUT,
            _ => return None,
        })
    }

    pub fn to_wire(self) -> Vec<&'static str> {
        if self.contains(SubscribeFlags::ALL) {
            return vec!["all"];
        }
        let mut words = Vec::new();
        if self.contains(SubscribeFlags::DEVICE) {
            words.push("device");
        }
        if self.contains(SubscribeFlags::SIGNALS) {
            words.push("signals");
        }
        if self.contains(SubscribeFlags::MAPS_IN | SubscribeFlags::MAPS_OUT) {
            words.push("maps");
        } else if self.contains(SubscribeFlags::MAPS_IN) {
            words.push("incoming_maps");
        } else if self.contains(SubscribeFlags::MAPS_OUT) {
            words.push("outgoing_maps");
        }
        words
    }
}

/// An outgoing subscription held by the local device.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub device: Id,
    pub flags: SubscribeFlags,
    /// NTP seconds when the lease runs out.
    pub lease_expiry: f64,
    pub auto_renew: bool,
}

/// A device as replicated in every graph.
#[derive(Debug)]
pub struct DeviceRecord {
    pub id: Id,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub version: i32,
    pub props: PropertyTable,
    pub is_local: bool,
    pub expired: bool,
    /// Last `/sync` heard.
    pub synced: Timetag,
    pub subscribed: bool,
}

impl DeviceRecord {
    pub fn addr(&self) -> Option<SocketAddr> {
        if self.host.is_empty() || self.port == 0 {
            return None;
        }
        format!("{}:{}", self.host, self.port).parse().ok()
    }

    pub(crate) fn sync_props(&mut self) {
        let p = &mut self.props;
        p.set(Property::Name, PropValue::Str(self.name.clone()));
        p.set(Property::Id, PropValue::I64(self.id.as_u64() as i64));
        if !self.host.is_empty() {
            p.set(Property::Host, PropValue::Str(self.host.clone()));
        }
        if self.port != 0 {
            p.set(Property::Port, PropValue::I32(self.port as i32));
        }
        p.set(Property::Version, PropValue::I32(self.version));
        p.set(Property::IsLocal, PropValue::Bool(self.is_local));
    }
}

impl Record for DeviceRecord {
    fn record_id(&self) -> Id {
        self.id
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }
}

impl Record for SignalRecord {
    fn record_id(&self) -> Id {
        self.id
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }
}

impl Record for MapRecord {
    fn record_id(&self) -> Id {
        self.id
    }

    fn properties(&self) -> &PropertyTable {
        &self.props
    }
}

/// Result of hearing a `/sync` heartbeat.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum SyncResult {
    /// Never heard of this device; a `/who` is warranted.
    Unknown,
    Known,
    /// Known, but its version advanced past our replica.
    KnownStale,
}

type Callback = Box<dyn FnMut(&GraphEvent)>;

pub struct Graph {
    pub(crate) devices: BTreeMap<Id, DeviceRecord>,
    pub(crate) signals: BTreeMap<Id, SignalRecord>,
    pub(crate) maps: BTreeMap<Id, MapRecord>,
    pub(crate) links: BTreeMap<Id, LinkRecord>,
    pub(crate) subscriptions: Vec<Subscription>,
    callbacks: Vec<(usize, Callback)>,
    next_callback: usize,
    pending: VecDeque<GraphEvent>,
    pub timeout_sec: f64,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("devices", &self.devices.len())
            .field("signals", &self.signals.len())
            .field("maps", &self.maps.len())
            .field("links", &self.links.len())
            .finish()
    }
}

impl Graph {
    pub fn new(timeout_sec: f64) -> Self {
        Graph {
            devices: BTreeMap::new(),
            signals: BTreeMap::new(),
            maps: BTreeMap::new(),
            links: BTreeMap::new(),
            subscriptions: Vec::new(),
            callbacks: Vec::new(),
            next_callback: 0,
            pending: VecDeque::new(),
            timeout_sec,
        }
    }

    // ── devices ─────────────────────────────────────────────────────────

    /// Creates or refreshes a device record from an announcement.
    pub(crate) fn ensure_device(
        &mut self,
        name: &str,
        host: Option<&str>,
        port: Option<u16>,
        is_local: bool,
        now: Timetag,
    ) -> Id {
        let id = Id::for_device_name(name);
        match self.devices.get_mut(&id) {
            Some(dev) => {
                let mut modified = false;
                if let Some(host) = host {
                    if dev.host != host {
                        dev.host = host.to_string();
                        modified = true;
                    }
                }
                if let Some(port) = port {
                    if dev.port != port {
                        dev.port = port;
                        modified = true;
                    }
                }
                if dev.expired {
                    dev.expired = false;
                    modified = true;
                }
                dev.synced = now;
                if modified {
                    dev.sync_props();
                    self.pending.push_back(GraphEvent {
                        kind: RecordType::Device,
                        id,
                        action: RecordAction::Modified,
                    });
                }
            }
            None => {
                let mut dev = DeviceRecord {
                    id,
                    name: name.to_string(),
                    host: host.unwrap_or("").to_string(),
                    port: port.unwrap_or(0),
                    version: 0,
                    props: PropertyTable::new(),
                    is_local,
                    expired: false,
                    synced: now,
                    subscribed: false,
                };
                dev.sync_props();
                self.devices.insert(id, dev);
                self.pending.push_back(GraphEvent {
                    kind: RecordType::Device,
                    id,
                    action: RecordAction::Added,
                });
            }
        }
        id
    }

    pub fn device(&self, id: Id) -> Option<&DeviceRecord> {
        self.devices.get(&id)
    }

    pub(crate) fn device_mut(&mut self, id: Id) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(&id)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&DeviceRecord> {
        self.devices.get(&Id::for_device_name(name))
    }

    pub fn devices(&self) -> Query<'_, DeviceRecord> {
        Query::new(self.devices.values())
    }

    /// Registers a `/sync` heartbeat.
    pub(crate) fn heard_sync(&mut self, name: &str, version: i32, now: Timetag) -> SyncResult {
        let id = Id::for_device_name(name);
        match self.devices.get_mut(&id) {
            Some(dev) => {
                dev.synced = now;
                if dev.expired {
                    dev.expired = false;
                    self.pending.push_back(GraphEvent {
                        kind: RecordType::Device,
                        id,
                        action: RecordAction::Modified,
                    });
                }
                if version > dev.version {
                    SyncResult::KnownStale
                } else {
                    SyncResult::Known
                }
            }
            None => SyncResult::Unknown,
        }
    }

    /// Expires remote devices that have gone quiet, releasing their maps
    /// and links. Returns the ids of newly expired devices.
    pub(crate) fn sweep_expired(&mut self, now: Timetag) -> Vec<Id> {
        let mut expired = Vec::new();
        for dev in self.devices.values_mut() {
            if dev.is_local || dev.expired {
                continue;
            }
            if now.secs_since(dev.synced) > self.timeout_sec {
                dev.expired = true;
                expired.push(dev.id);
            }
        }
        for id in &expired {
            log::debug!("device {:?} expired", id);
            self.pending.push_back(GraphEvent {
                kind: RecordType::Device,
                id: *id,
                action: RecordAction::Expired,
            });
            let dead_maps: Vec<Id> = self
                .maps
                .values()
                .filter(|m| {
                    m.destination.signal.device_part() == *id
                        || m.sources.iter().any(|s| s.signal.device_part() == *id)
                })
                .map(|m| m.id)
                .collect();
            for mid in dead_maps {
                self.remove_map(mid, RecordAction::Expired);
            }
            let dead_links: Vec<Id> = self
                .links
                .values()
                .filter(|l| l.local_device == *id || l.remote_device == *id)
                .map(|l| l.id)
                .collect();
            for lid in dead_links {
                self.links.remove(&lid);
                self.pending.push_back(GraphEvent {
                    kind: RecordType::Link,
                    id: lid,
                    action: RecordAction::Expired,
                });
            }
        }
        expired
    }

    // ── signals ─────────────────────────────────────────────────────────

    pub(crate) fn insert_signal(&mut self, sig: SignalRecord) -> Id {
        let id = sig.id;
        let existed = self.signals.insert(id, sig).is_some();
        self.pending.push_back(GraphEvent {
            kind: RecordType::Signal,
            id,
            action: if existed {
                RecordAction::Modified
            } else {
                RecordAction::Added
            },
        });
        id
    }

    pub fn signal(&self, id: Id) -> Option<&SignalRecord> {
        self.signals.get(&id)
    }

    pub(crate) fn signal_mut(&mut self, id: Id) -> Option<&mut SignalRecord> {
        self.signals.get_mut(&id)
    }

    /// Looks up by `device/signal` (leading slash tolerated).
    pub fn signal_by_full_name(&self, full: &str) -> Option<&SignalRecord> {
        let full = full.trim_start_matches('/');
        self.signals.values().find(|s| s.full_name() == full)
    }

    pub(crate) fn signal_id_by_full_name(&self, full: &str) -> Option<Id> {
        self.signal_by_full_name(full).map(|s| s.id)
    }

    pub fn signals(&self) -> Query<'_, SignalRecord> {
        Query::new(self.signals.values())
    }

    pub fn signals_of(&self, device: Id) -> Query<'_, SignalRecord> {
        Query::new(self.signals.values().filter(move |s| s.device == device))
    }

    pub(crate) fn remove_signal(&mut self, id: Id, action: RecordAction) -> Option<SignalRecord> {
        let sig = self.signals.remove(&id)?;
        self.pending.push_back(GraphEvent {
            kind: RecordType::Signal,
            id,
            action,
        });
        // maps touching the signal die with it
        let dead: Vec<Id> = self
            .maps
            .values()
            .filter(|m| {
                m.destination.signal == id || m.sources.iter().any(|s| s.signal == id)
            })
            .map(|m| m.id)
            .collect();
        for mid in dead {
            self.remove_map(mid, action);
        }
        Some(sig)
    }

    // ── maps ────────────────────────────────────────────────────────────

    pub(crate) fn insert_map(&mut self, map: MapRecord) -> Id {
        let id = map.id;
        let existed = self.maps.insert(id, map).is_some();
        self.pending.push_back(GraphEvent {
            kind: RecordType::Map,
            id,
            action: if existed {
                RecordAction::Modified
            } else {
                RecordAction::Added
            },
        });
        id
    }

    pub fn map(&self, id: Id) -> Option<&MapRecord> {
        self.maps.get(&id)
    }

    pub(crate) fn map_mut(&mut self, id: Id) -> Option<&mut MapRecord> {
        self.maps.get_mut(&id)
    }

    pub fn maps(&self) -> Query<'_, MapRecord> {
        Query::new(self.maps.values())
    }

    /// Maps with `signal` as a source (`out`) or destination (`in`).
    pub fn maps_for_signal(&self, signal: Id, incoming: bool) -> Query<'_, MapRecord> {
        Query::new(self.maps.values().filter(move |m| {
            if incoming {
                m.destination.signal == signal
            } else {
                m.sources.iter().any(|s| s.signal == signal)
            }
        }))
    }

    /// Finds a map by its wire endpoints.
    pub(crate) fn map_by_endpoints(&self, srcs: &[String], dst: &str) -> Option<Id> {
        let dst = dst.trim_start_matches('/');
        self.maps
            .values()
            .find(|m| {
                m.destination.signal_name == dst
                    && m.sources.len() == srcs.len()
                    && m.sources
                        .iter()
                        .zip(srcs)
                        .all(|(slot, name)| slot.signal_name == name.trim_start_matches('/'))
            })
            .map(|m| m.id)
    }

    pub(crate) fn remove_map(&mut self, id: Id, action: RecordAction) -> Option<MapRecord> {
        let map = self.maps.remove(&id)?;
        self.pending.push_back(GraphEvent {
            kind: RecordType::Map,
            id,
            action,
        });
        Some(map)
    }

    pub(crate) fn notify_map_modified(&mut self, id: Id) {
        self.pending.push_back(GraphEvent {
            kind: RecordType::Map,
            id,
            action: RecordAction::Modified,
        });
    }

    // ── links ───────────────────────────────────────────────────────────

    pub(crate) fn ensure_link(
        &mut self,
        local: Id,
        remote: Id,
        addr: Option<SocketAddr>,
    ) -> Id {
        let id = LinkRecord::link_id(local, remote);
        match self.links.get_mut(&id) {
            Some(link) => {
                if addr.is_some() && link.addr != addr {
                    link.addr = addr;
                }
            }
            None => {
                self.links.insert(id, LinkRecord::new(local, remote, addr));
                self.pending.push_back(GraphEvent {
                    kind: RecordType::Link,
                    id,
                    action: RecordAction::Added,
                });
            }
        }
        id
    }

    pub fn link(&self, id: Id) -> Option<&LinkRecord> {
        self.links.get(&id)
    }

    pub(crate) fn link_mut(&mut self, id: Id) -> Option<&mut LinkRecord> {
        self.links.get_mut(&id)
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links.values()
    }

    /// Drops links no map uses any more. Returns the removed records so
    /// the caller can flush their queues one last time.
    pub(crate) fn prune_links(&mut self) -> Vec<LinkRecord> {
        let dead: Vec<Id> = self
            .links
            .values()
            .filter(|l| l.total_maps() == 0)
            .map(|l| l.id)
            .collect();
        let mut removed = Vec::new();
        for id in dead {
            if let Some(link) = self.links.remove(&id) {
                self.pending.push_back(GraphEvent {
                    kind: RecordType::Link,
                    id,
                    action: RecordAction::Removed,
                });
                removed.push(link);
            }
        }
        removed
    }

    // ── callbacks & events ──────────────────────────────────────────────

    /// Registers a change callback; returns a handle for removal.
    pub fn add_callback(&mut self, cb: impl FnMut(&GraphEvent) + 'static) -> usize {
        let handle = self.next_callback;
        self.next_callback += 1;
        self.callbacks.push((handle, Box::new(cb)));
        handle
    }

    pub fn remove_callback(&mut self, handle: usize) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(h, _)| *h != handle);
        self.callbacks.len() != before
    }

    pub(crate) fn push_event(&mut self, ev: GraphEvent) {
        self.pending.push_back(ev);
    }

    pub(crate) fn take_events(&mut self) -> Vec<GraphEvent> {
        self.pending.drain(..).collect()
    }

    /// Delivers queued events to the registered callbacks.
    pub(crate) fn dispatch_events(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let events: Vec<GraphEvent> = self.pending.drain(..).collect();
        let mut callbacks = std::mem::take(&mut self.callbacks);
        for ev in &events {
            for (_, cb) in callbacks.iter_mut() {
                cb(ev);
            }
        }
        self.callbacks = callbacks;
    }

    // ── subscriptions ───────────────────────────────────────────────────

    pub(crate) fn subscription_mut(&mut self, device: Id) -> Option<&mut Subscription> {
        self.subscriptions.iter_mut().find(|s| s.device == device)
    }

    pub(crate) fn remove_subscription(&mut self, device: Id) {
        self.subscriptions.retain(|s| s.device != device);
        if let Some(dev) = self.devices.get_mut(&device) {
            dev.subscribed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> Graph {
        Graph::new(DEFAULT_TIMEOUT_SEC)
    }

    #[test]
    fn ensure_device_adds_then_updates() {
        let mut g = graph();
        let id = g.ensure_device("synth.1", Some("192.168.1.9"), Some(9000), false, Timetag::new(1, 0));
        assert_eq!(g.device(id).unwrap().name, "synth.1");
        assert_eq!(g.take_events().len(), 1);
        // same announcement changes nothing
        g.ensure_device("synth.1", Some("192.168.1.9"), Some(9000), false, Timetag::new(2, 0));
        assert!(g.take_events().is_empty());
        // a new port is a modification
        g.ensure_device("synth.1", Some("192.168.1.9"), Some(9001), false, Timetag::new(3, 0));
        let evs = g.take_events();
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].action, RecordAction::Modified);
    }

    #[test]
    fn sync_tracks_liveness_and_version() {
        let mut g = graph();
        assert_eq!(
            g.heard_sync("ghost.1", 0, Timetag::new(1, 0)),
            SyncResult::Unknown
        );
        g.ensure_device("synth.1", None, None, false, Timetag::new(1, 0));
        assert_eq!(
            g.heard_sync("synth.1", 0, Timetag::new(2, 0)),
            SyncResult::Known
        );
        assert_eq!(
            g.heard_sync("synth.1", 3, Timetag::new(3, 0)),
            SyncResult::KnownStale
        );
    }

    #[test]
    fn quiet_devices_expire_and_release_their_links() {
        let mut g = graph();
        let a = g.ensure_device("a.1", None, None, true, Timetag::new(100, 0));
        let b = g.ensure_device("b.1", None, None, false, Timetag::new(100, 0));
        g.ensure_link(a, b, None);
        g.take_events();

        // before the timeout nothing happens
        assert!(g.sweep_expired(Timetag::new(105, 0)).is_empty());
        let expired = g.sweep_expired(Timetag::new(111, 0));
        assert_eq!(expired, vec![b]);
        assert!(g.device(b).unwrap().expired);
        // local devices never expire
        assert!(!g.device(a).unwrap().expired);
        assert_eq!(g.links().count(), 0);
    }

    #[test]
    fn callbacks_receive_queued_events() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut g = graph();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let handle = g.add_callback(move |ev| sink.borrow_mut().push(*ev));

        g.ensure_device("synth.1", None, None, false, Timetag::new(1, 0));
        g.dispatch_events();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(seen.borrow()[0].action, RecordAction::Added);

        assert!(g.remove_callback(handle));
        g.ensure_device("other.1", None, None, false, Timetag::new(1, 0));
        g.dispatch_events();
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn subscribe_flag_words_round_trip() {
        assert_eq!(SubscribeFlags::from_wire("all"), Some(SubscribeFlags::ALL));
        assert_eq!(
            SubscribeFlags::from_wire("incoming_maps"),
            Some(SubscribeFlags::MAPS_IN)
        );
        assert_eq!(SubscribeFlags::ALL.to_wire(), vec!["all"]);
        assert_eq!(
            (SubscribeFlags::DEVICE | SubscribeFlags::SIGNALS).to_wire(),
            vec!["device", "signals"]
        );
        assert_eq!(SubscribeFlags::from_wire("nonsense"), None);
    }
}
