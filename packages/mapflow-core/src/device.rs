//! Devices: the top-level runtime container.
//!
//! A device owns its sockets, clock, replicated graph, local signals and
//! the routing of outgoing maps. Everything runs cooperatively on the
//! caller's thread: [`Device::poll`] drains inbound packets, runs the
//! ordinal state machine and housekeeping (heartbeats, subscription
//! leases, liveness sweeps, staged-map activation), flushes queued link
//! bundles, and fires user callbacks. No other call blocks.
//!
//! Signal writes from inside a user callback re-enter the router
//! synchronously; the messages they produce are queued on links and
//! dispatched when the current poll iteration flushes, so tight map
//! cycles cannot recurse unboundedly.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};

use crate::buffer::ValueBuffer;
use crate::error::{MapflowError, MapflowResult};
use crate::expr::{evaluate, EvalFlags, EvalParams, ExprState, SlotSource};
use crate::graph::{
    Graph, GraphEvent, RecordAction, RecordType, SubscribeFlags, Subscription,
    AUTOSUBSCRIBE_LEASE_SEC, LEASE_RENEW_MARGIN_SEC,
};
use crate::id::Id;
use crate::idmap::IdMapTable;
use crate::link::LinkRecord;
use crate::map::{
    LocalMap, MapMode, MapProtocol, MapRecord, MapStatus, ProcessLocation, Slot, MAX_MAP_SOURCES,
};
use crate::net::messages::{self, Message};
use crate::net::ordinal::{OrdinalAction, OrdinalAllocator};
use crate::net::{NetworkBus, NetworkConfig, SYNC_INTERVAL_SEC};
use crate::properties::PropertyTable;
use crate::signal::{
    Activation, Direction, LocalSignal, SignalEvents, SignalRecord, StealPolicy,
};
use crate::time::{Clock, Timetag};
use crate::value::{ScalarType, Vector};

/// Iteration cap for locally chained map deliveries within one poll.
const MAX_LOCAL_DELIVERIES: usize = 1000;

/// Minimum seconds between `/who` requests.
const WHO_THROTTLE_SEC: f64 = 1.0;

/// An event delivered to a signal callback.
#[derive(Debug)]
pub struct SignalEvent {
    pub signal: Id,
    pub event: SignalEvents,
    /// Local instance id.
    pub instance: u32,
    /// Globally agreed instance id, when one exists.
    pub global: Option<u64>,
    pub value: Option<Vector>,
    pub time: Timetag,
}

pub type SignalCallback = Box<dyn FnMut(&mut Device, &SignalEvent)>;

/// Declarative description of a new local signal.
#[derive(Clone, Debug)]
pub struct SignalBuilder {
    name: String,
    dir: Direction,
    ty: ScalarType,
    len: usize,
    unit: Option<String>,
    min: Option<Vector>,
    max: Option<Vector>,
    num_instances: usize,
    steal: StealPolicy,
    event_mask: SignalEvents,
}

impl SignalBuilder {
    pub fn output(name: &str) -> Self {
        Self::new(name, Direction::Out)
    }

    pub fn input(name: &str) -> Self {
        Self::new(name, Direction::In)
    }

    fn new(name: &str, dir: Direction) -> Self {
        SignalBuilder {
            name: name.to_string(),
            dir,
            ty: ScalarType::Float,
            len: 1,
            unit: None,
            min: None,
            max: None,
            num_instances: 1,
            steal: StealPolicy::None,
            event_mask: SignalEvents::all(),
        }
    }

    pub fn with_type(mut self, ty: ScalarType) -> Self {
        self.ty = ty;
        self
    }

    pub fn with_length(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn with_range(mut self, min: Vector, max: Vector) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_instances(mut self, n: usize) -> Self {
        self.num_instances = n.max(1);
        self
    }

    pub fn with_steal(mut self, steal: StealPolicy) -> Self {
        self.steal = steal;
        self
    }

    pub fn with_events(mut self, mask: SignalEvents) -> Self {
        self.event_mask = mask;
        self
    }
}

/// Declarative description of a new map.
#[derive(Clone, Debug)]
pub struct MapBuilder {
    sources: Vec<String>,
    destination: String,
    mode: Option<MapMode>,
    expression: Option<String>,
    scope: Vec<String>,
    process: Option<ProcessLocation>,
    muted: bool,
}

impl MapBuilder {
    /// Endpoints are full signal names, `device/signal`.
    pub fn new(sources: &[&str], destination: &str) -> Self {
        MapBuilder {
            sources: sources.iter().map(|s| s.to_string()).collect(),
            destination: destination.to_string(),
            mode: None,
            expression: None,
            scope: Vec::new(),
            process: None,
            muted: false,
        }
    }

    pub fn with_mode(mut self, mode: MapMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_expression(mut self, expr: &str) -> Self {
        self.expression = Some(expr.to_string());
        self.mode = Some(MapMode::Expression);
        self
    }

    pub fn with_scope(mut self, device: &str) -> Self {
        self.scope.push(device.to_string());
        self
    }

    pub fn with_process(mut self, process: ProcessLocation) -> Self {
        self.process = Some(process);
        self
    }

    pub fn muted(mut self) -> Self {
        self.muted = true;
        self
    }
}

/// A peer holding a lease on our graph deltas.
#[derive(Debug)]
struct Subscriber {
    addr: SocketAddr,
    flags: SubscribeFlags,
    /// NTP seconds.
    expiry: f64,
}

/// Identity of the instance an evaluation runs for.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
enum InstKey {
    /// The signal's singleton stream.
    Single,
    Global(u64),
}

impl InstKey {
    fn as_u64(self) -> u64 {
        match self {
            InstKey::Single => 0,
            InstKey::Global(g) => g,
        }
    }

    fn wire_id(self) -> Option<i64> {
        match self {
            InstKey::Single => None,
            InstKey::Global(g) => Some(g as i64),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PendingEval {
    map: Id,
    /// Causing source slot.
    slot: usize,
    key: InstKey,
    time: Timetag,
}

#[derive(Debug)]
struct LocalDelivery {
    signal: Id,
    key: InstKey,
    value: Vector,
    time: Timetag,
}

pub struct Device {
    net: NetworkBus,
    graph: Graph,
    clock: Clock,
    alloc: OrdinalAllocator,
    /// Set once ordinal allocation completes.
    id: Id,
    version: i32,
    idmap: IdMapTable,
    callbacks: HashMap<Id, SignalCallback>,
    subscribers: Vec<Subscriber>,
    sig_counter: u32,
    map_counter: u32,
    next_sync: f64,
    last_who: f64,
    pending_evals: Vec<PendingEval>,
    pending_local: VecDeque<LocalDelivery>,
    delivering: bool,
    in_callback: bool,
    deferred_signal_removals: Vec<Id>,
    recv_buf: Vec<u8>,
}

impl Device {
    /// Opens sockets and starts probing for `<base>.1`. The device is
    /// usable once [`Device::is_ready`] turns true under polling.
    pub fn new(base_name: &str, cfg: NetworkConfig) -> MapflowResult<Device> {
        if base_name.is_empty() || base_name.contains('/') || base_name.contains('.') {
            return Err(MapflowError::InvalidArgument(format!(
                "bad device name '{}'",
                base_name
            )));
        }
        let net = NetworkBus::open(&cfg)?;
        let graph = Graph::new(cfg.timeout_sec);
        Ok(Device {
            net,
            graph,
            clock: Clock::new(),
            alloc: OrdinalAllocator::new(base_name),
            id: Id::NONE,
            version: 0,
            idmap: IdMapTable::new(),
            callbacks: HashMap::new(),
            subscribers: Vec::new(),
            sig_counter: 0,
            map_counter: 0,
            next_sync: 0.0,
            last_who: 0.0,
            pending_evals: Vec::new(),
            pending_local: VecDeque::new(),
            delivering: false,
            in_callback: false,
            deferred_signal_removals: Vec::new(),
            recv_buf: vec![0u8; 65536],
        })
    }

    /// The registered name, once allocation completed.
    pub fn name(&self) -> String {
        self.alloc.name()
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.alloc.is_registered()
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.graph
    }

    /// Looks up a local signal id by its short name. Useful after
    /// registration, which may re-key signals declared while the ordinal
    /// was still being negotiated.
    pub fn signal_id(&self, name: &str) -> Option<Id> {
        self.graph
            .signals
            .values()
            .find(|s| s.is_local && s.name == name)
            .map(|s| s.id)
    }

    pub fn now(&self) -> Timetag {
        self.clock.now()
    }

    pub fn port(&self) -> u16 {
        self.net.mesh_port()
    }

    // ── polling ─────────────────────────────────────────────────────────

    /// Services the device: drains inbound messages, runs housekeeping,
    /// flushes outbound bundles and fires callbacks. Blocks up to
    /// `block_ms` waiting for traffic. Returns the number of messages
    /// handled.
    pub fn poll(&mut self, block_ms: u32) -> usize {
        let mut count = self.poll_once();
        if block_ms > 0 {
            let deadline = self.clock.now().add_secs(block_ms as f64 / 1000.0);
            while self.clock.now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
                count += self.poll_once();
            }
        }
        count
    }

    fn poll_once(&mut self) -> usize {
        let mut count = 0;
        loop {
            let received = self.net.recv_bus(&mut self.recv_buf);
            match received {
                Some((packet, src)) => {
                    count += 1;
                    self.handle_packet(packet, src);
                }
                None => break,
            }
        }
        loop {
            let received = self.net.recv_mesh(&mut self.recv_buf);
            match received {
                Some((packet, src)) => {
                    count += 1;
                    self.handle_packet(packet, src);
                }
                None => break,
            }
        }

        let now = self.clock.now();
        self.run_ordinal(now);
        self.run_heartbeat(now);
        self.run_subscriptions(now);
        self.sweep_expired(now);
        self.drain_local_deliveries();
        self.flush_links();
        self.graph.dispatch_events();
        self.flush_deferred_removals();
        count
    }

    fn run_ordinal(&mut self, now: Timetag) {
        match self.alloc.poll(now) {
            Some(OrdinalAction::SendProbe) => {
                let msg = messages::name_probe(&self.alloc.name(), self.alloc.nonce());
                if let Err(e) = self.net.send_bus(msg) {
                    log::warn!("probe send failed: {}", e);
                }
            }
            Some(OrdinalAction::ClaimName) => {
                let name = self.alloc.name();
                self.id = Id::for_device_name(&name);
                let host = self.net.host().to_string();
                self.graph.ensure_device(
                    &name,
                    Some(host.as_str()),
                    Some(self.net.mesh_port()),
                    true,
                    now,
                );
                self.adopt_registered_name(&name);
                self.announce_registered();
                log::debug!("device registered as '{}'", name);
            }
            None => {}
        }
    }

    /// Re-keys signals declared before ordinal allocation finished: the
    /// candidate ordinal may have moved, changing the device id every
    /// child id embeds.
    fn adopt_registered_name(&mut self, name: &str) {
        let stale: Vec<Id> = self
            .graph
            .signals
            .values()
            .filter(|s| s.is_local && s.device != self.id)
            .map(|s| s.id)
            .collect();
        for old in stale {
            if let Some(mut sig) = self.graph.signals.remove(&old) {
                sig.device = self.id;
                sig.device_name = name.to_string();
                sig.id = self.id.child(old.local_part());
                sig.sync_props();
                if let Some(cb) = self.callbacks.remove(&old) {
                    self.callbacks.insert(sig.id, cb);
                }
                self.graph.signals.insert(sig.id, sig);
            }
        }
    }

    fn announce_registered(&mut self) {
        let msg = messages::name_registered(
            &self.alloc.name(),
            self.id.as_u64(),
            self.net.host(),
            self.net.mesh_port(),
        );
        if let Err(e) = self.net.send_bus(msg) {
            log::warn!("registration send failed: {}", e);
        }
    }

    fn run_heartbeat(&mut self, now: Timetag) {
        if !self.is_ready() {
            return;
        }
        let now_secs = now.as_secs_f64();
        if now_secs < self.next_sync {
            return;
        }
        self.next_sync = now_secs + SYNC_INTERVAL_SEC;
        let msg = messages::sync(&self.alloc.name(), self.version);
        if let Err(e) = self.net.send_bus(msg) {
            log::trace!("sync send failed: {}", e);
        }
    }

    fn run_subscriptions(&mut self, now: Timetag) {
        let now_secs = now.as_secs_f64();

        // renew our outgoing leases ahead of expiry
        let renewals: Vec<(Id, SubscribeFlags)> = self
            .graph
            .subscriptions
            .iter()
            .filter(|s| s.auto_renew && now_secs > s.lease_expiry - LEASE_RENEW_MARGIN_SEC)
            .map(|s| (s.device, s.flags))
            .collect();
        for (device, flags) in renewals {
            self.send_subscribe(device, flags, AUTOSUBSCRIBE_LEASE_SEC);
            if let Some(sub) = self.graph.subscription_mut(device) {
                sub.lease_expiry = now_secs + AUTOSUBSCRIBE_LEASE_SEC as f64;
            }
        }

        // drop subscribers whose lease ran out
        self.subscribers.retain(|s| {
            if s.expiry < now_secs {
                log::debug!("subscriber {} lease expired", s.addr);
                false
            } else {
                true
            }
        });
    }

    fn sweep_expired(&mut self, now: Timetag) {
        let expired = self.graph.sweep_expired(now);
        for id in expired {
            self.graph.remove_subscription(id);
        }
    }

    fn flush_links(&mut self) {
        let mut outbound: Vec<(SocketAddr, Timetag, Vec<OscMessage>)> = Vec::new();
        for link in self.graph.links.values_mut() {
            if let Some((time, msgs)) = link.take_queue() {
                // late address resolution: the peer may have announced
                // itself after the link was created
                if link.addr.is_none() {
                    link.addr = self
                        .graph
                        .devices
                        .get(&link.remote_device)
                        .and_then(|d| d.addr());
                }
                match link.addr {
                    Some(addr) => outbound.push((addr, time, msgs)),
                    None => log::warn!(
                        "dropping {} queued messages: link to {:?} has no address",
                        msgs.len(),
                        link.remote_device
                    ),
                }
            }
        }
        for (addr, time, msgs) in outbound {
            if let Err(e) = self.net.send_bundle(addr, time, msgs) {
                log::trace!("bundle send to {} failed: {}", addr, e);
            }
        }
    }

    // ── inbound dispatch ────────────────────────────────────────────────

    fn handle_packet(&mut self, packet: OscPacket, src: SocketAddr) {
        let now = self.clock.now();
        match packet {
            OscPacket::Message(msg) => {
                self.handle_osc(&msg, src, now);
            }
            OscPacket::Bundle(bundle) => {
                let time = Timetag::from(bundle.timetag);
                let time = if time.is_immediate() { now } else { time };
                for inner in bundle.content {
                    match inner {
                        OscPacket::Message(msg) => self.handle_osc(&msg, src, time),
                        OscPacket::Bundle(_) => {
                            log::trace!("ignoring nested bundle from {}", src)
                        }
                    }
                }
            }
        }
        // updates that arrived together evaluate together
        self.drain_pending_evals();
    }

    fn handle_osc(&mut self, msg: &OscMessage, src: SocketAddr, time: Timetag) {
        let Some(parsed) = messages::parse(msg) else {
            log::trace!("unhandled message at {}", msg.addr);
            return;
        };
        match parsed {
            Message::Sync { name, version } => self.on_sync(&name, version, time),
            Message::NameProbe { name, nonce } => {
                if self.alloc.heard_probe(&name, nonce) {
                    self.announce_registered();
                }
            }
            Message::NameRegistered { name, args } => self.on_registered(&name, &args, time),
            Message::Who => {
                if self.is_ready() {
                    self.announce_registered();
                }
            }
            Message::Subscribe {
                device,
                flags,
                lease,
                version: _,
            } => {
                if self.is_ready() && device == self.alloc.name() {
                    self.on_subscribe(src, flags, lease, time);
                }
            }
            Message::Unsubscribe { device } => {
                if device == self.alloc.name() {
                    self.subscribers.retain(|s| s.addr != src);
                }
            }
            Message::SignalMeta { device, args } => self.on_signal_meta(&device, &args),
            Message::SignalRemoved { device, name } => {
                if device != self.alloc.name() {
                    let full = format!("{}/{}", device, name);
                    if let Some(id) = self.graph.signal_id_by_full_name(&full) {
                        self.graph.remove_signal(id, RecordAction::Removed);
                    }
                }
            }
            Message::Map { srcs, dst, args } => self.on_map(&srcs, &dst, &args),
            Message::Mapped { srcs, dst, args } => self.on_mapped(&srcs, &dst, &args),
            Message::MapModify { srcs, dst, args } => self.on_map_modify(&srcs, &dst, &args),
            Message::Unmap { srcs, dst } => self.on_unmap(&srcs, &dst),
            Message::SignalUpdate {
                signal,
                instance,
                values,
            } => self.on_signal_update(&signal, instance, &values, time),
            Message::SignalRelease { signal, instance } => {
                self.on_signal_release(&signal, instance, src, time)
            }
            Message::SlotUpdate {
                signal,
                slot,
                instance,
                values,
            } => self.on_slot_update(&signal, slot, instance, &values, time),
        }
    }

    fn on_sync(&mut self, name: &str, version: i32, now: Timetag) {
        if name == self.alloc.name() {
            return;
        }
        use crate::graph::SyncResult;
        match self.graph.heard_sync(name, version, now) {
            SyncResult::Unknown => {
                let now_secs = now.as_secs_f64();
                if now_secs - self.last_who > WHO_THROTTLE_SEC {
                    self.last_who = now_secs;
                    let _ = self.net.send_bus(messages::who());
                }
            }
            SyncResult::KnownStale => {
                // refresh our replica if we hold a subscription
                let id = Id::for_device_name(name);
                if let Some(sub) = self.graph.subscription_mut(id) {
                    let flags = sub.flags;
                    self.send_subscribe(id, flags, AUTOSUBSCRIBE_LEASE_SEC);
                }
                if let Some(dev) = self.graph.device_mut(id) {
                    dev.version = version;
                    dev.sync_props();
                }
            }
            SyncResult::Known => {}
        }
    }

    fn on_registered(&mut self, name: &str, args: &[OscType], now: Timetag) {
        self.alloc.heard_registered(name);
        if name == self.alloc.name() && self.is_ready() {
            return;
        }
        let mut host = None;
        let mut port = None;
        for (key, values) in crate::properties::split_arg_groups(args) {
            match key {
                "@host" => {
                    if let Some(OscType::String(h)) = values.first() {
                        host = Some(h.clone());
                    }
                }
                "@port" => {
                    if let Some(OscType::Int(p)) = values.first() {
                        port = Some(*p as u16);
                    }
                }
                _ => {}
            }
        }
        self.graph
            .ensure_device(name, host.as_deref(), port, false, now);
    }

    fn on_subscribe(&mut self, addr: SocketAddr, flags: SubscribeFlags, lease: i32, now: Timetag) {
        let lease_secs = if lease < 0 {
            AUTOSUBSCRIBE_LEASE_SEC as f64
        } else {
            lease as f64
        };
        let expiry = now.as_secs_f64() + lease_secs;
        match self.subscribers.iter_mut().find(|s| s.addr == addr) {
            Some(sub) => {
                sub.flags = flags;
                sub.expiry = expiry;
            }
            None => {
                log::debug!("new subscriber {} (flags {:?})", addr, flags);
                self.subscribers.push(Subscriber {
                    addr,
                    flags,
                    expiry,
                });
                self.push_snapshot(addr, flags);
            }
        }
    }

    /// Sends the full current state of our objects to a new subscriber.
    fn push_snapshot(&mut self, addr: SocketAddr, flags: SubscribeFlags) {
        let name = self.alloc.name();
        let mut msgs: Vec<OscMessage> = Vec::new();
        if flags.contains(SubscribeFlags::SIGNALS) {
            for sig in self.graph.signals.values().filter(|s| s.is_local) {
                msgs.push(messages::signal_meta(&name, sig.wire_args()));
            }
        }
        if flags.intersects(SubscribeFlags::MAPS_IN | SubscribeFlags::MAPS_OUT) {
            for map in self.graph.maps.values().filter(|m| m.is_local) {
                let mut args = map.to_wire_args();
                args.push(OscType::String("@status".into()));
                args.push(OscType::String(
                    if map.status == MapStatus::Active {
                        "active"
                    } else {
                        "ready"
                    }
                    .into(),
                ));
                msgs.push(messages::map_message(messages::MAPPED, args));
            }
        }
        for msg in msgs {
            if let Err(e) = self.net.send_to(addr, msg) {
                log::trace!("snapshot push to {} failed: {}", addr, e);
            }
        }
    }

    /// Pushes a local signal's metadata to current subscribers.
    fn push_signal_meta(&mut self, sig_id: Id, removed: bool) {
        let name = self.alloc.name();
        let Some(sig) = self.graph.signal(sig_id) else {
            return;
        };
        let msg = if removed {
            messages::signal_removed(&name, &sig.name)
        } else {
            messages::signal_meta(&name, sig.wire_args())
        };
        for sub in &self.subscribers {
            if sub.flags.contains(SubscribeFlags::SIGNALS) {
                let _ = self.net.send_to(sub.addr, msg.clone());
            }
        }
    }

    fn on_signal_meta(&mut self, device: &str, args: &[OscType]) {
        if device == self.alloc.name() {
            return;
        }
        let Some(mut incoming) = SignalRecord::from_wire(device, args) else {
            log::debug!("malformed signal metadata from {}", device);
            return;
        };
        let full = incoming.full_name();
        match self.graph.signal_id_by_full_name(&full) {
            Some(id) => {
                let sig = self.graph.signal_mut(id).expect("indexed signal");
                let mut scratch = Vec::new();
                incoming.props.to_osc_args(&mut scratch);
                if sig.apply_args(&scratch) > 0 {
                    self.graph.push_event(GraphEvent {
                        kind: RecordType::Signal,
                        id,
                        action: RecordAction::Modified,
                    });
                }
            }
            None => {
                incoming.sync_props();
                self.graph.insert_signal(incoming);
            }
        }
    }

    // ── map protocol ────────────────────────────────────────────────────

    fn on_map(&mut self, srcs: &[String], dst: &str, args: &[OscType]) {
        let has_id = args_have_id(args);
        let we_own_dst = self.owns_signal(dst);
        let we_own_src = srcs.iter().any(|s| self.owns_signal(s));

        if we_own_dst {
            self.stage_map_at_destination(srcs, dst, args, has_id);
        } else if we_own_src && has_id {
            self.join_map_at_source(srcs, dst, args);
        } else if has_id {
            // bystander: replicate
            self.replicate_map(srcs, dst, args, MapStatus::Staged);
        }
        // a /map without an id concerns only the destination owner
    }

    /// The destination owner stages the map and invites the sources.
    fn stage_map_at_destination(
        &mut self,
        srcs: &[String],
        dst: &str,
        args: &[OscType],
        has_id: bool,
    ) {
        if let Some(existing) = self.graph.map_by_endpoints(srcs, dst) {
            // a repeated controller request re-invites sources the first
            // round missed; our own forwarded invite echoes back with an
            // id and must not trigger another round
            if !has_id && self.graph.map(existing).map(|m| m.status) < Some(MapStatus::Active)
            {
                if let Some(map) = self.graph.map(existing) {
                    let invite = messages::map_message(messages::MAP, map.to_wire_args());
                    let _ = self.net.send_bus(invite);
                }
            }
            return;
        }
        let Some(ordered) = MapRecord::order_sources(srcs.to_vec()) else {
            log::warn!("rejecting map with bad source list {:?}", srcs);
            return;
        };
        let Some(dst_sig) = self.graph.signal_by_full_name(dst) else {
            return;
        };
        if dst_sig.dir == Direction::Out {
            log::warn!("rejecting map into output signal {}", dst);
            return;
        }
        let destination = Slot::from_signal(dst_sig, Direction::In);

        let mut sources = Vec::new();
        for name in &ordered {
            let slot = match self.graph.signal_by_full_name(name) {
                Some(sig) => Slot::from_signal(sig, Direction::Out),
                None => Slot::named(name, Direction::Out),
            };
            sources.push(slot);
        }

        let src_devices: BTreeSet<String> = sources
            .iter()
            .map(|s| s.device_name().to_string())
            .collect();
        let process = if src_devices.len() > 1 {
            ProcessLocation::Destination
        } else if src_devices.contains(&self.alloc.name()) {
            ProcessLocation::Destination
        } else {
            ProcessLocation::Source
        };

        self.map_counter += 1;
        let id = self.id.child(0x8000_0000 | self.map_counter);
        let mut map = MapRecord {
            id,
            sources,
            destination,
            mode: MapMode::Raw,
            expression: None,
            process,
            status: MapStatus::Staged,
            muted: false,
            scope: src_devices.clone(),
            protocol: MapProtocol::Udp,
            version: 0,
            props: PropertyTable::new(),
            is_local: true,
            local: Some(LocalMap::default()),
        };
        map.update_from_args(args);
        map.sync_props();
        log::debug!("staged map {:?} -> {} as {:?}", srcs, dst, id);
        self.graph.insert_map(map);

        // local sources need no invitation
        let own_name = self.alloc.name();
        for dev in &src_devices {
            if *dev == own_name {
                if let Some(lm) = self
                    .graph
                    .map_mut(id)
                    .and_then(|m| m.local.as_mut())
                {
                    lm.acks.insert(dev.clone());
                }
            }
        }
        let remote_devices: Vec<String> = src_devices
            .iter()
            .filter(|d| **d != own_name)
            .cloned()
            .collect();
        if !remote_devices.is_empty() {
            if let Some(map) = self.graph.map(id) {
                let invite = messages::map_message(messages::MAP, map.to_wire_args());
                if let Err(e) = self.net.send_bus(invite) {
                    log::warn!("map invite failed: {}", e);
                }
            }
        }
        self.check_map_activation(id);
    }

    /// A source owner joins a map staged by the destination.
    fn join_map_at_source(&mut self, srcs: &[String], dst: &str, args: &[OscType]) {
        let mut created = false;
        let id = match self.graph.map_by_endpoints(srcs, dst) {
            Some(existing) => existing,
            None => {
                created = true;
                let mut sources = Vec::new();
                for name in srcs {
                    let slot = match self.graph.signal_by_full_name(name) {
                        Some(sig) => Slot::from_signal(sig, Direction::Out),
                        None => Slot::named(name, Direction::Out),
                    };
                    sources.push(slot);
                }
                let destination = Slot::named(dst, Direction::In);
                let mut map = MapRecord {
                    id: Id::NONE,
                    sources,
                    destination,
                    mode: MapMode::Raw,
                    expression: None,
                    process: ProcessLocation::Source,
                    status: MapStatus::Ready,
                    muted: false,
                    scope: BTreeSet::new(),
                    protocol: MapProtocol::Udp,
                    version: 0,
                    props: PropertyTable::new(),
                    is_local: true,
                    local: Some(LocalMap::default()),
                };
                map.update_from_args(args);
                if map.id.is_none() {
                    log::warn!("map invite without id for {}", dst);
                    return;
                }
                map.sync_props();
                self.graph.insert_map(map)
            }
        };
        if let Some(map) = self.graph.map_mut(id) {
            map.update_from_args(args);
            if map.status < MapStatus::Ready {
                map.status = MapStatus::Ready;
            }
            map.sync_props();
        }

        // the link to the destination carries this map's data
        let dst_device = dst.trim_start_matches('/').split('/').next().unwrap_or("");
        let dst_dev_id = Id::for_device_name(dst_device);
        let addr = self.graph.device(dst_dev_id).and_then(|d| d.addr());
        let lid = self.graph.ensure_link(self.id, dst_dev_id, addr);
        if created {
            if let Some(link) = self.graph.link_mut(lid) {
                link.num_maps[0] += 1;
            }
        }

        // acknowledge with our slot metadata, naming ourselves so the
        // destination can tick off each source device
        if let Some(map) = self.graph.map(id) {
            let mut args = map.to_wire_args();
            args.push(OscType::String("@status".into()));
            args.push(OscType::String("ready".into()));
            args.push(OscType::String("@srcDev".into()));
            args.push(OscType::String(self.alloc.name()));
            let ack = messages::map_message(messages::MAPPED, args);
            if let Err(e) = self.net.send_bus(ack) {
                log::warn!("map ack failed: {}", e);
            }
        }
    }

    fn replicate_map(&mut self, srcs: &[String], dst: &str, args: &[OscType], status: MapStatus) {
        let id = match self.graph.map_by_endpoints(srcs, dst) {
            Some(id) => id,
            None => {
                let Some(ordered) = MapRecord::order_sources(srcs.to_vec()) else {
                    return;
                };
                let sources = ordered
                    .iter()
                    .map(|name| match self.graph.signal_by_full_name(name) {
                        Some(sig) => Slot::from_signal(sig, Direction::Out),
                        None => Slot::named(name, Direction::Out),
                    })
                    .collect();
                let destination = match self.graph.signal_by_full_name(dst) {
                    Some(sig) => Slot::from_signal(sig, Direction::In),
                    None => Slot::named(dst, Direction::In),
                };
                let mut map = MapRecord {
                    id: Id::NONE,
                    sources,
                    destination,
                    mode: MapMode::Raw,
                    expression: None,
                    process: ProcessLocation::Source,
                    status,
                    muted: false,
                    scope: BTreeSet::new(),
                    protocol: MapProtocol::Udp,
                    version: 0,
                    props: PropertyTable::new(),
                    is_local: false,
                    local: None,
                };
                map.update_from_args(args);
                if map.id.is_none() {
                    return;
                }
                map.sync_props();
                self.graph.insert_map(map)
            }
        };
        if let Some(map) = self.graph.map_mut(id) {
            let changed = map.update_from_args(args);
            if map.status < status {
                map.status = status;
            }
            if changed > 0 {
                map.sync_props();
                self.graph.notify_map_modified(id);
            }
        }
    }

    fn on_mapped(&mut self, srcs: &[String], dst: &str, args: &[OscType]) {
        let status = mapped_status(args);
        let we_own_dst = self.owns_signal(dst);
        let we_own_src = srcs.iter().any(|s| self.owns_signal(s));

        if we_own_dst {
            // a source acknowledged: absorb its slot metadata
            let Some(id) = self.graph.map_by_endpoints(srcs, dst) else {
                return;
            };
            let sender = mapped_src_device(args);
            let mut newly_acked = false;
            if let Some(map) = self.graph.map_mut(id) {
                map.update_from_args(args);
                if let (Some(dev), Some(MapStatus::Ready)) = (sender, status) {
                    if let Some(lm) = map.local.as_mut() {
                        newly_acked = lm.acks.insert(dev);
                    }
                }
                map.sync_props();
            }
            if newly_acked {
                self.check_map_activation(id);
            }
        } else if we_own_src {
            if status == Some(MapStatus::Active) {
                let Some(id) = self.graph.map_by_endpoints(srcs, dst) else {
                    return;
                };
                let mut compile = false;
                if let Some(map) = self.graph.map_mut(id) {
                    if map.is_local && map.status < MapStatus::Active {
                        map.update_from_args(args);
                        map.status = MapStatus::Active;
                        map.sync_props();
                        compile = map.process == ProcessLocation::Source;
                        log::debug!("map {:?} active at source", id);
                    }
                }
                if compile {
                    self.compile_local_map(id);
                }
                self.graph.notify_map_modified(id);
            }
        } else {
            self.replicate_map(srcs, dst, args, status.unwrap_or(MapStatus::Ready));
        }
    }

    /// Activates a destination-owned map once every source device has
    /// acknowledged.
    fn check_map_activation(&mut self, id: Id) {
        let ready = {
            let Some(map) = self.graph.map(id) else { return };
            if map.status >= MapStatus::Active {
                return;
            }
            let Some(lm) = map.local.as_ref() else { return };
            map.sources
                .iter()
                .all(|s| lm.acks.contains(s.device_name()))
        };
        if !ready {
            return;
        }
        if !self.compile_local_map(id) {
            return;
        }
        let own_name = self.alloc.name();
        {
            let Some(map) = self.graph.map_mut(id) else { return };
            map.status = MapStatus::Active;
            map.version += 1;
            map.sync_props();
        }
        // incoming links from each remote source device
        let remote_srcs: Vec<Id> = {
            let map = self.graph.map(id).expect("map just updated");
            map.sources
                .iter()
                .filter(|s| s.device_name() != own_name)
                .map(|s| Id::for_device_name(s.device_name()))
                .collect()
        };
        for dev in remote_srcs {
            let addr = self.graph.device(dev).and_then(|d| d.addr());
            let lid = self.graph.ensure_link(self.id, dev, addr);
            if let Some(link) = self.graph.link_mut(lid) {
                link.num_maps[1] += 1;
            }
        }
        log::debug!("map {:?} active at destination", id);
        if let Some(map) = self.graph.map(id) {
            let mut args = map.to_wire_args();
            args.push(OscType::String("@status".into()));
            args.push(OscType::String("active".into()));
            let announce = messages::map_message(messages::MAPPED, args);
            if let Err(e) = self.net.send_bus(announce) {
                log::warn!("map announce failed: {}", e);
            }
        }
        self.graph.notify_map_modified(id);
    }

    /// Compiles a local map's expression and applies the history depths
    /// it requires. Returns false (and tears the map down) on a bad
    /// expression.
    fn compile_local_map(&mut self, id: Id) -> bool {
        let result = self
            .graph
            .map_mut(id)
            .map(|m| (m.compile_expression(), m.sources.clone(), m.destination.clone()));
        let Some((compiled, sources, destination)) = result else {
            return false;
        };
        match compiled {
            Ok((src_depths, dst_depth)) => {
                for (slot, depth) in sources.iter().zip(&src_depths) {
                    if let Some(sig) = self.graph.signal_mut(slot.signal) {
                        if let Some(ls) = sig.local_mut() {
                            ls.set_history(*depth as usize);
                        }
                    }
                }
                if let Some(sig) = self.graph.signal_mut(destination.signal) {
                    if let Some(ls) = sig.local_mut() {
                        ls.set_history(dst_depth as usize);
                    }
                }
                true
            }
            Err(e) => {
                log::warn!("rejecting map {:?}: {}", id, e);
                self.graph.remove_map(id, RecordAction::Removed);
                let srcs: Vec<String> = sources.iter().map(|s| s.signal_name.clone()).collect();
                let _ = self
                    .net
                    .send_bus(messages::unmap(&srcs, &destination.signal_name));
                false
            }
        }
    }

    fn on_map_modify(&mut self, srcs: &[String], dst: &str, args: &[OscType]) {
        let Some(id) = self.graph.map_by_endpoints(srcs, dst) else {
            return;
        };
        let (changed, is_dst_owner) = {
            let Some(map) = self.graph.map_mut(id) else { return };
            let changed = map.update_from_args(args);
            (changed, map.destination.device_name() == self.alloc.name())
        };
        if changed == 0 {
            return;
        }
        if self.graph.map(id).map(|m| m.is_local) == Some(true) {
            if !self.compile_local_map(id) {
                return;
            }
        }
        self.graph.notify_map_modified(id);
        if is_dst_owner {
            // re-announce so sources and subscribers converge
            if let Some(map) = self.graph.map(id) {
                let mut wire = map.to_wire_args();
                wire.push(OscType::String("@status".into()));
                wire.push(OscType::String("active".into()));
                let _ = self
                    .net
                    .send_bus(messages::map_message(messages::MAPPED, wire));
            }
        }
    }

    fn on_unmap(&mut self, srcs: &[String], dst: &str) {
        let Some(id) = self.graph.map_by_endpoints(srcs, dst) else {
            return;
        };
        let Some(map) = self.graph.remove_map(id, RecordAction::Removed) else {
            return;
        };
        log::debug!("unmapped {:?} -> {}", srcs, dst);
        // release link references held by this map
        let own = self.alloc.name();
        if map.destination.device_name() == own {
            for slot in &map.sources {
                if slot.device_name() != own {
                    let lid =
                        LinkRecord::link_id(self.id, Id::for_device_name(slot.device_name()));
                    if let Some(link) = self.graph.link_mut(lid) {
                        link.num_maps[1] = link.num_maps[1].saturating_sub(1);
                    }
                }
            }
        }
        if map.sources.iter().any(|s| s.device_name() == own) && map.destination.device_name() != own
        {
            let lid = LinkRecord::link_id(
                self.id,
                Id::for_device_name(map.destination.device_name()),
            );
            if let Some(link) = self.graph.link_mut(lid) {
                link.num_maps[0] = link.num_maps[0].saturating_sub(1);
            }
        }
        self.graph.prune_links();
    }

    // ── data path ───────────────────────────────────────────────────────

    fn on_signal_update(
        &mut self,
        signal: &str,
        instance: Option<i64>,
        values: &[OscType],
        time: Timetag,
    ) {
        let Some(id) = self.graph.signal_id_by_full_name(signal) else {
            return;
        };
        let Some(sig) = self.graph.signal(id) else {
            return;
        };
        if !sig.is_local {
            return;
        }
        let (ty, len) = (sig.ty, sig.len);
        let Some(value) = Vector::from_osc_args(ty, values, len.min(values.len()).max(1)) else {
            log::debug!("undecodable update for {}", signal);
            return;
        };
        let key = match instance {
            Some(gid) => InstKey::Global(gid as u64),
            None => InstKey::Single,
        };
        self.internal_write(id, key, value, time);
    }

    fn on_slot_update(
        &mut self,
        signal: &str,
        slot: usize,
        instance: Option<i64>,
        values: &[OscType],
        time: Timetag,
    ) {
        if !self.owns_signal(signal) {
            return;
        }
        let Some(map_id) = self
            .graph
            .maps
            .values()
            .find(|m| {
                m.is_local
                    && m.status == MapStatus::Active
                    && m.destination.signal_name == signal.trim_start_matches('/')
                    && m.process == ProcessLocation::Destination
            })
            .map(|m| m.id)
        else {
            return;
        };
        let key = match instance {
            Some(gid) => InstKey::Global(gid as u64),
            None => InstKey::Single,
        };
        let Some(map) = self.graph.map_mut(map_id) else { return };
        let Some(slot_meta) = map.sources.get(slot) else { return };
        let (ty, len) = (slot_meta.ty, slot_meta.len);
        let Some(value) = Vector::from_osc_args(ty, values, len.min(values.len()).max(1)) else {
            return;
        };
        let mlen = map
            .local
            .as_ref()
            .and_then(|lm| lm.slot_mlen.get(slot).copied())
            .unwrap_or(1);
        if let Some(lm) = map.local.as_mut() {
            let buf = lm
                .slot_buffers
                .entry((slot, key.as_u64()))
                .or_insert_with(|| ValueBuffer::new(ty, len, mlen));
            buf.write(&value, time);
        }
        self.pending_evals.push(PendingEval {
            map: map_id,
            slot,
            key,
            time,
        });
    }

    fn on_signal_release(
        &mut self,
        signal: &str,
        instance: i64,
        src: SocketAddr,
        time: Timetag,
    ) {
        let Some(id) = self.graph.signal_id_by_full_name(signal) else {
            return;
        };
        if self.graph.signal(id).map(|s| s.is_local) != Some(true) {
            return;
        }
        let sender = self.device_name_by_addr(src);
        let gid = instance as u64;

        // incoming maps decide by scope whether to honour the release
        let incoming: Vec<Id> = self
            .graph
            .maps_for_signal(id, true)
            .filter(|m| m.status == MapStatus::Active)
            .map(|m| m.id)
            .collect();
        if !incoming.is_empty() {
            let honoured = incoming.iter().any(|mid| {
                self.graph
                    .map(*mid)
                    .map(|m| sender.as_deref().map(|s| m.in_scope(s)).unwrap_or(false))
                    .unwrap_or(false)
            });
            if !honoured {
                log::debug!(
                    "ignoring release of {} from out-of-scope device {:?}",
                    signal,
                    sender
                );
                return;
            }
            for mid in &incoming {
                if let Some(lm) = self.graph.map_mut(*mid).and_then(|m| m.local.as_mut()) {
                    lm.states.remove(&gid);
                }
            }
            self.release_local_instance(id, InstKey::Global(gid), true, time);
        } else {
            // a downstream peer let go of one of our source streams
            self.release_local_instance(id, InstKey::Global(gid), false, time);
        }
    }

    /// Activates/updates a local signal instance from a delivered value,
    /// fires callbacks and routes onward maps.
    fn internal_write(&mut self, sig_id: Id, key: InstKey, value: Vector, time: Timetag) {
        let mut new_event = None;
        let mut overflow = false;
        let mut stolen: Option<(u32, Option<u64>)> = None;
        let mut written: Option<(u32, Option<u64>, Vector)> = None;
        {
            let Some(sig) = self.graph.signal_mut(sig_id) else { return };
            let steal = sig.steal;
            let Some(ls) = sig.local.as_mut() else { return };
            let activation = match key {
                InstKey::Single => ls.activate(0, steal),
                InstKey::Global(g) => ls.activate_global(g, steal),
            };
            let idx = match activation {
                Activation::Existing(i) => Some(i),
                Activation::Fresh(i) => {
                    new_event = Some(i);
                    Some(i)
                }
                Activation::Stolen {
                    index,
                    victim_local,
                    victim_global,
                } => {
                    stolen = Some((victim_local, victim_global));
                    new_event = Some(index);
                    Some(index)
                }
                Activation::Overflow => {
                    overflow = true;
                    None
                }
            };
            if let Some(i) = idx {
                let inst = &mut ls.instances[i];
                inst.buffer.write(&value, time);
                inst.status.insert(crate::signal::InstanceStatus::UPDATED);
                written = Some((
                    inst.local_id,
                    inst.global_id,
                    inst.buffer.read(0).cloned().unwrap_or(value.clone()),
                ));
            }
        }

        if overflow {
            self.fire_event(sig_id, SignalEvents::INST_OFLW, 0, None, None, time);
            return;
        }
        if let Some((victim_local, victim_global)) = stolen {
            self.fire_event(
                sig_id,
                SignalEvents::REL_UPSTRM,
                victim_local,
                victim_global,
                None,
                time,
            );
            self.forward_release(sig_id, victim_global, time);
        }
        let Some((local_id, global_id, stored)) = written else {
            return;
        };
        if let Some(_idx) = new_event {
            self.fire_event(sig_id, SignalEvents::INST_NEW, local_id, global_id, None, time);
        }
        self.fire_event(
            sig_id,
            SignalEvents::UPDATE,
            local_id,
            global_id,
            Some(stored),
            time,
        );
        self.route_signal(sig_id, key, time);
    }

    /// Queues evaluations and raw forwards for every active outgoing map
    /// of a local signal.
    fn route_signal(&mut self, sig_id: Id, key: InstKey, time: Timetag) {
        let own = self.alloc.name();
        struct Route {
            map: Id,
            slot: usize,
            dst_device: Id,
            dst_name: String,
            forward_raw: bool,
        }
        let routes: Vec<Route> = self
            .graph
            .maps_for_signal(sig_id, false)
            .filter(|m| m.status == MapStatus::Active && !m.muted)
            .filter_map(|m| {
                let slot = m.sources.iter().position(|s| s.signal == sig_id)?;
                let dst_remote = m.destination.device_name() != own;
                Some(Route {
                    map: m.id,
                    slot,
                    dst_device: Id::for_device_name(m.destination.device_name()),
                    dst_name: m.destination.signal_name.clone(),
                    forward_raw: dst_remote && m.process == ProcessLocation::Destination,
                })
            })
            .collect();

        for route in routes {
            if route.forward_raw {
                // raw source sample travels to the destination's evaluator
                let value = self.current_value(sig_id, key);
                if let Some(value) = value {
                    let msg = messages::slot_update(
                        &route.dst_name,
                        route.slot,
                        key.wire_id(),
                        &value,
                    );
                    self.queue_on_link(route.dst_device, time, msg);
                }
            } else {
                self.pending_evals.push(PendingEval {
                    map: route.map,
                    slot: route.slot,
                    key,
                    time,
                });
            }
        }
    }

    fn current_value(&self, sig_id: Id, key: InstKey) -> Option<Vector> {
        let sig = self.graph.signal(sig_id)?;
        let ls = sig.local()?;
        let idx = match key {
            InstKey::Single => ls.find_by_local(0),
            InstKey::Global(g) => ls.find_by_global(g),
        }?;
        ls.instances[idx].buffer().read(0).cloned()
    }

    fn drain_pending_evals(&mut self) {
        if self.pending_evals.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_evals);
        // coalesce per (map, instance): one evaluation per arrival group
        let mut jobs: Vec<PendingEval> = Vec::new();
        for p in pending {
            match jobs.iter_mut().find(|j| j.map == p.map && j.key == p.key) {
                Some(j) => {
                    j.slot = p.slot;
                    j.time = p.time;
                }
                None => jobs.push(p),
            }
        }
        for job in jobs {
            self.process_map(job);
        }
        self.drain_local_deliveries();
    }

    /// Runs one map evaluation and delivers its output.
    fn process_map(&mut self, job: PendingEval) {
        let (sources, destination, dst_local) = {
            let Some(map) = self.graph.map(job.map) else { return };
            if map.status != MapStatus::Active || map.muted || map.local.is_none() {
                return;
            }
            (
                map.sources.clone(),
                map.destination.clone(),
                map.destination.device_name() == self.alloc.name(),
            )
        };
        let Some(mut lm) = self.graph.map_mut(job.map).and_then(|m| m.local.take()) else {
            return;
        };

        // instance-reducing expressions run once and feed the
        // destination's singleton stream
        let eval_once = lm
            .expr
            .as_ref()
            .map(|e| e.eval_once())
            .unwrap_or(false);
        let job = if eval_once {
            PendingEval {
                key: InstKey::Single,
                ..job
            }
        } else {
            job
        };

        let outcome = {
            let LocalMap {
                expr,
                states,
                slot_buffers,
                dst_buffers,
                ..
            } = &mut lm;
            match expr.as_ref() {
                Some(expr) => {
                    let graph = &self.graph;
                    let mut srcs: Vec<SlotSource<'_>> = Vec::with_capacity(sources.len());
                    for (i, slot) in sources.iter().enumerate() {
                        let local_sig =
                            graph.signal(slot.signal).filter(|s| s.is_local && s.local.is_some());
                        let view = match local_sig {
                            Some(sig) => {
                                let ls = sig.local().expect("checked above");
                                let cur = match job.key {
                                    InstKey::Single => ls.find_by_local(0),
                                    InstKey::Global(g) => {
                                        ls.find_by_global(g).or_else(|| ls.find_by_local(0))
                                    }
                                }
                                .map(|ix| ls.instances[ix].buffer());
                                SlotSource {
                                    cur,
                                    all: ls
                                        .active_indices()
                                        .map(|ix| ls.instances[ix].buffer())
                                        .collect(),
                                    pool_size: ls.pool_size(),
                                    time: cur.and_then(|b| b.time(0)).unwrap_or(job.time),
                                }
                            }
                            None => {
                                let cur = slot_buffers
                                    .get(&(i, job.key.as_u64()))
                                    .or_else(|| slot_buffers.get(&(i, 0)));
                                SlotSource {
                                    cur,
                                    all: slot_buffers
                                        .iter()
                                        .filter(|((s, _), _)| *s == i)
                                        .map(|(_, b)| b)
                                        .collect(),
                                    pool_size: slot.num_instances,
                                    time: cur.and_then(|b| b.time(0)).unwrap_or(job.time),
                                }
                            }
                        };
                        srcs.push(view);
                    }

                    let dst_buf: Option<&ValueBuffer> = if dst_local {
                        graph
                            .signal(destination.signal)
                            .and_then(|s| s.local())
                            .and_then(|ls| {
                                match job.key {
                                    InstKey::Single => ls.find_by_local(0),
                                    InstKey::Global(g) => ls.find_by_global(g),
                                }
                                .map(|ix| ls.instances[ix].buffer())
                            })
                    } else {
                        dst_buffers.get(&job.key.as_u64())
                    };
                    let dst_time = dst_buf.and_then(|b| b.time(0)).unwrap_or(job.time);

                    let state = states
                        .entry(job.key.as_u64())
                        .or_insert_with(|| ExprState::new(expr));
                    evaluate(
                        expr,
                        state,
                        &EvalParams {
                            srcs: &srcs,
                            dst: dst_buf,
                            dst_time,
                            newest: job.slot,
                        },
                    )
                }
                None => None,
            }
        };

        // boundary actions shape the sample before anything records it
        let mut outcome = outcome;
        if let Some(out) = &mut outcome {
            if out.flags.contains(EvalFlags::UPDATE) {
                let suppressed = match out.value.as_mut() {
                    Some(value) => !destination.apply_boundary(value),
                    None => true,
                };
                if suppressed {
                    out.flags.remove(EvalFlags::UPDATE);
                    out.value = None;
                }
            }
        }

        // the shadow ring mirrors what the remote destination will hold,
        // so history reads agree on both sides
        if let Some(out) = &outcome {
            if !dst_local {
                let ty = destination.ty;
                let len = destination.len;
                let mlen = lm.dst_mlen.max(1);
                let shadow = lm
                    .dst_buffers
                    .entry(job.key.as_u64())
                    .or_insert_with(|| ValueBuffer::new(ty, len, mlen));
                for (offset, value) in &out.history_writes {
                    shadow.write_history(*offset, value, job.time);
                }
                if let Some(value) = &out.value {
                    shadow.write(value, job.time);
                }
            }
        }
        if let Some(map) = self.graph.map_mut(job.map) {
            map.local = Some(lm);
        }

        let Some(out) = outcome else { return };

        if out.flags.contains(EvalFlags::RELEASE_BEFORE_UPDATE) {
            self.deliver_release(&destination, dst_local, job.key, job.time);
            return;
        }

        if let Some(value) = out.value {
            if dst_local {
                if !out.history_writes.is_empty() {
                    self.apply_local_history(
                        destination.signal,
                        job.key,
                        &out.history_writes,
                        job.time,
                    );
                }
                self.pending_local.push_back(LocalDelivery {
                    signal: destination.signal,
                    key: job.key,
                    value,
                    time: job.time,
                });
            } else {
                let msg = messages::signal_update(
                    &destination.signal_name,
                    job.key.wire_id(),
                    &value,
                );
                let dst_dev = Id::for_device_name(destination.device_name());
                self.queue_on_link(dst_dev, job.time, msg);
            }
        }

        if out.flags.contains(EvalFlags::RELEASE_AFTER_UPDATE) {
            self.deliver_release(&destination, dst_local, job.key, job.time);
        }
    }

    fn apply_local_history(
        &mut self,
        sig_id: Id,
        key: InstKey,
        writes: &[(i32, Vector)],
        time: Timetag,
    ) {
        let Some(sig) = self.graph.signal_mut(sig_id) else { return };
        let Some(ls) = sig.local.as_mut() else { return };
        let idx = match key {
            InstKey::Single => ls.find_by_local(0),
            InstKey::Global(g) => ls.find_by_global(g),
        };
        if let Some(ix) = idx {
            for (offset, value) in writes {
                ls.instances[ix].buffer.write_history(*offset, value, time);
            }
        }
    }

    fn deliver_release(&mut self, destination: &Slot, dst_local: bool, key: InstKey, time: Timetag) {
        if dst_local {
            self.release_local_instance(destination.signal, key, true, time);
        } else if let InstKey::Global(gid) = key {
            let msg = messages::signal_release(&destination.signal_name, gid as i64);
            let dst_dev = Id::for_device_name(destination.device_name());
            self.queue_on_link(dst_dev, time, msg);
        }
    }

    fn release_local_instance(&mut self, sig_id: Id, key: InstKey, upstream: bool, time: Timetag) {
        let mut released: Option<(u32, Option<u64>)> = None;
        {
            let Some(sig) = self.graph.signal_mut(sig_id) else { return };
            let Some(ls) = sig.local.as_mut() else { return };
            let idx = match key {
                InstKey::Single => ls.find_by_local(0),
                InstKey::Global(g) => ls.find_by_global(g),
            };
            if let Some(ix) = idx {
                released = Some((ls.instances[ix].local_id, ls.instances[ix].global_id));
                ls.release(ix, upstream);
            }
        }
        let Some((local_id, global_id)) = released else { return };
        let event = if upstream {
            SignalEvents::REL_UPSTRM
        } else {
            SignalEvents::REL_DNSTRM
        };
        self.fire_event(sig_id, event, local_id, global_id, None, time);
        // chained maps propagate the release further downstream
        self.forward_release(sig_id, global_id, time);
    }

    /// Sends release messages for a released source instance along every
    /// active outgoing map.
    fn forward_release(&mut self, sig_id: Id, global_id: Option<u64>, time: Timetag) {
        let Some(gid) = global_id else { return };
        let own = self.alloc.name();
        let targets: Vec<(Id, String, bool)> = self
            .graph
            .maps_for_signal(sig_id, false)
            .filter(|m| m.status == MapStatus::Active)
            .map(|m| {
                (
                    Id::for_device_name(m.destination.device_name()),
                    m.destination.signal_name.clone(),
                    m.destination.device_name() == own,
                )
            })
            .collect();
        for (dst_dev, dst_name, local) in targets {
            if local {
                if let Some(dst_id) = self.graph.signal_id_by_full_name(&dst_name) {
                    self.release_local_instance(dst_id, InstKey::Global(gid), true, time);
                }
            } else {
                let msg = messages::signal_release(&dst_name, gid as i64);
                self.queue_on_link(dst_dev, time, msg);
            }
        }
    }

    fn drain_local_deliveries(&mut self) {
        if self.delivering {
            return;
        }
        self.delivering = true;
        let mut budget = MAX_LOCAL_DELIVERIES;
        while let Some(d) = self.pending_local.pop_front() {
            if budget == 0 {
                log::warn!(
                    "local delivery budget exhausted; {} updates dropped (map cycle?)",
                    self.pending_local.len() + 1
                );
                self.pending_local.clear();
                break;
            }
            budget -= 1;
            self.internal_write(d.signal, d.key, d.value, d.time);
            // evaluations caused by the delivery run in the same sweep
            let pending = std::mem::take(&mut self.pending_evals);
            for p in pending {
                self.process_map(p);
            }
        }
        self.delivering = false;
    }

    fn queue_on_link(&mut self, remote: Id, time: Timetag, msg: OscMessage) {
        let lid = LinkRecord::link_id(self.id, remote);
        match self.graph.link_mut(lid) {
            Some(link) => {
                if !link.has_queued() {
                    link.start_queue(time);
                }
                link.queue_message(msg);
            }
            None => {
                // no link record: send unbundled, best effort
                if let Some(addr) = self.graph.device(remote).and_then(|d| d.addr()) {
                    let _ = self.net.send_to(addr, msg);
                } else {
                    log::trace!("dropping message for unknown device {:?}", remote);
                }
            }
        }
    }

    // ── signal API ──────────────────────────────────────────────────────

    /// Declares a local signal. The signal is announced to subscribers
    /// and becomes mappable once the device is registered.
    pub fn add_signal(&mut self, builder: SignalBuilder) -> MapflowResult<Id> {
        if builder.name.is_empty() || builder.name.contains('/') {
            return Err(MapflowError::InvalidArgument(format!(
                "bad signal name '{}'",
                builder.name
            )));
        }
        if builder.len < 1 || builder.len > crate::value::MAX_VECTOR_LEN {
            return Err(MapflowError::InvalidArgument(format!(
                "vector length {} out of range",
                builder.len
            )));
        }
        if let (Some(min), Some(max)) = (&builder.min, &builder.max) {
            for i in 0..min.len().min(max.len()) {
                if min.get(i) > max.get(i) {
                    return Err(MapflowError::Misuse("signal min above max".into()));
                }
            }
        }
        let device_name = self.alloc.name();
        if self
            .graph
            .signal_by_full_name(&format!("{}/{}", device_name, builder.name))
            .is_some()
        {
            return Err(MapflowError::Misuse(format!(
                "signal '{}' already exists",
                builder.name
            )));
        }

        self.sig_counter += 1;
        let id = Id::for_device_name(&device_name).child(self.sig_counter);
        let mut sig = SignalRecord {
            id,
            device: Id::for_device_name(&device_name),
            device_name,
            name: builder.name,
            dir: builder.dir,
            ty: builder.ty,
            len: builder.len,
            unit: builder.unit,
            min: builder.min,
            max: builder.max,
            num_instances: builder.num_instances,
            steal: builder.steal,
            event_mask: builder.event_mask,
            version: 0,
            props: PropertyTable::new(),
            is_local: true,
            local: Some(LocalSignal::new(
                builder.ty,
                builder.len,
                builder.num_instances,
                1,
            )),
        };
        sig.sync_props();
        self.graph.insert_signal(sig);
        self.bump_version();
        self.push_signal_meta(id, false);
        Ok(id)
    }

    /// Removes a local signal; deferred to the end of the poll when
    /// requested from inside a callback.
    pub fn remove_signal(&mut self, id: Id) -> MapflowResult<()> {
        if self.graph.signal(id).map(|s| s.is_local) != Some(true) {
            return Err(MapflowError::NotFound(format!("signal {:?}", id)));
        }
        if self.in_callback {
            self.deferred_signal_removals.push(id);
            return Ok(());
        }
        self.push_signal_meta(id, true);
        self.graph.remove_signal(id, RecordAction::Removed);
        self.callbacks.remove(&id);
        self.bump_version();
        Ok(())
    }

    fn flush_deferred_removals(&mut self) {
        let deferred = std::mem::take(&mut self.deferred_signal_removals);
        for id in deferred {
            let _ = self.remove_signal(id);
        }
    }

    pub fn set_callback(&mut self, signal: Id, cb: SignalCallback) {
        self.callbacks.insert(signal, cb);
    }

    /// Writes the singleton instance of a local output signal.
    pub fn set_value(&mut self, signal: Id, value: Vector, time: Timetag) -> MapflowResult<()> {
        self.write_signal(signal, None, value, time)
    }

    /// Writes a specific instance, activating it if needed.
    pub fn set_value_instanced(
        &mut self,
        signal: Id,
        instance: u32,
        value: Vector,
        time: Timetag,
    ) -> MapflowResult<()> {
        self.write_signal(signal, Some(instance), value, time)
    }

    fn write_signal(
        &mut self,
        signal: Id,
        instance: Option<u32>,
        value: Vector,
        time: Timetag,
    ) -> MapflowResult<()> {
        let Some(sig) = self.graph.signal(signal) else {
            return Err(MapflowError::NotFound(format!("signal {:?}", signal)));
        };
        if !sig.is_local {
            return Err(MapflowError::Misuse("cannot write a remote signal".into()));
        }
        if sig.dir == Direction::In {
            return Err(MapflowError::Misuse(
                "cannot write an input signal; it is driven by its maps".into(),
            ));
        }
        if value.is_empty() {
            return Err(MapflowError::InvalidArgument("empty value".into()));
        }
        let instanced = sig.num_instances > 1 || instance.is_some();
        let key = if instanced {
            let local_id = instance.unwrap_or(0);
            let gid = match self.idmap.find_by_local(local_id) {
                Some(h) => self.idmap.get(h).map(|e| e.global).unwrap_or_default(),
                None => {
                    let gid = self.id.as_u64() | local_id as u64;
                    self.idmap.add(local_id, gid);
                    gid
                }
            };
            InstKey::Global(gid)
        } else {
            InstKey::Single
        };
        self.internal_write(signal, key, value, time);
        self.drain_pending_evals();
        Ok(())
    }

    /// Releases a local signal instance and propagates the release to
    /// every downstream consumer.
    pub fn release_instance(
        &mut self,
        signal: Id,
        instance: u32,
        time: Timetag,
    ) -> MapflowResult<()> {
        let gid = {
            let Some(sig) = self.graph.signal(signal) else {
                return Err(MapflowError::NotFound(format!("signal {:?}", signal)));
            };
            let Some(ls) = sig.local() else {
                return Err(MapflowError::Misuse("cannot release a remote signal".into()));
            };
            let Some(idx) = ls.find_by_local(instance) else {
                return Err(MapflowError::NotFound(format!("instance {}", instance)));
            };
            ls.instances[idx].global_id
        };
        let key = match gid {
            Some(g) => InstKey::Global(g),
            None => InstKey::Single,
        };
        if let Some(h) = self.idmap.find_by_local(instance) {
            self.idmap.decr_local(h);
        }
        self.release_local_instance(signal, key, true, time);
        Ok(())
    }

    // ── map API ─────────────────────────────────────────────────────────

    /// Requests a map over the bus. Any peer may originate this; the
    /// destination's device stages and negotiates it.
    pub fn map_create(&mut self, builder: MapBuilder) -> MapflowResult<()> {
        if builder.sources.is_empty() || builder.sources.len() > MAX_MAP_SOURCES {
            return Err(MapflowError::InvalidArgument(format!(
                "need 1..={} sources",
                MAX_MAP_SOURCES
            )));
        }
        let Some(ordered) = MapRecord::order_sources(builder.sources.clone()) else {
            return Err(MapflowError::InvalidArgument(
                "duplicate source signal".into(),
            ));
        };
        let mut args: Vec<OscType> = ordered
            .iter()
            .map(|s| OscType::String(s.clone()))
            .collect();
        args.push(OscType::String("->".into()));
        args.push(OscType::String(
            builder.destination.trim_start_matches('/').to_string(),
        ));
        if let Some(mode) = builder.mode {
            args.push(OscType::String("@mode".into()));
            args.push(OscType::String(mode.as_str().into()));
        }
        if let Some(expr) = &builder.expression {
            args.push(OscType::String("@expr".into()));
            args.push(OscType::String(expr.clone()));
        }
        if let Some(process) = builder.process {
            args.push(OscType::String("@process".into()));
            args.push(OscType::String(process.as_str().into()));
        }
        if builder.muted {
            args.push(OscType::String("@muted".into()));
            args.push(OscType::Bool(true));
        }
        if !builder.scope.is_empty() {
            args.push(OscType::String("@scope".into()));
            for dev in &builder.scope {
                args.push(OscType::String(dev.clone()));
            }
        }
        self.net
            .send_bus(messages::map_message(messages::MAP, args))?;
        Ok(())
    }

    /// Requests removal of a map over the bus.
    pub fn map_remove(&mut self, sources: &[&str], destination: &str) -> MapflowResult<()> {
        let srcs: Vec<String> = sources.iter().map(|s| s.to_string()).collect();
        self.net.send_bus(messages::unmap(&srcs, destination))?;
        Ok(())
    }

    // ── subscription API ────────────────────────────────────────────────

    /// Subscribes to a remote device's graph. `lease = -1` auto-renews.
    pub fn subscribe(
        &mut self,
        device: Id,
        flags: SubscribeFlags,
        lease: i32,
    ) -> MapflowResult<()> {
        if self.graph.device(device).is_none() {
            return Err(MapflowError::NotFound(format!("device {:?}", device)));
        }
        let lease_secs = if lease < 0 {
            AUTOSUBSCRIBE_LEASE_SEC
        } else {
            lease
        };
        self.send_subscribe(device, flags, lease_secs);
        let expiry = self.clock.now().as_secs_f64() + lease_secs as f64;
        match self.graph.subscription_mut(device) {
            Some(sub) => {
                sub.flags = flags;
                sub.lease_expiry = expiry;
                sub.auto_renew = lease < 0;
            }
            None => self.graph.subscriptions.push(Subscription {
                device,
                flags,
                lease_expiry: expiry,
                auto_renew: lease < 0,
            }),
        }
        if let Some(dev) = self.graph.device_mut(device) {
            dev.subscribed = true;
        }
        Ok(())
    }

    pub fn unsubscribe(&mut self, device: Id) {
        if let Some(dev) = self.graph.device(device) {
            let name = dev.name.clone();
            let addr = dev.addr();
            let msg = messages::unsubscribe(&name);
            match addr {
                Some(addr) => {
                    let _ = self.net.send_to(addr, msg);
                }
                None => {
                    let _ = self.net.send_bus(msg);
                }
            }
        }
        self.graph.remove_subscription(device);
    }

    fn send_subscribe(&mut self, device: Id, flags: SubscribeFlags, lease: i32) {
        let Some(dev) = self.graph.device(device) else { return };
        let name = dev.name.clone();
        let addr = dev.addr();
        let msg = messages::subscribe(&name, flags, lease, dev.version);
        match addr {
            Some(addr) => {
                let _ = self.net.send_to(addr, msg);
            }
            None => {
                let _ = self.net.send_bus(msg);
            }
        }
    }

    // ── helpers ─────────────────────────────────────────────────────────

    fn bump_version(&mut self) {
        self.version += 1;
        if self.id.is_none() {
            return;
        }
        let version = self.version;
        if let Some(dev) = self.graph.device_mut(self.id) {
            dev.version = version;
            dev.sync_props();
        }
    }

    fn owns_signal(&self, full_name: &str) -> bool {
        full_name
            .trim_start_matches('/')
            .split('/')
            .next()
            .map(|d| d == self.alloc.name() && self.is_ready())
            .unwrap_or(false)
    }

    fn device_name_by_addr(&self, addr: SocketAddr) -> Option<String> {
        self.graph
            .devices
            .values()
            .find(|d| d.addr() == Some(addr))
            .map(|d| d.name.clone())
    }

    fn fire_event(
        &mut self,
        signal: Id,
        event: SignalEvents,
        instance: u32,
        global: Option<u64>,
        value: Option<Vector>,
        time: Timetag,
    ) {
        let masked = self
            .graph
            .signal(signal)
            .map(|s| s.event_mask.contains(event))
            .unwrap_or(false);
        if !masked {
            return;
        }
        let Some(mut cb) = self.callbacks.remove(&signal) else {
            return;
        };
        let ev = SignalEvent {
            signal,
            event,
            instance,
            global,
            value,
            time,
        };
        let was_in_callback = self.in_callback;
        self.in_callback = true;
        cb(self, &ev);
        self.in_callback = was_in_callback;
        self.callbacks.entry(signal).or_insert(cb);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.alloc.name())
            .field("registered", &self.alloc.is_registered())
            .field("graph", &self.graph)
            .finish()
    }
}

/// True when the argument list carries an `@id` group.
fn args_have_id(args: &[OscType]) -> bool {
    crate::properties::split_arg_groups(args)
        .iter()
        .any(|(k, _)| *k == "@id")
}

/// Reads the `@srcDev` acknowledgement tag off a `/mapped` message.
fn mapped_src_device(args: &[OscType]) -> Option<String> {
    for (key, values) in crate::properties::split_arg_groups(args) {
        if key == "@srcDev" {
            if let Some(OscType::String(s)) = values.first() {
                return Some(s.clone());
            }
        }
    }
    None
}

/// Reads the `@status` hint off a `/mapped` message.
fn mapped_status(args: &[OscType]) -> Option<MapStatus> {
    for (key, values) in crate::properties::split_arg_groups(args) {
        if key == "@status" {
            return match values.first() {
                Some(OscType::String(s)) if s == "active" => Some(MapStatus::Active),
                Some(OscType::String(s)) if s == "ready" => Some(MapStatus::Ready),
                _ => None,
            };
        }
    }
    None
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Per-test bus port, salted so suites running in parallel processes
    /// do not cross-talk.
    fn test_port(salt: u16) -> u16 {
        24000 + (std::process::id() as u16 % 1500) + salt * 7
    }

    fn device(base: &str, port: u16) -> Device {
        Device::new(base, NetworkConfig::loopback(port)).unwrap()
    }

    fn wait_ready(devs: &mut [&mut Device]) {
        for _ in 0..4000 {
            let mut all = true;
            for d in devs.iter_mut() {
                d.poll(1);
                all &= d.is_ready();
            }
            if all {
                // one extra round so registration announcements land
                for d in devs.iter_mut() {
                    d.poll(2);
                }
                return;
            }
        }
        panic!("devices never registered");
    }

    fn wait_map_active(a: &mut Device, b: &mut Device) {
        for _ in 0..4000 {
            a.poll(1);
            b.poll(1);
            let active = |d: &Device| {
                d.graph()
                    .maps()
                    .filter(|m| m.status == MapStatus::Active)
                    .count()
                    >= 1
            };
            if active(a) && active(b) {
                return;
            }
        }
        panic!("map never activated");
    }

    fn pump(a: &mut Device, b: &mut Device, rounds: usize) {
        for _ in 0..rounds {
            a.poll(1);
            b.poll(1);
        }
    }

    fn collect_values(dev: &mut Device, signal: Id) -> Rc<RefCell<Vec<f64>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        dev.set_callback(
            signal,
            Box::new(move |_, ev| {
                if ev.event == SignalEvents::UPDATE {
                    if let Some(v) = &ev.value {
                        sink.borrow_mut().push(v.get(0));
                    }
                }
            }),
        );
        seen
    }

    #[test]
    fn raw_map_delivers_values_unchanged() {
        let port = test_port(1);
        let mut a = device("alpha", port);
        let mut b = device("beta", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(SignalBuilder::output("out").with_type(ScalarType::Int32))
            .unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(MapBuilder::new(
            &[&format!("{}/out", a.name())],
            &format!("{}/in", b.name()),
        ))
        .unwrap();
        wait_map_active(&mut a, &mut b);

        for v in [0, 5, 10, -3] {
            let t = a.now();
            a.set_value(out, Vector::I32(vec![v]), t).unwrap();
            pump(&mut a, &mut b, 10);
        }
        assert_eq!(*seen.borrow(), vec![0.0, 5.0, 10.0, -3.0]);
    }

    #[test]
    fn expression_map_transforms_each_sample() {
        let port = test_port(2);
        let mut a = device("gamma", port);
        let mut b = device("delta", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(SignalBuilder::output("out").with_type(ScalarType::Int32))
            .unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[&format!("{}/out", a.name())],
                &format!("{}/in", b.name()),
            )
            .with_expression("y = x*x + 1"),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        for v in [0, 1, 2, 3] {
            let t = a.now();
            a.set_value(out, Vector::I32(vec![v]), t).unwrap();
            pump(&mut a, &mut b, 10);
        }
        assert_eq!(*seen.borrow(), vec![1.0, 2.0, 5.0, 10.0]);
    }

    #[test]
    fn vector_mean_reduces_to_scalar() {
        let port = test_port(3);
        let mut a = device("epsilon", port);
        let mut b = device("zeta", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(
                SignalBuilder::output("out")
                    .with_type(ScalarType::Int32)
                    .with_length(3),
            )
            .unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[&format!("{}/out", a.name())],
                &format!("{}/in", b.name()),
            )
            .with_expression("y = x.vector.mean()"),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        let t = a.now();
        a.set_value(out, Vector::I32(vec![0, 6, 12]), t).unwrap();
        pump(&mut a, &mut b, 20);
        assert_eq!(*seen.borrow(), vec![6.0]);
    }

    #[test]
    fn instance_sum_tracks_activation_and_release() {
        let port = test_port(4);
        let mut a = device("eta", port);
        let mut b = device("theta", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(
                SignalBuilder::output("out")
                    .with_type(ScalarType::Int32)
                    .with_instances(8),
            )
            .unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[&format!("{}/out", a.name())],
                &format!("{}/in", b.name()),
            )
            .with_expression("y = x.instance.sum()"),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        for i in 1..=4u32 {
            let t = a.now();
            a.set_value_instanced(out, i, Vector::I32(vec![10]), t).unwrap();
            pump(&mut a, &mut b, 10);
        }
        assert_eq!(seen.borrow().last(), Some(&40.0));

        let t = a.now();
        a.release_instance(out, 2, t).unwrap();
        pump(&mut a, &mut b, 10);
        a.set_value_instanced(out, 1, Vector::I32(vec![10]), a.now())
            .unwrap();
        pump(&mut a, &mut b, 10);
        assert_eq!(seen.borrow().last(), Some(&30.0));
    }

    #[test]
    fn same_base_names_get_distinct_ordinals() {
        let port = test_port(5);
        let mut a = device("dev", port);
        let mut b = device("dev", port);
        wait_ready(&mut [&mut a, &mut b]);

        assert_ne!(a.name(), b.name());
        let mut names = vec![a.name(), b.name()];
        names.sort();
        assert_eq!(names, vec!["dev.1".to_string(), "dev.2".to_string()]);
    }

    #[test]
    fn history_filter_needs_a_past_sample() {
        let port = test_port(6);
        let mut a = device("iota", port);
        let mut b = device("kappa", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a.add_signal(SignalBuilder::output("out")).unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[&format!("{}/out", a.name())],
                &format!("{}/in", b.name()),
            )
            .with_expression("y = x{-1} * 0.5 + x * 0.5"),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        for v in [0.0f32, 10.0, 20.0] {
            let t = a.now();
            a.set_value(out, Vector::F32(vec![v]), t).unwrap();
            pump(&mut a, &mut b, 10);
        }
        // the first update has no history and produces nothing
        assert_eq!(*seen.borrow(), vec![5.0, 15.0]);
    }

    #[test]
    fn convergent_map_sums_latest_samples() {
        let port = test_port(7);
        let mut a = device("lambda", port);
        let mut b = device("mu", port);
        wait_ready(&mut [&mut a, &mut b]);

        let s0 = a.add_signal(SignalBuilder::output("s0")).unwrap();
        let s1 = a.add_signal(SignalBuilder::output("s1")).unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[
                    &format!("{}/s0", a.name()),
                    &format!("{}/s1", a.name()),
                ],
                &format!("{}/in", b.name()),
            )
            .with_expression("y = x$0 + x$1"),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        // nothing until both sources have produced
        a.set_value(s0, Vector::F32(vec![1.0]), a.now()).unwrap();
        pump(&mut a, &mut b, 10);
        assert!(seen.borrow().is_empty());

        a.set_value(s1, Vector::F32(vec![2.0]), a.now()).unwrap();
        pump(&mut a, &mut b, 10);
        assert_eq!(seen.borrow().last(), Some(&3.0));

        // one output per x$0 update, reading the stale x$1
        a.set_value(s0, Vector::F32(vec![5.0]), a.now()).unwrap();
        pump(&mut a, &mut b, 10);
        a.set_value(s0, Vector::F32(vec![6.0]), a.now()).unwrap();
        pump(&mut a, &mut b, 10);
        assert_eq!(&seen.borrow()[1..], &[7.0, 8.0]);
    }

    #[test]
    fn linear_mode_follows_the_range_law() {
        let port = test_port(8);
        let mut a = device("nu", port);
        let mut b = device("xi", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(
                SignalBuilder::output("out")
                    .with_range(Vector::F32(vec![0.0]), Vector::F32(vec![1.0])),
            )
            .unwrap();
        let inp = b
            .add_signal(
                SignalBuilder::input("in")
                    .with_range(Vector::F32(vec![10.0]), Vector::F32(vec![30.0])),
            )
            .unwrap();
        let seen = collect_values(&mut b, inp);

        b.map_create(
            MapBuilder::new(
                &[&format!("{}/out", a.name())],
                &format!("{}/in", b.name()),
            )
            .with_mode(MapMode::Linear),
        )
        .unwrap();
        wait_map_active(&mut a, &mut b);

        a.set_value(out, Vector::F32(vec![0.5]), a.now()).unwrap();
        pump(&mut a, &mut b, 20);
        assert_eq!(seen.borrow().len(), 1);
        assert!((seen.borrow()[0] - 20.0).abs() < 1e-4);
    }

    #[test]
    fn subscription_replicates_signal_metadata() {
        let port = test_port(9);
        let mut a = device("omicron", port);
        let mut b = device("pi", port);
        wait_ready(&mut [&mut a, &mut b]);

        a.add_signal(
            SignalBuilder::output("knob")
                .with_type(ScalarType::Double)
                .with_length(2),
        )
        .unwrap();

        let a_id = Id::for_device_name(&a.name());
        // let B discover A on the bus first
        for _ in 0..200 {
            a.poll(1);
            b.poll(1);
            if b.graph().device(a_id).is_some() {
                break;
            }
        }
        b.subscribe(a_id, SubscribeFlags::ALL, -1).unwrap();
        pump(&mut a, &mut b, 50);

        let full = format!("{}/knob", a.name());
        let replica = b.graph().signal_by_full_name(&full).expect("replica");
        assert_eq!(replica.ty, ScalarType::Double);
        assert_eq!(replica.len, 2);
        assert!(!replica.is_local);
        assert!(b.graph().device(a_id).map(|d| d.subscribed).unwrap_or(false));

        // late signals are pushed too
        a.add_signal(SignalBuilder::output("late")).unwrap();
        pump(&mut a, &mut b, 50);
        assert!(b
            .graph()
            .signal_by_full_name(&format!("{}/late", a.name()))
            .is_some());
    }

    #[test]
    fn out_of_scope_release_is_ignored() {
        let port = test_port(10);
        let mut a = device("rho", port);
        let mut b = device("sigma", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a
            .add_signal(SignalBuilder::output("out").with_instances(4))
            .unwrap();
        let inp = b
            .add_signal(SignalBuilder::input("in").with_instances(4))
            .unwrap();
        let _seen = collect_values(&mut b, inp);

        b.map_create(MapBuilder::new(
            &[&format!("{}/out", a.name())],
            &format!("{}/in", b.name()),
        ))
        .unwrap();
        wait_map_active(&mut a, &mut b);

        a.set_value_instanced(out, 1, Vector::F32(vec![1.0]), a.now())
            .unwrap();
        pump(&mut a, &mut b, 10);
        let active = |d: &Device, sig: Id| {
            d.graph()
                .signal(sig)
                .and_then(|s| s.local())
                .map(|ls| ls.num_active())
                .unwrap_or(0)
        };
        assert_eq!(active(&b, inp), 1);

        // both ends agree on the global instance id
        let gid = Id::for_device_name(&a.name()).as_u64() | 1;
        assert!(b
            .graph()
            .signal(inp)
            .and_then(|s| s.local())
            .and_then(|ls| ls.find_by_global(gid))
            .is_some());

        // a stranger's release is not honoured
        let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let msg = crate::net::messages::signal_release(&format!("{}/in", b.name()), gid as i64);
        let buf = rosc::encoder::encode(&rosc::OscPacket::Message(msg)).unwrap();
        stranger
            .send_to(&buf, ("127.0.0.1", b.port()))
            .unwrap();
        pump(&mut a, &mut b, 20);
        assert_eq!(active(&b, inp), 1);

        // the scoped source device's release is
        a.release_instance(out, 1, a.now()).unwrap();
        pump(&mut a, &mut b, 20);
        assert_eq!(active(&b, inp), 0);
    }

    #[test]
    fn unmap_tears_down_both_ends() {
        let port = test_port(11);
        let mut a = device("tau", port);
        let mut b = device("upsilon", port);
        wait_ready(&mut [&mut a, &mut b]);

        let out = a.add_signal(SignalBuilder::output("out")).unwrap();
        let inp = b.add_signal(SignalBuilder::input("in")).unwrap();
        let seen = collect_values(&mut b, inp);

        let src = format!("{}/out", a.name());
        let dst = format!("{}/in", b.name());
        b.map_create(MapBuilder::new(&[&src], &dst)).unwrap();
        wait_map_active(&mut a, &mut b);

        b.map_remove(&[&src], &dst).unwrap();
        pump(&mut a, &mut b, 50);
        assert_eq!(a.graph().maps().count(), 0);
        assert_eq!(b.graph().maps().count(), 0);

        a.set_value(out, Vector::F32(vec![9.0]), a.now()).unwrap();
        pump(&mut a, &mut b, 20);
        assert!(seen.borrow().is_empty());
    }
}
