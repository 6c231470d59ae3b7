//! Signals and their instance pools.
//!
//! A signal is a named, typed, vector-valued data port on a device. A
//! [`SignalRecord`] exists in every graph that knows about the signal;
//! only the owning device's record carries a [`LocalSignal`] with the
//! instance pool and value rings.
//!
//! Instances model concurrent streams within one signal (fingers on a
//! touch surface, voices of a synth). The pool is pre-reserved at the
//! declared size; extras are allocated on demand for ids the pool has
//! never seen. When the pool is exhausted the steal policy decides which
//! active instance to evict, or the update is dropped with an overflow
//! event.

use bitflags::bitflags;

use crate::buffer::ValueBuffer;
use crate::id::Id;
use crate::properties::{Property, PropertyTable, PropValue};
use crate::time::Timetag;
use crate::value::{ScalarType, Vector};

/// Signal direction relative to its device.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    In,
    Out,
    Any,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Any => "any",
        }
    }

    pub fn from_str(s: &str) -> Option<Direction> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            "any" => Some(Direction::Any),
            _ => None,
        }
    }
}

/// What to do when an update arrives for an unknown instance id and the
/// pool is fully active.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum StealPolicy {
    /// Drop the update and raise [`SignalEvents::INST_OFLW`].
    #[default]
    None,
    /// Evict the least recently updated instance.
    Oldest,
    /// Evict the most recently updated instance.
    Newest,
}

impl StealPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            StealPolicy::None => "none",
            StealPolicy::Oldest => "oldest",
            StealPolicy::Newest => "newest",
        }
    }

    pub fn from_str(s: &str) -> Option<StealPolicy> {
        match s {
            "none" => Some(StealPolicy::None),
            "oldest" => Some(StealPolicy::Oldest),
            "newest" => Some(StealPolicy::Newest),
            _ => None,
        }
    }
}

bitflags! {
    /// Signal event kinds; also used as the callback event mask.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SignalEvents: u8 {
        const UPDATE = 1 << 0;
        const INST_NEW = 1 << 1;
        const REL_UPSTRM = 1 << 2;
        const REL_DNSTRM = 1 << 3;
        const INST_OFLW = 1 << 4;
    }
}

bitflags! {
    /// Instance lifecycle flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct InstanceStatus: u8 {
        const RESERVED = 1 << 0;
        const ACTIVE = 1 << 1;
        const NEW = 1 << 2;
        const UPDATED = 1 << 3;
        const RELEASED_UPSTREAM = 1 << 4;
        const RELEASED_DOWNSTREAM = 1 << 5;
        const OVERFLOW = 1 << 6;
    }
}

/// One concurrent stream within a signal.
#[derive(Clone, Debug)]
pub struct Instance {
    pub local_id: u32,
    pub global_id: Option<u64>,
    pub status: InstanceStatus,
    pub(crate) buffer: ValueBuffer,
    /// Handle into the owning device's id-map table.
    pub(crate) idmap: Option<usize>,
}

impl Instance {
    fn reserved(local_id: u32, ty: ScalarType, len: usize, mlen: usize) -> Self {
        Instance {
            local_id,
            global_id: None,
            status: InstanceStatus::RESERVED,
            buffer: ValueBuffer::new(ty, len, mlen),
            idmap: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.contains(InstanceStatus::ACTIVE)
    }

    pub(crate) fn buffer(&self) -> &ValueBuffer {
        &self.buffer
    }

    /// Timetag of the newest sample, if any.
    pub fn time(&self) -> Option<Timetag> {
        self.buffer.time(0)
    }
}

/// Runtime state of a signal owned by the local device.
#[derive(Debug)]
pub struct LocalSignal {
    pub(crate) instances: Vec<Instance>,
    /// Current ring depth, grown by maps that need history.
    pub(crate) mlen: usize,
}

/// Where an activation found room for a new instance.
pub(crate) enum Activation {
    /// Instance already active at this index.
    Existing(usize),
    /// A reserved slot was claimed.
    Fresh(usize),
    /// An active instance was evicted; its ids are returned so the caller
    /// can propagate the release.
    Stolen {
        index: usize,
        victim_local: u32,
        victim_global: Option<u64>,
    },
    /// Pool full and stealing disabled.
    Overflow,
}

impl LocalSignal {
    pub(crate) fn new(ty: ScalarType, len: usize, num_instances: usize, mlen: usize) -> Self {
        let instances = (0..num_instances.max(1) as u32)
            .map(|i| Instance::reserved(i, ty, len, mlen))
            .collect();
        LocalSignal {
            instances,
            mlen: mlen.max(1),
        }
    }

    /// Grows every ring to at least `mlen` samples.
    pub(crate) fn set_history(&mut self, mlen: usize) {
        if mlen <= self.mlen {
            return;
        }
        self.mlen = mlen;
        for inst in &mut self.instances {
            inst.buffer.set_history(mlen);
        }
    }

    pub fn find_by_local(&self, local_id: u32) -> Option<usize> {
        self.instances.iter().position(|i| {
            i.local_id == local_id && !i.status.contains(InstanceStatus::RESERVED)
        })
    }

    pub fn find_by_global(&self, global_id: u64) -> Option<usize> {
        self.instances
            .iter()
            .position(|i| i.global_id == Some(global_id) && i.is_active())
    }

    pub fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, i)| i.is_active())
            .map(|(i, _)| i)
    }

    pub fn num_active(&self) -> usize {
        self.instances.iter().filter(|i| i.is_active()).count()
    }

    pub fn pool_size(&self) -> usize {
        self.instances.len()
    }

    /// Locates or activates an instance for `local_id`, per policy:
    /// reuse an existing activation, then claim a reserved slot, then
    /// steal, then overflow.
    pub(crate) fn activate(&mut self, local_id: u32, steal: StealPolicy) -> Activation {
        if let Some(idx) = self.find_by_local(local_id) {
            return Activation::Existing(idx);
        }
        if let Some(idx) = self
            .instances
            .iter()
            .position(|i| i.status.contains(InstanceStatus::RESERVED))
        {
            let inst = &mut self.instances[idx];
            inst.local_id = local_id;
            inst.global_id = None;
            inst.status = InstanceStatus::ACTIVE | InstanceStatus::NEW;
            inst.buffer.clear();
            return Activation::Fresh(idx);
        }
        let victim = match steal {
            StealPolicy::None => return Activation::Overflow,
            StealPolicy::Oldest => self.extreme_instance(false),
            StealPolicy::Newest => self.extreme_instance(true),
        };
        let Some(index) = victim else {
            return Activation::Overflow;
        };
        let inst = &mut self.instances[index];
        let victim_local = inst.local_id;
        let victim_global = inst.global_id;
        inst.local_id = local_id;
        inst.global_id = None;
        inst.status = InstanceStatus::ACTIVE | InstanceStatus::NEW;
        inst.buffer.clear();
        Activation::Stolen {
            index,
            victim_local,
            victim_global,
        }
    }

    /// Ensures an instance exists for a remote-assigned global id,
    /// choosing the global id's low word as the local id when free.
    pub(crate) fn activate_global(&mut self, global_id: u64, steal: StealPolicy) -> Activation {
        if let Some(idx) = self.find_by_global(global_id) {
            return Activation::Existing(idx);
        }
        let mut local = global_id as u32;
        while self.find_by_local(local).is_some() {
            local = local.wrapping_add(1);
        }
        let activation = self.activate(local, steal);
        let idx = match &activation {
            Activation::Existing(i) | Activation::Fresh(i) => Some(*i),
            Activation::Stolen { index, .. } => Some(*index),
            Activation::Overflow => None,
        };
        if let Some(i) = idx {
            self.instances[i].global_id = Some(global_id);
        }
        activation
    }

    /// Marks an instance released; the ring survives until the slot is
    /// recycled.
    pub(crate) fn release(&mut self, index: usize, upstream: bool) {
        let inst = &mut self.instances[index];
        inst.status.remove(InstanceStatus::ACTIVE | InstanceStatus::NEW);
        inst.status.insert(InstanceStatus::RESERVED);
        inst.status.insert(if upstream {
            InstanceStatus::RELEASED_UPSTREAM
        } else {
            InstanceStatus::RELEASED_DOWNSTREAM
        });
        inst.global_id = None;
        inst.idmap = None;
    }

    fn extreme_instance(&self, newest: bool) -> Option<usize> {
        let mut best: Option<(usize, Timetag)> = None;
        for (i, inst) in self.instances.iter().enumerate() {
            if !inst.is_active() {
                continue;
            }
            let t = inst.time().unwrap_or_default();
            let better = match best {
                None => true,
                Some((_, bt)) => {
                    if newest {
                        t > bt
                    } else {
                        t < bt
                    }
                }
            };
            if better {
                best = Some((i, t));
            }
        }
        best.map(|(i, _)| i)
    }
}

/// A signal as replicated in every graph.
#[derive(Debug)]
pub struct SignalRecord {
    pub id: Id,
    pub device: Id,
    /// Owning device's registered name, fixed at creation.
    pub device_name: String,
    pub name: String,
    pub dir: Direction,
    pub ty: ScalarType,
    pub len: usize,
    pub unit: Option<String>,
    pub min: Option<Vector>,
    pub max: Option<Vector>,
    pub num_instances: usize,
    pub steal: StealPolicy,
    pub event_mask: SignalEvents,
    pub version: i32,
    pub props: PropertyTable,
    pub is_local: bool,
    pub(crate) local: Option<LocalSignal>,
}

impl SignalRecord {
    /// Full name on the wire: `device/signal`.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.device_name, self.name)
    }

    /// OSC address of the signal's data path.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.device_name, self.name)
    }

    pub(crate) fn local(&self) -> Option<&LocalSignal> {
        self.local.as_ref()
    }

    pub(crate) fn local_mut(&mut self) -> Option<&mut LocalSignal> {
        self.local.as_mut()
    }

    /// Mirrors the core fields into the property table for queries and
    /// wire serialisation.
    pub(crate) fn sync_props(&mut self) {
        let p = &mut self.props;
        p.set(Property::Name, PropValue::Str(self.name.clone()));
        p.set(Property::Id, PropValue::I64(self.id.as_u64() as i64));
        p.set(
            Property::Dir,
            PropValue::Str(self.dir.as_str().to_string()),
        );
        p.set(
            Property::Type,
            PropValue::Char(self.ty.type_char()),
        );
        p.set(Property::Len, PropValue::I32(self.len as i32));
        p.set(Property::NumInst, PropValue::I32(self.num_instances as i32));
        p.set(
            Property::Steal,
            PropValue::Str(self.steal.as_str().to_string()),
        );
        p.set(Property::Version, PropValue::I32(self.version));
        p.set(Property::IsLocal, PropValue::Bool(self.is_local));
        if let Some(unit) = &self.unit {
            p.set(Property::Unit, PropValue::Str(unit.clone()));
        }
        if let Some(min) = &self.min {
            p.set(Property::Min, vector_prop(min));
        }
        if let Some(max) = &self.max {
            p.set(Property::Max, vector_prop(max));
        }
    }
}

impl SignalRecord {
    /// Serialises for a `/<device>/signal` push: name first, properties
    /// after.
    pub(crate) fn wire_args(&self) -> Vec<rosc::OscType> {
        let mut args = vec![rosc::OscType::String(self.name.clone())];
        self.props.to_osc_args(&mut args);
        args
    }

    /// Builds a replica record from a metadata push.
    pub(crate) fn from_wire(device_name: &str, args: &[rosc::OscType]) -> Option<SignalRecord> {
        let name = match args.first()? {
            rosc::OscType::String(s) => s.clone(),
            _ => return None,
        };
        let mut sig = SignalRecord {
            id: Id::NONE,
            device: Id::for_device_name(device_name),
            device_name: device_name.to_string(),
            name,
            dir: Direction::Any,
            ty: ScalarType::Float,
            len: 1,
            unit: None,
            min: None,
            max: None,
            num_instances: 1,
            steal: StealPolicy::None,
            event_mask: SignalEvents::all(),
            version: 0,
            props: PropertyTable::new(),
            is_local: false,
            local: None,
        };
        sig.apply_args(&args[1..]);
        Some(sig)
    }

    /// Applies `@key value...` groups, mirroring known keys into fields.
    /// Returns the number of records changed.
    pub(crate) fn apply_args(&mut self, args: &[rosc::OscType]) -> usize {
        let changed = self.props.update_from_args(args, !self.is_local);
        if changed == 0 {
            return 0;
        }
        if let Some(v) = self.props.get(Property::Dir).and_then(|p| p.as_str().map(String::from)) {
            if let Some(dir) = Direction::from_str(&v) {
                self.dir = dir;
            }
        }
        if let Some(PropValue::Char(c)) = self.props.get(Property::Type) {
            if let Some(ty) = ScalarType::from_char(*c) {
                self.ty = ty;
            }
        }
        if let Some(v) = self.props.get(Property::Len).and_then(|p| p.as_i64()) {
            self.len = (v.max(1) as usize).min(crate::value::MAX_VECTOR_LEN);
        }
        if let Some(v) = self.props.get(Property::Id).and_then(|p| p.as_i64()) {
            self.id = Id::from_u64(v as u64);
        }
        if let Some(v) = self.props.get(Property::NumInst).and_then(|p| p.as_i64()) {
            self.num_instances = v.max(1) as usize;
        }
        if let Some(v) = self.props.get(Property::Unit).and_then(|p| p.as_str().map(String::from)) {
            self.unit = Some(v);
        }
        if let Some(v) = self.props.get(Property::Steal).and_then(|p| p.as_str().map(String::from))
        {
            if let Some(steal) = StealPolicy::from_str(&v) {
                self.steal = steal;
            }
        }
        if let Some(v) = self.props.get(Property::Version).and_then(|p| p.as_i64()) {
            self.version = v as i32;
        }
        let ty = self.ty;
        let len = self.len;
        if let Some(p) = self.props.get(Property::Min) {
            self.min = prop_vector(p, ty, len);
        }
        if let Some(p) = self.props.get(Property::Max) {
            self.max = prop_vector(p, ty, len);
        }
        changed
    }
}

/// A vector as a property value: scalar for length 1, list otherwise.
pub(crate) fn vector_prop(v: &Vector) -> PropValue {
    let items: Vec<PropValue> = (0..v.len())
        .map(|i| match v {
            Vector::I32(x) => PropValue::I32(x[i]),
            Vector::F32(x) => PropValue::F32(x[i]),
            Vector::F64(x) => PropValue::F64(x[i]),
        })
        .collect();
    if items.len() == 1 {
        items.into_iter().next().unwrap()
    } else {
        PropValue::List(items)
    }
}

/// Reads a vector back out of a property value.
pub(crate) fn prop_vector(p: &PropValue, ty: ScalarType, len: usize) -> Option<Vector> {
    let values: Vec<f64> = match p {
        PropValue::List(items) => items.iter().filter_map(|v| v.as_f64()).collect(),
        single => vec![single.as_f64()?],
    };
    if values.is_empty() {
        return None;
    }
    let mut out = Vector::zeros(ty, len);
    for i in 0..len {
        out.set(i, values[i.min(values.len() - 1)]);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> LocalSignal {
        LocalSignal::new(ScalarType::Float, 1, n, 2)
    }

    fn write(sig: &mut LocalSignal, idx: usize, v: f32, t: u32) {
        sig.instances[idx]
            .buffer
            .write(&Vector::F32(vec![v]), Timetag::new(t, 0));
        sig.instances[idx].status.insert(InstanceStatus::UPDATED);
    }

    #[test]
    fn activation_prefers_reserved_slots() {
        let mut sig = pool(2);
        let a = sig.activate(7, StealPolicy::None);
        assert!(matches!(a, Activation::Fresh(0)));
        // same id reuses the activation
        let b = sig.activate(7, StealPolicy::None);
        assert!(matches!(b, Activation::Existing(0)));
        assert_eq!(sig.num_active(), 1);
    }

    #[test]
    fn overflow_when_stealing_disabled() {
        let mut sig = pool(1);
        sig.activate(1, StealPolicy::None);
        let a = sig.activate(2, StealPolicy::None);
        assert!(matches!(a, Activation::Overflow));
    }

    #[test]
    fn steal_oldest_evicts_least_recent() {
        let mut sig = pool(2);
        sig.activate(1, StealPolicy::Oldest);
        sig.activate(2, StealPolicy::Oldest);
        write(&mut sig, 0, 1.0, 100);
        write(&mut sig, 1, 2.0, 200);
        let a = sig.activate(3, StealPolicy::Oldest);
        match a {
            Activation::Stolen { victim_local, .. } => assert_eq!(victim_local, 1),
            _ => panic!("expected steal"),
        }
    }

    #[test]
    fn release_returns_slot_to_reserve_pool() {
        let mut sig = pool(1);
        sig.activate(5, StealPolicy::None);
        assert_eq!(sig.num_active(), 1);
        sig.release(0, true);
        assert_eq!(sig.num_active(), 0);
        assert!(sig.instances[0]
            .status
            .contains(InstanceStatus::RELEASED_UPSTREAM));
        // the slot is reusable
        let a = sig.activate(6, StealPolicy::None);
        assert!(matches!(a, Activation::Fresh(0)));
    }

    #[test]
    fn global_activation_keeps_identity() {
        let mut sig = pool(4);
        let gid = 0xAAAA_0000_0000_0003u64;
        sig.activate_global(gid, StealPolicy::None);
        let idx = sig.find_by_global(gid).unwrap();
        assert_eq!(sig.instances[idx].local_id, 3);
        // same global id resolves to the same instance
        let again = sig.activate_global(gid, StealPolicy::None);
        assert!(matches!(again, Activation::Existing(i) if i == idx));
    }

    #[test]
    fn vector_props_round_trip() {
        let v = Vector::F32(vec![0.5, 1.5]);
        let p = vector_prop(&v);
        let back = prop_vector(&p, ScalarType::Float, 2).unwrap();
        assert_eq!(back, v);
    }
}
