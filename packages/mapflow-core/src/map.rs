//! Maps: declarative routes from source signals to a destination.
//!
//! A map owns one slot per source signal (alphabetised by full name, at
//! most [`MAX_SOURCES`]) and one destination slot. Its status walks
//! `Staged -> Ready -> Active` as the endpoints acknowledge each other
//! over the protocol; the transforming expression is compiled at
//! activation and whenever `@expr` changes.

use std::collections::{BTreeSet, HashMap};

use crate::expr::{CompiledExpr, ExprContext, ExprError, ExprState, MAX_SOURCES};
use crate::id::Id;
use crate::properties::{split_arg_groups, PropKey, Property, PropertyTable, PropValue};
use crate::signal::{prop_vector, vector_prop, Direction, SignalRecord};
use crate::value::{ScalarType, Vector};

pub use crate::expr::MAX_SOURCES as MAX_MAP_SOURCES;

/// What to do with a destination element that leaves the slot's range.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum BoundaryAction {
    #[default]
    None,
    /// Suppress the whole update.
    Mute,
    Clamp,
    /// Reflect back into the range.
    Fold,
    /// Modulo into the range.
    Wrap,
}

impl BoundaryAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BoundaryAction::None => "none",
            BoundaryAction::Mute => "mute",
            BoundaryAction::Clamp => "clamp",
            BoundaryAction::Fold => "fold",
            BoundaryAction::Wrap => "wrap",
        }
    }

    pub fn from_str(s: &str) -> Option<BoundaryAction> {
        match s {
            "none" => Some(BoundaryAction::None),
            "mute" => Some(BoundaryAction::Mute),
            "clamp" => Some(BoundaryAction::Clamp),
            "fold" => Some(BoundaryAction::Fold),
            "wrap" => Some(BoundaryAction::Wrap),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MapMode {
    /// Pass values through with type coercion only.
    #[default]
    Raw,
    /// Auto-generated min/max range mapping.
    Linear,
    /// User-supplied expression.
    Expression,
}

impl MapMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MapMode::Raw => "raw",
            MapMode::Linear => "linear",
            MapMode::Expression => "expression",
        }
    }

    pub fn from_str(s: &str) -> Option<MapMode> {
        match s {
            "raw" => Some(MapMode::Raw),
            "linear" => Some(MapMode::Linear),
            "expression" => Some(MapMode::Expression),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcessLocation {
    Source,
    Destination,
}

impl ProcessLocation {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessLocation::Source => "src",
            ProcessLocation::Destination => "dst",
        }
    }

    pub fn from_str(s: &str) -> Option<ProcessLocation> {
        match s {
            "src" => Some(ProcessLocation::Source),
            "dst" => Some(ProcessLocation::Destination),
            _ => None,
        }
    }
}

/// Transport tag carried in map metadata; the transport itself is
/// external.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum MapProtocol {
    #[default]
    Udp,
    Tcp,
}

/// Map lifecycle, ordered.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub enum MapStatus {
    #[default]
    Undefined,
    Expired,
    Staged,
    Ready,
    Active,
}

/// One end of a map, attached to a signal.
#[derive(Clone, Debug)]
pub struct Slot {
    pub signal: Id,
    /// `device/signal`, the wire spelling.
    pub signal_name: String,
    pub dir: Direction,
    pub ty: ScalarType,
    pub len: usize,
    pub min: Option<Vector>,
    pub max: Option<Vector>,
    pub num_instances: usize,
    pub causes_update: bool,
    pub use_instances: bool,
    pub calibrating: bool,
    pub bound_min: BoundaryAction,
    pub bound_max: BoundaryAction,
}

impl Slot {
    pub(crate) fn from_signal(sig: &SignalRecord, dir: Direction) -> Slot {
        Slot {
            signal: sig.id,
            signal_name: sig.full_name(),
            dir,
            ty: sig.ty,
            len: sig.len,
            min: sig.min.clone(),
            max: sig.max.clone(),
            num_instances: sig.num_instances,
            causes_update: true,
            use_instances: sig.num_instances > 1,
            calibrating: false,
            bound_min: BoundaryAction::None,
            bound_max: BoundaryAction::None,
        }
    }

    /// Placeholder slot for a signal whose metadata has not arrived yet.
    pub(crate) fn named(full_name: &str, dir: Direction) -> Slot {
        Slot {
            signal: Id::NONE,
            signal_name: full_name.trim_start_matches('/').to_string(),
            dir,
            ty: ScalarType::Float,
            len: 1,
            min: None,
            max: None,
            num_instances: 1,
            causes_update: true,
            use_instances: false,
            calibrating: false,
            bound_min: BoundaryAction::None,
            bound_max: BoundaryAction::None,
        }
    }

    /// Owning device's name, the prefix of the full name.
    pub fn device_name(&self) -> &str {
        self.signal_name
            .split('/')
            .next()
            .unwrap_or(&self.signal_name)
    }

    /// Widens the source's learned range while calibrating.
    pub(crate) fn calibrate(&mut self, value: &Vector) {
        let mut new_min = self
            .min
            .get_or_insert_with(|| value.cast(self.ty))
            .clone();
        let mut new_max = self
            .max
            .get_or_insert_with(|| value.cast(self.ty))
            .clone();
        for i in 0..new_min.len().min(new_max.len()) {
            let v = value.get_broadcast(i);
            if v < new_min.get(i) {
                new_min.set(i, v);
            }
            if v > new_max.get(i) {
                new_max.set(i, v);
            }
        }
        self.min = Some(new_min);
        self.max = Some(new_max);
    }

    /// Applies the slot's boundary actions to a sample in place. Returns
    /// false when a `Mute` action suppresses the update.
    pub(crate) fn apply_boundary(&self, value: &mut Vector) -> bool {
        let (Some(min), Some(max)) = (&self.min, &self.max) else {
            return true;
        };
        for i in 0..value.len() {
            let lo = min.get_broadcast(i.min(min.len() - 1));
            let hi = max.get_broadcast(i.min(max.len() - 1));
            if hi <= lo {
                continue;
            }
            let v = value.get(i);
            if v < lo {
                match self.bound_min {
                    BoundaryAction::None => {}
                    BoundaryAction::Mute => return false,
                    BoundaryAction::Clamp => value.set(i, lo),
                    BoundaryAction::Fold => value.set(i, fold_into(v, lo, hi)),
                    BoundaryAction::Wrap => value.set(i, wrap_into(v, lo, hi)),
                }
            } else if v > hi {
                match self.bound_max {
                    BoundaryAction::None => {}
                    BoundaryAction::Mute => return false,
                    BoundaryAction::Clamp => value.set(i, hi),
                    BoundaryAction::Fold => value.set(i, fold_into(v, lo, hi)),
                    BoundaryAction::Wrap => value.set(i, wrap_into(v, lo, hi)),
                }
            }
        }
        true
    }
}

fn wrap_into(v: f64, lo: f64, hi: f64) -> f64 {
    let range = hi - lo;
    lo + (v - lo).rem_euclid(range)
}

fn fold_into(v: f64, lo: f64, hi: f64) -> f64 {
    let range = hi - lo;
    let t = (v - lo).rem_euclid(2.0 * range);
    lo + if t > range { 2.0 * range - t } else { t }
}

/// Runtime state of a map processed on this device.
#[derive(Default)]
pub struct LocalMap {
    pub(crate) expr: Option<CompiledExpr>,
    /// Per-instance expression memory, keyed by instance identity.
    pub(crate) states: HashMap<u64, ExprState>,
    /// Source devices that have acknowledged the map.
    pub(crate) acks: BTreeSet<String>,
    /// Shadow rings for remote source slots when processing at the
    /// destination, keyed by `(slot, instance)`.
    pub(crate) slot_buffers: HashMap<(usize, u64), crate::buffer::ValueBuffer>,
    /// Shadow ring for the remote destination when processing at the
    /// source, keyed by instance.
    pub(crate) dst_buffers: HashMap<u64, crate::buffer::ValueBuffer>,
    /// Ring depths the compiled expression requires.
    pub(crate) slot_mlen: Vec<usize>,
    pub(crate) dst_mlen: usize,
}

impl std::fmt::Debug for LocalMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMap")
            .field("compiled", &self.expr.is_some())
            .field("states", &self.states.len())
            .finish()
    }
}

/// A map as replicated in every graph.
#[derive(Debug)]
pub struct MapRecord {
    pub id: Id,
    pub sources: Vec<Slot>,
    pub destination: Slot,
    pub mode: MapMode,
    pub expression: Option<String>,
    pub process: ProcessLocation,
    pub status: MapStatus,
    pub muted: bool,
    /// Names of devices whose instance releases this map honours.
    pub scope: BTreeSet<String>,
    pub protocol: MapProtocol,
    pub version: i32,
    pub props: PropertyTable,
    pub is_local: bool,
    pub(crate) local: Option<LocalMap>,
}

impl MapRecord {
    /// Alphabetises source names the way the wire expects. Fails on
    /// duplicates.
    pub fn order_sources(mut names: Vec<String>) -> Option<Vec<String>> {
        names.sort();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return None;
        }
        if names.is_empty() || names.len() > MAX_SOURCES {
            return None;
        }
        Some(names)
    }

    /// The expression the map actually runs, deriving one for `raw` and
    /// `linear` modes.
    pub fn expression_string(&self) -> Result<String, ExprError> {
        match self.mode {
            MapMode::Expression | MapMode::Raw if self.expression.is_some() => {
                Ok(self.expression.clone().unwrap())
            }
            MapMode::Raw => Ok("y = x".to_string()),
            MapMode::Linear => self.linear_expression(),
            MapMode::Expression => Err(ExprError::NoOutput),
        }
    }

    /// `y = (x - a) * (d - c) / (b - a) + c` from the slot ranges; falls
    /// back to pass-through when either range is missing or degenerate.
    fn linear_expression(&self) -> Result<String, ExprError> {
        let src = &self.sources[0];
        let dst = &self.destination;
        let (Some(a), Some(b)) = (&src.min, &src.max) else {
            return Ok("y = x".to_string());
        };
        let (Some(c), Some(d)) = (&dst.min, &dst.max) else {
            return Ok("y = x".to_string());
        };
        if (0..a.len().max(b.len())).any(|i| b.get_broadcast(i) == a.get_broadcast(i)) {
            return Ok("y = x".to_string());
        }
        Ok(format!(
            "y = (x - {}) * ({} - {}) / ({} - {}) + {}",
            vector_literal(a),
            vector_literal(d),
            vector_literal(c),
            vector_literal(b),
            vector_literal(a),
            vector_literal(c),
        ))
    }

    /// Compiles (or recompiles) the expression and returns the history
    /// depths it requires, `(per-source, destination)`.
    pub(crate) fn compile_expression(&mut self) -> Result<(Vec<i32>, i32), ExprError> {
        let text = self.expression_string()?;
        let ctx = ExprContext {
            srcs: self.sources.iter().map(|s| (s.ty, s.len)).collect(),
            dst: (self.destination.ty, self.destination.len),
        };
        let compiled = CompiledExpr::compile(&text, &ctx)?;
        let depths: Vec<i32> = (0..self.sources.len())
            .map(|i| compiled.src_history(i))
            .collect();
        let dst_depth = compiled.dst_history();
        let local = self.local.get_or_insert_with(LocalMap::default);
        local.states.clear();
        local.slot_buffers.clear();
        local.dst_buffers.clear();
        local.slot_mlen = depths.iter().map(|d| *d as usize).collect();
        local.dst_mlen = dst_depth as usize;
        local.expr = Some(compiled);
        Ok((depths, dst_depth))
    }

    /// True when `device` may release destination instances of this map.
    pub fn in_scope(&self, device: &str) -> bool {
        self.scope.contains(device)
    }

    pub(crate) fn sync_props(&mut self) {
        let p = &mut self.props;
        p.set(Property::Id, PropValue::I64(self.id.as_u64() as i64));
        p.set(
            Property::Mode,
            PropValue::Str(self.mode.as_str().to_string()),
        );
        if let Some(expr) = &self.expression {
            p.set(Property::Expr, PropValue::Str(expr.clone()));
        }
        p.set(Property::Muted, PropValue::Bool(self.muted));
        p.set(
            Property::Process,
            PropValue::Str(self.process.as_str().to_string()),
        );
        p.set(Property::Version, PropValue::I32(self.version));
        p.set(Property::IsLocal, PropValue::Bool(self.is_local));
        if !self.scope.is_empty() {
            let scope: Vec<PropValue> = self
                .scope
                .iter()
                .map(|s| PropValue::Str(s.clone()))
                .collect();
            p.set(
                Property::Scope,
                if scope.len() == 1 {
                    scope.into_iter().next().unwrap()
                } else {
                    PropValue::List(scope)
                },
            );
        }
    }

    /// Applies `@key value...` groups from a map message. Returns the
    /// number of records changed.
    pub(crate) fn update_from_args(&mut self, args: &[rosc::OscType]) -> usize {
        let mut changed = 0;
        for (key, values) in split_arg_groups(args) {
            let key = PropKey::parse(key);
            let first = values.first();
            match &key {
                PropKey::Known(Property::Mode) => {
                    if let Some(mode) =
                        first.and_then(osc_str).and_then(MapMode::from_str)
                    {
                        if self.mode != mode {
                            self.mode = mode;
                            changed += 1;
                        }
                    }
                }
                PropKey::Known(Property::Expr) => {
                    if let Some(expr) = first.and_then(osc_str) {
                        if self.expression.as_deref() != Some(expr) {
                            self.expression = Some(expr.to_string());
                            self.mode = MapMode::Expression;
                            changed += 1;
                        }
                    }
                }
                PropKey::Known(Property::Muted) => {
                    if let Some(m) = first.and_then(osc_bool) {
                        if self.muted != m {
                            self.muted = m;
                            changed += 1;
                        }
                    }
                }
                PropKey::Known(Property::Process) => {
                    if let Some(loc) =
                        first.and_then(osc_str).and_then(ProcessLocation::from_str)
                    {
                        if self.process != loc {
                            self.process = loc;
                            changed += 1;
                        }
                    }
                }
                PropKey::Known(Property::Scope) => {
                    // explicit scope extends the default source devices
                    let mut grew = false;
                    for dev in values.iter().filter_map(osc_str) {
                        grew |= self.scope.insert(dev.to_string());
                    }
                    if grew {
                        changed += 1;
                    }
                }
                PropKey::Known(Property::Id) => {
                    if let Some(rosc::OscType::Long(v)) = first {
                        let id = Id::from_u64(*v as u64);
                        if self.id != id {
                            self.id = id;
                            changed += 1;
                        }
                    }
                }
                PropKey::Known(Property::Bound) => {
                    if let Some(b) =
                        first.and_then(osc_str).and_then(BoundaryAction::from_str)
                    {
                        let dst = &mut self.destination;
                        if dst.bound_min != b || dst.bound_max != b {
                            dst.bound_min = b;
                            dst.bound_max = b;
                            changed += 1;
                        }
                    }
                }
                // handshake-transient tags never persist
                PropKey::Custom(name) if name == "status" || name == "srcDev" => {}
                PropKey::Custom(name) => {
                    changed +=
                        self.apply_slot_prop(name, values) .unwrap_or_else(|| {
                            // unknown keys round-trip verbatim
                            let parsed: Vec<PropValue> =
                                values.iter().filter_map(prop_from_osc).collect();
                            match parsed.len() {
                                0 => 0,
                                1 => self
                                    .props
                                    .set(key.clone(), parsed.into_iter().next().unwrap()),
                                _ => self.props.set(key.clone(), PropValue::List(parsed)),
                            }
                        });
                }
                _ => {
                    let parsed: Vec<PropValue> =
                        values.iter().filter_map(prop_from_osc).collect();
                    match parsed.len() {
                        0 => {}
                        1 => {
                            changed += self
                                .props
                                .set(key.clone(), parsed.into_iter().next().unwrap());
                        }
                        _ => {
                            changed += self.props.set(key.clone(), PropValue::List(parsed));
                        }
                    }
                }
            }
        }
        if changed > 0 {
            self.version += 1;
            self.sync_props();
        }
        changed
    }

    /// Slot-scoped keys: `src@min`, `src1@max`, `dst@min`, ...
    fn apply_slot_prop(&mut self, name: &str, values: &[rosc::OscType]) -> Option<usize> {
        let (slot_name, prop) = name.split_once('@')?;
        let slot = if slot_name == "dst" {
            &mut self.destination
        } else if let Some(rest) = slot_name.strip_prefix("src") {
            let idx: usize = if rest.is_empty() { 0 } else { rest.parse().ok()? };
            self.sources.get_mut(idx)?
        } else {
            return None;
        };
        let parsed: Vec<PropValue> = values.iter().filter_map(prop_from_osc).collect();
        let value = match parsed.len() {
            0 => return Some(0),
            1 => parsed.into_iter().next().unwrap(),
            _ => PropValue::List(parsed),
        };
        match prop {
            "min" => slot.min = prop_vector(&value, slot.ty, slot.len),
            "max" => slot.max = prop_vector(&value, slot.ty, slot.len),
            "type" => {
                let c = match value {
                    PropValue::Char(c) => c,
                    PropValue::Str(ref s) => s.chars().next()?,
                    _ => return None,
                };
                slot.ty = crate::value::ScalarType::from_char(c)?;
            }
            "len" => {
                slot.len = (value.as_i64()?.max(1) as usize).min(crate::value::MAX_VECTOR_LEN);
            }
            "numInst" => {
                let n = value.as_i64()?.max(1) as usize;
                slot.num_instances = n;
                slot.use_instances = n > 1;
            }
            "bound" => {
                let b = value.as_str().and_then(BoundaryAction::from_str)?;
                slot.bound_min = b;
                slot.bound_max = b;
            }
            _ => return None,
        }
        Some(1)
    }

    /// Serialises the map message argument list: sources, `->`,
    /// destination, then properties.
    pub(crate) fn to_wire_args(&self) -> Vec<rosc::OscType> {
        let mut args = Vec::new();
        for s in &self.sources {
            args.push(rosc::OscType::String(s.signal_name.clone()));
        }
        args.push(rosc::OscType::String("->".to_string()));
        args.push(rosc::OscType::String(self.destination.signal_name.clone()));
        self.props.to_osc_args(&mut args);
        push_slot_range(&mut args, "dst", &self.destination);
        for (i, slot) in self.sources.iter().enumerate() {
            let scope = if i == 0 {
                "src".to_string()
            } else {
                format!("src{}", i)
            };
            push_slot_range(&mut args, &scope, slot);
        }
        args
    }
}

fn push_slot_range(args: &mut Vec<rosc::OscType>, scope: &str, slot: &Slot) {
    args.push(rosc::OscType::String(format!("@{}@type", scope)));
    args.push(rosc::OscType::Char(slot.ty.type_char()));
    args.push(rosc::OscType::String(format!("@{}@len", scope)));
    args.push(rosc::OscType::Int(slot.len as i32));
    args.push(rosc::OscType::String(format!("@{}@numInst", scope)));
    args.push(rosc::OscType::Int(slot.num_instances as i32));
    if let Some(min) = &slot.min {
        args.push(rosc::OscType::String(format!("@{}@min", scope)));
        min.push_osc_args(args);
    }
    if let Some(max) = &slot.max {
        args.push(rosc::OscType::String(format!("@{}@max", scope)));
        max.push_osc_args(args);
    }
}

fn osc_str(arg: &rosc::OscType) -> Option<&str> {
    match arg {
        rosc::OscType::String(s) => Some(s.as_str()),
        _ => None,
    }
}

fn osc_bool(arg: &rosc::OscType) -> Option<bool> {
    match arg {
        rosc::OscType::Bool(b) => Some(*b),
        rosc::OscType::Int(v) => Some(*v != 0),
        rosc::OscType::String(s) if s == "T" => Some(true),
        rosc::OscType::String(s) if s == "F" => Some(false),
        _ => None,
    }
}

fn prop_from_osc(arg: &rosc::OscType) -> Option<PropValue> {
    match arg {
        rosc::OscType::Bool(b) => Some(PropValue::Bool(*b)),
        rosc::OscType::Int(v) => Some(PropValue::I32(*v)),
        rosc::OscType::Long(v) => Some(PropValue::I64(*v)),
        rosc::OscType::Float(v) => Some(PropValue::F32(*v)),
        rosc::OscType::Double(v) => Some(PropValue::F64(*v)),
        rosc::OscType::String(s) => Some(PropValue::Str(s.clone())),
        rosc::OscType::Char(c) => Some(PropValue::Char(*c)),
        _ => None,
    }
}

/// Formats a vector as expression-language literal text.
fn vector_literal(v: &Vector) -> String {
    let one = |x: f64| {
        if x.fract() == 0.0 && x.abs() < 1e15 {
            format!("{:.1}", x)
        } else {
            format!("{}", x)
        }
    };
    if v.len() == 1 {
        one(v.get(0))
    } else {
        let items: Vec<String> = (0..v.len()).map(|i| one(v.get(i))).collect();
        format!("[{}]", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(min: f32, max: f32, bound: BoundaryAction) -> Slot {
        let mut s = Slot::named("dev/sig", Direction::In);
        s.min = Some(Vector::F32(vec![min]));
        s.max = Some(Vector::F32(vec![max]));
        s.bound_min = bound;
        s.bound_max = bound;
        s
    }

    #[test]
    fn clamp_limits_inclusively() {
        let s = slot(0.0, 10.0, BoundaryAction::Clamp);
        let mut v = Vector::F32(vec![12.0]);
        assert!(s.apply_boundary(&mut v));
        assert_eq!(v.get(0), 10.0);
        let mut v = Vector::F32(vec![-3.0]);
        assert!(s.apply_boundary(&mut v));
        assert_eq!(v.get(0), 0.0);
    }

    #[test]
    fn wrap_is_modulo_into_range() {
        let s = slot(0.0, 10.0, BoundaryAction::Wrap);
        let mut v = Vector::F32(vec![12.0]);
        assert!(s.apply_boundary(&mut v));
        assert!((v.get(0) - 2.0).abs() < 1e-6);
        let mut v = Vector::F32(vec![-3.0]);
        assert!(s.apply_boundary(&mut v));
        assert!((v.get(0) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn fold_reflects_at_the_edges() {
        let s = slot(0.0, 10.0, BoundaryAction::Fold);
        let mut v = Vector::F32(vec![13.0]);
        assert!(s.apply_boundary(&mut v));
        assert!((v.get(0) - 7.0).abs() < 1e-6);
    }

    #[test]
    fn mute_suppresses_out_of_range_updates() {
        let s = slot(0.0, 10.0, BoundaryAction::Mute);
        let mut v = Vector::F32(vec![11.0]);
        assert!(!s.apply_boundary(&mut v));
        let mut v = Vector::F32(vec![5.0]);
        assert!(s.apply_boundary(&mut v));
    }

    #[test]
    fn source_ordering_is_alphabetical_and_duplicate_free() {
        let names = vec!["b/sig".to_string(), "a/sig".to_string()];
        assert_eq!(
            MapRecord::order_sources(names).unwrap(),
            vec!["a/sig".to_string(), "b/sig".to_string()]
        );
        assert!(MapRecord::order_sources(vec!["a/s".into(), "a/s".into()]).is_none());
        assert!(MapRecord::order_sources(vec![]).is_none());
    }

    #[test]
    fn linear_expression_follows_the_range_law() {
        let mut src = Slot::named("a/out", Direction::Out);
        src.min = Some(Vector::F32(vec![0.0]));
        src.max = Some(Vector::F32(vec![1.0]));
        let mut dst = Slot::named("b/in", Direction::In);
        dst.min = Some(Vector::F32(vec![10.0]));
        dst.max = Some(Vector::F32(vec![30.0]));
        let mut map = MapRecord {
            id: Id::NONE,
            sources: vec![src],
            destination: dst,
            mode: MapMode::Linear,
            expression: None,
            process: ProcessLocation::Source,
            status: MapStatus::Staged,
            muted: false,
            scope: BTreeSet::new(),
            protocol: MapProtocol::Udp,
            version: 0,
            props: PropertyTable::new(),
            is_local: true,
            local: None,
        };
        let text = map.expression_string().unwrap();
        assert_eq!(text, "y = (x - 0.0) * (30.0 - 10.0) / (1.0 - 0.0) + 10.0");
        // and it compiles against the slots
        map.compile_expression().unwrap();
    }

    #[test]
    fn calibration_widens_the_learned_range() {
        let mut s = Slot::named("a/out", Direction::Out);
        s.calibrate(&Vector::F32(vec![5.0]));
        s.calibrate(&Vector::F32(vec![2.0]));
        s.calibrate(&Vector::F32(vec![9.0]));
        assert_eq!(s.min.as_ref().unwrap().get(0), 2.0);
        assert_eq!(s.max.as_ref().unwrap().get(0), 9.0);
    }

    #[test]
    fn status_ordering() {
        assert!(MapStatus::Staged < MapStatus::Ready);
        assert!(MapStatus::Ready < MapStatus::Active);
        assert!(MapStatus::Expired < MapStatus::Staged);
    }
}
