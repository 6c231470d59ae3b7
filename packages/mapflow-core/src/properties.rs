//! Heterogeneously typed property tables.
//!
//! Every shared object (device, signal, map, slot) carries a property
//! table: an insertion-ordered map from a known symbolic property or a
//! custom string name to a typed value. Tables serialise to the wire as
//! flat `@key value...` OSC argument groups and re-parse on the far side;
//! unknown keys are retained verbatim and round-trip byte-identically.

use bitflags::bitflags;
use rosc::OscType;
use std::fmt;

use crate::id::Id;
use crate::time::Timetag;

/// Canonical symbolic properties, serialised with the wire spellings
/// below (`numInst`, `isLocal`, ...).
#[derive(Clone, Copy, PartialEq, Eq, Debug, PartialOrd, Ord)]
pub enum Property {
    Name,
    Host,
    Port,
    Dir,
    Type,
    Len,
    Id,
    Min,
    Max,
    Unit,
    NumInst,
    Mode,
    Expr,
    Muted,
    Scope,
    Bound,
    Process,
    Version,
    IsLocal,
    Data,
    Steal,
    Instance,
    Lease,
}

impl Property {
    pub fn as_str(self) -> &'static str {
        match self {
            Property::Name => "name",
            Property::Host => "host",
            Property::Port => "port",
            Property::Dir => "dir",
            Property::Type => "type",
            Property::Len => "len",
            Property::Id => "id",
            Property::Min => "min",
            Property::Max => "max",
            Property::Unit => "unit",
            Property::NumInst => "numInst",
            Property::Mode => "mode",
            Property::Expr => "expr",
            Property::Muted => "muted",
            Property::Scope => "scope",
            Property::Bound => "bound",
            Property::Process => "process",
            Property::Version => "version",
            Property::IsLocal => "isLocal",
            Property::Data => "data",
            Property::Steal => "steal",
            Property::Instance => "instance",
            Property::Lease => "lease",
        }
    }

    pub fn from_str(name: &str) -> Option<Property> {
        Some(match name {
            "name" => Property::Name,
            "host" => Property::Host,
            "port" => Property::Port,
            "dir" => Property::Dir,
            "type" => Property::Type,
            "len" => Property::Len,
            "id" => Property::Id,
            "min" => Property::Min,
            "max" => Property::Max,
            "unit" => Property::Unit,
            "numInst" => Property::NumInst,
            "mode" => Property::Mode,
            "expr" => Property::Expr,
            "muted" => Property::Muted,
            "scope" => Property::Scope,
            "bound" => Property::Bound,
            "process" => Property::Process,
            "version" => Property::Version,
            "isLocal" => Property::IsLocal,
            "data" => Property::Data,
            "steal" => Property::Steal,
            "instance" => Property::Instance,
            "lease" => Property::Lease,
            _ => return None,
        })
    }
}

/// A property key: known symbolic index or custom string name.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PropKey {
    Known(Property),
    Custom(String),
}

impl PropKey {
    /// Parses a wire key, with or without the leading `@`.
    pub fn parse(raw: &str) -> PropKey {
        let name = raw.strip_prefix('@').unwrap_or(raw);
        match Property::from_str(name) {
            Some(p) => PropKey::Known(p),
            None => PropKey::Custom(name.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PropKey::Known(p) => p.as_str(),
            PropKey::Custom(s) => s.as_str(),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, PropKey::Known(_))
    }
}

impl From<Property> for PropKey {
    fn from(p: Property) -> Self {
        PropKey::Known(p)
    }
}

impl fmt::Display for PropKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.as_str())
    }
}

/// A typed property value.
#[derive(Clone, PartialEq, Debug)]
pub enum PropValue {
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    Str(String),
    Time(Timetag),
    DeviceRef(Id),
    SignalRef(Id),
    MapRef(Id),
    List(Vec<PropValue>),
}

impl PropValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropValue::Bool(b) => Some(*b as i64),
            PropValue::I32(v) => Some(*v as i64),
            PropValue::I64(v) => Some(*v),
            PropValue::F32(v) => Some(*v as i64),
            PropValue::F64(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropValue::Bool(b) => Some(*b as i64 as f64),
            PropValue::I32(v) => Some(*v as f64),
            PropValue::I64(v) => Some(*v as f64),
            PropValue::F32(v) => Some(*v as f64),
            PropValue::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            PropValue::I32(v) => Some(*v != 0),
            _ => None,
        }
    }

    fn to_osc(&self, out: &mut Vec<OscType>) {
        match self {
            PropValue::Bool(b) => out.push(OscType::Bool(*b)),
            PropValue::I32(v) => out.push(OscType::Int(*v)),
            PropValue::I64(v) => out.push(OscType::Long(*v)),
            PropValue::F32(v) => out.push(OscType::Float(*v)),
            PropValue::F64(v) => out.push(OscType::Double(*v)),
            PropValue::Char(c) => out.push(OscType::Char(*c)),
            PropValue::Str(s) => out.push(OscType::String(s.clone())),
            PropValue::Time(t) => out.push(OscType::Time((*t).into())),
            // Object references serialise as int64 ids.
            PropValue::DeviceRef(id) | PropValue::SignalRef(id) | PropValue::MapRef(id) => {
                out.push(OscType::Long(id.as_u64() as i64))
            }
            PropValue::List(items) => {
                for item in items {
                    item.to_osc(out);
                }
            }
        }
    }

    fn from_osc(arg: &OscType) -> Option<PropValue> {
        Some(match arg {
            OscType::Bool(b) => PropValue::Bool(*b),
            OscType::Int(v) => PropValue::I32(*v),
            OscType::Long(v) => PropValue::I64(*v),
            OscType::Float(v) => PropValue::F32(*v),
            OscType::Double(v) => PropValue::F64(*v),
            OscType::Char(c) => PropValue::Char(*c),
            OscType::String(s) => PropValue::Str(s.clone()),
            OscType::Time(t) => PropValue::Time((*t).into()),
            _ => return None,
        })
    }
}

bitflags! {
    /// Per-record bookkeeping flags.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RecordFlags: u8 {
        /// A remote peer may overwrite this record.
        const MOD_REMOTE = 1 << 0;
        /// The local API may overwrite this record.
        const MOD_LOCAL = 1 << 1;
        /// The value mirrors a field of the owning struct.
        const INDIRECT = 1 << 2;
        /// Changed since the last network push.
        const DIRTY = 1 << 3;
    }
}

#[derive(Clone, Debug)]
pub struct PropertyRecord {
    pub key: PropKey,
    pub value: PropValue,
    pub flags: RecordFlags,
}

/// Insertion-ordered table of typed properties.
#[derive(Clone, Default, Debug)]
pub struct PropertyTable {
    records: Vec<PropertyRecord>,
}

impl PropertyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PropertyRecord> {
        self.records.iter()
    }

    fn position(&self, key: &PropKey) -> Option<usize> {
        self.records.iter().position(|r| &r.key == key)
    }

    pub fn get(&self, key: impl Into<PropKey>) -> Option<&PropValue> {
        let key = key.into();
        self.position(&key).map(|i| &self.records[i].value)
    }

    pub fn contains(&self, key: impl Into<PropKey>) -> bool {
        let key = key.into();
        self.position(&key).is_some()
    }

    /// Sets a property, returning the number of records modified (0 when
    /// the stored value already compares equal). New records default to
    /// locally modifiable.
    pub fn set(&mut self, key: impl Into<PropKey>, value: PropValue) -> usize {
        self.set_with_flags(key, value, RecordFlags::MOD_LOCAL | RecordFlags::MOD_REMOTE)
    }

    pub fn set_with_flags(
        &mut self,
        key: impl Into<PropKey>,
        value: PropValue,
        flags: RecordFlags,
    ) -> usize {
        let key = key.into();
        match self.position(&key) {
            Some(i) => {
                if self.records[i].value == value {
                    return 0;
                }
                self.records[i].value = value;
                self.records[i].flags |= RecordFlags::DIRTY;
                1
            }
            None => {
                self.records.push(PropertyRecord {
                    key,
                    value,
                    flags: flags | RecordFlags::DIRTY,
                });
                1
            }
        }
    }

    pub fn remove(&mut self, key: impl Into<PropKey>) -> bool {
        let key = key.into();
        match self.position(&key) {
            Some(i) => {
                self.records.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear_dirty(&mut self) {
        for r in &mut self.records {
            r.flags.remove(RecordFlags::DIRTY);
        }
    }

    pub fn any_dirty(&self) -> bool {
        self.records.iter().any(|r| r.flags.contains(RecordFlags::DIRTY))
    }

    /// Serialises the table as `@key value...` argument groups: known
    /// symbolic properties first, then custom-named ones, preserving
    /// insertion order within each namespace.
    pub fn to_osc_args(&self, out: &mut Vec<OscType>) {
        for known in [true, false] {
            for r in self.records.iter().filter(|r| r.key.is_known() == known) {
                out.push(OscType::String(r.key.to_string()));
                r.value.to_osc(out);
            }
        }
    }

    /// Applies `@key value...` groups from a received message. When
    /// `remote` is set, records lacking `MOD_REMOTE` are left untouched.
    /// Returns the number of records modified.
    pub fn update_from_args(&mut self, args: &[OscType], remote: bool) -> usize {
        let mut modified = 0;
        for (key, values) in split_arg_groups(args) {
            let key = PropKey::parse(key);
            if remote {
                if let Some(i) = self.position(&key) {
                    if !self.records[i].flags.contains(RecordFlags::MOD_REMOTE) {
                        continue;
                    }
                }
            }
            let parsed: Vec<PropValue> = values.iter().filter_map(PropValue::from_osc).collect();
            let value = match parsed.len() {
                0 => continue,
                1 => parsed.into_iter().next().unwrap(),
                _ => PropValue::List(parsed),
            };
            modified += self.set(key, value);
        }
        modified
    }
}

/// Splits a flat OSC argument list into `(@key, values)` groups.
pub fn split_arg_groups(args: &[OscType]) -> Vec<(&str, &[OscType])> {
    let mut groups = Vec::new();
    let mut key: Option<(&str, usize)> = None;
    for (i, arg) in args.iter().enumerate() {
        if let OscType::String(s) = arg {
            if s.starts_with('@') {
                if let Some((k, start)) = key.take() {
                    groups.push((k, &args[start..i]));
                }
                key = Some((s.as_str(), i + 1));
                continue;
            }
        }
    }
    if let Some((k, start)) = key {
        groups.push((k, &args[start..]));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_modified_count() {
        let mut t = PropertyTable::new();
        assert_eq!(t.set(Property::Port, PropValue::I32(7570)), 1);
        assert_eq!(t.set(Property::Port, PropValue::I32(7570)), 0);
        assert_eq!(t.set(Property::Port, PropValue::I32(7571)), 1);
    }

    #[test]
    fn known_properties_serialise_before_custom() {
        let mut t = PropertyTable::new();
        t.set(PropKey::Custom("flavour".into()), PropValue::Str("sour".into()));
        t.set(Property::Name, PropValue::Str("synth.1".into()));
        let mut args = Vec::new();
        t.to_osc_args(&mut args);
        assert_eq!(args[0], OscType::String("@name".into()));
        assert_eq!(args[2], OscType::String("@flavour".into()));
    }

    #[test]
    fn wire_round_trip_preserves_known_and_unknown() {
        let mut t = PropertyTable::new();
        t.set(Property::Len, PropValue::I32(3));
        t.set(Property::Min, PropValue::List(vec![
            PropValue::F32(0.0),
            PropValue::F32(0.0),
            PropValue::F32(0.0),
        ]));
        t.set(PropKey::Custom("colour".into()), PropValue::Str("teal".into()));
        let mut args = Vec::new();
        t.to_osc_args(&mut args);

        let mut back = PropertyTable::new();
        back.update_from_args(&args, false);
        assert_eq!(back.get(Property::Len), Some(&PropValue::I32(3)));
        assert_eq!(
            back.get(PropKey::Custom("colour".into())),
            Some(&PropValue::Str("teal".into()))
        );
        let min = back.get(Property::Min).unwrap();
        assert_eq!(
            min,
            &PropValue::List(vec![
                PropValue::F32(0.0),
                PropValue::F32(0.0),
                PropValue::F32(0.0)
            ])
        );

        // and the round trip is stable
        let mut args2 = Vec::new();
        back.to_osc_args(&mut args2);
        assert_eq!(args, args2);
    }

    #[test]
    fn remote_updates_respect_mod_remote() {
        let mut t = PropertyTable::new();
        t.set_with_flags(
            Property::Name,
            PropValue::Str("synth.1".into()),
            RecordFlags::MOD_LOCAL,
        );
        let args = vec![
            OscType::String("@name".into()),
            OscType::String("evil".into()),
        ];
        assert_eq!(t.update_from_args(&args, true), 0);
        assert_eq!(t.get(Property::Name).unwrap().as_str(), Some("synth.1"));
        assert_eq!(t.update_from_args(&args, false), 1);
    }

    #[test]
    fn dirty_tracking() {
        let mut t = PropertyTable::new();
        t.set(Property::Version, PropValue::I32(1));
        assert!(t.any_dirty());
        t.clear_dirty();
        assert!(!t.any_dirty());
    }
}
