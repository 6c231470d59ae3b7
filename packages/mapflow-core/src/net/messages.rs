//! Wire message model.
//!
//! Every message is an OSC message; bundles carry a timetag around one or
//! more of them. This module parses inbound packets into a typed
//! [`Message`] and builds outbound ones, keeping the address grammar in a
//! single place:
//!
//! ```text
//! /sync <name> <version>
//! /name/probe <name> <nonce>
//! /name/registered <name> @id .. @host .. @port ..
//! /who
//! /<device>/subscribe [flags..] @lease <sec> @version <v>
//! /<device>/unsubscribe
//! /<device>/signal <name> @dir .. @type .. @len ..
//! /<device>/signal/removed <name>
//! /map <src..> -> <dst> @props..
//! /mapped | /mapModify | /unmap
//! /<device>/<signal> [@instance <i64>] <values..>
//! /<device>/<signal>/release @instance <i64>
//! /<device>/<signal>/slot/<n> [@instance <i64>] <values..>
//! ```

use rosc::{OscMessage, OscType};

use crate::graph::SubscribeFlags;
use crate::value::Vector;

pub const SYNC: &str = "/sync";
pub const NAME_PROBE: &str = "/name/probe";
pub const NAME_REGISTERED: &str = "/name/registered";
pub const WHO: &str = "/who";
pub const MAP: &str = "/map";
pub const MAPPED: &str = "/mapped";
pub const MAP_MODIFY: &str = "/mapModify";
pub const UNMAP: &str = "/unmap";

/// A parsed inbound message.
#[derive(Debug)]
pub enum Message {
    Sync {
        name: String,
        version: i32,
    },
    NameProbe {
        name: String,
        nonce: u32,
    },
    NameRegistered {
        name: String,
        args: Vec<OscType>,
    },
    Who,
    Subscribe {
        device: String,
        flags: SubscribeFlags,
        lease: i32,
        version: i32,
    },
    Unsubscribe {
        device: String,
    },
    SignalMeta {
        device: String,
        args: Vec<OscType>,
    },
    SignalRemoved {
        device: String,
        name: String,
    },
    Map {
        srcs: Vec<String>,
        dst: String,
        args: Vec<OscType>,
    },
    Mapped {
        srcs: Vec<String>,
        dst: String,
        args: Vec<OscType>,
    },
    MapModify {
        srcs: Vec<String>,
        dst: String,
        args: Vec<OscType>,
    },
    Unmap {
        srcs: Vec<String>,
        dst: String,
    },
    SignalUpdate {
        /// `device/signal`
        signal: String,
        instance: Option<i64>,
        values: Vec<OscType>,
    },
    SignalRelease {
        signal: String,
        instance: i64,
    },
    /// Raw source sample for a map processed at the destination.
    SlotUpdate {
        /// Destination `device/signal`.
        signal: String,
        slot: usize,
        instance: Option<i64>,
        values: Vec<OscType>,
    },
}

pub fn parse(msg: &OscMessage) -> Option<Message> {
    let args = &msg.args;
    match msg.addr.as_str() {
        SYNC => Some(Message::Sync {
            name: str_arg(args, 0)?.to_string(),
            version: int_arg(args, 1).unwrap_or(0) as i32,
        }),
        NAME_PROBE => Some(Message::NameProbe {
            name: str_arg(args, 0)?.to_string(),
            nonce: int_arg(args, 1)? as u32,
        }),
        NAME_REGISTERED => Some(Message::NameRegistered {
            name: str_arg(args, 0)?.to_string(),
            args: args[1..].to_vec(),
        }),
        WHO => Some(Message::Who),
        MAP | MAPPED | MAP_MODIFY | UNMAP => {
            let (srcs, dst, rest) = parse_endpoints(args)?;
            Some(match msg.addr.as_str() {
                MAP => Message::Map {
                    srcs,
                    dst,
                    args: rest,
                },
                MAPPED => Message::Mapped {
                    srcs,
                    dst,
                    args: rest,
                },
                MAP_MODIFY => Message::MapModify {
                    srcs,
                    dst,
                    args: rest,
                },
                _ => Message::Unmap { srcs, dst },
            })
        }
        _ => parse_pathed(msg),
    }
}

/// Messages whose address embeds device (and signal) names.
fn parse_pathed(msg: &OscMessage) -> Option<Message> {
    let segs: Vec<&str> = msg.addr.trim_start_matches('/').split('/').collect();
    let args = &msg.args;
    match segs.as_slice() {
        [device, "subscribe"] => {
            let mut flags = SubscribeFlags::empty();
            let mut lease = AUTOSUBSCRIBE_FALLBACK;
            let mut version = 0;
            let mut i = 0;
            while let Some(word) = str_arg(args, i) {
                if word.starts_with('@') {
                    break;
                }
                if let Some(f) = SubscribeFlags::from_wire(word) {
                    flags |= f;
                }
                i += 1;
            }
            for (key, values) in crate::properties::split_arg_groups(&args[i..]) {
                match key {
                    "@lease" => lease = values.first().and_then(osc_int).map(|v| v as i32).unwrap_or(lease),
                    "@version" => version = values.first().and_then(osc_int).map(|v| v as i32).unwrap_or(0),
                    _ => {}
                }
            }
            if flags.is_empty() {
                flags = SubscribeFlags::ALL;
            }
            Some(Message::Subscribe {
                device: device.to_string(),
                flags,
                lease,
                version,
            })
        }
        [device, "unsubscribe"] => Some(Message::Unsubscribe {
            device: device.to_string(),
        }),
        [device, "signal"] => Some(Message::SignalMeta {
            device: device.to_string(),
            args: args.clone(),
        }),
        [device, "signal", "removed"] => Some(Message::SignalRemoved {
            device: device.to_string(),
            name: str_arg(args, 0)?.to_string(),
        }),
        [device, signal, "release"] => {
            let (instance, _) = instance_prefix(args);
            Some(Message::SignalRelease {
                signal: format!("{}/{}", device, signal),
                instance: instance?,
            })
        }
        [device, signal, "slot", idx] => {
            let (instance, values) = instance_prefix(args);
            Some(Message::SlotUpdate {
                signal: format!("{}/{}", device, signal),
                slot: idx.parse().ok()?,
                instance,
                values,
            })
        }
        [device, signal] => {
            let (instance, values) = instance_prefix(args);
            Some(Message::SignalUpdate {
                signal: format!("{}/{}", device, signal),
                instance,
                values,
            })
        }
        _ => None,
    }
}

/// Default lease when a subscriber names none.
const AUTOSUBSCRIBE_FALLBACK: i32 = crate::graph::AUTOSUBSCRIBE_LEASE_SEC;

/// Splits `<src..> -> <dst> rest..`.
fn parse_endpoints(args: &[OscType]) -> Option<(Vec<String>, String, Vec<OscType>)> {
    let arrow = args.iter().position(|a| matches!(a, OscType::String(s) if s == "->"))?;
    let srcs: Vec<String> = args[..arrow]
        .iter()
        .filter_map(|a| match a {
            OscType::String(s) => Some(s.trim_start_matches('/').to_string()),
            _ => None,
        })
        .collect();
    if srcs.is_empty() || srcs.len() != arrow {
        return None;
    }
    let dst = match args.get(arrow + 1)? {
        OscType::String(s) => s.trim_start_matches('/').to_string(),
        _ => return None,
    };
    Some((srcs, dst, args[arrow + 2..].to_vec()))
}

/// Strips a leading `@instance <i64>` group off a data message.
fn instance_prefix(args: &[OscType]) -> (Option<i64>, Vec<OscType>) {
    match args.split_first() {
        Some((OscType::String(key), rest)) if key == "@instance" => match rest.split_first() {
            Some((OscType::Long(gid), values)) => (Some(*gid), values.to_vec()),
            Some((OscType::Int(gid), values)) => (Some(*gid as i64), values.to_vec()),
            _ => (None, rest.to_vec()),
        },
        _ => (None, args.to_vec()),
    }
}

fn str_arg(args: &[OscType], i: usize) -> Option<&str> {
    match args.get(i)? {
        OscType::String(s) => Some(s.as_str()),
        _ => None,
    }
}

fn int_arg(args: &[OscType], i: usize) -> Option<i64> {
    osc_int(args.get(i)?)
}

fn osc_int(arg: &OscType) -> Option<i64> {
    match arg {
        OscType::Int(v) => Some(*v as i64),
        OscType::Long(v) => Some(*v),
        _ => None,
    }
}

// ── builders ────────────────────────────────────────────────────────────

pub fn sync(name: &str, version: i32) -> OscMessage {
    OscMessage {
        addr: SYNC.to_string(),
        args: vec![
            OscType::String(name.to_string()),
            OscType::Int(version),
        ],
    }
}

pub fn name_probe(name: &str, nonce: u32) -> OscMessage {
    OscMessage {
        addr: NAME_PROBE.to_string(),
        args: vec![
            OscType::String(name.to_string()),
            OscType::Int(nonce as i32),
        ],
    }
}

pub fn name_registered(name: &str, id: u64, host: &str, port: u16) -> OscMessage {
    OscMessage {
        addr: NAME_REGISTERED.to_string(),
        args: vec![
            OscType::String(name.to_string()),
            OscType::String("@id".to_string()),
            OscType::Long(id as i64),
            OscType::String("@host".to_string()),
            OscType::String(host.to_string()),
            OscType::String("@port".to_string()),
            OscType::Int(port as i32),
        ],
    }
}

pub fn who() -> OscMessage {
    OscMessage {
        addr: WHO.to_string(),
        args: vec![],
    }
}

pub fn subscribe(device: &str, flags: SubscribeFlags, lease: i32, version: i32) -> OscMessage {
    let mut args: Vec<OscType> = flags
        .to_wire()
        .into_iter()
        .map(|w| OscType::String(w.to_string()))
        .collect();
    args.push(OscType::String("@lease".to_string()));
    args.push(OscType::Int(lease));
    args.push(OscType::String("@version".to_string()));
    args.push(OscType::Int(version));
    OscMessage {
        addr: format!("/{}/subscribe", device),
        args,
    }
}

pub fn unsubscribe(device: &str) -> OscMessage {
    OscMessage {
        addr: format!("/{}/unsubscribe", device),
        args: vec![],
    }
}

pub fn signal_meta(device: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: format!("/{}/signal", device),
        args,
    }
}

pub fn signal_removed(device: &str, signal: &str) -> OscMessage {
    OscMessage {
        addr: format!("/{}/signal/removed", device),
        args: vec![OscType::String(signal.to_string())],
    }
}

pub fn map_message(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

pub fn unmap(srcs: &[String], dst: &str) -> OscMessage {
    let mut args: Vec<OscType> = srcs
        .iter()
        .map(|s| OscType::String(s.clone()))
        .collect();
    args.push(OscType::String("->".to_string()));
    args.push(OscType::String(dst.to_string()));
    OscMessage {
        addr: UNMAP.to_string(),
        args,
    }
}

pub fn signal_update(signal: &str, instance: Option<i64>, value: &Vector) -> OscMessage {
    let mut args = Vec::new();
    if let Some(gid) = instance {
        args.push(OscType::String("@instance".to_string()));
        args.push(OscType::Long(gid));
    }
    value.push_osc_args(&mut args);
    OscMessage {
        addr: format!("/{}", signal),
        args,
    }
}

pub fn slot_update(signal: &str, slot: usize, instance: Option<i64>, value: &Vector) -> OscMessage {
    let mut args = Vec::new();
    if let Some(gid) = instance {
        args.push(OscType::String("@instance".to_string()));
        args.push(OscType::Long(gid));
    }
    value.push_osc_args(&mut args);
    OscMessage {
        addr: format!("/{}/slot/{}", signal, slot),
        args,
    }
}

pub fn signal_release(signal: &str, instance: i64) -> OscMessage {
    OscMessage {
        addr: format!("/{}/release", signal),
        args: vec![
            OscType::String("@instance".to_string()),
            OscType::Long(instance),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ScalarType;

    #[test]
    fn sync_round_trips() {
        let m = sync("synth.1", 4);
        match parse(&m) {
            Some(Message::Sync { name, version }) => {
                assert_eq!(name, "synth.1");
                assert_eq!(version, 4);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn registered_carries_address_args() {
        let m = name_registered("synth.1", 42, "10.0.0.2", 9001);
        match parse(&m) {
            Some(Message::NameRegistered { name, args }) => {
                assert_eq!(name, "synth.1");
                let groups = crate::properties::split_arg_groups(&args);
                assert_eq!(groups.len(), 3);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn subscribe_parses_flags_and_lease() {
        let m = subscribe("synth.1", SubscribeFlags::ALL, -1, 7);
        match parse(&m) {
            Some(Message::Subscribe {
                device,
                flags,
                lease,
                version,
            }) => {
                assert_eq!(device, "synth.1");
                assert_eq!(flags, SubscribeFlags::ALL);
                assert_eq!(lease, -1);
                assert_eq!(version, 7);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn map_endpoints_split_on_arrow() {
        let m = OscMessage {
            addr: MAP.to_string(),
            args: vec![
                OscType::String("a.1/out".to_string()),
                OscType::String("b.1/out".to_string()),
                OscType::String("->".to_string()),
                OscType::String("c.1/in".to_string()),
                OscType::String("@mode".to_string()),
                OscType::String("expression".to_string()),
            ],
        };
        match parse(&m) {
            Some(Message::Map { srcs, dst, args }) => {
                assert_eq!(srcs, vec!["a.1/out".to_string(), "b.1/out".to_string()]);
                assert_eq!(dst, "c.1/in");
                assert_eq!(args.len(), 2);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn instanced_update_keeps_wire_format() {
        let v = Vector::from_f64s(ScalarType::Int32, &[5.0]);
        let m = signal_update("b.1/in", Some(0xAB), &v);
        // the instance id is always an int64 on the wire
        assert_eq!(m.args[1], OscType::Long(0xAB));
        match parse(&m) {
            Some(Message::SignalUpdate {
                signal,
                instance,
                values,
            }) => {
                assert_eq!(signal, "b.1/in");
                assert_eq!(instance, Some(0xAB));
                assert_eq!(values, vec![OscType::Int(5)]);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn plain_update_has_no_instance() {
        let v = Vector::from_f64s(ScalarType::Float, &[1.5, 2.5]);
        let m = signal_update("b.1/in", None, &v);
        match parse(&m) {
            Some(Message::SignalUpdate {
                instance, values, ..
            }) => {
                assert_eq!(instance, None);
                assert_eq!(values.len(), 2);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn release_and_slot_addresses() {
        let m = signal_release("b.1/in", 9);
        assert_eq!(m.addr, "/b.1/in/release");
        assert!(matches!(
            parse(&m),
            Some(Message::SignalRelease { instance: 9, .. })
        ));

        let v = Vector::from_f64s(ScalarType::Float, &[1.0]);
        let m = slot_update("b.1/in", 1, None, &v);
        assert_eq!(m.addr, "/b.1/in/slot/1");
        match parse(&m) {
            Some(Message::SlotUpdate { slot, .. }) => assert_eq!(slot, 1),
            other => panic!("{:?}", other),
        }
    }
}
