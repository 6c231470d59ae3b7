//! Mapflow core - decentralized live signal mapping.
//!
//! This crate implements a runtime for routing typed, vector-valued,
//! possibly multi-instance *signals* between independent processes
//! (*devices*) on a local network. Devices discover each other over a
//! multicast bus, replicate a graph of everything on it, and negotiate
//! *maps* that transform source signals into destination signals with a
//! compiled arithmetic expression, streaming results peer to peer.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`device`]: the top-level container and cooperative `poll` loop
//! - [`net`]: multicast bus, unicast mesh, ordinal allocation, wire codec
//! - [`graph`]: the replicated device/signal/map/link index with queries
//!   and subscriptions
//! - [`signal`]: signals, instance pools and steal policies
//! - [`map`]: slots, boundary actions and the map status machine
//! - [`expr`]: the expression compiler and stack-machine evaluator
//! - [`buffer`] / [`idmap`] / [`properties`]: value rings, instance id
//!   agreement, typed property tables
//! - [`error`]: centralized error types
//!
//! # Example
//!
//! ```no_run
//! use mapflow_core::{Device, NetworkConfig, SignalBuilder, Vector};
//!
//! let mut dev = Device::new("synth", NetworkConfig::default()).unwrap();
//! while !dev.is_ready() {
//!     dev.poll(10);
//! }
//! let out = dev
//!     .add_signal(SignalBuilder::output("freq").with_length(1))
//!     .unwrap();
//! let t = dev.now();
//! dev.set_value(out, Vector::F32(vec![440.0]), t).unwrap();
//! dev.poll(10);
//! ```

#![warn(clippy::all)]

pub mod buffer;
pub mod device;
pub mod error;
pub mod expr;
pub mod graph;
pub mod id;
pub mod idmap;
pub mod link;
pub mod map;
pub mod net;
pub mod properties;
pub mod signal;
pub mod time;
pub mod value;

// Re-export commonly used types at the crate root
pub use device::{Device, MapBuilder, SignalBuilder, SignalCallback, SignalEvent};
pub use error::{MapflowError, MapflowResult};
pub use expr::{CompiledExpr, ExprContext, ExprError};
pub use graph::{Graph, GraphEvent, Query, QueryOp, RecordAction, RecordType, SubscribeFlags};
pub use id::Id;
pub use map::{BoundaryAction, MapMode, MapStatus, ProcessLocation};
pub use net::{NetworkConfig, MULTICAST_GROUP, MULTICAST_PORT};
pub use signal::{Direction, SignalEvents, StealPolicy};
pub use time::{Clock, Timetag};
pub use value::{ScalarType, Vector};
