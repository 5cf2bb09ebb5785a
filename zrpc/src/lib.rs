//! Cross-zone RPC fabric: the routing and reference-management engine that
//! makes a graph of isolated zones (processes, enclaves, sandboxes) behave
//! like one coherent object model.
//!
//! Each zone runs one [`service::Service`], the hub owning local object
//! stubs and the table of outbound [`proxy::ServiceProxy`] channels. Object
//! references cross zone boundaries as two-word descriptors; the
//! [`bind`] helpers convert between descriptors and typed handles on the
//! four boundary crossings, and the service's `add_ref`/`release` routing
//! keeps every reference count paired with exactly one opposite change,
//! even across forks and reroutes the original caller never sees.
//!
//! The concrete transport is pluggable behind [`proxy::Channel`];
//! [`local::LocalChannel`] wires zones of one process together, which is
//! all child-zone sandboxes need.

#![forbid(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod bind;
pub mod error;
pub mod interface;
pub mod local;
pub mod protocol;
pub mod proxy;
pub mod service;
pub mod stub;
pub mod telemetry;
pub mod types;
pub mod version;

pub use error::ErrorCode;
pub use protocol::{AddRefOptions, Encoding};
pub use service::Service;
pub use types::{InterfaceDescriptor, ObjectId, ZoneId};
