//! In-process channels and child-zone wiring.
//!
//! The simplest transport: both zones live in one process and a channel is
//! a weak handle to the peer's hub. This is what child zones (sandboxes
//! spawned by a host) run on; network transports implement the same
//! [`Channel`] trait elsewhere.

use std::sync::{Arc, Weak};

use crate::bind;
use crate::error::ErrorCode;
use crate::interface::InterfaceDecl;
use crate::protocol::{CallRequest, RefRequest};
use crate::proxy::{Channel, ServiceProxy};
use crate::service::Service;
use crate::telemetry::Telemetry;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationZoneId, InterfaceDescriptor, InterfaceOrdinal,
    ObjectId,
};
use crate::version;

/// A channel to another zone in the same process.
#[derive(Debug)]
pub struct LocalChannel {
    remote: Weak<Service>,
}

impl LocalChannel {
    /// Open a channel onto a hub in this process.
    pub fn new(remote: &Arc<Service>) -> Arc<Self> {
        Arc::new(Self { remote: Arc::downgrade(remote) })
    }

    fn remote(&self) -> Result<Arc<Service>, ErrorCode> {
        self.remote.upgrade().ok_or(ErrorCode::ZoneNotInitialised)
    }
}

impl Channel for LocalChannel {
    fn send(&self, request: CallRequest) -> Result<Vec<u8>, ErrorCode> {
        self.remote()?.send(request)
    }

    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Result<(), ErrorCode> {
        self.remote()?.try_cast(protocol_version, destination_zone_id, object_id, interface_id)
    }

    fn add_ref(&self, request: RefRequest) -> Result<u64, ErrorCode> {
        self.remote()?.add_ref(request)
    }

    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
    ) -> Result<u64, ErrorCode> {
        self.remote()?.release(protocol_version, destination_zone_id, object_id, caller_zone_id)
    }
}

/// A running child zone, as seen from its parent.
///
/// Dropping the handle unpins the parent's outbound channel and shuts the
/// child's hub down; any object references must have been drained first.
#[derive(Debug)]
pub struct ChildZone {
    service: Arc<Service>,
    outbound: Arc<ServiceProxy>,
}

impl ChildZone {
    /// The child's hub.
    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// The parent's channel into the child.
    pub fn proxy(&self) -> &Arc<ServiceProxy> {
        &self.outbound
    }
}

impl Drop for ChildZone {
    fn drop(&mut self) {
        // balance the pin taken when the route was registered; the proxy
        // itself dies once the last handle (ours) goes
        self.outbound.release_external_ref();
    }
}

/// Spawn a child zone wired to `parent` over in-process channels.
///
/// The child's channel back to the parent is registered, pinned and flagged
/// as the parent channel, so the parent zone outlives the child; the
/// parent's channel into the child is registered and returned in the
/// [`ChildZone`] handle.
pub fn connect_child_zone(
    parent: &Arc<Service>,
    name: &str,
    telemetry: Option<Arc<dyn Telemetry>>,
) -> Result<ChildZone, ErrorCode> {
    let child = Service::new_child(name, Service::generate_zone_id(), telemetry);

    let child_to_parent =
        ServiceProxy::new(name, &child, parent.zone_id().as_destination(), LocalChannel::new(parent));
    child.add_zone_proxy(&child_to_parent);
    child.set_parent_proxy(&child_to_parent)?;

    let parent_to_child =
        ServiceProxy::new(name, parent, child.zone_id().as_destination(), LocalChannel::new(&child));
    parent.add_zone_proxy(&parent_to_child);

    Ok(ChildZone { service: child, outbound: parent_to_child })
}

/// Publish an object of this zone toward `to_caller`, returning the
/// descriptor the peer demarshals with [`import_object`]. This is the
/// bootstrap step an application performs once per child zone; everything
/// after travels as call parameters.
pub fn export_object<D: InterfaceDecl>(
    service: &Arc<Service>,
    to_caller: CallerZoneId,
    obj: &D::Obj,
) -> Result<InterfaceDescriptor, ErrorCode> {
    bind::stub_bind_out_param::<D>(
        service,
        version::current_version(),
        CallerChannelZoneId::default(),
        to_caller,
        Some(obj),
    )
}

/// Demarshal a descriptor published by [`export_object`] on the other end
/// of `sp`.
pub fn import_object<D: InterfaceDecl>(
    sp: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
) -> Result<Option<D::Obj>, ErrorCode> {
    bind::demarshall_interface_proxy::<D>(
        version::current_version(),
        sp,
        descriptor,
        sp.zone_id().as_caller(),
    )
}
