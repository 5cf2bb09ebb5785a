//! The four boundary crossings of an interface reference, plus the
//! demarshalling entry point for bootstrap descriptors.
//!
//! The asymmetry between the `in` and `out` pairs is deliberate: a callee
//! always emits one reference on a returned descriptor, and the caller must
//! consume it, either by gaining an object proxy that owns it or by
//! releasing it when an equivalent proxy already exists.

use std::sync::Arc;

use crate::error::ErrorCode;
use crate::interface::InterfaceDecl;
use crate::protocol::AddRefOptions;
use crate::proxy::ServiceProxy;
use crate::service::Service;
use crate::stub::ObjectStub;
use crate::types::{CallerChannelZoneId, CallerZoneId, InterfaceDescriptor};
use crate::version;

/// Caller side, outgoing argument: pass through the descriptor of a foreign
/// proxy, or wrap a local implementation into a (new or reused) stub.
///
/// `stub` receives a strong handle to the wrapping stub so the caller can
/// keep it pinned until the request is on the wire.
pub fn proxy_bind_in_param<D: InterfaceDecl>(
    protocol_version: u64,
    sp: &Arc<ServiceProxy>,
    iface: Option<&D::Obj>,
    stub: &mut Option<Arc<ObjectStub>>,
) -> Result<InterfaceDescriptor, ErrorCode> {
    let obj = match iface {
        Some(obj) => obj,
        None => return Ok(InterfaceDescriptor::NULL),
    };
    let service = sp.service().ok_or(ErrorCode::ZoneNotInitialised)?;
    let castable = D::to_castable(obj);

    // an interface belonging to another zone travels by its existing
    // descriptor; the callee binds it from its own end
    if let Some(proxy) = castable.as_proxy() {
        let object_proxy = proxy.object_proxy();
        if object_proxy.destination_zone_id() != service.zone_id().as_destination() {
            return Ok(InterfaceDescriptor::new(
                object_proxy.object_id(),
                object_proxy.destination_zone_id(),
            ));
        }
    }

    let obj = obj.clone();
    service.wrap_into_stub_descriptor(
        protocol_version,
        CallerChannelZoneId::default(),
        CallerZoneId::default(),
        &castable,
        &move |service| D::new_stub(obj.clone(), service),
        false,
        stub,
    )
}

/// Callee side, incoming argument: resolve a local descriptor through the
/// stub table, or build an object proxy over the right channel, taking one
/// remote reference on first use.
pub fn stub_bind_in_param<D: InterfaceDecl>(
    protocol_version: u64,
    service: &Arc<Service>,
    caller_channel_zone_id: CallerChannelZoneId,
    caller_zone_id: CallerZoneId,
    descriptor: InterfaceDescriptor,
) -> Result<Option<D::Obj>, ErrorCode> {
    if descriptor.is_null() {
        return Ok(None);
    }
    if service.zone_id().as_destination() == descriptor.destination_zone_id {
        return service
            .get_local_interface::<D>(protocol_version, descriptor.object_id)
            .map(Some)
            .ok_or(ErrorCode::ObjectNotFound);
    }

    let mut new_proxy_added = false;
    let service_proxy = service
        .get_zone_proxy(
            caller_channel_zone_id,
            caller_zone_id,
            descriptor.destination_zone_id,
            service.zone_id().as_caller(),
            &mut new_proxy_added,
        )
        .ok_or(ErrorCode::ObjectNotFound)?;

    let (object_proxy, is_new) = service_proxy.get_object_proxy(descriptor.object_id);
    if is_new {
        service_proxy.sp_add_ref(
            descriptor.object_id,
            CallerChannelZoneId::default(),
            AddRefOptions::NORMAL,
        )?;
        if !new_proxy_added {
            service_proxy.add_external_ref();
        }
    }
    object_proxy.query_interface::<D>(false).map(Some)
}

/// Callee side, outgoing result: pass a foreign proxy through (wiring its
/// route toward the caller), or wrap a local implementation.
pub fn stub_bind_out_param<D: InterfaceDecl>(
    service: &Arc<Service>,
    protocol_version: u64,
    caller_channel_zone_id: CallerChannelZoneId,
    caller_zone_id: CallerZoneId,
    iface: Option<&D::Obj>,
) -> Result<InterfaceDescriptor, ErrorCode> {
    let obj = match iface {
        Some(obj) => obj,
        None => return Ok(InterfaceDescriptor::NULL),
    };
    let castable = D::to_castable(obj);
    let obj = obj.clone();
    let mut stub = None;
    // the emitted count keeps a wrapped stub alive past this frame
    service.wrap_into_stub_descriptor(
        protocol_version,
        caller_channel_zone_id,
        caller_zone_id,
        &castable,
        &move |service| D::new_stub(obj.clone(), service),
        true,
        &mut stub,
    )
}

/// Caller side, incoming result: consume the reference the callee emitted.
/// A descriptor returning home resolves through the stub table and releases
/// the count the callee held on our behalf; a remote descriptor resolves to
/// an object proxy, eagerly releasing the callee's bookkeeping reference
/// when an equivalent proxy already exists.
pub fn proxy_bind_out_param<D: InterfaceDecl>(
    sp: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
    caller_zone_id: CallerZoneId,
) -> Result<Option<D::Obj>, ErrorCode> {
    if descriptor.is_null() {
        return Ok(None);
    }
    let service = sp.service().ok_or(ErrorCode::ZoneNotInitialised)?;

    if descriptor.destination_zone_id == service.zone_id().as_destination() {
        // the object came home
        let stub = service.get_object_stub(descriptor.object_id).ok_or(ErrorCode::ObjectNotFound)?;
        let count = service.release_local_stub(&stub);
        if count == 0 || count == u64::MAX {
            return Err(ErrorCode::ReferenceCountError);
        }
        let interface_stub = stub
            .get_interface(D::interface_id(version::VERSION_2))
            .ok_or(ErrorCode::InvalidInterfaceId)?;
        return D::from_castable(&interface_stub.castable())
            .map(Some)
            .ok_or(ErrorCode::InvalidCast);
    }

    let mut new_proxy_added = false;
    let service_proxy = if sp.destination_zone_id() != descriptor.destination_zone_id {
        // the object came from beyond the called zone; the channel it
        // travelled on becomes the caller channel of its route
        let caller_channel_zone_id = sp.destination_zone_id().as_caller_channel();
        service
            .get_zone_proxy(
                caller_channel_zone_id,
                caller_zone_id,
                descriptor.destination_zone_id,
                sp.zone_id().as_caller(),
                &mut new_proxy_added,
            )
            .ok_or(ErrorCode::ObjectNotFound)?
    } else {
        sp.clone()
    };

    let (object_proxy, is_new) = service_proxy.get_object_proxy(descriptor.object_id);
    if !is_new {
        // the callee add_ref'd on our behalf; an equivalent proxy already
        // owns a reference, so cancel the callee's bookkeeping
        debug_assert!(!new_proxy_added);
        if service_proxy.sp_release(descriptor.object_id).is_ok() {
            service_proxy.release_external_ref();
        }
    }
    object_proxy.query_interface::<D>(false).map(Some)
}

/// Caller side, after the request is on the wire: drop the in-flight count
/// [`proxy_bind_in_param`] took on a wrapped stub. The callee's own
/// `add_ref` is the durable reference; if the call never reached it, this
/// release tears the freshly wrapped stub down again.
pub fn release_in_flight_stub(sp: &Arc<ServiceProxy>, stub: Option<Arc<ObjectStub>>) {
    let stub = match stub {
        Some(stub) => stub,
        None => return,
    };
    match sp.service() {
        Some(service) => {
            service.release_local_stub(&stub);
        }
        None => log::error!("in-flight stub {} outlived its zone", stub.id()),
    }
}

/// Demarshal a descriptor received over a known channel into a typed
/// handle, e.g. a bootstrap root object. Descriptors from beyond the
/// channel's destination fall through to [`proxy_bind_out_param`].
pub fn demarshall_interface_proxy<D: InterfaceDecl>(
    protocol_version: u64,
    sp: &Arc<ServiceProxy>,
    descriptor: InterfaceDescriptor,
    caller_zone_id: CallerZoneId,
) -> Result<Option<D::Obj>, ErrorCode> {
    if protocol_version > version::current_version() {
        return Err(ErrorCode::IncompatibleService);
    }
    if descriptor.is_null() {
        return Ok(None);
    }
    if descriptor.destination_zone_id != sp.destination_zone_id() {
        return proxy_bind_out_param::<D>(sp, descriptor, caller_zone_id);
    }

    let service = sp.service().ok_or(ErrorCode::ZoneNotInitialised)?;
    if service.zone_id().as_destination() == descriptor.destination_zone_id {
        // a local object never arrives through a channel proxy
        log::error!("demarshalling a local descriptor through a channel");
        return Err(ErrorCode::InvalidData);
    }

    if service.parent_zone_id() == Some(sp.destination_zone_id()) {
        // objects handed down by the parent pin the parent channel
        sp.add_external_ref();
    }

    let (object_proxy, _is_new) = sp.get_object_proxy(descriptor.object_id);
    object_proxy.query_interface::<D>(false).map(Some)
}
