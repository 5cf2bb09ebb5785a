//! Optional observer notified at every lifecycle and routing event.
//!
//! A sink is attached to a service at construction; every notification is
//! best-effort and must not panic. The default for every method is a no-op
//! so sinks implement only what they care about.

use crate::protocol::AddRefOptions;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId,
    InterfaceOrdinal, MethodId, ObjectId, ZoneId,
};

/// Telemetry sink. All ids are strongly typed; counts are the value after
/// the operation they report.
#[allow(unused_variables)]
pub trait Telemetry: Send + Sync {
    /// A service came up.
    fn on_service_creation(&self, name: &str, zone_id: ZoneId) {}
    /// A service shut down.
    fn on_service_deletion(&self, zone_id: ZoneId) {}

    /// A service proxy was created (or cloned for a new route).
    fn on_service_proxy_creation(
        &self,
        name: &str,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
    ) {
    }
    /// A service proxy was destroyed.
    fn on_service_proxy_deletion(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
    ) {
    }
    /// A proxy-level `try_cast` is about to be sent.
    fn on_service_proxy_try_cast(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) {
    }
    /// A proxy-level `add_ref` is about to be sent.
    fn on_service_proxy_add_ref(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        caller_zone_id: CallerZoneId,
        object_id: ObjectId,
        options: AddRefOptions,
    ) {
    }
    /// A proxy-level `release` is about to be sent.
    fn on_service_proxy_release(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        caller_zone_id: CallerZoneId,
        object_id: ObjectId,
    ) {
    }
    /// A service proxy gained an external reference.
    fn on_service_proxy_add_external_ref(
        &self,
        zone_id: ZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
        count: i64,
    ) {
    }
    /// A service proxy dropped an external reference.
    fn on_service_proxy_release_external_ref(
        &self,
        zone_id: ZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
        count: i64,
    ) {
    }

    /// A service routed a `try_cast`.
    fn on_service_try_cast(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) {
    }
    /// A service routed an `add_ref`.
    fn on_service_add_ref(
        &self,
        zone_id: ZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        options: AddRefOptions,
    ) {
    }
    /// A service routed a `release`.
    fn on_service_release(
        &self,
        zone_id: ZoneId,
        destination_channel_zone_id: DestinationChannelZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
    ) {
    }

    /// A stub was created for a wrapped implementation.
    fn on_stub_creation(&self, zone_id: ZoneId, object_id: ObjectId) {}
    /// A stub was destroyed.
    fn on_stub_deletion(&self, zone_id: ZoneId, object_id: ObjectId) {}
    /// A stub dispatched a method call.
    fn on_stub_send(
        &self,
        zone_id: ZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
    ) {
    }
    /// A stub's count went up.
    fn on_stub_add_ref(&self, zone_id: ZoneId, object_id: ObjectId, count: u64) {}
    /// A stub's count went down.
    fn on_stub_release(&self, zone_id: ZoneId, object_id: ObjectId, count: u64) {}

    /// An object proxy was created.
    fn on_object_proxy_creation(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
    ) {
    }
    /// An object proxy was destroyed.
    fn on_object_proxy_deletion(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
    ) {
    }

    /// An interface proxy was created.
    fn on_interface_proxy_creation(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) {
    }
    /// An interface proxy was destroyed.
    fn on_interface_proxy_deletion(
        &self,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) {
    }
    /// An interface proxy sent a method call.
    fn on_interface_proxy_send(
        &self,
        method_name: &str,
        zone_id: ZoneId,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
    ) {
    }

    /// An implementation instance was registered with the fabric.
    fn on_impl_creation(&self, name: &str, address: u64, zone_id: ZoneId) {}
    /// An implementation instance was dropped by the fabric.
    fn on_impl_deletion(&self, address: u64, zone_id: ZoneId) {}

    /// Free-form structured message.
    fn message(&self, level: log::Level, message: &str) {}
}
