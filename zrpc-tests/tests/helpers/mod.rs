// This module contains helper functions and types that are not tests in
// themselves, but are used by several tests.

#![allow(dead_code)]

pub mod interfaces;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zrpc::local::{connect_child_zone, export_object, import_object, ChildZone};
use zrpc::service::Service;
use zrpc::telemetry::Telemetry;
use zrpc::types::{DestinationZoneId, ObjectId, ZoneId};

use self::interfaces::{register_interfaces, ObjectStore, ObjectStoreDecl, StoreImpl};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Telemetry sink counting lifecycle events, so scenarios can assert that
/// everything created was also torn down.
#[derive(Default)]
pub struct CountingTelemetry {
    pub stubs_created: AtomicUsize,
    pub stubs_deleted: AtomicUsize,
    pub object_proxies_created: AtomicUsize,
    pub object_proxies_deleted: AtomicUsize,
    pub service_proxies_created: AtomicUsize,
    pub service_proxies_deleted: AtomicUsize,
}

impl CountingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn assert_balanced(&self) {
        assert_eq!(
            self.stubs_created.load(Ordering::SeqCst),
            self.stubs_deleted.load(Ordering::SeqCst),
            "leaked object stubs"
        );
        assert_eq!(
            self.object_proxies_created.load(Ordering::SeqCst),
            self.object_proxies_deleted.load(Ordering::SeqCst),
            "leaked object proxies"
        );
        assert_eq!(
            self.service_proxies_created.load(Ordering::SeqCst),
            self.service_proxies_deleted.load(Ordering::SeqCst),
            "leaked service proxies"
        );
    }
}

impl Telemetry for CountingTelemetry {
    fn on_stub_creation(&self, _zone_id: ZoneId, _object_id: ObjectId) {
        self.stubs_created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stub_deletion(&self, _zone_id: ZoneId, _object_id: ObjectId) {
        self.stubs_deleted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_object_proxy_creation(
        &self,
        _zone_id: ZoneId,
        _destination_zone_id: DestinationZoneId,
        _object_id: ObjectId,
    ) {
        self.object_proxies_created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_object_proxy_deletion(
        &self,
        _zone_id: ZoneId,
        _destination_zone_id: DestinationZoneId,
        _object_id: ObjectId,
    ) {
        self.object_proxies_deleted.fetch_add(1, Ordering::SeqCst);
    }

    fn on_service_proxy_creation(
        &self,
        _name: &str,
        _zone_id: ZoneId,
        _destination_zone_id: DestinationZoneId,
        _caller_zone_id: zrpc::types::CallerZoneId,
    ) {
        self.service_proxies_created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_service_proxy_deletion(
        &self,
        _zone_id: ZoneId,
        _destination_zone_id: DestinationZoneId,
        _caller_zone_id: zrpc::types::CallerZoneId,
    ) {
        self.service_proxies_deleted.fetch_add(1, Ordering::SeqCst);
    }
}

/// Spawn a child zone publishing `obj` as its root object and import it on
/// the parent side.
pub fn spawn_child_with_root<D: zrpc::interface::InterfaceDecl>(
    parent: &Arc<Service>,
    name: &str,
    obj: &D::Obj,
) -> (ChildZone, D::Obj) {
    let zone = connect_child_zone(parent, name, parent.telemetry()).unwrap();
    register_interfaces(zone.service());
    let descriptor =
        export_object::<D>(zone.service(), parent.zone_id().as_caller(), obj).unwrap();
    let root = import_object::<D>(zone.proxy(), descriptor).unwrap().unwrap();
    (zone, root)
}

/// A child zone with an object store as its root.
///
/// Field order matters: the parent-side store proxy drops first, the
/// store's implementation next, the zone last.
pub struct StoreZone {
    pub store: Arc<dyn ObjectStore>,
    pub store_impl: Arc<StoreImpl>,
    pub zone: ChildZone,
}

impl StoreZone {
    pub fn service(&self) -> &Arc<Service> {
        self.zone.service()
    }
}

/// Spawn a child zone whose root object is an empty [`StoreImpl`].
pub fn spawn_store_child(parent: &Arc<Service>, name: &str) -> StoreZone {
    let store_impl = Arc::new(StoreImpl::default());
    let as_store: Arc<dyn ObjectStore> = store_impl.clone();
    let (zone, store) = spawn_child_with_root::<ObjectStoreDecl>(parent, name, &as_store);
    StoreZone { store, store_impl, zone }
}
