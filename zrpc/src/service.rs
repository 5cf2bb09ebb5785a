//! The per-zone hub: stub tables, the outbound route map, and the routing
//! decision trees for `send`, `try_cast`, `add_ref` and `release`.
//!
//! The service owns nothing strongly: its stub maps and route map hold weak
//! references, with the canonical strong reference living on the holder (a
//! stub's own count, a proxy's lifetime lock or application handles). Two
//! locks guard the state, `stub_control` for the stub maps and
//! `zone_control` for the route map, and no operation ever holds two of the
//! fabric's locks at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::ErrorCode;
use crate::interface::{
    raw_address, Castable, InterfaceDecl, InterfaceStub, InterfaceStubFactory, ProxyBase,
};
use crate::protocol::{AddRefOptions, CallRequest, RefRequest};
use crate::proxy::ServiceProxy;
use crate::stub::ObjectStub;
use crate::telemetry::Telemetry;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId,
    InterfaceDescriptor, InterfaceOrdinal, ObjectId, ZoneId, ZoneRoute,
};
use crate::version;

static ZONE_ID_GENERATOR: AtomicU64 = AtomicU64::new(0);

struct StubTables {
    stubs: HashMap<ObjectId, Weak<ObjectStub>>,
    wrapped_object_to_stub: HashMap<usize, Weak<ObjectStub>>,
}

type RouteMap = BTreeMap<ZoneRoute, Weak<ServiceProxy>>;

/// The per-zone hub.
pub struct Service {
    name: String,
    zone_id: ZoneId,
    object_id_generator: AtomicU64,
    stub_control: Mutex<StubTables>,
    zone_control: Mutex<RouteMap>,
    stub_factories: Mutex<HashMap<InterfaceOrdinal, InterfaceStubFactory>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    parent: Mutex<Option<Arc<ServiceProxy>>>,
    weak_self: Weak<Service>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("zone_id", &self.zone_id)
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Allocate a fresh process-wide zone id.
    pub fn generate_zone_id() -> ZoneId {
        ZoneId::new(ZONE_ID_GENERATOR.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Create the hub of a root zone.
    pub fn new(name: &str, zone_id: ZoneId) -> Arc<Self> {
        Self::build(name, zone_id, None, true)
    }

    /// Create the hub of a root zone with a telemetry sink attached.
    pub fn new_with_telemetry(
        name: &str,
        zone_id: ZoneId,
        telemetry: Arc<dyn Telemetry>,
    ) -> Arc<Self> {
        Self::build(name, zone_id, Some(telemetry), true)
    }

    /// Create the hub of a child zone. The caller wires the parent channel
    /// with [`Service::set_parent_proxy`] before first use.
    pub fn new_child(
        name: &str,
        zone_id: ZoneId,
        telemetry: Option<Arc<dyn Telemetry>>,
    ) -> Arc<Self> {
        Self::build(name, zone_id, telemetry, false)
    }

    fn build(
        name: &str,
        zone_id: ZoneId,
        telemetry: Option<Arc<dyn Telemetry>>,
        announce: bool,
    ) -> Arc<Self> {
        let service = Arc::new_cyclic(|weak_self| Self {
            name: name.to_owned(),
            zone_id,
            object_id_generator: AtomicU64::new(0),
            stub_control: Mutex::new(StubTables {
                stubs: HashMap::new(),
                wrapped_object_to_stub: HashMap::new(),
            }),
            zone_control: Mutex::new(BTreeMap::new()),
            stub_factories: Mutex::new(HashMap::new()),
            telemetry,
            parent: Mutex::new(None),
            weak_self: weak_self.clone(),
        });
        if announce {
            if let Some(telemetry) = &service.telemetry {
                telemetry.on_service_creation(name, zone_id);
            }
        }
        service
    }

    /// The zone this service runs.
    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    /// The service's name, for telemetry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The attached telemetry sink, if any.
    pub fn telemetry(&self) -> Option<Arc<dyn Telemetry>> {
        self.telemetry.clone()
    }

    /// Allocate an object id for a new stub.
    pub fn generate_new_object_id(&self) -> ObjectId {
        ObjectId::new(self.object_id_generator.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // ------------------------------------------------------------------
    // parent wiring

    /// Attach the channel to the parent zone. The proxy is held strongly
    /// and flagged as the parent channel so the parent zone outlives this
    /// one; it is released when the service drops.
    pub fn set_parent_proxy(&self, proxy: &Arc<ServiceProxy>) -> Result<(), ErrorCode> {
        let mut parent = self.parent.lock().unwrap();
        if parent.is_some() {
            log::error!("zone {} already has a parent channel", self.zone_id);
            return Err(ErrorCode::InvalidData);
        }
        proxy.set_parent_channel(true);
        *parent = Some(proxy.clone());
        Ok(())
    }

    /// The channel to the parent zone, if this is a child service.
    pub fn parent_proxy(&self) -> Option<Arc<ServiceProxy>> {
        self.parent.lock().unwrap().clone()
    }

    /// The parent zone, if any.
    pub fn parent_zone_id(&self) -> Option<DestinationZoneId> {
        self.parent.lock().unwrap().as_ref().map(|proxy| proxy.destination_zone_id())
    }

    // ------------------------------------------------------------------
    // stub tables

    fn lookup_stub(&self, object_id: ObjectId) -> Option<Arc<ObjectStub>> {
        let weak = self.stub_control.lock().unwrap().stubs.get(&object_id).cloned();
        weak.and_then(|weak| weak.upgrade())
    }

    /// The stub for a local object, if alive.
    pub fn get_object_stub(&self, object_id: ObjectId) -> Option<Arc<ObjectStub>> {
        self.lookup_stub(object_id)
    }

    /// The cross-zone reference count of a local stub.
    pub fn stub_reference_count(&self, object_id: ObjectId) -> Option<u64> {
        self.lookup_stub(object_id).map(|stub| stub.reference_count())
    }

    /// The number of live stubs in this zone.
    pub fn live_stub_count(&self) -> usize {
        self.stub_control
            .lock()
            .unwrap()
            .stubs
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Resolve a local object to a typed handle via its stub.
    pub fn get_local_interface<D: InterfaceDecl>(
        &self,
        _protocol_version: u64,
        object_id: ObjectId,
    ) -> Option<D::Obj> {
        let stub = self.lookup_stub(object_id)?;
        let castable = stub.castable()?;
        D::from_castable(&castable)
    }

    /// The implementation behind `(object, interface)`, erased.
    pub fn get_castable_interface(
        &self,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Option<Arc<dyn Castable>> {
        let stub = self.lookup_stub(object_id)?;
        let interface_stub = stub.get_interface(interface_id)?;
        Some(interface_stub.castable())
    }

    /// Drop one local count on a stub, unhooking and resetting it when the
    /// count reaches zero. Returns the post-operation count.
    pub(crate) fn release_local_stub(&self, stub: &Arc<ObjectStub>) -> u64 {
        let count = stub.release();
        if count == 0 {
            self.unhook_stub(stub);
            stub.reset();
        }
        count
    }

    fn unhook_stub(&self, stub: &Arc<ObjectStub>) {
        let mut tables = self.stub_control.lock().unwrap();
        tables.stubs.remove(&stub.id());
        match stub.address() {
            Some(address) => {
                tables.wrapped_object_to_stub.remove(&address);
            }
            None => {
                log::error!("stub {} has no wrapped address at teardown", stub.id());
            }
        }
    }

    // ------------------------------------------------------------------
    // interface stub factories

    /// Register the factory for one generated interface. Registration
    /// happens during zone setup, before concurrent use.
    pub fn register_interface_factory(
        &self,
        interface_id: InterfaceOrdinal,
        factory: InterfaceStubFactory,
    ) -> Result<(), ErrorCode> {
        let mut factories = self.stub_factories.lock().unwrap();
        if factories.contains_key(&interface_id) {
            log::error!("interface factory {} registered twice", interface_id);
            return Err(ErrorCode::InvalidData);
        }
        factories.insert(interface_id, factory);
        Ok(())
    }

    /// Ask the factory table to wrap `target` for `interface_id`.
    pub(crate) fn create_interface_stub(
        &self,
        interface_id: InterfaceOrdinal,
        target: &Arc<dyn Castable>,
    ) -> Result<Arc<dyn InterfaceStub>, ErrorCode> {
        let factory = self.stub_factories.lock().unwrap().get(&interface_id).cloned();
        let factory = match factory {
            Some(factory) => factory,
            None => {
                // not an error in the fabric: the interface is simply not
                // one this zone dispatches
                log::info!("no stub factory for interface {}", interface_id);
                return Err(ErrorCode::InvalidCast);
            }
        };
        let this = self.weak_self.upgrade().ok_or(ErrorCode::ZoneNotInitialised)?;
        factory(target, &this).ok_or(ErrorCode::InvalidCast)
    }

    // ------------------------------------------------------------------
    // route map

    /// Whether any outbound channel is currently registered.
    pub fn has_service_proxies(&self) -> bool {
        !self.zone_control.lock().unwrap().is_empty()
    }

    /// The number of registered outbound routes.
    pub fn route_count(&self) -> usize {
        self.zone_control.lock().unwrap().values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Whether a live channel `(destination, caller)` is registered.
    pub fn has_route(&self, destination: DestinationZoneId, caller: CallerZoneId) -> bool {
        self.zone_control
            .lock()
            .unwrap()
            .get(&ZoneRoute::new(destination, caller))
            .map(|weak| weak.strong_count() > 0)
            .unwrap_or(false)
    }

    /// Register an outbound channel and pin it with one external reference.
    pub fn add_zone_proxy(&self, proxy: &Arc<ServiceProxy>) {
        debug_assert!(proxy.destination_zone_id() != self.zone_id.as_destination());
        proxy.add_external_ref();
        let mut routes = self.zone_control.lock().unwrap();
        let key = ZoneRoute::new(proxy.destination_zone_id(), proxy.caller_zone_id());
        debug_assert!(
            routes.get(&key).map(|weak| weak.strong_count() == 0).unwrap_or(true),
            "route {:?} registered twice",
            key
        );
        routes.insert(key, Arc::downgrade(proxy));
        log::debug!(
            "add_zone_proxy service zone: {} destination_zone={}, caller_zone={}",
            self.zone_id,
            proxy.destination_zone_id(),
            proxy.caller_zone_id()
        );
    }

    /// Deregister a channel whose proxy has died. A live sibling that took
    /// over the key meanwhile is left alone.
    pub(crate) fn remove_zone_proxy(
        &self,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
    ) {
        let mut routes = self.zone_control.lock().unwrap();
        let key = ZoneRoute::new(destination_zone_id, caller_zone_id);
        let dead = routes.get(&key).map(|weak| weak.strong_count() == 0).unwrap_or(false);
        if dead {
            routes.remove(&key);
        }
    }

    /// Find or construct the channel `(destination, new_caller)`, cloning
    /// from the destination's neighbourhood, the caller channel, or the
    /// caller, in that order. `new_proxy_added` reports whether a channel
    /// was installed (and thereby pinned) by this call.
    pub fn get_zone_proxy(
        &self,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        destination_zone_id: DestinationZoneId,
        new_caller_zone_id: CallerZoneId,
        new_proxy_added: &mut bool,
    ) -> Option<Arc<ServiceProxy>> {
        *new_proxy_added = false;
        let proxy;
        {
            let mut routes = self.zone_control.lock().unwrap();
            if let Some(existing) = find_exact(&routes, destination_zone_id, new_caller_zone_id) {
                return Some(existing);
            }
            let mut item = find_first_alive_to(&routes, destination_zone_id);
            if item.is_none() && caller_channel_zone_id.is_set() {
                item = find_first_alive_to(&routes, caller_channel_zone_id.as_destination());
                if item.is_none() {
                    // the caller channel should always be reachable when set
                    log::error!(
                        "zone {}: caller channel {} has no route",
                        self.zone_id,
                        caller_channel_zone_id
                    );
                    return None;
                }
            }
            if item.is_none() && caller_zone_id.is_set() {
                item = find_first_alive_to(&routes, caller_zone_id.as_destination());
                if item.is_none() {
                    log::error!(
                        "zone {}: caller {} has no route",
                        self.zone_id,
                        caller_zone_id
                    );
                    return None;
                }
            }
            let calling_proxy = item?;
            proxy = calling_proxy.clone_for_zone(destination_zone_id, new_caller_zone_id);
            routes.insert(
                ZoneRoute::new(destination_zone_id, new_caller_zone_id),
                Arc::downgrade(&proxy),
            );
        }
        proxy.add_external_ref();
        *new_proxy_added = true;
        Some(proxy)
    }

    /// Balance the external reference taken for the duration of a routed
    /// operation, and drop the route once nothing pins it any more.
    pub(crate) fn cleanup_service_proxy(&self, other_zone: &Arc<ServiceProxy>) {
        if other_zone.release_external_ref() != 0 {
            return;
        }
        log::debug!(
            "cleaning up unused routing service proxy destination_zone={}, caller_zone={}",
            other_zone.destination_zone_id(),
            other_zone.caller_zone_id()
        );
        // routing proxies never host object proxies
        debug_assert_eq!(other_zone.proxy_count(), 0);
        let key = ZoneRoute::new(other_zone.destination_zone_id(), other_zone.caller_zone_id());
        let registered;
        {
            let mut routes = self.zone_control.lock().unwrap();
            match routes.get(&key).cloned() {
                Some(weak) => {
                    registered = weak.upgrade();
                    match &registered {
                        Some(current) => {
                            debug_assert!(Arc::ptr_eq(current, other_zone));
                            if current.is_unused() {
                                routes.remove(&key);
                            }
                        }
                        None => {
                            routes.remove(&key);
                        }
                    }
                }
                None => {
                    registered = None;
                    log::error!(
                        "dying service proxy not found destination_zone={}, caller_zone={}",
                        other_zone.destination_zone_id(),
                        other_zone.caller_zone_id()
                    );
                }
            }
        }
        drop(registered);
    }

    // ------------------------------------------------------------------
    // send

    /// Route a method call: dispatch locally when this zone is the
    /// destination, otherwise forward through the `(destination, caller)`
    /// channel while pinning an opposite-direction channel so objects
    /// returned along this path have a route home.
    pub fn send(&self, mut request: CallRequest) -> Result<Vec<u8>, ErrorCode> {
        if request.destination_zone_id != self.zone_id.as_destination() {
            let other_zone;
            let opposite;
            {
                let mut routes = self.zone_control.lock().unwrap();
                other_zone = match find_exact(
                    &routes,
                    request.destination_zone_id,
                    request.caller_zone_id,
                ) {
                    Some(proxy) => proxy,
                    None => {
                        log::error!(
                            "send: no route zone: {} destination_zone={}, caller_zone={}",
                            self.zone_id,
                            request.destination_zone_id,
                            request.caller_zone_id
                        );
                        return Err(ErrorCode::ZoneNotFound);
                    }
                };

                // a cousin branch of the graph may later return objects
                // back through this zone; hold a channel in the reverse
                // direction so such an object's route can be pinned
                let reverse_destination = request.caller_zone_id.as_destination();
                let reverse_caller = request.destination_zone_id.as_caller();
                let reverse_key = ZoneRoute::new(reverse_destination, reverse_caller);
                let reverse_entry = routes.get(&reverse_key).cloned();
                opposite = if let Some(weak) = reverse_entry {
                    match weak.upgrade() {
                        Some(proxy) => proxy,
                        None => {
                            log::error!(
                                "opposite direction proxy is dead zone: {} destination_zone={}, caller_zone={}",
                                self.zone_id,
                                reverse_destination,
                                reverse_caller
                            );
                            return Err(ErrorCode::ZoneNotFound);
                        }
                    }
                } else if let Some(neighbour) = find_first_alive_from(
                    &routes,
                    request.caller_channel_zone_id.as_destination(),
                ) {
                    let clone = neighbour.clone_for_zone(reverse_destination, reverse_caller);
                    routes.insert(reverse_key, Arc::downgrade(&clone));
                    clone
                } else {
                    log::error!(
                        "reverse direction proxy not possible: {} destination_zone={}, caller_zone={}",
                        self.zone_id,
                        request.destination_zone_id,
                        request.caller_zone_id
                    );
                    return Err(ErrorCode::ZoneNotFound);
                };
            }
            opposite.add_external_ref();

            request.caller_channel_zone_id = self.zone_id.as_caller_channel();
            let result = other_zone.forward_send(request);

            self.cleanup_service_proxy(&opposite);
            result
        } else {
            if !version::is_supported(request.protocol_version) {
                log::error!("unsupported service version {} in send", request.protocol_version);
                return Err(ErrorCode::InvalidVersion);
            }
            let stub = match self.lookup_stub(request.object_id) {
                Some(stub) => stub,
                None => {
                    log::error!("send: object {} has no stub", request.object_id);
                    return Err(ErrorCode::InvalidData);
                }
            };
            stub.call(
                request.protocol_version,
                request.encoding,
                request.caller_channel_zone_id,
                request.caller_zone_id,
                request.interface_id,
                request.method_id,
                &request.payload,
            )
        }
    }

    // ------------------------------------------------------------------
    // try_cast

    /// Route a cast query. The body is an O(1) factory-table probe at the
    /// object's home; no reference count changes anywhere.
    pub fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Result<(), ErrorCode> {
        if destination_zone_id != self.zone_id.as_destination() {
            let other_zone = {
                let routes = self.zone_control.lock().unwrap();
                find_first_alive_to(&routes, destination_zone_id)
            };
            let other_zone = match other_zone {
                Some(proxy) => proxy,
                None => {
                    log::error!("try_cast: no route to zone {}", destination_zone_id);
                    return Err(ErrorCode::ZoneNotFound);
                }
            };
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_try_cast(
                    self.zone_id,
                    destination_zone_id,
                    CallerZoneId::new(0),
                    object_id,
                    interface_id,
                );
            }
            other_zone.add_external_ref();
            let result = other_zone.forward_try_cast(
                protocol_version,
                destination_zone_id,
                object_id,
                interface_id,
            );
            other_zone.release_external_ref();
            result
        } else {
            if !version::is_supported(protocol_version) {
                log::error!("unsupported service version {} in try_cast", protocol_version);
                return Err(ErrorCode::InvalidVersion);
            }
            let stub = match self.lookup_stub(object_id) {
                Some(stub) => stub,
                None => {
                    log::error!("try_cast: object {} has no stub", object_id);
                    return Err(ErrorCode::InvalidData);
                }
            };
            stub.try_cast(interface_id)
        }
    }

    // ------------------------------------------------------------------
    // add_ref

    /// Route a reference-count increment, wiring channels along the way as
    /// directed by the build options. Returns the post-operation count at
    /// the object's home, or zero when this call only built channels.
    pub fn add_ref(&self, request: RefRequest) -> Result<u64, ErrorCode> {
        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_add_ref(
                self.zone_id,
                request.destination_channel_zone_id,
                request.destination_zone_id,
                request.object_id,
                request.caller_channel_zone_id,
                request.caller_zone_id,
                request.build_options,
            );
        }

        let mut dest_channel = request.destination_zone_id.id();
        if request.destination_channel_zone_id.is_set()
            && request.destination_channel_zone_id != self.zone_id.as_destination_channel()
        {
            dest_channel = request.destination_channel_zone_id.id();
        }
        let caller_channel = if request.caller_channel_zone_id.is_set() {
            request.caller_channel_zone_id.id()
        } else {
            request.caller_zone_id.id()
        };

        if request.destination_zone_id != self.zone_id.as_destination() {
            // this zone is a bridge
            let build_channel = request.build_options.builds_channel();

            if dest_channel == caller_channel && build_channel {
                // caller and destination both lie beyond the same channel;
                // pass the buck to the zone that knows whether the route
                // splits or terminates. No count changes here.
                let destination = {
                    let routes = self.zone_control.lock().unwrap();
                    find_first_alive_to(&routes, DestinationZoneId::new(dest_channel))
                };
                let destination = match destination {
                    Some(proxy) => proxy,
                    None => {
                        log::error!(
                            "unable to find destination channel to build a channel with - current_zone: {}, requester: {}, caller: {}, sender: {}",
                            self.zone_id,
                            request.known_direction_zone_id,
                            request.caller_zone_id,
                            request.destination_zone_id
                        );
                        return Err(ErrorCode::ObjectNotFound);
                    }
                };
                if let Some(telemetry) = &self.telemetry {
                    telemetry.on_service_proxy_add_ref(
                        self.zone_id,
                        request.destination_zone_id,
                        DestinationChannelZoneId::default(),
                        request.caller_zone_id,
                        request.object_id,
                        request.build_options,
                    );
                }
                destination.forward_add_ref(RefRequest {
                    destination_channel_zone_id: DestinationChannelZoneId::default(),
                    caller_channel_zone_id: CallerChannelZoneId::default(),
                    ..request
                })
            } else if build_channel {
                self.add_ref_fork(request, dest_channel, caller_channel)
            } else {
                // plain forward of an already-wired reference
                let other_zone;
                {
                    let mut routes = self.zone_control.lock().unwrap();
                    other_zone = match find_exact(
                        &routes,
                        request.destination_zone_id,
                        request.caller_zone_id,
                    ) {
                        Some(proxy) => proxy,
                        None => {
                            let tmp = find_first_alive_to(&routes, request.destination_zone_id)
                                .or_else(|| {
                                    // the hint names the path the object was
                                    // last seen on; without it this lookup
                                    // cannot terminate in Y topologies
                                    find_first_alive_from(
                                        &routes,
                                        request.known_direction_zone_id.as_destination(),
                                    )
                                });
                            let tmp = match tmp {
                                Some(proxy) => proxy,
                                None => {
                                    log::error!(
                                        "add_ref: no route zone: {} destination_zone={}, caller_zone={}",
                                        self.zone_id,
                                        request.destination_zone_id,
                                        request.caller_zone_id
                                    );
                                    return Err(ErrorCode::ObjectNotFound);
                                }
                            };
                            let clone = tmp.clone_for_zone(
                                request.destination_zone_id,
                                request.caller_zone_id,
                            );
                            routes.insert(
                                ZoneRoute::new(
                                    request.destination_zone_id,
                                    request.caller_zone_id,
                                ),
                                Arc::downgrade(&clone),
                            );
                            clone
                        }
                    };
                }
                other_zone.add_external_ref();
                if let Some(telemetry) = &self.telemetry {
                    telemetry.on_service_proxy_add_ref(
                        self.zone_id,
                        request.destination_zone_id,
                        DestinationChannelZoneId::default(),
                        request.caller_zone_id,
                        request.object_id,
                        request.build_options,
                    );
                }
                other_zone.forward_add_ref(RefRequest {
                    destination_channel_zone_id: DestinationChannelZoneId::default(),
                    ..request
                })
            }
        } else {
            // this zone is the home
            if !version::is_supported(request.protocol_version) {
                log::error!("unsupported service version {} in add_ref", request.protocol_version);
                return Err(ErrorCode::InvalidVersion);
            }

            if self.zone_id.as_caller() != request.caller_zone_id
                && request.build_options.contains(AddRefOptions::BUILD_CALLER_ROUTE)
            {
                // install the back-pointer so this zone can later return
                // objects to the caller
                let caller_proxy = {
                    let routes = self.zone_control.lock().unwrap();
                    find_first_alive_to(&routes, request.caller_zone_id.as_destination())
                };
                let caller_proxy = match caller_proxy {
                    Some(proxy) => proxy,
                    None => {
                        log::error!(
                            "unable to build caller route zone: {} caller_zone={}",
                            self.zone_id,
                            request.caller_zone_id
                        );
                        return Err(ErrorCode::ObjectNotFound);
                    }
                };
                if let Some(telemetry) = &self.telemetry {
                    telemetry.on_service_proxy_add_ref(
                        self.zone_id,
                        request.destination_zone_id,
                        DestinationChannelZoneId::default(),
                        request.caller_zone_id,
                        request.object_id,
                        AddRefOptions::BUILD_CALLER_ROUTE,
                    );
                }
                let _ = caller_proxy.forward_add_ref(RefRequest {
                    destination_channel_zone_id: DestinationChannelZoneId::default(),
                    caller_channel_zone_id: CallerChannelZoneId::default(),
                    build_options: AddRefOptions::BUILD_CALLER_ROUTE,
                    ..request
                });
            }

            if request.object_id == ObjectId::DUMMY {
                // a pure channel-build ping
                return Ok(0);
            }

            let stub = match self.lookup_stub(request.object_id) {
                Some(stub) => stub,
                None => {
                    log::error!("add_ref: object {} has no stub", request.object_id);
                    return Err(ErrorCode::ObjectNotFound);
                }
            };
            Ok(stub.add_ref())
        }
    }

    /// The fork engine: this zone must send the destination and caller
    /// sides of a reference to different channels.
    fn add_ref_fork(
        &self,
        request: RefRequest,
        dest_channel: u64,
        caller_channel: u64,
    ) -> Result<u64, ErrorCode> {
        let mut options = request.build_options;
        let destination;
        let mut caller = None;
        {
            let mut routes = self.zone_control.lock().unwrap();
            destination = match find_exact(
                &routes,
                request.destination_zone_id,
                request.caller_zone_id,
            ) {
                Some(proxy) => proxy,
                None => {
                    let tmp = match find_first_alive_to(
                        &routes,
                        DestinationZoneId::new(dest_channel),
                    ) {
                        Some(proxy) => proxy,
                        None => {
                            // the requester holds a positive count through
                            // this zone, so the channel must exist
                            log::error!(
                                "fork: no destination channel zone: {} dest_channel={}",
                                self.zone_id,
                                dest_channel
                            );
                            return Err(ErrorCode::ZoneNotFound);
                        }
                    };
                    let clone = tmp
                        .clone_for_zone(request.destination_zone_id, request.caller_zone_id);
                    routes.insert(
                        ZoneRoute::new(request.destination_zone_id, request.caller_zone_id),
                        Arc::downgrade(&clone),
                    );
                    clone
                }
            };

            if request.caller_zone_id == self.zone_id.as_caller() {
                // the caller is this zone, nothing to wire on that side
                options.remove(AddRefOptions::BUILD_CALLER_ROUTE);
            } else {
                caller = match find_first_alive_to(
                    &routes,
                    DestinationZoneId::new(caller_channel),
                ) {
                    Some(proxy) => Some(proxy),
                    None => {
                        log::error!(
                            "fork: no caller channel zone: {} caller_channel={}",
                            self.zone_id,
                            caller_channel
                        );
                        return Err(ErrorCode::ZoneNotFound);
                    }
                };
            }
        }
        destination.add_external_ref();

        if let Some(caller_proxy) = &caller {
            if options
                == AddRefOptions::BUILD_CALLER_ROUTE | AddRefOptions::BUILD_DESTINATION_ROUTE
            {
                // if both legs leave through the same channel zone the fork
                // rejoins one hop ahead; forward a single combined request
                // or the reference would be double counted
                let destination_channel = if destination.destination_channel_zone_id().is_set() {
                    destination.destination_channel_zone_id().id()
                } else {
                    destination.destination_zone_id().id()
                };
                let caller_side_channel = if caller_proxy.destination_channel_zone_id().is_set() {
                    caller_proxy.destination_channel_zone_id().id()
                } else {
                    caller_proxy.destination_zone_id().id()
                };
                if destination_channel == caller_side_channel {
                    if let Some(telemetry) = &self.telemetry {
                        telemetry.on_service_proxy_add_ref(
                            self.zone_id,
                            request.destination_zone_id,
                            DestinationChannelZoneId::default(),
                            request.caller_zone_id,
                            request.object_id,
                            options,
                        );
                    }
                    let result = destination.forward_add_ref(RefRequest {
                        destination_channel_zone_id: DestinationChannelZoneId::default(),
                        caller_channel_zone_id: CallerChannelZoneId::default(),
                        build_options: options,
                        ..request
                    });
                    destination.release_external_ref();
                    return result;
                }
            }
        }

        if options.contains(AddRefOptions::BUILD_DESTINATION_ROUTE) {
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_proxy_add_ref(
                    self.zone_id,
                    request.destination_zone_id,
                    DestinationChannelZoneId::default(),
                    request.caller_zone_id,
                    request.object_id,
                    AddRefOptions::BUILD_DESTINATION_ROUTE,
                );
            }
            let result = destination.forward_add_ref(RefRequest {
                destination_channel_zone_id: DestinationChannelZoneId::default(),
                caller_channel_zone_id: self.zone_id.as_caller_channel(),
                build_options: AddRefOptions::BUILD_DESTINATION_ROUTE,
                ..request
            });
            if let Err(e) = result {
                log::error!("destination leg of fork failed: {}", e);
            }
        }
        if options.contains(AddRefOptions::BUILD_CALLER_ROUTE) {
            let caller_proxy = caller.as_ref().expect("caller route bit implies a caller proxy");
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_proxy_add_ref(
                    caller_proxy.zone_id(),
                    request.destination_zone_id,
                    self.zone_id.as_destination_channel(),
                    request.caller_zone_id,
                    request.object_id,
                    AddRefOptions::BUILD_CALLER_ROUTE,
                );
            }
            let _ = caller_proxy.forward_add_ref(RefRequest {
                destination_channel_zone_id: self.zone_id.as_destination_channel(),
                build_options: AddRefOptions::BUILD_CALLER_ROUTE,
                ..request
            });
        }
        Ok(0)
    }

    // ------------------------------------------------------------------
    // release

    /// Route a reference-count decrement. At the home zone a count hitting
    /// zero unhooks the stub and drops the implementation outside all
    /// service locks; at a bridge the matching route pin is balanced via
    /// [`Service::cleanup_service_proxy`].
    pub fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
    ) -> Result<u64, ErrorCode> {
        if destination_zone_id != self.zone_id.as_destination() {
            let other_zone = {
                let routes = self.zone_control.lock().unwrap();
                find_exact(&routes, destination_zone_id, caller_zone_id)
            };
            let other_zone = match other_zone {
                Some(proxy) => proxy,
                None => {
                    log::error!(
                        "release: no route destination_zone={}, caller_zone={}",
                        destination_zone_id,
                        caller_zone_id
                    );
                    return Err(ErrorCode::ZoneNotFound);
                }
            };
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_release(
                    self.zone_id,
                    other_zone.destination_channel_zone_id(),
                    destination_zone_id,
                    object_id,
                    caller_zone_id,
                );
            }
            match other_zone.sp_release(object_id) {
                Ok(count) => {
                    self.cleanup_service_proxy(&other_zone);
                    Ok(count)
                }
                Err(_) => Err(ErrorCode::ObjectNotFound),
            }
        } else {
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_release(
                    self.zone_id,
                    DestinationChannelZoneId::default(),
                    destination_zone_id,
                    object_id,
                    caller_zone_id,
                );
            }
            if !version::is_supported(protocol_version) {
                log::error!("unsupported service version {} in release", protocol_version);
                return Err(ErrorCode::InvalidVersion);
            }
            let stub = match self.lookup_stub(object_id) {
                Some(stub) => stub,
                None => {
                    log::error!("release: object {} has no stub", object_id);
                    return Err(ErrorCode::ObjectNotFound);
                }
            };
            // the count change happens outside the stub tables lock, and
            // the implementation is dropped outside every service lock
            let count = stub.release();
            if count == u64::MAX {
                return Err(ErrorCode::ReferenceCountError);
            }
            if count == 0 {
                self.unhook_stub(&stub);
                stub.reset();
            }
            Ok(count)
        }
    }

    // ------------------------------------------------------------------
    // descriptor construction (bind-helper internals)

    /// Produce the wire descriptor for an interface leaving this zone:
    /// route-wire an existing proxy, or wrap a local implementation in a
    /// stub (creating or reusing it) and take one count on it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn wrap_into_stub_descriptor(
        &self,
        protocol_version: u64,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        iface: &Arc<dyn Castable>,
        make_stub: &dyn Fn(&Arc<Service>) -> Arc<dyn InterfaceStub>,
        outcall: bool,
        stub_out: &mut Option<Arc<ObjectStub>>,
    ) -> Result<InterfaceDescriptor, ErrorCode> {
        if outcall && (caller_channel_zone_id.is_set() || caller_zone_id.is_set()) {
            if let Some(proxy) = iface.as_proxy() {
                return self.prepare_out_param(
                    protocol_version,
                    caller_channel_zone_id,
                    caller_zone_id,
                    proxy,
                );
            }
        }

        let this = self.weak_self.upgrade().ok_or(ErrorCode::ZoneNotInitialised)?;
        let address = raw_address(iface);
        let stub;
        {
            let mut tables = self.stub_control.lock().unwrap();
            let existing =
                tables.wrapped_object_to_stub.get(&address).and_then(|weak| weak.upgrade());
            if let Some(existing) = existing {
                existing.add_ref();
                stub = existing;
            } else {
                let id = self.generate_new_object_id();
                let new_stub = ObjectStub::new(id, &this, iface.clone(), make_stub(&this));
                tables.wrapped_object_to_stub.insert(address, Arc::downgrade(&new_stub));
                tables.stubs.insert(id, Arc::downgrade(&new_stub));
                ObjectStub::on_added_to_zone(&new_stub);
                new_stub.add_ref();
                stub = new_stub;
            }
        }

        if outcall {
            let object_channel = if caller_channel_zone_id.is_set() {
                caller_channel_zone_id.id()
            } else {
                caller_zone_id.id()
            };
            let caller_proxy = {
                let routes = self.zone_control.lock().unwrap();
                routes
                    .get(&ZoneRoute::new(
                        DestinationZoneId::new(object_channel),
                        self.zone_id.as_caller(),
                    ))
                    .and_then(Weak::upgrade)
            };
            let caller_proxy = match caller_proxy {
                Some(proxy) => proxy,
                None => {
                    log::error!(
                        "no channel back toward caller {} in zone {}",
                        object_channel,
                        self.zone_id
                    );
                    return Err(ErrorCode::ZoneNotFound);
                }
            };
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_proxy_add_ref(
                    self.zone_id,
                    self.zone_id.as_destination(),
                    DestinationChannelZoneId::default(),
                    caller_zone_id,
                    stub.id(),
                    AddRefOptions::BUILD_CALLER_ROUTE,
                );
            }
            let _ = caller_proxy.forward_add_ref(RefRequest {
                protocol_version,
                destination_channel_zone_id: DestinationChannelZoneId::default(),
                destination_zone_id: self.zone_id.as_destination(),
                object_id: stub.id(),
                caller_channel_zone_id: CallerChannelZoneId::default(),
                caller_zone_id,
                known_direction_zone_id: self.zone_id.as_known_direction(),
                build_options: AddRefOptions::BUILD_CALLER_ROUTE,
            });
        }

        let descriptor = InterfaceDescriptor::new(stub.id(), self.zone_id.as_destination());
        *stub_out = Some(stub);
        Ok(descriptor)
    }

    /// Produce the descriptor for a proxy leaving this zone as an out
    /// parameter, wiring the destination and caller sides of its route.
    pub(crate) fn prepare_out_param(
        &self,
        protocol_version: u64,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        base: &dyn ProxyBase,
    ) -> Result<InterfaceDescriptor, ErrorCode> {
        let object_proxy = base.object_proxy();
        let object_service_proxy = object_proxy.service_proxy().clone();
        debug_assert_eq!(object_service_proxy.zone_id(), self.zone_id);
        let destination_zone_id = object_service_proxy.destination_zone_id();
        let destination_channel_zone_id = object_service_proxy.destination_channel_zone_id();
        let object_id = object_proxy.object_id();

        debug_assert!(caller_zone_id.is_set());
        debug_assert!(destination_zone_id.is_set());

        let object_channel = if caller_channel_zone_id.is_set() {
            caller_channel_zone_id.id()
        } else {
            caller_zone_id.id()
        };
        let destination_channel = if destination_channel_zone_id.is_set() {
            destination_channel_zone_id.id()
        } else {
            destination_zone_id.id()
        };
        let descriptor = InterfaceDescriptor::new(object_id, destination_zone_id);

        if object_channel == destination_channel {
            // caller and destination are in the same channel; the zone out
            // there forks where necessary. No channel pin is needed here as
            // the reference returns to its source.
            if let Some(telemetry) = &self.telemetry {
                telemetry.on_service_proxy_add_ref(
                    self.zone_id,
                    destination_zone_id,
                    DestinationChannelZoneId::default(),
                    caller_zone_id,
                    object_id,
                    AddRefOptions::BUILD_CALLER_ROUTE | AddRefOptions::BUILD_DESTINATION_ROUTE,
                );
            }
            let result = object_service_proxy.forward_add_ref(RefRequest {
                protocol_version,
                destination_channel_zone_id: DestinationChannelZoneId::default(),
                destination_zone_id,
                object_id,
                caller_channel_zone_id: CallerChannelZoneId::default(),
                caller_zone_id,
                known_direction_zone_id: self.zone_id.as_known_direction(),
                build_options: AddRefOptions::BUILD_CALLER_ROUTE
                    | AddRefOptions::BUILD_DESTINATION_ROUTE,
            });
            if let Err(e) = result {
                log::error!("combined route build failed: {}", e);
                return Err(e);
            }
            return Ok(descriptor);
        }

        let destination_proxy;
        let caller_proxy;
        {
            let mut routes = self.zone_control.lock().unwrap();
            destination_proxy = match find_exact(&routes, destination_zone_id, caller_zone_id) {
                Some(proxy) => proxy,
                None => {
                    let clone =
                        object_service_proxy.clone_for_zone(destination_zone_id, caller_zone_id);
                    routes.insert(
                        ZoneRoute::new(destination_zone_id, caller_zone_id),
                        Arc::downgrade(&clone),
                    );
                    clone
                }
            };

            let caller_key = ZoneRoute::new(
                DestinationZoneId::new(object_channel),
                self.zone_id.as_caller(),
            );
            let caller_entry = routes.get(&caller_key).and_then(|weak| weak.upgrade());
            caller_proxy = match caller_entry {
                Some(proxy) => proxy,
                None => {
                    // the object channel is known even though no exact
                    // route exists; reach the caller through any channel
                    // leading toward its zone
                    debug_assert!(
                        object_channel == caller_channel_zone_id.id()
                            && object_channel != caller_zone_id.id()
                    );
                    let alternative =
                        find_first_alive_to(&routes, caller_zone_id.as_destination());
                    let alternative = match alternative {
                        Some(proxy) => proxy,
                        None => {
                            log::error!(
                                "alternative route to caller zone {} is not found",
                                caller_zone_id
                            );
                            return Err(ErrorCode::ZoneNotFound);
                        }
                    };
                    let clone = alternative.clone_for_zone(
                        DestinationZoneId::new(object_channel),
                        self.zone_id.as_caller(),
                    );
                    routes.insert(caller_key, Arc::downgrade(&clone));
                    log::debug!(
                        "prepare_out_param service zone: {} destination_zone={}, caller_zone={}",
                        self.zone_id,
                        clone.destination_zone_id(),
                        clone.caller_zone_id()
                    );
                    clone
                }
            };
        }
        destination_proxy.add_external_ref();

        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_proxy_add_ref(
                self.zone_id,
                destination_zone_id,
                DestinationChannelZoneId::default(),
                caller_zone_id,
                object_id,
                AddRefOptions::BUILD_DESTINATION_ROUTE,
            );
        }
        let result = destination_proxy.forward_add_ref(RefRequest {
            protocol_version,
            destination_channel_zone_id: DestinationChannelZoneId::default(),
            destination_zone_id,
            object_id,
            caller_channel_zone_id: self.zone_id.as_caller_channel(),
            caller_zone_id,
            known_direction_zone_id: self.zone_id.as_known_direction(),
            build_options: AddRefOptions::BUILD_DESTINATION_ROUTE,
        });
        if let Err(e) = result {
            log::error!("destination route build failed: {}", e);
        }

        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_proxy_add_ref(
                self.zone_id,
                destination_zone_id,
                self.zone_id.as_destination_channel(),
                caller_zone_id,
                object_id,
                AddRefOptions::BUILD_CALLER_ROUTE,
            );
        }
        let result = caller_proxy.forward_add_ref(RefRequest {
            protocol_version,
            destination_channel_zone_id: self.zone_id.as_destination_channel(),
            destination_zone_id,
            object_id,
            caller_channel_zone_id: CallerChannelZoneId::default(),
            caller_zone_id,
            known_direction_zone_id: self.zone_id.as_known_direction(),
            build_options: AddRefOptions::BUILD_CALLER_ROUTE,
        });
        if let Err(e) = result {
            log::error!("caller route build failed: {}", e);
        }

        Ok(descriptor)
    }

    // ------------------------------------------------------------------
    // shutdown

    /// Report every stub, wrapped object and route still registered.
    /// Returns true when the service is clean.
    pub fn check_is_empty(&self) -> bool {
        let mut success = true;

        let (stubs, wrapped): (Vec<_>, Vec<_>) = {
            let tables = self.stub_control.lock().unwrap();
            (
                tables.stubs.iter().map(|(id, weak)| (*id, weak.clone())).collect(),
                tables.wrapped_object_to_stub.values().cloned().collect(),
            )
        };
        for (object_id, weak) in stubs {
            match weak.upgrade() {
                None => log::warn!(
                    "stub zone_id {}, object stub {} has been released but not deregistered in the service, suspected unclean shutdown",
                    self.zone_id,
                    object_id
                ),
                Some(_) => log::warn!(
                    "stub zone_id {}, object stub {} has not been released, there is a strong pointer maintaining a positive reference count, suspected unclean shutdown",
                    self.zone_id,
                    object_id
                ),
            }
            success = false;
        }
        for weak in wrapped {
            match weak.upgrade() {
                None => log::warn!(
                    "wrapped stub zone_id {}, wrapped object has been released but not deregistered in the service, suspected unclean shutdown",
                    self.zone_id
                ),
                Some(stub) => log::warn!(
                    "wrapped stub zone_id {}, wrapped object {} has not been deregistered in the service, suspected unclean shutdown",
                    self.zone_id,
                    stub.id()
                ),
            }
            success = false;
        }

        let routes: Vec<_> = {
            let routes = self.zone_control.lock().unwrap();
            routes.iter().map(|(key, weak)| (*key, weak.clone())).collect()
        };
        for (key, weak) in routes {
            match weak.upgrade() {
                None => log::warn!(
                    "service proxy zone_id {}, caller_zone_id {}, destination_zone_id {} has been released but not deregistered in the service",
                    self.zone_id,
                    key.caller,
                    key.destination
                ),
                Some(proxy) => {
                    log::warn!(
                        "service proxy zone_id {}, caller_zone_id {}, destination_zone_id {}, destination_channel_zone_id {} has not been released in the service, suspected unclean shutdown",
                        self.zone_id,
                        key.caller,
                        proxy.destination_zone_id(),
                        proxy.destination_channel_zone_id()
                    );
                    if proxy.proxy_count() != 0 {
                        log::warn!("  has {} live object proxies", proxy.proxy_count());
                    }
                }
            }
            success = false;
        }
        success
    }

    fn release_parent(&self) {
        let parent = self.parent.lock().unwrap().take();
        if let Some(parent) = parent {
            debug_assert_eq!(parent.caller_zone_id(), self.zone_id.as_caller());
            debug_assert!(!parent.destination_channel_zone_id().is_set());
            // the service is dying, deregister the route by hand before
            // unpinning the channel
            {
                let mut routes = self.zone_control.lock().unwrap();
                routes.remove(&ZoneRoute::new(
                    parent.destination_zone_id(),
                    self.zone_id.as_caller(),
                ));
            }
            parent.set_parent_channel(false);
            parent.release_external_ref();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.release_parent();
        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_deletion(self.zone_id);
        }
        let is_empty = self.check_is_empty();
        debug_assert!(is_empty, "zone {} shut down unclean", self.zone_id);
        {
            let mut tables = self.stub_control.lock().unwrap();
            tables.stubs.clear();
            tables.wrapped_object_to_stub.clear();
        }
        self.zone_control.lock().unwrap().clear();
    }
}

fn find_exact(
    routes: &RouteMap,
    destination: DestinationZoneId,
    caller: CallerZoneId,
) -> Option<Arc<ServiceProxy>> {
    routes.get(&ZoneRoute::new(destination, caller)).and_then(Weak::upgrade)
}

/// First live channel leading exactly to `destination`, regardless of
/// caller.
fn find_first_alive_to(
    routes: &RouteMap,
    destination: DestinationZoneId,
) -> Option<Arc<ServiceProxy>> {
    for (key, weak) in routes.range(ZoneRoute::lower_bound(destination)..) {
        if key.destination != destination {
            break;
        }
        match weak.upgrade() {
            Some(proxy) => return Some(proxy),
            None => log::warn!(
                "skipping dead route destination_zone={}, caller_zone={}",
                key.destination,
                key.caller
            ),
        }
    }
    None
}

/// First live channel at or after `start`. Unlike [`find_first_alive_to`]
/// the destination of the found channel need not match: an unset start
/// yields the lowest-numbered neighbour, which is all the reverse-route
/// construction in `send` needs.
fn find_first_alive_from(
    routes: &RouteMap,
    start: DestinationZoneId,
) -> Option<Arc<ServiceProxy>> {
    let mut range = routes.range(ZoneRoute::lower_bound(start)..);
    let (first_key, first_weak) = range.next()?;
    if let Some(proxy) = first_weak.upgrade() {
        return Some(proxy);
    }
    let group = first_key.destination;
    for (key, weak) in range {
        if key.destination != group {
            break;
        }
        if let Some(proxy) = weak.upgrade() {
            return Some(proxy);
        }
    }
    None
}
