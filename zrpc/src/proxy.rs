//! Caller-side machinery: the transport seam, the directional service
//! proxy, and the per-object proxy.
//!
//! A [`ServiceProxy`] represents "how this zone talks to destination D on
//! behalf of caller C" over some [`Channel`]. It interns one
//! [`ObjectProxy`] per remote object id, carries the per-route external
//! reference count that pins routing channels alive, and negotiates the
//! wire protocol version downward per peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::ErrorCode;
use crate::interface::{InterfaceDecl, InterfaceProxy, ProxyBase};
use crate::protocol::{AddRefOptions, CallRequest, Encoding, RefRequest};
use crate::service::Service;
use crate::telemetry::Telemetry;
use crate::types::{
    CallerChannelZoneId, CallerZoneId, DestinationChannelZoneId, DestinationZoneId,
    InterfaceOrdinal, MethodId, ObjectId, ZoneId,
};
use crate::version;

/// The transport seam: one implementation per kind of channel (in-process,
/// enclave, socket). All operations are synchronous; a transport that loses
/// a reply must surface a transport-level error code.
pub trait Channel: Send + Sync + std::fmt::Debug {
    /// Forward a method call, returning the reply payload.
    fn send(&self, request: CallRequest) -> Result<Vec<u8>, ErrorCode>;

    /// Ask the destination whether an object supports an interface.
    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Result<(), ErrorCode>;

    /// Forward an `add_ref`, returning the post-operation count.
    fn add_ref(&self, request: RefRequest) -> Result<u64, ErrorCode>;

    /// Forward a `release`, returning the post-operation count.
    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
    ) -> Result<u64, ErrorCode>;
}

struct ProxyState {
    lifetime_lock: Option<Arc<ServiceProxy>>,
    is_parent_channel: bool,
    proxies: HashMap<ObjectId, Weak<ObjectProxy>>,
}

/// One directional channel out of a zone, keyed by
/// `(zone, destination_zone, caller_zone)`.
pub struct ServiceProxy {
    name: String,
    zone_id: ZoneId,
    destination_zone_id: DestinationZoneId,
    destination_channel_zone_id: DestinationChannelZoneId,
    caller_zone_id: CallerZoneId,
    service: Weak<Service>,
    channel: Arc<dyn Channel>,
    encoding: Encoding,
    remote_version: AtomicU64,
    external_ref_count: AtomicI64,
    state: Mutex<ProxyState>,
    // held directly so teardown events survive the service going away
    telemetry: Option<Arc<dyn Telemetry>>,
    weak_self: Weak<ServiceProxy>,
}

impl std::fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProxy")
            .field("name", &self.name)
            .field("zone_id", &self.zone_id)
            .field("destination_zone_id", &self.destination_zone_id)
            .field("destination_channel_zone_id", &self.destination_channel_zone_id)
            .field("caller_zone_id", &self.caller_zone_id)
            .field("external_ref_count", &self.external_ref_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ServiceProxy {
    /// Create a proxy from this service toward an adjacent destination,
    /// with the local zone as the caller.
    pub fn new(
        name: &str,
        service: &Arc<Service>,
        destination_zone_id: DestinationZoneId,
        channel: Arc<dyn Channel>,
    ) -> Arc<Self> {
        let proxy = Arc::new_cyclic(|weak_self| Self {
            name: name.to_owned(),
            zone_id: service.zone_id(),
            destination_zone_id,
            destination_channel_zone_id: DestinationChannelZoneId::default(),
            caller_zone_id: service.zone_id().as_caller(),
            service: Arc::downgrade(service),
            channel,
            encoding: Encoding::default(),
            remote_version: AtomicU64::new(version::current_version()),
            external_ref_count: AtomicI64::new(0),
            state: Mutex::new(ProxyState {
                lifetime_lock: None,
                is_parent_channel: false,
                proxies: HashMap::new(),
            }),
            telemetry: service.telemetry(),
            weak_self: weak_self.clone(),
        });
        if let Some(telemetry) = proxy.telemetry() {
            telemetry.on_service_proxy_creation(
                name,
                proxy.zone_id,
                destination_zone_id,
                proxy.caller_zone_id,
            );
        }
        proxy
    }

    /// Produce a sibling proxy over the same channel for a different
    /// `(destination, caller)` key. The clone is never a parent channel and
    /// starts version negotiation afresh; when the destination moves
    /// further away the original destination becomes the clone's
    /// destination channel, i.e. the original is now one hop closer to the
    /// new target.
    pub fn clone_for_zone(
        &self,
        destination_zone_id: DestinationZoneId,
        caller_zone_id: CallerZoneId,
    ) -> Arc<Self> {
        debug_assert!(
            !(self.caller_zone_id == caller_zone_id
                && self.destination_zone_id == destination_zone_id),
            "cloning a service proxy onto its own key"
        );
        let mut destination_channel_zone_id = self.destination_channel_zone_id;
        if self.destination_zone_id != destination_zone_id
            && !destination_channel_zone_id.is_set()
        {
            destination_channel_zone_id = self.destination_zone_id.as_destination_channel();
        }
        let proxy = Arc::new_cyclic(|weak_self| Self {
            name: self.name.clone(),
            zone_id: self.zone_id,
            destination_zone_id,
            destination_channel_zone_id,
            caller_zone_id,
            service: self.service.clone(),
            channel: self.channel.clone(),
            encoding: self.encoding,
            remote_version: AtomicU64::new(version::current_version()),
            external_ref_count: AtomicI64::new(0),
            state: Mutex::new(ProxyState {
                lifetime_lock: None,
                is_parent_channel: false,
                proxies: HashMap::new(),
            }),
            telemetry: self.telemetry.clone(),
            weak_self: weak_self.clone(),
        });
        if let Some(telemetry) = proxy.telemetry() {
            telemetry.on_service_proxy_creation(
                &proxy.name,
                proxy.zone_id,
                destination_zone_id,
                caller_zone_id,
            );
        }
        proxy
    }

    /// The zone this proxy lives in.
    pub fn zone_id(&self) -> ZoneId {
        self.zone_id
    }

    /// The zone this proxy ultimately calls into.
    pub fn destination_zone_id(&self) -> DestinationZoneId {
        self.destination_zone_id
    }

    /// The next hop toward the destination, unset when adjacent.
    pub fn destination_channel_zone_id(&self) -> DestinationChannelZoneId {
        self.destination_channel_zone_id
    }

    /// The zone on whose behalf this proxy exists.
    pub fn caller_zone_id(&self) -> CallerZoneId {
        self.caller_zone_id
    }

    /// The service this proxy lives in.
    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }

    /// The proxy's name, for telemetry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The highest protocol version the peer has confirmed so far.
    pub fn remote_version(&self) -> u64 {
        self.remote_version.load(Ordering::SeqCst)
    }

    /// Whether no external reference pins this proxy.
    pub fn is_unused(&self) -> bool {
        self.external_ref_count.load(Ordering::SeqCst) == 0
    }

    /// Whether this proxy is the channel to the parent zone, which must
    /// outlive the child service regardless of external references.
    pub fn is_parent_channel(&self) -> bool {
        self.state.lock().unwrap().is_parent_channel
    }

    pub(crate) fn set_parent_channel(&self, value: bool) {
        let dropped;
        {
            let mut state = self.state.lock().unwrap();
            state.is_parent_channel = value;
            dropped = if !value && self.external_ref_count.load(Ordering::SeqCst) == 0 {
                state.lifetime_lock.take()
            } else {
                None
            };
        }
        drop(dropped);
    }

    /// Pin the proxy alive: the 0 to 1 transition installs a self
    /// reference, the sole lifetime anchor of routing proxies.
    pub fn add_external_ref(&self) {
        let count;
        {
            let mut state = self.state.lock().unwrap();
            count = self.external_ref_count.fetch_add(1, Ordering::SeqCst) + 1;
            debug_assert!(count >= 1);
            if count == 1 && state.lifetime_lock.is_none() {
                state.lifetime_lock =
                    Some(self.weak_self.upgrade().expect("proxy used during destruction"));
            }
        }
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_service_proxy_add_external_ref(
                self.zone_id,
                self.destination_channel_zone_id,
                self.destination_zone_id,
                self.caller_zone_id,
                count,
            );
        }
    }

    /// Drop one pin, returning the new count. The 1 to 0 transition clears
    /// the self reference unless this is a parent channel.
    pub fn release_external_ref(&self) -> i64 {
        let count;
        let dropped;
        {
            let mut state = self.state.lock().unwrap();
            count = self.external_ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
            debug_assert!(count >= 0);
            dropped = if count == 0 && !state.is_parent_channel {
                state.lifetime_lock.take()
            } else {
                None
            };
        }
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_service_proxy_release_external_ref(
                self.zone_id,
                self.destination_channel_zone_id,
                self.destination_zone_id,
                self.caller_zone_id,
                count,
            );
        }
        // the self reference may be the last strong handle; let it go with
        // no lock held
        drop(dropped);
        count
    }

    /// The number of live object proxies interned on this proxy.
    pub fn proxy_count(&self) -> usize {
        self.state.lock().unwrap().proxies.values().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Intern the object proxy for `object_id`, creating it on first use.
    /// Returns the proxy and whether it was newly created.
    pub fn get_object_proxy(&self, object_id: ObjectId) -> (Arc<ObjectProxy>, bool) {
        debug_assert_eq!(
            self.caller_zone_id,
            self.zone_id.as_caller(),
            "routing proxies must not host object proxies"
        );
        let this = self.weak_self.upgrade().expect("proxy used during destruction");
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.proxies.get(&object_id).and_then(Weak::upgrade) {
            return (existing, false);
        }
        let object_proxy = ObjectProxy::new(object_id, this);
        state.proxies.insert(object_id, Arc::downgrade(&object_proxy));
        drop(state);
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_object_proxy_creation(self.zone_id, self.destination_zone_id, object_id);
        }
        (object_proxy, true)
    }

    /// Forward a call through the channel, negotiating the version: on a
    /// version rejection the attempted version is decremented and the call
    /// retried, and a successful downgrade is published to the cache.
    pub fn sp_send(
        &self,
        tag: u64,
        object_id: ObjectId,
        interface_id: &dyn Fn(u64) -> InterfaceOrdinal,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        let original_version = self.remote_version.load(Ordering::SeqCst);
        let mut version = original_version;
        while version > 0 {
            let request = CallRequest {
                protocol_version: version,
                encoding: self.encoding,
                tag,
                caller_channel_zone_id: CallerChannelZoneId::default(),
                caller_zone_id: self.caller_zone_id,
                destination_zone_id: self.destination_zone_id,
                object_id,
                interface_id: interface_id(version),
                method_id,
                payload: in_payload.to_vec(),
            };
            match self.channel.send(request) {
                Err(ErrorCode::InvalidVersion) => version -= 1,
                result => {
                    self.publish_version(original_version, version);
                    return result;
                }
            }
        }
        Err(ErrorCode::IncompatibleService)
    }

    /// Version-negotiating `try_cast`.
    pub fn sp_try_cast(
        &self,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: &dyn Fn(u64) -> InterfaceOrdinal,
    ) -> Result<(), ErrorCode> {
        let original_version = self.remote_version.load(Ordering::SeqCst);
        let mut version = original_version;
        while version > 0 {
            let id = interface_id(version);
            if let Some(telemetry) = self.telemetry() {
                telemetry.on_service_proxy_try_cast(
                    self.zone_id,
                    destination_zone_id,
                    self.caller_zone_id,
                    object_id,
                    id,
                );
            }
            match self.channel.try_cast(version, destination_zone_id, object_id, id) {
                Err(ErrorCode::InvalidVersion) => version -= 1,
                result => {
                    self.publish_version(original_version, version);
                    return result;
                }
            }
        }
        Err(ErrorCode::IncompatibleService)
    }

    /// Version-negotiating `add_ref` toward this proxy's destination.
    pub fn sp_add_ref(
        &self,
        object_id: ObjectId,
        caller_channel_zone_id: CallerChannelZoneId,
        build_options: AddRefOptions,
    ) -> Result<u64, ErrorCode> {
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_service_proxy_add_ref(
                self.zone_id,
                self.destination_zone_id,
                self.destination_channel_zone_id,
                self.caller_zone_id,
                object_id,
                build_options,
            );
        }
        let original_version = self.remote_version.load(Ordering::SeqCst);
        let mut version = original_version;
        while version > 0 {
            let request = RefRequest {
                protocol_version: version,
                destination_channel_zone_id: self.destination_channel_zone_id,
                destination_zone_id: self.destination_zone_id,
                object_id,
                caller_channel_zone_id,
                caller_zone_id: self.caller_zone_id,
                known_direction_zone_id: self.zone_id.as_known_direction(),
                build_options,
            };
            match self.channel.add_ref(request) {
                Err(ErrorCode::InvalidVersion) => version -= 1,
                result => {
                    self.publish_version(original_version, version);
                    return result;
                }
            }
        }
        Err(ErrorCode::IncompatibleService)
    }

    /// Version-negotiating `release` toward this proxy's destination.
    pub fn sp_release(&self, object_id: ObjectId) -> Result<u64, ErrorCode> {
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_service_proxy_release(
                self.zone_id,
                self.destination_zone_id,
                self.destination_channel_zone_id,
                self.caller_zone_id,
                object_id,
            );
        }
        let original_version = self.remote_version.load(Ordering::SeqCst);
        let mut version = original_version;
        while version > 0 {
            match self.channel.release(
                version,
                self.destination_zone_id,
                object_id,
                self.caller_zone_id,
            ) {
                Err(ErrorCode::InvalidVersion) => version -= 1,
                result => {
                    self.publish_version(original_version, version);
                    return result;
                }
            }
        }
        Err(ErrorCode::IncompatibleService)
    }

    // raw forwards used by the routing engine; the envelope is passed on
    // untouched apart from the channel fields the caller already rewrote
    pub(crate) fn forward_send(&self, request: CallRequest) -> Result<Vec<u8>, ErrorCode> {
        self.channel.send(request)
    }

    pub(crate) fn forward_try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Result<(), ErrorCode> {
        self.channel.try_cast(protocol_version, destination_zone_id, object_id, interface_id)
    }

    pub(crate) fn forward_add_ref(&self, request: RefRequest) -> Result<u64, ErrorCode> {
        self.channel.add_ref(request)
    }

    /// Called when the last application handle to an object proxy drops:
    /// deregister it, send the best-effort remote release, and let go of
    /// the external reference that was held on its behalf.
    fn on_object_proxy_released(&self, object_id: ObjectId) {
        {
            let mut state = self.state.lock().unwrap();
            // between the weak pointer dying and this call another proxy
            // may have been interned for the same id
            let dead = state
                .proxies
                .get(&object_id)
                .map(|weak| weak.strong_count() == 0)
                .unwrap_or(false);
            if dead {
                state.proxies.remove(&object_id);
            }
        }
        match self.sp_release(object_id) {
            Ok(_count) => {
                self.release_external_ref();
            }
            Err(e) => {
                log::error!(
                    "unable to release object {} on destination {}: {}",
                    object_id,
                    self.destination_zone_id,
                    e
                );
            }
        }
    }

    fn publish_version(&self, original: u64, negotiated: u64) {
        if original != negotiated {
            // only ever move the cached version down; a racing downgrade to
            // an even lower version must not be overwritten
            let _ = self.remote_version.compare_exchange(
                original,
                negotiated,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }

    /// The telemetry sink of the owning service, for generated interface
    /// proxies to report their own lifecycle.
    pub fn telemetry(&self) -> Option<Arc<dyn Telemetry>> {
        self.telemetry.clone()
    }
}

impl Drop for ServiceProxy {
    fn drop(&mut self) {
        debug_assert!(
            self.state.lock().unwrap().proxies.values().all(|weak| weak.strong_count() == 0),
            "service proxy destroyed while object proxies are live"
        );
        if let Some(service) = self.service.upgrade() {
            service.remove_zone_proxy(self.destination_zone_id, self.caller_zone_id);
        }
        if let Some(telemetry) = &self.telemetry {
            telemetry.on_service_proxy_deletion(
                self.zone_id,
                self.destination_zone_id,
                self.caller_zone_id,
            );
        }
    }
}

/// Caller-side shadow of one remote object.
///
/// Exactly one object proxy exists per `(service proxy, object id)` pair;
/// typed interface proxies are cached weakly per ordinal and re-created on
/// demand. Dropping the last handle schedules a best-effort remote release.
pub struct ObjectProxy {
    object_id: ObjectId,
    service_proxy: Arc<ServiceProxy>,
    insert_control: Mutex<HashMap<InterfaceOrdinal, Weak<dyn ProxyBase>>>,
    weak_self: Weak<ObjectProxy>,
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("object_id", &self.object_id)
            .field("destination_zone_id", &self.service_proxy.destination_zone_id())
            .finish_non_exhaustive()
    }
}

impl ObjectProxy {
    fn new(object_id: ObjectId, service_proxy: Arc<ServiceProxy>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            object_id,
            service_proxy,
            insert_control: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// The remote object's id.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// The remote object's home zone.
    pub fn destination_zone_id(&self) -> DestinationZoneId {
        self.service_proxy.destination_zone_id()
    }

    /// The service proxy this object is reached through.
    pub fn service_proxy(&self) -> &Arc<ServiceProxy> {
        &self.service_proxy
    }

    /// The number of live cached interface proxies.
    pub fn interface_proxy_count(&self) -> usize {
        self.insert_control
            .lock()
            .unwrap()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Forward a method call on this object.
    pub fn send(
        &self,
        tag: u64,
        interface_id: &dyn Fn(u64) -> InterfaceOrdinal,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        self.service_proxy.sp_send(tag, self.object_id, interface_id, method_id, in_payload)
    }

    /// Obtain a typed interface proxy for this object.
    ///
    /// The cache is consulted under the lock; on a miss with
    /// `do_remote_check` the lock is released for the remote `try_cast`,
    /// and the cache double-checked before a fresh interface proxy is
    /// created and cached weakly.
    pub fn query_interface<D: InterfaceDecl>(
        &self,
        do_remote_check: bool,
    ) -> Result<D::Obj, ErrorCode> {
        let interface_id = D::interface_id(version::VERSION_2);
        if interface_id == InterfaceOrdinal::new(0) {
            return Err(ErrorCode::InvalidInterfaceId);
        }
        {
            let mut cache = self.insert_control.lock().unwrap();
            let cached = cache.get(&interface_id).cloned();
            if let Some(weak) = cached {
                match weak.upgrade() {
                    Some(base) => return Self::downcast_cached::<D>(base),
                    None => {
                        // the weak pointer needs refreshing
                        let proxy = self.create_interface_proxy::<D>();
                        cache.insert(interface_id, proxy_base_weak(&proxy));
                        return Ok(D::from_proxy(proxy));
                    }
                }
            }
            if !do_remote_check {
                let proxy = self.create_interface_proxy::<D>();
                cache.insert(interface_id, proxy_base_weak(&proxy));
                return Ok(D::from_proxy(proxy));
            }
        }

        // lock released for the cast check
        self.service_proxy.sp_try_cast(
            self.service_proxy.destination_zone_id(),
            self.object_id,
            &D::interface_id,
        )?;

        let mut cache = self.insert_control.lock().unwrap();
        // another thread may have populated the entry meanwhile
        let repopulated = cache.get(&interface_id).and_then(|weak| weak.upgrade());
        if let Some(base) = repopulated {
            return Self::downcast_cached::<D>(base);
        }
        let proxy = self.create_interface_proxy::<D>();
        cache.insert(interface_id, proxy_base_weak(&proxy));
        Ok(D::from_proxy(proxy))
    }

    fn create_interface_proxy<D: InterfaceDecl>(&self) -> Arc<D::Proxy> {
        let this = self.weak_self.upgrade().expect("object proxy used during destruction");
        let proxy = D::Proxy::new(this);
        if let Some(telemetry) = self.service_proxy.telemetry() {
            telemetry.on_interface_proxy_creation(
                self.service_proxy.zone_id(),
                self.service_proxy.destination_zone_id(),
                self.object_id,
                D::interface_id(version::VERSION_2),
            );
        }
        proxy
    }

    fn downcast_cached<D: InterfaceDecl>(base: Arc<dyn ProxyBase>) -> Result<D::Obj, ErrorCode> {
        base.downcast_arc::<D::Proxy>()
            .map(D::from_proxy)
            .map_err(|_| ErrorCode::InvalidCast)
    }
}

fn proxy_base_weak<P: InterfaceProxy>(proxy: &Arc<P>) -> Weak<dyn ProxyBase> {
    let base: Arc<dyn ProxyBase> = proxy.clone();
    Arc::downgrade(&base)
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        if let Some(telemetry) = self.service_proxy.telemetry() {
            telemetry.on_object_proxy_deletion(
                self.service_proxy.zone_id(),
                self.service_proxy.destination_zone_id(),
                self.object_id,
            );
        }
        self.service_proxy.on_object_proxy_released(self.object_id);
    }
}
