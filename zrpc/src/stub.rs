//! Home-zone records for wrapped implementations.
//!
//! An [`ObjectStub`] is the single home-side anchor of one implementation:
//! it owns the strong pointer, carries the cross-zone reference count, and
//! fans incoming calls out to per-interface dispatchers. The service's stub
//! maps only hold weak references; when the count reaches zero the stub is
//! unhooked from them and the implementation dropped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use crate::error::ErrorCode;
use crate::interface::{raw_address, Castable, InterfaceStub};
use crate::protocol::Encoding;
use crate::service::Service;
use crate::telemetry::Telemetry;
use crate::types::{CallerChannelZoneId, CallerZoneId, InterfaceOrdinal, MethodId, ObjectId, ZoneId};

/// Home-zone record for one implementation.
pub struct ObjectStub {
    id: ObjectId,
    zone_id: ZoneId,
    service: Weak<Service>,
    reference_count: AtomicU64,
    target: Mutex<Option<Arc<dyn Castable>>>,
    interfaces: Mutex<SmallVec<[Arc<dyn InterfaceStub>; 2]>>,
    // the service maps are weak; while the count is positive this self
    // reference is what keeps the stub alive
    self_reference: Mutex<Option<Arc<ObjectStub>>>,
}

impl std::fmt::Debug for ObjectStub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStub")
            .field("id", &self.id)
            .field("zone_id", &self.zone_id)
            .field("reference_count", &self.reference_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ObjectStub {
    /// Create a stub over an implementation, with its first interface
    /// dispatcher already attached. The count starts at zero; the creator
    /// bumps it once the stub is hooked into the service maps.
    pub(crate) fn new(
        id: ObjectId,
        service: &Arc<Service>,
        target: Arc<dyn Castable>,
        first_interface: Arc<dyn InterfaceStub>,
    ) -> Arc<Self> {
        let stub = Arc::new(Self {
            id,
            zone_id: service.zone_id(),
            service: Arc::downgrade(service),
            reference_count: AtomicU64::new(0),
            target: Mutex::new(Some(target)),
            interfaces: Mutex::new(SmallVec::from_iter([first_interface])),
            self_reference: Mutex::new(None),
        });
        if let Some(telemetry) = stub.telemetry() {
            telemetry.on_stub_creation(stub.zone_id, id);
        }
        stub
    }

    /// Anchor the stub once it is hooked into its zone's maps; the anchor
    /// holds until [`ObjectStub::reset`].
    pub(crate) fn on_added_to_zone(stub: &Arc<Self>) {
        *stub.self_reference.lock().unwrap() = Some(stub.clone());
    }

    /// The object id, unique within the home zone.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The current cross-zone reference count.
    pub fn reference_count(&self) -> u64 {
        self.reference_count.load(Ordering::SeqCst)
    }

    /// The wrapped implementation, if the stub has not been reset yet.
    pub fn castable(&self) -> Option<Arc<dyn Castable>> {
        self.target.lock().unwrap().clone()
    }

    /// The raw address of the wrapped implementation, keying the service's
    /// wrapped-object index.
    pub(crate) fn address(&self) -> Option<usize> {
        self.target.lock().unwrap().as_ref().map(raw_address)
    }

    /// Bump the count, returning the new value.
    pub fn add_ref(&self) -> u64 {
        let count = self.reference_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_stub_add_ref(self.zone_id, self.id, count);
        }
        count
    }

    /// Drop one count, returning the new value. Underflow is reported as
    /// [`crate::protocol::VERSION_MISMATCH_COUNT`] so the ref-count engine
    /// can flag it instead of wrapping.
    pub fn release(&self) -> u64 {
        let previous = self
            .reference_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
        let count = match previous {
            Ok(previous) => previous - 1,
            Err(_) => {
                log::error!("release on object stub {} with count already zero", self.id);
                return u64::MAX;
            }
        };
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_stub_release(self.zone_id, self.id, count);
        }
        count
    }

    /// Attach one more interface dispatcher.
    pub fn add_interface(&self, interface_stub: Arc<dyn InterfaceStub>) {
        self.interfaces.lock().unwrap().push(interface_stub);
    }

    /// Look up an interface dispatcher by ordinal.
    pub fn get_interface(&self, interface_id: InterfaceOrdinal) -> Option<Arc<dyn InterfaceStub>> {
        self.interfaces
            .lock()
            .unwrap()
            .iter()
            .find(|stub| stub.interface_id() == interface_id)
            .cloned()
    }

    /// Dispatch an incoming call to the interface selected by
    /// `interface_id`. Panics escaping the implementation are converted to
    /// [`ErrorCode::Exception`] and never reach the routing layer.
    pub fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        interface_id: InterfaceOrdinal,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        let interface_stub =
            self.get_interface(interface_id).ok_or(ErrorCode::InvalidInterfaceId)?;
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_stub_send(self.zone_id, self.id, interface_id, method_id);
        }
        let result = catch_unwind(AssertUnwindSafe(|| {
            interface_stub.call(
                protocol_version,
                encoding,
                caller_channel_zone_id,
                caller_zone_id,
                method_id,
                in_payload,
            )
        }));
        match result {
            Ok(reply) => reply,
            Err(_) => {
                log::error!(
                    "implementation of object {} interface {} panicked in method {}",
                    self.id,
                    interface_id,
                    method_id
                );
                if let Some(telemetry) = self.telemetry() {
                    telemetry.message(log::Level::Error, "implementation panicked");
                }
                Err(ErrorCode::Exception)
            }
        }
    }

    /// Ask whether the implementation supports another interface; on
    /// success the interface stub is materialised so subsequent calls on
    /// that ordinal dispatch.
    pub fn try_cast(&self, interface_id: InterfaceOrdinal) -> Result<(), ErrorCode> {
        if self.get_interface(interface_id).is_some() {
            return Ok(());
        }
        let service = self.service.upgrade().ok_or(ErrorCode::ZoneNotInitialised)?;
        let target = self.castable().ok_or(ErrorCode::ObjectNotFound)?;
        let interface_stub = service.create_interface_stub(interface_id, &target)?;
        // another caller may have won the race; a duplicate entry is
        // harmless as lookup stops at the first match
        self.add_interface(interface_stub);
        Ok(())
    }

    /// Drop the implementation. The caller must not hold any service lock:
    /// the implementation's destructor is free to make outbound calls.
    pub(crate) fn reset(&self) {
        let target = self.target.lock().unwrap().take();
        drop(target);
        self.interfaces.lock().unwrap().clear();
        // the caller still holds a handle, so this is never the last one
        let anchor = self.self_reference.lock().unwrap().take();
        drop(anchor);
    }

    fn telemetry(&self) -> Option<Arc<dyn Telemetry>> {
        self.service.upgrade().and_then(|service| service.telemetry())
    }
}

impl Drop for ObjectStub {
    fn drop(&mut self) {
        if let Some(telemetry) = self.telemetry() {
            telemetry.on_stub_deletion(self.zone_id, self.id);
        }
    }
}
