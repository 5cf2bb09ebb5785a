//! The seams between the core and generated interface code.
//!
//! The fabric never sees a concrete interface trait; it moves values across
//! zone boundaries through three type-erased faces. [`Castable`] is what
//! every implementation (and every generated proxy) exposes so the fabric
//! can ask "do you support interface N" without naming N's trait.
//! [`InterfaceStub`] is the callee-side dispatcher for one `(object,
//! interface)` pair. [`ProxyBase`] is the caller-side face of a generated
//! interface proxy, kept in the object proxy's cache as a weak reference.
//!
//! [`InterfaceDecl`] bundles the per-interface pieces the generator emits,
//! so the bind helpers can be generic over "an interface" without a macro.

use std::any::Any;
use std::sync::Arc;

use downcast_rs::{impl_downcast, DowncastSync};

use crate::error::ErrorCode;
use crate::protocol::Encoding;
use crate::proxy::ObjectProxy;
use crate::service::Service;
use crate::types::{CallerChannelZoneId, CallerZoneId, InterfaceOrdinal, MethodId};

/// A type-erased strong handle to one interface of an implementation, as
/// produced by [`Castable::cast`]. The payload is the `Arc<dyn Interface>`
/// for the requested ordinal.
pub struct CastHandle(Box<dyn Any + Send + Sync>);

impl CastHandle {
    /// Wrap a strong interface handle.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// Recover the typed handle, if the ordinal's interface matches `T`.
    pub fn downcast<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|boxed| *boxed)
    }
}

impl std::fmt::Debug for CastHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastHandle").finish_non_exhaustive()
    }
}

/// Implemented by every object implementation and every generated proxy.
pub trait Castable: Send + Sync + 'static {
    /// Return a strong handle to the requested interface, or `None` if this
    /// object does not implement it.
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle>;

    /// Erase to the common face. Implementations write `self`.
    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable>;

    /// The proxy face of this object, if it is a generated proxy rather
    /// than a local implementation.
    fn as_proxy(&self) -> Option<&dyn ProxyBase> {
        None
    }
}

/// Identity of a wrapped implementation, used by the service's
/// wrapped-object index. Proxies and implementations sharing an allocation
/// share an address.
pub(crate) fn raw_address(iface: &Arc<dyn Castable>) -> usize {
    Arc::as_ptr(iface) as *const () as usize
}

/// The type-erased face of a generated interface proxy.
pub trait ProxyBase: DowncastSync {
    /// The object proxy this interface proxy speaks through.
    fn object_proxy(&self) -> &Arc<ObjectProxy>;
}
impl_downcast!(sync ProxyBase);

/// Constructor seam for generated interface proxies, used by
/// [`ObjectProxy::query_interface`].
pub trait InterfaceProxy: ProxyBase + Sized {
    /// The interface ordinal under the given protocol version.
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal;

    /// Build a fresh interface proxy over an object proxy.
    fn new(object_proxy: Arc<ObjectProxy>) -> Arc<Self>;
}

/// Callee-side dispatcher for one `(object, interface)` pair.
pub trait InterfaceStub: Send + Sync {
    /// The interface this stub dispatches.
    fn interface_id(&self) -> InterfaceOrdinal;

    /// Decode the arguments, invoke the implementation, encode the results.
    fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode>;

    /// The implementation behind this stub, erased.
    fn castable(&self) -> Arc<dyn Castable>;
}

/// A factory wrapping an implementation into an interface stub, or `None`
/// if the implementation does not support the interface. One is registered
/// per generated interface; [`crate::service::Service`] consults the table
/// during `try_cast`.
pub type InterfaceStubFactory =
    Arc<dyn Fn(&Arc<dyn Castable>, &Arc<Service>) -> Option<Arc<dyn InterfaceStub>> + Send + Sync>;

/// The per-interface bundle emitted by the generator.
pub trait InterfaceDecl: 'static {
    /// The application-facing handle type, e.g. `Arc<dyn Calculator>`.
    type Obj: Clone + Send + Sync + 'static;

    /// The generated proxy type for this interface.
    type Proxy: InterfaceProxy;

    /// The interface ordinal under the given protocol version.
    fn interface_id(protocol_version: u64) -> InterfaceOrdinal;

    /// Erase a handle to the common face.
    fn to_castable(obj: &Self::Obj) -> Arc<dyn Castable>;

    /// Recover a typed handle from the common face, if supported.
    fn from_castable(iface: &Arc<dyn Castable>) -> Option<Self::Obj>;

    /// Wrap a generated proxy into the handle type.
    fn from_proxy(proxy: Arc<Self::Proxy>) -> Self::Obj;

    /// Build the callee-side dispatcher for a local implementation.
    fn new_stub(obj: Self::Obj, service: &Arc<Service>) -> Arc<dyn InterfaceStub>;
}
