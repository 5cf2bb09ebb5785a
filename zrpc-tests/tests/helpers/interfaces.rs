//! Hand-written rendition of what the interface generator emits for two
//! small IDL interfaces: a calculator and an object store. The store's
//! methods take and return interface references, which is what drives the
//! bind helpers in the scenarios.

use std::sync::{Arc, Mutex, Weak};

use zrpc::bind;
use zrpc::error::ErrorCode;
use zrpc::interface::{
    CastHandle, Castable, InterfaceDecl, InterfaceProxy, InterfaceStub, ProxyBase,
};
use zrpc::protocol::{self, Encoding};
use zrpc::proxy::ObjectProxy;
use zrpc::service::Service;
use zrpc::types::{CallerChannelZoneId, CallerZoneId, InterfaceOrdinal, MethodId};

pub const CALCULATOR_INTERFACE_ID: InterfaceOrdinal = InterfaceOrdinal::new(101);
pub const OBJECT_STORE_INTERFACE_ID: InterfaceOrdinal = InterfaceOrdinal::new(102);

const METHOD_ADD: MethodId = MethodId::new(1);
const METHOD_STORE: MethodId = MethodId::new(1);
const METHOD_RETRIEVE: MethodId = MethodId::new(2);

fn check_encoding(encoding: Encoding) -> Result<(), ErrorCode> {
    match encoding {
        Encoding::Default | Encoding::Binary => Ok(()),
        _ => Err(ErrorCode::IncompatibleSerialisation),
    }
}

// ---------------------------------------------------------------------
// i_calculator

pub trait Calculator: Castable {
    fn add(&self, a: i64, b: i64) -> Result<i64, ErrorCode>;
}

pub struct CalculatorDecl;

impl InterfaceDecl for CalculatorDecl {
    type Obj = Arc<dyn Calculator>;
    type Proxy = CalculatorProxy;

    fn interface_id(_protocol_version: u64) -> InterfaceOrdinal {
        CALCULATOR_INTERFACE_ID
    }

    fn to_castable(obj: &Self::Obj) -> Arc<dyn Castable> {
        obj.clone().as_castable()
    }

    fn from_castable(iface: &Arc<dyn Castable>) -> Option<Self::Obj> {
        iface.clone().cast(CALCULATOR_INTERFACE_ID)?.downcast::<Arc<dyn Calculator>>()
    }

    fn from_proxy(proxy: Arc<Self::Proxy>) -> Self::Obj {
        proxy
    }

    fn new_stub(obj: Self::Obj, _service: &Arc<Service>) -> Arc<dyn InterfaceStub> {
        Arc::new(CalculatorStub { target: obj })
    }
}

pub struct CalculatorProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl ProxyBase for CalculatorProxy {
    fn object_proxy(&self) -> &Arc<ObjectProxy> {
        &self.object_proxy
    }
}

impl InterfaceProxy for CalculatorProxy {
    fn interface_id(_protocol_version: u64) -> InterfaceOrdinal {
        CALCULATOR_INTERFACE_ID
    }

    fn new(object_proxy: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(Self { object_proxy })
    }
}

impl Castable for CalculatorProxy {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == CALCULATOR_INTERFACE_ID {
            let obj: Arc<dyn Calculator> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }

    fn as_proxy(&self) -> Option<&dyn ProxyBase> {
        Some(self)
    }
}

impl Drop for CalculatorProxy {
    fn drop(&mut self) {
        if let Some(telemetry) = self.object_proxy.service_proxy().telemetry() {
            telemetry.on_interface_proxy_deletion(
                self.object_proxy.service_proxy().zone_id(),
                self.object_proxy.destination_zone_id(),
                self.object_proxy.object_id(),
                CALCULATOR_INTERFACE_ID,
            );
        }
    }
}

impl Calculator for CalculatorProxy {
    fn add(&self, a: i64, b: i64) -> Result<i64, ErrorCode> {
        let mut payload = Vec::new();
        protocol::write_i64(&mut payload, a);
        protocol::write_i64(&mut payload, b);
        let out =
            self.object_proxy.send(0, &CalculatorDecl::interface_id, METHOD_ADD, &payload)?;
        let mut slice = &out[..];
        protocol::read_i64(&mut slice).map_err(|_| ErrorCode::ProxyDeserialisationError)
    }
}

struct CalculatorStub {
    target: Arc<dyn Calculator>,
}

impl InterfaceStub for CalculatorStub {
    fn interface_id(&self) -> InterfaceOrdinal {
        CALCULATOR_INTERFACE_ID
    }

    fn call(
        &self,
        _protocol_version: u64,
        encoding: Encoding,
        _caller_channel_zone_id: CallerChannelZoneId,
        _caller_zone_id: CallerZoneId,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        check_encoding(encoding)?;
        match method_id {
            METHOD_ADD => {
                let mut slice = in_payload;
                let a = protocol::read_i64(&mut slice)
                    .map_err(|_| ErrorCode::StubDeserialisationError)?;
                let b = protocol::read_i64(&mut slice)
                    .map_err(|_| ErrorCode::StubDeserialisationError)?;
                let result = self.target.add(a, b)?;
                let mut out = Vec::new();
                protocol::write_i64(&mut out, result);
                Ok(out)
            }
            _ => Err(ErrorCode::InvalidData),
        }
    }

    fn castable(&self) -> Arc<dyn Castable> {
        self.target.clone().as_castable()
    }
}

// ---------------------------------------------------------------------
// i_object_store

pub trait ObjectStore: Castable {
    fn store(&self, item: Option<Arc<dyn Calculator>>) -> Result<(), ErrorCode>;
    fn retrieve(&self) -> Result<Option<Arc<dyn Calculator>>, ErrorCode>;
}

pub struct ObjectStoreDecl;

impl InterfaceDecl for ObjectStoreDecl {
    type Obj = Arc<dyn ObjectStore>;
    type Proxy = ObjectStoreProxy;

    fn interface_id(_protocol_version: u64) -> InterfaceOrdinal {
        OBJECT_STORE_INTERFACE_ID
    }

    fn to_castable(obj: &Self::Obj) -> Arc<dyn Castable> {
        obj.clone().as_castable()
    }

    fn from_castable(iface: &Arc<dyn Castable>) -> Option<Self::Obj> {
        iface.clone().cast(OBJECT_STORE_INTERFACE_ID)?.downcast::<Arc<dyn ObjectStore>>()
    }

    fn from_proxy(proxy: Arc<Self::Proxy>) -> Self::Obj {
        proxy
    }

    fn new_stub(obj: Self::Obj, service: &Arc<Service>) -> Arc<dyn InterfaceStub> {
        Arc::new(ObjectStoreStub { target: obj, service: Arc::downgrade(service) })
    }
}

pub struct ObjectStoreProxy {
    object_proxy: Arc<ObjectProxy>,
}

impl ProxyBase for ObjectStoreProxy {
    fn object_proxy(&self) -> &Arc<ObjectProxy> {
        &self.object_proxy
    }
}

impl InterfaceProxy for ObjectStoreProxy {
    fn interface_id(_protocol_version: u64) -> InterfaceOrdinal {
        OBJECT_STORE_INTERFACE_ID
    }

    fn new(object_proxy: Arc<ObjectProxy>) -> Arc<Self> {
        Arc::new(Self { object_proxy })
    }
}

impl Castable for ObjectStoreProxy {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == OBJECT_STORE_INTERFACE_ID {
            let obj: Arc<dyn ObjectStore> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }

    fn as_proxy(&self) -> Option<&dyn ProxyBase> {
        Some(self)
    }
}

impl Drop for ObjectStoreProxy {
    fn drop(&mut self) {
        if let Some(telemetry) = self.object_proxy.service_proxy().telemetry() {
            telemetry.on_interface_proxy_deletion(
                self.object_proxy.service_proxy().zone_id(),
                self.object_proxy.destination_zone_id(),
                self.object_proxy.object_id(),
                OBJECT_STORE_INTERFACE_ID,
            );
        }
    }
}

impl ObjectStore for ObjectStoreProxy {
    fn store(&self, item: Option<Arc<dyn Calculator>>) -> Result<(), ErrorCode> {
        let sp = self.object_proxy.service_proxy();
        let mut in_flight = None;
        let descriptor = bind::proxy_bind_in_param::<CalculatorDecl>(
            sp.remote_version(),
            sp,
            item.as_ref(),
            &mut in_flight,
        )?;
        let mut payload = Vec::new();
        protocol::write_descriptor(&mut payload, descriptor);
        let result =
            self.object_proxy.send(0, &ObjectStoreDecl::interface_id, METHOD_STORE, &payload);
        bind::release_in_flight_stub(sp, in_flight);
        result.map(|_| ())
    }

    fn retrieve(&self) -> Result<Option<Arc<dyn Calculator>>, ErrorCode> {
        let out = self.object_proxy.send(0, &ObjectStoreDecl::interface_id, METHOD_RETRIEVE, &[])?;
        let mut slice = &out[..];
        let descriptor = protocol::read_descriptor(&mut slice)
            .map_err(|_| ErrorCode::ProxyDeserialisationError)?;
        let sp = self.object_proxy.service_proxy();
        bind::proxy_bind_out_param::<CalculatorDecl>(sp, descriptor, sp.zone_id().as_caller())
    }
}

struct ObjectStoreStub {
    target: Arc<dyn ObjectStore>,
    service: Weak<Service>,
}

impl InterfaceStub for ObjectStoreStub {
    fn interface_id(&self) -> InterfaceOrdinal {
        OBJECT_STORE_INTERFACE_ID
    }

    fn call(
        &self,
        protocol_version: u64,
        encoding: Encoding,
        caller_channel_zone_id: CallerChannelZoneId,
        caller_zone_id: CallerZoneId,
        method_id: MethodId,
        in_payload: &[u8],
    ) -> Result<Vec<u8>, ErrorCode> {
        check_encoding(encoding)?;
        let service = self.service.upgrade().ok_or(ErrorCode::ZoneNotInitialised)?;
        match method_id {
            METHOD_STORE => {
                let mut slice = in_payload;
                let descriptor = protocol::read_descriptor(&mut slice)
                    .map_err(|_| ErrorCode::StubDeserialisationError)?;
                let item = bind::stub_bind_in_param::<CalculatorDecl>(
                    protocol_version,
                    &service,
                    caller_channel_zone_id,
                    caller_zone_id,
                    descriptor,
                )?;
                self.target.store(item)?;
                Ok(Vec::new())
            }
            METHOD_RETRIEVE => {
                let item = self.target.retrieve()?;
                let descriptor = bind::stub_bind_out_param::<CalculatorDecl>(
                    &service,
                    protocol_version,
                    caller_channel_zone_id,
                    caller_zone_id,
                    item.as_ref(),
                )?;
                let mut out = Vec::new();
                protocol::write_descriptor(&mut out, descriptor);
                Ok(out)
            }
            _ => Err(ErrorCode::InvalidData),
        }
    }

    fn castable(&self) -> Arc<dyn Castable> {
        self.target.clone().as_castable()
    }
}

// ---------------------------------------------------------------------
// implementations used by the scenarios

pub struct CalculatorImpl;

impl Calculator for CalculatorImpl {
    fn add(&self, a: i64, b: i64) -> Result<i64, ErrorCode> {
        Ok(a + b)
    }
}

impl Castable for CalculatorImpl {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == CALCULATOR_INTERFACE_ID {
            let obj: Arc<dyn Calculator> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

/// A calculator whose implementation panics, for the exception boundary.
pub struct FaultyCalculator;

impl Calculator for FaultyCalculator {
    fn add(&self, _a: i64, _b: i64) -> Result<i64, ErrorCode> {
        panic!("arithmetic is hard");
    }
}

impl Castable for FaultyCalculator {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == CALCULATOR_INTERFACE_ID {
            let obj: Arc<dyn Calculator> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

#[derive(Default)]
pub struct StoreImpl {
    slot: Mutex<Option<Arc<dyn Calculator>>>,
}

impl ObjectStore for StoreImpl {
    fn store(&self, item: Option<Arc<dyn Calculator>>) -> Result<(), ErrorCode> {
        *self.slot.lock().unwrap() = item;
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<Arc<dyn Calculator>>, ErrorCode> {
        Ok(self.slot.lock().unwrap().clone())
    }
}

impl Castable for StoreImpl {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == OBJECT_STORE_INTERFACE_ID {
            let obj: Arc<dyn ObjectStore> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

/// Implements both interfaces, for the cast scenarios.
#[derive(Default)]
pub struct DualImpl {
    slot: Mutex<Option<Arc<dyn Calculator>>>,
}

impl Calculator for DualImpl {
    fn add(&self, a: i64, b: i64) -> Result<i64, ErrorCode> {
        Ok(a + b)
    }
}

impl ObjectStore for DualImpl {
    fn store(&self, item: Option<Arc<dyn Calculator>>) -> Result<(), ErrorCode> {
        *self.slot.lock().unwrap() = item;
        Ok(())
    }

    fn retrieve(&self) -> Result<Option<Arc<dyn Calculator>>, ErrorCode> {
        Ok(self.slot.lock().unwrap().clone())
    }
}

impl Castable for DualImpl {
    fn cast(self: Arc<Self>, interface_id: InterfaceOrdinal) -> Option<CastHandle> {
        if interface_id == CALCULATOR_INTERFACE_ID {
            let obj: Arc<dyn Calculator> = self;
            Some(CastHandle::new(obj))
        } else if interface_id == OBJECT_STORE_INTERFACE_ID {
            let obj: Arc<dyn ObjectStore> = self;
            Some(CastHandle::new(obj))
        } else {
            None
        }
    }

    fn as_castable(self: Arc<Self>) -> Arc<dyn Castable> {
        self
    }
}

/// Register the stub factories of both interfaces with a zone.
pub fn register_interfaces(service: &Arc<Service>) {
    service
        .register_interface_factory(
            CALCULATOR_INTERFACE_ID,
            Arc::new(|target, service| {
                CalculatorDecl::from_castable(target)
                    .map(|obj| CalculatorDecl::new_stub(obj, service))
            }),
        )
        .unwrap();
    service
        .register_interface_factory(
            OBJECT_STORE_INTERFACE_ID,
            Arc::new(|target, service| {
                ObjectStoreDecl::from_castable(target)
                    .map(|obj| ObjectStoreDecl::new_stub(obj, service))
            }),
        )
        .unwrap();
}
