mod helpers;

use std::sync::Arc;

use helpers::interfaces::{
    register_interfaces, Calculator, CalculatorImpl, FaultyCalculator, ObjectStore,
};
use helpers::{spawn_store_child, CountingTelemetry};
use zrpc::error::ErrorCode;
use zrpc::service::Service;

#[test]
fn parent_passes_object_to_child() {
    helpers::init_logging();
    let telemetry = CountingTelemetry::new();
    let parent = Service::new_with_telemetry("host", Service::generate_zone_id(), telemetry.clone());
    register_interfaces(&parent);

    let child = spawn_store_child(&parent, "child");
    let child_destination = child.service().zone_id().as_destination();

    // hand a host-side calculator to the child
    let calculator: Arc<dyn Calculator> = Arc::new(CalculatorImpl);
    child.store.store(Some(calculator.clone())).unwrap();

    // the host's implementation is now stubbed with one remote reference
    assert_eq!(parent.live_stub_count(), 1);

    // the child invokes the calculator through its proxy back to the host
    let remote = child.store_impl.retrieve().unwrap().unwrap();
    assert_eq!(remote.add(4, 5).unwrap(), 9);

    // drain the child-side references
    drop(remote);
    child.store.store(None).unwrap();
    assert_eq!(parent.live_stub_count(), 0);

    // dropping the child tears its channels down
    drop(child);
    assert!(!parent.has_route(child_destination, parent.zone_id().as_caller()));
    assert!(!parent.has_service_proxies());

    drop(parent);
    telemetry.assert_balanced();
}

#[test]
fn implementation_panic_is_contained() {
    helpers::init_logging();
    let parent = Service::new("host", Service::generate_zone_id());
    register_interfaces(&parent);

    let child = spawn_store_child(&parent, "child");

    let faulty: Arc<dyn Calculator> = Arc::new(FaultyCalculator);
    child.store.store(Some(faulty)).unwrap();

    let remote = child.store_impl.retrieve().unwrap().unwrap();
    assert_eq!(remote.add(1, 1), Err(ErrorCode::Exception));

    // the fabric stays consistent after the panic
    drop(remote);
    child.store.store(None).unwrap();
    assert_eq!(parent.live_stub_count(), 0);
}
