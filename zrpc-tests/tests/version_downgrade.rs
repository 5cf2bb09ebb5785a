mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use zrpc::error::ErrorCode;
use zrpc::local::LocalChannel;
use zrpc::protocol::{AddRefOptions, CallRequest, RefRequest};
use zrpc::proxy::{Channel, ServiceProxy};
use zrpc::service::Service;
use zrpc::types::{CallerChannelZoneId, CallerZoneId, DestinationZoneId, InterfaceOrdinal, ObjectId};
use zrpc::version::{VERSION_2, VERSION_3};

/// A peer that only speaks up to `highest`, rejecting newer requests the
/// way a real remote does.
#[derive(Debug)]
struct OldPeer {
    inner: Arc<LocalChannel>,
    highest: u64,
    rejected: AtomicUsize,
}

impl OldPeer {
    fn reject(&self, protocol_version: u64) -> Result<(), ErrorCode> {
        if protocol_version > self.highest {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(ErrorCode::InvalidVersion);
        }
        Ok(())
    }
}

impl Channel for OldPeer {
    fn send(&self, request: CallRequest) -> Result<Vec<u8>, ErrorCode> {
        self.reject(request.protocol_version)?;
        self.inner.send(request)
    }

    fn try_cast(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        interface_id: InterfaceOrdinal,
    ) -> Result<(), ErrorCode> {
        self.reject(protocol_version)?;
        self.inner.try_cast(protocol_version, destination_zone_id, object_id, interface_id)
    }

    fn add_ref(&self, request: RefRequest) -> Result<u64, ErrorCode> {
        self.reject(request.protocol_version)?;
        self.inner.add_ref(request)
    }

    fn release(
        &self,
        protocol_version: u64,
        destination_zone_id: DestinationZoneId,
        object_id: ObjectId,
        caller_zone_id: CallerZoneId,
    ) -> Result<u64, ErrorCode> {
        self.reject(protocol_version)?;
        self.inner.release(protocol_version, destination_zone_id, object_id, caller_zone_id)
    }
}

#[test]
fn downgrade_is_sticky_and_monotone() {
    helpers::init_logging();
    let host = Service::new("host", Service::generate_zone_id());
    let peer = Service::new("peer", Service::generate_zone_id());

    let channel = Arc::new(OldPeer {
        inner: LocalChannel::new(&peer),
        highest: VERSION_2,
        rejected: AtomicUsize::new(0),
    });
    let proxy =
        ServiceProxy::new("old-peer", &host, peer.zone_id().as_destination(), channel.clone());
    assert_eq!(proxy.remote_version(), VERSION_3);

    // the first request goes out at the current version, is rejected, and
    // succeeds one version down; the proxy remembers the downgrade
    let count = proxy
        .sp_add_ref(ObjectId::DUMMY, CallerChannelZoneId::default(), AddRefOptions::NORMAL)
        .unwrap();
    assert_eq!(count, 0);
    assert_eq!(proxy.remote_version(), VERSION_2);
    assert_eq!(channel.rejected.load(Ordering::SeqCst), 1);

    // later traffic never attempts the newer version again
    proxy
        .sp_add_ref(ObjectId::DUMMY, CallerChannelZoneId::default(), AddRefOptions::NORMAL)
        .unwrap();
    assert_eq!(channel.rejected.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.remote_version(), VERSION_2);
}

#[test]
fn incompatible_peer_is_reported() {
    helpers::init_logging();
    let host = Service::new("host", Service::generate_zone_id());
    let peer = Service::new("peer", Service::generate_zone_id());

    // a peer rejecting every version the host can speak
    let channel = Arc::new(OldPeer {
        inner: LocalChannel::new(&peer),
        highest: 0,
        rejected: AtomicUsize::new(0),
    });
    let proxy = ServiceProxy::new("stone-age", &host, peer.zone_id().as_destination(), channel);

    let result =
        proxy.sp_add_ref(ObjectId::DUMMY, CallerChannelZoneId::default(), AddRefOptions::NORMAL);
    assert_eq!(result, Err(ErrorCode::IncompatibleService));
}
