//! Strongly-typed identifiers for zones, objects, interfaces and methods.
//!
//! A call travelling through the fabric carries several zone ids with
//! different roles: where it is going, where it came from, and which
//! intermediate channels it used on the way. Each role gets its own newtype
//! so that the routing code cannot accidentally mix directions; conversions
//! between them are always explicit.

use std::fmt;

/// The zone a service lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ZoneId(u64);

/// The zone a call or reference is ultimately destined for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DestinationZoneId(u64);

/// The zone a call or reference originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CallerZoneId(u64);

/// The next hop back toward the caller, when the caller is not adjacent.
///
/// Zero means "not set", i.e. the caller is reached directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CallerChannelZoneId(u64);

/// The next hop toward the destination, when the destination is not adjacent.
///
/// Zero means "not set", i.e. the destination is reached directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DestinationChannelZoneId(u64);

/// A routing hint carried by `add_ref`, naming the zone along whose path the
/// referenced object was last seen.
///
/// This is what lets an `add_ref` terminate in topologies where a branch of
/// the zone graph passes around objects from zones the rest of the graph has
/// never heard of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct KnownDirectionZoneId(u64);

/// An object id, unique within its home zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(u64);

/// An interface ordinal, as assigned by the interface generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct InterfaceOrdinal(u64);

/// A method ordinal within an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MethodId(u64);

macro_rules! impl_id_basics {
    ($($name:ident),*) => {
        $(
            impl $name {
                /// Wrap a raw id.
                pub const fn new(id: u64) -> Self {
                    Self(id)
                }

                /// The raw id value.
                pub const fn id(self) -> u64 {
                    self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )*
    };
}

impl_id_basics!(
    ZoneId,
    DestinationZoneId,
    CallerZoneId,
    CallerChannelZoneId,
    DestinationChannelZoneId,
    KnownDirectionZoneId,
    ObjectId,
    InterfaceOrdinal,
    MethodId
);

impl ZoneId {
    /// This zone in the role of a caller.
    pub const fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }

    /// This zone in the role of a destination.
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    /// This zone as an intermediate hop on the caller side.
    pub const fn as_caller_channel(self) -> CallerChannelZoneId {
        CallerChannelZoneId(self.0)
    }

    /// This zone as an intermediate hop on the destination side.
    pub const fn as_destination_channel(self) -> DestinationChannelZoneId {
        DestinationChannelZoneId(self.0)
    }

    /// This zone as a routing hint.
    pub const fn as_known_direction(self) -> KnownDirectionZoneId {
        KnownDirectionZoneId(self.0)
    }
}

impl DestinationZoneId {
    /// The destination seen from the opposite direction.
    pub const fn as_caller(self) -> CallerZoneId {
        CallerZoneId(self.0)
    }

    /// The destination demoted to an intermediate hop, used when a proxy is
    /// cloned for a zone further away than its original target.
    pub const fn as_destination_channel(self) -> DestinationChannelZoneId {
        DestinationChannelZoneId(self.0)
    }

    /// The destination in the role of a caller-side hop.
    pub const fn as_caller_channel(self) -> CallerChannelZoneId {
        CallerChannelZoneId(self.0)
    }

    /// Whether the id carries a value.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl CallerZoneId {
    /// The caller seen from the opposite direction.
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    /// Whether the id carries a value.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl CallerChannelZoneId {
    /// The caller-side hop as a lookup destination.
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    /// Whether the id carries a value.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl DestinationChannelZoneId {
    /// The destination-side hop as a lookup destination.
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    /// Whether the id carries a value.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl KnownDirectionZoneId {
    /// The hinted zone as a lookup destination.
    pub const fn as_destination(self) -> DestinationZoneId {
        DestinationZoneId(self.0)
    }

    /// Whether the hint carries a value.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

impl ObjectId {
    /// Sentinel object id used by pure channel-build pings: an `add_ref`
    /// carrying it wires routes but touches no stub.
    pub const DUMMY: ObjectId = ObjectId(u64::MAX);

    /// Whether the id names an actual object.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }
}

/// The wire identity of an object: its id and its home zone.
///
/// An all-zero descriptor denotes the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InterfaceDescriptor {
    /// The object, unique within its home zone.
    pub object_id: ObjectId,
    /// The home zone of the object.
    pub destination_zone_id: DestinationZoneId,
}

impl InterfaceDescriptor {
    /// The null reference.
    pub const NULL: InterfaceDescriptor = InterfaceDescriptor {
        object_id: ObjectId::new(0),
        destination_zone_id: DestinationZoneId::new(0),
    };

    /// Build a descriptor from its parts.
    pub const fn new(object_id: ObjectId, destination_zone_id: DestinationZoneId) -> Self {
        Self { object_id, destination_zone_id }
    }

    /// Whether this is the null reference.
    pub fn is_null(&self) -> bool {
        !self.object_id.is_set() || !self.destination_zone_id.is_set()
    }
}

impl fmt::Display for InterfaceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.object_id, self.destination_zone_id)
    }
}

/// Key of the outbound proxy table: one directional channel per
/// `(destination, caller)` pair.
///
/// The ordering (destination major) is what the routing code's lower-bound
/// neighbour searches rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ZoneRoute {
    /// Where the channel leads.
    pub destination: DestinationZoneId,
    /// On whose behalf it was opened.
    pub caller: CallerZoneId,
}

impl ZoneRoute {
    /// Build a route key from its parts.
    pub const fn new(destination: DestinationZoneId, caller: CallerZoneId) -> Self {
        Self { destination, caller }
    }

    /// The smallest key with the given destination, for range scans over all
    /// channels leading there.
    pub const fn lower_bound(destination: DestinationZoneId) -> Self {
        Self { destination, caller: CallerZoneId::new(0) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_conversions_preserve_the_raw_id() {
        let zone = ZoneId::new(7);
        assert_eq!(zone.as_caller().id(), 7);
        assert_eq!(zone.as_destination().id(), 7);
        assert_eq!(zone.as_caller_channel().id(), 7);
        assert_eq!(zone.as_destination_channel().id(), 7);
        assert_eq!(zone.as_destination().as_caller().id(), 7);
        assert_eq!(zone.as_caller().as_destination().id(), 7);
    }

    #[test]
    fn null_descriptor() {
        assert!(InterfaceDescriptor::NULL.is_null());
        assert!(InterfaceDescriptor::new(ObjectId::new(1), DestinationZoneId::new(0)).is_null());
        assert!(InterfaceDescriptor::new(ObjectId::new(0), DestinationZoneId::new(3)).is_null());
        assert!(!InterfaceDescriptor::new(ObjectId::new(1), DestinationZoneId::new(3)).is_null());
    }

    #[test]
    fn route_ordering_is_destination_major() {
        let a = ZoneRoute::new(DestinationZoneId::new(1), CallerZoneId::new(9));
        let b = ZoneRoute::new(DestinationZoneId::new(2), CallerZoneId::new(0));
        assert!(a < b);
        assert!(ZoneRoute::lower_bound(DestinationZoneId::new(2)) <= b);
        assert!(ZoneRoute::lower_bound(DestinationZoneId::new(2)) > a);
    }
}
