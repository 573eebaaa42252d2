//! Newtype identifiers shared by every layer of the session protocol.

use std::fmt;

macro_rules! id_type {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            /// The zero value, used as a sentinel (e.g. "no client yet", "not yet assigned").
            pub const ZERO: $name = $name(0);

            pub fn get(self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                $name(v)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(SessionId, u64, "A server-assigned, cluster-unique session identifier.");
id_type!(ClientId, u64, "A client identifier stable across session recovery.");
id_type!(ResourceId, u64, "A cluster-unique identifier for one replicated resource instance.");
id_type!(TypeId, u32, "Identifies which state-machine implementation backs a resource.");
id_type!(CorrelationId, u64, "A per-connection monotonically increasing request/response id.");
id_type!(Sequence, u64, "A per-session monotonic counter on commands.");
id_type!(EventIndex, u64, "A per-session monotonic counter on server-to-client events.");

impl Sequence {
    /// The sequence immediately following this one.
    pub fn next(self) -> Sequence {
        Sequence(self.0 + 1)
    }
}

impl EventIndex {
    /// The event index immediately following this one.
    pub fn next(self) -> EventIndex {
        EventIndex(self.0 + 1)
    }
}
