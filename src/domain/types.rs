//! Identifier newtypes shared across the cache and admission layers.
//!
//! Identities are plain 64-bit values in the backing store; the newtypes keep
//! voucher/user/order ids from being swapped at call sites.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<u64>().map(Self)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype! {
    /// Resolved caller identity. Always threaded explicitly; never ambient state.
    UserId
}

id_newtype! {
    /// A flash-sale voucher.
    VoucherId
}

id_newtype! {
    /// A generated order identifier (see [`crate::id::IdGenerator`]).
    OrderId
}

id_newtype! {
    /// A shop, the representative cacheable entity.
    ShopId
}
