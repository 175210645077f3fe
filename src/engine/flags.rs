//! Engine flag sets
//!
//! Bit values match the LMDB C library so flags can be handed to a binding
//! unchanged.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bits:expr;)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($bits);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                $name(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True if every bit of `other` is set in `self`
            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            /// True if any bit of `other` is set in `self`
            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn union(self, other: $name) -> Self {
                $name(self.0 | other.0)
            }

            pub const fn difference(self, other: $name) -> Self {
                $name(self.0 & !other.0)
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }

        impl BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(
                    if self.contains($name::$flag) {
                        set.entry(&stringify!($flag));
                    }
                )*
                set.finish()
            }
        }
    };
}

flag_set! {
    /// Environment flags (open, set and unset)
    EnvFlags {
        /// Path names a file rather than a directory
        NO_SUBDIR = 0x4000;
        /// Skip flushing on commit
        NO_SYNC = 0x1_0000;
        READ_ONLY = 0x2_0000;
        NO_META_SYNC = 0x4_0000;
        WRITE_MAP = 0x8_0000;
        MAP_ASYNC = 0x10_0000;
        NO_TLS = 0x20_0000;
        /// Disable the engine's internal locking
        NO_LOCK = 0x40_0000;
        NO_READAHEAD = 0x80_0000;
    }
}

flag_set! {
    /// Per-transaction flags
    TxnFlags {
        READ_ONLY = 0x2_0000;
    }
}
