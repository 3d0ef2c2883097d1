//! # Internal Macros
//!
//! Accessor generators for zerocopy structs whose fields use little-endian
//! wrapper types (`U16`, `U32`, `U64`). Every persisted header in settdb is
//! written through these wrappers so the on-disk format is byte-identical on
//! big-endian hosts.
//!
//! ```ignore
//! use zerocopy::little_endian::{U32, U64};
//!
//! #[repr(C)]
//! struct NodeLeader {
//!     flags: U32,
//!     count: U32,
//!     ptr_down: U64,
//! }
//!
//! impl NodeLeader {
//!     zerocopy_accessors! {
//!         flags: u32,
//!         count: u32,
//!         ptr_down: u64,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use zerocopy::little_endian::{U16, U32, U64};

    #[repr(C)]
    struct Probe {
        a: U16,
        b: U32,
        c: U64,
    }

    impl Probe {
        zerocopy_accessors! {
            a: u16,
            b: u32,
            c: u64,
        }
    }

    #[test]
    fn accessors_round_trip_values() {
        let mut p = Probe {
            a: U16::new(0),
            b: U32::new(0),
            c: U64::new(0),
        };

        p.set_a(0x1234);
        p.set_b(0xDEAD_BEEF);
        p.set_c(0x0123_4567_89AB_CDEF);

        assert_eq!(p.a(), 0x1234);
        assert_eq!(p.b(), 0xDEAD_BEEF);
        assert_eq!(p.c(), 0x0123_4567_89AB_CDEF);
    }
}
