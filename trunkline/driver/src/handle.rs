#![allow(non_snake_case)]

use modular_bitfield_msb::prelude::*;

/// The resource a [`Handle`] refers to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, BitfieldSpecifier)]
#[bits=4]
pub enum HandleKind {
    SyncSlot = 1,
    CrossConnect = 2,
    EchoChannel = 3,
}

/// Reference to a driver-owned resource slot.
///
/// `generation` changes whenever the slot is reused or its owner is
/// rebuilt, so a handle kept across such a change compares unequal to the
/// current one and is rejected as stale.
///
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    pub kind: HandleKind,
    pub generation: u16,
    pub index: u16,
}

/// Largest generation value that survives packing.
pub const GENERATION_MASK: u16 = 0x0fff;

#[bitfield(bits=32)]
#[repr(u32)]
#[derive(Copy, Clone, Debug)]
struct PackedHandle {
    KIND: HandleKind,
    GENERATION: B12,
    INDEX: B16,
}

impl Handle {
    pub fn new(kind: HandleKind, generation: u16, index: u16) -> Self {
        Self {
            kind,
            generation: generation & GENERATION_MASK,
            index,
        }
    }

    pub fn pack(self) -> u32 {
        PackedHandle::new()
            .with_KIND(self.kind)
            .with_GENERATION(self.generation & GENERATION_MASK)
            .with_INDEX(self.index)
            .into()
    }

    pub fn unpack(value: u32) -> Option<Self> {
        let packed = PackedHandle::from(value);
        let kind = packed.KIND_or_err().ok()?;
        Some(Self {
            kind,
            generation: packed.GENERATION(),
            index: packed.INDEX(),
        })
    }
}

/// Advance a 12-bit generation counter.
pub fn next_generation(generation: u16) -> u16 {
    generation.wrapping_add(1) & GENERATION_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout() {
        let handle = Handle::new(HandleKind::CrossConnect, 0x123, 0x00ff);
        assert_eq!(handle.pack(), 0x2123_00ff);
        assert_eq!(Handle::unpack(0x2123_00ff), Some(handle));
    }

    #[test]
    fn unpack_rejects_unknown_kind() {
        assert_eq!(Handle::unpack(0xf000_0000), None);
        assert_eq!(Handle::unpack(0x0000_0001), None);
    }

    #[test]
    fn generation_wraps_at_twelve_bits() {
        assert_eq!(next_generation(0x0ffe), 0x0fff);
        assert_eq!(next_generation(0x0fff), 0x0000);
    }
}
