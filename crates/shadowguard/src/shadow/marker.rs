use core::fmt;

/// One shadow byte. Values below 8 are (partially) addressable, everything
/// with the high bit set is poisoned.
///
/// Block markers carry extra information: the block start marker stores
/// `user_size % 8` in its low three bits and a nested flag in bit 3, and the
/// block end marker stores the nested flag in bit 0. A marker whose 0x20 bit
/// has been cleared is *historic*: it once belonged to a block that has since
/// been released and is kept only for diagnostics.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ShadowMarker(pub u8);

/// Coarse classification of a marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkerKind {
    Addressable,
    /// The first `n` bytes of the granule are addressable.
    PartiallyAddressable(u8),
    AsanInternal,
    InvalidAddress,
    UserRedzone,
    BlockHeader,
    LeftRedzone,
    RightRedzone,
    Reserved,
    FreedByte,
    Historic,
    Unknown,
}

const NON_ADDRESSABLE_MASK: u8 = 0x80;
const HISTORIC_BIT: u8 = 0x20;
const BLOCK_START_MASK: u8 = 0xF0;
const BLOCK_START_NESTED_BIT: u8 = 0x08;
const BLOCK_START_DATA_MASK: u8 = 0x07;
const BLOCK_END_MASK: u8 = 0xFE;
const BLOCK_END_NESTED_BIT: u8 = 0x01;

impl ShadowMarker {
    pub const ADDRESSABLE: Self = Self(0x00);
    pub const BLOCK_START: Self = Self(0xE0);
    pub const NESTED_BLOCK_START: Self = Self(0xE8);
    pub const ASAN_INTERNAL: Self = Self(0xF1);
    pub const INVALID_ADDRESS: Self = Self(0xF2);
    pub const USER_REDZONE: Self = Self(0xF3);
    pub const BLOCK_END: Self = Self(0xF4);
    pub const NESTED_BLOCK_END: Self = Self(0xF5);
    pub const LEFT_REDZONE: Self = Self(0xFA);
    pub const RIGHT_REDZONE: Self = Self(0xFB);
    pub const RESERVED: Self = Self(0xFC);
    pub const FREED: Self = Self(0xFD);

    /// Partially addressable granule: first `bytes` bytes are accessible.
    #[inline]
    pub const fn partial(bytes: u8) -> Self {
        debug_assert!(bytes < 8);
        Self(bytes)
    }

    /// Marker for the first granule of a block.
    #[inline]
    pub const fn block_start(nested: bool, body_size: usize) -> Self {
        let mut v = Self::BLOCK_START.0 | (body_size as u8 & BLOCK_START_DATA_MASK);
        if nested {
            v |= BLOCK_START_NESTED_BIT;
        }
        Self(v)
    }

    /// Marker for the last granule of a block.
    #[inline]
    pub const fn block_end(nested: bool) -> Self {
        if nested {
            Self(Self::BLOCK_END.0 | BLOCK_END_NESTED_BIT)
        } else {
            Self::BLOCK_END
        }
    }

    #[inline]
    pub const fn is_addressable(self) -> bool {
        self.0 < 8
    }

    /// Number of addressable bytes in the granule (8 for fully addressable).
    #[inline]
    pub const fn addressable_bytes(self) -> usize {
        match self.0 {
            0 => 8,
            n if n < 8 => n as usize,
            _ => 0,
        }
    }

    #[inline]
    pub const fn is_poisoned(self) -> bool {
        self.0 & NON_ADDRESSABLE_MASK != 0
    }

    #[inline]
    pub const fn is_block_start(self) -> bool {
        self.0 & BLOCK_START_MASK == Self::BLOCK_START.0
    }

    #[inline]
    pub const fn is_nested_block_start(self) -> bool {
        self.is_block_start() && self.0 & BLOCK_START_NESTED_BIT != 0
    }

    /// `user_size % 8` of the block this marker starts.
    #[inline]
    pub const fn block_start_data(self) -> u8 {
        self.0 & BLOCK_START_DATA_MASK
    }

    #[inline]
    pub const fn is_block_end(self) -> bool {
        self.0 & BLOCK_END_MASK == Self::BLOCK_END.0
    }

    #[inline]
    pub const fn is_nested_block_end(self) -> bool {
        self.is_block_end() && self.0 & BLOCK_END_NESTED_BIT != 0
    }

    /// Part of a block's left side: the start marker or left redzone.
    #[inline]
    pub const fn is_left_redzone(self) -> bool {
        self.0 == Self::LEFT_REDZONE.0 || self.is_block_start()
    }

    /// Part of a block's right side: right redzone or the end marker.
    #[inline]
    pub const fn is_right_redzone(self) -> bool {
        self.0 == Self::RIGHT_REDZONE.0 || self.is_block_end()
    }

    #[inline]
    pub const fn is_redzone(self) -> bool {
        self.is_left_redzone() || self.is_right_redzone() || self.0 == Self::USER_REDZONE.0
    }

    /// A marker that belongs to a live (allocated or quarantined) block.
    #[inline]
    pub const fn is_active_block(self) -> bool {
        self.is_redzone() && self.0 != Self::USER_REDZONE.0 || self.0 == Self::FREED.0
    }

    #[inline]
    pub const fn is_historic(self) -> bool {
        self.0 & HISTORIC_BIT == 0 && Self(self.0 | HISTORIC_BIT).is_active_block()
    }

    /// Historic form of an active block marker; other markers map to themselves.
    #[inline]
    pub const fn to_historic(self) -> Self {
        if self.is_active_block() {
            Self(self.0 & !HISTORIC_BIT)
        } else {
            self
        }
    }

    pub const fn kind(self) -> MarkerKind {
        match self.0 {
            0 => MarkerKind::Addressable,
            n if n < 8 => MarkerKind::PartiallyAddressable(n),
            0xF1 => MarkerKind::AsanInternal,
            0xF2 => MarkerKind::InvalidAddress,
            0xF3 => MarkerKind::UserRedzone,
            0xFA => MarkerKind::LeftRedzone,
            0xFB => MarkerKind::RightRedzone,
            0xFC => MarkerKind::Reserved,
            0xFD => MarkerKind::FreedByte,
            _ if self.is_block_start() => MarkerKind::BlockHeader,
            _ if self.is_block_end() => MarkerKind::RightRedzone,
            _ if self.is_historic() => MarkerKind::Historic,
            _ => MarkerKind::Unknown,
        }
    }
}

impl fmt::Debug for ShadowMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShadowMarker({:#04x}, {:?})", self.0, self.kind())
    }
}

impl fmt::Display for ShadowMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Legend printed under shadow dumps.
pub const LEGEND: &[(&str, ShadowMarker)] = &[
    ("Addressable", ShadowMarker::ADDRESSABLE),
    ("Asan memory byte", ShadowMarker::ASAN_INTERNAL),
    ("Invalid address", ShadowMarker::INVALID_ADDRESS),
    ("User redzone", ShadowMarker::USER_REDZONE),
    ("Block start", ShadowMarker::BLOCK_START),
    ("Nested block start", ShadowMarker::NESTED_BLOCK_START),
    ("Block end", ShadowMarker::BLOCK_END),
    ("Nested block end", ShadowMarker::NESTED_BLOCK_END),
    ("Heap left redzone", ShadowMarker::LEFT_REDZONE),
    ("Heap right redzone", ShadowMarker::RIGHT_REDZONE),
    ("Reserved", ShadowMarker::RESERVED),
    ("Freed heap region", ShadowMarker::FREED),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_markers_encode_size_and_nesting() {
        let m = ShadowMarker::block_start(true, 13);
        assert!(m.is_block_start());
        assert!(m.is_nested_block_start());
        assert_eq!(m.block_start_data(), 5);
        assert!(m.is_left_redzone());
        assert!(!m.is_addressable());

        let e = ShadowMarker::block_end(false);
        assert!(e.is_block_end());
        assert!(!e.is_nested_block_end());
        assert!(e.is_right_redzone());
        assert_eq!(e.kind(), MarkerKind::RightRedzone);

        let n = ShadowMarker::block_end(true);
        assert_eq!(n, ShadowMarker::NESTED_BLOCK_END);
        assert!(n.is_block_end());
        assert!(n.is_nested_block_end());
    }

    #[test]
    fn historic_markers_are_not_block_markers() {
        for m in [
            ShadowMarker::block_start(false, 3),
            ShadowMarker::BLOCK_END,
            ShadowMarker::LEFT_REDZONE,
            ShadowMarker::RIGHT_REDZONE,
            ShadowMarker::FREED,
        ] {
            let h = m.to_historic();
            assert_ne!(h, m);
            assert!(h.is_historic(), "{:?}", h);
            assert!(!h.is_block_start() && !h.is_block_end());
            assert_eq!(h.kind(), MarkerKind::Historic);
        }
        assert_eq!(ShadowMarker::INVALID_ADDRESS.to_historic(), ShadowMarker::INVALID_ADDRESS);
        assert!(!ShadowMarker::ADDRESSABLE.is_historic());
    }

    #[test]
    fn partial_granules() {
        assert_eq!(ShadowMarker::partial(5).addressable_bytes(), 5);
        assert_eq!(ShadowMarker::ADDRESSABLE.addressable_bytes(), 8);
        assert_eq!(ShadowMarker::FREED.addressable_bytes(), 0);
        assert_eq!(ShadowMarker::partial(5).kind(), MarkerKind::PartiallyAddressable(5));
    }
}
