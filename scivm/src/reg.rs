//! Reg: the VM's tagged 32-bit cell, a 16-bit segment plus a 16-bit offset.
//!
//! segment == 0 means "plain integer" and arithmetic is ordinary 16-bit
//! wrapping arithmetic. A nonzero segment means "heap reference"; arithmetic
//! then is pointer arithmetic within that segment.

use std::fmt;

/// Index into the segment manager's segment table. 0 is reserved and means
/// "no segment".
pub type SegmentId = u16;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Reg {
    pub segment: SegmentId,
    pub offset: u16,
}

pub const NULL_REG: Reg = Reg {
    segment: 0,
    offset: 0,
};

/// signals "the signal" in SCI scripts, `ldi -1` compares against this
pub const SIGNAL_REG: Reg = Reg {
    segment: 0xFFFF,
    offset: 0xFFFF,
};

#[inline]
pub const fn make_reg(segment: SegmentId, offset: u16) -> Reg {
    Reg { segment, offset }
}

impl Reg {
    #[inline]
    pub fn is_null(&self) -> bool {
        self.segment == 0 && self.offset == 0
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        self.segment == 0
    }

    #[inline]
    pub fn is_pointer(&self) -> bool {
        self.segment != 0
    }

    #[inline]
    pub fn to_u16(self) -> u16 {
        self.offset
    }

    #[inline]
    pub fn to_i16(self) -> i16 {
        self.offset.cast_signed()
    }

    /// Reads the value as a plain integer, warning when a pointer leaks into
    /// arithmetic. The offset is still used so broken scripts keep running.
    pub fn require_u16(self) -> u16 {
        if self.is_pointer() {
            log::warn!("arithmetic on pointer {self:?}, using offset");
        }
        self.offset
    }

    pub fn require_i16(self) -> i16 {
        if self.is_pointer() {
            log::warn!("arithmetic on pointer {self:?}, using offset");
        }
        self.offset.cast_signed()
    }

    #[inline]
    pub fn incr_offset(&mut self, delta: i16) {
        self.offset = self.offset.wrapping_add(delta.cast_unsigned());
    }

    #[inline]
    pub fn with_offset(self, offset: u16) -> Reg {
        make_reg(self.segment, offset)
    }

    /// Pointer-aware addition. int + int wraps at 16 bit, ptr + int moves
    /// within the segment, ptr + ptr of different segments is rejected
    /// (warned) and degrades to offset arithmetic.
    pub fn add(self, other: Reg) -> Reg {
        match (self.is_pointer(), other.is_pointer()) {
            (false, false) => make_reg(0, self.offset.wrapping_add(other.offset)),
            (true, false) => make_reg(self.segment, self.offset.wrapping_add(other.offset)),
            (false, true) => make_reg(other.segment, other.offset.wrapping_add(self.offset)),
            (true, true) => {
                if self.segment == other.segment {
                    make_reg(self.segment, self.offset.wrapping_add(other.offset))
                } else {
                    log::warn!("adding pointers of different segments: {self:?} + {other:?}");
                    make_reg(self.segment, self.offset.wrapping_add(other.offset))
                }
            }
        }
    }

    /// Pointer-aware subtraction. ptr - ptr of the same segment yields the
    /// plain integer offset difference.
    pub fn sub(self, other: Reg) -> Reg {
        match (self.is_pointer(), other.is_pointer()) {
            (false, false) => make_reg(0, self.offset.wrapping_sub(other.offset)),
            (true, false) => make_reg(self.segment, self.offset.wrapping_sub(other.offset)),
            (true, true) if self.segment == other.segment => {
                make_reg(0, self.offset.wrapping_sub(other.offset))
            }
            _ => {
                log::warn!("subtracting pointers of different segments: {self:?} - {other:?}");
                make_reg(self.segment, self.offset.wrapping_sub(other.offset))
            }
        }
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.segment, self.offset)
    }
}

impl From<u16> for Reg {
    fn from(value: u16) -> Self {
        make_reg(0, value)
    }
}

impl From<i16> for Reg {
    fn from(value: i16) -> Self {
        make_reg(0, value.cast_unsigned())
    }
}
