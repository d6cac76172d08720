//! SOP class extended negotiation for retrieve services.
//!
//! The Query/Retrieve service class defines a set of optional capabilities
//! which an SCU may request in the
//! SOP Class Extended Negotiation sub-item of the association request.
//! Each capability is a single byte toggled to `1` when requested.
use std::ops::BitOr;

/// A bitmask of optional retrieve capabilities.
///
/// Bit _i_ of the mask maps to byte _i_
/// of the service class application information field.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NegotiationMask(u8);

impl NegotiationMask {
    /// No optional capabilities.
    pub const NONE: NegotiationMask = NegotiationMask(0);

    /// Relational retrieval.
    pub const RELATIONAL_RETRIEVE: NegotiationMask = NegotiationMask(1);

    /// Create a mask from its raw bits.
    pub const fn from_bits(bits: u8) -> Self {
        NegotiationMask(bits)
    }

    /// Obtain the raw bits of the mask.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether all bits of `flag` are set in this mask.
    pub const fn contains(self, flag: NegotiationMask) -> bool {
        self.0 & flag.0 == flag.0
    }

    /// Enable or disable the bits of `flag`.
    pub fn set(&mut self, flag: NegotiationMask, enable: bool) {
        if enable {
            self.0 |= flag.0;
        } else {
            self.0 &= !flag.0;
        }
    }

    /// Encode the mask into the
    /// service class application information field
    /// of a SOP class extended negotiation sub-item.
    ///
    /// A mask with only relational retrieval requested
    /// is encoded in its short, single byte form.
    /// Otherwise, three bytes are produced
    /// (four if bit 3 is set),
    /// one per capability, least significant bit first.
    ///
    /// # Example
    ///
    /// ```
    /// # use dicom_movescu::NegotiationMask;
    /// assert_eq!(NegotiationMask::RELATIONAL_RETRIEVE.to_info(), vec![1]);
    /// assert_eq!(NegotiationMask::from_bits(3).to_info(), vec![1, 1, 0]);
    /// ```
    pub fn to_info(self) -> Vec<u8> {
        if self == NegotiationMask::RELATIONAL_RETRIEVE {
            return vec![1];
        }
        let len = if self.0 & 0b1000 == 0 { 3 } else { 4 };
        (0..len).map(|i| (self.0 >> i) & 1).collect()
    }
}

impl BitOr for NegotiationMask {
    type Output = NegotiationMask;

    fn bitor(self, rhs: NegotiationMask) -> NegotiationMask {
        NegotiationMask(self.0 | rhs.0)
    }
}

impl From<u8> for NegotiationMask {
    fn from(bits: u8) -> Self {
        NegotiationMask(bits)
    }
}
