//! Capability negotiation: a version pair plus a feature bitmask.

/// Bit 0: the peer understands and will send a capabilities frame.
pub const CAP_CAPABILITIES_SUPPORTED: u32 = 1 << 0;
/// Bit 1: the peer honors `0x12` cancel-messages frames.
pub const CAP_CANCEL_MESSAGE: u32 = 1 << 1;
/// Bit 31: a capability-extension record follows (reserved, unused by this core).
pub const CAP_EXTENSION_PRESENT: u32 = 1 << 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySet {
    pub major_version: u16,
    pub minor_version: u16,
    pub capability_bits: u32,
}

impl CapabilitySet {
    pub const fn new(major_version: u16, minor_version: u16, capability_bits: u32) -> Self {
        CapabilitySet {
            major_version,
            minor_version,
            capability_bits,
        }
    }

    /// A freshly constructed connection's peer capabilities: unknown, so zero.
    pub const fn zero() -> Self {
        CapabilitySet::new(0, 0, 0)
    }

    /// What this library advertises: version 1.1, capability-exchange and
    /// cancel-message support.
    pub const LOCAL: CapabilitySet =
        CapabilitySet::new(1, 1, CAP_CAPABILITIES_SUPPORTED | CAP_CANCEL_MESSAGE);

    /// `bits = a.bits AND b.bits`; version is the lexicographically lower
    /// `(major, minor)` pair of the two sides.
    pub fn negotiate(a: CapabilitySet, b: CapabilitySet) -> CapabilitySet {
        let bits = a.capability_bits & b.capability_bits;
        let (major_version, minor_version) =
            if (a.major_version, a.minor_version) <= (b.major_version, b.minor_version) {
                (a.major_version, a.minor_version)
            } else {
                (b.major_version, b.minor_version)
            };
        CapabilitySet {
            major_version,
            minor_version,
            capability_bits: bits,
        }
    }

    pub fn supports_capabilities(&self) -> bool {
        self.capability_bits & CAP_CAPABILITIES_SUPPORTED != 0
    }

    pub fn supports_cancel_message(&self) -> bool {
        self.capability_bits & CAP_CANCEL_MESSAGE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_ands_the_bits() {
        let a = CapabilitySet::new(1, 1, CAP_CAPABILITIES_SUPPORTED | CAP_CANCEL_MESSAGE);
        let b = CapabilitySet::new(1, 1, CAP_CAPABILITIES_SUPPORTED);
        let n = CapabilitySet::negotiate(a, b);
        assert_eq!(n.capability_bits, CAP_CAPABILITIES_SUPPORTED);
        assert!(!n.supports_cancel_message());
    }

    #[test]
    fn negotiate_picks_lower_version() {
        let a = CapabilitySet::new(2, 0, CAP_CANCEL_MESSAGE);
        let b = CapabilitySet::new(1, 5, CAP_CANCEL_MESSAGE);
        let n = CapabilitySet::negotiate(a, b);
        assert_eq!((n.major_version, n.minor_version), (1, 5));
    }

    #[test]
    fn negotiate_same_major_lower_minor_wins() {
        let a = CapabilitySet::new(1, 4, 0);
        let b = CapabilitySet::new(1, 1, 0);
        let n = CapabilitySet::negotiate(a, b);
        assert_eq!((n.major_version, n.minor_version), (1, 1));
    }

    #[test]
    fn local_capabilities_match_spec() {
        assert_eq!(CapabilitySet::LOCAL.major_version, 1);
        assert_eq!(CapabilitySet::LOCAL.minor_version, 1);
        assert!(CapabilitySet::LOCAL.supports_capabilities());
        assert!(CapabilitySet::LOCAL.supports_cancel_message());
    }
}
