//! Transfer syntax proposal policies.
use dicom_dictionary_std::uids::{EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN};
use snafu::ensure;

use crate::options::{ConfigError, ConflictingTransferSyntaxSnafu};

#[allow(deprecated)]
const EXPLICIT_VR_BIG_ENDIAN: &str = dicom_dictionary_std::uids::EXPLICIT_VR_BIG_ENDIAN;

static IVR_LE_FIRST: [&str; 3] = [
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
];

static EVR_LE_FIRST: [&str; 3] = [
    EXPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
];

static EVR_BE_FIRST: [&str; 3] = [
    EXPLICIT_VR_BIG_ENDIAN,
    EXPLICIT_VR_LITTLE_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
];

static IVR_LE_ONLY: [&str; 1] = [IMPLICIT_VR_LITTLE_ENDIAN];

/// The ordered list of transfer syntaxes
/// proposed in the presentation context.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferSyntaxPolicy {
    /// Implicit VR Little Endian first, then explicit VR little and big endian
    #[default]
    ImplicitFirst,
    /// Explicit VR Little Endian first
    ExplicitLittleFirst,
    /// Explicit VR Big Endian first
    ExplicitBigFirst,
    /// Implicit VR Little Endian only
    ImplicitOnly,
}

impl TransferSyntaxPolicy {
    /// Choose the policy from the mutually exclusive command line flags.
    pub fn select(
        explicit_vr: bool,
        big_endian: bool,
        implicit_vr: bool,
    ) -> Result<Self, ConfigError> {
        let count = [explicit_vr, big_endian, implicit_vr]
            .iter()
            .filter(|f| **f)
            .count();
        ensure!(count <= 1, ConflictingTransferSyntaxSnafu);

        Ok(if explicit_vr {
            TransferSyntaxPolicy::ExplicitLittleFirst
        } else if big_endian {
            TransferSyntaxPolicy::ExplicitBigFirst
        } else if implicit_vr {
            TransferSyntaxPolicy::ImplicitOnly
        } else {
            TransferSyntaxPolicy::ImplicitFirst
        })
    }

    /// The transfer syntax UIDs to propose, by order of preference.
    pub fn transfer_syntaxes(self) -> &'static [&'static str] {
        match self {
            TransferSyntaxPolicy::ImplicitFirst => &IVR_LE_FIRST,
            TransferSyntaxPolicy::ExplicitLittleFirst => &EVR_LE_FIRST,
            TransferSyntaxPolicy::ExplicitBigFirst => &EVR_BE_FIRST,
            TransferSyntaxPolicy::ImplicitOnly => &IVR_LE_ONLY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TransferSyntaxPolicy;

    const IVR_LE: &str = "1.2.840.10008.1.2";
    const EVR_LE: &str = "1.2.840.10008.1.2.1";
    const EVR_BE: &str = "1.2.840.10008.1.2.2";

    #[test]
    fn default_ordering() {
        let policy = TransferSyntaxPolicy::select(false, false, false).unwrap();
        assert_eq!(policy, TransferSyntaxPolicy::default());
        assert_eq!(policy.transfer_syntaxes(), &[IVR_LE, EVR_LE, EVR_BE]);
    }

    #[test]
    fn flag_orderings() {
        let policy = TransferSyntaxPolicy::select(true, false, false).unwrap();
        assert_eq!(policy.transfer_syntaxes(), &[EVR_LE, EVR_BE, IVR_LE]);

        let policy = TransferSyntaxPolicy::select(false, true, false).unwrap();
        assert_eq!(policy.transfer_syntaxes(), &[EVR_BE, EVR_LE, IVR_LE]);

        let policy = TransferSyntaxPolicy::select(false, false, true).unwrap();
        assert_eq!(policy.transfer_syntaxes(), &[IVR_LE]);
    }

    #[test]
    fn conflicting_flags() {
        assert!(TransferSyntaxPolicy::select(true, true, false).is_err());
        assert!(TransferSyntaxPolicy::select(true, false, true).is_err());
        assert!(TransferSyntaxPolicy::select(true, true, true).is_err());
    }
}
