//! Query/Retrieve information models supported for C-MOVE.
use std::fmt;
use std::str::FromStr;

use dicom_dictionary_std::uids;
use snafu::{ensure, OptionExt, Snafu};

use crate::extneg::NegotiationMask;
use crate::options::{ConfigError, InvalidLevelSnafu, MissingLevelSnafu, MissingModelSnafu};

/// A Query/Retrieve information model,
/// identifying the SOP class of the C-MOVE request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RetrieveModel {
    /// Patient Root Query/Retrieve Information Model - MOVE
    PatientRoot,
    /// Study Root Query/Retrieve Information Model - MOVE
    StudyRoot,
    /// Patient/Study Only Query/Retrieve Information Model - MOVE (retired)
    PatientStudyOnly,
    /// Composite Instance Root Retrieve - MOVE
    CompositeInstanceRoot,
    /// Hanging Protocol Information Model - MOVE
    HangingProtocol,
    /// Color Palette Query/Retrieve Information Model - MOVE
    ColorPalette,
}

struct ModelEntry {
    selector: &'static str,
    sop_class_uid: &'static str,
    default_negotiation: NegotiationMask,
    hierarchical: bool,
}

#[allow(deprecated)]
static MODELS: [ModelEntry; 6] = [
    ModelEntry {
        selector: "patient-root",
        sop_class_uid: uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        default_negotiation: NegotiationMask::NONE,
        hierarchical: true,
    },
    ModelEntry {
        selector: "study-root",
        sop_class_uid: uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        default_negotiation: NegotiationMask::NONE,
        hierarchical: true,
    },
    ModelEntry {
        selector: "patient-study-only",
        sop_class_uid: uids::PATIENT_STUDY_ONLY_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        default_negotiation: NegotiationMask::NONE,
        hierarchical: true,
    },
    ModelEntry {
        selector: "instance-root",
        sop_class_uid: uids::COMPOSITE_INSTANCE_ROOT_RETRIEVE_MOVE,
        default_negotiation: NegotiationMask::from_bits(3),
        hierarchical: true,
    },
    ModelEntry {
        selector: "hanging-protocol",
        sop_class_uid: uids::HANGING_PROTOCOL_INFORMATION_MODEL_MOVE,
        default_negotiation: NegotiationMask::from_bits(3),
        hierarchical: false,
    },
    ModelEntry {
        selector: "color-palette",
        sop_class_uid: uids::COLOR_PALETTE_QUERY_RETRIEVE_INFORMATION_MODEL_MOVE,
        default_negotiation: NegotiationMask::from_bits(3),
        hierarchical: false,
    },
];

impl RetrieveModel {
    /// All supported information models.
    pub const ALL: [RetrieveModel; 6] = [
        RetrieveModel::PatientRoot,
        RetrieveModel::StudyRoot,
        RetrieveModel::PatientStudyOnly,
        RetrieveModel::CompositeInstanceRoot,
        RetrieveModel::HangingProtocol,
        RetrieveModel::ColorPalette,
    ];

    fn entry(self) -> &'static ModelEntry {
        &MODELS[self as usize]
    }

    /// The SOP class UID used as abstract syntax and affected SOP class.
    pub fn sop_class_uid(self) -> &'static str {
        self.entry().sop_class_uid
    }

    /// The capabilities implied by the model
    /// without any extended negotiation.
    pub fn default_negotiation(self) -> NegotiationMask {
        self.entry().default_negotiation
    }

    /// Whether the model is hierarchical,
    /// and so requires a retrieve level.
    pub fn is_hierarchical(self) -> bool {
        self.entry().hierarchical
    }

    /// The command line selector of the model.
    pub fn selector(self) -> &'static str {
        self.entry().selector
    }

    /// Check whether the given retrieve level is compatible with this model.
    pub fn check_level(self, level: Option<RetrieveLevel>) -> Result<(), ConfigError> {
        if self.is_hierarchical() {
            ensure!(level.is_some(), MissingLevelSnafu { selector: self });
        } else {
            ensure!(level.is_none(), InvalidLevelSnafu { selector: self });
        }
        Ok(())
    }
}

impl fmt::Display for RetrieveModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.selector())
    }
}

/// Resolve the information model from the selected option
/// and the retrieve level given.
///
/// Hierarchical models require a level,
/// flat models forbid one.
pub fn resolve(
    selector: Option<RetrieveModel>,
    level: Option<RetrieveLevel>,
) -> Result<RetrieveModel, ConfigError> {
    let model = selector.context(MissingModelSnafu)?;
    model.check_level(level)?;
    Ok(model)
}

/// The level of a hierarchical retrieve,
/// sent as the Query/Retrieve Level attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RetrieveLevel {
    Patient,
    Study,
    Series,
    Image,
    Frame,
}

impl RetrieveLevel {
    /// The code string of the level.
    pub fn as_str(self) -> &'static str {
        match self {
            RetrieveLevel::Patient => "PATIENT",
            RetrieveLevel::Study => "STUDY",
            RetrieveLevel::Series => "SERIES",
            RetrieveLevel::Image => "IMAGE",
            RetrieveLevel::Frame => "FRAME",
        }
    }
}

impl fmt::Display for RetrieveLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Snafu)]
#[snafu(display("unknown retrieve level `{}` (expected PATIENT|STUDY|SERIES|IMAGE|FRAME)", value))]
pub struct ParseLevelError {
    value: String,
}

impl FromStr for RetrieveLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(RetrieveLevel::Patient),
            "STUDY" => Ok(RetrieveLevel::Study),
            "SERIES" => Ok(RetrieveLevel::Series),
            "IMAGE" => Ok(RetrieveLevel::Image),
            "FRAME" => Ok(RetrieveLevel::Frame),
            _ => ParseLevelSnafu { value: s }.fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use matches::assert_matches;

    use super::*;

    #[test]
    fn model_table() {
        assert_eq!(
            RetrieveModel::StudyRoot.sop_class_uid(),
            "1.2.840.10008.5.1.4.1.2.2.2"
        );
        assert_eq!(
            RetrieveModel::CompositeInstanceRoot.sop_class_uid(),
            "1.2.840.10008.5.1.4.1.2.4.2"
        );
        assert_eq!(
            RetrieveModel::PatientStudyOnly.default_negotiation(),
            NegotiationMask::NONE
        );
        assert_eq!(
            RetrieveModel::ColorPalette.default_negotiation(),
            NegotiationMask::from_bits(3)
        );
        for model in RetrieveModel::ALL {
            let expected_default = match model {
                RetrieveModel::PatientRoot
                | RetrieveModel::StudyRoot
                | RetrieveModel::PatientStudyOnly => 0,
                _ => 3,
            };
            assert_eq!(model.default_negotiation().bits(), expected_default);
        }
    }

    #[test]
    fn hierarchical_models_require_level() {
        for model in [
            RetrieveModel::PatientRoot,
            RetrieveModel::StudyRoot,
            RetrieveModel::PatientStudyOnly,
            RetrieveModel::CompositeInstanceRoot,
        ] {
            assert_matches!(
                resolve(Some(model), None),
                Err(ConfigError::MissingLevel { selector }) if selector == model
            );
            assert_eq!(
                resolve(Some(model), Some(RetrieveLevel::Series)).unwrap(),
                model
            );
        }
    }

    #[test]
    fn flat_models_forbid_level() {
        for model in [RetrieveModel::HangingProtocol, RetrieveModel::ColorPalette] {
            assert_matches!(
                resolve(Some(model), Some(RetrieveLevel::Study)),
                Err(ConfigError::InvalidLevel { selector }) if selector == model
            );
            assert_eq!(resolve(Some(model), None).unwrap(), model);
        }
    }

    #[test]
    fn missing_model() {
        assert_matches!(
            resolve(None, Some(RetrieveLevel::Study)),
            Err(ConfigError::MissingModel)
        );
        let err = resolve(None, None).unwrap_err();
        assert_eq!(err.to_string(), "missing model");
    }

    #[test]
    fn error_messages_name_selector() {
        let err = resolve(Some(RetrieveModel::StudyRoot), None).unwrap_err();
        assert!(err.to_string().starts_with("missing-level"));
        assert!(err.to_string().contains("study-root"));

        let err = resolve(Some(RetrieveModel::HangingProtocol), Some(RetrieveLevel::Image))
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid-level"));
        assert!(err.to_string().contains("hanging-protocol"));
    }

    #[test]
    fn parse_level() {
        assert_eq!("STUDY".parse::<RetrieveLevel>().unwrap(), RetrieveLevel::Study);
        assert_eq!("frame".parse::<RetrieveLevel>().unwrap(), RetrieveLevel::Frame);
        assert!("INSTANCE".parse::<RetrieveLevel>().is_err());
        assert_eq!(RetrieveLevel::Image.to_string(), "IMAGE");
    }
}
