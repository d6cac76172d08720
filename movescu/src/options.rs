//! Configuration of a C-MOVE retrieve session.
//!
//! [`MoveScuOptions`] is populated before the association is opened
//! and validated into an immutable [`RetrieveSettings`],
//! which is then consumed by the [`AssociationSession`](crate::AssociationSession).
use std::path::PathBuf;
use std::time::Duration;

use dicom_ul::pdu::reader::{DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};
use snafu::{ensure, OptionExt, ResultExt, Snafu, Whatever};

use crate::command::Priority;
use crate::extneg::NegotiationMask;
use crate::model::{RetrieveLevel, RetrieveModel};
use crate::query::MatchKeys;
use crate::transfer_syntax::TransferSyntaxPolicy;

/// The default calling AE title of the SCU.
pub const DEFAULT_CALLING_AE_TITLE: &str = "MOVESCU";

/// An invalid or incomplete retrieve configuration,
/// always detected before any network activity.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ConfigError {
    /// missing model
    MissingModel,

    #[snafu(display("missing-level: retrieve level (-L) is required with --{}", selector))]
    MissingLevel { selector: RetrieveModel },

    #[snafu(display("invalid-level: retrieve level (-L) cannot be used with --{}", selector))]
    InvalidLevel { selector: RetrieveModel },

    /// missing destination: the C-MOVE destination AE title (--dest) is required
    MissingDestination,

    /// at most one of --explicit-vr, --big-endian or --implicit-vr may be used
    ConflictingTransferSyntax,

    #[snafu(display("invalid remote address `{}`", address))]
    InvalidAddress { address: String },

    #[snafu(display("invalid maximum PDU length {}", max_pdu_length))]
    InvalidMaxPduLength { max_pdu_length: u32 },

    /// invalid matching key
    InvalidKey { source: Whatever },

    #[snafu(display("could not read query file {}", path.display()))]
    ReadQueryFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// A builder for the configuration of a C-MOVE SCU session.
///
/// # Example
///
/// ```
/// # use dicom_movescu::{MoveScuOptions, RetrieveModel, RetrieveLevel};
/// # fn run() -> Result<(), dicom_movescu::ConfigError> {
/// let settings = MoveScuOptions::new()
///     .remote("STORE-SCP@10.0.0.100:104")
///     .model(RetrieveModel::StudyRoot)
///     .level(RetrieveLevel::Study)
///     .key("StudyInstanceUID=1.2.3")?
///     .destination("STORESCP")
///     .validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MoveScuOptions {
    calling_ae_title: String,
    called_ae_title: Option<String>,
    remote: Option<String>,
    max_pdu_length: u32,
    strict: bool,
    model: RetrieveModel,
    transfer_syntax: TransferSyntaxPolicy,
    negotiation: NegotiationMask,
    priority: Priority,
    destination: Option<String>,
    keys: MatchKeys,
    rsp_timeout: Option<Duration>,
}

impl Default for MoveScuOptions {
    fn default() -> Self {
        MoveScuOptions {
            calling_ae_title: DEFAULT_CALLING_AE_TITLE.to_string(),
            called_ae_title: None,
            remote: None,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: false,
            model: RetrieveModel::StudyRoot,
            transfer_syntax: TransferSyntaxPolicy::default(),
            negotiation: NegotiationMask::NONE,
            priority: Priority::default(),
            destination: None,
            keys: MatchKeys::new(),
            rsp_timeout: None,
        }
    }
}

impl MoveScuOptions {
    /// Create a new set of options,
    /// with the Study Root information model selected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Define the calling AE title of this node.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<String>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Define the called AE title,
    /// overriding any AE title in the remote address.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<String>,
    {
        self.called_ae_title = Some(called_ae_title.into());
        self
    }

    /// Define the address of the remote node,
    /// in the form `[«AE title»@]«host»:«port»`.
    pub fn remote<T>(mut self, address: T) -> Self
    where
        T: Into<String>,
    {
        self.remote = Some(address.into());
        self
    }

    /// Override the maximum PDU length that this node admits.
    pub fn max_pdu_length(mut self, max_pdu_length: u32) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Whether to reject incoming PDUs larger than the maximum PDU length.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Select the Query/Retrieve information model.
    pub fn model(mut self, model: RetrieveModel) -> Self {
        self.model = model;
        self
    }

    /// Define the retrieve level.
    pub fn level(mut self, level: RetrieveLevel) -> Self {
        self.keys.set_level(level);
        self
    }

    /// Select the transfer syntax proposal policy.
    pub fn transfer_syntax(mut self, policy: TransferSyntaxPolicy) -> Self {
        self.transfer_syntax = policy;
        self
    }

    /// Enable or disable relational retrieval
    /// through extended negotiation.
    pub fn relational_retrieve(mut self, enable: bool) -> Self {
        self.negotiation
            .set(NegotiationMask::RELATIONAL_RETRIEVE, enable);
        self
    }

    /// Define the priority of the C-MOVE requests.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Define the AE title of the C-MOVE destination.
    pub fn destination<T>(mut self, destination: T) -> Self
    where
        T: Into<String>,
    {
        self.destination = Some(destination.into());
        self
    }

    /// Add a matching key term in the form `«tag»=«value»`.
    pub fn key(mut self, term: &str) -> Result<Self, ConfigError> {
        self.keys.add_term(term).context(InvalidKeySnafu)?;
        Ok(self)
    }

    /// Add several matching key terms.
    pub fn keys<T>(mut self, terms: &[T]) -> Result<Self, ConfigError>
    where
        T: AsRef<str>,
    {
        self.keys.add_terms(terms).context(InvalidKeySnafu)?;
        Ok(self)
    }

    /// Add the matching key terms in a text file,
    /// one per line.
    /// Blank lines and lines starting with `#` are ignored.
    pub fn query_file(self, path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).context(ReadQueryFileSnafu { path })?;
        let terms: Vec<_> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect();
        self.keys(&terms)
    }

    /// Define the maximum time to wait for each C-MOVE response.
    /// If no response arrives in time, the association is aborted.
    pub fn rsp_timeout(mut self, timeout: Duration) -> Self {
        self.rsp_timeout = Some(timeout);
        self
    }

    /// Validate the options into retrieve settings.
    pub fn validate(self) -> Result<RetrieveSettings, ConfigError> {
        let MoveScuOptions {
            calling_ae_title,
            called_ae_title,
            remote,
            max_pdu_length,
            strict,
            model,
            transfer_syntax,
            negotiation,
            priority,
            destination,
            keys,
            rsp_timeout,
        } = self;

        model.check_level(keys.level())?;
        let destination = destination
            .filter(|dest| !dest.trim().is_empty())
            .context(MissingDestinationSnafu)?;
        let remote = remote.context(InvalidAddressSnafu { address: "" })?;
        ensure!(
            !remote.is_empty(),
            InvalidAddressSnafu {
                address: remote.clone()
            }
        );
        ensure!(
            (MINIMUM_PDU_SIZE..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
            InvalidMaxPduLengthSnafu { max_pdu_length }
        );

        Ok(RetrieveSettings {
            calling_ae_title,
            called_ae_title,
            remote,
            max_pdu_length,
            strict,
            model,
            transfer_syntax,
            negotiation,
            priority,
            destination,
            keys,
            rsp_timeout,
        })
    }
}

/// Validated configuration of a retrieve session.
#[derive(Debug, Clone)]
pub struct RetrieveSettings {
    pub(crate) calling_ae_title: String,
    pub(crate) called_ae_title: Option<String>,
    pub(crate) remote: String,
    pub(crate) max_pdu_length: u32,
    pub(crate) strict: bool,
    pub(crate) model: RetrieveModel,
    pub(crate) transfer_syntax: TransferSyntaxPolicy,
    pub(crate) negotiation: NegotiationMask,
    pub(crate) priority: Priority,
    pub(crate) destination: String,
    pub(crate) keys: MatchKeys,
    pub(crate) rsp_timeout: Option<Duration>,
}

impl RetrieveSettings {
    /// The selected information model.
    pub fn model(&self) -> RetrieveModel {
        self.model
    }

    /// The selected transfer syntax policy.
    pub fn transfer_syntax(&self) -> TransferSyntaxPolicy {
        self.transfer_syntax
    }

    /// The extended negotiation capabilities requested by the user.
    pub fn negotiation(&self) -> NegotiationMask {
        self.negotiation
    }

    /// The priority of each C-MOVE request.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// The C-MOVE destination AE title.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The accumulated matching keys.
    pub fn keys(&self) -> &MatchKeys {
        &self.keys
    }

    /// The remote node address.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

#[cfg(test)]
mod tests {
    use dicom_dictionary_std::tags;
    use matches::assert_matches;

    use super::*;

    fn base_options() -> MoveScuOptions {
        MoveScuOptions::new().remote("127.0.0.1:11112")
    }

    #[test]
    fn defaults_to_study_root() {
        let settings = base_options()
            .level(RetrieveLevel::Study)
            .destination("STORESCP")
            .validate()
            .unwrap();
        assert_eq!(settings.model(), RetrieveModel::StudyRoot);
        assert_eq!(settings.transfer_syntax(), TransferSyntaxPolicy::ImplicitFirst);
        assert_eq!(settings.priority(), Priority::Medium);
        assert_eq!(settings.negotiation(), NegotiationMask::NONE);
        assert_eq!(settings.calling_ae_title, "MOVESCU");
    }

    #[test]
    fn destination_is_required() {
        let err = base_options()
            .level(RetrieveLevel::Study)
            .validate()
            .unwrap_err();
        assert_matches!(err, ConfigError::MissingDestination);
        assert!(err.to_string().starts_with("missing destination"));
    }

    #[test]
    fn level_is_checked_against_model() {
        assert_matches!(
            base_options().destination("X").validate(),
            Err(ConfigError::MissingLevel { .. })
        );
        assert_matches!(
            base_options()
                .model(RetrieveModel::ColorPalette)
                .level(RetrieveLevel::Image)
                .destination("X")
                .validate(),
            Err(ConfigError::InvalidLevel { .. })
        );
        assert!(base_options()
            .model(RetrieveModel::ColorPalette)
            .destination("X")
            .validate()
            .is_ok());
    }

    #[test]
    fn relational_toggle() {
        let settings = base_options()
            .relational_retrieve(true)
            .level(RetrieveLevel::Patient)
            .destination("X")
            .validate()
            .unwrap();
        assert_eq!(settings.negotiation(), NegotiationMask::RELATIONAL_RETRIEVE);

        let settings = base_options()
            .relational_retrieve(true)
            .relational_retrieve(false)
            .level(RetrieveLevel::Patient)
            .destination("X")
            .validate()
            .unwrap();
        assert_eq!(settings.negotiation(), NegotiationMask::NONE);
    }

    #[test]
    fn invalid_pdu_length() {
        assert_matches!(
            base_options()
                .level(RetrieveLevel::Study)
                .destination("X")
                .max_pdu_length(1024)
                .validate(),
            Err(ConfigError::InvalidMaxPduLength { max_pdu_length: 1024 })
        );
    }

    #[test]
    fn keys_from_query_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("query.txt");
        std::fs::write(
            &path,
            "# study of interest\nStudyInstanceUID=1.2.3\n\n  PatientID=P01  \n",
        )
        .unwrap();

        let settings = base_options()
            .query_file(&path)
            .unwrap()
            .level(RetrieveLevel::Study)
            .destination("X")
            .validate()
            .unwrap();
        let keys = settings.keys();
        assert!(keys.get(tags::STUDY_INSTANCE_UID).is_some());
        assert!(keys.get(tags::PATIENT_ID).is_some());

        assert_matches!(
            base_options().query_file(dir.path().join("missing.txt")),
            Err(ConfigError::ReadQueryFile { .. })
        );
    }
}
