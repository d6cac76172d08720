//! C-MOVE DIMSE messages:
//! request construction and response interpretation.
use dicom_core::{dicom_value, DataElement, PrimitiveValue, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::TransferSyntax;
use dicom_object::{InMemDicomObject, StandardDataDictionary};
use dicom_transfer_syntax_registry::entries;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use snafu::{OptionExt, ResultExt, Snafu};

/// Command field of a C-MOVE-RQ message.
pub const C_MOVE_RQ: u16 = 0x0021;
/// Command field of a C-MOVE-RSP message.
pub const C_MOVE_RSP: u16 = 0x8021;
/// Command data set type value signalling that no data set follows.
pub const NO_DATA_SET: u16 = 0x0101;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ResponseError {
    #[snafu(display("missing attribute {} in response command", name))]
    MissingAttribute { name: &'static str, tag: Tag },

    #[snafu(display("could not convert attribute {} in response command", name))]
    ConvertField {
        name: &'static str,
        source: dicom_core::value::ConvertValueError,
    },

    #[snafu(display("unexpected command field {:#06x} in response", command_field))]
    UnexpectedCommand { command_field: u16 },

    /// could not read response command
    ReadCommand { source: dicom_object::ReadError },

    /// could not read response data set
    ReadDataSet { source: dicom_object::ReadError },

    /// received a data set fragment with no command before it
    UnexpectedDataSet,

    /// received a data set without a negotiated transfer syntax
    MissingTransferSyntax,
}

/// The priority of a DIMSE request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Priority {
    #[default]
    Medium,
    High,
    Low,
}

impl Priority {
    /// The value of the Priority (0000,0700) command attribute.
    pub fn value(self) -> u16 {
        match self {
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
            Priority::Low => 0x0002,
        }
    }
}

impl TryFrom<u16> for Priority {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0000 => Ok(Priority::Medium),
            0x0001 => Ok(Priority::High),
            0x0002 => Ok(Priority::Low),
            _ => Err(value),
        }
    }
}

/// Build the command set of a C-MOVE-RQ message.
pub fn move_req_command(
    sop_class_uid: &str,
    move_destination: &str,
    message_id: u16,
    priority: Priority,
) -> InMemDicomObject<StandardDataDictionary> {
    InMemDicomObject::command_from_element_iter([
        // SOP Class UID
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            PrimitiveValue::from(sop_class_uid),
        ),
        // command field
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [C_MOVE_RQ]),
        ),
        // message ID
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        // priority
        DataElement::new(
            tags::PRIORITY,
            VR::US,
            dicom_value!(U16, [priority.value()]),
        ),
        // data set type: identifier follows
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        // move destination
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            PrimitiveValue::from(move_destination),
        ),
    ])
}

/// The category of a C-MOVE response status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MoveStatus {
    /// sub-operations are continuing
    Pending,
    /// all sub-operations complete without failures
    Success,
    /// sub-operations complete, with one or more failures or warnings
    Warning,
    /// sub-operations terminated due to a cancel indication
    Cancel,
    /// the retrieve failed
    Failure,
}

impl MoveStatus {
    /// Classify a status code.
    pub fn from_code(status: u16) -> MoveStatus {
        match status {
            0x0000 => MoveStatus::Success,
            0xFF00 | 0xFF01 => MoveStatus::Pending,
            0xFE00 => MoveStatus::Cancel,
            0x0001 | 0x0107 | 0x0116 | 0xB000..=0xBFFF => MoveStatus::Warning,
            _ => MoveStatus::Failure,
        }
    }

    /// Whether no more responses follow one with this status.
    pub fn is_final(self) -> bool {
        self != MoveStatus::Pending
    }
}

/// A human readable description of a C-MOVE status code.
pub fn status_description(status: u16) -> &'static str {
    match status {
        0x0000 => "Sub-operations complete, no failures",
        0xFF00 | 0xFF01 => "Sub-operations are continuing",
        0xFE00 => "Sub-operations terminated due to cancel indication",
        0xB000 => "Sub-operations complete with one or more failures",
        0xA701 => "Out of resources (number of matches)",
        0xA702 => "Out of resources (sub-operations)",
        0x0122 => "SOP class not supported",
        0xA801 => "Move destination unknown",
        0xA900 => "Identifier does not match SOP class",
        0xC000..=0xCFFF => "Unable to process",
        _ => match MoveStatus::from_code(status) {
            MoveStatus::Warning => "Warning",
            _ => "Unknown status code",
        },
    }
}

/// A C-MOVE-RSP message.
#[derive(Debug, Clone)]
pub struct MoveResponse {
    message_id: u16,
    status: u16,
    remaining: Option<u16>,
    completed: Option<u16>,
    failed: Option<u16>,
    warning: Option<u16>,
    error_comment: Option<String>,
    command: InMemDicomObject,
    data: Option<InMemDicomObject>,
}

impl MoveResponse {
    /// Interpret a received command set
    /// and optional data set as a C-MOVE response.
    pub fn new(
        command: InMemDicomObject,
        data: Option<InMemDicomObject>,
    ) -> Result<Self, ResponseError> {
        let command_field = required_u16(&command, tags::COMMAND_FIELD, "CommandField")?;
        snafu::ensure!(
            command_field == C_MOVE_RSP,
            UnexpectedCommandSnafu { command_field }
        );
        let message_id = required_u16(
            &command,
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            "MessageIDBeingRespondedTo",
        )?;
        let status = required_u16(&command, tags::STATUS, "Status")?;

        let error_comment = command
            .get(tags::ERROR_COMMENT)
            .and_then(|e| e.to_str().ok())
            .map(|s| s.trim().to_string());

        Ok(MoveResponse {
            message_id,
            status,
            remaining: optional_u16(&command, tags::NUMBER_OF_REMAINING_SUBOPERATIONS),
            completed: optional_u16(&command, tags::NUMBER_OF_COMPLETED_SUBOPERATIONS),
            failed: optional_u16(&command, tags::NUMBER_OF_FAILED_SUBOPERATIONS),
            warning: optional_u16(&command, tags::NUMBER_OF_WARNING_SUBOPERATIONS),
            error_comment,
            command,
            data,
        })
    }

    /// The message ID of the request that this responds to.
    pub fn message_id(&self) -> u16 {
        self.message_id
    }

    /// The raw status code.
    pub fn status_code(&self) -> u16 {
        self.status
    }

    /// The status category.
    pub fn status(&self) -> MoveStatus {
        MoveStatus::from_code(self.status)
    }

    /// Whether this is the last response of the operation.
    pub fn is_final(&self) -> bool {
        self.status().is_final()
    }

    pub fn remaining(&self) -> Option<u16> {
        self.remaining
    }

    pub fn completed(&self) -> Option<u16> {
        self.completed
    }

    pub fn failed(&self) -> Option<u16> {
        self.failed
    }

    pub fn warning(&self) -> Option<u16> {
        self.warning
    }

    pub fn error_comment(&self) -> Option<&str> {
        self.error_comment.as_deref()
    }

    /// The full response command set.
    pub fn command(&self) -> &InMemDicomObject {
        &self.command
    }

    /// The response data set, if any.
    /// Usually only present on failure,
    /// listing the failed SOP instance UIDs.
    pub fn data(&self) -> Option<&InMemDicomObject> {
        self.data.as_ref()
    }

    /// The failed SOP instance UIDs reported in the response data set.
    pub fn failed_sop_instances(&self) -> Vec<String> {
        self.data
            .as_ref()
            .and_then(|d| d.get(tags::FAILED_SOP_INSTANCE_UID_LIST))
            .and_then(|e| e.to_multi_str().ok())
            .map(|uids| {
                uids.iter()
                    .map(|uid| uid.trim_end_matches(['\0', ' ']).to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Reassembles DIMSE messages from P-DATA value fragments.
///
/// Command sets are always in Implicit VR Little Endian,
/// data sets in the transfer syntax negotiated for the presentation context.
pub struct MessageAssembler {
    ts: Option<&'static TransferSyntax>,
    command_buf: Vec<u8>,
    data_buf: Vec<u8>,
    command: Option<InMemDicomObject>,
}

impl MessageAssembler {
    pub fn new(ts: Option<&'static TransferSyntax>) -> Self {
        MessageAssembler {
            ts,
            command_buf: Vec::new(),
            data_buf: Vec::new(),
            command: None,
        }
    }

    /// Feed the next fragment,
    /// obtaining a response once a full message was received.
    pub fn push(&mut self, pdv: PDataValue) -> Result<Option<MoveResponse>, ResponseError> {
        match pdv.value_type {
            PDataValueType::Command => {
                self.command_buf.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let command = InMemDicomObject::read_dataset_with_ts(
                    &self.command_buf[..],
                    &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .context(ReadCommandSnafu)?;
                self.command_buf.clear();

                if optional_u16(&command, tags::COMMAND_DATA_SET_TYPE) == Some(NO_DATA_SET) {
                    MoveResponse::new(command, None).map(Some)
                } else {
                    self.command = Some(command);
                    Ok(None)
                }
            }
            PDataValueType::Data => {
                snafu::ensure!(self.command.is_some(), UnexpectedDataSetSnafu);
                self.data_buf.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(None);
                }
                let ts = self.ts.context(MissingTransferSyntaxSnafu)?;
                let data = InMemDicomObject::read_dataset_with_ts(&self.data_buf[..], ts)
                    .context(ReadDataSetSnafu)?;
                self.data_buf.clear();
                let command = self.command.take().context(UnexpectedDataSetSnafu)?;
                MoveResponse::new(command, Some(data)).map(Some)
            }
        }
    }
}

fn required_u16(obj: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16, ResponseError> {
    obj.get(tag)
        .context(MissingAttributeSnafu { name, tag })?
        .to_int::<u16>()
        .context(ConvertFieldSnafu { name })
}

fn optional_u16(obj: &InMemDicomObject, tag: Tag) -> Option<u16> {
    obj.get(tag).and_then(|e| e.to_int::<u16>().ok())
}
