//! A DICOM C-MOVE service class user.
//!
//! This crate negotiates an association with a Query/Retrieve SCP
//! and issues C-MOVE requests,
//! asking the peer to send the matching instances
//! to a third application entity (the move destination).
//!
//! - The [`model`] module enumerates the supported
//!   Query/Retrieve information models.
//! - The [`extneg`] module encodes the optional retrieve capabilities
//!   sent in the SOP class extended negotiation sub-item.
//! - The [`transfer_syntax`] module defines which transfer syntaxes
//!   are proposed, and in which order.
//! - The [`query`] module builds the identifier of each request.
//! - The [`session`] module holds the association session,
//!   through which retrieve operations are issued
//!   and their responses dispatched.
//!
//! # Example
//!
//! ```no_run
//! # fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use dicom_movescu::{AssociationSession, Device, MoveScuOptions, RetrieveLevel, RetrieveModel};
//!
//! let settings = MoveScuOptions::new()
//!     .remote("QR-SCP@10.0.0.100:104")
//!     .model(RetrieveModel::StudyRoot)
//!     .level(RetrieveLevel::Study)
//!     .key("StudyInstanceUID=1.2.3")?
//!     .destination("STORE-SCP")
//!     .validate()?;
//!
//! let runtime = tokio::runtime::Runtime::new()?;
//! let device = Device::from_handle(runtime.handle().clone());
//! let mut session = AssociationSession::new(device, settings);
//! session.open()?;
//! session.retrieve_keys(|rsp| {
//!     println!("status {:04X}H, {:?} completed", rsp.status_code(), rsp.completed());
//! })?;
//! session.close()?;
//! # Ok(())
//! # }
//! ```
pub mod command;
pub mod extneg;
pub mod model;
pub mod options;
pub mod query;
pub mod session;
pub mod transfer_syntax;
pub mod transport;

pub use command::{status_description, MoveResponse, MoveStatus, Priority};
pub use extneg::NegotiationMask;
pub use model::{resolve, RetrieveLevel, RetrieveModel};
pub use options::{ConfigError, MoveScuOptions, RetrieveSettings};
pub use query::MatchKeys;
pub use session::{AssociationSession, Device};
pub use transfer_syntax::TransferSyntaxPolicy;
