//! Campaign scheduling service and dispatch loop for Drip.
//!
//! This crate ties the pure scheduling engine to the job store:
//! - `CampaignScheduler`: schedule, pause, resume, retry, cancel, status
//! - `Dispatcher`: polls due jobs, claims them atomically, drives the transport
//! - Collaborator traits for the CRM (`EmailSource`, `OrgSettings`,
//!   `MailTransport`) plus `CrmClient`, the HTTP implementation of all three

mod crm;
mod dispatcher;
mod error;
mod service;
mod source;
mod transport;

pub use crm::CrmClient;
pub use dispatcher::{Dispatcher, DispatcherConfig, SweepStats};
pub use error::SchedulerError;
pub use service::CampaignScheduler;
pub use source::{EmailSource, OrgSettings, PendingEmail, SourceError, StaticOrgSettings};
pub use transport::{MailTransport, TransportError};
