//! rollcall-ledger: Durable identities and daily attendance.
//!
//! Enforces at most one presence event per identity per calendar day.

pub mod ledger;
pub mod schema;

pub use ledger::{AttendanceEvent, AttendanceStatus, Ledger, LedgerError, PresenceOutcome};
