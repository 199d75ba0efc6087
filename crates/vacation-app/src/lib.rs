//! # Vacation Tracker
//!
//! The tracker page and its host: vacation records kept in key/value
//! storage, the page's side of the worker channel, and a bounded hosting
//! session that deploys the offline worker against an origin.

pub mod host;
pub mod page;
pub mod vacations;

pub use host::{run_session, SessionReport};
pub use page::{ApplicationPage, PageEvent};
pub use vacations::{
    validate_dates, FileStorage, KeyValueStorage, MemoryStorage, VacationError, VacationRecord,
    VacationStore,
};
