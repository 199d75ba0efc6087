//! # Vacation Tracker Offline Worker
//!
//! Offline caching and messaging for the vacation tracker, modeled as an
//! embeddable library instead of browser callbacks.
//!
//! ## Features
//!
//! - **Lifecycle**: install, activate, fetch as an explicit state machine
//! - **Cache generations**: one per version, stale ones removed on activate
//! - **Fetch interception**: cache first, network second, offline shell for navigations
//! - **Messaging**: periodic `update` broadcast, acknowledged page messages
//!
//! ## Architecture
//!
//! ```text
//! Registration (host)
//!     ├── installing (ServiceWorker)
//!     ├── waiting (ServiceWorker)
//!     ├── active (ServiceWorker + heartbeat + inbox task)
//!     └── Clients
//!             └── PageEndpoint
//!
//! CacheStore
//!     └── "<app-name>-<version>"
//!             └── RequestKey → CacheEntry
//! ```

pub mod cache;
pub mod config;
pub mod error;
mod fetch;
pub mod messaging;
pub mod network;
pub mod registration;
pub mod request;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStore, MemoryCacheStore};
pub use config::WorkerConfig;
pub use error::{CacheError, NetworkError, ServiceWorkerError};
pub use messaging::{
    ClientId, Clients, Controller, Envelope, Heartbeat, Message, MessageKind, PageEndpoint,
};
pub use network::{HttpNetwork, Network};
pub use registration::{Registration, RegistrationStatus};
pub use request::{FetchRequest, FetchResponse, RequestKey, RequestMode};
pub use worker::{ActivationReport, ServiceWorker, ServiceWorkerId, WorkerState};
