//! Port implementations
//!
//! - [`memory`]: in-process store and cache (tests, local runs)
//! - [`postgres`]: PostgreSQL store, failure log and bank info cache
//! - [`registry_http`]: HTTP Bank Registry client
//! - [`storage_fs`]: filesystem object storage
//! - [`json_parser`]: JSON exposure-list parser and validator
//! - [`events`]: log and channel event publishers

pub mod events;
pub mod json_parser;
pub mod memory;
pub mod postgres;
pub mod registry_http;
pub mod storage_fs;

pub use events::{ChannelEventPublisher, EventReceiver, TracingEventPublisher, event_channel};
pub use json_parser::{JsonExposureParser, JsonExposureValidator};
pub use memory::{InMemoryBankInfoCache, InMemoryBatchStore};
pub use postgres::{PgBankInfoCache, PgStore};
pub use registry_http::HttpBankRegistryClient;
pub use storage_fs::LocalObjectStorage;
