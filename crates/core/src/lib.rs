//! Volley Core - workload engine for the load generator
//!
//! This crate owns everything that is protocol-independent: payload
//! and result items, the string index, shared status counters, the
//! input source, the output pipeline, workers and the open/closed
//! workload drivers. Protocol drivers plug in through the [`Nib`]
//! trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod closed;
pub mod config;
pub mod input;
pub mod item;
pub mod nib;
pub mod open;
pub mod output;
pub mod status;
pub mod strindex;
pub mod values;
pub mod worker;
pub mod workload;

pub use config::{InputConf, OutputConf, ProtoConf, TlsConf, WorkerConf};
pub use item::{OutputItem, PayloadItem, TRANSPORT_ERROR_STATUS};
pub use nib::{DummyNib, Nib, NibMaker};
pub use status::Status;
pub use strindex::StringIndex;
pub use values::{AssertRegex, ExtractRegex, ValMap};
pub use workload::{BaseWorkload, WorkloadLevel, WorkloadMode};
