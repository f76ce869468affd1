//! Crate for the `apm-transport` project: the intake transport of an APM agent.
//!
//! [`transport::Transport`] batches transactions, spans, errors and metricsets
//! into compressed ndjson uploads to an Elastic APM Server, polls the server
//! for central configuration and reports failures on an [`event_bus::EventBus`].
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_copy_implementations)]
#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod central_config;
pub mod config;
pub mod drain;
pub mod event_bus;
pub mod http;
pub mod intake;
pub mod logger;
pub mod metadata;
pub mod server_info;
pub mod transport;

pub use config::{Config, ConfigError};
pub use event_bus::{EventBus, TransportEvent};
pub use intake::{EventKind, RequestError};
pub use transport::{FlushError, FlushOptions, Transport};
