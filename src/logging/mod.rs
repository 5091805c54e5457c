// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Facility/severity structured logging for querierd.
//!
//! A cloneable `Logger` handle writes through a `LogSink`; the default
//! sink emits one JSON object per line on stderr. Interface tasks take a
//! derived handle so every entry carries the interface name.

mod facility;
mod logger;
#[macro_use]
mod macros;
mod severity;

pub use facility::Facility;
pub use logger::{LogEntry, LogSink, Logger, MemorySink, StderrJsonSink};
pub use severity::Severity;
