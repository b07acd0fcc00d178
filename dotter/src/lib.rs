//! The dotter synthetic log traffic generator.
//!
//! This library supports the dotter binary found elsewhere in this project.
//! dotter writes a constant log record in timed bursts so that downstream log
//! shippers, indexers and storage can be measured at a known rate. The burst
//! schedule is owned by [`scheduler::Scheduler`] and may be replaced or
//! stopped at runtime through [`control::Control`].

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod control;
pub mod counter;
pub mod emitter;
pub mod logging;
pub mod scheduler;
