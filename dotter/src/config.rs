//! Runtime configuration of the dotter process.
//!
//! The binary assembles a [`Config`] from its command line and validates it
//! before anything is started.
use std::net::SocketAddr;

use crate::{control, logging, scheduler};

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The statically configured burst task cannot start.
    #[error("invalid burst configuration: {0}")]
    Scheduler(#[from] scheduler::Error),
    /// The control interface and the metrics exporter share an address.
    #[error("control and prometheus addresses must differ, both are {0}")]
    AddrConflict(SocketAddr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where metrics are exposed.
pub struct Telemetry {
    /// Address of the Prometheus scrape endpoint
    pub prometheus_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the burst task is driven.
pub enum Mode {
    /// Start one burst task with fixed parameters, exit when it ends.
    Static(scheduler::Config),
    /// Wait for burst tasks to be started over HTTP.
    Http(control::Config),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Main configuration struct for this program
pub struct Config {
    /// The method by which to express telemetry
    pub telemetry: Telemetry,
    /// How the burst task is driven
    pub mode: Mode,
    /// Where logs, and so emitted records, are written
    pub log: logging::Config,
}

impl Config {
    /// Check the configuration before starting anything.
    ///
    /// # Errors
    ///
    /// Returns an error if a static burst configuration is invalid or if the
    /// control interface would bind the metrics address.
    pub fn validate(&self) -> Result<(), Error> {
        match self.mode {
            Mode::Static(scheduler) => scheduler.validate()?,
            Mode::Http(control) => {
                let addr = control.binding_addr;
                if addr.port() != 0 && addr == self.telemetry.prometheus_addr {
                    return Err(Error::AddrConflict(addr));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::{Config, Error, Mode, Telemetry};
    use crate::{control, logging, scheduler};

    fn config(mode: Mode) -> Config {
        Config {
            telemetry: Telemetry {
                prometheus_addr: "0.0.0.0:9094".parse().expect("valid addr"),
            },
            mode,
            log: logging::Config::default(),
        }
    }

    #[test]
    fn static_mode_validates_burst_configuration() {
        assert_eq!(
            config(Mode::Static(scheduler::Config::new(1_000, 60))).validate(),
            Ok(())
        );
        assert_eq!(
            config(Mode::Static(scheduler::Config::new(0, 60))).validate(),
            Err(Error::Scheduler(scheduler::Error::ZeroInterval))
        );
    }

    #[test]
    fn http_mode_rejects_shared_address() {
        let control: SocketAddr = "0.0.0.0:9093".parse().expect("valid addr");
        assert_eq!(
            config(Mode::Http(control::Config::new(control))).validate(),
            Ok(())
        );

        let shared: SocketAddr = "0.0.0.0:9094".parse().expect("valid addr");
        assert_eq!(
            config(Mode::Http(control::Config::new(shared))).validate(),
            Err(Error::AddrConflict(shared))
        );
    }
}
