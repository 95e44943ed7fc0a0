#![deny(missing_docs)]

//! # nut-exporter
//!
//! A Prometheus exporter for UPS devices managed by Network UPS Tools (NUT). Every scrape of the
//! UPS metrics path opens a fresh session with the NUT server, reads the variables of one UPS and
//! exports them as gauges.
//!
//! A single exporter can front many UPSes: the `ups`, `server`, `serverport`, `username`,
//! `password`, `variables` and `statuses` query parameters override the configured defaults, and
//! each distinct `<server>:<port>/<ups>` target gets its own registry.

pub mod collector;
pub mod config;
pub mod error;
pub mod http;
pub mod nut;
pub mod translate;

pub use collector::NutCollector;
pub use config::{Args, Credentials, QueryOverlay, ScrapeOptions, WebPaths};
pub use error::{Error, Result};
pub use http::{AppState, TargetHandler, router};
pub use nut::{Connector, NutClient, RupsConnector, Variable, VariableValue};
pub use translate::{DeviceInfo, Sample, Translator};
