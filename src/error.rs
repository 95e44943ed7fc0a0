//! Error types shared by the exporter.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while configuring the exporter or talking to a NUT server.
#[derive(Debug, Error)]
pub enum Error {
    /// The NUT server could not be reached.
    #[error("could not connect to NUT server {target}: {source}")]
    Connect {
        /// `host:port` that was dialed.
        target: String,
        /// Underlying client error.
        #[source]
        source: rups::ClientError,
    },

    /// The NUT server rejected the configured credentials.
    #[error("could not authenticate to NUT server as {username}: {source}")]
    Auth {
        /// Username that was rejected.
        username: String,
        /// Underlying client error.
        #[source]
        source: rups::ClientError,
    },

    /// A preselected UPS is not known to the NUT server.
    #[error("UPS {0} is not known to the NUT server")]
    UpsNotFound(String),

    /// Listing UPS devices failed.
    #[error("could not list UPS devices: {0}")]
    List(#[source] rups::ClientError),

    /// Reading the variables of a UPS failed.
    #[error("could not read variables of UPS {ups}: {source}")]
    Variables {
        /// Name of the UPS.
        ups: String,
        /// Underlying client error.
        #[source]
        source: rups::ClientError,
    },

    /// More than one UPS was found and the caller did not pick one.
    #[error("multiple UPS devices were found ({}), add a ups=<name> query parameter", .0.join(", "))]
    AmbiguousUps(Vec<String>),

    /// An on/off regular expression did not compile.
    #[error("invalid regular expression {pattern:?}: {source}")]
    InvalidRegex {
        /// Pattern as given by the operator.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// A username was configured without a password.
    #[error("username {0} is set but NUT_EXPORTER_PASSWORD is missing")]
    MissingPassword(String),

    /// An HTTP path flag is unusable.
    #[error("invalid HTTP path {0:?}: paths must start with '/' and be distinct")]
    InvalidPath(String),

    /// A scrape did not finish before its deadline. Its NUT session has been dropped.
    #[error("scrape did not finish within {0:?}")]
    Deadline(std::time::Duration),

    /// Metric descriptor or registry failure.
    #[error(transparent)]
    Prometheus(#[from] prometheus::Error),
}
