//! Command line configuration and the per-scrape option model.

use crate::error::{Error, Result};
use clap::Parser;
use log::warn;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default configuration options
const DEFAULT_SERVER: &str = "127.0.0.1";
const DEFAULT_SERVER_PORT: u16 = 3493;
const DEFAULT_VARIABLES: &str =
    "battery.charge,battery.voltage,battery.voltage.nominal,input.voltage,input.voltage.nominal,ups.load,ups.status";
const DEFAULT_STATUSES: &str = "OL,OB,LB,HB,RB,CHRG,DISCHRG,BYPASS,CAL,OFF,OVER,TRIM,BOOST,FSD,SD";
const DEFAULT_ON_REGEX: &str = "^(enable|enabled|on|true|active|activated)$";
const DEFAULT_OFF_REGEX: &str = "^(disable|disabled|off|false|inactive|deactivated)$";
const DEFAULT_NAMESPACE: &str = "network_ups_tools";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_LISTEN_ADDRESS: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 9199);
const DEFAULT_TELEMETRY_PATH: &str = "/ups_metrics";
const DEFAULT_EXPORTER_TELEMETRY_PATH: &str = "/metrics";

/// Environment variable holding the NUT password. There is deliberately no flag for it.
pub const PASSWORD_ENV: &str = "NUT_EXPORTER_PASSWORD";

/// A collection of arguments to be parsed from the command line or environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "nut_exporter", version, about, long_about = None)]
pub struct Args {
    /// Hostname or IP address of the NUT server to query.
    #[arg(long = "nut.server", env = "NUT_EXPORTER_SERVER", default_value = DEFAULT_SERVER)]
    pub server: String,
    /// Port of the NUT server.
    #[arg(long = "nut.serverport", env = "NUT_EXPORTER_SERVERPORT", default_value_t = DEFAULT_SERVER_PORT)]
    pub server_port: u16,
    /// If set, authenticate to the NUT server with this username. The password must be set in
    /// the `NUT_EXPORTER_PASSWORD` environment variable.
    #[arg(long = "nut.username", env = "NUT_EXPORTER_USERNAME")]
    pub username: Option<String>,
    /// Comma separated list of variables to export. Empty exports every numeric variable.
    #[arg(long = "nut.vars_enable", env = "NUT_EXPORTER_VARIABLES", default_value = DEFAULT_VARIABLES)]
    pub variables: String,
    /// Comma separated list of `ups.status` flags that are always exported, as 0 when NUT does
    /// not report them.
    #[arg(long = "nut.statuses", env = "NUT_EXPORTER_STATUSES", default_value = DEFAULT_STATUSES)]
    pub statuses: String,
    /// Case insensitive regular expression for string values exported as 1.
    #[arg(long = "nut.on_regex", env = "NUT_EXPORTER_ON_REGEX", default_value = DEFAULT_ON_REGEX)]
    pub on_regex: String,
    /// Case insensitive regular expression for string values exported as 0.
    #[arg(long = "nut.off_regex", env = "NUT_EXPORTER_OFF_REGEX", default_value = DEFAULT_OFF_REGEX)]
    pub off_regex: String,
    /// Do not export the `device_info` metric.
    #[arg(long = "nut.disable_device_info", env = "NUT_EXPORTER_DISABLE_DEVICE_INFO")]
    pub disable_device_info: bool,
    /// Seconds a scrape may spend talking to the NUT server.
    #[arg(long = "nut.timeout", env = "NUT_EXPORTER_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: u64,
    /// Prefix of every exported UPS metric.
    #[arg(long = "metrics.namespace", env = "NUT_EXPORTER_METRICS_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
    /// Address on which the exporter will serve metrics.
    #[arg(long = "web.listen-address", env = "NUT_EXPORTER_WEB_LISTEN_ADDRESS", default_value_t = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: SocketAddr,
    /// Path under which UPS metrics are served.
    #[arg(long = "web.telemetry-path", env = "NUT_EXPORTER_WEB_TELEMETRY_PATH", default_value = DEFAULT_TELEMETRY_PATH)]
    pub telemetry_path: String,
    /// Path under which metrics about the exporter itself are served.
    #[arg(long = "web.exporter-telemetry-path", env = "NUT_EXPORTER_WEB_EXPORTER_TELEMETRY_PATH", default_value = DEFAULT_EXPORTER_TELEMETRY_PATH)]
    pub exporter_telemetry_path: String,
    /// Print the metrics this exporter declares and exit.
    #[arg(long = "printMetrics", env = "NUT_EXPORTER_PRINT_METRICS")]
    pub print_metrics: bool,
}

impl Args {
    /// Build the process-wide default scrape options. `password` comes from the environment.
    pub fn scrape_options(&self, password: Option<String>) -> Result<ScrapeOptions> {
        let credentials = match (non_empty(self.username.as_deref()), password.filter(|p| !p.is_empty())) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.to_string(),
                password,
            }),
            (Some(username), None) => return Err(Error::MissingPassword(username.to_string())),
            (None, _) => None,
        };

        let variables = parse_list(&self.variables);
        if !variables.is_empty() && !variables.iter().any(|v| v == STATUS_VARIABLE) {
            warn!("Variable list does not include {STATUS_VARIABLE}, online/battery status will not be exported");
        }

        Ok(ScrapeOptions {
            namespace: self.namespace.clone(),
            server: self.server.clone(),
            server_port: self.server_port,
            ups: None,
            credentials,
            variables,
            statuses: parse_list(&self.statuses),
            on_regex: non_empty(Some(self.on_regex.as_str())).map(str::to_string),
            off_regex: non_empty(Some(self.off_regex.as_str())).map(str::to_string),
            disable_device_info: self.disable_device_info,
            timeout: Duration::from_secs(self.timeout),
        })
    }

    /// The UPS and exporter metrics paths, validated for use as routes.
    pub fn web_paths(&self) -> Result<WebPaths> {
        for path in [&self.telemetry_path, &self.exporter_telemetry_path] {
            if !path.starts_with('/') || path == "/" {
                return Err(Error::InvalidPath(path.clone()));
            }
        }
        if self.telemetry_path == self.exporter_telemetry_path {
            return Err(Error::InvalidPath(self.telemetry_path.clone()));
        }
        Ok(WebPaths {
            ups: self.telemetry_path.clone(),
            exporter: self.exporter_telemetry_path.clone(),
        })
    }
}

/// Name of the variable carrying the UPS status flags.
pub const STATUS_VARIABLE: &str = "ups.status";

/// Routes served by the exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebPaths {
    /// Path of the UPS metrics.
    pub ups: String,
    /// Path of the exporter's own metrics.
    pub exporter: String,
}

impl Default for WebPaths {
    fn default() -> Self {
        Self {
            ups: DEFAULT_TELEMETRY_PATH.to_string(),
            exporter: DEFAULT_EXPORTER_TELEMETRY_PATH.to_string(),
        }
    }
}

/// Username and password for a NUT server.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Sent with `USERNAME`.
    pub username: String,
    /// Sent with `PASSWORD`.
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a single scrape needs to know.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOptions {
    /// Prefix of every metric name.
    pub namespace: String,
    /// NUT server host.
    pub server: String,
    /// NUT server port.
    pub server_port: u16,
    /// UPS to scrape. When unset, the server must expose exactly one UPS.
    pub ups: Option<String>,
    /// Credentials to authenticate with.
    pub credentials: Option<Credentials>,
    /// Variables to export, empty exports everything.
    pub variables: Vec<String>,
    /// Status flags that are always exported.
    pub statuses: Vec<String>,
    /// Pattern for string values exported as 1.
    pub on_regex: Option<String>,
    /// Pattern for string values exported as 0.
    pub off_regex: Option<String>,
    /// Skip the `device_info` metric.
    pub disable_device_info: bool,
    /// Deadline for building a target's collector and for each scrape, NUT session included.
    pub timeout: Duration,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            server: DEFAULT_SERVER.to_string(),
            server_port: DEFAULT_SERVER_PORT,
            ups: None,
            credentials: None,
            variables: parse_list(DEFAULT_VARIABLES),
            statuses: parse_list(DEFAULT_STATUSES),
            on_regex: Some(DEFAULT_ON_REGEX.to_string()),
            off_regex: Some(DEFAULT_OFF_REGEX.to_string()),
            disable_device_info: false,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl ScrapeOptions {
    /// Apply query string overrides on top of these options. Blank values are ignored.
    #[must_use]
    pub fn overlay(&self, query: &QueryOverlay) -> Self {
        let mut options = self.clone();

        if let Some(ups) = non_empty(query.ups.as_deref()) {
            options.ups = Some(ups.to_string());
        }
        if let Some(server) = non_empty(query.server.as_deref()) {
            options.server = server.to_string();
        }
        if let Some(port) = non_empty(query.serverport.as_deref()) {
            match port.parse() {
                Ok(port) => options.server_port = port,
                Err(err) => warn!("Ignoring invalid serverport {port:?}: {err}"),
            }
        }

        let username = non_empty(query.username.as_deref())
            .map(str::to_string)
            .or_else(|| self.credentials.as_ref().map(|c| c.username.clone()));
        let password = non_empty(query.password.as_deref())
            .map(str::to_string)
            .or_else(|| self.credentials.as_ref().map(|c| c.password.clone()));
        options.credentials = match (username, password) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (Some(username), None) => {
                warn!("Username {username} was requested without a password, not authenticating");
                None
            }
            (None, _) => None,
        };

        if let Some(variables) = non_empty(query.variables.as_deref()) {
            options.variables = parse_list(variables);
        }
        if let Some(statuses) = non_empty(query.statuses.as_deref()) {
            options.statuses = parse_list(statuses);
        }
        options
    }

    /// Key of the handler cache entry serving these options: `<server>:<port>/<ups>`.
    #[must_use]
    pub fn cache_key(&self) -> String {
        format!("{}:{}/{}", self.server, self.server_port, self.ups.as_deref().unwrap_or_default())
    }
}

/// Optional per-request overrides taken from the query string.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct QueryOverlay {
    /// UPS to scrape.
    pub ups: Option<String>,
    /// NUT server host.
    pub server: Option<String>,
    /// NUT server port. Kept as text so a bad value is ignored instead of rejecting the request.
    pub serverport: Option<String>,
    /// Username to authenticate with.
    pub username: Option<String>,
    /// Password to authenticate with.
    pub password: Option<String>,
    /// Comma separated variables to export.
    pub variables: Option<String>,
    /// Comma separated status flags to always export.
    pub statuses: Option<String>,
}

/// Split a comma separated list, trimming whitespace and dropping empty items.
#[must_use]
pub fn parse_list(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["nut_exporter"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let options = args(&[]).scrape_options(None).unwrap();
        assert_eq!(ScrapeOptions::default(), options);
        assert_eq!("network_ups_tools", options.namespace);
        assert_eq!(3493, options.server_port);
        assert_eq!(7, options.variables.len());
        assert_eq!(15, options.statuses.len());
        assert_eq!(Some("OL"), options.statuses.first().map(String::as_str));
    }

    #[test]
    fn username_without_password_is_rejected() {
        let result = args(&["--nut.username", "monuser"]).scrape_options(None);
        assert!(matches!(result, Err(Error::MissingPassword(name)) if name == "monuser"));
    }

    #[test]
    fn username_with_password() {
        let options = args(&["--nut.username", "monuser"])
            .scrape_options(Some("secret".to_string()))
            .unwrap();
        let credentials = options.credentials.unwrap();
        assert_eq!("monuser", credentials.username);
        assert_eq!("secret", credentials.password);
        assert!(!format!("{credentials:?}").contains("secret"));
    }

    #[test]
    fn password_without_username_is_unused() {
        let options = args(&[]).scrape_options(Some("secret".to_string())).unwrap();
        assert_eq!(None, options.credentials);
    }

    #[test]
    fn empty_regex_disables_coercion() {
        let options = args(&["--nut.on_regex", "", "--nut.off_regex", ""]).scrape_options(None).unwrap();
        assert_eq!(None, options.on_regex);
        assert_eq!(None, options.off_regex);
    }

    #[test]
    fn empty_variable_list_allows_all() {
        let options = args(&["--nut.vars_enable", ""]).scrape_options(None).unwrap();
        assert!(options.variables.is_empty());
    }

    #[test]
    fn parse_list_trims_and_drops_blanks() {
        assert_eq!(vec!["OL", "OB", "LB"], parse_list(" OL, OB,,LB ,"));
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn overlay_replaces_non_blank_values() {
        let defaults = ScrapeOptions::default();
        let query = QueryOverlay {
            ups: Some("rack1".to_string()),
            server: Some("nut.example.com".to_string()),
            serverport: Some("3494".to_string()),
            variables: Some("battery.charge, ups.load".to_string()),
            statuses: Some("OL,OB".to_string()),
            ..QueryOverlay::default()
        };

        let options = defaults.overlay(&query);
        assert_eq!(Some("rack1".to_string()), options.ups);
        assert_eq!("nut.example.com", options.server);
        assert_eq!(3494, options.server_port);
        assert_eq!(vec!["battery.charge", "ups.load"], options.variables);
        assert_eq!(vec!["OL", "OB"], options.statuses);
        assert_eq!(defaults.namespace, options.namespace);
        assert_eq!(defaults.on_regex, options.on_regex);
    }

    #[test]
    fn overlay_ignores_blank_values() {
        let defaults = ScrapeOptions::default();
        let query = QueryOverlay {
            ups: Some(String::new()),
            server: Some("  ".to_string()),
            variables: Some(String::new()),
            ..QueryOverlay::default()
        };
        assert_eq!(defaults, defaults.overlay(&query));
    }

    #[test]
    fn overlay_ignores_invalid_port() {
        let defaults = ScrapeOptions::default();
        let query = QueryOverlay {
            serverport: Some("not-a-port".to_string()),
            ..QueryOverlay::default()
        };
        assert_eq!(3493, defaults.overlay(&query).server_port);
    }

    #[test]
    fn overlay_credentials() {
        let defaults = ScrapeOptions {
            credentials: Some(Credentials {
                username: "monuser".to_string(),
                password: "secret".to_string(),
            }),
            ..ScrapeOptions::default()
        };

        let query = QueryOverlay {
            password: Some("other".to_string()),
            ..QueryOverlay::default()
        };
        let credentials = defaults.overlay(&query).credentials.unwrap();
        assert_eq!("monuser", credentials.username);
        assert_eq!("other", credentials.password);

        let query = QueryOverlay {
            username: Some("admin".to_string()),
            ..QueryOverlay::default()
        };
        assert_eq!(None, ScrapeOptions::default().overlay(&query).credentials);
    }

    #[test]
    fn cache_key_includes_ups() {
        let mut options = ScrapeOptions::default();
        assert_eq!("127.0.0.1:3493/", options.cache_key());
        options.ups = Some("rack1".to_string());
        assert_eq!("127.0.0.1:3493/rack1", options.cache_key());
    }

    #[test]
    fn web_paths_are_validated() {
        assert_eq!(WebPaths::default(), args(&[]).web_paths().unwrap());
        assert!(args(&["--web.telemetry-path", "metrics"]).web_paths().is_err());
        assert!(args(&["--web.telemetry-path", "/metrics"]).web_paths().is_err());
        assert!(args(&["--web.exporter-telemetry-path", "/"]).web_paths().is_err());
    }
}
