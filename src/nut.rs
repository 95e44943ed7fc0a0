//! The NUT client seam.
//!
//! Scrapes talk to a NUT server through the [`Connector`] and [`NutClient`] traits so the scrape
//! logic can be exercised without a real server. [`RupsConnector`] is the production
//! implementation backed by the async `rups` client.

use crate::config::Credentials;
use async_trait::async_trait;
use log::debug;
use rups::ClientError;
use rups::tokio::Connection;
use std::fmt;
use std::io;

/// Opens sessions to a NUT server.
///
/// Operations wait for the server as long as it takes; callers bound them with a deadline and
/// drop the session, which closes its socket.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Dial `server:port`.
    async fn connect(&self, server: &str, port: u16) -> Result<Box<dyn NutClient>, ClientError>;
}

/// A single open session with a NUT server. Dropping it closes the socket.
#[async_trait]
pub trait NutClient: Send {
    /// Send `USERNAME` and `PASSWORD` for this session.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ClientError>;

    /// `LIST UPS`, returning the UPS names in server order.
    async fn list_ups(&mut self) -> Result<Vec<String>, ClientError>;

    /// `LIST VAR <ups>`, returning raw `(name, value)` pairs in server order.
    async fn list_vars(&mut self, ups: &str) -> Result<Vec<(String, String)>, ClientError>;

    /// `GET DESC <ups> <var>`.
    async fn describe(&mut self, ups: &str, variable: &str) -> Result<String, ClientError>;

    /// `LOGOUT` and close the socket. Later calls on the session fail.
    async fn logout(&mut self) -> Result<(), ClientError>;
}

/// The value of a UPS variable, typed by what it actually parses as.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// A boolean reading.
    Bool(bool),
    /// An integer reading.
    Int(i64),
    /// A floating point reading.
    Float(f64),
    /// Anything else, kept verbatim.
    String(String),
}

impl VariableValue {
    /// Type a raw protocol value. `enabled` and `disabled` are booleans, integers win over floats
    /// and anything else stays a string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "enabled" => return Self::Bool(true),
            "disabled" => return Self::Bool(false),
            _ => {}
        }
        // f64 parsing accepts "inf" and "nan", which NUT never means as numbers
        if !trimmed.bytes().any(|b| b.is_ascii_digit()) {
            return Self::String(raw.to_string());
        }
        if let Ok(value) = trimmed.parse::<i64>() {
            Self::Int(value)
        } else if let Ok(value) = trimmed.parse::<f64>() {
            Self::Float(value)
        } else {
            Self::String(raw.to_string())
        }
    }

    /// Name of the variant, used when logging values that could not be exported.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
        }
    }
}

/// A named UPS variable as read during a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Dotted name, e.g. `battery.charge`.
    pub name: String,
    /// Typed value.
    pub value: VariableValue,
    /// Type tag declared by the server, if it was asked for. Advisory only.
    pub kind: Option<String>,
    /// Human readable description from `GET DESC`.
    pub description: String,
}

impl Variable {
    /// Build a variable from the raw protocol pair, without a description.
    #[must_use]
    pub fn parse(name: &str, raw: &str) -> Self {
        Self {
            name: name.to_string(),
            value: VariableValue::parse(raw),
            kind: None,
            description: String::new(),
        }
    }

    /// Attach a description fetched from the server.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// [`Connector`] for real NUT servers using the async `rups` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct RupsConnector;

#[async_trait]
impl Connector for RupsConnector {
    async fn connect(&self, server: &str, port: u16) -> Result<Box<dyn NutClient>, ClientError> {
        let client = RupsClient {
            conn: Some(open_connection(server, port, None).await?),
            server: server.to_string(),
            port,
        };
        Ok(Box::new(client))
    }
}

async fn open_connection(server: &str, port: u16, credentials: Option<&Credentials>) -> Result<Connection, ClientError> {
    let host = rups::Host::try_from((server.to_string(), port))?;
    let auth = credentials.map(|c| rups::Auth::new(c.username.clone(), Some(c.password.clone())));
    let config = rups::ConfigBuilder::new().with_host(host).with_auth(auth).build();
    Connection::new(&config).await
}

/// A session backed by `rups`. `rups` only sends `USERNAME`/`PASSWORD` while opening a
/// connection, so authenticating swaps in a fresh authenticated connection.
struct RupsClient {
    conn: Option<Connection>,
    server: String,
    port: u16,
}

impl RupsClient {
    fn conn(&mut self) -> Result<&mut Connection, ClientError> {
        self.conn
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }
}

#[async_trait]
impl NutClient for RupsClient {
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), ClientError> {
        let authenticated = open_connection(&self.server, self.port, Some(credentials)).await?;
        if let Some(anonymous) = self.conn.replace(authenticated) {
            if let Err(err) = anonymous.close().await {
                debug!("Failed to close anonymous NUT connection: {err}");
            }
        }
        Ok(())
    }

    async fn list_ups(&mut self) -> Result<Vec<String>, ClientError> {
        Ok(self.conn()?.list_ups().await?.into_iter().map(|(name, _)| name).collect())
    }

    async fn list_vars(&mut self, ups: &str) -> Result<Vec<(String, String)>, ClientError> {
        Ok(self
            .conn()?
            .list_vars(ups)
            .await?
            .iter()
            .map(|var| (var.name().to_string(), var.value()))
            .collect())
    }

    async fn describe(&mut self, ups: &str, variable: &str) -> Result<String, ClientError> {
        self.conn()?.get_var_description(ups, variable).await
    }

    async fn logout(&mut self) -> Result<(), ClientError> {
        match self.conn.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
