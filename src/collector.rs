//! Scrape engine that reads one UPS from a NUT server and turns its variables into metric
//! families.

use crate::config::ScrapeOptions;
use crate::error::{Error, Result};
use crate::nut::{Connector, NutClient, Variable};
use crate::translate::{DEVICE_LABELS, DeviceInfo, Sample, Translator, metric_name};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prometheus::core::Desc;
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

const SCRAPE_FAILURE_HELP: &str = "Failure gathering UPS variables";
const AMBIGUOUS_UPS_HELP: &str = "Multiple UPS devices were found from NUT. Please add a ups=<name> query string";
const DEVICE_INFO_HELP: &str = "UPS Device information";

/// Collector bound to a single NUT server and, once known, a single UPS.
///
/// Nothing is cached between scrapes except metric descriptors, so every scrape reflects the
/// current state of the UPS.
#[derive(Debug)]
pub struct NutCollector {
    options: Mutex<ScrapeOptions>,
    translator: Translator,
    device_info: Option<Desc>,
    descriptors: Mutex<HashMap<String, Desc>>,
    connector: Arc<dyn Connector>,
}

impl NutCollector {
    /// Build a collector for `options`.
    ///
    /// Fails when an on/off pattern does not compile, or when a preselected UPS is not listed by a
    /// reachable NUT server. An unreachable server is only logged, it may come back before the
    /// first scrape.
    pub async fn new(options: ScrapeOptions, connector: Arc<dyn Connector>) -> Result<Self> {
        let translator = Translator::new(&options)?;
        let device_info = if options.disable_device_info {
            None
        } else {
            Some(Desc::new(
                metric_name(&options.namespace, "device_info"),
                DEVICE_INFO_HELP.to_string(),
                DEVICE_LABELS.iter().map(ToString::to_string).collect(),
                HashMap::new(),
            )?)
        };

        if let Some(ups) = &options.ups {
            verify_ups(connector.as_ref(), &options, ups).await?;
        }

        Ok(Self {
            options: Mutex::new(options),
            translator,
            device_info,
            descriptors: Mutex::new(HashMap::new()),
            connector,
        })
    }

    /// The UPS this collector scrapes, if it was preselected or discovered.
    #[must_use]
    pub fn ups(&self) -> Option<String> {
        self.options.lock().ups.clone()
    }

    /// Descriptors of the metrics known so far: `device_info`, then every metric produced by a
    /// scrape, by name.
    #[must_use]
    pub fn descriptors(&self) -> Vec<Desc> {
        let produced = self.descriptors.lock();
        let mut names: Vec<&String> = produced.keys().collect();
        names.sort();

        self.device_info
            .iter()
            .cloned()
            .chain(names.into_iter().map(|name| produced[name].clone()))
            .collect()
    }

    /// Run one scrape against the NUT server.
    ///
    /// Failures that prevent reading the UPS produce a single `<namespace>_error` sample. The
    /// session logs out when the scrape ends; dropping the future instead closes its socket.
    pub async fn scrape(&self) -> Vec<Sample> {
        let options = self.options.lock().clone();

        match Session::open(self.connector.as_ref(), &options).await {
            Ok(mut session) => {
                let samples = self.read(&mut session, &options).await;
                session.close().await;
                samples
            }
            Err(err) => {
                error!("{err}");
                vec![Sample::error(&options.namespace, SCRAPE_FAILURE_HELP, &err)]
            }
        }
    }

    async fn read(&self, session: &mut Session, options: &ScrapeOptions) -> Vec<Sample> {
        let namespace = options.namespace.as_str();

        let (ups, discovered) = match &options.ups {
            Some(ups) => (ups.clone(), false),
            None => match session.list_ups().await.map_err(Error::List) {
                Ok(mut upses) if upses.len() == 1 => (upses.remove(0), true),
                Ok(upses) if upses.is_empty() => {
                    warn!("NUT server {} does not expose any UPS", session.target);
                    return Vec::new();
                }
                Ok(upses) => {
                    let err = Error::AmbiguousUps(upses);
                    error!("{err}");
                    return vec![Sample::error(namespace, AMBIGUOUS_UPS_HELP, &err)];
                }
                Err(err) => {
                    error!("{err}");
                    return vec![Sample::error(namespace, SCRAPE_FAILURE_HELP, &err)];
                }
            },
        };

        let vars = match session.list_vars(&ups).await {
            Ok(vars) => vars,
            Err(source) => {
                let err = Error::Variables { ups, source };
                error!("{err}");
                return vec![Sample::error(namespace, SCRAPE_FAILURE_HELP, &err)];
            }
        };
        debug!("UPS {ups} reported {} variables", vars.len());

        let mut samples = Vec::new();
        let mut device = DeviceInfo::default();
        for (name, raw) in vars {
            let mut variable = Variable::parse(&name, &raw);
            if self.translator.is_enabled(&name) {
                match session.describe(&ups, &name).await {
                    Ok(description) => variable = variable.with_description(description),
                    Err(err) => {
                        warn!("Skipping variable {name} of UPS {ups}, its description could not be read: {err}");
                        device.observe(&variable);
                        continue;
                    }
                }
            }
            debug!("Variable {name} = {:?} ({})", raw, variable.value.type_name());
            self.translator.translate(&variable, &mut device, &mut |sample| samples.push(sample));
        }

        if let Some(desc) = &self.device_info {
            samples.push(Sample::Gauge {
                name: desc.fq_name.clone(),
                help: desc.help.clone(),
                labels: device.labels(),
                value: 1.0,
            });
        }

        if discovered {
            info!("Using UPS {ups}, the only one on NUT server {}", session.target);
            self.options.lock().ups = Some(ups);
        }
        samples
    }

    /// Descriptor for a metric, created on first use and reused afterwards so a metric keeps the
    /// same identity across scrapes.
    fn descriptor(&self, name: &str, help: &str, labels: &[(String, String)]) -> Result<Desc> {
        if let Some(desc) = self.device_info.as_ref().filter(|desc| desc.fq_name == name) {
            return Ok(desc.clone());
        }

        let mut descriptors = self.descriptors.lock();
        if let Some(desc) = descriptors.get(name) {
            return Ok(desc.clone());
        }
        let desc = Desc::new(
            name.to_string(),
            help.to_string(),
            labels.iter().map(|(label, _)| label.clone()).collect(),
            HashMap::new(),
        )?;
        descriptors.insert(name.to_string(), desc.clone());
        Ok(desc)
    }

    /// Group samples into metric families, keeping the order in which each name first appeared.
    pub fn families(&self, samples: Vec<Sample>) -> Vec<MetricFamily> {
        let mut families: Vec<MetricFamily> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for sample in samples {
            let (name, help, labels, value) = match sample {
                Sample::Gauge { name, help, labels, value } => match self.descriptor(&name, &help, &labels) {
                    Ok(desc) => (name, desc.help, labels, value),
                    Err(err) => {
                        warn!("Dropping sample for invalid metric {name}: {err}");
                        continue;
                    }
                },
                Sample::Invalid { name, help, error } => (name, format!("{help}: {error}"), Vec::new(), 1.0),
            };

            let position = *positions.entry(name.clone()).or_insert_with(|| {
                families.push(family(&name, &help));
                families.len() - 1
            });
            families[position].mut_metric().push(gauge(labels, value));
        }

        families
    }
}

fn family(name: &str, help: &str) -> MetricFamily {
    let mut family = MetricFamily::default();
    family.set_name(name.to_string());
    family.set_help(help.to_string());
    family.set_field_type(MetricType::GAUGE);
    family
}

fn gauge(labels: Vec<(String, String)>, value: f64) -> Metric {
    let pairs: Vec<LabelPair> = labels
        .into_iter()
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name(name);
            pair.set_value(value);
            pair
        })
        .collect();

    let mut gauge = Gauge::default();
    gauge.set_value(value);

    let mut metric = Metric::default();
    metric.set_label(pairs.into());
    metric.set_gauge(gauge);
    metric
}

/// Check that a preselected UPS exists. Only an explicit absence from `LIST UPS` is an error.
async fn verify_ups(connector: &dyn Connector, options: &ScrapeOptions, ups: &str) -> Result<()> {
    let mut session = match Session::open(connector, options).await {
        Ok(session) => session,
        Err(err) => {
            warn!("Could not verify UPS {ups}: {err}");
            return Ok(());
        }
    };
    let listed = session.list_ups().await;
    session.close().await;

    match listed {
        Ok(upses) if upses.iter().any(|name| name == ups) => Ok(()),
        Ok(_) => Err(Error::UpsNotFound(ups.to_string())),
        Err(err) => {
            warn!("Could not verify UPS {ups}: {}", Error::List(err));
            Ok(())
        }
    }
}

/// An open NUT session. [`Session::close`] logs out; dropping it unclosed just closes the socket.
struct Session {
    client: Box<dyn NutClient>,
    target: String,
}

impl Session {
    /// Connect and, when credentials are configured, authenticate. A rejected login is logged and
    /// the session continues anonymously since most servers allow reading variables without one.
    async fn open(connector: &dyn Connector, options: &ScrapeOptions) -> Result<Self> {
        let target = format!("{}:{}", options.server, options.server_port);
        let client = connector
            .connect(&options.server, options.server_port)
            .await
            .map_err(|source| Error::Connect {
                target: target.clone(),
                source,
            })?;
        debug!("Connected to NUT server {target}");
        let mut session = Self { client, target };

        if let Some(credentials) = &options.credentials {
            match session.authenticate(credentials).await {
                Ok(()) => debug!("Authenticated to {} as {}", session.target, credentials.username),
                Err(source) => warn!(
                    "{}",
                    Error::Auth {
                        username: credentials.username.clone(),
                        source,
                    }
                ),
            }
        }
        Ok(session)
    }

    async fn close(mut self) {
        match self.client.logout().await {
            Ok(()) => debug!("Disconnected from NUT server {}", self.target),
            Err(err) => debug!("Failed to log out of NUT server {}: {err}", self.target),
        }
    }
}

impl Deref for Session {
    type Target = dyn NutClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl DerefMut for Session {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client.as_mut()
    }
}
