//! Translation of NUT variables into gauge samples.

use crate::config::{STATUS_VARIABLE, ScrapeOptions};
use crate::error::{Error, Result};
use crate::nut::{Variable, VariableValue};
use log::debug;
use regex::Regex;
use std::collections::HashSet;

/// Labels of the `device_info` metric, in order.
pub const DEVICE_LABELS: [&str; 9] = ["model", "mfr", "serial", "type", "description", "contact", "location", "part", "macaddr"];

/// Label carrying a single `ups.status` flag.
pub const FLAG_LABEL: &str = "flag";

const DEVICE_PREFIX: &str = "device.";

/// A sample produced by a scrape.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// A gauge reading.
    Gauge {
        /// Fully qualified metric name.
        name: String,
        /// Help text.
        help: String,
        /// Label pairs, in order.
        labels: Vec<(String, String)>,
        /// Reading.
        value: f64,
    },
    /// Marker for a scrape that could not produce readings.
    Invalid {
        /// Fully qualified metric name, always `<namespace>_error`.
        name: String,
        /// Help text.
        help: String,
        /// What went wrong.
        error: String,
    },
}

impl Sample {
    #[cfg(test)]
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Gauge { name, .. } | Self::Invalid { name, .. } => name,
        }
    }

    /// Build the `<namespace>_error` marker for a failed scrape.
    #[must_use]
    pub fn error(namespace: &str, help: &str, error: &Error) -> Self {
        Self::Invalid {
            name: metric_name(namespace, "error"),
            help: help.to_string(),
            error: error.to_string(),
        }
    }
}

/// Replace the characters NUT uses in variable names that Prometheus does not allow.
#[must_use]
pub fn sanitize(name: &str) -> String {
    name.replace(['.', '-'], "_")
}

/// Fully qualified metric name for a variable.
#[must_use]
pub fn metric_name(namespace: &str, variable: &str) -> String {
    if namespace.is_empty() {
        sanitize(variable)
    } else {
        format!("{namespace}_{}", sanitize(variable))
    }
}

/// `device.*` values seen during a scrape of a single UPS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    values: [String; DEVICE_LABELS.len()],
}

impl DeviceInfo {
    /// Remember the value of a `device.*` variable whose key is one of [`DEVICE_LABELS`].
    /// Anything else is ignored.
    pub fn observe(&mut self, variable: &Variable) {
        let Some(key) = variable.name.strip_prefix(DEVICE_PREFIX) else {
            return;
        };
        if let Some(index) = DEVICE_LABELS.iter().position(|label| *label == key) {
            self.values[index] = variable.value.to_string();
        }
    }

    #[cfg(test)]
    fn get(&self, key: &str) -> &str {
        DEVICE_LABELS
            .iter()
            .position(|label| *label == key)
            .map_or("", |index| self.values[index].as_str())
    }

    /// Label pairs in [`DEVICE_LABELS`] order.
    #[must_use]
    pub fn labels(&self) -> Vec<(String, String)> {
        DEVICE_LABELS
            .iter()
            .zip(&self.values)
            .map(|(label, value)| ((*label).to_string(), value.clone()))
            .collect()
    }
}

/// Turns variables into samples according to the allow-lists and string coercion rules of a
/// collector.
#[derive(Debug, Clone)]
pub struct Translator {
    namespace: String,
    variables: HashSet<String>,
    statuses: Vec<String>,
    on_regex: Option<Regex>,
    off_regex: Option<Regex>,
}

impl Translator {
    /// Compile the on/off patterns of `options`. Both match case-insensitively.
    pub fn new(options: &ScrapeOptions) -> Result<Self> {
        Ok(Self {
            namespace: options.namespace.clone(),
            variables: options.variables.iter().cloned().collect(),
            statuses: options.statuses.clone(),
            on_regex: compile(options.on_regex.as_deref())?,
            off_regex: compile(options.off_regex.as_deref())?,
        })
    }

    /// Whether a variable passes the allow-list. An empty list allows everything.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.variables.is_empty() || self.variables.contains(name)
    }

    /// Translate one variable, recording `device.*` values into `device` and passing samples to
    /// `emit` in output order.
    pub fn translate(&self, variable: &Variable, device: &mut DeviceInfo, emit: &mut dyn FnMut(Sample)) {
        device.observe(variable);

        if !self.is_enabled(&variable.name) {
            debug!("Variable {} is not enabled for export", variable.name);
            return;
        }

        let name = metric_name(&self.namespace, &variable.name);
        let help = format!("{} ({})", variable.description, variable.name);

        if variable.name == STATUS_VARIABLE {
            self.translate_status(&variable.value.to_string(), &name, &help, emit);
            return;
        }

        if let Some(value) = self.coerce(variable) {
            emit(Sample::Gauge {
                name,
                help,
                labels: Vec::new(),
                value,
            });
        }
    }

    fn translate_status(&self, value: &str, name: &str, help: &str, emit: &mut dyn FnMut(Sample)) {
        let mut seen = HashSet::new();
        let flag = |token: &str, value: f64| Sample::Gauge {
            name: name.to_string(),
            help: help.to_string(),
            labels: vec![(FLAG_LABEL.to_string(), token.to_string())],
            value,
        };

        for token in value.split_whitespace() {
            if seen.insert(token) {
                emit(flag(token, 1.0));
            }
        }
        for status in &self.statuses {
            if !seen.contains(status.as_str()) {
                emit(flag(status.as_str(), 0.0));
            }
        }
    }

    /// The gauge value of a variable. The actual value wins over whatever type the server declared.
    #[allow(clippy::cast_precision_loss)]
    fn coerce(&self, variable: &Variable) -> Option<f64> {
        match &variable.value {
            VariableValue::Bool(value) => Some(if *value { 1.0 } else { 0.0 }),
            VariableValue::Int(value) => Some(*value as f64),
            VariableValue::Float(value) => Some(*value),
            VariableValue::String(value) => {
                if self.on_regex.as_ref().is_some_and(|re| re.is_match(value)) {
                    Some(1.0)
                } else if self.off_regex.as_ref().is_some_and(|re| re.is_match(value)) {
                    Some(0.0)
                } else {
                    debug!("Variable {} has a value that is not a number: {value:?}", variable.name);
                    None
                }
            }
        }
    }
}

fn compile(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|pattern| {
            Regex::new(&format!("(?i){pattern}")).map_err(|source| Error::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator(variables: &[&str], statuses: &[&str]) -> Translator {
        let options = ScrapeOptions {
            namespace: "ns".to_string(),
            variables: variables.iter().map(|v| (*v).to_string()).collect(),
            statuses: statuses.iter().map(|v| (*v).to_string()).collect(),
            ..ScrapeOptions::default()
        };
        Translator::new(&options).unwrap()
    }

    fn run(translator: &Translator, vars: &[(&str, &str)]) -> (Vec<Sample>, DeviceInfo) {
        let mut samples = Vec::new();
        let mut device = DeviceInfo::default();
        for (name, value) in vars {
            let variable = Variable::parse(name, value).with_description("Desc");
            translator.translate(&variable, &mut device, &mut |s| samples.push(s));
        }
        (samples, device)
    }

    fn gauge(sample: &Sample) -> (&str, Option<&str>, f64) {
        match sample {
            Sample::Gauge { name, labels, value, .. } => (name.as_str(), labels.first().map(|(_, v)| v.as_str()), *value),
            Sample::Invalid { .. } => panic!("unexpected invalid sample"),
        }
    }

    #[test]
    fn sanitize_replaces_dots_and_dashes() {
        assert_eq!("battery_charge", sanitize("battery.charge"));
        assert_eq!("ambient_1_temp_high", sanitize("ambient.1.temp-high"));
        assert_eq!(sanitize("a.b-c"), sanitize(&sanitize("a.b-c")));
        assert_eq!("ns_error", metric_name("ns", "error"));
        assert_eq!("ups_load", metric_name("", "ups.load"));
    }

    #[test]
    fn allow_list_gates_samples() {
        let translator = translator(&["battery.charge", "ups.load"], &[]);
        let (samples, _) = run(
            &translator,
            &[("battery.charge", "42.0"), ("ups.load", "15"), ("ups.temperature", "30.0")],
        );

        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(vec![("ns_battery_charge", None, 42.0), ("ns_ups_load", None, 15.0)], got);
    }

    #[test]
    fn empty_allow_list_exports_every_number() {
        let translator = translator(&[], &[]);
        let (samples, _) = run(&translator, &[("ups.temperature", "30.5"), ("ups.mfr", "APC")]);
        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(vec![("ns_ups_temperature", None, 30.5)], got);
    }

    #[test]
    fn help_contains_description_and_name() {
        let translator = translator(&[], &[]);
        let (samples, _) = run(&translator, &[("battery.charge", "100")]);
        match &samples[0] {
            Sample::Gauge { help, .. } => assert_eq!("Desc (battery.charge)", help),
            Sample::Invalid { .. } => panic!("unexpected invalid sample"),
        }
    }

    #[test]
    fn status_flags_and_forced_zeroes() {
        let translator = translator(&[], &["OL", "OB", "LB", "CHRG"]);
        let (samples, _) = run(&translator, &[("ups.status", "OL CHRG")]);
        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(
            vec![
                ("ns_ups_status", Some("OL"), 1.0),
                ("ns_ups_status", Some("CHRG"), 1.0),
                ("ns_ups_status", Some("OB"), 0.0),
                ("ns_ups_status", Some("LB"), 0.0),
            ],
            got
        );
    }

    #[test]
    fn status_flags_not_in_list_are_still_reported() {
        let translator = translator(&[], &["OL"]);
        let (samples, _) = run(&translator, &[("ups.status", "OB  LB OB")]);
        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(
            vec![
                ("ns_ups_status", Some("OB"), 1.0),
                ("ns_ups_status", Some("LB"), 1.0),
                ("ns_ups_status", Some("OL"), 0.0),
            ],
            got
        );
    }

    #[test]
    fn status_respects_allow_list() {
        let translator = translator(&["battery.charge"], &["OL"]);
        let (samples, _) = run(&translator, &[("ups.status", "OL")]);
        assert!(samples.is_empty());
    }

    #[test]
    fn string_values_use_on_off_patterns() {
        let translator = translator(&[], &[]);
        let (samples, _) = run(
            &translator,
            &[
                ("outlet.1.switch", "on"),
                ("outlet.2.switch", "OFF"),
                ("ups.beeper.status", "Enabled"),
                ("outlet.3.switch", "maybe"),
            ],
        );
        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(
            vec![
                ("ns_outlet_1_switch", None, 1.0),
                ("ns_outlet_2_switch", None, 0.0),
                ("ns_ups_beeper_status", None, 1.0),
            ],
            got
        );
    }

    #[test]
    fn string_values_without_patterns_are_skipped() {
        let options = ScrapeOptions {
            variables: Vec::new(),
            on_regex: None,
            off_regex: None,
            ..ScrapeOptions::default()
        };
        let translator = Translator::new(&options).unwrap();
        let (samples, _) = run(&translator, &[("outlet.1.switch", "on")]);
        assert!(samples.is_empty());

        let (samples, _) = run(&translator, &[("ups.beeper.status", "enabled"), ("outlet.1.switchable", "disabled")]);
        let got: Vec<_> = samples.iter().map(gauge).collect();
        assert_eq!(
            vec![("network_ups_tools_ups_beeper_status", None, 1.0), ("network_ups_tools_outlet_1_switchable", None, 0.0)],
            got
        );
    }

    #[test]
    fn typed_values_are_coerced() {
        let translator = translator(&[], &[]);
        let mut samples = Vec::new();
        let mut device = DeviceInfo::default();
        for value in [VariableValue::Bool(true), VariableValue::Bool(false), VariableValue::Int(7), VariableValue::Float(1.5)] {
            let variable = Variable {
                name: "ups.test".to_string(),
                value,
                kind: Some("STRING".to_string()),
                description: String::new(),
            };
            translator.translate(&variable, &mut device, &mut |s| samples.push(s));
        }
        let values: Vec<_> = samples.iter().map(|s| gauge(s).2).collect();
        assert_eq!(vec![1.0, 0.0, 7.0, 1.5], values);
    }

    #[test]
    fn device_values_ignore_allow_list() {
        let translator = translator(&["battery.charge"], &[]);
        let (samples, device) = run(
            &translator,
            &[("device.model", "SmartUPS"), ("device.mfr", "APC"), ("device.mfr.date", "2019"), ("device.uptime", "12")],
        );
        assert!(samples.is_empty());
        assert_eq!("SmartUPS", device.get("model"));
        assert_eq!("APC", device.get("mfr"));
        assert_eq!("", device.get("serial"));

        let labels = device.labels();
        assert_eq!(DEVICE_LABELS.len(), labels.len());
        assert_eq!(("model".to_string(), "SmartUPS".to_string()), labels[0]);
        assert_eq!(("macaddr".to_string(), String::new()), labels[8]);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let options = ScrapeOptions {
            on_regex: Some("^(on".to_string()),
            ..ScrapeOptions::default()
        };
        assert!(matches!(Translator::new(&options), Err(Error::InvalidRegex { .. })));
    }
}
