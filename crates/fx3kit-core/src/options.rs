//! Configuration keys exposed by the driver.

use std::fmt;
use std::str::FromStr;

use crate::error::BringupError;
use crate::inventory::DeviceRecord;

/// A configurable or queryable setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// Connection string, `BUS.ADDRESS` or `VID.PID`.
    Conn,
    LimitSamples,
    Samplerate,
    TriggerMatch,
    /// Pre-trigger share of the capture, in percent.
    CaptureRatio,
    Continuous,
    LogicAnalyzer,
    ScanOptions,
    DeviceOptions,
}

impl ConfigKey {
    pub fn name(self) -> &'static str {
        match self {
            ConfigKey::Conn => "conn",
            ConfigKey::LimitSamples => "limit_samples",
            ConfigKey::Samplerate => "samplerate",
            ConfigKey::TriggerMatch => "triggermatch",
            ConfigKey::CaptureRatio => "captureratio",
            ConfigKey::Continuous => "continuous",
            ConfigKey::LogicAnalyzer => "logic_analyzer",
            ConfigKey::ScanOptions => "scan_options",
            ConfigKey::DeviceOptions => "device_options",
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

impl FromStr for ConfigKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [ConfigKey; 9] = [
            ConfigKey::Conn,
            ConfigKey::LimitSamples,
            ConfigKey::Samplerate,
            ConfigKey::TriggerMatch,
            ConfigKey::CaptureRatio,
            ConfigKey::Continuous,
            ConfigKey::LogicAnalyzer,
            ConfigKey::ScanOptions,
            ConfigKey::DeviceOptions,
        ];
        ALL.into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown config key '{}'", s))
    }
}

/// Operations a key supports on an opened device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOption {
    pub key: ConfigKey,
    pub get: bool,
    pub set: bool,
    pub list: bool,
}

impl DeviceOption {
    const fn new(key: ConfigKey, get: bool, set: bool, list: bool) -> Self {
        Self {
            key,
            get,
            set,
            list,
        }
    }
}

impl fmt::Display for DeviceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        let caps: Vec<&str> = [(self.get, "get"), (self.set, "set"), (self.list, "list")]
            .into_iter()
            .filter_map(|(on, name)| on.then_some(name))
            .collect();
        if !caps.is_empty() {
            write!(f, " ({})", caps.join(", "))?;
        }
        Ok(())
    }
}

pub const SCAN_OPTIONS: &[ConfigKey] = &[ConfigKey::Conn];

pub const DRIVER_OPTIONS: &[ConfigKey] = &[ConfigKey::LogicAnalyzer];

pub const DEVICE_OPTIONS: &[DeviceOption] = &[
    DeviceOption::new(ConfigKey::Continuous, false, false, false),
    DeviceOption::new(ConfigKey::LimitSamples, true, true, false),
    DeviceOption::new(ConfigKey::Conn, true, false, false),
    DeviceOption::new(ConfigKey::Samplerate, true, true, true),
    DeviceOption::new(ConfigKey::TriggerMatch, false, false, true),
    DeviceOption::new(ConfigKey::CaptureRatio, true, true, false),
];

/// Trigger conditions the hardware can match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    Zero,
    One,
    Rising,
    Falling,
    Edge,
}

impl fmt::Display for TriggerMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerMatch::Zero => "0",
            TriggerMatch::One => "1",
            TriggerMatch::Rising => "r",
            TriggerMatch::Falling => "f",
            TriggerMatch::Edge => "e",
        };
        f.write_str(s)
    }
}

pub const TRIGGER_MATCHES: &[TriggerMatch] = &[
    TriggerMatch::Zero,
    TriggerMatch::One,
    TriggerMatch::Rising,
    TriggerMatch::Falling,
    TriggerMatch::Edge,
];

/// Value passed to or returned from the config calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValue {
    U64(u64),
    Str(String),
    Samplerates(Vec<u64>),
    TriggerMatches(Vec<TriggerMatch>),
    Keys(Vec<ConfigKey>),
    DeviceOptions(Vec<DeviceOption>),
}

impl ConfigValue {
    fn as_u64(&self, key: ConfigKey) -> Result<u64, BringupError> {
        match self {
            ConfigValue::U64(v) => Ok(*v),
            other => Err(BringupError::InvalidValue {
                key,
                message: format!("expected an integer, got {:?}", other),
            }),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: fmt::Display>(items: &[T]) -> String {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        }

        match self {
            ConfigValue::U64(v) => write!(f, "{}", v),
            ConfigValue::Str(s) => f.write_str(s),
            ConfigValue::Samplerates(rates) => write!(f, "{}", join(rates)),
            ConfigValue::TriggerMatches(matches) => write!(f, "{}", join(matches)),
            ConfigValue::Keys(keys) => write!(f, "{}", join(keys)),
            ConfigValue::DeviceOptions(opts) => write!(f, "{}", join(opts)),
        }
    }
}

/// Read a setting from a device.
pub fn config_get(key: ConfigKey, record: &DeviceRecord) -> Result<ConfigValue, BringupError> {
    let ctx = &record.context;
    match key {
        ConfigKey::Conn => {
            // The address is only known once the device has renumerated.
            if !record.conn.is_known() {
                return Err(BringupError::AddressUnknown);
            }
            Ok(ConfigValue::Str(record.conn.to_string()))
        }
        ConfigKey::LimitSamples => Ok(ConfigValue::U64(ctx.limit_samples)),
        ConfigKey::Samplerate => Ok(ConfigValue::U64(ctx.cur_samplerate)),
        ConfigKey::CaptureRatio => Ok(ConfigValue::U64(ctx.capture_ratio)),
        other => Err(BringupError::UnsupportedConfigKey(other)),
    }
}

/// Change a setting on a device.
pub fn config_set(
    key: ConfigKey,
    value: &ConfigValue,
    record: &mut DeviceRecord,
) -> Result<(), BringupError> {
    let ctx = &mut record.context;
    match key {
        ConfigKey::Samplerate => {
            let rate = value.as_u64(key)?;
            if !ctx.samplerates.contains(&rate) {
                return Err(BringupError::InvalidValue {
                    key,
                    message: format!("{} Hz is not supported by {}", rate, ctx.profile),
                });
            }
            ctx.cur_samplerate = rate;
        }
        ConfigKey::LimitSamples => ctx.limit_samples = value.as_u64(key)?,
        ConfigKey::CaptureRatio => {
            let ratio = value.as_u64(key)?;
            if ratio > 100 {
                return Err(BringupError::InvalidValue {
                    key,
                    message: format!("{} is not a percentage", ratio),
                });
            }
            ctx.capture_ratio = ratio;
        }
        other => return Err(BringupError::UnsupportedConfigKey(other)),
    }
    Ok(())
}

/// List the possible values of a setting.
///
/// Without a device, `DeviceOptions` lists the driver options and
/// `Samplerate` is unsupported.
pub fn config_list(
    key: ConfigKey,
    record: Option<&DeviceRecord>,
) -> Result<ConfigValue, BringupError> {
    match (key, record) {
        (ConfigKey::ScanOptions, _) => Ok(ConfigValue::Keys(SCAN_OPTIONS.to_vec())),
        (ConfigKey::DeviceOptions, None) => Ok(ConfigValue::Keys(DRIVER_OPTIONS.to_vec())),
        (ConfigKey::DeviceOptions, Some(_)) => {
            Ok(ConfigValue::DeviceOptions(DEVICE_OPTIONS.to_vec()))
        }
        (ConfigKey::Samplerate, Some(record)) => Ok(ConfigValue::Samplerates(
            record.context.samplerates.to_vec(),
        )),
        (ConfigKey::TriggerMatch, _) => Ok(ConfigValue::TriggerMatches(TRIGGER_MATCHES.to_vec())),
        (other, _) => Err(BringupError::UnsupportedConfigKey(other)),
    }
}
