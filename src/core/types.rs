use crate::common::split_str;
use crate::ml::error::ModelError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Compute device an engine instance is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator index
    Gpu(u32),
}

impl Device {
    pub fn is_cpu(self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Parse a comma separated device list such as `"gpu:0,gpu:1"`.
    pub fn parse_list(s: &str) -> Result<Vec<Device>, ModelError> {
        split_str(s, ',')
            .into_iter()
            .map(|field| field.trim().parse())
            .collect()
    }
}

impl FromStr for Device {
    type Err = ModelError;

    /// Accepts `cpu`, `gpu:N`, `cuda:N`, a bare index `N`, or `-1` for cpu.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidArgument(format!("invalid device selector '{}'", s));

        let fields = split_str(s, ':');
        match fields.as_slice() {
            [name] if name.eq_ignore_ascii_case("cpu") || *name == "-1" => Ok(Device::Cpu),
            [index] => index.parse().map(Device::Gpu).map_err(|_| invalid()),
            [kind, index]
                if kind.eq_ignore_ascii_case("gpu") || kind.eq_ignore_ascii_case("cuda") =>
            {
                index.parse().map(Device::Gpu).map_err(|_| invalid())
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Gpu(index) => write!(f, "gpu:{}", index),
        }
    }
}

impl Serialize for Device {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Device {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
