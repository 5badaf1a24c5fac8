use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// A MIG profile token such as `1g.5gb` or `3g.20gb`.
///
/// The name embeds the profile's shape: `<compute>g.<memory>gb`, where
/// `<compute>` is the number of compute slices the profile consumes and
/// `<memory>` is its memory footprint in GiB. Both are derived from the name
/// and validated at construction, so accessors never fail.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProfileName {
    name: String,
    compute_slices: u8,
    memory_gb: u64,
}

#[derive(Debug, Error)]
#[error("invalid MIG profile name: {name}")]
pub struct ProfileParseError {
    pub name: String,
}

impl ProfileName {
    /// Number of compute slices the profile consumes.
    pub fn compute_slices(&self) -> u8 {
        self.compute_slices
    }

    /// Memory footprint in GiB.
    pub fn memory_gb(&self) -> u64 {
        self.memory_gb
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl FromStr for ProfileName {
    type Err = ProfileParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ProfileParseError {
            name: s.to_string(),
        };

        let (compute_part, memory_part) = s.split_once('.').ok_or_else(err)?;
        let compute_digits = compute_part.strip_suffix('g').ok_or_else(err)?;
        let memory_digits = memory_part.strip_suffix("gb").ok_or_else(err)?;

        let compute_slices: u8 = compute_digits.parse().map_err(|_| err())?;
        let memory_gb: u64 = memory_digits.parse().map_err(|_| err())?;
        if compute_slices == 0 || memory_gb == 0 {
            return Err(err());
        }

        Ok(Self {
            name: s.to_string(),
            compute_slices,
            memory_gb,
        })
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Whether a MIG device is currently claimed by a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceStatus {
    Free,
    Used,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Used => "used",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid device status: {token}")]
pub struct StatusParseError {
    pub token: String,
}

impl FromStr for DeviceStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "used" => Ok(Self::Used),
            other => Err(StatusParseError {
                token: other.to_string(),
            }),
        }
    }
}
