use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Correlation id for one delegated call.
///
/// Rendered as `<pid hex>-<ulid>`: the pid keeps ids from different workers
/// apart, the ULID carries a millisecond timestamp and 80 random bits.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct DelegateId {
    pid: u32,
    ulid: ulid::Ulid,
}

impl DelegateId {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            ulid: ulid::Ulid::new(),
        }
    }

    /// Process that issued the call.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Default for DelegateId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for DelegateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}-{}", self.pid, self.ulid)
    }
}

/// Error parsing a [`DelegateId`] from its text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDelegateIdError;

impl Display for ParseDelegateIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid delegate id")
    }
}

impl std::error::Error for ParseDelegateIdError {}

impl FromStr for DelegateId {
    type Err = ParseDelegateIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (pid, ulid) = s.split_once('-').ok_or(ParseDelegateIdError)?;
        let pid = u32::from_str_radix(pid, 16).map_err(|_| ParseDelegateIdError)?;
        let ulid = ulid::Ulid::from_string(ulid).map_err(|_| ParseDelegateIdError)?;
        Ok(DelegateId { pid, ulid })
    }
}

impl Serialize for DelegateId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DelegateId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<DelegateId>()
            .map_err(|_| serde::de::Error::custom("invalid delegate id"))
    }
}
