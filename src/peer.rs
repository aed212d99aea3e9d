use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder name reported by engines that saw a peer but not its name.
pub const NO_PEER_NAME: &str = "<no peer name>";

const UNKNOWN_ADDRESS: &str = "0:0:0:0:0:0";

/// Hardware address on the beacon transport, e.g. `01:23:45:67:89:AB`.
///
/// The sentinel `0:0:0:0:0:0` stands for "not yet known". It can be carried
/// around (engines advertise it before resolution) but never passes
/// [`HardwareAddress::is_valid`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareAddress(String);

impl HardwareAddress {
    /// Parses and validates an address. The sentinel is rejected.
    pub fn parse(value: &str) -> Result<Self> {
        if is_valid_address(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(Error::InvalidAddress(value.to_string()))
        }
    }

    /// Accepts either a valid address or the sentinel; anything else is an error.
    pub fn parse_or_unknown(value: &str) -> Result<Self> {
        if value == UNKNOWN_ADDRESS {
            Ok(Self::unknown())
        } else {
            Self::parse(value)
        }
    }

    pub fn unknown() -> Self {
        Self(UNKNOWN_ADDRESS.to_string())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_ADDRESS
    }

    pub fn is_valid(&self) -> bool {
        is_valid_address(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Six colon separated groups of two upper-case hex digits.
pub fn is_valid_address(value: &str) -> bool {
    let groups: Vec<&str> = value.split(':').collect();
    groups.len() == 6
        && groups.iter().all(|group| {
            group.len() == 2
                && group
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c))
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    #[default]
    Unknown,
    Beacon,
    Session,
    SessionPeerList,
    IncomingHandshake,
}

/// Everything we know about a remote device.
///
/// Two identities are equal only when both carry the same hardware address;
/// an identity without an address is equal to nothing, itself included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub hardware_address: Option<HardwareAddress>,
    pub name: String,
    pub service_type: String,
    pub secondary_address: String,
    pub secondary_name: String,
    #[serde(default)]
    pub discovery_method: DiscoveryMethod,
    #[serde(default)]
    pub merge_count: u32,
}

impl PeerIdentity {
    pub fn new(name: impl Into<String>, hardware_address: HardwareAddress) -> Self {
        Self {
            hardware_address: Some(hardware_address),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_discovery_method(mut self, method: DiscoveryMethod) -> Self {
        self.discovery_method = method;
        self
    }

    /// Address usable as a registry key: present and not the sentinel.
    pub fn known_address(&self) -> Option<&HardwareAddress> {
        self.hardware_address
            .as_ref()
            .filter(|address| !address.is_unknown())
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty() && self.name != NO_PEER_NAME
    }

    /// Name and hardware address are both populated.
    pub fn is_valid(&self) -> bool {
        self.has_name() && self.hardware_address.is_some()
    }

    pub fn has_more_information(&self, other: &PeerIdentity) -> bool {
        self.fields_with_data() > other.fields_with_data()
    }

    /// Same observable content. Bookkeeping (`merge_count`) is ignored.
    pub fn same_content(&self, other: &PeerIdentity) -> bool {
        self.hardware_address == other.hardware_address
            && self.name == other.name
            && self.service_type == other.service_type
            && self.secondary_address == other.secondary_address
            && self.secondary_name == other.secondary_name
            && self.discovery_method == other.discovery_method
    }

    fn fields_with_data(&self) -> usize {
        [
            self.has_name(),
            self.hardware_address.is_some(),
            !self.service_type.is_empty(),
            !self.secondary_address.is_empty(),
            !self.secondary_name.is_empty(),
        ]
        .into_iter()
        .filter(|populated| *populated)
        .count()
    }
}

impl PartialEq for PeerIdentity {
    fn eq(&self, other: &Self) -> bool {
        match (&self.hardware_address, &other.hardware_address) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let address = self
            .hardware_address
            .as_ref()
            .map(HardwareAddress::as_str)
            .unwrap_or("-");
        write!(
            f,
            "[{} {} {:?} c{}]",
            self.name, address, self.discovery_method, self.merge_count
        )
    }
}

/// Copies every field populated in `old` but empty in `new` into `new`.
///
/// Populated fields in `new` are never touched. `new.merge_count` is bumped
/// on every call. Returns true if anything was copied.
pub fn merge_missing_fields(old: &PeerIdentity, new: &mut PeerIdentity) -> bool {
    let mut copied = false;

    if old.has_name() && !new.has_name() {
        new.name = old.name.clone();
        copied = true;
    }

    if old.hardware_address.is_some() && new.hardware_address.is_none() {
        new.hardware_address = old.hardware_address.clone();
        copied = true;
    }

    for (from, to) in [
        (&old.service_type, &mut new.service_type),
        (&old.secondary_address, &mut new.secondary_address),
        (&old.secondary_name, &mut new.secondary_name),
    ] {
        if !from.is_empty() && to.is_empty() {
            *to = from.clone();
            copied = true;
        }
    }

    new.merge_count += 1;
    copied
}
