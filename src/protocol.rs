use crate::error::{Error, Result};
use crate::peer::{DiscoveryMethod, HardwareAddress, PeerIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Upper bound for one serialized identity record.
pub const MAX_IDENTITY_LEN: usize = 1024;

/// Fixed identifier every assistance beacon carries, so scanners can tell
/// them apart from ordinary advertisements.
pub const ASSISTANCE_SERVICE_ID: Uuid = Uuid::from_u128(0x6f1f_5e0a_3c2b_4d8e_9a71_b5c4_2e10_d7a3);

/// Identity exchanged in both directions of the handshake.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRecord {
    pub name: String,
    pub hardware_address: String,
    #[serde(default)]
    pub service_type: String,
    #[serde(default)]
    pub secondary_address: String,
    #[serde(default)]
    pub secondary_name: String,
}

impl IdentityRecord {
    pub fn from_identity(identity: &PeerIdentity) -> Self {
        Self {
            name: identity.name.clone(),
            hardware_address: identity
                .hardware_address
                .as_ref()
                .map(|a| a.as_str().to_string())
                .unwrap_or_default(),
            service_type: identity.service_type.clone(),
            secondary_address: identity.secondary_address.clone(),
            secondary_name: identity.secondary_name.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_IDENTITY_LEN {
            return Err(Error::InvalidIdentity(format!(
                "record is {} bytes, limit is {}",
                bytes.len(),
                MAX_IDENTITY_LEN
            )));
        }
        Ok(bytes)
    }

    /// Parses a received payload. Empty payloads, malformed JSON, a missing
    /// name or a malformed hardware address are all rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidIdentity("empty payload".into()));
        }
        let record: IdentityRecord = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidIdentity("missing name".into()));
        }
        HardwareAddress::parse_or_unknown(&self.hardware_address)
            .map_err(|e| Error::InvalidIdentity(e.to_string()))?;
        Ok(())
    }

    pub fn into_identity(self, method: DiscoveryMethod) -> Result<PeerIdentity> {
        let hardware_address = HardwareAddress::parse_or_unknown(&self.hardware_address)?;
        Ok(PeerIdentity {
            hardware_address: Some(hardware_address),
            name: self.name,
            service_type: self.service_type,
            secondary_address: self.secondary_address,
            secondary_name: self.secondary_name,
            discovery_method: method,
            merge_count: 0,
        })
    }
}

/// Correlation id of one "need help" request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Payload of the assistance advertisements.
///
/// A requester advertises it without an address ("need help"). The helper
/// answers with the same request id and the address it observed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssistanceBeacon {
    pub service: Uuid,
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl AssistanceBeacon {
    pub fn request(request_id: RequestId) -> Self {
        Self {
            service: ASSISTANCE_SERVICE_ID,
            request_id,
            address: None,
        }
    }

    pub fn answer(request_id: RequestId, address: &HardwareAddress) -> Self {
        Self {
            service: ASSISTANCE_SERVICE_ID,
            request_id,
            address: Some(address.as_str().to_string()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Returns `None` for anything that is not one of our beacons.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<AssistanceBeacon>(bytes)
            .ok()
            .filter(|beacon| beacon.service == ASSISTANCE_SERVICE_ID)
    }
}
