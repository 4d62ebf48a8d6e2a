//! Persistent virtual machine identity.
//!
//! A VM's identity is the triple (machine identifier, hardware model, MAC
//! address). It is assigned exactly once at creation time and must survive
//! byte-for-byte across every subsequent load: regenerating any part of it
//! would desynchronize the guest's notion of which machine it is running on.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng as _;

use crate::error::{VmhostError, VmhostResult};

/// Fixed wire length of a machine identifier.
pub const MACHINE_IDENTIFIER_LEN: usize = 16;

/// Opaque binary token identifying the machine to the guest OS.
#[derive(Clone, PartialEq, Eq)]
pub struct MachineIdentifier([u8; MACHINE_IDENTIFIER_LEN]);

impl MachineIdentifier {
    /// Draw a fresh identifier. Only done at bundle creation.
    pub fn generate() -> Self {
        Self(rand::rng().random())
    }

    /// Decode from the descriptor's base64 form. The token must decode to
    /// exactly [`MACHINE_IDENTIFIER_LEN`] bytes.
    pub fn from_base64(s: &str) -> VmhostResult<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| VmhostError::Corrupt(format!("machine_identifier is not valid base64: {e}")))?;
        let raw: [u8; MACHINE_IDENTIFIER_LEN] = bytes.as_slice().try_into().map_err(|_| {
            VmhostError::Corrupt(format!(
                "machine_identifier must be {MACHINE_IDENTIFIER_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MachineIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineIdentifier({})", hex::encode(self.0))
    }
}

/// Opaque descriptor constraining which OS builds the machine may boot.
///
/// Produced by the hypervisor backend from a restore source's most-capable
/// supported configuration; treated as a black box everywhere else.
#[derive(Clone, PartialEq, Eq)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn new(descriptor: Vec<u8>) -> Self {
        Self(descriptor)
    }

    pub fn from_base64(s: &str) -> VmhostResult<Self> {
        let bytes = BASE64
            .decode(s)
            .map_err(|e| VmhostError::Corrupt(format!("hardware_model is not valid base64: {e}")))?;
        if bytes.is_empty() {
            return Err(VmhostError::Corrupt("hardware_model is empty".into()));
        }
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for HardwareModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HardwareModel({} bytes)", self.0.len())
    }
}

/// 48-bit link-layer address in its canonical colon-separated textual form.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Draw a fresh locally-administered unicast address.
    pub fn generate() -> Self {
        let mut octets: [u8; 6] = rand::rng().random();
        // set the locally-administered bit, clear the multicast bit
        octets[0] = (octets[0] | 0x02) & 0xfe;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl FromStr for MacAddress {
    type Err = VmhostError;

    fn from_str(s: &str) -> VmhostResult<Self> {
        let corrupt = || VmhostError::Corrupt(format!("mac_address {s:?} is malformed"));
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(corrupt)?;
            if part.len() != 2 {
                return Err(corrupt());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| corrupt())?;
        }
        if parts.next().is_some() {
            return Err(corrupt());
        }
        Ok(Self(octets))
    }
}

/// The immutable identity triple persisted in the bundle descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmIdentity {
    pub machine_identifier: MachineIdentifier,
    pub hardware_model: HardwareModel,
    pub mac_address: MacAddress,
}

impl VmIdentity {
    /// Assemble a brand-new identity around a hardware model derived from
    /// the restore source.
    pub fn generate(hardware_model: HardwareModel) -> Self {
        Self {
            machine_identifier: MachineIdentifier::generate(),
            hardware_model,
            mac_address: MacAddress::generate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_identifier_round_trips_through_base64() {
        let id = MachineIdentifier::generate();
        let encoded = id.to_base64();
        let decoded = MachineIdentifier::from_base64(&encoded).unwrap();
        assert_eq!(id, decoded);
        assert_eq!(decoded.to_base64(), encoded);
    }

    #[test]
    fn machine_identifier_rejects_wrong_length() {
        let short = BASE64.encode([1u8; 4]);
        assert!(matches!(
            MachineIdentifier::from_base64(&short),
            Err(VmhostError::Corrupt(_))
        ));
    }

    #[test]
    fn machine_identifier_rejects_bad_base64() {
        assert!(matches!(
            MachineIdentifier::from_base64("!!not base64!!"),
            Err(VmhostError::Corrupt(_))
        ));
    }

    #[test]
    fn hardware_model_rejects_empty_descriptor() {
        let empty = BASE64.encode([0u8; 0]);
        assert!(matches!(
            HardwareModel::from_base64(&empty),
            Err(VmhostError::Corrupt(_))
        ));
    }

    #[test]
    fn generated_mac_is_locally_administered_unicast() {
        for _ in 0..64 {
            let mac = MacAddress::generate();
            let first = mac.octets()[0];
            assert_eq!(first & 0x02, 0x02);
            assert_eq!(first & 0x01, 0x00);
        }
    }

    #[test]
    fn mac_round_trips_through_text() {
        let mac = MacAddress::generate();
        let text = mac.to_string();
        assert_eq!(text.parse::<MacAddress>().unwrap(), mac);
    }

    #[test]
    fn mac_rejects_malformed_text() {
        for bad in ["", "aa:bb:cc", "aa:bb:cc:dd:ee:ff:00", "gg:bb:cc:dd:ee:ff", "aabb:cc:dd:ee:ff"] {
            assert!(bad.parse::<MacAddress>().is_err(), "{bad:?} should not parse");
        }
    }
}
