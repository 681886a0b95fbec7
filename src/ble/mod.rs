//! The radio seen by a session.
//!
//! [`Radio`] is the process-wide adapter: it scans and opens links.
//! [`BleLink`] is one open connection to a peripheral. Both are traits so the
//! session can run against the `bluest` backend or a scripted mock.

use std::fmt;

use async_trait::async_trait;
use bluest::Uuid;
use tokio::sync::mpsc;

use crate::error::{TransportError, WriteError};

pub mod bluest_radio;
#[cfg(test)]
pub(crate) mod mock;

pub use bluest_radio::BluestRadio;

/// Hardware address of a peripheral, compared case-insensitively.
#[derive(Debug, Clone, Eq)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a backend's peripheral identifier refers to this address.
    ///
    /// Backends wrap the address differently (`AA:BB:..`, `dev_AA_BB_..`,
    /// `BluetoothLE#..-aa:bb:..`). Besides a plain case-insensitive match, the
    /// last six-octet address embedded in `id` must equal this one in full.
    pub fn matches(&self, id: &str) -> bool {
        if self.0.eq_ignore_ascii_case(id.trim()) {
            return true;
        }
        match (octets(&self.0), embedded_octets(id)) {
            (Some(wanted), Some(found)) => wanted == found,
            _ => false,
        }
    }
}

const ADDRESS_LEN: usize = 17;

fn is_separator(b: u8) -> bool {
    matches!(b, b':' | b'_' | b'-')
}

/// Parse exactly six hex octets joined by `:`, `_` or `-`.
fn octets(s: &str) -> Option<[u8; 6]> {
    let bytes = s.trim().as_bytes();
    if bytes.len() != ADDRESS_LEN {
        return None;
    }
    let mut out = [0u8; 6];
    for (i, octet) in out.iter_mut().enumerate() {
        let at = i * 3;
        if i > 0 && !is_separator(bytes[at - 1]) {
            return None;
        }
        let pair = std::str::from_utf8(&bytes[at..at + 2]).ok()?;
        if !pair.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        *octet = u8::from_str_radix(pair, 16).ok()?;
    }
    Some(out)
}

/// The last address in `id` not glued to further hex digits.
fn embedded_octets(id: &str) -> Option<[u8; 6]> {
    let bytes = id.as_bytes();
    let glued = |i: Option<usize>| i.and_then(|i| bytes.get(i)).is_some_and(u8::is_ascii_hexdigit);
    (0..bytes.len().saturating_sub(ADDRESS_LEN - 1))
        .rev()
        .filter(|&start| !glued(start.checked_sub(1)) && !glued(Some(start + ADDRESS_LEN)))
        .find_map(|start| id.get(start..start + ADDRESS_LEN).and_then(octets))
}

impl PartialEq for DeviceAddress {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a fetch is looking for during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub address: DeviceAddress,
    pub alias: Option<String>,
}

impl DeviceTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: DeviceAddress::new(address),
            alias: None,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.alias = (!alias.trim().is_empty()).then(|| alias.trim().to_string());
        self
    }

    pub fn matches(&self, peripheral: &Peripheral) -> bool {
        self.matches_address(peripheral) || self.matches_alias(peripheral)
    }

    pub fn matches_address(&self, peripheral: &Peripheral) -> bool {
        self.address.matches(&peripheral.id)
    }

    pub fn matches_alias(&self, peripheral: &Peripheral) -> bool {
        match (&self.alias, &peripheral.name) {
            (Some(alias), Some(name)) => name.trim() == alias,
            _ => false,
        }
    }

    /// Pick the peripheral this target refers to. An address match wins over
    /// an alias match.
    pub fn select(&self, peripherals: Vec<Peripheral>) -> Option<Peripheral> {
        let (by_address, rest): (Vec<_>, Vec<_>) =
            peripherals.into_iter().partition(|p| self.matches_address(p));
        by_address
            .into_iter()
            .next()
            .or_else(|| rest.into_iter().find(|p| self.matches_alias(p)))
    }
}

/// A peripheral as seen in the radio's registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub id: String,
    pub name: Option<String>,
}

#[async_trait]
pub trait Radio: Send + Sync {
    async fn start_discovery(&self) -> Result<(), TransportError>;

    async fn stop_discovery(&self);

    /// Snapshot of every peripheral seen since discovery started.
    async fn peripherals(&self) -> Result<Vec<Peripheral>, TransportError>;

    async fn connect(&self, peripheral: &Peripheral) -> Result<Box<dyn BleLink>, TransportError>;

    /// Tear down any connection to `peripheral`, including one still being
    /// established after its `connect` was abandoned.
    async fn disconnect(&self, peripheral: &Peripheral) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BleLink: Send + Sync {
    /// UUIDs of every characteristic the peripheral exposes.
    async fn discover_characteristics(&mut self) -> Result<Vec<Uuid>, TransportError>;

    /// Enable notifications on `uuid`. Each notification arrives as one item
    /// on the returned channel; the channel closes when the link drops.
    async fn subscribe(&mut self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn write(&mut self, uuid: Uuid, payload: &[u8]) -> Result<(), WriteError>;

    async fn is_connected(&self) -> bool;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[test]
fn test_address_matches_case_insensitively() {
    let address = DeviceAddress::new("a4:c1:38:0b:79:22");
    assert!(address.matches("A4:C1:38:0B:79:22"));
    assert!(address.matches("hci0/dev_A4_C1_38_0B_79_22"));
    assert!(address.matches("DeviceId(A4:C1:38:0B:79:22)"));
    assert!(!address.matches("A4:C1:38:0B:79:23"));
    assert!(address.matches("BluetoothLE#BluetoothLE00:1a:7d:da:71:13-a4:c1:38:0b:79:22"));
    assert_eq!(address, DeviceAddress::new("A4:C1:38:0B:79:22"));
}

#[test]
fn test_partial_address_never_matches() {
    assert!(!DeviceAddress::new("79:22").matches("A4:C1:38:0B:79:22"));
    assert!(!DeviceAddress::new("0B:79:22").matches("hci0/dev_A4_C1_38_0B_79_22"));
    assert!(!DeviceAddress::new("22").matches("11:11:11:11:11:22"));
    assert!(!DeviceAddress::new("").matches("11:11:11:11:11:22"));

    let target = DeviceTarget::new("22");
    let peripheral = Peripheral {
        id: "11:11:11:11:11:22".into(),
        name: None,
    };
    assert!(!target.matches(&peripheral));
}

#[test]
fn test_address_glued_to_longer_hex_is_ignored() {
    let address = DeviceAddress::new("A4:C1:38:0B:79:22");
    assert!(!address.matches("FFA4:C1:38:0B:79:22"));
    assert!(!address.matches("A4:C1:38:0B:79:22FF"));
}

#[test]
fn test_select_prefers_address_over_alias() {
    let target = DeviceTarget::new("84:C6:92:13:C0:F4").with_alias("BT-TH-92");
    let by_alias = Peripheral {
        id: "00:00:00:00:00:01".into(),
        name: Some("BT-TH-92".into()),
    };
    let by_address = Peripheral {
        id: "84:C6:92:13:C0:F4".into(),
        name: Some("BT-TH-00".into()),
    };
    for peripherals in [
        vec![by_alias.clone(), by_address.clone()],
        vec![by_address.clone(), by_alias.clone()],
    ] {
        assert_eq!(target.select(peripherals), Some(by_address.clone()));
    }
    assert_eq!(target.select(vec![by_alias.clone()]), Some(by_alias));
}

#[test]
fn test_target_matches_alias() {
    let target = DeviceTarget::new("84:c6:92:13:c0:f4").with_alias("BT-TH-92");
    let by_name = Peripheral {
        id: "00:00:00:00:00:01".into(),
        name: Some(" BT-TH-92 ".into()),
    };
    let other = Peripheral {
        id: "00:00:00:00:00:02".into(),
        name: Some("BT-TH-93".into()),
    };
    assert!(target.matches(&by_name));
    assert!(!target.matches(&other));

    let without_alias = DeviceTarget::new("84:c6:92:13:c0:f4").with_alias("  ");
    assert_eq!(without_alias.alias, None);
    assert!(!without_alias.matches(&by_name));
}
