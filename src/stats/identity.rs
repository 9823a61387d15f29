//! Classification of the logical networks active on an interface.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Radio access type is unknown or not applicable.
pub const RAT_UNKNOWN: i32 = -1;
pub const RAT_LTE: i32 = 13;
pub const RAT_NR: i32 = 20;

/// Subscription id of networks that are not tied to a subscription.
pub const INVALID_SUBSCRIPTION_ID: i32 = -1;

pub const OEM_NONE: u8 = 0;

/// Transport of a logical network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Mobile,
    Wifi,
    Ethernet,
    Bluetooth,
    Proxy,
    Vpn,
    Test,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Wifi => "wifi",
            Self::Ethernet => "ethernet",
            Self::Bluetooth => "bluetooth",
            Self::Proxy => "proxy",
            Self::Vpn => "vpn",
            Self::Test => "test",
        }
    }
}

/// Static description of one network while it was active.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkIdentity {
    pub network_type: NetworkType,
    #[serde(default = "default_rat_type")]
    pub rat_type: i32,
    #[serde(default)]
    pub subscriber_id: Option<String>,
    #[serde(default)]
    pub wifi_network_key: Option<String>,
    #[serde(default)]
    pub roaming: bool,
    #[serde(default)]
    pub metered: bool,
    #[serde(default)]
    pub default_network: bool,
    #[serde(default)]
    pub oem_managed: u8,
    #[serde(default = "default_subscription_id")]
    pub subscription_id: i32,
}

fn default_rat_type() -> i32 {
    RAT_UNKNOWN
}

fn default_subscription_id() -> i32 {
    INVALID_SUBSCRIPTION_ID
}

impl NetworkIdentity {
    pub fn new(network_type: NetworkType) -> Self {
        Self {
            network_type,
            rat_type: RAT_UNKNOWN,
            subscriber_id: None,
            wifi_network_key: None,
            roaming: false,
            metered: false,
            default_network: false,
            oem_managed: OEM_NONE,
            subscription_id: INVALID_SUBSCRIPTION_ID,
        }
    }

    /// A metered cellular identity.
    pub fn mobile(subscriber_id: impl Into<String>, rat_type: i32) -> Self {
        Self {
            rat_type,
            subscriber_id: Some(subscriber_id.into()),
            metered: true,
            ..Self::new(NetworkType::Mobile)
        }
    }

    /// An unmetered Wi-Fi identity.
    pub fn wifi(network_key: impl Into<String>) -> Self {
        Self {
            wifi_network_key: Some(network_key.into()),
            ..Self::new(NetworkType::Wifi)
        }
    }

    /// True for identities whose key is rewritten when legacy data is imported:
    /// a RAT type only means something on cellular networks.
    pub fn could_change_on_import(&self) -> bool {
        self.network_type != NetworkType::Mobile && self.rat_type != RAT_UNKNOWN
    }

    /// Returns the identity as the importer stores it.
    pub fn normalized_for_import(&self) -> Self {
        if self.could_change_on_import() {
            Self {
                rat_type: RAT_UNKNOWN,
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }
}

/// Identities simultaneously active on one interface.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct IdentitySet(BTreeSet<NetworkIdentity>);

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ident: NetworkIdentity) {
        self.0.insert(ident);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkIdentity> {
        self.0.iter()
    }

    pub fn is_any_member_metered(&self) -> bool {
        self.0.iter().any(|i| i.metered)
    }

    pub fn is_any_member_roaming(&self) -> bool {
        self.0.iter().any(|i| i.roaming)
    }

    /// False for the empty set.
    pub fn are_all_members_on_default_network(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|i| i.default_network)
    }

    pub fn could_change_on_import(&self) -> bool {
        self.0.iter().any(NetworkIdentity::could_change_on_import)
    }

    pub fn normalized_for_import(&self) -> Self {
        self.0
            .iter()
            .map(NetworkIdentity::normalized_for_import)
            .collect()
    }
}

impl FromIterator<NetworkIdentity> for IdentitySet {
    fn from_iter<I: IntoIterator<Item = NetworkIdentity>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
