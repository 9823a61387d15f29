//! Query filter selecting the identity sets a summary or history covers.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::identity::{IdentitySet, NetworkIdentity, NetworkType};
use crate::error::StatsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    Mobile,
    Wifi,
    Ethernet,
    Bluetooth,
    Proxy,
    /// Mobile or Wi-Fi networks carrying one of the template's subscriber ids.
    Carrier,
    Test,
    /// Every identity.
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub rule: MatchRule,
    #[serde(default)]
    pub subscriber_ids: BTreeSet<String>,
    #[serde(default)]
    pub wifi_network_keys: BTreeSet<String>,
    #[serde(default)]
    pub metered: Option<bool>,
    #[serde(default)]
    pub roaming: Option<bool>,
    #[serde(default)]
    pub default_network: Option<bool>,
    #[serde(default)]
    pub rat_type: Option<i32>,
    #[serde(default)]
    pub oem_managed: Option<u8>,
}

impl Template {
    pub fn new(rule: MatchRule) -> Self {
        Self {
            rule,
            subscriber_ids: BTreeSet::new(),
            wifi_network_keys: BTreeSet::new(),
            metered: None,
            roaming: None,
            default_network: None,
            rat_type: None,
            oem_managed: None,
        }
    }

    /// Mobile traffic of the given subscribers. An empty list matches every
    /// mobile identity.
    pub fn mobile<I, S>(subscriber_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscriber_ids: subscriber_ids.into_iter().map(Into::into).collect(),
            ..Self::new(MatchRule::Mobile)
        }
    }

    pub fn wifi<I, S>(network_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            wifi_network_keys: network_keys.into_iter().map(Into::into).collect(),
            ..Self::new(MatchRule::Wifi)
        }
    }

    pub fn with_metered(mut self, metered: bool) -> Self {
        self.metered = Some(metered);
        self
    }

    pub fn with_roaming(mut self, roaming: bool) -> Self {
        self.roaming = Some(roaming);
        self
    }

    /// Rejects field combinations that can never match anything.
    pub fn validate(&self) -> Result<(), StatsError> {
        if !self.wifi_network_keys.is_empty() && self.rule != MatchRule::Wifi {
            return Err(StatsError::InvalidTemplate(
                "wifi network keys require the wifi rule".to_string(),
            ));
        }
        if !self.subscriber_ids.is_empty()
            && !matches!(self.rule, MatchRule::Mobile | MatchRule::Carrier)
        {
            return Err(StatsError::InvalidTemplate(
                "subscriber ids require the mobile or carrier rule".to_string(),
            ));
        }
        if self.rule == MatchRule::Carrier && self.subscriber_ids.is_empty() {
            return Err(StatsError::InvalidTemplate(
                "carrier rule requires at least one subscriber id".to_string(),
            ));
        }
        if self.subscriber_ids.iter().any(String::is_empty) {
            return Err(StatsError::InvalidTemplate(
                "empty subscriber id".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if `ident` is selected by this template.
    pub fn matches(&self, ident: &NetworkIdentity) -> bool {
        if self.metered.is_some_and(|m| m != ident.metered)
            || self.roaming.is_some_and(|r| r != ident.roaming)
            || self
                .default_network
                .is_some_and(|d| d != ident.default_network)
            || self.rat_type.is_some_and(|r| r != ident.rat_type)
            || self.oem_managed.is_some_and(|o| o != ident.oem_managed)
        {
            return false;
        }

        match self.rule {
            MatchRule::All => true,
            MatchRule::Mobile => {
                ident.network_type == NetworkType::Mobile && self.matches_subscriber(ident)
            }
            MatchRule::Carrier => {
                matches!(ident.network_type, NetworkType::Mobile | NetworkType::Wifi)
                    && self.matches_subscriber(ident)
            }
            MatchRule::Wifi => {
                ident.network_type == NetworkType::Wifi
                    && (self.wifi_network_keys.is_empty()
                        || ident
                            .wifi_network_key
                            .as_ref()
                            .is_some_and(|k| self.wifi_network_keys.contains(k)))
            }
            MatchRule::Ethernet => ident.network_type == NetworkType::Ethernet,
            MatchRule::Bluetooth => ident.network_type == NetworkType::Bluetooth,
            MatchRule::Proxy => ident.network_type == NetworkType::Proxy,
            MatchRule::Test => ident.network_type == NetworkType::Test,
        }
    }

    fn matches_subscriber(&self, ident: &NetworkIdentity) -> bool {
        self.subscriber_ids.is_empty()
            || ident
                .subscriber_id
                .as_ref()
                .is_some_and(|s| self.subscriber_ids.contains(s))
    }

    /// True if any member of `set` matches.
    pub fn matches_set(&self, set: &IdentitySet) -> bool {
        set.iter().any(|ident| self.matches(ident))
    }
}
