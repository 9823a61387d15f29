//! Interface to identity-set maps built from the active networks.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::stats::identity::{IdentitySet, NetworkIdentity};

/// Prefix of the virtual interface carrying metered IMS traffic.
pub const VT_IFACE_PREFIX: &str = "vt_data";

/// One active network as reported by connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub identity: NetworkIdentity,
    /// Base interface. Networks without one are not accounted.
    #[serde(default)]
    pub iface: Option<String>,
    /// Interfaces stacked on the base, e.g. a 464xlat `v4-` interface.
    #[serde(default)]
    pub stacked_ifaces: Vec<String>,
    #[serde(default)]
    pub is_default: bool,
    /// Network has the IMS capability.
    #[serde(default)]
    pub ims: bool,
}

impl NetworkState {
    pub fn new(identity: NetworkIdentity, iface: impl Into<String>) -> Self {
        Self {
            identity,
            iface: Some(iface.into()),
            stacked_ifaces: Vec::new(),
            is_default: false,
            ims: false,
        }
    }
}

/// Maps used to attribute snapshot rows to identities. `dev` serves the
/// interface recorders and `uid` the per-uid recorders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceMaps {
    pub dev: HashMap<String, IdentitySet>,
    pub uid: HashMap<String, IdentitySet>,
}

impl IfaceMaps {
    /// Builds both maps from scratch.
    pub fn build(states: &[NetworkState]) -> Self {
        let mut maps = Self::default();
        for state in states {
            let Some(base) = state.iface.as_deref() else {
                continue;
            };
            let ident = NetworkIdentity {
                default_network: state.is_default,
                ..state.identity.clone()
            };

            maps.add(base, &ident);

            if state.ims && !ident.metered {
                // IMS traffic on an unmetered network is billed like mobile data.
                let vt_ident = NetworkIdentity {
                    metered: true,
                    default_network: true,
                    ..ident.clone()
                };
                let vt_iface = format!("{VT_IFACE_PREFIX}{}", ident.subscription_id);
                maps.add(&vt_iface, &vt_ident);
            }

            for stacked in &state.stacked_ifaces {
                maps.add(stacked, &ident);
            }
        }
        maps
    }

    fn add(&mut self, iface: &str, ident: &NetworkIdentity) {
        self.dev
            .entry(iface.to_string())
            .or_default()
            .add(ident.clone());
        self.uid
            .entry(iface.to_string())
            .or_default()
            .add(ident.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.dev.is_empty() && self.uid.is_empty()
    }
}
