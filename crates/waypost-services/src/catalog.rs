//! Home pages and upgrade notices for handshake responses.

use std::collections::HashMap;

use waypost_core::config::{SponsorConfig, UpgradeConfig};

/// Region key that matches every region without its own entry.
pub const ANY_REGION: &str = "*";

#[derive(Debug, Clone, Default)]
pub struct HandshakeCatalog {
    /// sponsor id → region → urls, in config order.
    home_pages: HashMap<String, HashMap<String, Vec<String>>>,
    /// channel id → latest published client version.
    upgrades: HashMap<String, u32>,
}

impl HandshakeCatalog {
    pub fn from_config(sponsors: &[SponsorConfig], upgrades: &[UpgradeConfig]) -> Self {
        let mut home_pages: HashMap<String, HashMap<String, Vec<String>>> = HashMap::new();
        for sponsor in sponsors {
            let regions = home_pages.entry(sponsor.sponsor_id.clone()).or_default();
            for page in &sponsor.home_pages {
                regions
                    .entry(page.region.clone())
                    .or_default()
                    .push(page.url.clone());
            }
        }

        let mut latest = HashMap::new();
        for u in upgrades {
            latest
                .entry(u.propagation_channel_id.clone())
                .and_modify(|v: &mut u32| *v = (*v).max(u.client_version))
                .or_insert(u.client_version);
        }

        Self {
            home_pages,
            upgrades: latest,
        }
    }

    /// Home pages for a sponsor in a region. Falls back to the sponsor's
    /// `*` entry when the region has none.
    pub fn home_pages(&self, sponsor_id: &str, region: &str) -> &[String] {
        let Some(regions) = self.home_pages.get(sponsor_id) else {
            return &[];
        };
        regions
            .get(region)
            .or_else(|| regions.get(ANY_REGION))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The version to upgrade to, if the channel has one newer than the
    /// client's.
    pub fn upgrade_for(&self, propagation_channel_id: &str, client_version: u32) -> Option<u32> {
        self.upgrades
            .get(propagation_channel_id)
            .copied()
            .filter(|latest| *latest > client_version)
    }
}
