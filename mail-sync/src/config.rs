//! # Sync config

use serde::{Deserialize, Serialize};

use crate::message::{Property, DETAIL_PROPERTIES, HEADER_PROPERTIES};

/// The default escalation ladder of the update policy.
pub const DEFAULT_MAX_CHANGES_LADDER: &[usize] = &[50, 100, 150];

/// The message synchronization configuration.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    /// The successive maximum numbers of changes requested per update
    /// round. The first step is the default one; the next steps are
    /// used while the server keeps reporting more updates. Once the
    /// last step is exhausted, the cache is recovered.
    #[serde(default)]
    pub max_changes_ladder: Option<Vec<usize>>,

    /// Whether the first update round requests full records along
    /// with the changed ids.
    #[serde(default)]
    pub fetch_records_first: Option<bool>,

    /// Override of the properties fetched by header fetches.
    #[serde(default)]
    pub header_properties: Option<Vec<Property>>,

    /// Override of the properties fetched by detail fetches.
    #[serde(default)]
    pub detail_properties: Option<Vec<Property>>,
}

impl SyncConfig {
    pub fn max_changes_ladder(&self) -> Vec<usize> {
        match &self.max_changes_ladder {
            Some(ladder) if !ladder.is_empty() => ladder.clone(),
            _ => DEFAULT_MAX_CHANGES_LADDER.to_vec(),
        }
    }

    pub fn fetch_records_first(&self) -> bool {
        self.fetch_records_first.unwrap_or(true)
    }

    pub fn header_properties(&self) -> Vec<Property> {
        self.header_properties
            .clone()
            .unwrap_or_else(|| HEADER_PROPERTIES.to_vec())
    }

    pub fn detail_properties(&self) -> Vec<Property> {
        self.detail_properties
            .clone()
            .unwrap_or_else(|| DETAIL_PROPERTIES.to_vec())
    }
}
