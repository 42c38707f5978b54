//! Core record schema and category table for the opportunity ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "evf-core";

/// Firestore collection every category is written into.
pub const OPPORTUNITIES_COLLECTION: &str = "opportunities";

/// Normalized opportunity shared by events, hackathons, internships and jobs.
///
/// Deserialization ignores unknown keys, and an explicit `null` for `id` or
/// `isRemote` reads the same as a missing key. Serialization always emits the full
/// field set, with absent optionals as `null`, because that is the document
/// body written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default, rename = "isRemote", deserialize_with = "null_as_default")]
    pub remote: bool,
    #[serde(default)]
    pub deadline: Option<String>,
    #[serde(default)]
    pub domains: Option<Vec<String>>,
    #[serde(default)]
    pub skills: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    /// Internships and jobs.
    #[serde(default)]
    pub stipend: Option<String>,
    /// Hackathons.
    #[serde(default)]
    pub reward: Option<String>,
    /// Internships.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Opportunity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// True when `id` can be used as a document key.
    pub fn has_document_key(&self) -> bool {
        !self.id.trim().is_empty()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Read-side filter over stored opportunities.
///
/// `location` keeps records whose location contains it (case-insensitive) or
/// mentions "remote". `domains` keeps records sharing at least one domain with
/// it, compared case-insensitively. Records missing the filtered attribute are
/// dropped. Empty criteria match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpportunityFilter {
    pub location: Option<String>,
    pub domains: Vec<String>,
}

impl OpportunityFilter {
    /// Builds a filter from raw query values; `domains` is comma-separated.
    pub fn from_query(location: Option<&str>, domains: Option<&str>) -> Self {
        let location = location
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase);
        let domains = domains
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_lowercase)
                    .collect()
            })
            .unwrap_or_default();
        Self { location, domains }
    }

    pub fn is_empty(&self) -> bool {
        self.location.is_none() && self.domains.is_empty()
    }

    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        if let Some(wanted) = &self.location {
            let Some(location) = opportunity.location.as_deref() else {
                return false;
            };
            let location = location.to_lowercase();
            if !location.contains(wanted.as_str()) && !location.contains("remote") {
                return false;
            }
        }
        if !self.domains.is_empty() {
            let Some(domains) = opportunity.domains.as_deref() else {
                return false;
            };
            let overlap = domains
                .iter()
                .any(|d| self.domains.contains(&d.to_lowercase()));
            if !overlap {
                return false;
            }
        }
        true
    }

    /// Keeps matching records in their original order.
    pub fn apply(&self, opportunities: Vec<Opportunity>) -> Vec<Opportunity> {
        opportunities
            .into_iter()
            .filter(|o| self.matches(o))
            .collect()
    }
}

/// Source category of a fixture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Events,
    Hackathons,
    Internships,
    Jobs,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Events,
        Category::Hackathons,
        Category::Internships,
        Category::Jobs,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            Category::Events => "events",
            Category::Hackathons => "hackathons",
            Category::Internships => "internships",
            Category::Jobs => "jobs",
        }
    }

    /// Fixture location relative to the resources root.
    pub fn resource_path(self) -> &'static str {
        match self {
            Category::Events => "data/events.json",
            Category::Hackathons => "data/hackathons.json",
            Category::Internships => "data/internships.json",
            Category::Jobs => "data/jobs.json",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Category::Events => "EVENTS",
            Category::Hackathons => "HACKATHONS",
            Category::Internships => "INTERNSHIPS",
            Category::Jobs => "JOBS",
        }
    }

    pub fn route(self) -> &'static str {
        match self {
            Category::Events => "/sync-events",
            Category::Hackathons => "/sync-hackathons",
            Category::Internships => "/sync-internships",
            Category::Jobs => "/sync-jobs",
        }
    }

    pub fn ack_message(self) -> &'static str {
        match self {
            Category::Events => "Events synced!",
            Category::Hackathons => "Hackathons synced!",
            Category::Internships => "Internships synced!",
            Category::Jobs => "Jobs synced!",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCategory(pub String);

impl fmt::Display for UnknownCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown category `{}` (expected events, hackathons, internships or jobs)",
            self.0
        )
    }
}

impl std::error::Error for UnknownCategory {}

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.tag() == wanted)
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}
