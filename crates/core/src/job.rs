use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Which family of public body a scraper collects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Provincial,
    Municipal,
    Parliamentary,
    Civic,
    /// Incremental refresh jobs over already-collected data.
    Update,
    Other,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Provincial,
        Category::Municipal,
        Category::Parliamentary,
        Category::Civic,
        Category::Update,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Provincial => "provincial",
            Category::Municipal => "municipal",
            Category::Parliamentary => "parliamentary",
            Category::Civic => "civic",
            Category::Update => "update",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == needle)
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "category",
                value: s.to_string(),
            })
    }
}

/// Coarse runtime/footprint hint. Drives timeout budgets and pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
        }
    }

    /// Contribution to the "heaviness" of a batch when sizing the slot pool.
    pub fn weight(&self) -> f64 {
        match self {
            SizeClass::Small => 0.0,
            SizeClass::Medium => 0.5,
            SizeClass::Large => 1.0,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SizeClass {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(SizeClass::Small),
            "medium" => Ok(SizeClass::Medium),
            "large" => Ok(SizeClass::Large),
            _ => Err(CoreError::UnknownVariant {
                kind: "size class",
                value: s.to_string(),
            }),
        }
    }
}

/// Recurring schedule a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
    /// Only ever run by explicit request.
    Manual,
}

impl Cadence {
    /// Cadences that fire on their own.
    pub const RECURRING: [Cadence; 3] = [Cadence::Daily, Cadence::Weekly, Cadence::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
            Cadence::Monthly => "monthly",
            Cadence::Manual => "manual",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Cadence::Daily),
            "weekly" => Ok(Cadence::Weekly),
            "monthly" => Ok(Cadence::Monthly),
            "manual" => Ok(Cadence::Manual),
            _ => Err(CoreError::UnknownVariant {
                kind: "cadence",
                value: s.to_string(),
            }),
        }
    }
}

/// Static description of one scraper unit. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique across the registry.
    pub name: String,
    pub category: Category,
    pub size: SizeClass,
    #[serde(default = "default_cadence")]
    pub cadence: Cadence,
}

fn default_cadence() -> Cadence {
    Cadence::Manual
}

impl JobSpec {
    pub fn new(name: impl Into<String>, category: Category, size: SizeClass, cadence: Cadence) -> Self {
        Self {
            name: name.into(),
            category,
            size,
            cadence,
        }
    }
}
