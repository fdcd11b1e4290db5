use std::fmt;

use serde::{Deserialize, Serialize};

/// The fixed set of entity collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Regions,
    Summits,
    Routes,
    Climbers,
    Ascents,
}

impl Collection {
    /// Dependency order: every collection only references collections before it.
    pub const ORDERED: [Collection; 5] = [
        Collection::Regions,
        Collection::Summits,
        Collection::Routes,
        Collection::Climbers,
        Collection::Ascents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regions => "regions",
            Self::Summits => "summits",
            Self::Routes => "routes",
            Self::Climbers => "climbers",
            Self::Ascents => "ascents",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ORDERED.into_iter().find(|c| c.as_str() == name)
    }

    /// Singular entity name, used in log lines ("summit 'Lokomotive'").
    pub fn entity_name(&self) -> &'static str {
        match self {
            Self::Regions => "region",
            Self::Summits => "summit",
            Self::Routes => "route",
            Self::Climbers => "climber",
            Self::Ascents => "ascent",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Natural keys
// ---------------------------------------------------------------------------

const KEY_SEPARATOR: char = '\u{1f}';

/// Human-meaningful uniqueness key of a document within its collection.
///
/// Parts are joined with the ASCII unit separator, which never appears in
/// names coming from the sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = String::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(part.as_ref());
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split(KEY_SEPARATOR)
    }
}

impl From<&str> for NaturalKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<&str> = self.parts().collect();
        write!(f, "{}", parts.join(" / "))
    }
}
