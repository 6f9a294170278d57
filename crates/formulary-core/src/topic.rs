//! Category-to-topic mapping.
//!
//! A subject's topic is derived from its primary discipline through a fixed
//! rule table. Resolution is total: when no rule applies the subject lands
//! in the sentinel `uncategorized` topic.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::handle::Handle;

/// Sentinel topic for subjects without an applicable rule.
pub const UNCATEGORIZED_TOPIC: &str = "uncategorized";

/// Built-in rules: leaf disciplines seeded by the catalog map to same-named topics.
const BUILTIN_RULES: &[(&str, &str)] = &[
    ("classical_mechanics", "classical_mechanics"),
    ("relativity", "relativity"),
    ("pure_mathematics", "pure_mathematics"),
    ("combinatorics", "combinatorics"),
    ("probability", "probability"),
    ("statistics", "statistics"),
];

/// What to do when the primary discipline has no rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicFallback {
    /// Assign the default topic even though a primary discipline exists.
    #[default]
    Uncategorized,
    /// Walk up the discipline hierarchy looking for a rule first.
    Ancestor,
}

impl FromStr for TopicFallback {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "uncategorized" => Ok(Self::Uncategorized),
            "ancestor" => Ok(Self::Ancestor),
            other => Err(Error::Config(format!(
                "topic fallback must be 'uncategorized' or 'ancestor', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TopicFallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uncategorized => f.write_str("uncategorized"),
            Self::Ancestor => f.write_str("ancestor"),
        }
    }
}

/// How a topic assignment was reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSource {
    /// The primary discipline has a rule.
    Mapped,
    /// An ancestor of the primary discipline has a rule.
    Ancestor { via: Handle },
    /// A primary discipline exists but nothing in scope maps.
    Unmapped { discipline: Handle },
    /// The subject has no primary discipline.
    NoPrimary,
}

/// Result of resolving a subject's topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicAssignment {
    pub topic: Handle,
    pub source: TopicSource,
}

impl TopicAssignment {
    pub fn is_fallback(&self) -> bool {
        matches!(
            self.source,
            TopicSource::Unmapped { .. } | TopicSource::NoPrimary
        )
    }
}

#[derive(Debug, Deserialize)]
struct TopicMapFile {
    #[serde(default)]
    fallback: Option<TopicFallback>,
    #[serde(default)]
    default_topic: Option<String>,
    #[serde(default)]
    rules: BTreeMap<String, String>,
}

/// Fixed table of discipline-handle to topic-handle rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMap {
    rules: BTreeMap<Handle, Handle>,
    fallback: TopicFallback,
    default_topic: Handle,
}

impl TopicMap {
    /// Empty map; everything resolves to `uncategorized`.
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
            fallback: TopicFallback::default(),
            default_topic: Handle::parse(UNCATEGORIZED_TOPIC).expect("sentinel is a valid handle"),
        }
    }

    /// The catalog's built-in rule table.
    pub fn builtin() -> Self {
        let mut map = Self::empty();
        for (discipline, topic) in BUILTIN_RULES {
            map.rules.insert(
                Handle::parse(discipline).expect("builtin handle"),
                Handle::parse(topic).expect("builtin handle"),
            );
        }
        map
    }

    pub fn with_rule(mut self, discipline: Handle, topic: Handle) -> Self {
        self.rules.insert(discipline, topic);
        self
    }

    pub fn with_fallback(mut self, fallback: TopicFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Parse a YAML rule file:
    ///
    /// ```yaml
    /// fallback: uncategorized   # or: ancestor
    /// default_topic: uncategorized
    /// rules:
    ///   classical_mechanics: classical_mechanics
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: TopicMapFile = serde_yaml::from_str(yaml)?;
        let mut map = Self::empty();
        if let Some(fallback) = file.fallback {
            map.fallback = fallback;
        }
        if let Some(default_topic) = file.default_topic {
            map.default_topic = Handle::parse(&default_topic)?;
        }
        for (discipline, topic) in file.rules {
            map.rules
                .insert(Handle::parse(&discipline)?, Handle::parse(&topic)?);
        }
        Ok(map)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    pub fn fallback(&self) -> TopicFallback {
        self.fallback
    }

    pub fn default_topic(&self) -> &Handle {
        &self.default_topic
    }

    pub fn rule(&self, discipline: &Handle) -> Option<&Handle> {
        self.rules.get(discipline)
    }

    /// Every topic handle the map can produce, default included.
    pub fn topics(&self) -> Vec<Handle> {
        let mut topics: Vec<Handle> = self.rules.values().cloned().collect();
        topics.push(self.default_topic.clone());
        topics.sort();
        topics.dedup();
        topics
    }

    /// Resolve a topic from the primary discipline chain.
    ///
    /// `chain` starts with the primary discipline's handle followed by its
    /// ancestors, nearest first. An empty chain means no primary link.
    pub fn resolve(&self, chain: &[Handle]) -> TopicAssignment {
        let Some(primary) = chain.first() else {
            return TopicAssignment {
                topic: self.default_topic.clone(),
                source: TopicSource::NoPrimary,
            };
        };

        if let Some(topic) = self.rules.get(primary) {
            return TopicAssignment {
                topic: topic.clone(),
                source: TopicSource::Mapped,
            };
        }

        if self.fallback == TopicFallback::Ancestor {
            for ancestor in &chain[1..] {
                if let Some(topic) = self.rules.get(ancestor) {
                    return TopicAssignment {
                        topic: topic.clone(),
                        source: TopicSource::Ancestor {
                            via: ancestor.clone(),
                        },
                    };
                }
            }
        }

        TopicAssignment {
            topic: self.default_topic.clone(),
            source: TopicSource::Unmapped {
                discipline: primary.clone(),
            },
        }
    }
}

impl Default for TopicMap {
    fn default() -> Self {
        Self::builtin()
    }
}
