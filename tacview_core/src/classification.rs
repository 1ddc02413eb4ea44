//! Decoding of hierarchical classification strings.
//!
//! Reports carry a CoT-style type such as `a-f-G-U-C`:
//!
//! ```text
//! a  -  f  -  G  -  U-C
//! |     |     |     └── role (opaque here)
//! |     |     └──────── battle dimension  -> Category
//! |     └────────────── affiliation       -> Affiliation
//! └──────────────────── atom
//! ```
//!
//! The engine only needs affiliation and dimension for filtering and
//! grouping. Free-text classifications like `"hostile"` are accepted too.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Friend/foe grouping used for filtering and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affiliation {
    Friendly,
    Hostile,
    Neutral,
    Unknown,
}

impl Affiliation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Affiliation::Friendly => "friendly",
            Affiliation::Hostile => "hostile",
            Affiliation::Neutral => "neutral",
            Affiliation::Unknown => "unknown",
        }
    }

    /// Maps a single CoT affiliation letter.
    ///
    /// Assumed-friend counts as friendly; suspect, joker and faker count as
    /// hostile. Pending and anything unrecognised is unknown.
    fn from_cot_letter(letter: &str) -> Self {
        match letter {
            "f" | "a" => Affiliation::Friendly,
            "h" | "s" | "j" | "k" => Affiliation::Hostile,
            "n" => Affiliation::Neutral,
            _ => Affiliation::Unknown,
        }
    }
}

impl fmt::Display for Affiliation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battle dimension of a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ground,
    Air,
    SeaSurface,
    Subsurface,
    Space,
    SpecialOps,
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Ground => "ground",
            Category::Air => "air",
            Category::SeaSurface => "sea_surface",
            Category::Subsurface => "subsurface",
            Category::Space => "space",
            Category::SpecialOps => "special_ops",
            Category::Other => "other",
        }
    }

    fn from_cot_letter(letter: &str) -> Self {
        match letter {
            "G" | "g" => Category::Ground,
            "A" | "a" => Category::Air,
            "S" | "s" => Category::SeaSurface,
            "U" | "u" => Category::Subsurface,
            "P" | "p" => Category::Space,
            "F" | "f" => Category::SpecialOps,
            _ => Category::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Affiliation and dimension extracted from one classification string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub affiliation: Affiliation,
    pub category: Category,
}

impl Classification {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let mut parts = trimmed.split('-');
        let atom = parts.next().unwrap_or_default();
        let affiliation = parts.next();
        let dimension = parts.next();

        if let (1, Some(aff)) = (atom.len(), affiliation) {
            if aff.len() == 1 {
                return Self {
                    affiliation: Affiliation::from_cot_letter(&aff.to_ascii_lowercase()),
                    category: dimension.map(Category::from_cot_letter).unwrap_or(Category::Other),
                };
            }
        }

        Self {
            affiliation: affiliation_from_words(trimmed),
            category: Category::Other,
        }
    }
}

fn affiliation_from_words(raw: &str) -> Affiliation {
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("friend") {
        Affiliation::Friendly
    } else if lower.starts_with("hostile") || lower.starts_with("enemy") {
        Affiliation::Hostile
    } else if lower.starts_with("neutral") {
        Affiliation::Neutral
    } else {
        Affiliation::Unknown
    }
}
