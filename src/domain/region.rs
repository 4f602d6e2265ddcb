//! Region hierarchy
//!
//! Regions and Subregions are discovered once per run and never mutated.
//! The only moving part is the `PageCursor` the traversal keeps per
//! Subregion.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level partition of the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub subregions: Vec<Subregion>,
}

impl Region {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            subregions: Vec::new(),
        }
    }

    /// Adds a subregion, filling in its back-reference.
    #[must_use]
    pub fn with_subregion(mut self, id: impl Into<String>, name: impl Into<String>) -> Self {
        let subregion = Subregion {
            id: id.into(),
            name: name.into(),
            region_id: self.id.clone(),
        };
        self.subregions.push(subregion);
        self
    }

    /// Re-links subregion back-references after deserialization.
    #[must_use]
    pub fn linked(mut self) -> Self {
        for subregion in &mut self.subregions {
            subregion.region_id.clone_from(&self.id);
        }
        self
    }

    /// File-name friendly form of the display name.
    pub fn slug(&self) -> String {
        let source = if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        };
        source
            .trim()
            .replace('&', "AND")
            .chars()
            .map(|c| match c {
                ' ' | '/' | '\\' => '_',
                c if c.is_alphanumeric() || c == '_' || c == '-' => c,
                _ => '_',
            })
            .collect::<String>()
            .to_uppercase()
    }

    /// Case-insensitive match against either the id or the display name.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.id.eq_ignore_ascii_case(selector) || self.name.eq_ignore_ascii_case(selector)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Second-level partition; holds a back-reference (by id) to its Region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subregion {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub region_id: String,
}

impl Subregion {
    /// Case-insensitive match on id or display name.
    pub fn matches(&self, selector: &str) -> bool {
        let selector = selector.trim();
        self.id.eq_ignore_ascii_case(selector) || self.name.eq_ignore_ascii_case(selector)
    }
}

impl fmt::Display for Subregion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Zero-based page position within one Subregion. Only ever moves forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageCursor(u32);

impl PageCursor {
    pub const fn first() -> Self {
        Self(0)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn is_first(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the navigator is asked to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    ListPage {
        region_id: String,
        subregion_id: String,
        page: u32,
    },
    Detail(String),
}

impl Locator {
    pub fn list_page(subregion: &Subregion, cursor: PageCursor) -> Self {
        Self::ListPage {
            region_id: subregion.region_id.clone(),
            subregion_id: subregion.id.clone(),
            page: cursor.index(),
        }
    }

    pub fn detail(reference: impl Into<String>) -> Self {
        Self::Detail(reference.into())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ListPage {
                region_id,
                subregion_id,
                page,
            } => write!(f, "list[{region_id}/{subregion_id}#{page}]"),
            Self::Detail(reference) => write!(f, "detail[{reference}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slug_normalises_display_name() {
        let region = Region::new("28", "Andaman & Nicobar/Islands");
        assert_eq!(region.slug(), "ANDAMAN_AND_NICOBAR_ISLANDS");
    }

    #[test]
    fn test_slug_falls_back_to_id() {
        let region = Region::new("r-7", "  ");
        assert_eq!(region.slug(), "R-7");
    }

    #[test]
    fn test_with_subregion_sets_back_reference() {
        let region = Region::new("n", "North").with_subregion("n1", "North One");
        assert_eq!(region.subregions[0].region_id, "n");
    }

    #[test]
    fn test_linked_repairs_back_references() {
        let mut region = Region::new("s", "South");
        region.subregions.push(Subregion {
            id: "s1".into(),
            name: "South One".into(),
            region_id: String::new(),
        });
        let region = region.linked();
        assert_eq!(region.subregions[0].region_id, "s");
    }

    #[test]
    fn test_matches_id_or_name_case_insensitively() {
        let region = Region::new("KA", "Karnataka");
        assert!(region.matches("ka"));
        assert!(region.matches(" KARNATAKA "));
        assert!(!region.matches("Kerala"));
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let cursor = PageCursor::first();
        assert!(cursor.is_first());
        let next = cursor.next();
        assert_eq!(next.index(), 1);
        assert!(next > cursor);
    }

    #[test]
    fn test_list_locator_display() {
        let region = Region::new("n", "North").with_subregion("n1", "North One");
        let locator = Locator::list_page(&region.subregions[0], PageCursor::first().next());
        assert_eq!(locator.to_string(), "list[n/n1#1]");
    }
}
