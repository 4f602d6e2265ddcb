//! Record extractor contract
//!
//! Pure functions of page content. List pages yield candidate fragments and
//! the state of the "next" control; fields are extracted per fragment only
//! after the structural filter let it through.

use std::collections::BTreeMap;

use super::errors::ExtractError;
use super::navigator::PageContent;
use crate::domain::{RawFragment, RawRecord};

/// Structural state of the "next page" affordance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextControl {
    Enabled,
    /// Present and structurally disabled: the only trusted end-of-data signal.
    Disabled,
    /// Not found at all; may simply not be rendered yet.
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    pub fragments: Vec<RawFragment>,
    pub next: NextControl,
}

pub type DetailFields = BTreeMap<String, String>;

pub trait RecordExtractor: Send + Sync {
    fn extract_list(&self, page: &PageContent) -> Result<ListPage, ExtractError>;

    fn extract_fields(&self, fragment: &RawFragment) -> RawRecord;

    /// Label → value pairs of a detail page, keyed by detail field name.
    fn extract_detail(&self, page: &PageContent) -> Result<DetailFields, ExtractError>;
}
