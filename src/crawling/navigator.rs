//! Page navigator contract
//!
//! The crawl never inspects navigation mechanics; it only calls `fetch` with
//! a locator and a timeout and reacts to the result.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::NavError;
use crate::domain::{Locator, Region};

/// Whether the page finished rendering when it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    Complete,
    Loading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContent {
    pub locator: Locator,
    pub body: String,
    pub render_state: RenderState,
}

impl PageContent {
    pub fn complete(locator: Locator, body: impl Into<String>) -> Self {
        Self {
            locator,
            body: body.into(),
            render_state: RenderState::Complete,
        }
    }

    pub fn loading(locator: Locator) -> Self {
        Self {
            locator,
            body: String::new(),
            render_state: RenderState::Loading,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.render_state == RenderState::Loading
    }
}

#[async_trait]
pub trait PageNavigator: Send + Sync {
    /// Loads one page. Implementations must give up after `timeout`.
    async fn fetch(&self, locator: &Locator, timeout: Duration) -> Result<PageContent, NavError>;

    /// The Region/Subregion listing, read once per run.
    async fn discover_regions(&self, timeout: Duration) -> Result<Vec<Region>, NavError>;
}
