//! Selector-driven HTML extractor
//!
//! All selectors come from configuration and are parsed once up front, so a
//! typo fails at startup rather than on page 300.

use std::collections::BTreeMap;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::crawling::errors::ExtractError;
use crate::crawling::extractor::{DetailFields, ListPage, NextControl, RecordExtractor};
use crate::crawling::navigator::PageContent;
use crate::domain::{RawFragment, RawRecord, collapse_whitespace};
use crate::infrastructure::config::{DetailSelectors, ListSelectors};

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

fn text_of(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

pub struct HtmlExtractor {
    record: Selector,
    fields: Vec<(String, Selector)>,
    field_patterns: Vec<(String, Regex)>,
    detail_link: Selector,
    any_link: Selector,
    detail_field: String,
    next_control: Selector,
    disabled_class: String,
    item: Selector,
    label: Selector,
    value: Selector,
    detail_labels: Vec<(String, String)>,
}

impl HtmlExtractor {
    /// `detail_field` names the record field the detail link is stored under.
    pub fn new(
        list: &ListSelectors,
        detail: &DetailSelectors,
        detail_field: &str,
    ) -> Result<Self, ExtractError> {
        let fields = list
            .fields
            .iter()
            .map(|(field, selector)| Ok((field.clone(), parse_selector(selector)?)))
            .collect::<Result<Vec<_>, ExtractError>>()?;
        let field_patterns = list
            .field_patterns
            .iter()
            .map(|(field, pattern)| {
                Regex::new(pattern)
                    .map(|re| (field.clone(), re))
                    .map_err(|e| ExtractError::Selector {
                        selector: pattern.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, ExtractError>>()?;

        // Longest label first so "total boys" beats "boys"
        let mut detail_labels: Vec<(String, String)> = detail
            .labels
            .iter()
            .map(|(label, field)| (label.to_lowercase(), field.clone()))
            .collect();
        detail_labels.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));

        Ok(Self {
            record: parse_selector(&list.record)?,
            fields,
            field_patterns,
            detail_link: parse_selector(&list.detail_link)?,
            any_link: parse_selector("a[href]")?,
            detail_field: detail_field.to_string(),
            next_control: parse_selector(&list.next_control)?,
            disabled_class: list.disabled_class.clone(),
            item: parse_selector(&detail.item)?,
            label: parse_selector(&detail.label)?,
            value: parse_selector(&detail.value)?,
            detail_labels,
        })
    }

    fn is_disabled(&self, control: ElementRef<'_>) -> bool {
        let has_class = |element: ElementRef<'_>| element.value().classes().any(|c| c == self.disabled_class);
        let value = control.value();
        has_class(control)
            || value.attr("disabled").is_some()
            || value.attr("aria-disabled").is_some_and(|v| v.eq_ignore_ascii_case("true"))
            || control.parent().and_then(ElementRef::wrap).is_some_and(has_class)
    }

    fn next_state(&self, document: &Html) -> NextControl {
        match document.select(&self.next_control).next() {
            None => NextControl::Absent,
            Some(control) if self.is_disabled(control) => NextControl::Disabled,
            Some(_) => NextControl::Enabled,
        }
    }

    /// First capture of the field's pattern, when it has one and it matches.
    fn capture(&self, field: &str, text: &str) -> Option<String> {
        let (_, pattern) = self.field_patterns.iter().find(|(f, _)| f == field)?;
        pattern
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
    }

    fn detail_field_for(&self, label: &str) -> Option<&str> {
        let label = label.to_lowercase();
        self.detail_labels
            .iter()
            .find(|(key, _)| label.contains(key.as_str()))
            .map(|(_, field)| field.as_str())
    }
}

impl RecordExtractor for HtmlExtractor {
    fn extract_list(&self, page: &PageContent) -> Result<ListPage, ExtractError> {
        if !page.body.contains('<') {
            return Err(ExtractError::Malformed(format!("{} returned no markup", page.locator)));
        }
        let document = Html::parse_document(&page.body);
        let fragments: Vec<RawFragment> = document
            .select(&self.record)
            .map(|element| RawFragment::new(text_of(element), element.html()))
            .collect();
        let next = self.next_state(&document);
        debug!(locator = %page.locator, fragments = fragments.len(), next = ?next, "List page extracted");
        Ok(ListPage { fragments, next })
    }

    fn extract_fields(&self, fragment: &RawFragment) -> RawRecord {
        let html = Html::parse_fragment(&fragment.markup);
        let mut record = RawRecord::new();
        for (field, selector) in &self.fields {
            if let Some(value) = html.select(selector).map(text_of).find(|v| !v.is_empty()) {
                let value = self.capture(field, &value).unwrap_or(value);
                record.insert(field.clone(), value);
            }
        }
        for (field, pattern) in &self.field_patterns {
            if record.get(field).is_some() {
                continue;
            }
            if let Some(value) = pattern.captures(&fragment.text).and_then(|c| c.get(1)) {
                record.insert(field.clone(), value.as_str().trim());
            }
        }
        let link = html
            .select(&self.detail_link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .or_else(|| {
                html.select(&self.any_link)
                    .filter_map(|a| a.value().attr("href"))
                    .find(|href| href.contains("detail"))
            });
        if let Some(href) = link {
            record.insert(self.detail_field.clone(), href.trim());
        }
        record
    }

    fn extract_detail(&self, page: &PageContent) -> Result<DetailFields, ExtractError> {
        let document = Html::parse_document(&page.body);
        let mut fields = BTreeMap::new();
        for item in document.select(&self.item) {
            let Some(label) = item.select(&self.label).next().map(text_of) else {
                continue;
            };
            let Some(value) = item.select(&self.value).next().map(text_of) else {
                continue;
            };
            if value.is_empty() {
                continue;
            }
            if let Some(field) = self.detail_field_for(&label) {
                fields.entry(field.to_string()).or_insert(value);
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Locator;

    fn extractor() -> HtmlExtractor {
        HtmlExtractor::new(&ListSelectors::default(), &DetailSelectors::default(), "detail_url").unwrap()
    }

    fn page(body: &str) -> PageContent {
        PageContent::complete(Locator::detail("test"), body)
    }

    const LIST: &str = r#"
        <html><body>
          <ul>
            <li class="record">
              <span class="name">Govt Primary School</span>
              <span class="code">Code: 12345678</span>
              <span class="address">1, Main
                 Road</span>
              <a class="detail-link" href="/detail/12345678">View</a>
            </li>
            <li class="record"></li>
          </ul>
          <div class="pager"><a class="nextBtn" href="?page=2">Next</a></div>
        </body></html>"#;

    #[test]
    fn test_list_fragments_and_next_enabled() {
        let list = extractor().extract_list(&page(LIST)).unwrap();
        assert_eq!(list.fragments.len(), 2);
        assert_eq!(list.next, NextControl::Enabled);
        assert!(list.fragments[0].text.contains("Govt Primary School"));
        assert!(list.fragments[1].text.is_empty());
    }

    #[test]
    fn test_fields_extracted_with_pattern_fallback() {
        let extractor = extractor();
        let list = extractor.extract_list(&page(LIST)).unwrap();
        let record = extractor.extract_fields(&list.fragments[0]);
        assert_eq!(record.get("name"), Some("Govt Primary School"));
        assert_eq!(record.get("address"), Some("1, Main Road"));
        assert_eq!(record.get("code"), Some("12345678"));
        assert_eq!(record.get("detail_url"), Some("/detail/12345678"));
    }

    #[test]
    fn test_code_pattern_used_when_selector_misses() {
        let extractor = extractor();
        let fragment = RawFragment::new(
            "Sunrise School code : 87654321",
            r#"<li class="record"><b>Sunrise School</b> code : 87654321</li>"#,
        );
        let record = extractor.extract_fields(&fragment);
        assert_eq!(record.get("code"), Some("87654321"));
    }

    #[test]
    fn test_next_control_states() {
        let extractor = extractor();
        let disabled_own = r#"<div><a class="nextBtn disabled">Next</a></div>"#;
        let disabled_parent = r#"<ul><li class="disabled"><a class="nextBtn">Next</a></li></ul>"#;
        let disabled_aria = r#"<div><a class="nextBtn" aria-disabled="true">Next</a></div>"#;
        let absent = r#"<div><span>No pager</span></div>"#;
        for body in [disabled_own, disabled_parent, disabled_aria] {
            assert_eq!(extractor.extract_list(&page(body)).unwrap().next, NextControl::Disabled);
        }
        assert_eq!(extractor.extract_list(&page(absent)).unwrap().next, NextControl::Absent);
    }

    #[test]
    fn test_plain_text_is_malformed() {
        assert!(matches!(
            extractor().extract_list(&page("Service temporarily unavailable")),
            Err(ExtractError::Malformed(_))
        ));
    }

    #[test]
    fn test_detail_labels_mapped() {
        let body = r#"
            <ul>
              <li><span class="label">Academic Year</span><span class="value">2023-24</span></li>
              <li><span class="label">Total Students</span><span class="value">412</span></li>
              <li><span class="label">Boys</span><span class="value">200</span></li>
              <li><span class="label">Unknown thing</span><span class="value">x</span></li>
              <li><span class="label">Girls</span><span class="value"> </span></li>
            </ul>"#;
        let fields = extractor().extract_detail(&page(body)).unwrap();
        assert_eq!(fields.get("academic_year").map(String::as_str), Some("2023-24"));
        assert_eq!(fields.get("total_students").map(String::as_str), Some("412"));
        assert_eq!(fields.get("total_boys").map(String::as_str), Some("200"));
        assert!(!fields.contains_key("total_girls"));
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_bad_selector_rejected() {
        let list = ListSelectors {
            record: "li[".into(),
            ..ListSelectors::default()
        };
        assert!(matches!(
            HtmlExtractor::new(&list, &DetailSelectors::default(), "detail_url"),
            Err(ExtractError::Selector { .. })
        ));
    }
}
