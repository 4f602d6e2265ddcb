//! Nested grouping scan
//!
//! Detail pages nest groupings (e.g. a "Teachers" block with total, male
//! and female counts) at varying depths. Each value element is paired with
//! the nearest ancestor, within a bounded window, whose text carries a
//! known label. An ancestor holding more than one value is ambiguous and
//! ends the search for that value.

use std::collections::BTreeMap;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::crawling::errors::ExtractError;
use crate::domain::collapse_whitespace;
use crate::infrastructure::config::{GroupingRule, LabelRule};

const HEADINGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];

#[derive(Debug, Clone)]
struct Label {
    field: String,
    contains: String,
    excludes: Vec<String>,
}

impl Label {
    fn from_rule(rule: &LabelRule) -> Self {
        Self {
            field: rule.field.clone(),
            contains: rule.contains.to_lowercase(),
            excludes: rule.excludes.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    fn matches(&self, text: &str) -> bool {
        text.contains(&self.contains) && !self.excludes.iter().any(|e| text.contains(e))
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    heading: String,
    values: Selector,
    window: usize,
    labels: Vec<Label>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupingScanner {
    rules: Vec<CompiledRule>,
}

fn text_of(element: ElementRef<'_>) -> String {
    collapse_whitespace(&element.text().collect::<String>())
}

impl GroupingScanner {
    pub fn new(rules: &[GroupingRule]) -> Result<Self, ExtractError> {
        let rules = rules
            .iter()
            .map(|rule| {
                let values = Selector::parse(&rule.value_selector).map_err(|e| ExtractError::Selector {
                    selector: rule.value_selector.clone(),
                    reason: e.to_string(),
                })?;
                Ok(CompiledRule {
                    heading: rule.heading.to_lowercase(),
                    values,
                    window: rule.ancestor_window,
                    labels: rule.labels.iter().map(Label::from_rule).collect(),
                })
            })
            .collect::<Result<Vec<_>, ExtractError>>()?;
        Ok(Self { rules })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Field → value for every grouping found in `html`. First match wins.
    pub fn scan(&self, html: &str) -> BTreeMap<String, String> {
        let mut found = BTreeMap::new();
        if self.rules.is_empty() {
            return found;
        }
        let document = Html::parse_document(html);
        for rule in &self.rules {
            Self::scan_rule(rule, &document, &mut found);
        }
        found
    }

    fn scan_rule(rule: &CompiledRule, document: &Html, found: &mut BTreeMap<String, String>) {
        let mut current_heading = String::new();
        for node in document.root_element().descendants() {
            let Some(element) = ElementRef::wrap(node) else {
                continue;
            };
            if HEADINGS.contains(&element.value().name()) {
                current_heading = text_of(element).to_lowercase();
                continue;
            }
            if !rule.values.matches(&element) {
                continue;
            }
            let value = text_of(element);
            if value.is_empty() {
                continue;
            }
            let in_group = current_heading.contains(&rule.heading);
            let value_lower = value.to_lowercase();

            for ancestor in element.ancestors().filter_map(ElementRef::wrap).take(rule.window) {
                if ancestor.select(&rule.values).count() > 1 {
                    break;
                }
                let label_text = text_of(ancestor).to_lowercase().replacen(&value_lower, "", 1);
                let Some(label) = rule.labels.iter().find(|l| l.matches(&label_text)) else {
                    continue;
                };
                if in_group || label_text.contains(&rule.heading) {
                    debug!(field = %label.field, value = %value, "Grouped value found");
                    found.entry(label.field.clone()).or_insert_with(|| value.clone());
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner() -> GroupingScanner {
        GroupingScanner::new(&[GroupingRule::teachers()]).unwrap()
    }

    #[test]
    fn test_flat_grouping_under_heading() {
        let html = r#"
            <h2>Teachers</h2>
            <ul>
              <li><span>Total Teachers</span><span class="value">12</span></li>
              <li><span>Male</span><span class="value">5</span></li>
              <li><span>Female</span><span class="value">7</span></li>
            </ul>"#;
        let found = scanner().scan(html);
        assert_eq!(found.get("total_teachers").map(String::as_str), Some("12"));
        assert_eq!(found.get("male_teachers").map(String::as_str), Some("5"));
        assert_eq!(found.get("female_teachers").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_label_found_at_varying_depth() {
        let html = r#"
            <h3>Teacher details</h3>
            <div>
              <div class="row"><p>Total</p><div><div><b class="value">9</b></div></div></div>
              <div class="row"><label>Female</label><i><span class="value">4</span></i></div>
            </div>"#;
        let found = scanner().scan(html);
        assert_eq!(found.get("total_teachers").map(String::as_str), Some("9"));
        assert_eq!(found.get("female_teachers").map(String::as_str), Some("4"));
        assert!(!found.contains_key("male_teachers"));
    }

    #[test]
    fn test_label_outside_window_is_ignored() {
        let html = r#"
            <h2>Teachers</h2>
            <section><p>Male</p>
              <div><div><div><div><div><span class="value">3</span></div></div></div></div></div>
            </section>"#;
        assert!(scanner().scan(html).is_empty());
    }

    #[test]
    fn test_other_groupings_are_not_mistaken_for_teachers() {
        let html = r#"
            <h2>Students</h2>
            <ul>
              <li><span>Total Students</span><span class="value">300</span></li>
              <li><span>Male</span><span class="value">150</span></li>
            </ul>"#;
        assert!(scanner().scan(html).is_empty());
    }

    #[test]
    fn test_label_carrying_heading_word_counts_without_heading() {
        let html = r#"<div><span>Total Teachers</span><span class="value">11</span></div>"#;
        let found = scanner().scan(html);
        assert_eq!(found.get("total_teachers").map(String::as_str), Some("11"));
    }

    #[test]
    fn test_invalid_selector_rejected() {
        let mut rule = GroupingRule::teachers();
        rule.value_selector = "[[".into();
        assert!(matches!(
            GroupingScanner::new(&[rule]),
            Err(ExtractError::Selector { .. })
        ));
    }
}
