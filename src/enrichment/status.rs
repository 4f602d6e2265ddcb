//! Extraction status law
//!
//! Graded on critical fields only: SUCCESS when all are present, PARTIAL
//! when at least one is, FAILED when none is or the fetch failed. The count
//! of extracted detail fields is kept for quality triage and does not
//! affect the grade.

use std::collections::BTreeMap;

use crate::domain::{ExtractionStatus, is_blank};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assessment {
    pub status: ExtractionStatus,
    pub fields_extracted: usize,
    pub critical_present: usize,
}

impl Assessment {
    pub const fn fetch_failed() -> Self {
        Self {
            status: ExtractionStatus::Failed,
            fields_extracted: 0,
            critical_present: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusRules {
    detail_fields: Vec<String>,
    critical_fields: Vec<String>,
    placeholders: Vec<String>,
}

impl StatusRules {
    pub fn new(detail_fields: &[String], critical_fields: &[String], placeholders: &[String]) -> Self {
        Self {
            detail_fields: detail_fields.to_vec(),
            critical_fields: critical_fields.to_vec(),
            placeholders: placeholders.to_vec(),
        }
    }

    fn present(&self, fields: &BTreeMap<String, String>, name: &str) -> bool {
        fields.get(name).is_some_and(|v| !is_blank(v, &self.placeholders))
    }

    /// Grades the merged detail fields of one successful fetch.
    pub fn assess(&self, fields: &BTreeMap<String, String>) -> Assessment {
        let fields_extracted = self
            .detail_fields
            .iter()
            .filter(|f| self.present(fields, f))
            .count();
        let critical_present = self
            .critical_fields
            .iter()
            .filter(|f| self.present(fields, f))
            .count();

        let status = if critical_present == 0 {
            ExtractionStatus::Failed
        } else if critical_present == self.critical_fields.len() {
            ExtractionStatus::Success
        } else {
            ExtractionStatus::Partial
        };
        Assessment {
            status,
            fields_extracted,
            critical_present,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn rules() -> StatusRules {
        let detail: Vec<String> = ["total_students", "total_teachers", "academic_year"]
            .map(String::from)
            .to_vec();
        let critical: Vec<String> = ["total_students", "total_teachers"].map(String::from).to_vec();
        StatusRules::new(&detail, &critical, &["N/A".to_string()])
    }

    #[rstest]
    #[case(&[("total_students", "120"), ("total_teachers", "8")], ExtractionStatus::Success, 2, 2)]
    #[case(&[("total_students", "120")], ExtractionStatus::Partial, 1, 1)]
    #[case(&[("total_teachers", "8"), ("academic_year", "2023-24")], ExtractionStatus::Partial, 2, 1)]
    #[case(&[("academic_year", "2023-24")], ExtractionStatus::Failed, 1, 0)]
    #[case(&[("total_students", "N/A")], ExtractionStatus::Failed, 0, 0)]
    #[case(&[("not_a_detail_field", "x")], ExtractionStatus::Failed, 0, 0)]
    #[case(&[], ExtractionStatus::Failed, 0, 0)]
    fn test_status_law(
        #[case] pairs: &[(&str, &str)],
        #[case] status: ExtractionStatus,
        #[case] fields: usize,
        #[case] critical: usize,
    ) {
        let map: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let assessment = rules().assess(&map);
        assert_eq!(assessment.status, status);
        assert_eq!(assessment.fields_extracted, fields);
        assert_eq!(assessment.critical_present, critical);
    }

    #[test]
    fn test_fetch_failure_is_always_failed() {
        let assessment = Assessment::fetch_failed();
        assert_eq!(assessment.status, ExtractionStatus::Failed);
        assert_eq!(assessment.fields_extracted, 0);
    }
}
