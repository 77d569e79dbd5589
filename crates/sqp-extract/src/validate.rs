//! Row-level diagnostics attached to full extractions.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqp_core::{parse_rate, SourceRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    MissingIdentifier,
    MissingDetailKey,
    InvertedPeriod,
    NonNumericMetric,
    DuplicateKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub row_index: usize,
    pub kind: IssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub rows_checked: usize,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.issues.iter().filter(|i| i.kind == kind).count()
    }
}

pub fn validate_rows(rows: &[SourceRow]) -> ValidationReport {
    let mut report = ValidationReport {
        rows_checked: rows.len(),
        issues: Vec::new(),
    };
    let mut seen = HashSet::new();

    for (row_index, row) in rows.iter().enumerate() {
        let mut push = |kind, detail: String| {
            report.issues.push(ValidationIssue {
                row_index,
                kind,
                detail,
            })
        };

        if row.entity_id.trim().is_empty() {
            push(IssueKind::MissingIdentifier, "entity_id is empty".into());
        }
        if row.detail_key.trim().is_empty() {
            push(IssueKind::MissingDetailKey, "detail_key is empty".into());
        }
        if row.period_end < row.period_start {
            push(
                IssueKind::InvertedPeriod,
                format!("{} is after {}", row.period_start, row.period_end),
            );
        }
        for (name, value) in &row.metrics {
            if !value.is_null() && parse_rate(value).is_none() {
                push(
                    IssueKind::NonNumericMetric,
                    format!("{name} = {}", render(value)),
                );
            }
        }
        let key = (row.parent_key(), row.detail_key.trim().to_string());
        if !seen.insert(key) {
            push(
                IssueKind::DuplicateKey,
                format!("{} / {}", row.parent_key(), row.detail_key),
            );
        }
    }
    report
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => format!("{s:?}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn row(entity: &str, term: &str) -> SourceRow {
        SourceRow {
            entity_id: entity.into(),
            entity_name: None,
            period_start: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2026, 3, 7).unwrap(),
            detail_key: term.into(),
            observed_at: Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap(),
            metrics: BTreeMap::from([("clicks".to_string(), json!(3))]),
        }
    }

    #[test]
    fn flags_each_issue_kind() {
        let mut inverted = row("acct-2", "boots");
        inverted.period_end = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        let mut junk = row("acct-3", "hats");
        junk.metrics.insert("cost".into(), json!("n/a"));

        let rows = vec![
            row("acct-1", "shoes"),
            row("acct-1", "shoes"),
            row("", "socks"),
            row("acct-1", " "),
            inverted,
            junk,
        ];
        let report = validate_rows(&rows);

        assert_eq!(report.rows_checked, 6);
        assert_eq!(report.count(IssueKind::DuplicateKey), 1);
        assert_eq!(report.count(IssueKind::MissingIdentifier), 1);
        assert_eq!(report.count(IssueKind::MissingDetailKey), 1);
        assert_eq!(report.count(IssueKind::InvertedPeriod), 1);
        assert_eq!(report.count(IssueKind::NonNumericMetric), 1);
    }

    #[test]
    fn numeric_strings_and_nulls_are_accepted() {
        let mut r = row("acct-1", "shoes");
        r.metrics.insert("ctr".into(), json!("0.25"));
        r.metrics.insert("cost".into(), JsonValue::Null);
        assert!(validate_rows(&[r]).is_clean());
    }
}
