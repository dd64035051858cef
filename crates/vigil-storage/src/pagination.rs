//! Keyset pagination.
//!
//! A page continues strictly after the record named by `marker` in the
//! requested order. No offsets are counted, so inserts and deletes between
//! calls never shift later pages.
//!
//! [`paginate`] turns a base predicate and a [`PaginationRequest`] into a
//! [`PagePlan`]; the backend supplies the marker lookup and executes the plan.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::ordering::{Direction, ResolvedOrdering, SortKey};
use crate::schema::{Entity, FieldDef, FieldValue, Record};
use crate::translate::{CompareOp, Predicate};

/// Client-facing page request: `{sort: [[field, "asc"|"desc"], ...], marker, limit}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationRequest {
    #[serde(default)]
    pub sort: Vec<SortKey>,
    /// Identity of the last record of the previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub marker: Option<String>,
    /// Maximum rows to return; `Some(0)` returns nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl PaginationRequest {
    pub fn new(sort: Vec<SortKey>) -> Self {
        Self {
            sort,
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.marker = Some(marker.into());
        self
    }
}

/// A fully resolved query ready for a backend to run.
#[derive(Debug, Clone)]
pub struct BoundedQuery {
    pub entity: Entity,
    pub predicate: Predicate,
    pub ordering: ResolvedOrdering,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum PagePlan {
    /// The request can only produce an empty page; storage need not be touched.
    Empty,
    Bounded(BoundedQuery),
}

/// Plans one page of `R` records.
///
/// `lookup_marker` is called at most once, and only when a marker is present
/// and the limit is not zero. A marker that resolves to nothing fails with
/// [`StorageError::MarkerNotFound`].
pub fn paginate<R, F>(base: Predicate, request: &PaginationRequest, lookup_marker: F) -> Result<PagePlan>
where
    R: Record,
    F: FnOnce(&str) -> Result<Option<R>>,
{
    if request.limit == Some(0) {
        return Ok(PagePlan::Empty);
    }

    let entity = R::ENTITY;
    let ordering = ResolvedOrdering::resolve(&request.sort, entity)?;

    let predicate = match &request.marker {
        Some(marker) => {
            let anchor = lookup_marker(marker)?.ok_or_else(|| StorageError::MarkerNotFound {
                entity: entity.name(),
                marker: marker.clone(),
            })?;
            Predicate::all([base, after(&ordering, &anchor)])
        }
        None => base,
    };

    Ok(PagePlan::Bounded(BoundedQuery {
        entity,
        predicate,
        ordering,
        limit: request.limit,
    }))
}

/// Predicate selecting records that sort strictly after `anchor`:
/// `k1 > m1 OR (k1 = m1 AND k2 > m2) OR ...`, with each `>` read in the
/// key's direction.
pub fn after<R: Record>(ordering: &ResolvedOrdering, anchor: &R) -> Predicate {
    let mut branches = Vec::with_capacity(ordering.keys().len());
    let mut equal_prefix: Vec<Predicate> = Vec::new();

    for (field, direction) in ordering.keys() {
        let value = anchor.value(field.name);
        let mut branch = equal_prefix.clone();
        branch.push(beyond(field, *direction, &value));
        branches.push(Predicate::all(branch));
        equal_prefix.push(same(field, &value));
    }

    Predicate::Or(branches)
}

fn same(field: &'static FieldDef, value: &FieldValue) -> Predicate {
    if value.is_null() {
        Predicate::IsNull {
            field,
            negated: false,
        }
    } else {
        Predicate::compare(field, CompareOp::Eq, value.clone())
    }
}

// Null is the lowest value, so it is "beyond" every value when descending
// and nothing is beyond it.
fn beyond(field: &'static FieldDef, direction: Direction, value: &FieldValue) -> Predicate {
    match (direction, value.is_null()) {
        (Direction::Asc, true) => Predicate::IsNull {
            field,
            negated: true,
        },
        (Direction::Asc, false) => Predicate::compare(field, CompareOp::Gt, value.clone()),
        (Direction::Desc, true) => Predicate::Const(false),
        (Direction::Desc, false) => {
            let lower = Predicate::compare(field, CompareOp::Lt, value.clone());
            if field.nullable {
                Predicate::Or(vec![
                    lower,
                    Predicate::IsNull {
                        field,
                        negated: false,
                    },
                ])
            } else {
                lower
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use vigil_common::types::{Alarm, Severity};

    fn dataset() -> Vec<Alarm> {
        let base = Utc::now();
        let severities = [Severity::Critical, Severity::Low, Severity::Moderate];
        (0..9)
            .map(|i| {
                let mut a = Alarm::new(format!("a{i}"), format!("alarm {i}"), "threshold", "u", "p");
                a.severity = severities[i % 3];
                a.timestamp = base - Duration::seconds(i64::try_from(i / 2).unwrap());
                if i % 4 == 0 {
                    a.evaluate_timestamp = Some(base - Duration::minutes(i64::try_from(i).unwrap()));
                }
                a
            })
            .collect()
    }

    // Runs a plan the way the memory backend does.
    fn run(all: &[Alarm], request: &PaginationRequest) -> Result<Vec<Alarm>> {
        let plan = paginate(Predicate::Const(true), request, |marker| {
            Ok(all.iter().find(|a| a.alarm_id == marker).cloned())
        })?;
        let PagePlan::Bounded(query) = plan else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<Alarm> = all.iter().filter(|a| query.predicate.matches(*a)).cloned().collect();
        query.ordering.sort(&mut rows);
        if let Some(limit) = query.limit {
            rows.truncate(usize::try_from(limit).unwrap());
        }
        Ok(rows)
    }

    fn walk(all: &[Alarm], sort: Vec<SortKey>, page_size: u64) -> Vec<String> {
        let mut seen = Vec::new();
        let mut request = PaginationRequest::new(sort).with_limit(page_size);
        loop {
            let page = run(all, &request).unwrap();
            seen.extend(page.iter().map(|a| a.alarm_id.clone()));
            match page.last() {
                Some(last) if page.len() as u64 == page_size => {
                    request = request.clone().with_marker(last.alarm_id.clone());
                }
                _ => return seen,
            }
        }
    }

    #[test]
    fn zero_limit_never_looks_up_marker() {
        let request = PaginationRequest::default().with_limit(0).with_marker("gone");
        let plan = paginate::<Alarm, _>(Predicate::Const(true), &request, |_| {
            panic!("marker lookup must not run for limit 0")
        })
        .unwrap();
        assert!(matches!(plan, PagePlan::Empty));
    }

    #[test]
    fn missing_marker_is_an_error() {
        let all = dataset();
        let request = PaginationRequest::default().with_marker("nope");
        let err = run(&all, &request).unwrap_err();
        assert!(matches!(err, StorageError::MarkerNotFound { .. }));
    }

    #[test]
    fn walking_pages_yields_every_record_once_in_order() {
        let all = dataset();
        let orderings = vec![
            vec![],
            vec![SortKey::desc("severity")],
            vec![SortKey::asc("severity"), SortKey::desc("timestamp")],
            vec![SortKey::desc("evaluate_timestamp")],
            vec![SortKey::asc("evaluate_timestamp"), SortKey::desc("alarm_id")],
        ];
        for sort in orderings {
            let ordering = ResolvedOrdering::resolve(&sort, Entity::Alarm).unwrap();
            let mut expected = all.clone();
            ordering.sort(&mut expected);
            let expected: Vec<String> = expected.into_iter().map(|a| a.alarm_id).collect();

            for page_size in 1..=4 {
                assert_eq!(walk(&all, sort.clone(), page_size), expected, "sort {sort:?} page {page_size}");
            }
        }
    }

    #[test]
    fn same_marker_returns_same_page() {
        let all = dataset();
        let request = PaginationRequest::new(vec![SortKey::desc("severity")])
            .with_limit(3)
            .with_marker("a4");
        let first = run(&all, &request).unwrap();
        let second = run(&all, &request).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn request_wire_form() {
        let request: PaginationRequest = serde_json::from_str(
            r#"{"sort": [["severity", "desc"], ["name", "asc"]], "limit": 10}"#,
        )
        .unwrap();
        assert_eq!(request.sort, vec![SortKey::desc("severity"), SortKey::asc("name")]);
        assert_eq!(request.marker, None);
        assert_eq!(request.limit, Some(10));
    }
}
