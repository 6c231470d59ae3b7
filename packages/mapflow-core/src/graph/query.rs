//! Lazy queries over graph records.
//!
//! Queries wrap an iterator and evaluate nothing until consumed. Set
//! operations compare records by id, so a query over devices can be
//! intersected with another regardless of how either was produced.

use std::collections::HashSet;

use crate::id::Id;
use crate::properties::{PropKey, PropValue, PropertyTable};

/// Anything stored in the graph's indexes.
pub trait Record {
    fn record_id(&self) -> Id;
    fn properties(&self) -> &PropertyTable;
}

/// Comparison operators for property predicates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// The key is present, whatever its value. A present zero still
    /// exists; absence is a distinct outcome.
    Exists,
    NotExists,
    /// At least one element of a list value matches `Eq`.
    Any,
    /// Every element of a list value matches `Eq`.
    All,
}

/// A lazy list of borrowed records.
pub struct Query<'a, T: Record> {
    iter: Box<dyn Iterator<Item = &'a T> + 'a>,
}

impl<'a, T: Record + 'a> Query<'a, T> {
    pub(crate) fn new(iter: impl Iterator<Item = &'a T> + 'a) -> Self {
        Query {
            iter: Box::new(iter),
        }
    }

    pub fn filter(self, f: impl Fn(&T) -> bool + 'a) -> Self {
        Query {
            iter: Box::new(self.iter.filter(move |r| f(r))),
        }
    }

    /// Filters on a property predicate.
    pub fn filter_property(
        self,
        key: impl Into<PropKey>,
        op: QueryOp,
        value: Option<PropValue>,
    ) -> Self {
        let key = key.into();
        self.filter(move |r| property_matches(r.properties(), &key, op, value.as_ref()))
    }

    pub fn union(self, other: Query<'a, T>) -> Self {
        let mut seen = HashSet::new();
        Query {
            iter: Box::new(
                self.iter
                    .chain(other.iter)
                    .filter(move |r| seen.insert(r.record_id())),
            ),
        }
    }

    pub fn intersect(self, other: Query<'a, T>) -> Self {
        let ids: HashSet<Id> = other.iter.map(|r| r.record_id()).collect();
        Query {
            iter: Box::new(self.iter.filter(move |r| ids.contains(&r.record_id()))),
        }
    }

    pub fn difference(self, other: Query<'a, T>) -> Self {
        let ids: HashSet<Id> = other.iter.map(|r| r.record_id()).collect();
        Query {
            iter: Box::new(self.iter.filter(move |r| !ids.contains(&r.record_id()))),
        }
    }

    pub fn first(mut self) -> Option<&'a T> {
        self.iter.next()
    }

    pub fn count(self) -> usize {
        self.iter.count()
    }

    pub fn collect_vec(self) -> Vec<&'a T> {
        self.iter.collect()
    }
}

impl<'a, T: Record> Iterator for Query<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

fn compare(a: &PropValue, b: &PropValue, op: QueryOp) -> bool {
    // numeric comparison when both sides have one, string otherwise
    let ord = match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    };
    let Some(ord) = ord else {
        return op == QueryOp::Ne;
    };
    match op {
        QueryOp::Eq => ord.is_eq(),
        QueryOp::Ne => ord.is_ne(),
        QueryOp::Lt => ord.is_lt(),
        QueryOp::Le => ord.is_le(),
        QueryOp::Gt => ord.is_gt(),
        QueryOp::Ge => ord.is_ge(),
        _ => false,
    }
}

fn property_matches(
    props: &PropertyTable,
    key: &PropKey,
    op: QueryOp,
    value: Option<&PropValue>,
) -> bool {
    let stored = props.get(key.clone());
    match op {
        QueryOp::Exists => stored.is_some(),
        QueryOp::NotExists => stored.is_none(),
        QueryOp::Any | QueryOp::All => {
            let (Some(stored), Some(value)) = (stored, value) else {
                return false;
            };
            let items: Vec<&PropValue> = match stored {
                PropValue::List(items) => items.iter().collect(),
                single => vec![single],
            };
            if op == QueryOp::Any {
                items.iter().any(|i| compare(i, value, QueryOp::Eq))
            } else {
                items.iter().all(|i| compare(i, value, QueryOp::Eq))
            }
        }
        _ => {
            let (Some(stored), Some(value)) = (stored, value) else {
                return false;
            };
            compare(stored, value, op)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::Property;

    struct Fake {
        id: Id,
        props: PropertyTable,
    }

    impl Record for Fake {
        fn record_id(&self) -> Id {
            self.id
        }

        fn properties(&self) -> &PropertyTable {
            &self.props
        }
    }

    fn fake(n: u64, port: Option<i32>) -> Fake {
        let mut props = PropertyTable::new();
        if let Some(p) = port {
            props.set(Property::Port, PropValue::I32(p));
        }
        Fake {
            id: Id::from_u64(n),
            props,
        }
    }

    #[test]
    fn property_comparisons() {
        let items = vec![fake(1, Some(7570)), fake(2, Some(9000)), fake(3, None)];
        let hits = Query::new(items.iter())
            .filter_property(Property::Port, QueryOp::Gt, Some(PropValue::I32(8000)))
            .collect_vec();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, Id::from_u64(2));
    }

    #[test]
    fn exists_distinguishes_absence_from_zero() {
        let items = vec![fake(1, Some(0)), fake(2, None)];
        let exists = Query::new(items.iter())
            .filter_property(Property::Port, QueryOp::Exists, None)
            .collect_vec();
        assert_eq!(exists.len(), 1);
        assert_eq!(exists[0].id, Id::from_u64(1));
        let missing = Query::new(items.iter())
            .filter_property(Property::Port, QueryOp::NotExists, None)
            .collect_vec();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, Id::from_u64(2));
    }

    #[test]
    fn set_operations_dedup_by_id() {
        let items = vec![fake(1, Some(1)), fake(2, Some(2)), fake(3, Some(3))];
        let a = Query::new(items.iter().take(2));
        let b = Query::new(items.iter().skip(1));
        assert_eq!(a.union(b).count(), 3);

        let a = Query::new(items.iter().take(2));
        let b = Query::new(items.iter().skip(1));
        let both = a.intersect(b).collect_vec();
        assert_eq!(both.len(), 1);
        assert_eq!(both[0].id, Id::from_u64(2));

        let a = Query::new(items.iter());
        let b = Query::new(items.iter().skip(2));
        assert_eq!(a.difference(b).count(), 2);
    }

    #[test]
    fn any_matches_list_elements() {
        let mut props = PropertyTable::new();
        props.set(
            Property::Scope,
            PropValue::List(vec![
                PropValue::Str("a.1".into()),
                PropValue::Str("b.1".into()),
            ]),
        );
        let item = Fake {
            id: Id::from_u64(9),
            props,
        };
        let items = vec![item];
        let hit = Query::new(items.iter())
            .filter_property(
                Property::Scope,
                QueryOp::Any,
                Some(PropValue::Str("b.1".into())),
            )
            .count();
        assert_eq!(hit, 1);
    }
}
