use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{ExitOperationsCollector, SortValue};
use crate::error::{ShardError, ShardResult};

pub type PropertyAccessor<E> =
    Arc<dyn Fn(&E) -> Option<SortValue> + Send + Sync>;

/// Typed key extractors for result elements, addressed by property path.
pub struct PropertyAccessors<E> {
    accessors: HashMap<String, PropertyAccessor<E>>,
}

impl<E> PropertyAccessors<E> {
    pub fn new() -> Self {
        Self {
            accessors: HashMap::new(),
        }
    }

    pub fn with<F>(mut self, path: &str, accessor: F) -> Self
    where
        F: Fn(&E) -> Option<SortValue> + Send + Sync + 'static,
    {
        self.register(path, accessor);
        self
    }

    pub fn register<F>(&mut self, path: &str, accessor: F)
    where
        F: Fn(&E) -> Option<SortValue> + Send + Sync + 'static,
    {
        self.accessors.insert(path.to_string(), Arc::new(accessor));
    }

    pub fn get(&self, path: &str) -> ShardResult<&PropertyAccessor<E>> {
        self.accessors.get(path).ok_or_else(|| {
            ShardError::UnsupportedCapability(format!(
                "no accessor registered for property path `{}`",
                path
            ))
        })
    }
}

impl<E> Default for PropertyAccessors<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyAccessors<serde_json::Value> {
    /// Accessors that walk dotted paths (`address.city`) through JSON
    /// objects. Missing fields and non-scalar values extract as absent.
    pub fn json_paths<'a, I>(paths: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut accessors = Self::new();
        for path in paths {
            let segments: Vec<String> =
                path.split('.').map(str::to_string).collect();
            accessors.register(path, move |value: &serde_json::Value| {
                let mut current = value;
                for segment in &segments {
                    current = current.get(segment.as_str())?;
                }
                SortValue::from_json(current)
            });
        }
        accessors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Sort criterion on one property path. Absent keys sort last in either
/// direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub path: String,
    pub direction: SortDirection,
}

impl Order {
    pub fn asc<P: Into<String>>(path: P) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc<P: Into<String>>(path: P) -> Self {
        Self {
            path: path.into(),
            direction: SortDirection::Descending,
        }
    }

    fn compare(&self, a: &Option<SortValue>, b: &Option<SortValue>) -> Ordering {
        match (a, b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => match self.direction {
                SortDirection::Ascending => a.cmp(b),
                SortDirection::Descending => b.cmp(a),
            },
        }
    }
}

/// Cross-shard post-processing of concatenated result lists.
///
/// Steps run in a fixed order: distinct, order by, first result (offset),
/// max results (limit). Sorting is stable, so elements with equal keys keep
/// the order in which their shards were merged.
pub struct ResultListCollector<E> {
    accessors: PropertyAccessors<E>,
    distinct_on: Vec<String>,
    orders: Vec<Order>,
    first_result: Option<usize>,
    max_results: Option<usize>,
}

impl<E> ResultListCollector<E> {
    pub fn new(accessors: PropertyAccessors<E>) -> Self {
        Self {
            accessors,
            distinct_on: Vec::new(),
            orders: Vec::new(),
            first_result: None,
            max_results: None,
        }
    }

    /// Drop elements whose keys on `paths` equal an earlier element's.
    pub fn distinct_on<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.distinct_on = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    pub fn first_result(mut self, offset: usize) -> Self {
        self.first_result = Some(offset);
        self
    }

    pub fn max_results(mut self, limit: usize) -> Self {
        self.max_results = Some(limit);
        self
    }

    fn keys(
        &self,
        paths: &[&str],
    ) -> ShardResult<Vec<PropertyAccessor<E>>> {
        paths
            .iter()
            .map(|path| self.accessors.get(path).cloned())
            .collect()
    }
}

fn extract<E>(
    accessors: &[PropertyAccessor<E>],
    element: &E,
) -> Vec<Option<SortValue>> {
    accessors.iter().map(|accessor| accessor(element)).collect()
}

impl<E> ExitOperationsCollector<Vec<E>> for ResultListCollector<E>
where
    E: Send + Sync,
{
    fn apply(&self, results: Vec<E>) -> ShardResult<Vec<E>> {
        let distinct_paths: Vec<&str> =
            self.distinct_on.iter().map(String::as_str).collect();
        let order_paths: Vec<&str> =
            self.orders.iter().map(|o| o.path.as_str()).collect();
        let distinct_keys = self.keys(&distinct_paths)?;
        let order_keys = self.keys(&order_paths)?;

        let mut results = results;
        if !distinct_keys.is_empty() {
            let mut seen = BTreeSet::new();
            results.retain(|element| seen.insert(extract(&distinct_keys, element)));
        }

        if !order_keys.is_empty() {
            let mut keyed: Vec<(Vec<Option<SortValue>>, E)> = results
                .into_iter()
                .map(|element| (extract(&order_keys, &element), element))
                .collect();
            keyed.sort_by(|(a, _), (b, _)| {
                self.orders
                    .iter()
                    .zip(a.iter().zip(b.iter()))
                    .map(|(order, (a, b))| order.compare(a, b))
                    .find(|ordering| ordering.is_ne())
                    .unwrap_or(Ordering::Equal)
            });
            results = keyed.into_iter().map(|(_, element)| element).collect();
        }

        let offset = self.first_result.unwrap_or(0);
        let limit = self.max_results.unwrap_or(usize::MAX);
        Ok(results.into_iter().skip(offset).take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    fn rows() -> Vec<Value> {
        vec![
            json!({"name": "carol", "age": 41, "address": {"city": "Oslo"}}),
            json!({"name": "alice", "age": 29}),
            json!({"name": "bob", "age": 29.5, "address": {"city": "Bergen"}}),
            json!({"name": "alice", "age": 33, "address": {"city": "Oslo"}}),
        ]
    }

    fn names(rows: &[Value]) -> Vec<&str> {
        rows.iter().map(|r| r["name"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_order_by_mixed_numbers() {
        let collector = ResultListCollector::new(PropertyAccessors::json_paths([
            "age",
        ]))
        .order_by(Order::desc("age"));
        let out = collector.apply(rows()).unwrap();
        assert_eq!(names(&out), vec!["carol", "alice", "bob", "alice"]);
    }

    #[test]
    fn test_absent_keys_sort_last_both_ways() {
        let accessors = || PropertyAccessors::json_paths(["address.city"]);
        let asc = ResultListCollector::new(accessors())
            .order_by(Order::asc("address.city"))
            .apply(rows())
            .unwrap();
        assert_eq!(names(&asc), vec!["bob", "carol", "alice", "alice"]);
        assert!(asc[3].get("address").is_none());

        let desc = ResultListCollector::new(accessors())
            .order_by(Order::desc("address.city"))
            .apply(rows())
            .unwrap();
        assert_eq!(names(&desc), vec!["carol", "alice", "bob", "alice"]);
        assert!(desc[3].get("address").is_none());
    }

    #[test]
    fn test_distinct_then_page() {
        let collector =
            ResultListCollector::new(PropertyAccessors::json_paths(["name"]))
                .distinct_on(["name"])
                .order_by(Order::asc("name"))
                .first_result(1)
                .max_results(1);
        let out = collector.apply(rows()).unwrap();
        assert_eq!(names(&out), vec!["bob"]);
    }

    #[test]
    fn test_unknown_path_is_unsupported() {
        let collector = ResultListCollector::new(PropertyAccessors::<Value>::new())
            .order_by(Order::asc("missing"));
        let err = collector.apply(Vec::new()).unwrap_err();
        assert!(matches!(err, ShardError::UnsupportedCapability(_)));
    }

    #[test]
    fn test_typed_accessor() {
        let accessors = PropertyAccessors::<(u32, &'static str)>::new()
            .with("id", |row| Some(row.0.into()));
        let out = ResultListCollector::new(accessors)
            .order_by(Order::asc("id"))
            .apply(vec![(3, "c"), (1, "a"), (2, "b")])
            .unwrap();
        assert_eq!(out, vec![(1, "a"), (2, "b"), (3, "c")]);
    }
}
