use std::collections::BTreeSet;
use std::sync::Arc;

/// The configured set of metric keys the relay polls, accepts and serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricSet {
    metrics: Arc<BTreeSet<String>>,
}

impl MetricSet {
    pub fn new<I, S>(metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let metrics = metrics
            .into_iter()
            .map(|metric| metric.as_ref().trim().to_string())
            .filter(|metric| !metric.is_empty())
            .collect();
        Self {
            metrics: Arc::new(metrics),
        }
    }

    pub fn contains(&self, metric: &str) -> bool {
        self.metrics.contains(metric)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.metrics.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_dedupes() {
        let set = MetricSet::new([" rt", "rh", "", "rt ", "lux"]);
        assert_eq!(set.len(), 3);
        assert!(set.contains("rt"));
        assert!(!set.contains("temp"));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["lux", "rh", "rt"]);
    }
}
