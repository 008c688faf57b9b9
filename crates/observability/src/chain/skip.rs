//! Per-route opt-out for the instrumentation stages

use std::{fmt, sync::Arc};

type RoutePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Decides which routes bypass tracing and request logging
///
/// A predicate, when set, takes precedence over the excluded list. With
/// neither, nothing is skipped.
#[derive(Clone, Default)]
pub struct SkipPolicy {
    excluded: Vec<String>,
    predicate: Option<RoutePredicate>,
}

impl fmt::Debug for SkipPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SkipPolicy")
            .field("excluded", &self.excluded)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl SkipPolicy {
    /// Policy that never skips
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip an exact route (HTTP path or full RPC method)
    #[must_use]
    pub fn exclude(mut self, route: impl Into<String>) -> Self {
        self.excluded.push(route.into());
        self
    }

    #[must_use]
    pub fn exclude_all<I, R>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        self.excluded.extend(routes.into_iter().map(Into::into));
        self
    }

    /// Decide with a function instead of the excluded list
    #[must_use]
    pub fn skip_when(mut self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn should_skip(&self, route: &str) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(route),
            None => self.excluded.iter().any(|excluded| excluded == route),
        }
    }
}
