//! Request resolution — turning `(method, path, host)` into an execution plan.
//!
//! Resolution walks the sealed segment index for the `default` domain and the
//! request host, merges the candidate lists deepest-first, regex-tests each
//! candidate, and assembles the ordered plan the pipeline executor consumes.
//! Plans are memoized per routing key with a fixed time-to-live, which bounds
//! memory growth from combinatorial parameter paths while keeping hot routes
//! off the index walk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::http::{Method, Request};
use crate::pattern::DEFAULT_DOMAIN;

use super::{HandlerEntry, HookPhase, Router};

/// One step of an execution plan: an entry plus the path parameters its
/// matcher extracted for this routing key.
#[derive(Clone)]
pub struct PlanStep {
    pub entry: Arc<HandlerEntry>,
    pub params: HashMap<String, String>,
}

/// The ordered, resolved call sequence for one routing key.
///
/// `steps` holds middleware in registration order followed by at most one
/// serving handler; hook entries are kept aside and reached through
/// [`hooks`](Self::hooks). Immutable and shared across concurrent requests
/// for the same key.
pub struct ExecutionPlan {
    steps: Vec<PlanStep>,
    hooks: Vec<PlanStep>,
    key: String,
}

impl ExecutionPlan {
    /// Middleware steps followed by the serving step, if any.
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Hook steps whose phase matches, in registration order.
    pub fn hooks(&self, phase: HookPhase) -> impl Iterator<Item = &PlanStep> {
        self.hooks
            .iter()
            .filter(move |step| step.entry.hook_phase() == Some(phase))
    }

    /// `true` when a serving handler was selected for this key.
    pub fn has_serving_handler(&self) -> bool {
        self.steps.last().is_some_and(|s| s.entry.is_serving())
    }

    /// The `METHOD:PATH@HOST` key this plan was resolved for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

struct CachedPlan {
    plan: Arc<ExecutionPlan>,
    created: Instant,
}

/// Resolves requests against a sealed [`Router`], memoizing plans.
pub struct Resolver {
    router: Arc<Router>,
    cache: DashMap<String, CachedPlan>,
    ttl: Duration,
}

impl Resolver {
    /// Default plan lifetime: long enough to keep hot routes cached, short
    /// enough to bound growth from parameterized paths.
    pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

    pub fn new(router: Arc<Router>, ttl: Duration) -> Self {
        Self {
            router,
            cache: DashMap::new(),
            ttl,
        }
    }

    /// Resolves a parsed request, applying the OPTIONS preflight substitution:
    /// an `OPTIONS` request matches as if its method were the value of its
    /// `Access-Control-Request-Method` header.
    pub fn resolve_request(&self, request: &Request) -> Arc<ExecutionPlan> {
        let method;
        let effective = match (request.method(), request.access_control_request_method()) {
            (Method::Options, Some(requested)) => {
                let Ok(parsed) = requested.parse::<Method>();
                method = parsed;
                &method
            }
            (m, _) => m,
        };
        self.resolve(effective, request.path(), request.host())
    }

    /// Resolves `(method, path, host)` to an execution plan, from cache when
    /// fresh. Two concurrent misses for the same key may each compute the
    /// plan; computation is a pure function of the sealed index, so the race
    /// only costs a redundant walk.
    pub fn resolve(&self, method: &Method, path: &str, host: &str) -> Arc<ExecutionPlan> {
        let path = normalize_path(path);
        let key = format!("{}:{}@{}", method.as_str(), path, host);

        if let Some(cached) = self.cache.get(&key) {
            if cached.created.elapsed() < self.ttl {
                return cached.plan.clone();
            }
        }

        let plan = Arc::new(self.compute(method, &path, host, key.clone()));
        self.cache.insert(
            key,
            CachedPlan {
                plan: plan.clone(),
                created: Instant::now(),
            },
        );
        plan
    }

    /// Number of live cache entries, counting expired ones not yet replaced.
    pub fn cached_plans(&self) -> usize {
        self.cache.len()
    }

    fn compute(&self, method: &Method, path: &str, host: &str, key: String) -> ExecutionPlan {
        let segs: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let mut middleware: Vec<PlanStep> = Vec::new();
        let mut hooks: Vec<PlanStep> = Vec::new();
        let mut serving: Option<PlanStep> = None;
        let mut seen: HashSet<u64> = HashSet::new();

        let mut domains: Vec<&str> = vec![DEFAULT_DOMAIN];
        if !host.is_empty() && host != DEFAULT_DOMAIN {
            domains.push(host);
        }

        for domain in domains {
            let Some(index) = self.router.domain(domain) else {
                continue;
            };
            let lists = index.candidate_lists(&segs);
            // Deepest step first, so deeper registrations win serving selection.
            for list in lists.iter().rev() {
                for entry in list.iter() {
                    if !seen.insert(entry.id()) {
                        continue;
                    }
                    if !entry.pattern().method().matches(method) {
                        continue;
                    }
                    let Some(params) = entry.match_request(path) else {
                        continue;
                    };
                    let step = PlanStep {
                        entry: entry.clone(),
                        params: params.into_iter().collect(),
                    };
                    if entry.is_middleware() {
                        middleware.push(step);
                    } else if entry.is_hook() {
                        hooks.push(step);
                    } else if serving.is_none() {
                        serving = Some(step);
                    }
                    // Shallower serving candidates after the first are skipped.
                }
            }
        }

        middleware.sort_by_key(|s| s.entry.id());
        hooks.sort_by_key(|s| s.entry.id());

        let mut steps = middleware;
        if let Some(step) = serving {
            steps.push(step);
        }

        tracing::debug!(
            key = %key,
            steps = steps.len(),
            hooks = hooks.len(),
            "execution plan computed"
        );

        ExecutionPlan { steps, hooks, key }
    }
}

#[cfg(test)]
pub(crate) fn tests_empty_plan() -> ExecutionPlan {
    ExecutionPlan {
        steps: Vec::new(),
        hooks: Vec::new(),
        key: String::new(),
    }
}

/// Collapses repeated `/` and trims the trailing slash (except the root).
fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for c in path.chars() {
        if c == '/' {
            if !prev_slash {
                out.push(c);
            }
            prev_slash = true;
        } else {
            out.push(c);
            prev_slash = false;
        }
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if out.is_empty() {
        out.push('/');
    }
    out
}
