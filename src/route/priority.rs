//! Route priority comparison.
//!
//! [`outranks`] is the total order used when insertion-sorting an entry into
//! every index list it joins. Resolution never re-sorts — it trusts index
//! order — so the exact tie-break ladder here is load-bearing.

use super::HandlerEntry;

/// Returns `true` when `new` takes a position ahead of `old` in an index list.
///
/// Tie-break ladder, checked in order:
///
/// 1. Middleware ahead of non-middleware, so chains wrap outward.
/// 2. Deeper path (more `/` segments) ahead of shallower.
/// 3. Longer literal remainder (placeholders stripped) ahead of shorter,
///    e.g. `/admin-goods-{page}` ahead of `/admin-{page}`.
/// 4. Fewer placeholder markers ahead of more.
/// 5. Placeholder kind: `{field}` ahead of `:name` ahead of `*wildcard`.
/// 6. Method-bound entries ahead of `ALL`-bound ones. When both sides are
///    method-bound this still reports a win for `new`; the comparison is not
///    antisymmetric there (see DESIGN.md) and is kept as observed.
/// 7. Serving entries ahead of hooks.
pub fn outranks(new: &HandlerEntry, old: &HandlerEntry) -> bool {
    match (new.is_middleware(), old.is_middleware()) {
        (true, false) => return true,
        (false, true) => return false,
        _ => {}
    }

    let (np, op) = (new.pattern(), old.pattern());

    if np.priority() != op.priority() {
        return np.priority() > op.priority();
    }

    if np.literal_len() != op.literal_len() {
        return np.literal_len() > op.literal_len();
    }

    if np.fuzzy_markers() != op.fuzzy_markers() {
        return np.fuzzy_markers() < op.fuzzy_markers();
    }

    if np.kind_score() != op.kind_score() {
        return np.kind_score() > op.kind_score();
    }

    if np.method().is_specific() {
        return true;
    }
    if op.method().is_specific() {
        return true;
    }

    if new.is_serving() && old.is_hook() {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::route::{HookPhase, Router};
    use std::sync::Arc;

    fn noop() -> impl Fn(Context) -> std::future::Ready<()> + Send + Sync + 'static {
        |_ctx| std::future::ready(())
    }

    /// Registers patterns and returns the entries in index order at the
    /// deepest list the request path reaches.
    fn index_order(patterns: &[&str], request_path: &str) -> Vec<String> {
        let mut router = Router::new();
        for p in patterns {
            router.bind(p, noop()).unwrap();
        }
        let index = router.domain("default").unwrap();
        let segs: Vec<&str> = request_path.split('/').filter(|s| !s.is_empty()).collect();
        let lists = index.candidate_lists(&segs);
        lists
            .last()
            .map(|list| {
                list.iter()
                    .map(|e| e.pattern().path().to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn deeper_path_outranks() {
        let mut router = Router::new();
        router.bind("/a/:x/c", noop()).unwrap();
        router.bind("/a/:x", noop()).unwrap();
        let index = router.domain("default").unwrap();
        // Both live in the fuzzy node list under /a.
        let lists = index.candidate_lists(&["a", "1"]);
        let deepest: Vec<_> = lists
            .last()
            .unwrap()
            .iter()
            .map(|e| e.pattern().path().to_owned())
            .collect();
        assert_eq!(deepest, ["/a/:x/c", "/a/:x"]);
    }

    #[test]
    fn field_outranks_param_regardless_of_registration_order() {
        // Same fuzzy node; rule 5 decides.
        assert_eq!(index_order(&["/a/:y", "/a/{x}"], "/a/1"), ["/a/{x}", "/a/:y"]);
        assert_eq!(index_order(&["/a/{x}", "/a/:y"], "/a/1"), ["/a/{x}", "/a/:y"]);
    }

    #[test]
    fn param_outranks_wildcard() {
        assert_eq!(
            index_order(&["/a/*w", "/a/:y"], "/a/1"),
            ["/a/:y", "/a/*w"]
        );
    }

    #[test]
    fn longer_literal_remainder_outranks() {
        assert_eq!(
            index_order(&["/admin-{page}", "/admin-goods-{page}"], "/admin-goods-1"),
            ["/admin-goods-{page}", "/admin-{page}"]
        );
    }

    #[test]
    fn fewer_fuzzy_markers_outranks() {
        // Equal depth and equal stripped length ("/x/-" for both); only the
        // marker count differs.
        assert_eq!(
            index_order(&["/x/{a}-{b}", "/x/-{ab}"], "/x/-1"),
            ["/x/-{ab}", "/x/{a}-{b}"]
        );
    }

    #[test]
    fn middleware_leads_lists() {
        let mut router = Router::new();
        router.bind("/m", noop()).unwrap();
        router.bind_middleware("/m", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&["m"]);
        let kinds: Vec<bool> = lists
            .last()
            .unwrap()
            .iter()
            .map(|e| e.is_middleware())
            .collect();
        assert_eq!(kinds, [true, false]);
    }

    #[test]
    fn serving_outranks_hook_when_methods_are_wildcard() {
        let mut router = Router::new();
        router
            .bind_hook("/h", HookPhase::BeforeServe, noop())
            .unwrap();
        router.bind("/h", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&["h"]);
        let serving_first: Vec<bool> = lists
            .last()
            .unwrap()
            .iter()
            .map(|e| e.is_serving())
            .collect();
        assert_eq!(serving_first, [true, false]);
    }

    #[test]
    fn comparator_is_deterministic_for_equal_entries() {
        // Two identical middleware registrations keep registration order: the
        // second never outranks the first (rule 6 is wildcard/wildcard here,
        // rule 7 does not apply to two middleware entries).
        let mut router = Router::new();
        router.bind_middleware("/same", noop()).unwrap();
        router.bind_middleware("/same", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let lists = index.candidate_lists(&["same"]);
        let ids: Vec<u64> = lists.last().unwrap().iter().map(|e| e.id()).collect();
        assert!(ids[0] < ids[1]);
    }

    #[test]
    fn arc_identity_shared_across_lists() {
        // One entry under a fuzzy path is linked into both the fuzzy list and
        // its own leaf list without being copied.
        let mut router = Router::new();
        router.bind("/f/:x/leaf", noop()).unwrap();
        let index = router.domain("default").unwrap();
        let shallow = index.candidate_lists(&["f", "1"]);
        let deep = index.candidate_lists(&["f", "1", "leaf"]);
        let a = shallow.last().unwrap().first().unwrap();
        let b = deep.last().unwrap().first().unwrap();
        assert!(Arc::ptr_eq(a, b));
    }
}
