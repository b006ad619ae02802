//! Dispatch ordering: which pending task goes first, and which capabilities it
//! may be served by, in order.

use std::cmp::Ordering;

use super::task::Task;

/// Total order over pending tasks: higher priority first, then earlier
/// `created_at`, then id so equal timestamps never tie.
pub fn dispatch_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Capabilities that may serve `task`: the required one, then each fallback in
/// declaration order, duplicates dropped.
pub fn capability_candidates(task: &Task) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::with_capacity(1 + task.fallback_capabilities.len());
    for cap in std::iter::once(&task.required_capability).chain(&task.fallback_capabilities) {
        let cap = cap.as_str();
        if !cap.is_empty() && !out.contains(&cap) {
            out.push(cap);
        }
    }
    out
}
