//! Dependency ordering and start grouping.
//!
//! `sort` produces a topological order using an iterative depth-first walk
//! with three-state marking; `group` splits that order into phases where
//! every dependency lives in a strictly earlier phase than its dependents.

use std::collections::HashMap;
use std::sync::Arc;

use super::descriptor::ServiceDescriptor;
use crate::error::ResolveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Order descriptors so that each appears after all of its dependencies.
///
/// Roots are visited in input order, and dependencies in declared order, so
/// the result is deterministic for a given input. Any cycle or reference to
/// an unknown service fails the whole resolution.
pub fn sort(
    descriptors: &[Arc<ServiceDescriptor>],
) -> Result<Vec<Arc<ServiceDescriptor>>, ResolveError> {
    let index: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    let mut marks: Vec<Option<Mark>> = vec![None; descriptors.len()];
    let mut order = Vec::with_capacity(descriptors.len());

    for root in 0..descriptors.len() {
        if marks[root].is_some() {
            continue;
        }

        // Frames are (node, index of the next dependency to visit).
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Some(Mark::InProgress);

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let deps = &descriptors[node].dependencies;

            if frame.1 < deps.len() {
                let dep = deps[frame.1].as_str();
                frame.1 += 1;

                let dep_index =
                    *index
                        .get(dep)
                        .ok_or_else(|| ResolveError::UnknownDependency {
                            service: descriptors[node].name.clone(),
                            dependency: dep.to_string(),
                        })?;

                match marks[dep_index] {
                    None => {
                        marks[dep_index] = Some(Mark::InProgress);
                        stack.push((dep_index, 0));
                    }
                    Some(Mark::InProgress) => {
                        return Err(ResolveError::Cycle {
                            service: dep.to_string(),
                        });
                    }
                    Some(Mark::Done) => {}
                }
            } else {
                marks[node] = Some(Mark::Done);
                order.push(Arc::clone(&descriptors[node]));
                stack.pop();
            }
        }
    }

    Ok(order)
}

/// Bucket a topological order into start phases.
///
/// A descriptor's phase is `1 + max(phase of its dependencies)`, or 0 when it
/// has none. Dependencies missing from `ordered` are ignored.
pub fn group(ordered: &[Arc<ServiceDescriptor>]) -> Vec<Vec<Arc<ServiceDescriptor>>> {
    let mut levels: HashMap<&str, usize> = HashMap::with_capacity(ordered.len());
    let mut groups: Vec<Vec<Arc<ServiceDescriptor>>> = Vec::new();

    for descriptor in ordered {
        let level = descriptor
            .dependencies
            .iter()
            .filter_map(|dep| levels.get(dep.as_str()))
            .max()
            .map_or(0, |max| max + 1);

        levels.insert(descriptor.name.as_str(), level);
        if groups.len() <= level {
            groups.resize_with(level + 1, Vec::new);
        }
        groups[level].push(Arc::clone(descriptor));
    }

    groups
}

/// `sort` followed by `group`.
pub fn resolve(
    descriptors: &[Arc<ServiceDescriptor>],
) -> Result<Vec<Vec<Arc<ServiceDescriptor>>>, ResolveError> {
    Ok(group(&sort(descriptors)?))
}
