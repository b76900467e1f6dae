//! Contact hierarchy resolution.
//!
//! Walks from a contact up through its ancestors to find the contacts that
//! carry an org-unit mapping for a data set. The walk prefers the indexed
//! document of each ancestor (its own `parent` is authoritative) and falls
//! back to the nested lineage when an ancestor is not indexed. It is bounded
//! by a maximum depth and stops on the first revisited id. Subtree membership
//! uses the same walk.

use crate::models::Contact;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Which mapped contacts on a lineage a target document counts toward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum AttributionPolicy {
    /// Every mapped contact from the owner up to the root.
    #[default]
    AllAncestors,
    /// Only the nearest mapped contact.
    Nearest,
}

impl fmt::Display for AttributionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributionPolicy::AllAncestors => write!(f, "all-ancestors"),
            AttributionPolicy::Nearest => write!(f, "nearest"),
        }
    }
}

/// Index over a set of contacts, addressed by position.
pub struct Hierarchy<'a> {
    contacts: &'a [Contact],
    index: HashMap<&'a str, usize>,
    max_depth: usize,
}

impl<'a> Hierarchy<'a> {
    pub fn new(contacts: &'a [Contact], max_depth: usize) -> Self {
        let index = contacts
            .iter()
            .enumerate()
            .map(|(pos, c)| (c.id.as_str(), pos))
            .collect();
        Self {
            contacts,
            index,
            max_depth,
        }
    }

    pub fn contact(&self, pos: usize) -> &'a Contact {
        &self.contacts[pos]
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Ids on the walk up from `start`, each with its position when indexed.
    fn walk(&self, start: usize) -> Vec<(&'a str, Option<usize>)> {
        let contacts: &'a [Contact] = self.contacts;
        let origin = &contacts[start];
        let mut path = vec![(origin.id.as_str(), Some(start))];
        let mut visited: HashSet<&str> = HashSet::from([origin.id.as_str()]);
        let mut pending = origin.parent.as_ref();
        let mut steps = 0;

        while let Some(parent) = pending {
            if steps >= self.max_depth {
                warn!(
                    "Lineage of {} exceeds {} levels, truncating",
                    origin.id, self.max_depth
                );
                break;
            }
            steps += 1;

            if !visited.insert(parent.id.as_str()) {
                warn!("Parent cycle at {} in lineage of {}", parent.id, origin.id);
                break;
            }

            let pos = self.position(&parent.id);
            path.push((parent.id.as_str(), pos));
            pending = match pos {
                Some(pos) => contacts[pos].parent.as_ref(),
                None => parent.parent.as_deref(),
            };
        }

        path
    }

    /// Positions of `start` and its indexed ancestors, nearest first.
    pub fn lineage(&self, start: usize) -> Vec<usize> {
        self.walk(start)
            .into_iter()
            .filter_map(|(_, pos)| pos)
            .collect()
    }

    /// True when `place_id` is `start` itself or any ancestor on its walk.
    pub fn is_within(&self, start: usize, place_id: &str) -> bool {
        self.walk(start).iter().any(|(id, _)| *id == place_id)
    }

    /// Mapped contacts on the lineage of `start` for `data_set`.
    pub fn attributions(
        &self,
        start: usize,
        data_set: &str,
        policy: AttributionPolicy,
    ) -> Vec<usize> {
        let mapped = self
            .lineage(start)
            .into_iter()
            .filter(|&pos| self.contacts[pos].org_unit_for(data_set).is_some());

        match policy {
            AttributionPolicy::AllAncestors => mapped.collect(),
            AttributionPolicy::Nearest => mapped.take(1).collect(),
        }
    }
}
