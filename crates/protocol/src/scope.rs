//! Permission scopes granted to an agent's credentials.
//!
//! A scope is a list of colon-delimited segments. `docker:restart` is exact;
//! a trailing `*` segment makes it a prefix wildcard, so `docker:*` covers
//! `docker:ps` and `docker:logs:tail`, and a bare `*` covers everything.

use serde::{Deserialize, Serialize};

/// A parsed permission scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope {
    segments: Vec<String>,
}

impl Scope {
    pub fn parse(raw: &str) -> Self {
        Self {
            segments: raw.split(':').map(str::to_string).collect(),
        }
    }

    /// Whether this scope covers the given action.
    pub fn covers(&self, action: &str) -> bool {
        let action: Vec<&str> = action.split(':').collect();
        let wildcard = self.segments.last().is_some_and(|s| s == "*");
        let prefix_len = if wildcard {
            self.segments.len() - 1
        } else {
            self.segments.len()
        };

        if wildcard {
            if action.len() < prefix_len {
                return false;
            }
        } else if action.len() != prefix_len {
            return false;
        }
        self.segments[..prefix_len]
            .iter()
            .zip(&action)
            .all(|(s, a)| s == a)
    }
}

/// True if any scope in the list covers the action.
pub fn any_covers(scopes: &[Scope], action: &str) -> bool {
    scopes.iter().any(|s| s.covers(action))
}
