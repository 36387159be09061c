use std::collections::HashMap;

use super::pending::Completion;

/// In-flight deduplication keys and the callers piggybacking on each.
///
/// The authoritative request carries its own completion through the queue;
/// only followers are stored here. An entry lives from the first submission
/// until that request's result is delivered.
#[derive(Debug, Default)]
pub(crate) struct DedupTable {
    entries: HashMap<String, Vec<Completion>>,
}

pub(crate) enum Registration {
    /// No identical request is pending; the caller must queue its own.
    Authoritative(Completion),
    /// Chained onto an existing entry.
    Follower,
}

impl DedupTable {
    pub(crate) fn register(&mut self, key: &str, completion: Completion) -> Registration {
        match self.entries.get_mut(key) {
            Some(followers) => {
                followers.push(completion);
                Registration::Follower
            }
            None => {
                self.entries.insert(key.to_string(), Vec::new());
                Registration::Authoritative(completion)
            }
        }
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove the entry, returning every follower still waiting on it.
    pub(crate) fn complete(&mut self, key: &str) -> Vec<Completion> {
        self.entries.remove(key).unwrap_or_default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn waiting(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::request::QueryId;

    fn completion() -> Completion {
        let (c, _pending) = Completion::channel(QueryId::new(), None, false);
        c
    }

    #[test]
    fn test_first_registration_is_authoritative() {
        let mut table = DedupTable::default();
        assert!(matches!(
            table.register("k", completion()),
            Registration::Authoritative(_)
        ));
        assert!(matches!(table.register("k", completion()), Registration::Follower));
        assert!(matches!(table.register("k", completion()), Registration::Follower));
        assert_eq!(table.len(), 1);
        assert_eq!(table.waiting(), 2);

        assert_eq!(table.complete("k").len(), 2);
        assert_eq!(table.len(), 0);
        assert!(table.complete("k").is_empty());
    }
}
