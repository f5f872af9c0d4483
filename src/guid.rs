//! File identifier to GUID resolution
//!
//! A resolver is built for one preservation run and handed to the metadata
//! transform, which uses it to refer to the entries of related files. Each
//! run owns its own resolver, so concurrent runs never see each other's
//! identifiers.

use crate::error::PreservationError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Ordered map from file id to GUID
#[derive(Debug, Default)]
pub struct GuidResolver {
    order: Vec<String>,
    guids: HashMap<String, String>,
    /// First failed lookup, kept so a transform can report it afterwards
    failure: Mutex<Option<String>>,
}

impl GuidResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from `(file_id, guid)` pairs, keeping their order
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut resolver = Self::new();
        for (file_id, guid) in pairs {
            resolver.insert(file_id, guid);
        }
        resolver
    }

    /// Register a file. Re-registering keeps the original position.
    pub fn insert(&mut self, file_id: impl Into<String>, guid: impl Into<String>) {
        let file_id = file_id.into();
        if !self.guids.contains_key(&file_id) {
            self.order.push(file_id.clone());
        }
        self.guids.insert(file_id, guid.into());
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// GUID registered for a file id
    pub fn guid(&self, file_id: &str) -> Result<&str, PreservationError> {
        match self.guids.get(file_id) {
            Some(guid) => Ok(guid.as_str()),
            None => Err(self.fail(file_id)),
        }
    }

    /// 1-based position of a file id in registration order
    pub fn order(&self, file_id: &str) -> Result<usize, PreservationError> {
        match self.order.iter().position(|id| id == file_id) {
            Some(index) => Ok(index + 1),
            None => Err(self.fail(file_id)),
        }
    }

    /// Whether any lookup has failed
    pub fn has_failure(&self) -> bool {
        self.failure.lock().map(|f| f.is_some()).unwrap_or(true)
    }

    /// The first failed lookup as an error
    pub fn failure(&self) -> Option<PreservationError> {
        self.failure
            .lock()
            .ok()
            .and_then(|f| f.clone())
            .map(PreservationError::UnresolvedIdentifier)
    }

    /// Forget all identifiers and any recorded failure
    pub fn clear(&mut self) {
        self.order.clear();
        self.guids.clear();
        if let Ok(failure) = self.failure.get_mut() {
            *failure = None;
        }
    }

    fn fail(&self, file_id: &str) -> PreservationError {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| file_id.to_string());
        }
        PreservationError::UnresolvedIdentifier(file_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_order() {
        let resolver = GuidResolver::from_pairs([("front.tif", "guid-a"), ("back.tif", "guid-b")]);
        assert_eq!(resolver.guid("back.tif").unwrap(), "guid-b");
        assert_eq!(resolver.order("front.tif").unwrap(), 1);
        assert_eq!(resolver.order("back.tif").unwrap(), 2);
        assert!(!resolver.has_failure());
    }

    #[test]
    fn test_failed_lookup_is_remembered() {
        let resolver = GuidResolver::from_pairs([("front.tif", "guid-a")]);
        assert!(matches!(
            resolver.guid("missing.tif"),
            Err(PreservationError::UnresolvedIdentifier(_))
        ));
        assert!(resolver.order("also-missing.tif").is_err());
        assert!(resolver.has_failure());
        match resolver.failure() {
            Some(PreservationError::UnresolvedIdentifier(id)) => assert_eq!(id, "missing.tif"),
            other => panic!("unexpected failure: {other:?}"),
        }
    }

    #[test]
    fn test_separate_resolvers_do_not_share_state() {
        let mut first = GuidResolver::from_pairs([("a", "1")]);
        let second = GuidResolver::from_pairs([("b", "2")]);
        assert!(first.guid("b").is_err());
        assert!(second.guid("a").is_err());

        first.clear();
        assert!(first.is_empty());
        assert!(!first.has_failure());
    }

    #[test]
    fn test_reinsert_keeps_position() {
        let mut resolver = GuidResolver::from_pairs([("a", "1"), ("b", "2")]);
        resolver.insert("a", "3");
        assert_eq!(resolver.order("a").unwrap(), 1);
        assert_eq!(resolver.guid("a").unwrap(), "3");
        assert_eq!(resolver.len(), 2);
    }
}
