//! Declarative Census query descriptions.
//!
//! A [`Query`] names a collection, equality terms, a result limit and optional
//! resolve hints. It renders the request path and its parameters separately so
//! the transport can percent-encode them; it carries no transport state.

use std::fmt::Display;

/// A request against one Census collection.
///
/// ```rust,ignore
/// let query = Query::new("outfit")
///     .where_eq("alias_lower", "abcd")
///     .with_limit(1)
///     .add_resolve("member_character_name");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    collection: String,
    terms: Vec<(String, String)>,
    limit: Option<usize>,
    resolves: Vec<String>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            terms: Vec::new(),
            limit: None,
            resolves: Vec::new(),
        }
    }

    /// Add an equality term, `field=value`.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Display) -> Self {
        self.terms.push((field.into(), value.to_string()));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Ask the server to join related data into each row.
    pub fn add_resolve(mut self, resolve: impl Into<String>) -> Self {
        self.resolves.push(resolve.into());
        self
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Value of the first term on `field`, if any.
    pub fn term(&self, field: &str) -> Option<&str> {
        self.terms
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.as_str())
    }

    /// Request parameters in order: terms, then `c:limit`, then `c:resolve`.
    ///
    /// Values are raw; the transport encodes them.
    pub fn params(&self) -> Vec<(String, String)> {
        let mut params = self.terms.clone();

        if let Some(limit) = self.limit {
            params.push(("c:limit".to_string(), limit.to_string()));
        }

        if !self.resolves.is_empty() {
            params.push(("c:resolve".to_string(), self.resolves.join(",")));
        }

        params
    }

    /// Unencoded query string for logs, e.g. `type=facility&c:limit=1000`.
    pub fn query_string(&self) -> String {
        self.params()
            .iter()
            .map(|(field, value)| format!("{}={}", field, value))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Request URL without the query part.
    pub fn base_url(&self, root_endpoint: &str, service_id: &str, namespace: &str) -> String {
        format!(
            "{}/s:{}/get/{}/{}/",
            root_endpoint.trim_end_matches('/'),
            service_id,
            namespace,
            self.collection
        )
    }

    /// Name of the array the server wraps results in, e.g. `world_event_list`.
    pub fn list_key(&self) -> String {
        format!("{}_list", self.collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_string() {
        let query = Query::new("world_event")
            .where_eq("type", "facility")
            .where_eq("world_id", 13)
            .where_eq("after", 1_700_000_000)
            .with_limit(1000);

        assert_eq!(
            query.query_string(),
            "type=facility&world_id=13&after=1700000000&c:limit=1000"
        );
        assert_eq!(query.term("world_id"), Some("13"));
        assert_eq!(query.term("before"), None);
        assert_eq!(query.limit(), Some(1000));
    }

    #[test]
    fn test_base_url_and_params() {
        let query = Query::new("outfit")
            .with_limit(1)
            .where_eq("alias_lower", "abcd")
            .add_resolve("member_character_name");

        assert_eq!(
            query.base_url("https://census.daybreakgames.com/", "example", "ps2:v2"),
            "https://census.daybreakgames.com/s:example/get/ps2:v2/outfit/"
        );
        assert_eq!(
            query.params(),
            vec![
                ("alias_lower".to_string(), "abcd".to_string()),
                ("c:limit".to_string(), "1".to_string()),
                ("c:resolve".to_string(), "member_character_name".to_string()),
            ]
        );
        assert_eq!(query.list_key(), "outfit_list");
    }

    #[test]
    fn test_bare_query() {
        let query = Query::new("map_region");
        assert_eq!(query.query_string(), "");
        assert!(query.params().is_empty());
        assert_eq!(query.collection(), "map_region");
    }
}
