use std::fmt;

use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};

/// Ordered header multimap that preserves the original casing of names while
/// offering case-insensitive lookup. Serializes as a JSON object of
/// `name -> [values]` in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMultimap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMultimap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_header_map(headers: &hyper::HeaderMap) -> Self {
        let mut map = Self::new();
        for (name, value) in headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            map.append(name.as_str(), value);
        }
        map
    }

    /// Appends a value under `name`, merging with an existing entry whose name
    /// matches exactly (HTTP stacks normalize repeats to identical casing).
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some((_, values)) = self.entries.iter_mut().find(|(key, _)| key == name) {
            values.push(value);
            return;
        }
        self.entries.push((name.to_owned(), vec![value]));
    }

    /// First value for `name`: exact-key match first, then a case-insensitive
    /// scan over all stored keys.
    pub fn first(&self, name: &str) -> Option<&str> {
        if let Some((_, values)) = self.entries.iter().find(|(key, _)| key == name) {
            return values.first().map(String::as_str);
        }
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).map_err(|err| anyhow::anyhow!("serialize headers: {err}"))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        serde_json::from_str(raw).map_err(|err| anyhow::anyhow!("deserialize headers: {err}"))
    }
}

impl Serialize for HeaderMultimap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, values) in &self.entries {
            map.serialize_entry(name, values)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMultimap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MultimapVisitor;

        impl<'de> Visitor<'de> for MultimapVisitor {
            type Value = HeaderMultimap;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a map of header name to list of values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
                    entries.push((name, values));
                }
                Ok(HeaderMultimap { entries })
            }
        }

        deserializer.deserialize_map(MultimapVisitor)
    }
}

#[cfg(test)]
mod tests {
    use hyper::header::{HeaderName, HeaderValue};

    use super::HeaderMultimap;

    #[test]
    fn append_merges_repeated_names_and_preserves_order() {
        let mut map = HeaderMultimap::new();
        map.append("X-First", "1");
        map.append("X-Second", "2");
        map.append("X-First", "3");

        let entries: Vec<_> = map.iter().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "X-First");
        assert_eq!(entries[0].1, &["1".to_owned(), "3".to_owned()]);
        assert_eq!(entries[1].0, "X-Second");
    }

    #[test]
    fn first_prefers_exact_match_then_scans_case_insensitively() {
        let mut map = HeaderMultimap::new();
        map.append("content-type", "text/plain");
        map.append("Content-Type", "application/json");

        assert_eq!(map.first("Content-Type"), Some("application/json"));
        assert_eq!(map.first("content-type"), Some("text/plain"));
        assert_eq!(map.first("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(map.first("x-missing"), None);
    }

    #[test]
    fn json_round_trip_preserves_order_and_casing() {
        let mut map = HeaderMultimap::new();
        map.append("X-Zebra", "z");
        map.append("Accept", "a1");
        map.append("Accept", "a2");

        let json = map.to_json().unwrap();
        assert_eq!(json, r#"{"X-Zebra":["z"],"Accept":["a1","a2"]}"#);

        let parsed = HeaderMultimap::from_json(&json).unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn from_header_map_captures_multi_valued_headers() {
        let mut headers = hyper::HeaderMap::new();
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("a=1"),
        );
        headers.append(
            HeaderName::from_static("set-cookie"),
            HeaderValue::from_static("b=2"),
        );

        let map = HeaderMultimap::from_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.first("Set-Cookie"), Some("a=1"));
    }

    #[test]
    fn empty_map_serializes_to_empty_object() {
        let map = HeaderMultimap::new();
        assert_eq!(map.to_json().unwrap(), "{}");
        assert!(HeaderMultimap::from_json("{}").unwrap().is_empty());
    }
}
