use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A crawled record: an ordered mapping of field names to values.
///
/// Field order is insertion order and is preserved in the encoded output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(name.into(), value.into())
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Record> for Map<String, Value> {
    fn from(record: Record) -> Self {
        record.0
    }
}

/// Bodies longer than this are abbreviated in debug output
const BODY_DEBUG_LIMIT: usize = 203;
const BODY_DEBUG_EDGE: usize = 100;

/// A whole HTTP response body captured by the crawler
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub url: String,
    pub body: String,
    /// RFC 3339 capture time, seconds precision
    pub crawled_at: String,
}

impl Page {
    /// Build a page stamped with the current UTC time
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            body: body.into(),
            crawled_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars = self.body.chars().count();
        let body = if chars > BODY_DEBUG_LIMIT {
            let head: String = self.body.chars().take(BODY_DEBUG_EDGE).collect();
            let tail: String = self.body.chars().skip(chars - BODY_DEBUG_EDGE).collect();
            format!("{}...{}", head, tail)
        } else {
            self.body.clone()
        };

        f.debug_struct("Page")
            .field("url", &self.url)
            .field("body", &body)
            .field("crawled_at", &self.crawled_at)
            .finish()
    }
}

impl From<Page> for Record {
    fn from(page: Page) -> Self {
        Record::new()
            .with_field("url", page.url)
            .with_field("body", page.body)
            .with_field("crawled_at", page.crawled_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn example_html() -> String {
        format!(
            "<DOCTYPE! html>\n<html>\n<head>\n</head>\n<body>{}</body>\n</html",
            "long ".repeat(100)
        )
    }

    #[test]
    fn test_page_debug_abbreviates_body() {
        let page = Page::new("http://example.com", example_html());
        let debug = format!("{:?}", page);

        assert!(debug.len() < page.body.len());
        assert!(debug.contains("..."));
        assert!(debug.contains("http://example.com"));
    }

    #[test]
    fn test_page_debug_keeps_short_body() {
        let page = Page::new("http://example.com", "short body");
        assert!(format!("{:?}", page).contains("short body"));
    }

    #[test]
    fn test_page_new_stamps_crawled_at() {
        let page = Page::new("http://example.com", example_html());

        assert_eq!(page.url, "http://example.com");
        assert_eq!(page.body, example_html());
        let parsed = DateTime::parse_from_rfc3339(&page.crawled_at).unwrap();
        assert_eq!(parsed.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_page_into_record_keeps_field_order() {
        let record: Record = Page::new("http://example.com", "body").into();
        let names: Vec<_> = record.fields().map(|(k, _)| k.as_str()).collect();

        assert_eq!(names, vec!["url", "body", "crawled_at"]);
    }

    #[test]
    fn test_record_serializes_as_plain_object() {
        let record = Record::new().with_field("b", 1).with_field("a", "x");
        assert_eq!(serde_json::to_string(&record).unwrap(), r#"{"b":1,"a":"x"}"#);
    }
}
