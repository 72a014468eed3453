//! Cache keys and captured responses.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use turboscout_net::{Request, Response};
use url::Url;

/// Normalized request identity: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Key for an intercepted request.
    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }

    fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.into(),
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// One response header. The value is kept as raw bytes since it need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

/// A captured response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response status text.
    pub status_text: String,

    /// Response headers, in order, duplicates kept.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot `response` under `key`.
    pub fn capture(key: &CacheKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            status_text: response
                .status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            headers,
            body: response.body.to_vec(),
            cached_at: now_millis(),
        }
    }

    /// The key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response from the snapshot.
    ///
    /// Headers that no longer parse (a hand-edited store file) are dropped.
    pub fn to_response(&self) -> Option<Response> {
        let url = Url::parse(&self.url).ok()?;
        let status = StatusCode::from_u16(self.status).ok()?;

        let mut headers = HeaderMap::new();
        for header in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                headers.append(n, v);
            }
        }

        Some(Response {
            url,
            status,
            headers,
            body: Bytes::from(self.body.clone()),
        })
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_key_strips_fragment() {
        let a = CacheKey::get(&url("https://scout.example/index.html#/scout"));
        let b = CacheKey::get(&url("https://scout.example/index.html"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "GET https://scout.example/index.html");
    }

    #[test]
    fn test_key_distinguishes_method_and_query() {
        let get = CacheKey::get(&url("https://scout.example/api?team=254"));
        let post = CacheKey::for_request(&Request::post(
            url("https://scout.example/api?team=254"),
            Bytes::new(),
        ));
        let other = CacheKey::get(&url("https://scout.example/api?team=1678"));
        assert_ne!(get, post);
        assert_ne!(get, other);
    }

    #[test]
    fn test_capture_and_rebuild() {
        let mut response = Response::new(
            url("https://scout.example/static/css/main.css"),
            StatusCode::OK,
            "body{}",
        );
        response
            .headers
            .insert("content-type", HeaderValue::from_static("text/css"));

        let key = CacheKey::get(&response.url);
        let entry = CacheEntry::capture(&key, &response);
        assert_eq!(entry.status_text, "OK");
        assert_eq!(entry.key(), key);

        let rebuilt = entry.to_response().unwrap();
        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.body, Bytes::from_static(b"body{}"));
        assert_eq!(rebuilt.headers.get("content-type").unwrap(), "text/css");
    }

    #[test]
    fn test_non_utf8_header_survives_round_trip() {
        let mut response =
            Response::new(url("https://scout.example/report.csv"), StatusCode::OK, "");
        let latin1 =
            HeaderValue::from_bytes(b"attachment; filename=\"r\xe9sum\xe9.csv\"").unwrap();
        response.headers.insert("content-disposition", latin1.clone());
        response
            .headers
            .append("x-scout", HeaderValue::from_static("a"));
        response
            .headers
            .append("x-scout", HeaderValue::from_static("b"));

        let entry = CacheEntry::capture(&CacheKey::get(&response.url), &response);
        assert_eq!(entry.headers.len(), 3);

        let json = serde_json::to_string(&entry).unwrap();
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        let rebuilt = back.to_response().unwrap();
        assert_eq!(rebuilt.headers.get("content-disposition"), Some(&latin1));
        let scouts: Vec<_> = rebuilt.headers.get_all("x-scout").iter().collect();
        assert_eq!(scouts, vec!["a", "b"]);
    }

    #[test]
    fn test_body_is_base64_in_json() {
        let entry = CacheEntry {
            url: "https://scout.example/".to_string(),
            method: "GET".to_string(),
            status: 200,
            status_text: "OK".to_string(),
            headers: Vec::new(),
            body: b"<html>".to_vec(),
            cached_at: 0,
        };

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["body"], "PGh0bWw+");

        let back: CacheEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }
}
