use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::UnixTimeMs;

/// HTTP methods the scanner workflows issue. Mutating calls only; reads
/// go through the regular fetch layer and are never queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Headers = HashMap<String, String>;

/// Merge caller headers over the defaults. Callers win on conflict.
pub fn merged_headers(caller: Option<&Headers>) -> Headers {
    let mut headers = Headers::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    if let Some(caller) = caller {
        for (name, value) in caller {
            headers.insert(name.clone(), value.clone());
        }
    }
    headers
}

/// A pending mutating HTTP call awaiting network availability.
///
/// The body type is generic so callers keep their own payload types;
/// the queue only ever serializes it to JSON at send time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest<B = serde_json::Value> {
    pub id: String,
    pub method: Method,
    pub url: String,
    pub body: Option<B>,
    pub headers: Headers,
    pub timestamp: UnixTimeMs,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl<B> QueuedRequest<B> {
    pub fn new(
        method: Method,
        url: impl Into<String>,
        body: Option<B>,
        headers: Option<&Headers>,
        now: UnixTimeMs,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method,
            url: url.into(),
            body,
            headers: merged_headers(headers),
            timestamp: now,
            retry_count: 0,
            max_retries,
        }
    }

    /// Whether one more failed attempt exhausts the retry budget.
    pub fn next_failure_is_terminal(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Derived queue status; recomputed and broadcast after every enqueue,
/// drain pass, and connectivity transition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub is_online: bool,
    pub queue_length: usize,
    pub last_sync_time: Option<UnixTimeMs>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_content_type_applied() {
        let headers = merged_headers(None);
        assert_eq!(
            headers.get("Content-Type").map(String::as_str),
            Some("application/json")
        );
    }

    #[test]
    fn caller_headers_win_on_conflict() {
        let mut caller = Headers::new();
        caller.insert("Content-Type".to_string(), "text/csv".to_string());
        caller.insert("X-Station".to_string(), "pack-03".to_string());

        let headers = merged_headers(Some(&caller));

        assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/csv"));
        assert_eq!(headers.get("X-Station").map(String::as_str), Some("pack-03"));
    }

    #[test]
    fn retry_budget_boundary() {
        let mut req: QueuedRequest = QueuedRequest::new(
            Method::Post,
            "https://erp.local/api/scanner/stage",
            None,
            None,
            UnixTimeMs(1),
            3,
        );
        assert!(!req.next_failure_is_terminal());
        req.retry_count = 2;
        assert!(req.next_failure_is_terminal());
    }
}
