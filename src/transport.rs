use thiserror::Error;

use crate::request::{Headers, Method};

pub const STATUS_CONFLICT: u16 = 409;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

/// Response as seen by the queue: status plus raw body. Interpretation
/// of the body is entirely the caller's concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A 409 means the resource changed server-side since the request
    /// was created; it is classified apart from other failures.
    pub fn is_conflict(&self) -> bool {
        self.status == STATUS_CONFLICT
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Check that every header would be accepted on the wire. The queue
/// runs this at enqueue time so a request persisted offline cannot
/// fail the same way on every drain pass.
pub fn validate_headers(headers: &Headers) -> Result<(), TransportError> {
    for (name, value) in headers {
        reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
        reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidHeader(format!("{name}: {e}")))?;
    }
    Ok(())
}

/// Outbound HTTP seam. The queue owns when a request is sent; this trait
/// owns how. A scripted implementation stands in during tests.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &Headers,
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&[u8]>,
        headers: &Headers,
    ) -> Result<HttpResponse, TransportError> {
        let method = match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };

        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.body(body.to_vec());
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_validation() {
        let mut headers = Headers::new();
        headers.insert("X-Station".to_string(), "pack-03".to_string());
        assert!(validate_headers(&headers).is_ok());

        headers.insert("bad name".to_string(), "ok".to_string());
        assert!(matches!(
            validate_headers(&headers),
            Err(TransportError::InvalidHeader(_))
        ));

        let mut headers = Headers::new();
        headers.insert("X-Note".to_string(), "line\nbreak".to_string());
        assert!(matches!(
            validate_headers(&headers),
            Err(TransportError::InvalidHeader(_))
        ));
    }

    #[test]
    fn status_classification() {
        let ok = HttpResponse { status: 201, body: vec![] };
        assert!(ok.is_success());
        assert!(!ok.is_conflict());

        let conflict = HttpResponse { status: 409, body: b"stale lp".to_vec() };
        assert!(!conflict.is_success());
        assert!(conflict.is_conflict());
        assert_eq!(conflict.body_text(), "stale lp");

        let server_error = HttpResponse { status: 500, body: vec![] };
        assert!(!server_error.is_success());
        assert!(!server_error.is_conflict());
    }
}
