//! Transport boundary types shared by the cache manager and sync engine.
//!
//! All outgoing traffic is expressed as [`Request`] / [`Response`] pairs and
//! flows through the [`Fetch`] seam, so tests can substitute the network with
//! a closure while production code uses the reqwest-backed implementation.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use url::Url;

/// HTTP methods the interception layer distinguishes.
///
/// Only GET participates in caching; everything else passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

/// An outgoing request as seen at the interception boundary.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid request URL {}: {}", url, e))?;
    Ok(Self {
      method,
      url,
      headers: BTreeMap::new(),
      body: None,
    })
  }

  /// Convenience constructor for GET requests.
  pub fn get(url: &str) -> Result<Self> {
    Self::new(Method::Get, url)
  }
}

/// A response delivered back to the caller of the interception layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header names are stored lowercase.
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: Vec<u8>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  /// Whether the status is in the 2xx range. Only successful responses are
  /// ever written into the cache.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self.headers.get(&name.to_lowercase()).map(String::as_str)
  }

  pub fn set_header(&mut self, name: &str, value: &str) {
    self.headers.insert(name.to_lowercase(), value.to_string());
  }

  /// Build a synthetic JSON error response, e.g. the terminal offline payload.
  pub fn json_error(status: u16, error: &str, message: &str) -> Self {
    let body = serde_json::json!({ "error": error, "message": message });
    let mut response = Self::new(status, body.to_string().into_bytes());
    response.set_header("content-type", "application/json");
    response
  }
}

/// A boxed future resolving to a fetched response.
pub type FetchFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;

/// The network seam. Implemented by [`ReqwestFetch`] for real traffic and by
/// plain closures in tests.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: Request) -> FetchFuture;
}

impl<F> Fetch for F
where
  F: Fn(Request) -> FetchFuture + Send + Sync,
{
  fn fetch(&self, request: Request) -> FetchFuture {
    self(request)
  }
}

/// Production fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestFetch {
  client: reqwest::Client,
}

impl ReqwestFetch {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl Default for ReqwestFetch {
  fn default() -> Self {
    Self::new()
  }
}

impl Fetch for ReqwestFetch {
  fn fetch(&self, request: Request) -> FetchFuture {
    let client = self.client.clone();
    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
        .map_err(|e| eyre!("Invalid method: {}", e))?;

      let mut builder = client.request(method, request.url.clone());
      for (name, value) in &request.headers {
        builder = builder.header(name, value);
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let mut headers = BTreeMap::new();
      for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
          headers.insert(name.as_str().to_lowercase(), value.to_string());
        }
      }

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response body: {}", e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn json_error_carries_fixed_payload() {
    let response = Response::json_error(503, "offline", "no network");

    assert_eq!(response.status, 503);
    assert!(!response.is_success());
    assert_eq!(response.header("Content-Type"), Some("application/json"));

    let parsed: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(parsed["error"], "offline");
    assert_eq!(parsed["message"], "no network");
  }

  #[test]
  fn header_lookup_is_case_insensitive() {
    let mut response = Response::new(200, Vec::new());
    response.set_header("X-Served-From", "cache");

    assert_eq!(response.header("x-served-from"), Some("cache"));
    assert_eq!(response.header("X-SERVED-FROM"), Some("cache"));
  }

  #[tokio::test]
  async fn closures_implement_fetch() {
    let fetcher = |_request: Request| -> FetchFuture {
      Box::pin(async { Ok(Response::new(200, b"ok".to_vec())) })
    };

    let request = Request::get("https://example.com/thing").unwrap();
    let response = fetcher.fetch(request).await.unwrap();
    assert_eq!(response.body, b"ok");
  }
}
