//! Remote preferences API seam.
//!
//! The sync engine only ever talks to the remote authority through
//! [`PreferencesApi`], so tests substitute closures or canned
//! implementations while production uses the reqwest-backed client.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use url::Url;

use crate::config::{ApiConfig, Config};
use crate::store::records::JourneyState;

/// A boxed future for API calls.
pub type ApiFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Journey state as the preferences endpoint represents it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJourney {
  pub path_id: Option<String>,
  pub experience_level: Option<String>,
  #[serde(default)]
  pub goals: Vec<String>,
  #[serde(default)]
  pub onboarding_completed: bool,
  pub onboarding_completed_at: Option<DateTime<Utc>>,
  pub last_path_change: Option<DateTime<Utc>>,
}

impl From<JourneyState> for RemoteJourney {
  fn from(state: JourneyState) -> Self {
    Self {
      path_id: state.path_id,
      experience_level: state.experience_level,
      goals: state.goals,
      onboarding_completed: state.onboarding_completed,
      onboarding_completed_at: state.onboarding_completed_at,
      last_path_change: state.last_path_change,
    }
  }
}

impl From<RemoteJourney> for JourneyState {
  fn from(remote: RemoteJourney) -> Self {
    Self {
      path_id: remote.path_id,
      experience_level: remote.experience_level,
      goals: remote.goals,
      onboarding_completed: remote.onboarding_completed,
      onboarding_completed_at: remote.onboarding_completed_at,
      last_path_change: remote.last_path_change,
    }
  }
}

/// The asynchronously fetched "recommended next action".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextAction {
  pub title: String,
  pub href: String,
  pub reason: Option<String>,
}

/// Remote authority for journey state and recommendations.
pub trait PreferencesApi: Send + Sync {
  /// Push the full current snapshot.
  fn push_journey(&self, journey: RemoteJourney) -> ApiFuture<()>;

  /// Fetch the server-side journey, `None` when the account has none yet.
  fn fetch_journey(&self) -> ApiFuture<Option<RemoteJourney>>;

  /// Fetch the recommended next action.
  fn fetch_next_action(&self) -> ApiFuture<NextAction>;
}

/// Production client for the preferences API.
#[derive(Clone)]
pub struct HttpPreferencesApi {
  client: reqwest::Client,
  preferences_url: Url,
  next_action_url: Url,
  token: Option<String>,
}

impl HttpPreferencesApi {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let base = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid base URL {}: {}", config.base_url, e))?;
    let preferences_url = base
      .join(&config.preferences_path)
      .map_err(|e| eyre!("Invalid preferences path: {}", e))?;
    let next_action_url = base
      .join(&config.next_action_path)
      .map_err(|e| eyre!("Invalid next-action path: {}", e))?;

    Ok(Self {
      client: reqwest::Client::new(),
      preferences_url,
      next_action_url,
      token: Config::get_api_token(),
    })
  }

  fn request(&self, method: reqwest::Method, url: &Url) -> reqwest::RequestBuilder {
    let mut builder = self.client.request(method, url.clone());
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    builder
  }
}

impl PreferencesApi for HttpPreferencesApi {
  fn push_journey(&self, journey: RemoteJourney) -> ApiFuture<()> {
    let builder = self.request(reqwest::Method::PUT, &self.preferences_url).json(&journey);
    Box::pin(async move {
      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to push preferences: {}", e))?;
      if !response.status().is_success() {
        return Err(eyre!("Preferences push rejected: {}", response.status()));
      }
      Ok(())
    })
  }

  fn fetch_journey(&self) -> ApiFuture<Option<RemoteJourney>> {
    let builder = self.request(reqwest::Method::GET, &self.preferences_url);
    Box::pin(async move {
      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch preferences: {}", e))?;
      if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
      }
      if !response.status().is_success() {
        return Err(eyre!("Preferences fetch rejected: {}", response.status()));
      }
      let journey = response
        .json()
        .await
        .map_err(|e| eyre!("Failed to parse preferences: {}", e))?;
      Ok(Some(journey))
    })
  }

  fn fetch_next_action(&self) -> ApiFuture<NextAction> {
    let builder = self.request(reqwest::Method::GET, &self.next_action_url);
    Box::pin(async move {
      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch next action: {}", e))?;
      if !response.status().is_success() {
        return Err(eyre!("Next-action fetch rejected: {}", response.status()));
      }
      response
        .json()
        .await
        .map_err(|e| eyre!("Failed to parse next action: {}", e))
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_journey_uses_the_wire_field_names() {
    let remote: RemoteJourney = serde_json::from_str(
      r#"{"pathId":"frontend","experienceLevel":"beginner","goals":["g1"],"onboardingCompleted":true}"#,
    )
    .unwrap();

    assert_eq!(remote.path_id.as_deref(), Some("frontend"));
    assert!(remote.onboarding_completed);

    let state: JourneyState = remote.clone().into();
    let back: RemoteJourney = state.into();
    assert_eq!(back, remote);
  }

  #[test]
  fn http_api_builds_endpoint_urls() {
    let api = HttpPreferencesApi::new(&ApiConfig::default()).unwrap();
    assert!(api.preferences_url.as_str().ends_with("/api/preferences"));
    assert!(api.next_action_url.as_str().ends_with("/api/next-action"));
  }
}
