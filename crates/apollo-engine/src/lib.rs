//! Request handlers for diary-to-toon authoring.
//!
//! `Service` owns the injected collaborators (document store, blob store,
//! generative model, clock, event log) and exposes one method per
//! operation of the request surface.

pub mod comments;
pub mod dryrun;
pub mod executor;
pub mod gallery;
pub mod gemini;
pub mod model;
pub mod orchestrator;
pub mod prompt;
pub mod publish;
pub mod rate_limiter;
pub mod references;
pub mod settings;
pub mod storyboard;
pub mod uploads;
pub mod worker;

use std::sync::Arc;

use apollo_contracts::clock::Clock;
use apollo_contracts::episodes::paths::EPISODES;
use apollo_contracts::episodes::Episode;
use apollo_contracts::events::EventWriter;
use apollo_contracts::identity::rate_limit_key;
use apollo_contracts::rate_limit::Admission;
use apollo_contracts::stores::{BlobStore, DocumentStore};
use apollo_contracts::{ApiError, ApiResult};
use serde_json::json;

use crate::model::GenerativeModel;
use crate::rate_limiter::RateLimiter;
use crate::settings::{RatePolicy, Settings};

const MAX_EPISODE_ID_CHARS: usize = 128;

/// Who is calling. `uid` comes from the identity provider; `client_ip` is
/// only ever used as rate-limit key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub uid: Option<String>,
    pub client_ip: String,
}

impl CallContext {
    pub fn authenticated(uid: impl Into<String>, client_ip: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
            client_ip: client_ip.into(),
        }
    }

    pub fn anonymous(client_ip: impl Into<String>) -> Self {
        Self {
            uid: None,
            client_ip: client_ip.into(),
        }
    }

    pub fn require_uid(&self) -> ApiResult<&str> {
        self.uid
            .as_deref()
            .map(str::trim)
            .filter(|uid| !uid.is_empty())
            .ok_or_else(|| ApiError::unauthenticated("Sign-in required."))
    }
}

pub struct Service {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    model: Arc<dyn GenerativeModel>,
    clock: Arc<dyn Clock>,
    settings: Settings,
    events: EventWriter,
    limiter: RateLimiter,
}

impl Service {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        model: Arc<dyn GenerativeModel>,
        clock: Arc<dyn Clock>,
        settings: Settings,
        events: EventWriter,
    ) -> Self {
        let limiter = RateLimiter::new(documents.clone(), clock.clone());
        Self {
            documents,
            blobs,
            model,
            clock,
            settings,
            events,
            limiter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    /// Logs the full chain and hands back the stable generic error.
    fn internal(&self, operation: &str, err: anyhow::Error) -> ApiError {
        self.events.log(
            "internal_error",
            json!({
                "operation": operation,
                "error": error_chain_text(&err, 1024),
            }),
        );
        ApiError::from(err)
    }

    fn log_outcome<T>(&self, operation: &str, result: ApiResult<T>) -> ApiResult<T> {
        if let Err(err) = &result {
            self.events.log(
                &format!("{operation}_rejected"),
                json!({
                    "kind": err.kind,
                    "message": err.message,
                    "retry_after_seconds": err.retry_after_seconds,
                }),
            );
        }
        result
    }

    /// Fixed-window admission for `action`, keyed by the hashed caller
    /// address.
    fn admit(&self, ctx: &CallContext, action: &str) -> ApiResult<Admission> {
        let Some(RatePolicy::Single(limit)) = self.settings.rate_policy(action) else {
            return Ok(Admission {
                allowed: true,
                remaining: u32::MAX,
                retry_after_seconds: None,
            });
        };
        let key = rate_limit_key(&ctx.client_ip, action);
        let admission = self
            .limiter
            .admit(&key, limit)
            .map_err(|err| self.internal(action, err))?;
        if !admission.allowed {
            return Err(ApiError::resource_exhausted(
                format!(
                    "Too many requests. Try again in {} seconds.",
                    admission.retry_after_seconds.unwrap_or(1)
                ),
                admission.retry_after_seconds,
            ));
        }
        Ok(admission)
    }

    fn load_episode(&self, operation: &str, episode_id: &str) -> ApiResult<Option<Episode>> {
        let Some(doc) = self
            .documents
            .get(EPISODES, episode_id)
            .map_err(|err| self.internal(operation, err))?
        else {
            return Ok(None);
        };
        Episode::from_document(episode_id, doc)
            .map(Some)
            .map_err(|err| self.internal(operation, err))
    }

    /// Loads an episode the caller may mutate. With `conceal_not_found` a
    /// missing episode is reported exactly like someone else's.
    fn load_owned_episode(
        &self,
        operation: &str,
        episode_id: &str,
        uid: &str,
    ) -> ApiResult<Episode> {
        let denied = || ApiError::permission_denied("You can only modify your own episodes.");
        match self.load_episode(operation, episode_id)? {
            Some(episode) if episode.is_owned_by(uid) => Ok(episode),
            Some(_) => Err(denied()),
            None if self.settings.conceal_not_found => Err(denied()),
            None => Err(ApiError::not_found("Episode not found.")),
        }
    }
}

/// Episode ids are client-reserved and become document ids and blob path
/// segments.
pub fn validate_episode_id(episode_id: &str) -> ApiResult<()> {
    if episode_id.trim().is_empty() {
        return Err(ApiError::invalid_argument("episodeId is required."));
    }
    if episode_id.chars().count() > MAX_EPISODE_ID_CHARS
        || !episode_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Err(ApiError::invalid_argument(
            "episodeId may only contain letters, digits, '-' and '_'.",
        ));
    }
    Ok(())
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts.last().map(|existing| existing == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return gemini::truncate_text(&err.to_string(), max_chars);
    }
    gemini::truncate_text(&parts.join(" | caused by: "), max_chars)
}

#[cfg(test)]
pub(crate) mod testkit;

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use apollo_contracts::FailureKind;

    use super::*;

    #[test]
    fn episode_ids_are_restricted() {
        assert!(validate_episode_id("ep_2024-01").is_ok());
        assert!(validate_episode_id("").unwrap_err().is(FailureKind::InvalidArgument));
        assert!(validate_episode_id("../x").is_err());
        assert!(validate_episode_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn error_chain_joins_distinct_causes() {
        let err = Err::<(), _>(anyhow::anyhow!("socket closed"))
            .context("Gemini request failed")
            .unwrap_err();
        assert_eq!(
            error_chain_text(&err, 200),
            "Gemini request failed | caused by: socket closed"
        );
    }

    #[test]
    fn uid_is_required_and_trimmed() {
        assert!(CallContext::anonymous("1.2.3.4")
            .require_uid()
            .unwrap_err()
            .is(FailureKind::Unauthenticated));
        assert!(CallContext::authenticated("  ", "ip").require_uid().is_err());
        assert_eq!(
            CallContext::authenticated("uid-1", "ip").require_uid().ok(),
            Some("uid-1")
        );
    }
}
