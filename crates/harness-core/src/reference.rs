//! Process-wide cache of real entity identifiers pulled from the target's
//! listing endpoints, so simulated users hit existing campaigns and rounds.
//!
//! Each [`CacheKind`] moves through [`CacheState`] independently:
//! `NotFetched` until a fetch yields at least one identifier (`Fetched`) or the
//! attempt cap is reached (`GivenUp`). Both end states are permanent for the
//! run. Callers of [`ReferenceCache::get_random`] get placeholder identifiers
//! while nothing has been fetched.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::{HttpClient, Request, Session};
use crate::config::ReferenceConfig;

/// Largest page the listing endpoints are asked for.
pub const MAX_PAGE_SIZE: u32 = 10;

/// Page size actually requested for a configured value.
pub fn effective_page_size(page_size: u32) -> u32 {
    page_size.clamp(1, MAX_PAGE_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    /// Numeric campaign ids, for API routes keyed by id.
    CampaignIds,
    /// Campaign slugs, for page routes.
    CampaignSlugs,
    /// Slug when the campaign has one, else its id.
    CampaignIdentifiers,
    RoundIds,
}

impl CacheKind {
    pub const ALL: [CacheKind; 4] = [
        CacheKind::CampaignIds,
        CacheKind::CampaignSlugs,
        CacheKind::CampaignIdentifiers,
        CacheKind::RoundIds,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::CampaignIds => "campaign_ids",
            CacheKind::CampaignSlugs => "campaign_slugs",
            CacheKind::CampaignIdentifiers => "campaign_identifiers",
            CacheKind::RoundIds => "round_ids",
        }
    }

    pub fn listing_path(self, page_size: u32) -> String {
        match self {
            CacheKind::CampaignIds | CacheKind::CampaignSlugs | CacheKind::CampaignIdentifiers => {
                format!("/api/campaigns?page=1&pageSize={page_size}&status=active")
            }
            CacheKind::RoundIds => format!("/api/rounds?page=1&pageSize={page_size}"),
        }
    }

    pub fn setup_label(self) -> String {
        let base = match self {
            CacheKind::RoundIds => "/api/rounds",
            _ => "/api/campaigns",
        };
        format!("{base} [SETUP {}]", self.as_str())
    }

    /// Stand-ins used when no live identifiers are available.
    pub fn placeholders(self) -> Vec<RefId> {
        match self {
            CacheKind::CampaignIds => vec![RefId::Int(1), RefId::Int(2), RefId::Int(3)],
            CacheKind::CampaignSlugs => vec![
                RefId::Str("placeholder-slug-1".to_string()),
                RefId::Str("placeholder-slug-2".to_string()),
            ],
            CacheKind::CampaignIdentifiers => vec![RefId::Str("1".to_string())],
            CacheKind::RoundIds => vec![RefId::Int(1)],
        }
    }

    /// Pull this kind's identifiers out of a listing payload, dropping items without one.
    pub fn extract(self, payload: &Value) -> Vec<RefId> {
        match self {
            CacheKind::CampaignIds => campaigns(payload)
                .filter_map(|c| c.get("id").and_then(Value::as_i64))
                .map(RefId::Int)
                .collect(),
            CacheKind::CampaignSlugs => campaigns(payload)
                .filter_map(slug)
                .map(|s| RefId::Str(s.to_string()))
                .collect(),
            CacheKind::CampaignIdentifiers => campaigns(payload)
                .filter_map(|c| match slug(c) {
                    Some(s) => Some(RefId::Str(s.to_string())),
                    None => id_of(c).map(|id| RefId::Str(id.to_string())),
                })
                .collect(),
            CacheKind::RoundIds => {
                let list = payload.get("data").unwrap_or(payload);
                list.as_array()
                    .into_iter()
                    .flatten()
                    .filter_map(id_of)
                    .collect()
            }
        }
    }
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn campaigns(payload: &Value) -> impl Iterator<Item = &Value> {
    payload
        .get("campaigns")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn slug(item: &Value) -> Option<&str> {
    item.get("slug")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn id_of(item: &Value) -> Option<RefId> {
    match item.get("id")? {
        Value::Number(n) => n.as_i64().map(RefId::Int),
        Value::String(s) if !s.is_empty() => Some(RefId::Str(s.clone())),
        _ => None,
    }
}

/// An entity identifier as it appears in request paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RefId {
    Int(i64),
    Str(String),
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefId::Int(id) => write!(f, "{id}"),
            RefId::Str(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("listing returned status {0}")]
    Status(u16),
    #[error("listing request failed: {0}")]
    Transport(String),
    #[error("malformed listing payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("listing contained no usable identifiers")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    NotFetched { attempts: u32 },
    Fetched(Vec<RefId>),
    GivenUp,
}

impl Default for CacheState {
    fn default() -> Self {
        CacheState::NotFetched { attempts: 0 }
    }
}

impl CacheState {
    /// Settled states never trigger another fetch.
    pub fn is_settled(&self) -> bool {
        !matches!(self, CacheState::NotFetched { .. })
    }

    pub fn ids(&self) -> &[RefId] {
        match self {
            CacheState::Fetched(ids) => ids,
            _ => &[],
        }
    }

    /// Next state after one fetch attempt. Settled states are returned unchanged.
    pub fn transition(self, outcome: &Result<Vec<RefId>, FetchError>, max_attempts: u32) -> Self {
        let attempts = match self {
            CacheState::NotFetched { attempts } => attempts,
            settled => return settled,
        };
        match outcome {
            Ok(ids) if !ids.is_empty() => CacheState::Fetched(ids.clone()),
            _ => {
                let attempts = attempts + 1;
                if attempts >= max_attempts {
                    CacheState::GivenUp
                } else {
                    CacheState::NotFetched { attempts }
                }
            }
        }
    }
}

/// One listing request for `kind`. Every failure mode maps to a [`FetchError`].
pub async fn fetch_listing(
    kind: CacheKind,
    page_size: u32,
    client: &dyn HttpClient,
    session: &Session,
) -> Result<Vec<RefId>, FetchError> {
    let request = Request::get(kind.listing_path(page_size), kind.setup_label());
    let response = client
        .send(session, &request)
        .await
        .map_err(|e| FetchError::Transport(format!("{e:#}")))?;

    if !response.is_success() {
        return Err(FetchError::Status(response.status));
    }

    let ids = kind.extract(&response.json()?);
    if ids.is_empty() {
        return Err(FetchError::Empty);
    }
    Ok(ids)
}

/// Identifier handed to a task, flagged when it came from the placeholder set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefPick {
    pub id: RefId,
    pub placeholder: bool,
}

/// Reference data shared by every simulated user in the process.
pub struct ReferenceCache {
    page_size: u32,
    max_attempts: u32,
    slots: [Mutex<CacheState>; 4],
}

impl ReferenceCache {
    pub fn new(config: &ReferenceConfig) -> Self {
        Self::with_limits(config.page_size, config.max_attempts)
    }

    pub fn with_limits(page_size: u32, max_attempts: u32) -> Self {
        Self {
            page_size: effective_page_size(page_size),
            max_attempts: max_attempts.max(1),
            slots: Default::default(),
        }
    }

    fn slot(&self, kind: CacheKind) -> &Mutex<CacheState> {
        &self.slots[kind.index()]
    }

    /// Make at most one fetch attempt for `kind` unless it is already settled.
    /// Concurrent callers queue on the kind's lock and see the settled state.
    pub async fn ensure_populated(&self, kind: CacheKind, client: &dyn HttpClient, session: &Session) {
        let mut state = self.slot(kind).lock().await;
        let CacheState::NotFetched { attempts } = *state else {
            return;
        };

        info!(
            "Fetching {} (attempt {}/{})",
            kind,
            attempts + 1,
            self.max_attempts
        );
        let outcome = fetch_listing(kind, self.page_size, client, session).await;
        let next = std::mem::take(&mut *state).transition(&outcome, self.max_attempts);

        match (&outcome, &next) {
            (_, CacheState::Fetched(ids)) => info!("Fetched {} {}", ids.len(), kind),
            (Err(e), CacheState::GivenUp) => warn!(
                "Giving up on {} after {} attempts ({}); using placeholders",
                kind, self.max_attempts, e
            ),
            (Err(e), _) => warn!("Fetch of {} failed, will retry: {}", kind, e),
            (Ok(_), _) => {}
        }
        *state = next;
    }

    /// A random cached identifier, or a random placeholder when none were fetched.
    pub async fn get_random<R: Rng + Send + ?Sized>(&self, kind: CacheKind, rng: &mut R) -> RefId {
        self.pick(kind, rng).await.id
    }

    pub async fn pick<R: Rng + Send + ?Sized>(&self, kind: CacheKind, rng: &mut R) -> RefPick {
        let state = self.slot(kind).lock().await;
        match state.ids().choose(rng) {
            Some(id) => RefPick {
                id: id.clone(),
                placeholder: false,
            },
            None => {
                let placeholders = kind.placeholders();
                let idx = rng.gen_range(0..placeholders.len());
                RefPick {
                    id: placeholders[idx].clone(),
                    placeholder: true,
                }
            }
        }
    }

    pub async fn state(&self, kind: CacheKind) -> CacheState {
        self.slot(kind).lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClient, MockReply};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    const LISTING: &str = r#"{"campaigns":[{"id":7,"slug":"save-the-bees"},{"id":9}]}"#;

    #[test]
    fn test_extract_campaign_listing() {
        let payload: Value = serde_json::from_str(LISTING).unwrap();

        assert_eq!(
            CacheKind::CampaignSlugs.extract(&payload),
            vec![RefId::Str("save-the-bees".into())]
        );
        assert_eq!(
            CacheKind::CampaignIds.extract(&payload),
            vec![RefId::Int(7), RefId::Int(9)]
        );
        assert_eq!(
            CacheKind::CampaignIdentifiers.extract(&payload),
            vec![RefId::Str("save-the-bees".into()), RefId::Str("9".into())]
        );
    }

    #[test]
    fn test_extract_round_ids() {
        let wrapped = serde_json::json!({"data": [{"id": 4}, {"name": "x"}, {"id": "r-5"}]});
        assert_eq!(
            CacheKind::RoundIds.extract(&wrapped),
            vec![RefId::Int(4), RefId::Str("r-5".into())]
        );

        let bare = serde_json::json!([{"id": 1}, 5, {"id": null}]);
        assert_eq!(CacheKind::RoundIds.extract(&bare), vec![RefId::Int(1)]);

        assert!(CacheKind::CampaignIds.extract(&serde_json::json!({"campaigns": "nope"})).is_empty());
    }

    #[test]
    fn test_transition() {
        let ids = vec![RefId::Int(1)];
        let start = CacheState::default();

        assert_eq!(
            start.clone().transition(&Ok(ids.clone()), 3),
            CacheState::Fetched(ids.clone())
        );
        assert_eq!(
            start.clone().transition(&Err(FetchError::Status(500)), 3),
            CacheState::NotFetched { attempts: 1 }
        );
        assert_eq!(
            start.transition(&Ok(Vec::new()), 1),
            CacheState::GivenUp
        );
        assert_eq!(
            CacheState::NotFetched { attempts: 2 }.transition(&Err(FetchError::Empty), 3),
            CacheState::GivenUp
        );
        assert_eq!(
            CacheState::GivenUp.transition(&Ok(ids.clone()), 3),
            CacheState::GivenUp
        );
        assert_eq!(
            CacheState::Fetched(ids.clone()).transition(&Err(FetchError::Empty), 3),
            CacheState::Fetched(ids)
        );
    }

    #[test]
    fn test_page_size_is_clamped() {
        let cache = ReferenceCache::with_limits(100, 3);
        assert_eq!(cache.page_size, 10);
        assert_eq!(effective_page_size(0), 1);
        assert_eq!(effective_page_size(4), 4);
        assert_eq!(
            CacheKind::CampaignIds.listing_path(cache.page_size),
            "/api/campaigns?page=1&pageSize=10&status=active"
        );
    }

    #[tokio::test]
    async fn test_successful_fetch_is_used_and_not_repeated() {
        let client = MockClient::new(0).route("/api/campaigns", MockReply::ok(LISTING));
        let cache = ReferenceCache::with_limits(10, 3);
        let session = Session::new();
        let mut rng = StdRng::seed_from_u64(3);

        cache.ensure_populated(CacheKind::CampaignIds, &client, &session).await;
        cache.ensure_populated(CacheKind::CampaignIds, &client, &session).await;
        assert_eq!(client.calls("/api/campaigns"), 1);

        for _ in 0..50 {
            let id = cache.get_random(CacheKind::CampaignIds, &mut rng).await;
            assert!(id == RefId::Int(7) || id == RefId::Int(9), "unexpected id {id}");
        }
    }

    #[tokio::test]
    async fn test_three_failures_give_up_permanently() {
        let client = MockClient::new(0).route("/api/campaigns", MockReply::status(500));
        let cache = ReferenceCache::with_limits(10, 3);
        let session = Session::new();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..3 {
            cache.ensure_populated(CacheKind::CampaignIds, &client, &session).await;
        }
        assert_eq!(cache.state(CacheKind::CampaignIds).await, CacheState::GivenUp);
        assert_eq!(client.calls("/api/campaigns"), 3);

        for _ in 0..5 {
            cache.ensure_populated(CacheKind::CampaignIds, &client, &session).await;
        }
        assert_eq!(client.calls("/api/campaigns"), 3);

        let placeholders = CacheKind::CampaignIds.placeholders();
        for _ in 0..50 {
            let id = cache.get_random(CacheKind::CampaignIds, &mut rng).await;
            assert!(placeholders.contains(&id));
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_is_retried_by_later_caller() {
        let client = MockClient::new(0).script(
            "/api/campaigns",
            vec![
                MockReply::TransportError("connection reset".into()),
                MockReply::ok("not json"),
            ],
            MockReply::ok(LISTING),
        );
        let cache = ReferenceCache::with_limits(10, 3);
        let session = Session::new();

        cache.ensure_populated(CacheKind::CampaignSlugs, &client, &session).await;
        assert_eq!(
            cache.state(CacheKind::CampaignSlugs).await,
            CacheState::NotFetched { attempts: 1 }
        );
        cache.ensure_populated(CacheKind::CampaignSlugs, &client, &session).await;
        assert_eq!(
            cache.state(CacheKind::CampaignSlugs).await,
            CacheState::NotFetched { attempts: 2 }
        );
        cache.ensure_populated(CacheKind::CampaignSlugs, &client, &session).await;
        assert_eq!(
            cache.state(CacheKind::CampaignSlugs).await,
            CacheState::Fetched(vec![RefId::Str("save-the-bees".into())])
        );
    }

    #[tokio::test]
    async fn test_kinds_are_independent() {
        let client = MockClient::new(0)
            .route("/api/campaigns", MockReply::ok(LISTING))
            .route("/api/rounds", MockReply::status(503));
        let cache = ReferenceCache::with_limits(10, 1);
        let session = Session::new();

        cache.ensure_populated(CacheKind::RoundIds, &client, &session).await;
        cache.ensure_populated(CacheKind::CampaignIds, &client, &session).await;

        assert_eq!(cache.state(CacheKind::RoundIds).await, CacheState::GivenUp);
        assert!(cache.state(CacheKind::CampaignIds).await.is_settled());
        assert_eq!(
            cache.state(CacheKind::CampaignSlugs).await,
            CacheState::NotFetched { attempts: 0 }
        );
    }

    #[tokio::test]
    async fn test_unfetched_kind_returns_placeholder() {
        let cache = ReferenceCache::with_limits(10, 3);
        let mut rng = StdRng::seed_from_u64(5);
        let slug = cache.get_random(CacheKind::CampaignSlugs, &mut rng).await;
        assert!(CacheKind::CampaignSlugs.placeholders().contains(&slug));
        assert!(cache.pick(CacheKind::CampaignSlugs, &mut rng).await.placeholder);
    }

    #[tokio::test]
    async fn test_pick_flags_fetched_ids() {
        let client = MockClient::new(0).route("/api/campaigns", MockReply::ok(LISTING));
        let cache = ReferenceCache::with_limits(10, 3);
        let mut rng = StdRng::seed_from_u64(8);

        cache.ensure_populated(CacheKind::CampaignIds, &client, &Session::new()).await;
        let pick = cache.pick(CacheKind::CampaignIds, &mut rng).await;
        assert!(!pick.placeholder);
        assert!(pick.id == RefId::Int(7) || pick.id == RefId::Int(9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_callers_fetch_once() {
        let client = Arc::new(MockClient::new(20).route("/api/campaigns", MockReply::ok(LISTING)));
        let cache = Arc::new(ReferenceCache::with_limits(10, 3));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let client = client.clone();
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let session = Session::new();
                cache
                    .ensure_populated(CacheKind::CampaignIdentifiers, client.as_ref(), &session)
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(client.calls("/api/campaigns"), 1);
        assert!(cache.state(CacheKind::CampaignIdentifiers).await.is_settled());
    }
}
