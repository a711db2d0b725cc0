use anyhow::{Context, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{HttpClient, Request, Response, Session};
use crate::credentials::{bootstrap_session, CredentialBundle, CredentialPool};
use crate::reference::{CacheKind, RefId, RefPick, ReferenceCache};
use crate::scenarios;

/// The simulated populations a worker can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserClass {
    /// Anonymous visitor browsing public pages.
    PublicWebsite,
    /// Anonymous client reading campaign details through the API.
    CampaignDetailsApi,
    /// Anonymous client reading funding rounds through the API.
    RoundsApi,
    /// Signed-in donor browsing dashboard and profile pages.
    DonorWebsite,
    /// Signed-in donor calling payment and donation APIs.
    DonorApi,
    /// Signed-in creator submitting new campaign drafts.
    Creator,
}

impl UserClass {
    pub const ALL: [UserClass; 6] = [
        UserClass::PublicWebsite,
        UserClass::CampaignDetailsApi,
        UserClass::RoundsApi,
        UserClass::DonorWebsite,
        UserClass::DonorApi,
        UserClass::Creator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UserClass::PublicWebsite => "public_website",
            UserClass::CampaignDetailsApi => "campaign_details_api",
            UserClass::RoundsApi => "rounds_api",
            UserClass::DonorWebsite => "donor_website",
            UserClass::DonorApi => "donor_api",
            UserClass::Creator => "creator",
        }
    }

    pub fn tags(self) -> &'static [&'static str] {
        match self {
            UserClass::PublicWebsite | UserClass::CampaignDetailsApi | UserClass::RoundsApi => {
                &["read-only"]
            }
            UserClass::DonorWebsite => &["donor", "authenticated"],
            UserClass::DonorApi => &["donor"],
            UserClass::Creator => &["creator"],
        }
    }

    pub fn has_any_tag(self, wanted: &[String]) -> bool {
        self.tags().iter().any(|t| wanted.iter().any(|w| w == t))
    }

    /// Bounds of the random pause between two tasks.
    pub fn wait_range(self) -> (Duration, Duration) {
        let (min_ms, max_ms) = match self {
            UserClass::PublicWebsite => (2_000, 5_000),
            UserClass::CampaignDetailsApi => (1_000, 2_500),
            UserClass::RoundsApi => (1_000, 3_000),
            UserClass::DonorWebsite => (1_000, 3_000),
            UserClass::DonorApi => (2_000, 6_000),
            UserClass::Creator => (5_000, 15_000),
        };
        (Duration::from_millis(min_ms), Duration::from_millis(max_ms))
    }

    pub fn is_authenticated(self) -> bool {
        matches!(
            self,
            UserClass::DonorWebsite | UserClass::DonorApi | UserClass::Creator
        )
    }

    /// Reference data fetched during the start hook.
    pub fn warm_kinds(self) -> &'static [CacheKind] {
        match self {
            UserClass::PublicWebsite | UserClass::DonorWebsite => &[CacheKind::CampaignSlugs],
            UserClass::CampaignDetailsApi => &[CacheKind::CampaignIdentifiers],
            UserClass::RoundsApi => &[CacheKind::RoundIds],
            UserClass::DonorApi => &[CacheKind::CampaignIds],
            UserClass::Creator => &[],
        }
    }

    pub fn tasks(self) -> &'static [Task] {
        match self {
            UserClass::PublicWebsite => scenarios::public::PUBLIC_WEBSITE,
            UserClass::CampaignDetailsApi => scenarios::public::CAMPAIGN_DETAILS_API,
            UserClass::RoundsApi => scenarios::public::ROUNDS_API,
            UserClass::DonorWebsite => scenarios::donor::DONOR_WEBSITE,
            UserClass::DonorApi => scenarios::donor::DONOR_API,
            UserClass::Creator => scenarios::creator::CREATOR,
        }
    }
}

impl fmt::Display for UserClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TaskFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A weighted unit of simulated work.
pub struct Task {
    pub name: &'static str,
    pub weight: u32,
    pub run: for<'a> fn(&'a mut UserContext) -> TaskFuture<'a>,
}

/// State owned by one simulated user for its whole lifetime.
pub struct UserContext {
    id: usize,
    class: UserClass,
    client: Arc<dyn HttpClient>,
    cache: Arc<ReferenceCache>,
    session: Session,
    credential: Option<CredentialBundle>,
    rng: StdRng,
    task_picker: WeightedIndex<u32>,
}

impl UserContext {
    pub fn new(
        id: usize,
        class: UserClass,
        client: Arc<dyn HttpClient>,
        cache: Arc<ReferenceCache>,
        seed: u64,
    ) -> Result<Self> {
        let task_picker = WeightedIndex::new(class.tasks().iter().map(|t| t.weight))
            .with_context(|| format!("Invalid task weights for {class}"))?;

        Ok(Self {
            id,
            class,
            client,
            cache,
            session: Session::new(),
            credential: None,
            rng: StdRng::seed_from_u64(seed.wrapping_add(id as u64)),
            task_picker,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn class(&self) -> UserClass {
        self.class
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn credential(&self) -> Option<&CredentialBundle> {
        self.credential.as_ref()
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Start hook: bind a credential for authenticated classes, then warm the
    /// class's reference data. Never fails; problems only degrade later requests.
    pub async fn on_start(&mut self, pool: &CredentialPool) {
        if self.class.is_authenticated() {
            self.credential = bootstrap_session(pool, &mut self.session, &mut self.rng);
        }
        for kind in self.class.warm_kinds() {
            self.cache
                .ensure_populated(*kind, self.client.as_ref(), &self.session)
                .await;
        }
    }

    pub fn next_task(&mut self) -> &'static Task {
        let tasks = self.class.tasks();
        &tasks[self.task_picker.sample(&mut self.rng)]
    }

    pub async fn run_task(&mut self, task: &'static Task) -> Result<()> {
        (task.run)(self).await
    }

    pub fn wait_time(&mut self) -> Duration {
        let (min, max) = self.class.wait_range();
        self.rng.gen_range(min..=max)
    }

    pub async fn send(&mut self, request: Request) -> Result<Response> {
        self.client.send(&self.session, &request).await
    }

    pub async fn get(&mut self, path: impl Into<String>, name: &str) -> Result<Response> {
        self.send(Request::get(path, name)).await
    }

    /// A target identifier of `kind`, retrying the fetch first if it is still unsettled.
    pub async fn reference(&mut self, kind: CacheKind) -> RefId {
        self.pick_reference(kind).await.id
    }

    /// Like [`reference`](Self::reference), but also reports whether the id is a placeholder.
    pub async fn pick_reference(&mut self, kind: CacheKind) -> RefPick {
        self.cache
            .ensure_populated(kind, self.client.as_ref(), &self.session)
            .await;
        self.cache.pick(kind, &mut self.rng).await
    }
}
