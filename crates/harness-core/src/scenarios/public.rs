use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::reference::CacheKind;
use crate::user::{Task, TaskFuture, UserContext};

pub static PUBLIC_WEBSITE: &[Task] = &[
    Task {
        name: "load_root_page",
        weight: 5,
        run: load_root_page,
    },
    Task {
        name: "load_campaigns_listing",
        weight: 3,
        run: load_campaigns_listing,
    },
    Task {
        name: "load_campaign_detail_page",
        weight: 2,
        run: load_campaign_detail_page,
    },
    Task {
        name: "browse_campaign_pages",
        weight: 2,
        run: browse_campaign_pages,
    },
    Task {
        name: "load_collections_listing",
        weight: 1,
        run: load_collections_listing,
    },
];

pub static CAMPAIGN_DETAILS_API: &[Task] = &[Task {
    name: "get_campaign_by_identifier",
    weight: 5,
    run: get_campaign_by_identifier,
}];

pub static ROUNDS_API: &[Task] = &[
    Task {
        name: "list_rounds",
        weight: 5,
        run: list_rounds,
    },
    Task {
        name: "list_rounds_paginated",
        weight: 3,
        run: list_rounds_paginated,
    },
    Task {
        name: "list_rounds_by_status",
        weight: 2,
        run: list_rounds_by_status,
    },
    Task {
        name: "get_active_round",
        weight: 1,
        run: get_active_round,
    },
    Task {
        name: "get_upcoming_round",
        weight: 1,
        run: get_upcoming_round,
    },
    Task {
        name: "list_upcoming_rounds",
        weight: 1,
        run: list_upcoming_rounds,
    },
    Task {
        name: "get_round_by_id",
        weight: 2,
        run: get_round_by_id,
    },
];

/// Pages walked by one browse session of the campaign listing API.
const BROWSE_PAGES: u32 = 9;

fn load_root_page(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/", "/ [Home Page]").await?;
        Ok(())
    })
}

fn load_campaigns_listing(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/campaigns", "/campaigns [Listing Page]").await?;
        Ok(())
    })
}

fn load_campaign_detail_page(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let slug = user.reference(CacheKind::CampaignSlugs).await;
        user.get(format!("/campaigns/{slug}"), "/campaigns/[slug] [Detail Page]")
            .await?;
        Ok(())
    })
}

fn browse_campaign_pages(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        // A failed page is already counted by the stats layer; keep browsing.
        for page in 1..=BROWSE_PAGES {
            if let Err(e) = user
                .get(
                    format!("/api/campaigns?page={page}&pageSize=10&status=active"),
                    "/api/campaigns [Paginated Browse]",
                )
                .await
            {
                debug!("Browse page {} failed: {:#}", page, e);
            }
        }
        Ok(())
    })
}

fn load_collections_listing(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/collections", "/collections [Listing Page]").await?;
        Ok(())
    })
}

fn get_campaign_by_identifier(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let pick = user.pick_reference(CacheKind::CampaignIdentifiers).await;
        let name = if pick.placeholder {
            "/api/campaigns/[id_or_slug] [Placeholder]"
        } else {
            "/api/campaigns/[id_or_slug]"
        };
        user.get(format!("/api/campaigns/{}", pick.id), name).await?;
        Ok(())
    })
}

fn list_rounds(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/api/rounds", "/api/rounds [list]").await?;
        Ok(())
    })
}

fn list_rounds_paginated(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let page = user.rng().gen_range(1..=5u32);
        let page_size = [5u32, 10].choose(user.rng()).copied().unwrap_or(10);
        user.get(
            format!("/api/rounds?page={page}&pageSize={page_size}"),
            "/api/rounds [paginated]",
        )
        .await?;
        Ok(())
    })
}

fn list_rounds_by_status(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let status = ["active", "completed"]
            .choose(user.rng())
            .copied()
            .unwrap_or("active");
        user.get(format!("/api/rounds?status={status}"), "/api/rounds [by status]")
            .await?;
        Ok(())
    })
}

fn get_active_round(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/api/rounds/active", "/api/rounds/active").await?;
        Ok(())
    })
}

fn get_upcoming_round(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/api/rounds/upcoming", "/api/rounds/upcoming").await?;
        Ok(())
    })
}

fn list_upcoming_rounds(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/api/rounds?upcomingOnly=true", "/api/rounds [upcoming list]")
            .await?;
        Ok(())
    })
}

fn get_round_by_id(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let pick = user.pick_reference(CacheKind::RoundIds).await;
        let name = if pick.placeholder {
            "/api/rounds/[id] [placeholder]"
        } else {
            "/api/rounds/[id]"
        };
        user.get(format!("/api/rounds/{}", pick.id), name).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClient, MockReply};
    use crate::client::HttpClient;
    use crate::reference::ReferenceCache;
    use crate::stats::RecordingClient;
    use crate::user::UserClass;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_detail_page_uses_placeholder_when_listing_fails() {
        let client = Arc::new(MockClient::new(0).route("/api/campaigns", MockReply::status(500)));
        let cache = Arc::new(ReferenceCache::with_limits(10, 1));
        let mut user = UserContext::new(0, crate::user::UserClass::PublicWebsite, client.clone(), cache, 1).unwrap();

        (PUBLIC_WEBSITE[2].run)(&mut user).await.unwrap();

        let detail = client
            .recorded()
            .into_iter()
            .find(|r| r.path.starts_with("/campaigns/"))
            .unwrap();
        assert!(
            detail.path == "/campaigns/placeholder-slug-1"
                || detail.path == "/campaigns/placeholder-slug-2"
        );
    }

    #[tokio::test]
    async fn test_browse_walks_all_pages() {
        let client = Arc::new(MockClient::new(0));
        let cache = Arc::new(ReferenceCache::with_limits(10, 3));
        let mut user = UserContext::new(0, crate::user::UserClass::PublicWebsite, client.clone(), cache, 1).unwrap();

        (PUBLIC_WEBSITE[3].run)(&mut user).await.unwrap();
        assert_eq!(client.calls("/api/campaigns?page="), BROWSE_PAGES as usize);
    }

    #[tokio::test]
    async fn test_browse_continues_after_failed_page() {
        let client = Arc::new(
            MockClient::new(0)
                .route("/api/campaigns?page=2&", MockReply::TransportError("reset".into()))
                .route("/api/campaigns?page=5&", MockReply::status(502)),
        );
        let cache = Arc::new(ReferenceCache::with_limits(10, 3));
        let mut user = UserContext::new(0, UserClass::PublicWebsite, client.clone(), cache, 1).unwrap();

        (PUBLIC_WEBSITE[3].run)(&mut user).await.unwrap();
        assert_eq!(client.calls("/api/campaigns?page="), BROWSE_PAGES as usize);
        assert_eq!(client.calls("/api/campaigns?page=9&"), 1);
    }

    #[tokio::test]
    async fn test_placeholder_lookups_use_their_own_labels() {
        let client = Arc::new(
            MockClient::new(0)
                .route("/api/campaigns", MockReply::status(500))
                .route("/api/rounds", MockReply::status(500)),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let recording: Arc<dyn HttpClient> = Arc::new(RecordingClient::new(client.clone(), tx));
        let cache = Arc::new(ReferenceCache::with_limits(10, 1));

        let mut details = UserContext::new(0, UserClass::CampaignDetailsApi, recording.clone(), cache.clone(), 1).unwrap();
        (CAMPAIGN_DETAILS_API[0].run)(&mut details).await.unwrap();
        let mut rounds = UserContext::new(1, UserClass::RoundsApi, recording, cache, 1).unwrap();
        (ROUNDS_API[6].run)(&mut rounds).await.unwrap();

        let mut names = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            names.push(sample.name);
        }
        assert!(names.contains(&"/api/campaigns/[id_or_slug] [Placeholder]".to_string()));
        assert!(names.contains(&"/api/rounds/[id] [placeholder]".to_string()));
        assert!(client.recorded().iter().any(|r| r.path == "/api/campaigns/1"));
        assert!(client.recorded().iter().any(|r| r.path == "/api/rounds/1"));
    }

    #[tokio::test]
    async fn test_fetched_lookups_use_endpoint_labels() {
        let client = Arc::new(
            MockClient::new(0)
                .route("/api/campaigns?", MockReply::ok(r#"{"campaigns":[{"id":4,"slug":"bees"}]}"#))
                .route("/api/rounds?page=1", MockReply::ok(r#"{"data":[{"id":12}]}"#)),
        );
        let (tx, mut rx) = mpsc::channel(64);
        let recording: Arc<dyn HttpClient> = Arc::new(RecordingClient::new(client.clone(), tx));
        let cache = Arc::new(ReferenceCache::with_limits(10, 3));

        let mut rounds = UserContext::new(0, UserClass::RoundsApi, recording, cache, 1).unwrap();
        (ROUNDS_API[6].run)(&mut rounds).await.unwrap();

        let mut names = Vec::new();
        while let Ok(sample) = rx.try_recv() {
            names.push(sample.name);
        }
        assert!(names.contains(&"/api/rounds/[id]".to_string()));
        assert!(client.recorded().iter().any(|r| r.path == "/api/rounds/12"));
    }
}
