use rand::Rng;
use serde_json::json;

use crate::client::Request;
use crate::reference::CacheKind;
use crate::user::{Task, TaskFuture, UserContext};

pub static DONOR_WEBSITE: &[Task] = &[
    Task {
        name: "load_donor_dashboard",
        weight: 5,
        run: load_donor_dashboard,
    },
    Task {
        name: "load_donor_profile",
        weight: 3,
        run: load_donor_profile,
    },
    Task {
        name: "load_root_page",
        weight: 2,
        run: load_root_page,
    },
    Task {
        name: "load_campaigns_listing",
        weight: 1,
        run: load_campaigns_listing,
    },
    Task {
        name: "load_campaign_detail_page",
        weight: 1,
        run: load_campaign_detail_page,
    },
];

pub static DONOR_API: &[Task] = &[
    Task {
        name: "get_campaign",
        weight: 3,
        run: get_campaign,
    },
    Task {
        name: "list_campaign_payments",
        weight: 2,
        run: list_campaign_payments,
    },
    Task {
        name: "list_user_donations",
        weight: 2,
        run: list_user_donations,
    },
    Task {
        name: "register_pledge",
        weight: 1,
        run: register_pledge,
    },
];

fn load_donor_dashboard(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/dashboard", "/dashboard [Donor Dashboard]").await?;
        Ok(())
    })
}

fn load_donor_profile(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/profile", "/profile [Donor Profile]").await?;
        Ok(())
    })
}

fn load_root_page(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/", "/ [Home Page - Donor]").await?;
        Ok(())
    })
}

fn load_campaigns_listing(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/campaigns", "/campaigns [Listing Page - Donor]")
            .await?;
        Ok(())
    })
}

fn load_campaign_detail_page(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let slug = user.reference(CacheKind::CampaignSlugs).await;
        user.get(
            format!("/campaigns/{slug}"),
            "/campaigns/[slug] [Detail Page - Donor]",
        )
        .await?;
        Ok(())
    })
}

fn get_campaign(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let id = user.reference(CacheKind::CampaignIds).await;
        user.get(format!("/api/campaigns/{id}"), "/api/campaigns/[id] [Donor]")
            .await?;
        Ok(())
    })
}

fn list_campaign_payments(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let id = user.reference(CacheKind::CampaignIds).await;
        user.get(
            format!("/api/campaigns/{id}/payments?page=1&pageSize=10"),
            "/api/campaigns/[id]/payments",
        )
        .await?;
        Ok(())
    })
}

fn list_user_donations(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        user.get("/api/users/donations", "/api/users/donations").await?;
        Ok(())
    })
}

/// Registers a synthetic pledge. The addresses are random, so the server is
/// expected to reject the treasury call; the request still exercises auth and
/// validation.
fn register_pledge(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let treasury_address = random_hex(user.rng(), 20);
        let pledge_id = random_hex(user.rng(), 32);
        let request = Request::post("/api/pledges/register", "/api/pledges/register [POST]").json(json!({
            "treasuryAddress": treasury_address,
            "pledgeId": pledge_id,
            "gatewayFee": 0,
        }));
        user.send(request).await?;
        Ok(())
    })
}

/// `0x`-prefixed lowercase hex of `bytes` random bytes.
fn random_hex<R: Rng + ?Sized>(rng: &mut R, bytes: usize) -> String {
    let mut out = String::with_capacity(2 + bytes * 2);
    out.push_str("0x");
    for _ in 0..bytes {
        out.push_str(&format!("{:02x}", rng.gen::<u8>()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClient;
    use crate::reference::ReferenceCache;
    use crate::user::UserClass;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[test]
    fn test_random_hex_shape() {
        let mut rng = StdRng::seed_from_u64(9);
        let pledge_id = random_hex(&mut rng, 32);
        assert_eq!(pledge_id.len(), 66);
        assert!(pledge_id.starts_with("0x"));
        assert!(pledge_id[2..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn test_register_pledge_posts_json() {
        let client = Arc::new(MockClient::new(0));
        let cache = Arc::new(ReferenceCache::with_limits(10, 3));
        let mut user = UserContext::new(3, UserClass::DonorApi, client.clone(), cache, 1).unwrap();

        (DONOR_API[3].run)(&mut user).await.unwrap();

        let recorded = client.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/api/pledges/register");
        assert_eq!(recorded[0].method, crate::client::Method::Post);
    }
}
