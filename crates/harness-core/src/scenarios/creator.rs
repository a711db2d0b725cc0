use chrono::{Duration, SecondsFormat, Utc};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::client::{FilePart, Request};
use crate::user::{Task, TaskFuture, UserContext};

pub static CREATOR: &[Task] = &[Task {
    name: "create_campaign_draft",
    weight: 1,
    run: create_campaign_draft,
}];

const BANNER_BYTES: &[u8] = b"This is a dummy image file content.";

fn future_date(days: i64) -> String {
    (Utc::now() + Duration::days(days)).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Form fields for a draft campaign that opens and closes in the future.
fn draft_fields<R: Rng + ?Sized>(rng: &mut R, unique_id: i64) -> Vec<(String, String)> {
    let start_offset = rng.gen_range(1..=10i64);
    let duration = rng.gen_range(10..=30i64);
    let location = ["Kenya", "Germany"].choose(rng).copied().unwrap_or("Kenya");

    vec![
        ("title".into(), format!("Load Test Campaign {unique_id}")),
        (
            "description".into(),
            format!("A description for load test campaign {unique_id}. Testing creator flow."),
        ),
        ("fundingGoal".into(), rng.gen_range(1000..=5000u32).to_string()),
        ("startTime".into(), future_date(start_offset)),
        ("endTime".into(), future_date(start_offset + duration)),
        ("status".into(), "draft".into()),
        ("location".into(), location.into()),
        ("category".into(), "education".into()),
    ]
}

fn create_campaign_draft(user: &mut UserContext) -> TaskFuture<'_> {
    Box::pin(async move {
        let unique_id = Utc::now().timestamp_millis();
        let fields = draft_fields(user.rng(), unique_id);
        let banner = FilePart {
            field: "bannerImage".into(),
            file_name: "banner.png".into(),
            mime: "image/png".into(),
            bytes: BANNER_BYTES.to_vec(),
        };
        let request = Request::post("/api/campaigns", "/api/campaigns [POST - Create Campaign]")
            .multipart(fields, vec![banner]);
        user.send(request).await?;
        Ok(())
    })
}
