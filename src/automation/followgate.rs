//! Follow-gate state machine.
//!
//! waiting_follow -> completed when the follow arrives before expiry;
//! expired requests are simply never selected (no sweep job). The
//! one-waiting-row-per-(creator, recipient, rule) invariant is enforced by
//! a unique index plus `on_conflict_do_nothing`, so the prompt goes out at
//! most once even when the platform redelivers the triggering event.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::shared::models::{
    pending_follow_requests, PendingFollowRequest, RequestStatus,
};

pub const DEFAULT_EXPIRY_HOURS: i32 = 24;

pub fn build_request(
    creator_id: Uuid,
    recipient_id: &str,
    recipient_username: Option<&str>,
    rule_id: Uuid,
    trigger_type: &str,
    content: &str,
    expiry_hours: i32,
) -> PendingFollowRequest {
    let now = Utc::now();
    let hours = if expiry_hours > 0 {
        expiry_hours
    } else {
        DEFAULT_EXPIRY_HOURS
    };
    PendingFollowRequest {
        id: Uuid::new_v4(),
        creator_id,
        recipient_id: recipient_id.to_string(),
        recipient_username: recipient_username.map(str::to_string),
        rule_id,
        trigger_type: trigger_type.to_string(),
        content: content.to_string(),
        status: RequestStatus::WaitingFollow.to_string(),
        expires_at: now + Duration::hours(hours as i64),
        created_at: now,
    }
}

pub fn has_waiting_request(
    conn: &mut PgConnection,
    creator_id: Uuid,
    recipient_id: &str,
    rule_id: Uuid,
) -> QueryResult<bool> {
    let count: i64 = pending_follow_requests::table
        .filter(pending_follow_requests::creator_id.eq(creator_id))
        .filter(pending_follow_requests::recipient_id.eq(recipient_id))
        .filter(pending_follow_requests::rule_id.eq(rule_id))
        .filter(pending_follow_requests::status.eq(RequestStatus::WaitingFollow.to_string()))
        .filter(pending_follow_requests::expires_at.gt(Utc::now()))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Returns true when this call created the waiting row, false when one
/// already existed (concurrent or earlier fire won).
pub fn create_request(
    conn: &mut PgConnection,
    request: &PendingFollowRequest,
) -> QueryResult<bool> {
    let inserted = diesel::insert_into(pending_follow_requests::table)
        .values(request)
        .on_conflict_do_nothing()
        .execute(conn)?;
    Ok(inserted > 0)
}

/// All deliverable requests for a recipient: still waiting and not past
/// expiry. Expired rows are excluded here instead of being transitioned.
pub fn live_requests(
    conn: &mut PgConnection,
    creator_id: Uuid,
    recipient_id: &str,
    now: DateTime<Utc>,
) -> QueryResult<Vec<PendingFollowRequest>> {
    pending_follow_requests::table
        .filter(pending_follow_requests::creator_id.eq(creator_id))
        .filter(pending_follow_requests::recipient_id.eq(recipient_id))
        .filter(pending_follow_requests::status.eq(RequestStatus::WaitingFollow.to_string()))
        .filter(pending_follow_requests::expires_at.gt(now))
        .order(pending_follow_requests::created_at.asc())
        .load(conn)
}

pub fn mark_completed(conn: &mut PgConnection, request_id: Uuid) -> QueryResult<usize> {
    diesel::update(
        pending_follow_requests::table.filter(pending_follow_requests::id.eq(request_id)),
    )
    .set(pending_follow_requests::status.eq(RequestStatus::Completed.to_string()))
    .execute(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_request_waits_and_expires_in_the_future() {
        let request = build_request(
            Uuid::new_v4(),
            "9001",
            Some("fan_account"),
            Uuid::new_v4(),
            "reel_comment",
            "here is your link",
            24,
        );
        assert_eq!(request.status, "waiting_follow");
        assert!(request.expires_at > Utc::now());
        assert!(request.expires_at <= Utc::now() + Duration::hours(24));
    }

    #[test]
    fn non_positive_expiry_falls_back_to_default() {
        let request = build_request(
            Uuid::new_v4(),
            "9001",
            None,
            Uuid::new_v4(),
            "comment",
            "content",
            0,
        );
        let expected = Utc::now() + Duration::hours(DEFAULT_EXPIRY_HOURS as i64);
        assert!(request.expires_at > expected - Duration::minutes(1));
        assert!(request.expires_at <= expected);
    }
}
