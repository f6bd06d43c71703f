use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use pollbot::channel::ChannelError;
use pollbot::channel::mock::MockChannel;
use pollbot::engine::poll::{AUTHOR_LIMIT_NOTICE, COMMUNITY_LIMIT_NOTICE, DUPLICATE_NOTICE};
use pollbot::engine::{
    CreationOutcome, Engine, EngineConfig, IgnoreReason, MessageIgnore, PollEngine, Rejection,
    VoteOutcome,
};
use pollbot::events::Event;
use pollbot::feed::{DirectMessage, InboundEvent, LocationKind, LocationRef, MessageKind};
use pollbot::guard::{Denial, ManualClock};
use pollbot::store::PollStore;
use pollbot::vote::VoteRejection;

struct Harness {
    engine: PollEngine,
    channel: Arc<MockChannel>,
    clock: Arc<ManualClock>,
    store: Arc<PollStore>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(PollStore::in_memory().unwrap());
    let channel = Arc::new(MockChannel::new());
    let clock = Arc::new(ManualClock::new(start()));
    let engine = PollEngine::new(config, store.clone(), channel.clone(), clock.clone());
    Harness {
        engine,
        channel,
        clock,
        store,
    }
}

fn harness() -> Harness {
    harness_with(EngineConfig::default())
}

/// A comment by `author` in `community` asking for a poll on post `target`.
fn request(id: &str, author: &str, community: &str, target: &str) -> InboundEvent {
    event(
        id,
        author,
        community,
        &format!(
            "hey bot http://www.reddit.com/r/{community}/comments/{target}/some_title/ Cats or dogs?\n- Cats\n- Dogs\n"
        ),
    )
}

fn event(id: &str, author: &str, community: &str, text: &str) -> InboundEvent {
    InboundEvent {
        id: id.to_string(),
        author_id: author.to_string(),
        created_at: start(),
        raw_text: text.to_string(),
        location: LocationRef {
            id: format!("t1_{id}"),
            community_id: community.to_string(),
            permalink: format!("/r/{community}/comments/x/{id}"),
            kind: LocationKind::Reply,
        },
    }
}

fn vote(id: &str, voter: &str, poll_id: i64, letter: &str) -> DirectMessage {
    DirectMessage {
        id: id.to_string(),
        kind: MessageKind::Private,
        author_id: Some(voter.to_string()),
        subject: format!("Poll {poll_id}"),
        body: format!("vote {letter}"),
    }
}

async fn create(
    h: &Harness,
    id: &str,
    author: &str,
    community: &str,
    target: &str,
) -> CreationOutcome {
    h.channel.add_post(&format!("t3_{target}"), community);
    h.engine.handle_post(&request(id, author, community, target)).await
}

#[tokio::test]
async fn cats_or_dogs_end_to_end() {
    let h = harness();
    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert_eq!(
        outcome,
        CreationOutcome::Created {
            poll_id: 1,
            location_id: "t1_mock1".to_string()
        }
    );

    let posted = h.channel.replies_to("t3_abc");
    assert_eq!(posted.len(), 1);
    assert!(
        posted[0]
            .text
            .starts_with("Poll question: **Cats or dogs?**  \n\nTotal votes: 0  \n\n")
    );
    assert!(posted[0].text.contains("- A. Cats "));
    assert!(posted[0].text.contains("- B. Dogs "));

    let poll = h.store.lock().get_poll(1).unwrap().unwrap();
    assert_eq!(poll.request_location_id, "t3_abc");
    assert_eq!(poll.rendered_location_id.as_deref(), Some("t1_mock1"));
    assert_eq!(h.store.lock().get_options(1).unwrap().len(), 2);

    h.channel.push_message(vote("m1", "userA", 1, "a"));
    h.channel.push_message(vote("m2", "userB", 1, "b"));
    h.channel.push_message(vote("m3", "userA", 1, "b"));

    let pass = h.engine.run_vote_pass().await;
    assert_eq!(pass.recorded(), 2);
    assert_eq!(
        pass.outcomes[2],
        (
            "m3".to_string(),
            VoteOutcome::Rejected {
                poll_id: 1,
                reason: VoteRejection::Duplicate
            }
        )
    );
    assert_eq!(pass.edited, vec![1]);
    assert_eq!(h.channel.processed(), vec!["m1", "m2", "m3"]);
    assert_eq!(h.channel.unread_count(), 0);

    let tally = h.store.lock().get_votes(1).unwrap();
    assert_eq!(tally.get(&0), Some(&1));
    assert_eq!(tally.get(&1), Some(&1));

    let edits = h.channel.edits();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].location_id, "t1_mock1");
    let half = format!("{}{}", "█".repeat(10), "░".repeat(10));
    assert!(edits[0].text.contains("Total votes: 2  \n"));
    assert!(edits[0].text.contains(&format!("    A. {half}   50.00%     1 votes  \n")));
    assert!(edits[0].text.contains(&format!("    B. {half}   50.00%     1 votes  \n")));
}

#[tokio::test]
async fn many_votes_in_one_pass_edit_once() {
    let h = harness();
    create(&h, "req1", "alice", "pets", "abc").await;
    create(&h, "req2", "bob", "pets", "def").await;

    for i in 0..5 {
        h.channel.push_message(vote(&format!("a{i}"), &format!("voter{i}"), 1, "a"));
        h.channel.push_message(vote(&format!("b{i}"), &format!("voter{i}"), 2, "b"));
    }

    let pass = h.engine.run_vote_pass().await;
    assert_eq!(pass.recorded(), 10);
    assert_eq!(pass.edited, vec![1, 2]);
    assert_eq!(h.channel.edit_calls(), 2);
}

#[tokio::test]
async fn concurrent_requests_for_one_target_create_one_poll() {
    let h = harness();
    h.channel.add_post("t3_abc", "pets");
    let first = request("req1", "alice", "pets", "abc");
    let second = request("req2", "bob", "pets", "abc");

    let outcomes =
        futures::future::join_all([h.engine.handle_post(&first), h.engine.handle_post(&second)])
            .await;

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, CreationOutcome::Created { .. }))
        .count();
    assert_eq!(created, 1);
    assert!(outcomes.contains(&CreationOutcome::Rejected(Rejection::DuplicateRequest)));
    assert_eq!(h.channel.replies_to("t3_abc").len(), 1);

    let notices: Vec<_> = h
        .channel
        .replies()
        .into_iter()
        .filter(|r| r.text == DUPLICATE_NOTICE)
        .collect();
    assert_eq!(notices.len(), 1);
    assert!(h.store.lock().get_poll(2).unwrap().is_none());
}

#[tokio::test]
async fn redelivered_request_is_ignored() {
    let h = harness();
    h.channel.add_post("t3_abc", "pets");
    let event = request("req1", "alice", "pets", "abc");

    assert!(matches!(
        h.engine.handle_post(&event).await,
        CreationOutcome::Created { .. }
    ));
    assert_eq!(
        h.engine.handle_post(&event).await,
        CreationOutcome::Ignored(IgnoreReason::AlreadyReplied)
    );
    assert_eq!(h.channel.replies().len(), 1);
}

#[tokio::test]
async fn seventh_creation_by_one_author_is_refused_until_window_resets() {
    let h = harness();
    for i in 0..6 {
        let (id, community, target) = (format!("req{i}"), format!("c{i}"), format!("p{i}"));
        let outcome = create(&h, &id, "alice", &community, &target).await;
        assert!(matches!(outcome, CreationOutcome::Created { .. }), "creation {i}: {outcome:?}");
    }

    let outcome = create(&h, "req6", "alice", "c6", "p6").await;
    assert_eq!(outcome, CreationOutcome::Rejected(Rejection::Limited(Denial::AuthorLimit)));
    let notice = h.channel.replies_to("t1_req6");
    assert_eq!(notice.len(), 1);
    assert_eq!(notice[0].text, AUTHOR_LIMIT_NOTICE);

    h.clock.advance(chrono::Duration::hours(24) + chrono::Duration::seconds(1));
    let outcome = create(&h, "req7", "alice", "c7", "p7").await;
    assert!(matches!(outcome, CreationOutcome::Created { .. }));
}

#[tokio::test]
async fn community_limit_applies_across_authors() {
    let h = harness();
    for i in 0..6 {
        let (id, author, target) = (format!("req{i}"), format!("user{i}"), format!("p{i}"));
        let outcome = create(&h, &id, &author, "pets", &target).await;
        assert!(matches!(outcome, CreationOutcome::Created { .. }));
    }

    let outcome = create(&h, "req6", "user6", "pets", "p6").await;
    assert_eq!(outcome, CreationOutcome::Rejected(Rejection::Limited(Denial::CommunityLimit)));
    assert_eq!(h.channel.replies_to("t1_req6")[0].text, COMMUNITY_LIMIT_NOTICE);
}

#[tokio::test]
async fn exempt_community_has_no_limit() {
    let mut config = EngineConfig::default();
    config.exempt_communities.insert("pets".to_string());
    let h = harness_with(config);

    for i in 0..10 {
        let (id, author, target) = (format!("req{i}"), format!("user{i}"), format!("p{i}"));
        let outcome = create(&h, &id, &author, "pets", &target).await;
        assert!(matches!(outcome, CreationOutcome::Created { .. }));
    }
}

#[tokio::test]
async fn events_that_are_not_requests_are_ignored() {
    let config = EngineConfig {
        reply_after: Some(start() + chrono::Duration::minutes(1)),
        ..EngineConfig::default()
    };
    let h = harness_with(config);
    h.channel.add_post("t3_abc", "pets");

    let own = request("req1", "pollingbot", "pets", "abc");
    assert_eq!(
        h.engine.handle_post(&own).await,
        CreationOutcome::Ignored(IgnoreReason::OwnPost)
    );

    let empty = event("req2", "alice", "pets", "  \n ");
    assert_eq!(
        h.engine.handle_post(&empty).await,
        CreationOutcome::Ignored(IgnoreReason::EmptyText)
    );

    let old = request("req3", "alice", "pets", "abc");
    assert_eq!(
        h.engine.handle_post(&old).await,
        CreationOutcome::Ignored(IgnoreReason::TooOld)
    );

    let mut chatter = event("req4", "alice", "pets", "just chatting, no poll here");
    chatter.created_at = start() + chrono::Duration::hours(1);
    assert_eq!(
        h.engine.handle_post(&chatter).await,
        CreationOutcome::Ignored(IgnoreReason::NoRequest)
    );

    assert!(h.channel.replies().is_empty());
    assert!(!h.store.lock().has_replied("t1_req3").unwrap());
}

#[tokio::test]
async fn unknown_target_fails_without_side_effects() {
    let h = harness();
    let outcome = h
        .engine
        .handle_post(&request("req1", "alice", "pets", "nowhere"))
        .await;
    assert!(matches!(outcome, CreationOutcome::Failed(_)));
    assert!(h.channel.replies().is_empty());
    assert!(h.store.lock().get_poll(1).unwrap().is_none());
}

#[tokio::test]
async fn rate_limited_post_is_retried() {
    let h = harness();
    for _ in 0..2 {
        h.channel.queue_create_error(ChannelError::RateLimited {
            retry_after: Duration::ZERO,
        });
    }

    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert!(matches!(outcome, CreationOutcome::Created { .. }));
    assert_eq!(h.channel.create_calls(), 3);
}

#[tokio::test]
async fn retries_stop_at_the_limit() {
    let h = harness();
    for _ in 0..5 {
        h.channel.queue_create_error(ChannelError::RateLimited {
            retry_after: Duration::ZERO,
        });
    }

    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert!(matches!(outcome, CreationOutcome::Failed(_)));
    assert_eq!(h.channel.create_calls(), 5);
    assert!(h.store.lock().get_poll(1).unwrap().is_none());
    assert!(!h.store.lock().has_poll_for_request("t3_abc").unwrap());
}

#[tokio::test]
async fn redelivery_after_failed_post_creates_the_poll() {
    let h = harness();
    h.channel.queue_create_error(ChannelError::Failed("server error".to_string()));

    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert!(matches!(outcome, CreationOutcome::Failed(_)));
    assert!(h.store.lock().get_poll(1).unwrap().is_none());

    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert_eq!(
        outcome,
        CreationOutcome::Created {
            poll_id: 1,
            location_id: "t1_mock1".to_string()
        }
    );
    assert!(h.channel.replies().iter().all(|r| r.text != DUPLICATE_NOTICE));
    assert_eq!(h.store.lock().get_options(1).unwrap().len(), 2);
}

#[tokio::test]
async fn same_event_delivered_twice_at_once_creates_one_poll() {
    let h = harness();
    h.channel.add_post("t3_abc", "pets");
    h.channel.queue_create_error(ChannelError::RateLimited {
        retry_after: Duration::from_millis(5),
    });
    let event = request("req1", "alice", "pets", "abc");

    let outcomes =
        futures::future::join_all([h.engine.handle_post(&event), h.engine.handle_post(&event)])
            .await;

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, CreationOutcome::Created { .. }))
        .count();
    assert_eq!(created, 1);
    assert!(outcomes.contains(&CreationOutcome::Ignored(IgnoreReason::AlreadyReplied)));
    assert_eq!(h.channel.replies_to("t3_abc").len(), 1);
    assert!(h.channel.replies().iter().all(|r| r.text != DUPLICATE_NOTICE));
    assert!(h.store.lock().get_poll(2).unwrap().is_none());
}

#[tokio::test]
async fn denied_post_bans_community() {
    let h = harness();
    let mut events = h.engine.subscribe();
    h.channel
        .queue_create_error(ChannelError::Denied("banned from r/pets".to_string()));

    let outcome = create(&h, "req1", "alice", "pets", "abc").await;
    assert!(matches!(outcome, CreationOutcome::Failed(_)));
    assert_eq!(h.channel.create_calls(), 1);
    assert!(h.store.lock().is_banned("pets").unwrap());
    assert_eq!(
        events.recv().await.unwrap(),
        Event::CommunityBanned {
            community: "pets".to_string()
        }
    );

    let outcome = create(&h, "req2", "bob", "pets", "def").await;
    assert_eq!(outcome, CreationOutcome::Rejected(Rejection::Banned));
    assert_eq!(h.channel.create_calls(), 1);
}

#[tokio::test]
async fn denied_edit_bans_community_and_stops_edits() {
    let h = harness();
    create(&h, "req1", "alice", "pets", "abc").await;
    h.channel
        .queue_edit_error(ChannelError::Denied("banned".to_string()));

    h.channel.push_message(vote("m1", "userA", 1, "a"));
    let pass = h.engine.run_vote_pass().await;
    assert_eq!(pass.recorded(), 1);
    assert_eq!(pass.skipped, vec![1]);
    assert!(h.store.lock().is_banned("pets").unwrap());

    h.channel.push_message(vote("m2", "userB", 1, "b"));
    let pass = h.engine.run_vote_pass().await;
    assert_eq!(pass.recorded(), 1);
    assert_eq!(pass.skipped, vec![1]);
    assert_eq!(h.channel.edit_calls(), 1);
}

#[tokio::test]
async fn malformed_messages_are_marked_processed() {
    let h = harness();
    create(&h, "req1", "alice", "pets", "abc").await;

    let mut reply = vote("m1", "userA", 1, "a");
    reply.kind = MessageKind::Other;
    let mut orphan = vote("m2", "userA", 1, "a");
    orphan.author_id = None;
    let mut subject = vote("m3", "userA", 1, "a");
    subject.subject = "Poll one".to_string();
    let mut body = vote("m4", "userA", 1, "a");
    body.body = "a".to_string();
    for message in [reply, orphan, subject, body] {
        h.channel.push_message(message);
    }

    let pass = h.engine.run_vote_pass().await;
    let reasons: Vec<_> = pass.outcomes.iter().map(|(_, o)| o.clone()).collect();
    assert_eq!(
        reasons,
        vec![
            VoteOutcome::Ignored(MessageIgnore::NotPrivate),
            VoteOutcome::Ignored(MessageIgnore::NoAuthor),
            VoteOutcome::Ignored(MessageIgnore::BadSubject),
            VoteOutcome::Ignored(MessageIgnore::BadBody),
        ]
    );
    assert_eq!(h.channel.processed().len(), 4);
    assert!(pass.edited.is_empty());
    assert_eq!(h.channel.edit_calls(), 0);
}

#[tokio::test]
async fn votes_for_unknown_polls_and_bad_letters_are_rejected() {
    let h = harness();
    create(&h, "req1", "alice", "pets", "abc").await;

    h.channel.push_message(vote("m1", "userA", 9, "a"));
    h.channel.push_message(vote("m2", "userA", 1, "A"));
    let pass = h.engine.run_vote_pass().await;

    assert_eq!(
        pass.outcomes[0].1,
        VoteOutcome::Rejected {
            poll_id: 9,
            reason: VoteRejection::UnknownPoll
        }
    );
    assert_eq!(
        pass.outcomes[1].1,
        VoteOutcome::Rejected {
            poll_id: 1,
            reason: VoteRejection::InvalidLetter
        }
    );
    assert_eq!(h.channel.edit_calls(), 0);
}

#[tokio::test]
async fn vote_past_last_option_is_kept_but_not_shown() {
    let h = harness();
    create(&h, "req1", "alice", "pets", "abc").await;

    h.channel.push_message(vote("m1", "userA", 1, "z"));
    let pass = h.engine.run_vote_pass().await;

    assert_eq!(
        pass.outcomes[0].1,
        VoteOutcome::Recorded {
            poll_id: 1,
            option: 25
        }
    );
    assert_eq!(h.store.lock().get_votes(1).unwrap().get(&25), Some(&1));
    assert!(h.channel.edits()[0].text.contains("Total votes: 0  \n"));
}

#[tokio::test]
async fn signature_is_appended_to_posts_and_edits() {
    let config = EngineConfig {
        signature: Some("I am a bot".to_string()),
        ..EngineConfig::default()
    };
    let h = harness_with(config);
    create(&h, "req1", "alice", "pets", "abc").await;
    h.channel.push_message(vote("m1", "userA", 1, "a"));
    h.engine.run_vote_pass().await;

    assert!(h.channel.replies()[0].text.ends_with("\n\n----\nI am a bot"));
    assert!(h.channel.edits()[0].text.ends_with("\n\n----\nI am a bot"));
}

#[tokio::test]
async fn lifecycle_events_are_broadcast() {
    let h = harness();
    let mut events = h.engine.subscribe();

    create(&h, "req1", "alice", "pets", "abc").await;
    h.channel.push_message(vote("m1", "userA", 1, "b"));
    h.engine.run_vote_pass().await;

    assert_eq!(
        events.recv().await.unwrap(),
        Event::PollCreated {
            poll_id: 1,
            location_id: "t1_mock1".to_string()
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        Event::VoteRecorded {
            poll_id: 1,
            voter: "userA".to_string(),
            option: 1
        }
    );
    assert_eq!(events.recv().await.unwrap(), Event::PollEdited { poll_id: 1 });
}
