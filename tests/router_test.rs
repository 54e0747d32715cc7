mod common;

use common::{harness, user};
use guild_chat_core::error::AppError;
use guild_chat_core::models::{ConversationId, ConversationKind, NewMessage, Tier};
use guild_chat_core::services::router::{classify, classify_str};
use guild_chat_core::services::store::{MessageStore, Page, RemoteLedger};
use uuid::Uuid;

#[test]
fn classification_is_pure_and_stable() {
    let job = ConversationId::mint(ConversationKind::Job);
    let personal = ConversationId::mint(ConversationKind::Personal);

    for _ in 0..3 {
        assert_eq!(classify(&job), Tier::Regulated);
        assert_eq!(classify(&personal), Tier::Personal);
    }
    assert_eq!(
        classify(&ConversationId::mint(ConversationKind::Admin)),
        Tier::Regulated
    );
    assert_eq!(
        classify(&ConversationId::mint(ConversationKind::System)),
        Tier::Regulated
    );
}

#[test]
fn malformed_ids_fail_validation() {
    for raw in ["", "job", "job:", "job:not-a-uuid", "gig:00000000-0000-0000-0000-000000000000"] {
        assert!(
            matches!(classify_str(raw), Err(AppError::Validation(_))),
            "{raw:?} should be rejected"
        );
    }
    let ok = format!("personal:{}", Uuid::new_v4());
    assert_eq!(classify_str(&ok).unwrap(), Tier::Personal);
}

#[tokio::test]
async fn job_messages_land_in_the_remote_ledger_only() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let sender = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(conversation, sender, "quote attached"))
        .await
        .unwrap();

    let remote = h.ledger.read(conversation, Page::default()).await.unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].id, message.id);

    // The device ledger must not hold regulated traffic.
    let local = h.state.local.read(conversation, Page::default()).await.unwrap();
    assert!(local.is_empty());
}

#[tokio::test]
async fn personal_messages_stay_on_device_pending_backup() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Personal);
    let sender = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(conversation, sender, "see you at 8"))
        .await
        .unwrap();

    let local = h.state.local.read(conversation, Page::default()).await.unwrap();
    assert_eq!(local.len(), 1);
    assert_eq!(
        local[0].sync_status,
        guild_chat_core::models::SyncStatus::Pending
    );

    // Nothing in the remote ledger until the backup loop runs.
    assert!(h.ledger.backed_up(message.id).await.is_none());
    let remote = h.ledger.read(conversation, Page::default()).await.unwrap();
    assert!(remote.is_empty());
}

#[tokio::test]
async fn cloud_adapter_refuses_personal_traffic() {
    let h = harness().await;
    let personal = ConversationId::mint(ConversationKind::Personal);

    let err = h
        .state
        .cloud
        .append(NewMessage::text(personal, user(), "misrouted"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::TierMismatch {
            expected: Tier::Regulated,
            actual: Tier::Personal,
            ..
        }
    ));
}

#[tokio::test]
async fn empty_body_is_rejected_unless_it_carries_attachments() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Personal);

    let err = h
        .state
        .router
        .append(NewMessage::text(conversation, user(), "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn only_participants_may_append_to_an_existing_conversation() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let alice = user();
    let bob = user();
    let outsider = user();

    h.state
        .router
        .append(NewMessage::text(conversation, alice, "hi").with_recipients(vec![bob]))
        .await
        .unwrap();

    let err = h
        .state
        .router
        .append(NewMessage::text(conversation, outsider, "let me in"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));
}

#[tokio::test]
async fn edits_are_sender_only() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let alice = user();
    let bob = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(conversation, alice, "1000").with_recipients(vec![bob]))
        .await
        .unwrap();

    let err = h
        .state
        .router
        .edit(conversation, message.id, bob, "2000")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));

    let edited = h
        .state
        .router
        .edit(conversation, message.id, alice, "1500")
        .await
        .unwrap();
    assert_eq!(edited.body, "1500");
    assert!(edited.edited_at.is_some());
}

#[tokio::test]
async fn delete_for_everyone_requires_the_sender() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let alice = user();
    let bob = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(conversation, alice, "oops").with_recipients(vec![bob]))
        .await
        .unwrap();

    let err = h
        .state
        .router
        .delete(conversation, message.id, bob, true)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Permission(_)));

    // Local (for-me) delete by a participant is fine.
    h.state
        .router
        .delete(conversation, message.id, bob, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn one_reaction_per_user_latest_wins() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let alice = user();
    let bob = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(conversation, alice, "done!").with_recipients(vec![bob]))
        .await
        .unwrap();

    h.state
        .router
        .add_reaction(conversation, message.id, bob, "👍")
        .await
        .unwrap();
    let updated = h
        .state
        .router
        .add_reaction(conversation, message.id, bob, "🎉")
        .await
        .unwrap();
    assert_eq!(updated.reactions.len(), 1);
    assert_eq!(updated.reactions[0].emoji, "🎉");

    let cleared = h
        .state
        .router
        .remove_reaction(conversation, message.id, bob)
        .await
        .unwrap();
    assert!(cleared.reactions.is_empty());
}

#[tokio::test]
async fn forwarding_routes_each_target_by_its_own_tier() {
    let h = harness().await;
    let personal = ConversationId::mint(ConversationKind::Personal);
    let job = ConversationId::mint(ConversationKind::Job);
    let sender = user();

    let original = h
        .state
        .router
        .append(NewMessage::text(personal, sender, "invoice draft"))
        .await
        .unwrap();

    let forwarded = h
        .state
        .router
        .forward(personal, original.id, &[job], sender)
        .await
        .unwrap();
    assert_eq!(forwarded.len(), 1);
    assert!(forwarded[0].forwarded);
    assert_eq!(forwarded[0].body, "invoice draft");

    // The copy landed in the regulated tier.
    let remote = h.ledger.read(job, Page::default()).await.unwrap();
    assert_eq!(remote.len(), 1);
}

#[tokio::test]
async fn forwarding_a_hard_deleted_message_is_refused() {
    let h = harness().await;
    let job = ConversationId::mint(ConversationKind::Job);
    let personal = ConversationId::mint(ConversationKind::Personal);
    let sender = user();

    let message = h
        .state
        .router
        .append(NewMessage::text(job, sender, "retracted"))
        .await
        .unwrap();
    h.state
        .router
        .delete(job, message.id, sender, true)
        .await
        .unwrap();

    let err = h
        .state
        .router
        .forward(job, message.id, &[personal], sender)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::AlreadyDeleted));
}

#[tokio::test]
async fn conversation_list_merges_both_tiers_most_recent_first() {
    let h = harness().await;
    let alice = user();
    let bob = user();
    let job = ConversationId::mint(ConversationKind::Job);
    let personal = ConversationId::mint(ConversationKind::Personal);
    let unrelated = ConversationId::mint(ConversationKind::Job);

    h.state
        .router
        .append(NewMessage::text(job, alice, "job first").with_recipients(vec![bob]))
        .await
        .unwrap();
    // Distinct persisted timestamps keep the recency order deterministic.
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    h.state
        .router
        .append(NewMessage::text(personal, alice, "personal later").with_recipients(vec![bob]))
        .await
        .unwrap();
    h.state
        .router
        .append(NewMessage::text(unrelated, user(), "not for alice"))
        .await
        .unwrap();

    let list = h
        .state
        .router
        .list_conversations(alice, Page::default())
        .await
        .unwrap();
    assert_eq!(
        list.iter().map(|c| c.id).collect::<Vec<_>>(),
        vec![personal, job]
    );

    // Pagination applies after the cross-tier merge.
    let first_page = h
        .state
        .router
        .list_conversations(alice, Page::new(1, 0))
        .await
        .unwrap();
    assert_eq!(first_page.len(), 1);
    assert_eq!(first_page[0].id, personal);
    let second_page = h
        .state
        .router
        .list_conversations(alice, Page::new(1, 1))
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].id, job);

    assert!(h
        .state
        .router
        .list_conversations(user(), Page::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn search_matches_substrings_case_insensitively() {
    let h = harness().await;
    let alice = user();
    let personal = ConversationId::mint(ConversationKind::Personal);
    let job = ConversationId::mint(ConversationKind::Job);

    h.state
        .router
        .append(NewMessage::text(personal, alice, "Invoice for March"))
        .await
        .unwrap();
    h.state
        .router
        .append(NewMessage::text(personal, alice, "see you tomorrow"))
        .await
        .unwrap();
    let deleted = h
        .state
        .router
        .append(NewMessage::text(personal, alice, "invoice draft, ignore"))
        .await
        .unwrap();
    h.state
        .router
        .delete(personal, deleted.id, alice, true)
        .await
        .unwrap();
    h.state
        .router
        .append(NewMessage::text(job, alice, "updated invoice attached"))
        .await
        .unwrap();

    // Scoped search routes to the conversation's tier.
    let local_hits = h
        .state
        .router
        .search_messages(alice, "INVOICE", Some(personal))
        .await
        .unwrap();
    assert_eq!(local_hits.len(), 1);
    assert_eq!(local_hits[0].body, "Invoice for March");

    let cloud_hits = h
        .state
        .router
        .search_messages(alice, "invoice", Some(job))
        .await
        .unwrap();
    assert_eq!(cloud_hits.len(), 1);
    assert_eq!(cloud_hits[0].body, "updated invoice attached");

    // Unscoped search scans the device-local tier.
    let device_hits = h
        .state
        .router
        .search_messages(alice, "invoice", None)
        .await
        .unwrap();
    assert_eq!(device_hits.len(), 1);

    // Blank queries match nothing.
    assert!(h
        .state
        .router
        .search_messages(alice, "   ", Some(personal))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn mark_read_is_a_no_op_for_unknown_conversations_on_both_tiers() {
    let h = harness().await;
    let somebody = user();

    h.state
        .router
        .mark_read(ConversationId::mint(ConversationKind::Personal), somebody)
        .await
        .unwrap();
    h.state
        .router
        .mark_read(ConversationId::mint(ConversationKind::Job), somebody)
        .await
        .unwrap();
}

#[tokio::test]
async fn mark_read_clears_the_unread_counter() {
    let h = harness().await;
    let conversation = ConversationId::mint(ConversationKind::Job);
    let alice = user();
    let bob = user();

    h.state
        .router
        .append(NewMessage::text(conversation, alice, "one").with_recipients(vec![bob]))
        .await
        .unwrap();
    h.state
        .router
        .append(NewMessage::text(conversation, alice, "two"))
        .await
        .unwrap();

    let summary = h.state.router.conversation(conversation).await.unwrap().unwrap();
    assert_eq!(summary.unread.get(&bob), Some(&2));
    assert_eq!(summary.unread.get(&alice).copied().unwrap_or(0), 0);

    h.state.router.mark_read(conversation, bob).await.unwrap();
    let summary = h.state.router.conversation(conversation).await.unwrap().unwrap();
    assert_eq!(summary.unread.get(&bob).copied().unwrap_or(0), 0);
}
