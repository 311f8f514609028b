use anyhow::{anyhow, Result};
use chrono::Duration;
use portal_sync::db::SyncCounts;
use portal_sync::handlers;
use portal_sync::telegram::{self, LinkCommand, LinkOutcome, Notifier};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(i64, String)>>>,
    unreachable: Arc<Mutex<HashSet<i64>>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        if self.unreachable.lock().await.contains(&chat_id) {
            return Err(anyhow!("Forbidden: bot was blocked by the user"));
        }
        self.sent.lock().await.push((chat_id, text.to_string()));
        Ok(())
    }
}

#[tokio::test]
async fn code_links_a_chat_once() {
    let pool = setup_pool().await;
    let code = telegram::create_link_code(&pool, "user-1", Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(code.code.len(), telegram::CODE_LEN);
    assert_eq!(code.code, code.code.to_uppercase());

    let outcome = telegram::redeem_link_code(&pool, &code.code.to_lowercase(), 1001, Some("ana"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        LinkOutcome::Linked {
            user_id: "user-1".into()
        }
    );
    assert_eq!(telegram::linked_chats(&pool, "user-1").await.unwrap(), vec![1001]);

    let again = telegram::redeem_link_code(&pool, &code.code, 2002, None)
        .await
        .unwrap();
    assert_eq!(again, LinkOutcome::AlreadyUsed);
    assert_eq!(
        telegram::redeem_link_code(&pool, "NOPE1234", 1001, None).await.unwrap(),
        LinkOutcome::Unknown
    );
}

#[tokio::test]
async fn expired_and_replaced_codes_are_refused() {
    let pool = setup_pool().await;
    let expired = telegram::create_link_code(&pool, "user-1", Duration::minutes(-1))
        .await
        .unwrap();
    assert_eq!(
        telegram::redeem_link_code(&pool, &expired.code, 1001, None).await.unwrap(),
        LinkOutcome::Expired
    );

    let old = telegram::create_link_code(&pool, "user-2", Duration::minutes(15))
        .await
        .unwrap();
    let fresh = telegram::create_link_code(&pool, "user-2", Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(
        telegram::redeem_link_code(&pool, &old.code, 1001, None).await.unwrap(),
        LinkOutcome::Unknown
    );
    assert!(matches!(
        telegram::redeem_link_code(&pool, &fresh.code, 1001, None).await.unwrap(),
        LinkOutcome::Linked { .. }
    ));
}

#[tokio::test]
async fn bot_replies_follow_the_link_lifecycle() {
    let pool = setup_pool().await;
    let status = handlers::reply_for(&pool, 1001, None, LinkCommand::Status)
        .await
        .unwrap();
    assert!(status.starts_with("Not linked"));

    let code = telegram::create_link_code(&pool, "user-1", Duration::minutes(15))
        .await
        .unwrap();
    let linked = handlers::reply_for(&pool, 1001, Some("ana"), LinkCommand::Start(Some(code.code.clone())))
        .await
        .unwrap();
    assert!(linked.starts_with("Linked!"));
    let reused = handlers::reply_for(&pool, 1001, Some("ana"), LinkCommand::Link(Some(code.code)))
        .await
        .unwrap();
    assert!(reused.contains("already used"));

    let status = handlers::reply_for(&pool, 1001, None, LinkCommand::Status)
        .await
        .unwrap();
    assert_eq!(status, "Linked to 1 portal account(s).");

    let usage = handlers::reply_for(&pool, 1001, None, LinkCommand::Link(None))
        .await
        .unwrap();
    assert!(usage.contains("/link <code>"));

    let unlinked = handlers::reply_for(&pool, 1001, None, LinkCommand::Unlink)
        .await
        .unwrap();
    assert!(unlinked.contains("no longer"));
    assert!(telegram::all_linked_chats(&pool).await.unwrap().is_empty());
    let twice = handlers::reply_for(&pool, 1001, None, LinkCommand::Unlink)
        .await
        .unwrap();
    assert_eq!(twice, "This chat was not linked.");
}

#[tokio::test]
async fn sync_summary_reaches_every_linked_chat() {
    let pool = setup_pool().await;
    for (user, chat) in [("user-1", 1001), ("user-2", 2002), ("user-3", 1001)] {
        let code = telegram::create_link_code(&pool, user, Duration::minutes(15))
            .await
            .unwrap();
        telegram::redeem_link_code(&pool, &code.code, chat, None)
            .await
            .unwrap();
    }
    let notifier = RecordingNotifier::default();
    notifier.unreachable.lock().await.insert(2002);

    let counts = SyncCounts {
        fetched: 10,
        created: 2,
        updated: 3,
        unchanged: 5,
        deleted: 1,
        errors: 1,
        ..Default::default()
    };
    let sent = telegram::notify_sync_summary(&pool, &notifier, "sa1", &counts)
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let messages = notifier.sent.lock().await.clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, 1001);
    assert!(messages[0].1.contains("2 new, 3 updated"));
    assert!(messages[0].1.ends_with("1 errors"));
}
