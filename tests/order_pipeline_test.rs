//! End-to-end coverage of the worker pipeline against a migrated sqlite
//! in-memory database and the in-memory queue client, exercising the
//! scenarios named for the Worker Pool and DB Pool components: a clean
//! insert, idempotent redelivery, and the permanent-failure/dead-letter
//! paths for an unknown user, an unknown product, and an over-ceiling total.

use std::time::Duration;

use migrations::{Migrator, MigratorTrait};
use order_worker::db::SeaOrmDbPool;
use order_worker::entities::{order, product, user};
use order_worker::queue::fake::FakeQueueClient;
use order_worker::queue::{DeliveredMessage, QueueClient};
use order_worker::worker::pipeline::{process_message, OrderOutcome};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Database, EntityTrait, Set};

async fn seeded_pool() -> SeaOrmDbPool {
    let connection = Database::connect("sqlite::memory:")
        .await
        .expect("open sqlite in-memory connection");
    Migrator::up(&connection, None)
        .await
        .expect("run migrations against sqlite");

    user::ActiveModel {
        username: Set("alice".to_string()),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    }
    .insert(&connection)
    .await
    .expect("seed user");

    product::ActiveModel {
        name: Set("Widget".to_string()),
        sku: Set("SKU-1".to_string()),
        unit_price: Set(dec!(49.95)),
        created_at: Set(chrono::Utc::now()),
        ..Default::default()
    }
    .insert(&connection)
    .await
    .expect("seed product");

    SeaOrmDbPool::for_tests(connection)
}

fn delivered(body: &str, dedup_id: Option<&str>) -> DeliveredMessage {
    DeliveredMessage {
        body: body.to_string(),
        receipt_handle: "r1".to_string(),
        receive_count: 1,
        dedup_id: dedup_id.map(|s| s.to_string()),
        traceparent: None,
    }
}

#[tokio::test]
async fn inserts_a_valid_order() {
    let db = seeded_pool().await;
    let msg = delivered(r#"{"user_id":1,"product_id":1,"quantity":2}"#, Some("dedup-1"));

    let outcome = process_message(&db, &msg, dec!(1000000)).await.expect("processes");
    let order_id = match outcome {
        OrderOutcome::Inserted { order_id, total_price } => {
            assert_eq!(total_price, dec!(99.90));
            order_id
        }
        OrderOutcome::AlreadyProcessed => panic!("expected a fresh insert"),
    };

    let stored = db
        .execute("fetch_order", move |conn| async move {
            order::Entity::find_by_id(order_id).one(conn.as_ref()).await
        })
        .await
        .expect("query order")
        .expect("order row exists");
    assert_eq!(stored.dedup_key.as_deref(), Some("dedup-1"));
}

#[tokio::test]
async fn redelivery_with_the_same_dedup_key_is_idempotent() {
    let db = seeded_pool().await;
    let msg = delivered(r#"{"user_id":1,"product_id":1,"quantity":1}"#, Some("dedup-2"));

    let first = process_message(&db, &msg, dec!(1000000)).await.expect("first insert");
    assert!(matches!(first, OrderOutcome::Inserted { .. }));

    let second = process_message(&db, &msg, dec!(1000000)).await.expect("second delivery");
    assert!(matches!(second, OrderOutcome::AlreadyProcessed));
}

#[tokio::test]
async fn unknown_user_is_a_permanent_failure() {
    let db = seeded_pool().await;
    let msg = delivered(r#"{"user_id":999,"product_id":1,"quantity":1}"#, None);

    let err = process_message(&db, &msg, dec!(1000000)).await.unwrap_err();
    assert_eq!(err.dead_letter_reason.as_deref(), Some("user_not_found"));
}

#[tokio::test]
async fn unknown_product_is_a_permanent_failure() {
    let db = seeded_pool().await;
    let msg = delivered(r#"{"user_id":1,"product_id":999,"quantity":1}"#, None);

    let err = process_message(&db, &msg, dec!(1000000)).await.unwrap_err();
    assert_eq!(err.dead_letter_reason.as_deref(), Some("product_not_found"));
}

#[tokio::test]
async fn over_ceiling_total_is_routed_to_the_dead_letter_queue() {
    let db = seeded_pool().await;
    let queue = FakeQueueClient::new(Duration::from_secs(30));
    queue
        .enqueue(r#"{"user_id":1,"product_id":1,"quantity":1000000}"#, None)
        .await;

    let batch = queue.receive(1, 0).await.expect("receive batch");
    let msg = &batch[0];

    let err = process_message(&db, msg, dec!(1000000)).await.unwrap_err();
    assert_eq!(err.dead_letter_reason.as_deref(), Some("total_exceeded"));

    queue
        .send_to_dead_letter(msg, err.dead_letter_reason.as_deref().unwrap())
        .await
        .expect("dead-letter send");
    let letters = queue.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(queue.pending_len().await, 0);
}
