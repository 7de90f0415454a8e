//! The five-step per-task pipeline of the Worker Pool: parse, verify user,
//! look up product price, compute total, insert order. Each step maps its
//! failure onto the shared `{Permanent, Transient, Fatal}` taxonomy so the
//! caller can route DLQ/retry/ack without re-deriving intent from the error
//! type.

use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use tracing::instrument;

use crate::db::SeaOrmDbPool;
use crate::entities::order::{self, OrderStatus};
use crate::entities::{product, user};
use crate::errors::{ProcessingError, ProcessingResult};
use crate::queue::{DeliveredMessage, OrderMessage};

#[derive(Debug)]
pub enum OrderOutcome {
    Inserted { order_id: i64, total_price: Decimal },
    AlreadyProcessed,
}

/// `Permanent` unless otherwise noted; see module docs.
#[instrument(
    skip(db, message),
    fields(receive_count = message.receive_count, correlation_id = tracing::field::Empty)
)]
pub async fn process_message(
    db: &SeaOrmDbPool,
    message: &DeliveredMessage,
    max_order_total: Decimal,
) -> ProcessingResult<OrderOutcome> {
    crate::observability::continue_trace_from_message(&tracing::Span::current(), message.traceparent.as_deref());

    let parsed = parse(message)?;
    if let Some(correlation_id) = &parsed.correlation_id {
        tracing::Span::current().record("correlation_id", tracing::field::display(correlation_id));
    }
    let user_id = verify_user(db, parsed.user_id).await?;
    let unit_price = lookup_product_price(db, parsed.product_id).await?;
    let total_price = compute_total(unit_price, parsed.quantity, max_order_total)?;
    insert_order(
        db,
        user_id,
        parsed.product_id as i64,
        parsed.quantity as i32,
        total_price,
        message.dedup_id.clone(),
    )
    .await
}

fn parse(message: &DeliveredMessage) -> ProcessingResult<OrderMessage> {
    let parsed: OrderMessage = serde_json::from_str(&message.body)
        .map_err(|err| ProcessingError::permanent("parse_error", err))?;

    if parsed.quantity < 1 {
        return Err(ProcessingError::permanent(
            "parse_error",
            anyhow::anyhow!("quantity must be >= 1, got {}", parsed.quantity),
        ));
    }

    Ok(parsed)
}

async fn verify_user(db: &SeaOrmDbPool, user_id: u64) -> ProcessingResult<i64> {
    let found = db
        .execute("verify_user", move |conn| async move {
            user::Entity::find_by_id(user_id as i64).one(conn.as_ref()).await
        })
        .await?;

    found
        .map(|row| row.id)
        .ok_or_else(|| ProcessingError::permanent("user_not_found", anyhow::anyhow!("user {user_id} does not exist")))
}

async fn lookup_product_price(db: &SeaOrmDbPool, product_id: u64) -> ProcessingResult<Decimal> {
    let found = db
        .execute("lookup_product", move |conn| async move {
            product::Entity::find_by_id(product_id as i64).one(conn.as_ref()).await
        })
        .await?;

    found
        .map(|row| row.unit_price)
        .ok_or_else(|| {
            ProcessingError::permanent("product_not_found", anyhow::anyhow!("product {product_id} does not exist"))
        })
}

fn compute_total(unit_price: Decimal, quantity: u32, max_order_total: Decimal) -> ProcessingResult<Decimal> {
    let total = unit_price * Decimal::from(quantity);
    if total > max_order_total {
        return Err(ProcessingError::permanent(
            "total_exceeded",
            anyhow::anyhow!("total {total} exceeds maximum order total {max_order_total}"),
        ));
    }
    Ok(total)
}

async fn insert_order(
    db: &SeaOrmDbPool,
    user_id: i64,
    product_id: i64,
    quantity: i32,
    total_price: Decimal,
    dedup_key: Option<String>,
) -> ProcessingResult<OrderOutcome> {
    let now = chrono::Utc::now();
    let dedup_key_for_lookup = dedup_key.clone();

    let insert_result = db
        .execute("insert_order", move |conn| {
            let model = order::ActiveModel {
                user_id: Set(user_id),
                product_id: Set(product_id),
                quantity: Set(quantity),
                total_price: Set(total_price),
                status: Set(OrderStatus::Pending),
                dedup_key: Set(dedup_key.clone()),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            };
            async move { model.insert(conn.as_ref()).await }
        })
        .await;

    match insert_result {
        Ok(inserted) => Ok(OrderOutcome::Inserted {
            order_id: inserted.id,
            total_price,
        }),
        Err(err) if is_unique_violation(&err) => {
            tracing::info!(dedup_key = ?dedup_key_for_lookup, "order already processed, skipping reinsert");
            Ok(OrderOutcome::AlreadyProcessed)
        }
        Err(err) => Err(err.into()),
    }
}

fn is_unique_violation(err: &crate::errors::DbPoolError) -> bool {
    matches!(err, crate::errors::DbPoolError::UniqueViolation(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn msg(body: &str) -> DeliveredMessage {
        DeliveredMessage {
            body: body.to_string(),
            receipt_handle: "r1".to_string(),
            receive_count: 1,
            dedup_id: None,
            traceparent: None,
        }
    }

    #[test]
    fn parse_rejects_malformed_json() {
        let err = parse(&msg("not json")).unwrap_err();
        assert_eq!(err.dead_letter_reason.as_deref(), Some("parse_error"));
    }

    #[test]
    fn parse_rejects_zero_quantity() {
        let body = r#"{"user_id":7,"product_id":3,"quantity":0}"#;
        let err = parse(&msg(body)).unwrap_err();
        assert_eq!(err.dead_letter_reason.as_deref(), Some("parse_error"));
    }

    #[test]
    fn parse_accepts_a_valid_order() {
        let body = r#"{"user_id":7,"product_id":3,"quantity":2,"correlation_id":"c1"}"#;
        let parsed = parse(&msg(body)).unwrap();
        assert_eq!(parsed.user_id, 7);
        assert_eq!(parsed.quantity, 2);
        assert_eq!(parsed.correlation_id.as_deref(), Some("c1"));
    }

    #[test]
    fn only_unique_violation_is_treated_as_a_non_breaker_business_outcome() {
        assert!(is_unique_violation(&crate::errors::DbPoolError::UniqueViolation(
            "duplicate key".to_string()
        )));
        assert!(!is_unique_violation(&crate::errors::DbPoolError::NotFound));
        assert!(!is_unique_violation(&crate::errors::DbPoolError::Unavailable(
            "down".to_string()
        )));
    }

    #[test]
    fn compute_total_multiplies_price_by_quantity() {
        let total = compute_total(dec!(49.95), 2, dec!(1000000)).unwrap();
        assert_eq!(total, dec!(99.90));
    }

    #[test]
    fn compute_total_rejects_over_the_ceiling() {
        let err = compute_total(dec!(600000), 2, dec!(1000000)).unwrap_err();
        assert_eq!(err.dead_letter_reason.as_deref(), Some("total_exceeded"));
    }
}
