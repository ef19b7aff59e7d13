//! Order and customer identifiers
//!
//! `order_<userId>_<millis>` and `customer_<userId>` are parsed back by the
//! webhook path to recover ownership, so the formats must stay stable.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

const ORDER_PREFIX: &str = "order_";
const CUSTOMER_PREFIX: &str = "customer_";

pub fn customer_key(user_id: Uuid) -> String {
    format!("{}{}", CUSTOMER_PREFIX, user_id)
}

/// Issues order ids whose timestamp part never repeats within the process
#[derive(Debug, Default)]
pub struct OrderIdGenerator {
    last_millis: AtomicI64,
}

impl OrderIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, user_id: Uuid, now: DateTime<Utc>) -> String {
        let wanted = now.timestamp_millis();
        let mut current = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = if wanted > current { wanted } else { current + 1 };
            match self.last_millis.compare_exchange_weak(
                current,
                candidate,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return format!("{}{}_{}", ORDER_PREFIX, user_id, candidate),
                Err(actual) => current = actual,
            }
        }
    }
}

/// Recover the user id from an order id
pub fn parse_order_user_id(order_id: &str) -> Option<Uuid> {
    let rest = order_id.strip_prefix(ORDER_PREFIX)?;
    let (user, millis) = rest.rsplit_once('_')?;
    if millis.is_empty() || !millis.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Uuid::parse_str(user).ok()
}

/// Recover the user id from a customer key
pub fn parse_customer_user_id(customer_key: &str) -> Option<Uuid> {
    customer_key
        .strip_prefix(CUSTOMER_PREFIX)
        .and_then(|user| Uuid::parse_str(user).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_id_round_trip() {
        let user_id = Uuid::new_v4();
        let generator = OrderIdGenerator::new();
        let order_id = generator.next(user_id, Utc::now());

        assert!(order_id.starts_with("order_"));
        assert_eq!(parse_order_user_id(&order_id), Some(user_id));
    }

    #[test]
    fn test_order_ids_are_unique_within_same_millisecond() {
        let user_id = Uuid::new_v4();
        let generator = OrderIdGenerator::new();
        let now = Utc::now();

        let a = generator.next(user_id, now);
        let b = generator.next(user_id, now);
        let c = generator.next(user_id, now);
        assert_ne!(a, b);
        assert_ne!(b, c);
    }

    #[test]
    fn test_malformed_order_ids_are_rejected() {
        assert_eq!(parse_order_user_id("order_not-a-uuid_123"), None);
        assert_eq!(parse_order_user_id("payment_123"), None);
        let user_id = Uuid::new_v4();
        assert_eq!(parse_order_user_id(&format!("order_{}_", user_id)), None);
        assert_eq!(parse_order_user_id(&format!("order_{}_12a", user_id)), None);
    }

    #[test]
    fn test_customer_key_round_trip() {
        let user_id = Uuid::new_v4();
        assert_eq!(parse_customer_user_id(&customer_key(user_id)), Some(user_id));
        assert_eq!(parse_customer_user_id("customer_bogus"), None);
        assert_eq!(parse_customer_user_id("cust_x"), None);
    }
}
