//! Exchange, queue and routing-key names, and topic pattern matching.

/// Topic exchange every producer publishes to.
pub const EVENT_EXCHANGE: &str = "flashsale.events";
/// Topic exchange receiving dead-lettered messages.
pub const DEAD_LETTER_EXCHANGE: &str = "flashsale.dlx";

/// Flash-sale order intents (the admission gate's output).
pub const FLASH_SALE_ORDER: &str = "order.seckill";
/// Notification: an order was created through the standard path.
pub const ORDER_CREATED: &str = "order.created";
/// Notification: a user registered.
pub const USER_REGISTERED: &str = "user.registered";
/// Binding pattern matching every routing key.
pub const CATCH_ALL: &str = "#";

pub const FLASH_SALE_QUEUE: &str = "order_seckill_queue";
pub const ORDER_CREATED_QUEUE: &str = "order_created_queue";
pub const USER_REGISTERED_QUEUE: &str = "user_registered_queue";
pub const DEAD_LETTER_QUEUE: &str = "dlq_queue";

/// AMQP topic matching: words are `.`-separated, `*` matches exactly one word,
/// `#` matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        Vec::new()
    } else {
        routing_key.split('.').collect()
    };
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && match_words(rest, &key[1..]),
    }
}
