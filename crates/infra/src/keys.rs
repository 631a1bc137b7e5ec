//! Fast-store key schema.

use flashsale_core::ItemId;

/// Score-ordered set: member = item id, score = cumulative quantity sold.
pub const HOT_RANKING: &str = "rank:hot_items";
/// Score-ordered set: member = item id, score = creation time (epoch seconds).
pub const NEW_RANKING: &str = "rank:new_items";

/// Per-item stock counter mirrored from durable storage.
pub fn stock(item_id: ItemId) -> String {
    format!("stock:{item_id}")
}

/// Serialized item detail written by the cache-aside read path.
pub fn item_detail(item_id: ItemId) -> String {
    format!("item:detail:{item_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_embed_the_item_id() {
        assert_eq!(stock(ItemId::new(42)), "stock:42");
        assert_eq!(item_detail(ItemId::new(42)), "item:detail:42");
    }
}
