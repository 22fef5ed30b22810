//! Shopping cart: the reference entity type, plus an item-popularity read
//! model built from its tagged events.
//!
//! A cart is open until checked out. While open, items can be added,
//! removed and adjusted; once checked out every mutation is rejected and
//! only [`CartCommand::Get`] succeeds.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::event::{PersistedEvent, decode_domain_event};
use crate::projection::Projection;
use crate::tagging::TagScheme;

/// Number of projection tags cart events are spread over.
pub const TAG_COUNT: u32 = 5;

/// The cart tag scheme: `carts-0 .. carts-4`.
pub fn cart_tags() -> TagScheme {
    TagScheme::new("carts", TAG_COUNT)
}

/// State of one cart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShoppingCart {
    /// Quantity per item id.
    pub items: BTreeMap<String, i32>,
    /// Checkout time (Unix epoch milliseconds), once checked out.
    pub checkout_date: Option<u64>,
}

impl ShoppingCart {
    /// Whether the cart has been checked out.
    pub fn is_checked_out(&self) -> bool {
        self.checkout_date.is_some()
    }

    fn quantity_of(&self, item_id: &str) -> Option<i32> {
        self.items.get(item_id).copied()
    }

    /// Summary of the current state.
    pub fn summary(&self) -> Summary {
        Summary {
            items: self.items.clone(),
            checked_out: self.is_checked_out(),
        }
    }
}

/// Commands accepted by a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CartCommand {
    /// Add an item not yet in the cart.
    AddItem { item_id: String, quantity: i32 },
    /// Remove an item. Removing an absent item succeeds without change.
    RemoveItem { item_id: String },
    /// Change the quantity of an item already in the cart.
    AdjustItemQuantity { item_id: String, quantity: i32 },
    /// Check the cart out at `at` (Unix epoch milliseconds).
    Checkout { at: u64 },
    /// Read the current summary.
    Get,
}

/// Events emitted by a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CartEvent {
    ItemAdded {
        cart_id: String,
        item_id: String,
        quantity: i32,
    },
    ItemRemoved {
        cart_id: String,
        item_id: String,
        old_quantity: i32,
    },
    ItemQuantityAdjusted {
        cart_id: String,
        item_id: String,
        old_quantity: i32,
        new_quantity: i32,
    },
    CheckedOut {
        cart_id: String,
        event_time: u64,
    },
}

/// Reply to every accepted cart command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub items: BTreeMap<String, i32>,
    pub checked_out: bool,
}

/// Why a cart rejected a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CartError {
    #[error("Item '{0}' was already added to this shopping cart")]
    AlreadyAdded(String),
    #[error("Quantity must be greater than zero")]
    NonPositiveQuantity,
    #[error("Cannot adjust quantity for item '{0}'. Item not present on cart")]
    NotInCart(String),
    #[error("Cannot checkout an empty shopping cart")]
    EmptyCart,
    #[error("Can't add an item to an already checked out shopping cart")]
    AddAfterCheckout,
    #[error("Can't remove an item from an already checked out shopping cart")]
    RemoveAfterCheckout,
    #[error("Can't adjust item on an already checked out shopping cart")]
    AdjustAfterCheckout,
    #[error("Can't checkout already checked out shopping cart")]
    AlreadyCheckedOut,
}

impl Aggregate for ShoppingCart {
    const AGGREGATE_TYPE: &'static str = "shopping-cart";

    type Command = CartCommand;
    type DomainEvent = CartEvent;
    type Reply = Summary;
    type Error = CartError;

    fn handle(&self, cart_id: &str, cmd: CartCommand) -> Result<Vec<CartEvent>, CartError> {
        if self.is_checked_out() {
            return match cmd {
                CartCommand::Get => Ok(vec![]),
                CartCommand::AddItem { .. } => Err(CartError::AddAfterCheckout),
                CartCommand::RemoveItem { .. } => Err(CartError::RemoveAfterCheckout),
                CartCommand::AdjustItemQuantity { .. } => Err(CartError::AdjustAfterCheckout),
                CartCommand::Checkout { .. } => Err(CartError::AlreadyCheckedOut),
            };
        }

        let cart_id = cart_id.to_owned();
        match cmd {
            CartCommand::Get => Ok(vec![]),
            CartCommand::AddItem { item_id, quantity } => {
                if self.items.contains_key(&item_id) {
                    return Err(CartError::AlreadyAdded(item_id));
                }
                if quantity <= 0 {
                    return Err(CartError::NonPositiveQuantity);
                }
                Ok(vec![CartEvent::ItemAdded {
                    cart_id,
                    item_id,
                    quantity,
                }])
            }
            CartCommand::RemoveItem { item_id } => Ok(self
                .quantity_of(&item_id)
                .map(|old_quantity| CartEvent::ItemRemoved {
                    cart_id,
                    item_id,
                    old_quantity,
                })
                .into_iter()
                .collect()),
            CartCommand::AdjustItemQuantity { item_id, quantity } => {
                if quantity <= 0 {
                    return Err(CartError::NonPositiveQuantity);
                }
                let Some(old_quantity) = self.quantity_of(&item_id) else {
                    return Err(CartError::NotInCart(item_id));
                };
                Ok(vec![CartEvent::ItemQuantityAdjusted {
                    cart_id,
                    item_id,
                    old_quantity,
                    new_quantity: quantity,
                }])
            }
            CartCommand::Checkout { at } => {
                if self.items.is_empty() {
                    return Err(CartError::EmptyCart);
                }
                Ok(vec![CartEvent::CheckedOut {
                    cart_id,
                    event_time: at,
                }])
            }
        }
    }

    fn apply(mut self, event: &CartEvent) -> Self {
        match event {
            CartEvent::ItemAdded {
                item_id, quantity, ..
            } => {
                self.items.insert(item_id.clone(), *quantity);
            }
            CartEvent::ItemRemoved { item_id, .. } => {
                self.items.remove(item_id);
            }
            CartEvent::ItemQuantityAdjusted {
                item_id,
                new_quantity,
                ..
            } => {
                self.items.insert(item_id.clone(), *new_quantity);
            }
            CartEvent::CheckedOut { event_time, .. } => {
                self.checkout_date = Some(*event_time);
            }
        }
        self
    }

    fn reply(&self) -> Summary {
        self.summary()
    }
}

/// Total quantity per item across all carts of one tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPopularity {
    pub counts: BTreeMap<String, i64>,
}

impl ItemPopularity {
    /// Total quantity of `item_id` currently in carts.
    pub fn count(&self, item_id: &str) -> i64 {
        self.counts.get(item_id).copied().unwrap_or_default()
    }

    fn add(&mut self, item_id: &str, delta: i64) {
        *self.counts.entry(item_id.to_owned()).or_default() += delta;
    }
}

impl Projection for ItemPopularity {
    const NAME: &'static str = "item-popularity";

    fn apply(&mut self, event: &PersistedEvent) {
        if event.stream.aggregate_type != ShoppingCart::AGGREGATE_TYPE {
            return;
        }
        let Ok(cart_event) = decode_domain_event::<ShoppingCart>(event) else {
            tracing::debug!(event_type = %event.event_type, "skipping unknown cart event");
            return;
        };
        match cart_event {
            CartEvent::ItemAdded {
                item_id, quantity, ..
            } => self.add(&item_id, i64::from(quantity)),
            CartEvent::ItemQuantityAdjusted {
                item_id,
                old_quantity,
                new_quantity,
                ..
            } => self.add(&item_id, i64::from(new_quantity) - i64::from(old_quantity)),
            CartEvent::ItemRemoved {
                item_id,
                old_quantity,
                ..
            } => self.add(&item_id, -i64::from(old_quantity)),
            CartEvent::CheckedOut { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::replay;
    use crate::command::CommandContext;
    use crate::event::{StreamId, encode_domain_event};

    fn add(item: &str, quantity: i32) -> CartCommand {
        CartCommand::AddItem {
            item_id: item.into(),
            quantity,
        }
    }

    fn run(cart: ShoppingCart, cmd: CartCommand) -> Result<ShoppingCart, CartError> {
        let events = cart.handle("c1", cmd)?;
        Ok(events.iter().fold(cart, |s, e| s.apply(e)))
    }

    #[test]
    fn add_item_emits_item_added() {
        let events = ShoppingCart::default()
            .handle("c1", add("socks", 3))
            .unwrap();
        assert_eq!(
            events,
            vec![CartEvent::ItemAdded {
                cart_id: "c1".into(),
                item_id: "socks".into(),
                quantity: 3,
            }]
        );
        let cart = replay::<ShoppingCart, _>(&events);
        assert_eq!(cart.summary().items["socks"], 3);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let cart = run(ShoppingCart::default(), add("socks", 3)).unwrap();
        let err = cart.handle("c1", add("socks", 5)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Item 'socks' was already added to this shopping cart"
        );
    }

    #[test]
    fn non_positive_quantities_are_rejected() {
        let cart = ShoppingCart::default();
        assert_eq!(
            cart.handle("c1", add("t-shirt", 0)).unwrap_err(),
            CartError::NonPositiveQuantity
        );
        assert_eq!(
            cart.handle("c1", add("t-shirt", -2)).unwrap_err().to_string(),
            "Quantity must be greater than zero"
        );
    }

    #[test]
    fn remove_is_idempotent() {
        let cart = run(ShoppingCart::default(), add("socks", 3)).unwrap();
        let events = cart
            .handle(
                "c1",
                CartCommand::RemoveItem {
                    item_id: "hat".into(),
                },
            )
            .unwrap();
        assert!(events.is_empty());

        let cart = run(
            cart,
            CartCommand::RemoveItem {
                item_id: "socks".into(),
            },
        )
        .unwrap();
        assert!(cart.items.is_empty());
    }

    #[test]
    fn adjust_requires_present_item() {
        let cart = run(ShoppingCart::default(), add("socks", 3)).unwrap();
        let err = cart
            .handle(
                "c1",
                CartCommand::AdjustItemQuantity {
                    item_id: "hat".into(),
                    quantity: 2,
                },
            )
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot adjust quantity for item 'hat'. Item not present on cart"
        );

        let cart = run(
            cart,
            CartCommand::AdjustItemQuantity {
                item_id: "socks".into(),
                quantity: 7,
            },
        )
        .unwrap();
        assert_eq!(cart.items["socks"], 7);
    }

    #[test]
    fn checkout_closes_the_cart() {
        let empty = ShoppingCart::default();
        assert_eq!(
            empty.handle("c1", CartCommand::Checkout { at: 1 }).unwrap_err(),
            CartError::EmptyCart
        );

        let cart = run(empty, add("socks", 3)).unwrap();
        let cart = run(cart, CartCommand::Checkout { at: 1_700_000_000_000 }).unwrap();
        assert!(cart.summary().checked_out);
        assert_eq!(cart.checkout_date, Some(1_700_000_000_000));

        assert_eq!(
            cart.handle("c1", add("hat", 1)).unwrap_err(),
            CartError::AddAfterCheckout
        );
        assert_eq!(
            cart.handle("c1", CartCommand::RemoveItem { item_id: "socks".into() })
                .unwrap_err(),
            CartError::RemoveAfterCheckout
        );
        assert_eq!(
            cart.handle(
                "c1",
                CartCommand::AdjustItemQuantity {
                    item_id: "socks".into(),
                    quantity: 1
                }
            )
            .unwrap_err(),
            CartError::AdjustAfterCheckout
        );
        assert_eq!(
            cart.handle("c1", CartCommand::Checkout { at: 2 }).unwrap_err(),
            CartError::AlreadyCheckedOut
        );
        assert!(cart.handle("c1", CartCommand::Get).unwrap().is_empty());
    }

    #[test]
    fn popularity_tracks_quantity_changes() {
        let stream = StreamId::of::<ShoppingCart>("c1");
        let events = [
            CartEvent::ItemAdded {
                cart_id: "c1".into(),
                item_id: "socks".into(),
                quantity: 3,
            },
            CartEvent::ItemQuantityAdjusted {
                cart_id: "c1".into(),
                item_id: "socks".into(),
                old_quantity: 3,
                new_quantity: 5,
            },
            CartEvent::ItemAdded {
                cart_id: "c1".into(),
                item_id: "hat".into(),
                quantity: 1,
            },
            CartEvent::ItemRemoved {
                cart_id: "c1".into(),
                item_id: "hat".into(),
                old_quantity: 1,
            },
        ];

        let mut popularity = ItemPopularity::default();
        for (i, event) in events.iter().enumerate() {
            let proposed =
                encode_domain_event::<ShoppingCart>(event, &CommandContext::default(), &[])
                    .unwrap();
            let persisted = PersistedEvent::from_proposed(stream.clone(), i as u64 + 1, proposed);
            Projection::apply(&mut popularity, &persisted);
        }
        assert_eq!(popularity.count("socks"), 5);
        assert_eq!(popularity.count("hat"), 0);
    }

    #[test]
    fn popularity_ignores_other_entity_types() {
        let proposed = crate::memory::test_support::proposed("ItemAdded", &[]);
        let persisted = PersistedEvent::from_proposed(StreamId::new("counter", "x"), 1, proposed);
        let mut popularity = ItemPopularity::default();
        Projection::apply(&mut popularity, &persisted);
        assert!(popularity.counts.is_empty());
    }

    #[test]
    fn tags_spread_over_five() {
        let tags = cart_tags();
        assert_eq!(tags.tags().len(), 5);
        assert!(tags.tag_for("c1").starts_with("carts-"));
    }
}
