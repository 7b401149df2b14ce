//! Collaborator traits and in-memory implementations used by the manager.

pub mod catalog;
pub mod orders;

pub use catalog::{Catalog, InMemoryCatalog};
pub use orders::{InMemoryOrderBook, NewOrder, Order, OrderBook};
