pub mod connection;
pub mod events;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod validation;
