//! Client networking core: the outbound connection lifecycle, the JSON
//! protocol from the client side and the per-login local store. The UI
//! embedding drives a [`socket::Courier`] handle and consumes
//! [`events::ClientEvent`]s pushed by the receive thread.

pub mod events;
pub mod socket;
pub mod store;

pub use events::ClientEvent;
pub use socket::Courier;
