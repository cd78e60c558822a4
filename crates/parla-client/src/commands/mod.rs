//! User-initiated operations.
//!
//! Each sub-module groups related commands by domain. Commands take a
//! [`Client`](crate::state::Client), never hold the state lock across an
//! `.await`, and re-check that their conversation is still open before
//! touching the thread after a network round trip.

pub mod contacts;
pub mod conversations;
pub mod files;
pub mod media;
pub mod messaging;
pub mod presence;
