//! switchboard-server – axum front-end for the switchboard mediation core.
//!
//! Exposed as a library so integration tests can build the full router
//! against in-memory state; the binary entry point lives in `main.rs`.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
