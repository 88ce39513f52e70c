//! herald-server
//!
//! HTTP edge for herald: accepts notification requests, hands them to the
//! producer and answers status queries from the result store.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;

pub use self::routes::create_router;
pub use self::state::AppState;
