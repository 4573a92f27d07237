pub mod api;
pub mod error_payload;
pub mod state;
