//! API module - REST handlers for stream management

pub mod rest;

pub use rest::create_rest_router;
