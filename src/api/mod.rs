// vigil: HTTP command surface

pub mod models;
pub mod rest;
pub mod ws;

pub use rest::{router, ApiError, AppState, AuthUser};
