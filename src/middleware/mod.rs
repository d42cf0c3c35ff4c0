pub mod auth;

pub use auth::{auth_middleware, AuthState, API_KEY_HEADER};
