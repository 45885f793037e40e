//! Bearer-token authentication against Supabase

pub mod middleware;

pub use middleware::{authenticate_bearer, require_auth, AuthError, AuthState, AuthUser};
