pub mod tokens;

pub use tokens::{Scope, SessionClaims, TokenIssuer};
