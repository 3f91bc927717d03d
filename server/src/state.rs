use std::sync::Arc;

use crate::store::{Authenticator, MembershipLookup};
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live sessions and their server subscriptions
    pub registry: ConnectionRegistry,
    /// Server membership, read once per connection
    pub membership: Arc<dyn MembershipLookup>,
    /// Resolves the login cookie to a user id
    pub auth: Arc<dyn Authenticator>,
}
