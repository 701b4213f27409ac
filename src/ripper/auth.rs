//! Upstream session state shared by every outgoing request

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::ripper::config_loader::Upstream;
use crate::ripper::error::{RipperError, RipperResult};
use crate::ripper::event_bus::{Event, EventBus};
use crate::ripper::transport::Transport;

/// Marker the forum prints after a successful login
const LOGIN_SUCCESS_MARKER: &str = "Thank you for logging in";

/// Credentials attached to upstream requests
///
/// The session cookie itself lives in the transport's cookie jar; this
/// context only tracks who is logged in.
#[derive(Default)]
pub struct AuthContext {
    user: RwLock<Option<String>>,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(&self) -> Option<String> {
        self.user.read().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.read().is_some()
    }

    pub(crate) fn set_user(&self, name: &str) {
        *self.user.write() = Some(name.to_string());
    }

    /// Log in with the configured credentials, or log out when login is disabled.
    /// Publishes `Event::User` with the resulting user name (empty when anonymous).
    pub async fn authenticate(
        &self,
        transport: &dyn Transport,
        upstream: &Upstream,
        event_bus: &EventBus,
    ) -> RipperResult<()> {
        if !upstream.login || upstream.username.is_empty() {
            self.logout(event_bus);
            return Ok(());
        }

        let url = format!("{}/login.php?do=login", upstream.proxy.trim_end_matches('/'));
        let form = vec![
            ("vb_login_username".to_string(), upstream.username.clone()),
            ("vb_login_password".to_string(), upstream.password.clone()),
            ("cookieuser".to_string(), "1".to_string()),
            ("securitytoken".to_string(), "guest".to_string()),
            ("do".to_string(), "login".to_string()),
        ];

        let body = match transport.post_form(&url, &form, &[]).await {
            Ok(body) => body,
            Err(e) => {
                self.logout(event_bus);
                return Err(e);
            }
        };

        if body.contains(LOGIN_SUCCESS_MARKER) {
            info!(user = %upstream.username, "Logged in to upstream forum");
            self.set_user(&upstream.username);
            event_bus.publish(Event::User(upstream.username.clone()));
            Ok(())
        } else {
            warn!(user = %upstream.username, "Upstream login was rejected");
            self.logout(event_bus);
            Err(RipperError::Validation(format!(
                "login rejected for user {}",
                upstream.username
            )))
        }
    }

    pub fn logout(&self, event_bus: &EventBus) {
        *self.user.write() = None;
        event_bus.publish(Event::User(String::new()));
    }
}
