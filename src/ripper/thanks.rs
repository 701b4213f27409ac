//! Leaves a "thanks" on a post once it is added, when the user opted in

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::ripper::auth::AuthContext;
use crate::ripper::config_loader::SettingsManager;
use crate::ripper::data_service::DataService;
use crate::ripper::error::{RipperResult, error_chain};
use crate::ripper::models::{LogEventKind, LogEventStatus, Post};
use crate::ripper::transport::Transport;

pub struct ThanksService {
    transport: Arc<dyn Transport>,
    auth: Arc<AuthContext>,
    settings: Arc<SettingsManager>,
    data: Arc<DataService>,
}

impl ThanksService {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<AuthContext>,
        settings: Arc<SettingsManager>,
        data: Arc<DataService>,
    ) -> Self {
        Self {
            transport,
            auth,
            settings,
            data,
        }
    }

    /// Thank the author of `post`; returns whether a request was sent.
    /// Failures are recorded and never propagated to the caller.
    pub async fn leave_thanks(&self, post: &Post) -> bool {
        let upstream = self.settings.settings().upstream;
        if !upstream.leave_thanks || !self.auth.is_logged_in() || post.thanked {
            debug!(post_id = %post.post_id, "Skipping thanks");
            return false;
        }

        let url = format!("{}/post_thanks.php", upstream.proxy.trim_end_matches('/'));
        let form = vec![
            ("do".to_string(), "post_thanks_add".to_string()),
            ("using_ajax".to_string(), "1".to_string()),
            ("p".to_string(), post.post_id.clone()),
            ("securitytoken".to_string(), post.submitter.clone()),
        ];

        info!("Posting {}", url);
        let outcome = match self.transport.post_form(&url, &form, &[]).await {
            Ok(_) => self.record_success(post),
            Err(e) => {
                warn!(post_id = %post.post_id, "Failed to leave a thanks: {}", e);
                self.record_failure(post, &error_chain(&e))
            }
        };
        if let Err(e) = outcome {
            warn!(post_id = %post.post_id, "Failed to record thanks result: {}", e);
        }
        true
    }

    fn record_success(&self, post: &Post) -> RipperResult<()> {
        self.data.update_thanked(&post.post_id, true)?;
        self.data.new_log_event(
            LogEventKind::Thanks,
            LogEventStatus::Done,
            format!("Left a thanks on {}", post.url),
        )?;
        Ok(())
    }

    fn record_failure(&self, post: &Post, cause: &str) -> RipperResult<()> {
        self.data.new_log_event(
            LogEventKind::Thanks,
            LogEventStatus::Error,
            format!("Failed to leave a thanks on {}\n{}", post.url, cause),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ripper::config_loader::Settings;
    use crate::ripper::event_bus::EventBus;
    use crate::ripper::store::MemoryStore;
    use crate::ripper::tests::{FakeTransport, post};

    const PROXY: &str = "https://forum.example";

    fn service(transport: Arc<FakeTransport>, logged_in: bool) -> (ThanksService, Arc<DataService>) {
        let bus = EventBus::new();
        let mut settings = Settings::default();
        settings.upstream.proxy = PROXY.to_string();
        settings.upstream.leave_thanks = true;
        let settings = Arc::new(SettingsManager::in_memory(settings, bus.clone()));
        let data = Arc::new(DataService::new(Arc::new(MemoryStore::new()), bus, settings.clone()));
        let auth = Arc::new(AuthContext::anonymous());
        if logged_in {
            auth.set_user("tester");
        }
        (ThanksService::new(transport, auth, settings, data.clone()), data)
    }

    #[tokio::test]
    async fn test_thanks_sets_flag_when_logged_in() {
        let transport = Arc::new(FakeTransport::new());
        transport.add_form_response(&format!("{}/post_thanks.php", PROXY), "ok");
        let (service, data) = service(transport.clone(), true);
        let (stored, _) = data.new_post(&post("12", 0), &[]).unwrap();

        assert!(service.leave_thanks(&stored).await);
        assert!(data.find_post("12").unwrap().unwrap().thanked);
        assert_eq!(transport.form_posts(&format!("{}/post_thanks.php", PROXY)), 1);
    }

    #[tokio::test]
    async fn test_thanks_skipped_when_anonymous() {
        let transport = Arc::new(FakeTransport::new());
        let (service, data) = service(transport.clone(), false);
        let (stored, _) = data.new_post(&post("12", 0), &[]).unwrap();

        assert!(!service.leave_thanks(&stored).await);
        assert_eq!(transport.form_posts(&format!("{}/post_thanks.php", PROXY)), 0);
    }

    #[tokio::test]
    async fn test_thanks_failure_is_recorded_not_raised() {
        let transport = Arc::new(FakeTransport::new());
        let (service, data) = service(transport, true);
        let (stored, _) = data.new_post(&post("12", 0), &[]).unwrap();

        assert!(service.leave_thanks(&stored).await);
        assert!(!data.find_post("12").unwrap().unwrap().thanked);
        let logs = data.log_events().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, LogEventStatus::Error);
    }
}
