//! Post-commit side effects for the processing pipeline.
//!
//! Handlers return [`SideEffect`] values describing work with no correctness
//! requirement (welcome notifications, re-auth alerts). The queue manager
//! runs them only after the item's primary transaction has committed.
//!
//! Each effect is error-isolated: one failure doesn't block others, and no
//! failure ever unwinds the committed write or fails the item.

use serde::Serialize;

use crate::config::Config;

/// A fire-and-forget effect emitted by a handler.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SideEffect {
    /// Welcome a newly provisioned user; carries their one-time setup token.
    WelcomeNotification {
        tenant_id: String,
        user_id: String,
        email: String,
        setup_token: String,
    },
    /// Tell an operator a tenant's users need to re-authorize.
    ReauthRequired { tenant_id: String },
}

impl SideEffect {
    fn name(&self) -> &'static str {
        match self {
            SideEffect::WelcomeNotification { .. } => "welcome_notification",
            SideEffect::ReauthRequired { .. } => "reauth_required",
        }
    }
}

/// Result from a single side effect.
pub struct HookResult {
    pub hook_name: &'static str,
    pub success: bool,
    pub message: Option<String>,
}

/// Outbound notification channel. The real sender is an external
/// collaborator; this trait is the seam.
pub trait Notifier {
    fn send(&self, effect: &SideEffect) -> Result<(), String>;
}

/// POSTs each effect as JSON to a configured URL. Best-effort.
pub struct HttpNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl HttpNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Notifier for HttpNotifier {
    fn send(&self, effect: &SideEffect) -> Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(effect)
            .send()
            .map_err(|e| format!("send failed: {}", e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("notify endpoint returned {}", response.status()))
        }
    }
}

/// Drops every effect after logging it. Used when no notify URL is
/// configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(&self, effect: &SideEffect) -> Result<(), String> {
        log::info!("Hooks: no notify URL configured, skipping {}", effect.name());
        Ok(())
    }
}

/// Build the notifier the config asks for.
pub fn notifier_from_config(config: &Config) -> Box<dyn Notifier + Send + Sync> {
    match &config.notify_url {
        Some(url) => Box::new(HttpNotifier::new(url.clone())),
        None => Box::new(LogNotifier),
    }
}

/// Run all side effects for one committed item. Error-isolated: failures are
/// logged and reported in the results, never escalated.
pub fn run_side_effects(effects: &[SideEffect], notifier: &dyn Notifier) -> Vec<HookResult> {
    effects
        .iter()
        .map(|effect| match notifier.send(effect) {
            Ok(()) => HookResult {
                hook_name: effect.name(),
                success: true,
                message: None,
            },
            Err(e) => {
                log::warn!("Hook {}: {}", effect.name(), e);
                HookResult {
                    hook_name: effect.name(),
                    success: false,
                    message: Some(e),
                }
            }
        })
        .collect()
}
