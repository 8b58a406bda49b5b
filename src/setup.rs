//! Interactive guild setup dialog.
//!
//! The original flow is a four-question conversation with the invoking
//! admin. It is modeled as an explicit state machine: each step has a reply
//! deadline, and invalid input or a missed deadline aborts the dialog with a
//! reason instead of retrying.

use crate::store::guilds::{parse_hhmm, GuildConfig, OperatingHours};
use crate::{ChannelId, UserId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// The question currently awaiting an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    AwaitingDescription,
    AwaitingTime,
    AwaitingInstructions,
    AwaitingHours,
}

/// Result of feeding one reply (or a timeout) into the dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Move on to the next question.
    Continue,
    /// All steps answered; persist this configuration.
    Complete(GuildConfig),
    /// The dialog is over without a configuration.
    Aborted(String),
}

#[derive(Debug, Default)]
struct Draft {
    description: String,
    timezone: String,
    special_instructions: String,
    operating_hours: Option<OperatingHours>,
}

/// Multi-step setup conversation state.
#[derive(Debug)]
pub struct SetupDialog {
    step: SetupStep,
    draft: Draft,
}

impl SetupDialog {
    pub fn new() -> Self {
        Self { step: SetupStep::AwaitingDescription, draft: Draft::default() }
    }

    pub fn step(&self) -> SetupStep {
        self.step
    }

    /// The question to ask for the current step.
    pub fn prompt(&self) -> &'static str {
        match self.step {
            SetupStep::AwaitingDescription => {
                "Let's configure Hearth! First, describe the bot's function and personality \
                 (e.g. programmer, gamer friend, science expert):"
            }
            SetupStep::AwaitingTime => {
                "Please enter the current time in your location as `HH:MM` (24-hour format). \
                 For example, `14:30` for 2:30 PM."
            }
            SetupStep::AwaitingInstructions => {
                "Please provide any special instructions. If none, type `none`."
            }
            SetupStep::AwaitingHours => {
                "Please specify the operating hours as `HH:MM-HH:MM` (24-hour format, local \
                 time). For example, `09:00-17:00`."
            }
        }
    }

    /// How long to wait for a reply to the current step.
    pub fn step_timeout(&self) -> Duration {
        match self.step {
            SetupStep::AwaitingDescription | SetupStep::AwaitingInstructions => {
                Duration::from_secs(300)
            }
            SetupStep::AwaitingTime | SetupStep::AwaitingHours => Duration::from_secs(120),
        }
    }

    /// Feed one reply into the dialog and transition.
    pub fn advance(&mut self, input: &str) -> SetupOutcome {
        let input = input.trim();
        match self.step {
            SetupStep::AwaitingDescription => {
                self.draft.description = input.to_owned();
                self.step = SetupStep::AwaitingTime;
                SetupOutcome::Continue
            }
            SetupStep::AwaitingTime => {
                if parse_hhmm(input).is_err() {
                    return SetupOutcome::Aborted(
                        "Invalid time format. Please use `HH:MM` in 24-hour format. \
                         Configuration aborted."
                            .into(),
                    );
                }
                // The entered time is only used to label the guild's zone;
                // no real conversion happens anywhere.
                self.draft.timezone = "Local Time".into();
                self.step = SetupStep::AwaitingInstructions;
                SetupOutcome::Continue
            }
            SetupStep::AwaitingInstructions => {
                self.draft.special_instructions = input.to_owned();
                self.step = SetupStep::AwaitingHours;
                SetupOutcome::Continue
            }
            SetupStep::AwaitingHours => match OperatingHours::parse(input) {
                Ok(hours) => {
                    self.draft.operating_hours = Some(hours);
                    SetupOutcome::Complete(GuildConfig {
                        description: self.draft.description.clone(),
                        timezone: self.draft.timezone.clone(),
                        special_instructions: self.draft.special_instructions.clone(),
                        operating_hours: self.draft.operating_hours,
                        personality: self.draft.description.clone(),
                    })
                }
                Err(_) => SetupOutcome::Aborted(
                    "Invalid time format for operating hours. Please use `HH:MM-HH:MM` in \
                     24-hour format. Configuration aborted."
                        .into(),
                ),
            },
        }
    }

    /// Outcome for a missed reply deadline.
    pub fn timed_out(&self) -> SetupOutcome {
        SetupOutcome::Aborted("Configuration timed out. Please try again later.".into())
    }
}

impl Default for SetupDialog {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes replies from the initiating user into the active dialog.
///
/// While a dialog runs for `(channel, user)`, that user's messages in the
/// channel are diverted here instead of the normal message path.
pub struct DialogRouter {
    pending: Mutex<HashMap<(ChannelId, UserId), mpsc::Sender<String>>>,
}

impl DialogRouter {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()) }
    }

    /// Register a dialog and get the reply stream. An existing dialog for the
    /// same key is replaced (its receiver closes).
    pub fn begin(&self, channel_id: ChannelId, user_id: UserId) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(8);
        self.pending
            .lock()
            .expect("dialog router lock poisoned")
            .insert((channel_id, user_id), tx);
        rx
    }

    pub fn end(&self, channel_id: ChannelId, user_id: UserId) {
        self.pending
            .lock()
            .expect("dialog router lock poisoned")
            .remove(&(channel_id, user_id));
    }

    /// Divert a message into a pending dialog. Returns true if consumed.
    pub async fn route(&self, channel_id: ChannelId, user_id: UserId, content: &str) -> bool {
        let sender = {
            let pending = self.pending.lock().expect("dialog router lock poisoned");
            pending.get(&(channel_id, user_id)).cloned()
        };
        match sender {
            Some(sender) => sender.send(content.to_owned()).await.is_ok(),
            None => false,
        }
    }
}

impl Default for DialogRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_walkthrough_completes_with_config() {
        let mut dialog = SetupDialog::new();
        assert_eq!(dialog.step(), SetupStep::AwaitingDescription);

        assert_eq!(dialog.advance("gamer friend"), SetupOutcome::Continue);
        assert_eq!(dialog.step(), SetupStep::AwaitingTime);

        assert_eq!(dialog.advance("14:30"), SetupOutcome::Continue);
        assert_eq!(dialog.advance("be kind"), SetupOutcome::Continue);

        match dialog.advance("09:00-17:00") {
            SetupOutcome::Complete(config) => {
                assert_eq!(config.description, "gamer friend");
                assert_eq!(config.personality, "gamer friend");
                assert_eq!(config.timezone, "Local Time");
                assert_eq!(config.special_instructions, "be kind");
                assert_eq!(
                    config.operating_hours.unwrap().to_string(),
                    "09:00-17:00"
                );
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn invalid_time_aborts() {
        let mut dialog = SetupDialog::new();
        dialog.advance("helper");
        assert!(matches!(dialog.advance("2pm"), SetupOutcome::Aborted(_)));
    }

    #[test]
    fn invalid_hours_aborts() {
        let mut dialog = SetupDialog::new();
        dialog.advance("helper");
        dialog.advance("14:30");
        dialog.advance("none");
        assert!(matches!(
            dialog.advance("9am to 5pm"),
            SetupOutcome::Aborted(_)
        ));
    }

    #[test]
    fn step_timeouts_match_dialog_design() {
        let mut dialog = SetupDialog::new();
        assert_eq!(dialog.step_timeout(), Duration::from_secs(300));
        dialog.advance("helper");
        assert_eq!(dialog.step_timeout(), Duration::from_secs(120));
    }

    #[tokio::test]
    async fn router_only_diverts_registered_user() {
        let router = DialogRouter::new();
        let mut rx = router.begin(10, 7);

        assert!(router.route(10, 7, "hello").await);
        assert!(!router.route(10, 8, "other user").await);
        assert!(!router.route(11, 7, "other channel").await);
        assert_eq!(rx.recv().await.unwrap(), "hello");

        router.end(10, 7);
        assert!(!router.route(10, 7, "after end").await);
    }
}
