//! Configuration broadcast for hot-reloading.
//!
//! Gate decisions read the receiver at decision time, so an operator can
//! dial `action_policy` down to `notify_only` without draining in-flight
//! work.

use crate::config::Config;
use std::sync::Arc;
use tokio::sync::watch;

/// Broadcasts configuration updates to every pipeline stage.
pub struct ConfigBroadcaster {
    sender: watch::Sender<Arc<Config>>,
    current: Arc<Config>,
}

impl ConfigBroadcaster {
    /// Create a broadcaster with the initial configuration.
    pub fn new(config: Config) -> (Self, watch::Receiver<Arc<Config>>) {
        let config = Arc::new(config);
        let (sender, receiver) = watch::channel(Arc::clone(&config));

        let broadcaster = Self {
            sender,
            current: config,
        };

        (broadcaster, receiver)
    }

    /// Update the configuration and broadcast to all receivers.
    pub fn update(&mut self, config: Config) -> Result<(), watch::error::SendError<Arc<Config>>> {
        let config = Arc::new(config);
        self.current = Arc::clone(&config);
        self.sender.send(config)
    }

    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.current)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ActionPolicy;

    #[test]
    fn test_broadcaster_creation() {
        let (broadcaster, _receiver) = ConfigBroadcaster::new(Config::default());
        assert_eq!(broadcaster.receiver_count(), 1);
    }

    #[tokio::test]
    async fn test_update_reaches_receiver() {
        let (mut broadcaster, mut receiver) = ConfigBroadcaster::new(Config::default());
        assert_eq!(
            receiver.borrow().triage.action_policy,
            ActionPolicy::Full
        );

        let mut new_config = Config::default();
        new_config.triage.action_policy = ActionPolicy::NotifyOnly;
        broadcaster.update(new_config).unwrap();

        receiver.changed().await.unwrap();
        assert_eq!(
            receiver.borrow().triage.action_policy,
            ActionPolicy::NotifyOnly
        );
    }

    #[test]
    fn test_borrow_sees_latest_without_awaiting() {
        let (mut broadcaster, receiver) = ConfigBroadcaster::new(Config::default());

        let mut new_config = Config::default();
        new_config.triage.action_policy = ActionPolicy::Off;
        broadcaster.update(new_config).unwrap();

        // Decision-time reads must observe the flip immediately.
        assert_eq!(receiver.borrow().triage.action_policy, ActionPolicy::Off);
    }
}
