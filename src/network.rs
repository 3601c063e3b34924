//! Network availability signal.
//!
//! The platform layer owns a [`NetworkSwitch`] and flips it as connectivity
//! changes; the engine reads the matching [`NetworkMonitor`].

use tokio::sync::watch;

/// Create a linked switch and monitor.
#[must_use]
pub fn network_channel(online: bool) -> (NetworkSwitch, NetworkMonitor) {
    let (tx, rx) = watch::channel(online);
    (NetworkSwitch { tx }, NetworkMonitor { rx })
}

/// Writer side of the availability signal.
#[derive(Debug)]
pub struct NetworkSwitch {
    tx: watch::Sender<bool>,
}

impl NetworkSwitch {
    /// Publish the current availability. Repeating the same value wakes no
    /// one.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    #[must_use]
    pub fn monitor(&self) -> NetworkMonitor {
        NetworkMonitor {
            rx: self.tx.subscribe(),
        }
    }
}

/// Reader side of the availability signal.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    rx: watch::Receiver<bool>,
}

impl NetworkMonitor {
    /// A monitor that is permanently online or offline.
    #[must_use]
    pub fn fixed(online: bool) -> Self {
        let (tx, rx) = watch::channel(online);
        // Keep the value readable after the sender is gone.
        drop(tx);
        Self { rx }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the network goes from offline to online. Returns `false`
    /// if the switch was dropped.
    pub async fn came_online(&mut self) -> bool {
        loop {
            if self.rx.changed().await.is_err() {
                return false;
            }
            if *self.rx.borrow_and_update() {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_switch_updates_monitor() {
        let (switch, monitor) = network_channel(false);
        assert!(!monitor.is_online());
        switch.set_online(true);
        assert!(monitor.is_online());
    }

    #[test]
    fn test_fixed_monitor() {
        assert!(NetworkMonitor::fixed(true).is_online());
        assert!(!NetworkMonitor::fixed(false).is_online());
    }

    #[tokio::test]
    async fn test_came_online_waits_for_true() {
        let (switch, mut monitor) = network_channel(false);

        let waiter = tokio::spawn(async move { monitor.came_online().await });
        switch.set_online(false);
        tokio::time::sleep(Duration::from_millis(10)).await;
        switch.set_online(true);

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_came_online_returns_false_when_switch_dropped() {
        let (switch, mut monitor) = network_channel(true);
        drop(switch);
        assert!(!monitor.came_online().await);
    }
}
