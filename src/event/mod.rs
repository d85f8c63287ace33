//! Device events and their fan-out to subscribers
//!
//! An [`EventTarget`] broadcasts [`Event`]s to every live [`Subscription`].
//! A target can carry a [`Refresher`]: it runs while at least one
//! subscription exists.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::warn;

use crate::core::{DeviceId, Error, Result};
use crate::device::capability::{LightState, PowerState};
use crate::device::refresh::Refresher;
use crate::device::Device;

/// Capacity of each target's broadcast channel
const EVENT_CAPACITY: usize = 64;

/// Notification published by the protocol or a device
#[derive(Debug, Clone)]
pub enum Event {
    /// A device was discovered and classified
    NewDevice(Arc<dyn Device>),
    /// A device answered discovery but withheld its token
    NewMaskedDevice(DeviceId),
    /// A device went silent for longer than the expiry window
    ExpiredDevice(Arc<dyn Device>),
    /// Light properties changed
    UpdateLight(LightState),
    /// Power state changed
    UpdatePower(PowerState),
}

/// Anything events can be published to
pub trait Publisher: Send + Sync {
    fn publish(&self, event: Event) -> Result<()>;
}

struct Shared {
    tx: Mutex<Option<broadcast::Sender<Event>>>,
    subscribers: Mutex<usize>,
    refresher: Mutex<Option<Arc<Refresher>>>,
}

/// Broadcast fan-out with subscriber counting
#[derive(Clone)]
pub struct EventTarget {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTarget")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for EventTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTarget {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        EventTarget {
            shared: Arc::new(Shared {
                tx: Mutex::new(Some(tx)),
                subscribers: Mutex::new(0),
                refresher: Mutex::new(None),
            }),
        }
    }

    /// Ties `refresher` to the subscriber count
    pub fn attach_refresher(&self, refresher: Arc<Refresher>) {
        if *self.shared.subscribers.lock() > 0 {
            refresher.start();
        }
        if let Some(previous) = self.shared.refresher.lock().replace(refresher) {
            previous.stop();
        }
    }

    /// Opens a new subscription; the first one starts the refresher
    pub fn subscribe(&self) -> Result<Subscription> {
        let rx = match self.shared.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => return Err(Error::closed("Event target is closed")),
        };

        let mut count = self.shared.subscribers.lock();
        *count += 1;
        if *count == 1 {
            if let Some(refresher) = self.shared.refresher.lock().as_ref() {
                refresher.start();
            }
        }

        Ok(Subscription {
            rx,
            shared: self.shared.clone(),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        *self.shared.subscribers.lock()
    }

    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.tx.lock().is_none()
    }

    /// Ends every subscription and stops the refresher
    pub fn close(&self) {
        self.shared.tx.lock().take();
        if let Some(refresher) = self.shared.refresher.lock().take() {
            refresher.stop();
        }
    }
}

impl Publisher for EventTarget {
    fn publish(&self, event: Event) -> Result<()> {
        match self.shared.tx.lock().as_ref() {
            // Sending only fails when nobody is listening.
            Some(tx) => {
                let _ = tx.send(event);
                Ok(())
            }
            None => Err(Error::publish("Event target is closed")),
        }
    }
}

/// Receive handle for events of one target
pub struct Subscription {
    rx: broadcast::Receiver<Event>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// Next event, or `None` once the target is closed
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Subscriber lagged behind, {} events were dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next already queued event, without waiting
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut count = self.shared.subscribers.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            if let Some(refresher) = self.shared.refresher.lock().as_ref() {
                refresher.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let target = EventTarget::new();
        let mut a = target.subscribe().unwrap();
        let mut b = target.subscribe().unwrap();

        target.publish(Event::NewMaskedDevice(DeviceId(7))).unwrap();

        for sub in [&mut a, &mut b] {
            match sub.recv().await {
                Some(Event::NewMaskedDevice(id)) => assert_eq!(id, DeviceId(7)),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let target = EventTarget::new();
        assert!(target.publish(Event::UpdatePower(PowerState::On)).is_ok());
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let target = EventTarget::new();
        let mut sub = target.subscribe().unwrap();

        target.close();

        assert!(sub.recv().await.is_none());
        assert!(target.subscribe().is_err());
        assert!(matches!(
            target.publish(Event::UpdatePower(PowerState::Off)),
            Err(Error::Publish(_))
        ));
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let target = EventTarget::new();
        let a = target.subscribe().unwrap();
        let b = target.subscribe().unwrap();
        assert_eq!(target.subscriber_count(), 2);
        drop(a);
        assert!(target.has_subscribers());
        drop(b);
        assert!(!target.has_subscribers());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher_follows_subscribers() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let refresher = Arc::new(Refresher::new(Duration::from_secs(5), {
            let ticks = ticks.clone();
            move || {
                let ticks = ticks.clone();
                async move {
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));

        let target = EventTarget::new();
        target.attach_refresher(refresher.clone());
        assert!(!refresher.is_running());

        let first = target.subscribe().unwrap();
        let second = target.subscribe().unwrap();
        assert!(refresher.is_running());

        drop(first);
        assert!(refresher.is_running());

        drop(second);
        assert!(!refresher.is_running());
    }
}
