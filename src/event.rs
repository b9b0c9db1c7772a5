use std::time::Duration;

use tokio::sync::mpsc;

/// External triggers the query client reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Periodic tick for cache garbage collection
  Tick,
  /// Network connectivity changed (true = online)
  Connectivity(bool),
  /// Application visibility/focus changed (true = visible)
  Visibility(bool),
}

/// Event handler that merges a tick timer with externally reported events
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Create a new event handler with the given tick rate
  pub fn new(tick_rate: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn the ticker; it stops once the handler is dropped
    let ticker = tx.clone();
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(tick_rate);
      interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // The first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        if ticker.send(Event::Tick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Sender for connectivity and visibility reports
  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn ticks_and_reports_are_merged() {
    let mut events = EventHandler::new(Duration::from_secs(1));
    events.sender().send(Event::Connectivity(false)).unwrap();

    assert_eq!(events.next().await, Some(Event::Connectivity(false)));
    assert_eq!(events.next().await, Some(Event::Tick));

    events.sender().send(Event::Visibility(true)).unwrap();
    assert_eq!(events.next().await, Some(Event::Visibility(true)));
  }
}
