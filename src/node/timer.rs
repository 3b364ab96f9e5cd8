use {
  rand::Rng,
  std::{
    sync::{
      atomic::{AtomicBool, Ordering},
      Arc,
    },
    time::Duration,
  },
  tokio::sync::mpsc,
};

/// Heartbeat driver for the gossip loop. A single task selecting
/// over its control channels; consumers signal through the cloneable
/// [`TimerControls`] and receive ticks on the channel returned by
/// [`ControlTimer::new`].
///
/// After every tick the timer disarms itself and waits for a reset,
/// so an idle node stops burning heartbeats until the next stimulus
/// (inbound rpc, submitted transaction, pending pool).
pub struct ControlTimer {
  base: Duration,
  set: Arc<AtomicBool>,
  tick_tx: mpsc::Sender<()>,
  reset_rx: mpsc::Receiver<()>,
  stop_rx: mpsc::Receiver<()>,
  shutdown_rx: mpsc::Receiver<()>,
}

#[derive(Clone)]
pub struct TimerControls {
  set: Arc<AtomicBool>,
  reset_tx: mpsc::Sender<()>,
  stop_tx: mpsc::Sender<()>,
  shutdown_tx: mpsc::Sender<()>,
}

impl TimerControls {
  /// True while the timer is armed and a tick is on its way.
  pub fn is_set(&self) -> bool {
    self.set.load(Ordering::SeqCst)
  }

  /// Rearms the timer. Signals coalesce; sending while armed extends
  /// nothing and is harmless.
  pub fn reset(&self) {
    let _ = self.reset_tx.try_send(());
  }

  /// Disarms the timer until the next reset.
  pub fn stop(&self) {
    let _ = self.stop_tx.try_send(());
  }

  /// Ends the timer task. Idempotent.
  pub fn shutdown(&self) {
    let _ = self.shutdown_tx.try_send(());
  }
}

impl ControlTimer {
  pub fn new(
    base: Duration,
  ) -> (Self, mpsc::Receiver<()>, TimerControls) {
    let (tick_tx, tick_rx) = mpsc::channel(1);
    let (reset_tx, reset_rx) = mpsc::channel(1);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let set = Arc::new(AtomicBool::new(false));
    (
      Self {
        base,
        set: Arc::clone(&set),
        tick_tx,
        reset_rx,
        stop_rx,
        shutdown_rx,
      },
      tick_rx,
      TimerControls {
        set,
        reset_tx,
        stop_tx,
        shutdown_tx,
      },
    )
  }

  /// Base interval plus up to one extra interval of jitter, so that
  /// a fleet started together does not tick in lockstep.
  fn random_delay(&self) -> Duration {
    if self.base.is_zero() {
      // zero base means "never fire on its own"
      return Duration::from_secs(3600 * 24 * 365);
    }
    let extra = rand::thread_rng().gen_range(0..self.base.as_millis().max(1));
    self.base + Duration::from_millis(extra as u64)
  }

  pub async fn run(mut self) {
    // armed from the start, like the first heartbeat of a node
    let mut armed = true;
    loop {
      if armed {
        self.set.store(true, Ordering::SeqCst);
        tokio::select! {
          _ = tokio::time::sleep(self.random_delay()) => {
            self.set.store(false, Ordering::SeqCst);
            if self.tick_tx.send(()).await.is_err() {
              return;
            }
            armed = false;
          }
          Some(_) = self.reset_rx.recv() => {}
          Some(_) = self.stop_rx.recv() => {
            self.set.store(false, Ordering::SeqCst);
            armed = false;
          }
          _ = self.shutdown_rx.recv() => {
            self.set.store(false, Ordering::SeqCst);
            return;
          }
        }
      } else {
        tokio::select! {
          Some(_) = self.reset_rx.recv() => {
            armed = true;
          }
          Some(_) = self.stop_rx.recv() => {}
          _ = self.shutdown_rx.recv() => {
            return;
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use {super::*, tokio::time::timeout};

  #[tokio::test]
  async fn ticks_then_waits_for_reset() {
    let (timer, mut ticks, controls) =
      ControlTimer::new(Duration::from_millis(10));
    tokio::spawn(timer.run());

    timeout(Duration::from_secs(2), ticks.recv())
      .await
      .expect("first tick arrives")
      .unwrap();

    // disarmed after the tick: no further ticks without a reset
    assert!(
      timeout(Duration::from_millis(100), ticks.recv()).await.is_err()
    );

    controls.reset();
    timeout(Duration::from_secs(2), ticks.recv())
      .await
      .expect("tick after reset")
      .unwrap();

    controls.shutdown();
  }

  #[tokio::test]
  async fn stop_disarms_a_pending_tick() {
    let (timer, mut ticks, controls) =
      ControlTimer::new(Duration::from_millis(200));
    tokio::spawn(timer.run());

    controls.stop();
    assert!(
      timeout(Duration::from_millis(500), ticks.recv()).await.is_err()
    );
    assert!(!controls.is_set());

    controls.shutdown();
    // shutting down twice is fine
    controls.shutdown();
  }
}
