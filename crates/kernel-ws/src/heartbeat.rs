//! Virtual heartbeat channel built on WebSocket ping/pong.
//!
//! The client pings every `time_to_dead`. Any inbound frame counts as a
//! beat. Once nothing has arrived for more than `2 * time_to_dead` the
//! kernel is reported dead, once, and the socket is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::channel::Transport;
use crate::client::ClientEvent;

pub const DEFAULT_TIME_TO_DEAD: Duration = Duration::from_secs(1);

/// Liveness bookkeeping, kept free of I/O so it can be driven by any clock.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    time_to_dead: Duration,
    last_beat: Instant,
    paused: bool,
    fired: bool,
}

impl HeartbeatMonitor {
    pub fn new(time_to_dead: Duration, now: Instant) -> Self {
        Self {
            time_to_dead,
            last_beat: now,
            paused: false,
            fired: false,
        }
    }

    pub fn time_to_dead(&self) -> Duration {
        self.time_to_dead
    }

    pub fn beat(&mut self, now: Instant) {
        self.last_beat = now;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume checking. Time spent paused does not count against the kernel.
    pub fn unpause(&mut self, now: Instant) {
        self.paused = false;
        self.last_beat = now;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Allow a new death report, e.g. after the kernel announced a restart.
    pub fn rearm(&mut self, now: Instant) {
        self.fired = false;
        self.last_beat = now;
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Returns the silence duration the first time the kernel is found dead.
    pub fn check(&mut self, now: Instant) -> Option<Duration> {
        if self.paused || self.fired {
            return None;
        }
        let silence = now.saturating_duration_since(self.last_beat);
        if silence > self.time_to_dead * 2 {
            self.fired = true;
            Some(silence)
        } else {
            None
        }
    }
}

/// The heartbeat "channel" of a kernel client.
pub struct HeartbeatChannel {
    monitor: Arc<Mutex<HeartbeatMonitor>>,
    transport: Arc<Transport>,
    task: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl HeartbeatChannel {
    pub(crate) fn new(time_to_dead: Duration, transport: Arc<Transport>) -> Self {
        Self {
            monitor: Arc::new(Mutex::new(HeartbeatMonitor::new(
                time_to_dead,
                Instant::now(),
            ))),
            transport,
            task: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    fn with_monitor<T>(&self, f: impl FnOnce(&mut HeartbeatMonitor) -> T) -> T {
        let mut guard = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub(crate) fn start(&self, events: broadcast::Sender<ClientEvent>) {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let time_to_dead = self.with_monitor(|m| {
            m.rearm(Instant::now());
            m.time_to_dead()
        });
        let monitor = self.monitor.clone();
        let transport = self.transport.clone();
        let running = self.running.clone();
        running.store(true, Ordering::SeqCst);

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(time_to_dead);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let verdict = {
                    let mut m = monitor.lock().unwrap_or_else(|e| e.into_inner());
                    if m.is_paused() {
                        continue;
                    }
                    m.check(Instant::now())
                };
                if let Some(silence) = verdict {
                    warn!(
                        "[kernel-ws] No heartbeat for {:.2}s, kernel presumed dead",
                        silence.as_secs_f64()
                    );
                    let _ = events.send(ClientEvent::KernelDied {
                        since_last_beat: silence,
                    });
                    transport.close(CloseCode::Away, "heartbeat lost");
                    break;
                }
                if transport.send_raw(WsMessage::Ping(Vec::new())).is_err() {
                    debug!("[kernel-ws] Heartbeat stopping, socket gone");
                    break;
                }
            }
            running.store(false, Ordering::SeqCst);
        }));
    }

    pub(crate) fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Record a sign of life from the kernel.
    pub fn beat(&self) {
        self.with_monitor(|m| m.beat(Instant::now()));
    }

    /// Re-arm the death check, used when the kernel reports a restart.
    pub fn rearm(&self) {
        self.with_monitor(|m| m.rearm(Instant::now()));
    }

    pub fn pause(&self) {
        self.with_monitor(|m| m.pause());
    }

    pub fn unpause(&self) {
        self.with_monitor(|m| m.unpause(Instant::now()));
    }

    pub fn is_paused(&self) -> bool {
        self.with_monitor(|m| m.is_paused())
    }

    /// Whether the ping task is running.
    pub fn is_beating(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.is_paused()
    }

    /// Reports the WebSocket's open state.
    pub fn is_alive(&self) -> bool {
        self.transport.is_open()
    }

    pub fn time_to_dead(&self) -> Duration {
        self.with_monitor(|m| m.time_to_dead())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTD: Duration = Duration::from_secs(1);

    #[test]
    fn test_alive_within_window() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(TTD, start);
        assert_eq!(monitor.check(start + Duration::from_millis(1500)), None);
        assert_eq!(monitor.check(start + Duration::from_secs(2)), None);
    }

    #[test]
    fn test_fires_exactly_once() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(TTD, start);
        let late = start + Duration::from_millis(2100);

        assert_eq!(monitor.check(late), Some(Duration::from_millis(2100)));
        assert_eq!(monitor.check(late + TTD), None);

        // Pongs resuming does not produce a second report.
        monitor.beat(late + TTD);
        assert_eq!(monitor.check(late + TTD * 5), None);
        assert!(monitor.has_fired());
    }

    #[test]
    fn test_beat_postpones_death() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(TTD, start);
        monitor.beat(start + Duration::from_millis(1900));
        assert_eq!(monitor.check(start + Duration::from_millis(3000)), None);
    }

    #[test]
    fn test_pause_suppresses_and_unpause_resets() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(TTD, start);
        monitor.pause();
        assert_eq!(monitor.check(start + TTD * 10), None);

        monitor.unpause(start + TTD * 10);
        assert_eq!(monitor.check(start + TTD * 11), None);
        assert!(monitor.check(start + TTD * 13).is_some());
    }

    #[test]
    fn test_rearm_allows_new_report() {
        let start = Instant::now();
        let mut monitor = HeartbeatMonitor::new(TTD, start);
        assert!(monitor.check(start + TTD * 3).is_some());

        monitor.rearm(start + TTD * 3);
        assert!(!monitor.has_fired());
        assert!(monitor.check(start + TTD * 6).is_some());
    }
}
