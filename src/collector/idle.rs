use std::time::{Duration, Instant};

/// Escalating reassurance thresholds for quiet stretches. Each message is
/// announced once per quiet stretch; any activity resets the ladder.
const IDLE_STEPS: [(Duration, &str); 4] = [
    (Duration::from_secs(20), "Hang in there, still building!"),
    (
        Duration::from_secs(60),
        "Still building, thanks for your patience!",
    ),
    (Duration::from_secs(120), "Almost there, please hold on!"),
    (
        Duration::from_secs(180),
        "Thank you for waiting, we're nearly done!",
    ),
];

/// Tracks how long the session has gone without a record and which
/// reassurance messages are due. Time is passed in explicitly so the
/// ladder can be tested without sleeping.
#[derive(Debug)]
pub struct IdleTracker {
    last_activity: Instant,
    announced: usize,
}

impl IdleTracker {
    pub fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            announced: 0,
        }
    }

    /// Records arrived; restart the quiet stretch.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
        self.announced = 0;
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Returns the next unannounced message whose threshold has passed,
    /// or `None` if nothing new is due.
    pub fn poll(&mut self, now: Instant) -> Option<&'static str> {
        let idle = self.idle_for(now);
        let level = IDLE_STEPS
            .iter()
            .take_while(|(threshold, _)| idle >= *threshold)
            .count();

        if level > self.announced {
            self.announced = level;
            Some(IDLE_STEPS[level - 1].1)
        } else {
            None
        }
    }
}
