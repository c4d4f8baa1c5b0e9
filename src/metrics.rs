use std::time::Duration;
use crate::util::ema::ExponentialMovingAverage;

/// Per-connection statistics. They are purely observational, nothing in the protocol depends
///  on them.
#[derive(Clone, Debug)]
pub struct ConnectionMetrics {
    rtt_secs: ExponentialMovingAverage,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub reliable_resends: u64,
    pub notify_delivered: u64,
    pub notify_lost: u64,
}

impl ConnectionMetrics {
    pub fn new(rtt_sample_count: u32) -> ConnectionMetrics {
        ConnectionMetrics {
            rtt_secs: ExponentialMovingAverage::new(rtt_sample_count),
            packets_sent: 0,
            packets_received: 0,
            reliable_resends: 0,
            notify_delivered: 0,
            notify_lost: 0,
        }
    }

    pub fn on_rtt_sample(&mut self, rtt: Duration) {
        self.rtt_secs.add(rtt.as_secs_f64());
    }

    /// smoothed round trip time, `None` before the first ack was received
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt_secs.has_samples()
            .then(|| Duration::from_secs_f64(self.rtt_secs.mean().max(0.0)))
    }

    /// standard deviation of the round trip time
    pub fn jitter(&self) -> Option<Duration> {
        self.rtt_secs.has_samples()
            .then(|| Duration::from_secs_f64(self.rtt_secs.std_dev()))
    }

    /// fraction of resolved notify sends that were lost
    pub fn notify_loss_ratio(&self) -> f64 {
        let resolved = self.notify_delivered + self.notify_lost;
        if resolved == 0 {
            return 0.0;
        }
        self.notify_lost as f64 / resolved as f64
    }
}
