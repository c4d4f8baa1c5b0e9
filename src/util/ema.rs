/// Exponential moving average over roughly the last `n` samples, tracking both mean and
///  variance. New samples have a weight of `alpha = 2 / (n + 1)`.
#[derive(Clone, Debug)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    initialized: bool,
    value: f64,
    variance: f64,
}

impl ExponentialMovingAverage {
    pub fn new(n: u32) -> ExponentialMovingAverage {
        ExponentialMovingAverage {
            alpha: 2.0 / (n as f64 + 1.0),
            initialized: false,
            value: 0.0,
            variance: 0.0,
        }
    }

    pub fn add(&mut self, sample: f64) {
        if !self.initialized {
            self.value = sample;
            self.variance = 0.0;
            self.initialized = true;
            return;
        }

        let delta = sample - self.value;
        self.value += self.alpha * delta;
        self.variance = (1.0 - self.alpha) * (self.variance + self.alpha * delta * delta);
    }

    pub fn has_samples(&self) -> bool {
        self.initialized
    }

    pub fn mean(&self) -> f64 {
        self.value
    }

    pub fn variance(&self) -> f64 {
        self.variance
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}
