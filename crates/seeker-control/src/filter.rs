/// First-order exponential smoothing. Starts from 0 (neutral).
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f32,
    value: f32,
}

impl Ema {
    pub fn new(alpha: f32) -> Self {
        Self { alpha, value: 0.0 }
    }

    pub fn update(&mut self, raw: f32) -> f32 {
        self.value = self.alpha * raw + (1.0 - self.alpha) * self.value;
        self.value
    }

    pub fn reset(&mut self, value: f32) {
        self.value = value;
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

/// Bounds the change of a value per tick.
#[derive(Debug, Clone)]
pub struct SlewLimiter {
    max_step: f32,
    value: f32,
}

impl SlewLimiter {
    pub fn new(max_step: f32) -> Self {
        Self { max_step, value: 0.0 }
    }

    pub fn update(&mut self, target: f32) -> f32 {
        let delta = clamp(target - self.value, -self.max_step, self.max_step);
        self.value += delta;
        self.value
    }

    /// Overwrite the held output. Used after a hard clamp so the next step is
    /// measured from what was actually emitted.
    pub fn set(&mut self, value: f32) {
        self.value = value;
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

pub fn clamp(v: f32, lo: f32, hi: f32) -> f32 {
    v.max(lo).min(hi)
}

pub fn deadband(v: f32, threshold: f32) -> f32 {
    if v.abs() < threshold { 0.0 } else { v }
}
