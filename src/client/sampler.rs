use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Simulated sensor: a bounded random walk that mostly drifts, sometimes
///  steps sharply (exercising deltas near the encoding limit) and rarely
///  re-bases entirely (exercising keyframe recovery). Seeded, so a test run
///  with a fixed seed produces the identical value stream every time.
pub struct Sampler {
    rng: StdRng,
    current: f64,
}

impl Sampler {
    pub fn new(seed: u64) -> Sampler {
        Sampler {
            rng: StdRng::seed_from_u64(seed),
            current: 500.0,
        }
    }

    pub fn next_sample(&mut self) -> i16 {
        self.current += self.rng.gen_range(-3.0..=3.0);
        if self.rng.gen_bool(0.1) {
            self.current += self.rng.gen_range(-40.0..=40.0);
        }
        if self.rng.gen_bool(0.02) {
            self.current = self.rng.gen_range(200.0..=800.0);
        }

        self.current = self.current.clamp(i16::MIN as f64, i16::MAX as f64);
        self.current.round() as i16
    }
}
