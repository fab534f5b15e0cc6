use candle_core::Device;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Upper bound (inclusive) for seeds drawn when none is configured.
pub const MAX_RANDOM_SEED: u64 = 100_000;

/// Seeded random streams for one run.
///
/// Created once at startup and passed to whatever draws random numbers.
/// Separate instances are fully independent.
#[derive(Debug, Clone)]
pub struct Determinism {
    seed: u64,
    general: StdRng,
    array: StdRng,
}

impl Determinism {
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..=MAX_RANDOM_SEED));
        log::info!("seeding random streams with {seed}");
        Self {
            seed,
            general: StdRng::seed_from_u64(seed),
            array: StdRng::seed_from_u64(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// General-purpose stream (shuffles, splits).
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.general
    }

    /// Stream reserved for numeric array sampling.
    pub fn array_rng(&mut self) -> &mut StdRng {
        &mut self.array
    }

    /// Seeds the tensor stream of `device`. CPU devices may refuse, which is
    /// only worth a warning.
    pub fn seed_device(&self, device: &Device) {
        if let Err(err) = device.set_seed(self.seed) {
            log::warn!("could not seed device {:?}: {err}", device.location());
        }
    }

    /// Seed for a data-loading worker, reduced to 32 bits.
    pub fn worker_seed(&self, worker_id: usize) -> u64 {
        self.seed.wrapping_add(worker_id as u64) % (1u64 << 32)
    }

    pub fn worker_rng(&self, worker_id: usize) -> StdRng {
        StdRng::seed_from_u64(self.worker_seed(worker_id))
    }
}
