/// Running sum of per-batch losses for one split pass.
#[derive(Debug, Clone, Default)]
pub struct LossAccumulator {
    total: f64,
    batches: usize,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: f64) {
        self.total += loss;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Arithmetic mean, or `None` when no batch was seen.
    pub fn mean(&self) -> Option<f64> {
        if self.batches == 0 {
            None
        } else {
            Some(self.total / self.batches as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_updates() {
        let mut acc = LossAccumulator::new();
        assert_eq!(acc.mean(), None);
        for loss in [1.0, 2.0, 6.0] {
            acc.update(loss);
        }
        assert_eq!(acc.batches(), 3);
        assert_eq!(acc.mean(), Some(3.0));
    }
}
