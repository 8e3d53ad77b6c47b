//! Global-norm gradient clipping.

use crate::model::GradientContext;

/// Rescale all gradients so their joint L2 norm is at most `max_norm`.
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(ctx: &mut dyn GradientContext, max_norm: f64) -> f64 {
    let ids = ctx.parameter_ids();

    let mut sum_sq = 0.0f64;
    for &id in &ids {
        if let Some(slot) = ctx.slot_mut(id) {
            sum_sq += slot
                .grad
                .iter()
                .map(|&g| f64::from(g) * f64::from(g))
                .sum::<f64>();
        }
    }
    let total_norm = sum_sq.sqrt();

    let scale = (max_norm / total_norm.max(max_norm)) as f32;
    if scale < 1.0 {
        for &id in &ids {
            if let Some(slot) = ctx.slot_mut(id) {
                slot.grad.iter_mut().for_each(|g| *g *= scale);
            }
        }
    }
    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParamId, ParamSlot};

    struct Grads {
        values: Vec<Vec<f32>>,
        grads: Vec<Vec<f32>>,
    }

    impl GradientContext for Grads {
        fn parameter_ids(&self) -> Vec<ParamId> {
            (0..self.grads.len()).map(ParamId).collect()
        }

        fn slot_mut(&mut self, id: ParamId) -> Option<ParamSlot<'_>> {
            Some(ParamSlot {
                value: self.values.get_mut(id.0)?,
                grad: self.grads.get_mut(id.0)?,
            })
        }
    }

    #[test]
    fn test_large_gradients_scaled_to_max_norm() {
        let mut ctx = Grads {
            values: vec![vec![0.0, 0.0], vec![0.0]],
            grads: vec![vec![30.0, 0.0], vec![40.0]],
        };
        let norm = clip_grad_norm(&mut ctx, 10.0);
        assert_eq!(norm, 50.0);
        assert!((ctx.grads[0][0] - 6.0).abs() < 1e-5);
        assert!((ctx.grads[1][0] - 8.0).abs() < 1e-5);
    }

    #[test]
    fn test_small_gradients_untouched() {
        let mut ctx = Grads {
            values: vec![vec![0.0]],
            grads: vec![vec![3.0]],
        };
        let norm = clip_grad_norm(&mut ctx, 10.0);
        assert_eq!(norm, 3.0);
        assert_eq!(ctx.grads[0], vec![3.0]);
    }
}
