//! Property-based tests for the schedule, grouping and iteration accounting.

use proptest::prelude::*;
use tempfile::TempDir;

use trainval_core::model::{NamedParameter, ParamId};
use trainval_core::params::{GroupKind, ParameterGroup, ParameterGroupPolicy};
use trainval_core::synthetic::{SyntheticDetector, SyntheticScorer, synthetic_split};
use trainval_core::{
    Collaborators, InMemoryProducer, LearningRateSchedule, Sgd, Termination, TrainingConfig,
    TrainingLoopController,
};

fn groups(lr: f64, bias_multiplier: f64) -> Vec<ParameterGroup> {
    vec![
        ParameterGroup {
            kind: GroupKind::Weight,
            parameters: vec![ParamId(0)],
            base_learning_rate: lr,
            weight_decay: 5e-4,
        },
        ParameterGroup {
            kind: GroupKind::Bias,
            parameters: vec![ParamId(1)],
            base_learning_rate: lr * bias_multiplier,
            weight_decay: 0.0,
        },
    ]
}

// --- Learning-rate schedule ---

proptest! {
    #[test]
    fn decay_fires_iff_divisible(decay_step in 0u64..1000, iteration in 1u64..100_000) {
        let schedule = LearningRateSchedule::new(decay_step, 0.1);
        prop_assert_eq!(
            schedule.should_decay(iteration),
            iteration % (decay_step + 1) == 0
        );
    }

    #[test]
    fn decay_preserves_bias_ratio(
        lr in 1e-6f64..1.0,
        gamma in 0.5f64..1.0,
        double_bias in any::<bool>(),
        decay_step in 0u64..20,
        iterations in 1u64..60,
    ) {
        let multiplier = if double_bias { 2.0 } else { 1.0 };
        let schedule = LearningRateSchedule::new(decay_step, gamma);
        let mut g = groups(lr, multiplier);
        let mut fired = 0i32;
        for it in 1..=iterations {
            if schedule.apply(it, &mut g) {
                fired += 1;
            }
        }
        prop_assert_eq!(fired as u64, iterations / (decay_step + 1));
        let expected = lr * gamma.powi(fired);
        prop_assert!((g[0].base_learning_rate - expected).abs() <= expected * 1e-9);
        let ratio = g[1].base_learning_rate / g[0].base_learning_rate;
        prop_assert!((ratio - multiplier).abs() < 1e-9);
    }

    #[test]
    fn decay_step_never_overflows(iteration in any::<u64>()) {
        let schedule = LearningRateSchedule::new(u64::MAX, 0.5);
        prop_assert_eq!(
            schedule.should_decay(iteration),
            iteration == 0 || iteration == u64::MAX
        );
    }
}

// --- Parameter grouping ---

proptest! {
    #[test]
    fn partition_covers_trainable_parameters(
        params in proptest::collection::vec(("(conv|fc|bn)[0-9]\\.(weight|bias)", any::<bool>()), 0..24)
    ) {
        let named: Vec<NamedParameter> = params
            .iter()
            .enumerate()
            .map(|(i, (name, requires_grad))| NamedParameter {
                name: name.clone(),
                id: ParamId(i),
                requires_grad: *requires_grad,
            })
            .collect();
        let policy = ParameterGroupPolicy::new(&TrainingConfig::default());
        let groups = policy.partition(&named);

        prop_assert_eq!(groups.len(), 2);
        prop_assert_eq!(groups[0].kind, GroupKind::Weight);
        prop_assert_eq!(groups[1].kind, GroupKind::Bias);

        let mut covered: Vec<usize> = groups
            .iter()
            .flat_map(|g| g.parameters.iter().map(|id| id.0))
            .collect();
        covered.sort_unstable();
        let trainable: Vec<usize> = named
            .iter()
            .filter(|p| p.requires_grad)
            .map(|p| p.id.0)
            .collect();
        prop_assert_eq!(covered, trainable);

        for id in &groups[1].parameters {
            prop_assert!(named[id.0].name.contains("bias"));
        }
    }
}

// --- Iteration accounting ---

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn iterations_run_matches_min_of_caps(
        ipe in 1usize..5,
        max_epochs in 1u32..4,
        max_iterations in 1u64..16,
    ) {
        let dir = TempDir::new().unwrap();
        let cfg = TrainingConfig {
            train_id: "prop".to_string(),
            results_root: dir.path().to_path_buf(),
            max_epochs,
            max_iterations,
            disp_interval: 1,
            ..TrainingConfig::default()
        };
        let split = synthetic_split(2, 3, 2, ipe, 2).unwrap();
        let collaborators: Collaborators<Vec<f32>> = Collaborators {
            train: Box::new(InMemoryProducer::sequential(split.train)),
            val: Box::new(InMemoryProducer::sequential(split.val)),
            scorer: Box::new(SyntheticScorer::new(split.val_labels, 2)),
            telemetry: None,
        };
        let mut controller = TrainingLoopController::build(
            &cfg,
            |_| Ok(SyntheticDetector::new(3, 2)),
            |groups, cfg| Ok(Sgd::new(groups, cfg.momentum)),
            collaborators,
        )
        .unwrap();

        let summary = controller.run().unwrap();
        let budget = u64::from(max_epochs) * ipe as u64;
        let expected = budget.min(max_iterations);

        prop_assert_eq!(summary.iterations_run, expected);
        prop_assert_eq!(summary.global_iteration, summary.start_iteration + expected);
        prop_assert_eq!(summary.checkpoints.len(), summary.epochs_completed as usize);
        prop_assert_eq!(summary.reports.len(), summary.epochs_completed as usize);
        if max_iterations <= budget {
            prop_assert_eq!(summary.termination, Termination::IterationCap);
        } else {
            prop_assert_eq!(summary.termination, Termination::EpochLimit);
        }
    }
}
