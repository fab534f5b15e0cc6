use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{Device, Tensor};
use nmr_networks::{MhaNet, MhaNetConfig, Network, SpectrumBatch};
use nmr_training::{
    checkpoint::{parse_checkpoint_filename, restore_checkpoint, save_model, sha256_file},
    AdamConfig, LossFunction, SubstructureBce, TrainerOptimizer,
};
use tempfile::tempdir;

fn model() -> Result<MhaNet> {
    let mut config = MhaNetConfig::new(8, 2, 4, 3);
    config.d_feedforward = 4;
    config.dropout = 0.0;
    Ok(MhaNet::new(config)?)
}

fn optimizer(model: &MhaNet) -> Result<TrainerOptimizer> {
    let config = AdamConfig {
        learning_rate: 1e-2,
        ..AdamConfig::from(&nmr_training::config::OptimizerConfig::default())
    };
    Ok(TrainerOptimizer::new(model.named_parameters(), config)?)
}

fn flatten(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Result<BTreeMap<String, Vec<f32>>> {
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let values = tensor
                .to_dtype(candle_core::DType::F32)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            Ok((name, values))
        })
        .collect()
}

fn parameters(model: &MhaNet) -> Result<BTreeMap<String, Vec<f32>>> {
    flatten(
        model
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone())),
    )
}

fn train_steps(model: &mut MhaNet, optimizer: &mut TrainerOptimizer, steps: usize) -> Result<()> {
    let dev = Device::Cpu;
    let inputs: Vec<f32> = (0..16).map(|i| 0.05 * (i as f32 + 1.0)).collect();
    let batch = SpectrumBatch::new(
        Tensor::from_vec(inputs, (2, 4, 2), &dev)?,
        Tensor::from_vec(vec![1f32, 0., 1., 0., 1., 1.], (2, 3), &dev)?,
    );
    let loss_fn = SubstructureBce::new().with_num_classes(3);
    model.set_training(true);
    for _ in 0..steps {
        let pred = model.forward(&batch)?;
        let loss = loss_fn.compute(&pred, &model.loss_targets(&batch)?)?;
        optimizer.backward_step(&loss)?;
    }
    Ok(())
}

#[test]
fn restore_reproduces_parameters_and_moments_exactly() -> Result<()> {
    let tmp = tempdir()?;
    let mut trained = model()?;
    let mut trained_opt = optimizer(&trained)?;
    train_steps(&mut trained, &mut trained_opt, 3)?;

    let record = save_model(tmp.path(), &trained, &trained_opt, 7, 0.25, Some("best"))?;
    assert_eq!(record.sha256, sha256_file(&record.path)?);
    let name = parse_checkpoint_filename(&record.file_name().unwrap()).unwrap();
    assert_eq!(name.epoch, 7);
    assert_eq!(name.tag.as_deref(), Some("best"));

    let fresh = model()?;
    let mut fresh_opt = optimizer(&fresh)?;
    assert_ne!(parameters(&fresh)?, parameters(&trained)?);

    restore_checkpoint(&record.path, Some(&record.sha256), &fresh, &mut fresh_opt)?;

    assert_eq!(parameters(&fresh)?, parameters(&trained)?);
    assert_eq!(fresh_opt.step_count(), 3);
    assert_eq!(
        flatten(fresh_opt.state_tensors()?)?,
        flatten(trained_opt.state_tensors()?)?
    );
    Ok(())
}

#[test]
fn resumed_training_matches_uninterrupted_training() -> Result<()> {
    let tmp = tempdir()?;
    let mut reference = model()?;
    let mut reference_opt = optimizer(&reference)?;
    train_steps(&mut reference, &mut reference_opt, 2)?;
    let record = save_model(tmp.path(), &reference, &reference_opt, 1, 1.0, None)?;

    let mut resumed = model()?;
    let mut resumed_opt = optimizer(&resumed)?;
    restore_checkpoint(&record.path, None, &resumed, &mut resumed_opt)?;

    train_steps(&mut reference, &mut reference_opt, 2)?;
    train_steps(&mut resumed, &mut resumed_opt, 2)?;

    assert_eq!(parameters(&resumed)?, parameters(&reference)?);
    Ok(())
}

#[test]
fn tampered_checkpoint_fails_checksum() -> Result<()> {
    let tmp = tempdir()?;
    let trained = model()?;
    let trained_opt = optimizer(&trained)?;
    let record = save_model(tmp.path(), &trained, &trained_opt, 0, 0.5, None)?;

    let fresh = model()?;
    let mut fresh_opt = optimizer(&fresh)?;
    let err = restore_checkpoint(&record.path, Some(&"0".repeat(64)), &fresh, &mut fresh_opt)
        .expect_err("digest mismatch");

    assert!(err.to_string().contains("checksum"));
    Ok(())
}
