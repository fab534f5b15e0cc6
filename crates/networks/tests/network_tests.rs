use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use nmr_networks::{attention::key_padding_mask, MhaNet, MhaNetConfig, Network, SpectrumBatch};

fn small_config() -> MhaNetConfig {
    let mut config = MhaNetConfig::new(8, 2, 4, 5);
    config.d_feedforward = 6;
    config.dropout = 0.0;
    config
}

fn spectra() -> Result<Tensor> {
    let data: Vec<f32> = vec![
        0.1, 1.0, 0.4, 0.5, 0.9, 0.2, 0.0, 0.0, //
        0.3, 0.7, 0.6, 0.1, 0.0, 0.0, 0.0, 0.0,
    ];
    Ok(Tensor::from_vec(data, (2, 4, 2), &Device::Cpu)?)
}

#[test]
fn forward_produces_probabilities() -> Result<()> {
    let model = MhaNet::new(small_config())?;
    let batch = SpectrumBatch::new(spectra()?, Tensor::zeros((2, 5), DType::F32, &Device::Cpu)?);

    let out = model.forward(&batch)?;

    assert_eq!(out.dims(), &[2, 5]);
    let values = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|p| *p > 0.0 && *p < 1.0));
    Ok(())
}

#[test]
fn padding_mask_flags_fully_padded_peaks() -> Result<()> {
    let mask = key_padding_mask(&spectra()?, 0.0)?;

    assert_eq!(
        mask.to_vec2::<f32>()?,
        vec![vec![0.0, 0.0, 0.0, 1.0], vec![0.0, 0.0, 1.0, 1.0]]
    );
    Ok(())
}

#[test]
fn parameters_are_named_and_sorted() -> Result<()> {
    let model = MhaNet::new(small_config())?;
    let names: Vec<String> = model
        .named_parameters()
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.iter().any(|name| name.starts_with("mha.q_proj")));
    assert!(names.iter().any(|name| name.starts_with("ffnn.layers.3")));
    assert!(names.iter().any(|name| name.starts_with("src_embed.heads.0")));
    Ok(())
}

#[test]
fn loss_targets_follow_model_dtype() -> Result<()> {
    let model = MhaNet::new(small_config())?;
    let targets = Tensor::from_vec(vec![1u8, 0, 1, 0, 1, 0, 0, 1, 1, 0], (2, 5), &Device::Cpu)?;
    let batch = SpectrumBatch::new(spectra()?, targets);

    let aligned = model.loss_targets(&batch)?;

    assert_eq!(aligned.dtype(), DType::F32);
    assert_eq!(aligned.dims(), &[2, 5]);
    Ok(())
}

#[test]
#[should_panic(expected = "must be divisible by n_heads")]
fn rejects_indivisible_head_count() {
    let mut config = small_config();
    config.n_heads = 3;
    let _ = MhaNet::new(config);
}
