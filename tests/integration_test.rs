//! Integration tests for the Perceiver.
//!
//! Exercises the assembled task models end to end on small configurations.

use std::collections::BTreeMap;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};

use perceiver::{
    ImageClassificationKind, PerceiverConfig, PerceiverForImageClassification,
    PerceiverForMaskedLM, PerceiverForMultimodalAutoencoding, PerceiverForOpticalFlow,
};

fn builder(device: &Device) -> (VarMap, VarBuilder) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    (varmap, vb)
}

fn text_config() -> PerceiverConfig {
    PerceiverConfig {
        num_latents: 4,
        d_latents: 16,
        d_model: 24,
        num_blocks: 1,
        num_self_attends_per_block: 2,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 2,
        vocab_size: 50,
        max_position_embeddings: 16,
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    }
}

/// A full masked-LM pass: token ids in, per-token vocabulary logits out.
#[test]
fn test_masked_lm_end_to_end() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    let config = text_config();
    let model = PerceiverForMaskedLM::new(&config, vb).unwrap();

    let ids: Vec<u32> = (0..16).map(|i| i % 50).collect();
    let ids = Tensor::from_vec(ids, (1, 16), &device).unwrap();
    let output = model.forward(&ids, None, None, false, false).unwrap();
    assert_eq!(output.logits.dims(), &[1, 16, 50]);
    assert!(output.loss.is_none());
}

/// An all-ones attention mask must decode exactly like no mask at all.
#[test]
fn test_all_ones_mask_matches_no_mask() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    let config = text_config();
    let model = PerceiverForMaskedLM::new(&config, vb).unwrap();

    let ids: Vec<u32> = (0..16).map(|i| (i * 3) % 50).collect();
    let ids = Tensor::from_vec(ids, (1, 16), &device).unwrap();
    let mask = Tensor::ones((1, 16), DType::F32, &device).unwrap();

    let unmasked = model.forward(&ids, None, None, false, false).unwrap();
    let masked = model
        .forward(&ids, Some(&mask), None, false, false)
        .unwrap();

    let diff = (unmasked.logits - masked.logits)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-6, "mask of ones changed the logits by {diff}");
}

/// Image classification with the learned-position front-end.
#[test]
fn test_image_classification_learned() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    // The conv1x1 front-end emits 256 channels plus a 256-wide projected
    // position encoding.
    let config = PerceiverConfig {
        num_latents: 4,
        d_latents: 32,
        d_model: 512,
        num_blocks: 1,
        num_self_attends_per_block: 1,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 2,
        image_size: 8,
        num_labels: 10,
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    };
    let model =
        PerceiverForImageClassification::new(&config, ImageClassificationKind::Learned, vb)
            .unwrap();

    let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
    let labels = Tensor::from_vec(vec![3u32, 7], (2,), &device).unwrap();
    let output = model
        .forward(&images, Some(&labels), false, false)
        .unwrap();
    assert_eq!(output.logits.dims(), &[2, 10]);
    let loss = output.loss.unwrap().to_scalar::<f32>().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
}

/// Image classification over raw pixels with Fourier position features.
#[test]
fn test_image_classification_fourier() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    // 3 pixel channels plus 64 fourier bands over two axes: 3 + 258. The
    // odd input width leaves room for only one cross-attention head.
    let config = PerceiverConfig {
        num_latents: 4,
        d_latents: 32,
        d_model: 261,
        num_blocks: 1,
        num_self_attends_per_block: 1,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 1,
        image_size: 8,
        num_labels: 10,
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    };
    let model =
        PerceiverForImageClassification::new(&config, ImageClassificationKind::Fourier, vb)
            .unwrap();

    let images = Tensor::randn(0f32, 1.0, (2, 3, 8, 8), &device).unwrap();
    let labels = Tensor::from_vec(vec![1u32, 4], (2,), &device).unwrap();
    let output = model
        .forward(&images, Some(&labels), false, false)
        .unwrap();
    assert_eq!(output.logits.dims(), &[2, 10]);
    let loss = output.loss.unwrap().to_scalar::<f32>().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
}

/// Image classification through the convolutional downsampling front-end.
#[test]
fn test_image_classification_conv() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    // The conv stack emits 64 channels plus 258 fourier channels.
    let config = PerceiverConfig {
        num_latents: 4,
        d_latents: 32,
        d_model: 322,
        num_blocks: 1,
        num_self_attends_per_block: 1,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 2,
        image_size: 16,
        num_labels: 10,
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    };
    let model = PerceiverForImageClassification::new(&config, ImageClassificationKind::Conv, vb)
        .unwrap();

    let images = Tensor::randn(0f32, 1.0, (2, 3, 16, 16), &device).unwrap();
    let labels = Tensor::from_vec(vec![0u32, 9], (2,), &device).unwrap();
    let output = model
        .forward(&images, Some(&labels), false, false)
        .unwrap();
    assert_eq!(output.logits.dims(), &[2, 10]);
    let loss = output.loss.unwrap().to_scalar::<f32>().unwrap();
    assert!(loss.is_finite() && loss > 0.0);
}

/// Optical flow over a tiny frame pair: dense per-pixel flow out.
#[test]
fn test_optical_flow_dense_output() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    // Patch context of 3x3x3 = 27 channels per frame; two frames merge in
    // time, so tokens carry 54 channels before the post-patch projection.
    let config = PerceiverConfig {
        num_latents: 4,
        d_latents: 32,
        d_model: 64 + 258,
        num_blocks: 1,
        num_self_attends_per_block: 1,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 2,
        train_size: (4, 6),
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    };
    let model = PerceiverForOpticalFlow::new(&config, vb).unwrap();

    let frames = Tensor::randn(0f32, 1.0, (1, 2, 27, 4, 6), &device).unwrap();
    let output = model.forward(&frames, None, false, false).unwrap();
    assert_eq!(output.logits.dims(), &[1, 4, 6, 2]);
}

/// Multimodal autoencoding with subsampled decoding: each modality comes
/// back in its own output space.
#[test]
fn test_multimodal_autoencoding_subsampled() {
    let device = Device::Cpu;
    let (_varmap, vb) = builder(&device);
    // Widths: audio patches 16 + 385 fourier = 401, image patches 48 + 195
    // fourier = 243, label 10; common input width is 401 + 4.
    let config = PerceiverConfig {
        num_latents: 4,
        d_latents: 32,
        d_model: 405,
        num_blocks: 1,
        num_self_attends_per_block: 1,
        num_self_attention_heads: 2,
        num_cross_attention_heads: 2,
        // The padded input width is not divisible by the head count, so the
        // attention widths are pinned explicitly.
        qk_channels: Some(32),
        v_channels: Some(32),
        num_frames: 2,
        audio_samples_per_frame: 32,
        samples_per_patch: 16,
        image_size: 8,
        output_shape: vec![2, 8, 8],
        num_labels: 10,
        attention_probs_dropout_prob: 0.0,
        ..Default::default()
    };

    let mut subsampled_dims = BTreeMap::new();
    subsampled_dims.insert("audio".to_string(), 4usize);
    subsampled_dims.insert("image".to_string(), 8usize);
    let model =
        PerceiverForMultimodalAutoencoding::new(&config, &subsampled_dims, vb).unwrap();

    let mut inputs = BTreeMap::new();
    inputs.insert(
        "audio".to_string(),
        Tensor::randn(0f32, 1.0, (1, 64), &device).unwrap(),
    );
    inputs.insert(
        "image".to_string(),
        Tensor::randn(0f32, 1.0, (1, 2, 3, 8, 8), &device).unwrap(),
    );
    inputs.insert(
        "label".to_string(),
        Tensor::zeros((1, 10), DType::F32, &device).unwrap(),
    );

    let mut points = BTreeMap::new();
    points.insert("audio".to_string(), vec![0usize, 1, 2, 3]);
    points.insert("image".to_string(), (0usize..8).collect::<Vec<_>>());
    points.insert("label".to_string(), vec![0usize]);

    let output = model
        .forward(&inputs, Some(&points), None, false, false)
        .unwrap();

    // 4 audio patches of 16 samples each.
    assert_eq!(output.logits["audio"].dims(), &[1, 64]);
    assert_eq!(output.logits["image"].dims(), &[1, 8, 3]);
    assert_eq!(output.logits["label"].dims(), &[1, 10]);
}
