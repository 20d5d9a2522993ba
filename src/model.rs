use crate::error::{Result, StampNetError};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{
    conv2d, linear, ops, Conv2d, Conv2dConfig, Linear, Module, VarBuilder, VarMap,
};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Layer sizes of the stamp classifier. Defaults give the usual
/// conv(32) -> pool -> conv(64) -> pool -> dense(1024) stack.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvNetConfig {
    pub conv1_channels: usize,
    pub conv2_channels: usize,
    pub kernel_size: usize,
    pub hidden: usize,
    pub init_stddev: f64,
    pub bias_init: f32,
}

impl Default for ConvNetConfig {
    fn default() -> Self {
        Self {
            conv1_channels: 32,
            conv2_channels: 64,
            kernel_size: 5,
            hidden: 1024,
            init_stddev: 0.1,
            bias_init: 0.1,
        }
    }
}

/// Normal(0, stddev) with draws beyond two standard deviations redrawn.
fn truncated_normal<R: Rng>(
    shape: &[usize],
    stddev: f64,
    rng: &mut R,
    device: &Device,
) -> Result<Tensor> {
    let normal = Normal::new(0.0, stddev)
        .map_err(|e| StampNetError::PreconditionViolation(format!("init stddev: {e}")))?;
    let bound = 2.0 * stddev;
    let count = shape.iter().product();
    let mut values: Vec<f32> = Vec::with_capacity(count);
    while values.len() < count {
        let v: f64 = normal.sample(rng);
        if v.abs() <= bound {
            values.push(v as f32);
        }
    }
    Ok(Tensor::from_vec(values, shape.to_vec(), device)?)
}

pub struct ConvNet {
    conv1: Conv2d,
    conv2: Conv2d,
    fc1: Linear,
    fc2: Linear,
    varmap: VarMap,
    side: usize,
    n_categories: usize,
}

impl ConvNet {
    /// `side` is the square input side, which must be a multiple of 4.
    pub fn new<R: Rng>(
        cfg: &ConvNetConfig,
        side: usize,
        n_categories: usize,
        device: &Device,
        rng: &mut R,
    ) -> Result<Self> {
        if side == 0 || side % 4 != 0 {
            return Err(StampNetError::PreconditionViolation(format!(
                "input side {side} must be a non-zero multiple of 4"
            )));
        }
        let k = cfg.kernel_size;
        if k % 2 == 0 {
            return Err(StampNetError::PreconditionViolation(format!(
                "kernel size {k} must be odd for same padding"
            )));
        }
        let conv_cfg = Conv2dConfig {
            padding: k / 2,
            ..Default::default()
        };
        let flat = (side / 4) * (side / 4) * cfg.conv2_channels;

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let conv1 = conv2d(1, cfg.conv1_channels, k, conv_cfg, vb.pp("conv1"))?;
        let conv2 = conv2d(cfg.conv1_channels, cfg.conv2_channels, k, conv_cfg, vb.pp("conv2"))?;
        let fc1 = linear(flat, cfg.hidden, vb.pp("fc1"))?;
        let fc2 = linear(cfg.hidden, n_categories, vb.pp("fc2"))?;

        // weights truncated normal, biases constant; first dim is the layer width
        let layers = [
            ("conv1", vec![cfg.conv1_channels, 1, k, k]),
            ("conv2", vec![cfg.conv2_channels, cfg.conv1_channels, k, k]),
            ("fc1", vec![cfg.hidden, flat]),
            ("fc2", vec![n_categories, cfg.hidden]),
        ];
        for (prefix, dims) in layers {
            let weight = truncated_normal(&dims, cfg.init_stddev, rng, device)?;
            varmap.set_one(format!("{prefix}.weight"), &weight)?;
            let bias = Tensor::full(cfg.bias_init, dims[0], device)?;
            varmap.set_one(format!("{prefix}.bias"), &bias)?;
        }

        Ok(Self {
            conv1,
            conv2,
            fc1,
            fc2,
            varmap,
            side,
            n_categories,
        })
    }

    /// Trainable parameters, keyed `<layer>.weight` / `<layer>.bias`.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn n_categories(&self) -> usize {
        self.n_categories
    }

    /// Unnormalised class scores for a `(batch, side * side)` input.
    /// `keep_prob` of 1.0 disables dropout.
    pub fn logits(&self, xs: &Tensor, keep_prob: f32) -> Result<Tensor> {
        let (b, _) = xs.dims2()?;
        let xs = xs.reshape((b, 1, self.side, self.side))?;
        let xs = self.conv1.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = self.conv2.forward(&xs)?.relu()?.max_pool2d(2)?;
        let xs = xs.flatten_from(1)?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        let xs = if keep_prob < 1.0 {
            ops::dropout(&xs, 1.0 - keep_prob)?
        } else {
            xs
        };
        Ok(self.fc2.forward(&xs)?)
    }

    /// Class probabilities.
    pub fn forward(&self, xs: &Tensor, keep_prob: f32) -> Result<Tensor> {
        let logits = self.logits(xs, keep_prob)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }
}

/// Summed cross-entropy `-sum(labels * log(softmax(logits)))`.
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    Ok(labels.mul(&log_probs)?.sum_all()?.neg()?)
}

/// Fraction of rows whose predicted argmax matches the label argmax.
pub fn accuracy(scores: &Tensor, labels: &Tensor) -> Result<f32> {
    let predicted = scores.argmax(D::Minus1)?;
    let truth = labels.argmax(D::Minus1)?;
    let hits = predicted.eq(&truth)?.to_dtype(DType::F32)?;
    Ok(hits.mean_all()?.to_scalar::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_cfg() -> ConvNetConfig {
        ConvNetConfig {
            conv1_channels: 4,
            conv2_channels: 8,
            hidden: 16,
            ..Default::default()
        }
    }

    fn small_net(n_categories: usize) -> ConvNet {
        let mut rng = StdRng::seed_from_u64(7);
        ConvNet::new(&small_cfg(), 8, n_categories, &Device::Cpu, &mut rng).unwrap()
    }

    #[test]
    fn default_config_matches_reference_topology() {
        let cfg = ConvNetConfig::default();
        assert_eq!(cfg.conv1_channels, 32);
        assert_eq!(cfg.conv2_channels, 64);
        assert_eq!(cfg.kernel_size, 5);
        assert_eq!(cfg.hidden, 1024);
    }

    #[test]
    fn parameters_are_initialised_as_configured() {
        let net = small_net(3);
        let data = net.varmap().data().lock().unwrap();
        let expected: [(&str, Vec<usize>); 8] = [
            ("conv1.weight", vec![4, 1, 5, 5]),
            ("conv1.bias", vec![4]),
            ("conv2.weight", vec![8, 4, 5, 5]),
            ("conv2.bias", vec![8]),
            ("fc1.weight", vec![16, 2 * 2 * 8]),
            ("fc1.bias", vec![16]),
            ("fc2.weight", vec![3, 16]),
            ("fc2.bias", vec![3]),
        ];
        assert_eq!(data.len(), expected.len());
        for (name, dims) in expected {
            let var = data.get(name).unwrap();
            assert_eq!(var.dims(), dims.as_slice(), "{name}");
            let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            if name.ends_with("weight") {
                assert!(values.iter().all(|v| v.abs() <= 0.2 + 1e-6), "{name}");
                assert!(values.iter().any(|v| *v != values[0]), "{name}");
            } else {
                assert!(values.iter().all(|v| (v - 0.1).abs() < 1e-6), "{name}");
            }
        }
    }

    #[test]
    fn same_seed_gives_same_parameters() {
        let a = small_net(2);
        let b = small_net(2);
        let a = a.varmap().data().lock().unwrap();
        let b = b.varmap().data().lock().unwrap();
        for (name, var) in a.iter() {
            let lhs = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let rhs = b[name].as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            assert_eq!(lhs, rhs, "{name}");
        }
    }

    #[test]
    fn rejects_side_not_multiple_of_four() {
        let mut rng = StdRng::seed_from_u64(0);
        let err = ConvNet::new(&small_cfg(), 6, 2, &Device::Cpu, &mut rng).err().unwrap();
        assert!(matches!(err, StampNetError::PreconditionViolation(_)));
    }

    #[test]
    fn forward_yields_probability_rows() {
        let net = small_net(3);
        let xs = Tensor::randn(0f32, 1.0, (5, 64), &Device::Cpu).unwrap();
        let probs = net.forward(&xs, 1.0).unwrap();
        assert_eq!(probs.dims(), &[5, 3]);
        for row in probs.to_vec2::<f32>().unwrap() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn keep_prob_one_is_deterministic_and_dropout_is_not() {
        let net = small_net(3);
        let xs = Tensor::randn(0f32, 1.0, (4, 64), &Device::Cpu).unwrap();
        let eval_a = net.logits(&xs, 1.0).unwrap().to_vec2::<f32>().unwrap();
        let eval_b = net.logits(&xs, 1.0).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(eval_a, eval_b);

        let train = net.logits(&xs, 0.5).unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(eval_a, train);
    }

    #[test]
    fn cross_entropy_is_summed_over_the_batch() {
        let logits = Tensor::new(&[[0f32, 0.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let loss = cross_entropy(&logits, &labels).unwrap().to_scalar::<f32>().unwrap();
        assert!((loss - 2.0 * std::f32::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn accuracy_counts_argmax_agreement() {
        let scores = Tensor::new(&[[0.9f32, 0.1], [0.2, 0.8], [0.7, 0.3], [0.4, 0.6]], &Device::Cpu)
            .unwrap();
        let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [0.0, 1.0], [1.0, 0.0]], &Device::Cpu)
            .unwrap();
        assert!((accuracy(&scores, &labels).unwrap() - 0.5).abs() < 1e-6);
    }
}
