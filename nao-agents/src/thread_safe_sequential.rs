use candle_core::{Result, Tensor};
use candle_nn::{Activation, Linear, Module, VarBuilder, linear};
use either::Either;

#[derive(Debug, Clone)]
pub struct LinearLayer {
    layer: Linear,
}

impl LinearLayer {
    pub fn new(in_dim: usize, out_dim: usize, vb: &VarBuilder, prefix: &str) -> Result<Self> {
        let layer = linear(in_dim, out_dim, vb.pp(prefix))?;
        Ok(Self { layer })
    }
}

impl Module for LinearLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.layer.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct ActivationLayer(pub Activation);

impl Module for ActivationLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.0.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.tanh()
    }
}

#[derive(Debug, Clone)]
pub struct ThreadSafeLayer(pub Either<LinearLayer, Either<ActivationLayer, Tanh>>);

impl ThreadSafeLayer {
    pub fn linear(linear: LinearLayer) -> Self {
        Self(Either::Left(linear))
    }

    pub fn activation(activation: ActivationLayer) -> Self {
        Self(Either::Right(Either::Left(activation)))
    }

    pub fn tanh() -> Self {
        Self(Either::Right(Either::Right(Tanh)))
    }
}

impl Module for ThreadSafeLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match &self.0 {
            Either::Left(linear) => linear.forward(xs),
            Either::Right(Either::Left(activation)) => activation.forward(xs),
            Either::Right(Either::Right(tanh)) => tanh.forward(xs),
        }
    }
}

#[derive(Default, Debug, Clone)]
pub struct ThreadSafeSequential {
    layers: Vec<ThreadSafeLayer>,
}

impl Module for ThreadSafeSequential {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward(&xs)?
        }
        Ok(xs)
    }
}

impl ThreadSafeSequential {
    pub fn add_layer(mut self, layer: ThreadSafeLayer) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

/// Relu MLP, `layers` lists every output width including the last one, which stays linear.
pub fn build_sequential(
    input_dim: usize,
    layers: &[usize],
    vb: &VarBuilder,
    prefix: &str,
) -> Result<ThreadSafeSequential> {
    let mut last_dim = input_dim;
    let mut nn = ThreadSafeSequential::default();
    let num_layers = layers.len();
    for (layer_idx, layer_size) in layers.iter().enumerate() {
        let layer_pp = format!("{prefix}{layer_idx}");
        if layer_idx == num_layers - 1 {
            let layer = LinearLayer::new(last_dim, *layer_size, vb, &layer_pp)?;
            nn = nn.add_layer(ThreadSafeLayer::linear(layer))
        } else {
            let lin_layer = LinearLayer::new(last_dim, *layer_size, vb, &layer_pp)?;
            nn = nn.add_layer(ThreadSafeLayer::linear(lin_layer)).add_layer(
                ThreadSafeLayer::activation(ActivationLayer(Activation::Relu)),
            );
        }
        last_dim = *layer_size;
    }
    Ok(nn)
}

/// Hidden layers followed by an output layer of `output_dim`.
pub fn build_mlp(
    input_dim: usize,
    hidden_layers: &[usize],
    output_dim: usize,
    vb: &VarBuilder,
    prefix: &str,
) -> Result<ThreadSafeSequential> {
    let layers: Vec<usize> = hidden_layers
        .iter()
        .copied()
        .chain(std::iter::once(output_dim))
        .collect();
    build_sequential(input_dim, &layers, vb, prefix)
}

/// Same as [`build_mlp`] with the output squashed into `[-1, 1]`.
pub fn build_tanh_mlp(
    input_dim: usize,
    hidden_layers: &[usize],
    output_dim: usize,
    vb: &VarBuilder,
    prefix: &str,
) -> Result<ThreadSafeSequential> {
    Ok(build_mlp(input_dim, hidden_layers, output_dim, vb, prefix)?.add_layer(ThreadSafeLayer::tanh()))
}

#[cfg(test)]
mod test {
    use super::{build_mlp, build_tanh_mlp};
    use candle_core::{DType, Device, Module, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn mlp_shapes_and_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = build_mlp(3, &[8, 4], 2, &vb, "policy").unwrap();
        // two hidden linear layers with relu, one output layer
        assert_eq!(net.len(), 5);
        let xs = Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(net.forward(&xs).unwrap().dims(), &[5, 2]);
        let mut names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "policy0.bias",
                "policy0.weight",
                "policy1.bias",
                "policy1.weight",
                "policy2.bias",
                "policy2.weight"
            ]
        );
    }

    #[test]
    fn tanh_output_is_bounded() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = build_tanh_mlp(2, &[4], 3, &vb, "actor").unwrap();
        let xs = Tensor::new(&[[100f32, -100.]], &Device::Cpu).unwrap();
        let out: Vec<Vec<f32>> = net.forward(&xs).unwrap().to_vec2().unwrap();
        assert!(out[0].iter().all(|x| x.abs() <= 1.));
    }
}
