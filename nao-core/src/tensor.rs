use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Flat `f32` storage with a shape. This is what crosses the environment boundary, the process
/// boundary and the dataset files. Learning code converts it into backend tensors.
#[derive(Debug, Clone, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct Buffer {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Buffer {
    pub fn from_vec(data: Vec<f32>) -> Self {
        let shape = vec![data.len()];
        Self { data, shape }
    }

    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        Self { data, shape }
    }

    pub fn zeros(size: usize) -> Self {
        Self::from_vec(vec![0.; size])
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn to_data(self) -> Vec<f32> {
        self.data
    }

    pub fn clamp(&self, min: &Self, max: &Self) -> Self {
        let data = self
            .data
            .iter()
            .zip(min.data.iter().zip(max.data.iter()))
            .map(|(x, (lo, hi))| x.clamp(*lo, *hi))
            .collect();
        Self {
            data,
            shape: self.shape.clone(),
        }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            data: self.data.iter().copied().map(f).collect(),
            shape: self.shape.clone(),
        }
    }
}

impl From<Vec<f32>> for Buffer {
    fn from(value: Vec<f32>) -> Self {
        Self::from_vec(value)
    }
}

#[cfg(test)]
mod test {
    use super::Buffer;

    #[test]
    fn clamp_is_elementwise() {
        let action = Buffer::from_vec(vec![-3., 0.5, 4.]);
        let min = Buffer::from_vec(vec![-1., -1., -1.]);
        let max = Buffer::from_vec(vec![1., 1., 2.]);
        assert_eq!(action.clamp(&min, &max).data, vec![-1., 0.5, 2.]);
    }
}
