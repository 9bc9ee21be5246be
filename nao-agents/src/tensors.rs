use anyhow::{Result, ensure};
use candle_core::{Device, Tensor};
use derive_more::{Deref, DerefMut, Display};
use nao_core::tensor::Buffer;

#[derive(Deref, DerefMut, Debug, Display)]
pub struct Logp(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValuesPred(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct PolicyLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct ValueLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display)]
pub struct LogpDiff(pub Tensor);

pub fn buffer_to_tensor(buffer: &Buffer, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(&buffer.data, buffer.len(), device)?)
}

/// Stacks flat buffers of equal length into a `(batch, len)` tensor.
pub fn stack_buffers(buffers: &[Buffer], device: &Device) -> Result<Tensor> {
    ensure!(!buffers.is_empty(), "cannot stack an empty batch");
    let dim = buffers[0].len();
    ensure!(
        buffers.iter().all(|b| b.len() == dim),
        "buffers in a batch must have the same length"
    );
    let data: Vec<f32> = buffers.iter().flat_map(|b| b.data.iter().copied()).collect();
    Ok(Tensor::from_vec(data, (buffers.len(), dim), device)?)
}

/// Splits a `(batch, len)` tensor into one buffer per row.
pub fn tensor_to_buffers(tensor: &Tensor) -> Result<Vec<Buffer>> {
    let rows: Vec<Vec<f32>> = tensor.to_vec2()?;
    Ok(rows.into_iter().map(Buffer::from_vec).collect())
}

pub fn tensor_to_buffer(tensor: &Tensor) -> Result<Buffer> {
    Ok(Buffer::from_vec(tensor.flatten_all()?.to_vec1()?))
}
