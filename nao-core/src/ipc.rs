use crate::{
    env::EnvironmentDescription, error::IpcError, tensor::Buffer, vec_env::Transition,
};
use anyhow::Result;
use bincode::{Decode, Encode};
use interprocess::local_socket::Stream;
use std::io::{BufReader, Read, Write};

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Sent from the pool to a worker.
#[derive(Debug, Clone, Encode, Decode)]
pub enum Command {
    Reset,
    Step { action: Buffer },
    Render,
    // Ask the worker to close its env and exit
    Close,
}

/// Sent from a worker back to the pool.
#[derive(Debug, Clone, Encode, Decode)]
pub enum Reply {
    // First packet after connecting
    Ready {
        rank: usize,
        description: EnvironmentDescription,
    },
    Observation(Buffer),
    Step(Transition),
    Rendered,
    // Ack of close
    Closing,
    Failed { message: String },
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Observation(_) => "observation",
            Self::Step(_) => "step",
            Self::Rendered => "rendered",
            Self::Closing => "closing",
            Self::Failed { .. } => "failed",
        }
    }
}

// Frames are a 4 byte big endian length followed by the bincode payload
pub fn write_packet<W: Write, P: Encode>(writer: &mut W, packet: P) -> Result<()> {
    let payload = bincode::encode_to_vec(packet, bincode::config::standard())?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(payload.len()).into());
    }
    let payload_len = (payload.len() as u32).to_be_bytes();
    writer.write_all(&payload_len)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

pub fn read_packet<R: Read, P: Decode<()>>(reader: &mut R) -> Result<P> {
    let mut content_len = [0u8; 4];
    reader.read_exact(&mut content_len)?;
    let len = u32::from_be_bytes(content_len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(IpcError::FrameTooLarge(len).into());
    }
    let mut buffer = vec![0u8; len];
    reader.read_exact(&mut buffer)?;
    let (packet, _): (P, _) = bincode::decode_from_slice(&buffer, bincode::config::standard())?;
    Ok(packet)
}

pub fn send_packet<P: Encode>(conn: &mut BufReader<Stream>, packet: P) -> Result<()> {
    write_packet(conn.get_mut(), packet)
}

pub fn receive_packet<P: Decode<()>>(conn: &mut BufReader<Stream>) -> Result<P> {
    read_packet(conn)
}
