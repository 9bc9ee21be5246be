use crate::{env::Memory, rng::with_rng};
use rand::Rng;

/// Fixed capacity ring of transitions, the oldest entry is overwritten once full.
#[derive(Debug, Clone)]
pub struct ReplayBuffer {
    memories: Vec<Memory>,
    capacity: usize,
    write_pos: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            memories: Vec::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            write_pos: 0,
        }
    }

    pub fn push(&mut self, memory: Memory) {
        if self.memories.len() < self.capacity {
            self.memories.push(memory);
        } else {
            self.memories[self.write_pos] = memory;
        }
        self.write_pos = (self.write_pos + 1) % self.capacity;
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Uniform sample with replacement.
    pub fn sample(&self, batch_size: usize) -> Vec<&Memory> {
        if self.memories.is_empty() {
            return vec![];
        }
        with_rng(|rng| {
            (0..batch_size)
                .map(|_| &self.memories[rng.random_range(0..self.memories.len())])
                .collect()
        })
    }
}

#[cfg(test)]
mod test {
    use super::ReplayBuffer;
    use crate::{env::Memory, tensor::Buffer};

    fn memory(reward: f32) -> Memory {
        Memory {
            state: Buffer::from_vec(vec![reward]),
            next_state: Buffer::from_vec(vec![reward + 1.]),
            action: Buffer::from_vec(vec![0.]),
            reward,
            terminated: false,
        }
    }

    #[test]
    fn overwrites_oldest_when_full() {
        let mut buffer = ReplayBuffer::new(3);
        for i in 0..5 {
            buffer.push(memory(i as f32));
        }
        assert_eq!(buffer.len(), 3);
        let mut rewards: Vec<f32> = buffer.sample(64).iter().map(|m| m.reward).collect();
        rewards.sort_by(f32::total_cmp);
        rewards.dedup();
        assert!(rewards.iter().all(|r| *r >= 2.));
    }

    #[test]
    fn empty_buffer_samples_nothing() {
        let buffer = ReplayBuffer::new(10);
        assert!(buffer.sample(8).is_empty());
    }
}
