//! Ring collectives over the pod channels

use super::PodCore;
use crate::topology::Ring;
use crate::transport::Transport;
use crate::value::{Buffer, ReduceOp};
use crate::{DistError, Result};
use std::ops::Range;

impl PodCore {
    fn send(&self, buffer: Buffer) -> Result<()> {
        self.right
            .send(buffer)
            .map_err(|_| {
                DistError::Comm(format!(
                    "core {} lost its right neighbor {}",
                    self.ordinal,
                    Ring::right(self.ordinal, self.world_size)
                ))
            })
    }

    fn recv(&self) -> Result<Buffer> {
        self.left
            .recv()
            .map_err(|_| {
                DistError::Comm(format!(
                    "core {} lost its left neighbor {}",
                    self.ordinal,
                    Ring::left(self.ordinal, self.world_size)
                ))
            })
    }

    /// Element range of chunk `index`; trailing chunks may be empty
    fn chunk(index: usize, chunk_len: usize, total: usize) -> Range<usize> {
        let start = (index * chunk_len).min(total);
        let end = (start + chunk_len).min(total);
        start..end
    }

    fn recv_chunk(&self, expected: usize) -> Result<Vec<f64>> {
        let received = self.recv()?.into_data();
        if received.len() != expected {
            return Err(DistError::ShapeMismatch {
                expected: vec![expected],
                got: vec![received.len()],
            });
        }
        Ok(received)
    }
}

impl Transport for PodCore {
    fn rank(&self) -> usize {
        self.ordinal
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    /// Ring all-reduce: reduce-scatter then all-gather, one chunk per core
    fn all_reduce(&mut self, data: &mut [f64], op: ReduceOp) -> Result<()> {
        let n = self.world_size;
        if n == 1 {
            return Ok(());
        }
        let total = data.len();
        let chunk_len = total.div_ceil(n);

        for step in 0..n - 1 {
            let send = Self::chunk(Ring::behind(self.ordinal, step, n), chunk_len, total);
            let recv = Self::chunk(Ring::behind(self.ordinal, step + 1, n), chunk_len, total);

            self.send(Buffer::from_vec(data[send].to_vec()))?;
            let incoming = self.recv_chunk(recv.len())?;
            op.apply(&mut data[recv], &incoming)?;
        }

        // Core r now owns the reduced chunk r + 1.
        for step in 0..n - 1 {
            let send = Self::chunk(Ring::behind(self.ordinal + 1, step, n), chunk_len, total);
            let recv = Self::chunk(Ring::behind(self.ordinal, step, n), chunk_len, total);

            self.send(Buffer::from_vec(data[send].to_vec()))?;
            let incoming = self.recv_chunk(recv.len())?;
            data[recv].copy_from_slice(&incoming);
        }
        Ok(())
    }

    fn all_gather(&mut self, local: &Buffer) -> Result<Vec<Buffer>> {
        let n = self.world_size;
        let mut blocks: Vec<Option<Buffer>> = vec![None; n];
        blocks[self.ordinal] = Some(local.clone());

        for step in 0..n - 1 {
            let send = Ring::behind(self.ordinal, step, n);
            let recv = Ring::behind(self.ordinal, step + 1, n);

            let outgoing = blocks[send]
                .clone()
                .ok_or_else(|| DistError::Comm(format!("block {} missing on core {}", send, self.ordinal)))?;
            self.send(outgoing)?;
            blocks[recv] = Some(self.recv()?);
        }

        blocks
            .into_iter()
            .enumerate()
            .map(|(i, b)| b.ok_or_else(|| DistError::Comm(format!("block {} never arrived", i))))
            .collect()
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::{launch, with_core};
    use super::*;
    use std::sync::Mutex;

    fn ring_reduce(num_cores: usize, len: usize, op: ReduceOp) -> Vec<Vec<f64>> {
        let results = Mutex::new(vec![Vec::new(); num_cores]);
        launch(num_cores, |i| {
            let mut data: Vec<f64> = (0..len).map(|j| (i * 10 + j) as f64).collect();
            with_core(|core| core.all_reduce(&mut data, op))?;
            results.lock().unwrap()[i] = data;
            Ok(())
        })
        .unwrap();
        results.into_inner().unwrap()
    }

    #[test]
    fn test_ring_sum() {
        let results = ring_reduce(4, 6, ReduceOp::Sum);
        let expected: Vec<f64> = (0..6).map(|j| (60 + 4 * j) as f64).collect();
        for r in results {
            assert_eq!(r, expected);
        }
    }

    #[test]
    fn test_ring_short_buffer() {
        // fewer elements than cores leaves some chunks empty
        let results = ring_reduce(5, 2, ReduceOp::Max);
        for r in results {
            assert_eq!(r, vec![40.0, 41.0]);
        }
    }

    #[test]
    fn test_ring_gather_order() {
        let results = Mutex::new(Vec::new());
        launch(3, |i| {
            let gathered = with_core(|core| core.all_gather(&Buffer::scalar(i as f64)))?;
            results.lock().unwrap().push(gathered);
            Ok(())
        })
        .unwrap();

        for gathered in results.into_inner().unwrap() {
            let values: Vec<f64> = gathered.iter().map(|b| b.data()[0]).collect();
            assert_eq!(values, vec![0.0, 1.0, 2.0]);
        }
    }

    #[test]
    fn test_ring_length_mismatch() {
        let err = launch(2, |i| {
            let mut data = vec![1.0; 2 + i * 2];
            with_core(|core| core.all_reduce(&mut data, ReduceOp::Sum))?;
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, DistError::WorkerFailed { .. }));
    }
}
