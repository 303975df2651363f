//! Collective transports
//!
//! A [`Transport`] moves buffers between the members of a group. The crate
//! ships two:
//!
//! - [`LocalTransport`]: world size 1, no communication
//! - [`StarTransport`]: TCP star with rank 0 as hub, used by native backends
//!
//! The pod runtime implements the same trait over an in-process ring, see
//! [`crate::pod`].

mod protocol;
mod tcp;

pub use protocol::{read_frame, write_frame, Frame, MAX_FRAME_LEN};
pub use tcp::{Rendezvous, StarTransport};

use crate::value::{Buffer, ReduceOp};
use crate::Result;

/// Blocking collective primitives.
///
/// Every member must call the same collectives in the same order.
pub trait Transport: std::fmt::Debug {
    /// Rank of this member
    fn rank(&self) -> usize;

    /// Number of members
    fn world_size(&self) -> usize;

    /// Reduce `data` in place across all members
    fn all_reduce(&mut self, data: &mut [f64], op: ReduceOp) -> Result<()>;

    /// Collect one buffer from every member, in rank order
    fn all_gather(&mut self, local: &Buffer) -> Result<Vec<Buffer>>;

    /// Leave the group
    fn shutdown(&mut self) -> Result<()>;
}

/// Transport of a single-member group
#[derive(Debug, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce(&mut self, _data: &mut [f64], _op: ReduceOp) -> Result<()> {
        Ok(())
    }

    fn all_gather(&mut self, local: &Buffer) -> Result<Vec<Buffer>> {
        Ok(vec![local.clone()])
    }

    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }
}
