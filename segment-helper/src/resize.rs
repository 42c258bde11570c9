//! Mapping between source and destination segments when restoring onto a
//! cluster with a different segment count.

use crate::utils::errors::{HelperError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub orig: i32,
    pub dest: i32,
}

impl ResizePlan {
    pub fn new(orig: i32, dest: i32) -> Result<Self> {
        if orig <= 0 || dest <= 0 {
            return Err(HelperError::Config(format!(
                "segment counts must be positive, got orig {} dest {}",
                orig, dest
            )));
        }
        Ok(Self { orig, dest })
    }

    /// Number of COPY passes per table: `ceil(orig / dest)` when shrinking, else 1.
    pub fn batches(&self) -> usize {
        if self.orig > self.dest {
            ((self.orig + self.dest - 1) / self.dest) as usize
        } else {
            1
        }
    }

    /// Source content served by destination `content` in each pass, `None`
    /// for a pass with no source shard (an empty stream).
    pub fn sources_for(&self, content: i32) -> Vec<Option<i32>> {
        (0..self.batches() as i32)
            .map(|batch| {
                let source = content + batch * self.dest;
                (source < self.orig).then_some(source)
            })
            .collect()
    }
}
