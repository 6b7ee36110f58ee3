use tracing::warn;

use crate::domain::DataPoint;

/// Points waiting for the collector, oldest first.
///
/// Unbounded unless a cap is given; with a cap the oldest points are evicted.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    points: Vec<DataPoint>,
    cap: Option<usize>,
}

impl PendingBuffer {
    pub fn new(cap: Option<usize>) -> Self {
        Self { points: Vec::new(), cap }
    }

    pub fn push(&mut self, point: DataPoint) {
        self.points.push(point);
        if let Some(cap) = self.cap {
            if self.points.len() > cap {
                let evicted = self.points.len() - cap;
                self.points.drain(..evicted);
                warn!(evicted, cap, "pending buffer full, oldest points dropped");
            }
        }
    }

    pub fn points(&self) -> &[DataPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Forget the first `count` points, the ones the collector confirmed.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.points.len());
        self.points.drain(..count);
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}
