//! Point-in-time views of the pool, for logs and reports.

use serde::Serialize;

/// Snapshot of pool occupancy.
///
/// `free + leased == capacity` while the pool is open. After shutdown `free`
/// drops to zero and `leased` counts handles still out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub free: usize,
    pub leased: usize,
    /// Acquirers currently parked waiting for a handle.
    pub waiters: usize,
    pub closed: bool,
}

impl PoolStatus {
    pub fn is_exhausted(&self) -> bool {
        !self.closed && self.free == 0
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.leased as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_for_reports() {
        let status = PoolStatus {
            capacity: 4,
            free: 1,
            leased: 3,
            waiters: 2,
            closed: false,
        };
        insta::assert_json_snapshot!(status, @r#"
        {
          "capacity": 4,
          "free": 1,
          "leased": 3,
          "waiters": 2,
          "closed": false
        }
        "#);
    }

    #[test]
    fn exhausted_only_while_open() {
        let mut status = PoolStatus {
            capacity: 2,
            free: 0,
            leased: 2,
            waiters: 0,
            closed: false,
        };
        assert!(status.is_exhausted());
        assert_eq!(status.utilization(), 1.0);

        status.closed = true;
        assert!(!status.is_exhausted());
    }
}
