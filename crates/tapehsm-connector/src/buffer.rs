//! Grow-and-retry for kernel calls that fill a caller-sized buffer.
//!
//! A call is first attempted with the configured initial size. When the kernel
//! answers [`DmError::TooSmall`], the buffer is resized to the size it reported
//! and the call is repeated. A reported size that does not exceed the current
//! one means the kernel and the caller disagree about units and is an error.

use tracing::debug;

use crate::dm::{DmError, DmResult};

/// Upper bound on growth steps; the kernel-reported size normally converges in one.
pub const MAX_GROWTH_STEPS: usize = 8;

/// Runs `query` with a capacity, growing it while the kernel reports `TooSmall`.
pub fn query_with_growth<R, F>(initial: usize, mut query: F) -> DmResult<R>
where
    F: FnMut(usize) -> DmResult<R>,
{
    let mut capacity = initial.max(1);

    for _ in 0..MAX_GROWTH_STEPS {
        match query(capacity) {
            Err(DmError::TooSmall { required }) if required > capacity => {
                debug!(capacity, required, "buffer too small, growing");
                capacity = required;
            }
            Err(DmError::TooSmall { required }) => {
                debug!(capacity, required, "kernel reported a non-growing size");
                return Err(DmError::Os(libc::E2BIG));
            }
            other => return other,
        }
    }

    Err(DmError::Os(libc::E2BIG))
}

/// Fills a typed buffer, growing it as needed, and returns the filled prefix.
pub fn collect_with_growth<T, F>(initial: usize, mut fill: F) -> DmResult<Vec<T>>
where
    T: Clone + Default,
    F: FnMut(&mut [T]) -> DmResult<usize>,
{
    query_with_growth(initial, |capacity| {
        let mut buf = vec![T::default(); capacity];
        let n = fill(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fits_first_time() {
        let mut calls = 0;
        let out = collect_with_growth::<u32, _>(4, |buf| {
            calls += 1;
            buf[0] = 7;
            buf[1] = 8;
            Ok(2)
        })
        .unwrap();
        assert_eq!(out, vec![7, 8]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_grows_to_reported_size() {
        let items = [1u32, 2, 3, 4, 5, 6];
        let mut seen = Vec::new();
        let out = collect_with_growth::<u32, _>(2, |buf| {
            seen.push(buf.len());
            if buf.len() < items.len() {
                return Err(DmError::TooSmall {
                    required: items.len(),
                });
            }
            buf[..items.len()].copy_from_slice(&items);
            Ok(items.len())
        })
        .unwrap();
        assert_eq!(out, items.to_vec());
        assert_eq!(seen, vec![2, 6]);
    }

    #[test]
    fn test_zero_initial_capacity_is_raised() {
        let out = query_with_growth(0, |cap| Ok(cap)).unwrap();
        assert_eq!(out, 1);
    }

    #[test]
    fn test_non_growing_report_is_error() {
        let result = query_with_growth::<(), _>(8, |_| Err(DmError::TooSmall { required: 8 }));
        assert_eq!(result, Err(DmError::Os(libc::E2BIG)));
    }

    #[test]
    fn test_other_errors_pass_through() {
        let result = query_with_growth::<(), _>(8, |_| Err(DmError::PermissionDenied));
        assert_eq!(result, Err(DmError::PermissionDenied));
    }

    #[test]
    fn test_runaway_growth_is_bounded() {
        let mut calls = 0;
        let result = query_with_growth::<(), _>(1, |cap| {
            calls += 1;
            Err(DmError::TooSmall { required: cap * 2 })
        });
        assert!(result.is_err());
        assert_eq!(calls, MAX_GROWTH_STEPS);
    }
}
