//! Splits the `[min, max]` id domain into fixed-size inclusive windows.
//!
//! The only state is the cursor (the start of the next window), so a run that
//! was interrupted can be resumed from any recorded cursor.

use std::fmt;
use std::num::NonZeroU32;

use crate::error::BackfillError;
use crate::model::Window;

pub const DEFAULT_CHUNK_SIZE: u32 = 200;

/// Rows per window. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSize(NonZeroU32);

impl ChunkSize {
    pub fn new(value: u32) -> Result<Self, BackfillError> {
        NonZeroU32::new(value).map(Self).ok_or_else(|| {
            BackfillError::InvalidConfig("chunk size must be a positive integer".to_string())
        })
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    fn as_i64(self) -> i64 {
        i64::from(self.0.get())
    }
}

impl Default for ChunkSize {
    fn default() -> Self {
        Self(NonZeroU32::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroU32::MIN))
    }
}

impl fmt::Display for ChunkSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Window starting at `cursor` and spanning `chunk_size` ids.
pub fn next_window(cursor: i64, chunk_size: ChunkSize) -> Window {
    Window {
        start: cursor,
        end: cursor.saturating_add(chunk_size.as_i64() - 1),
    }
}

/// Lazy sequence of contiguous windows covering `[cursor, max]`.
///
/// The last window may extend past `max`; ids beyond `max` simply match no rows.
#[derive(Debug, Clone)]
pub struct Windows {
    cursor: Option<i64>,
    max: i64,
    chunk_size: ChunkSize,
}

impl Windows {
    pub fn new(min: i64, max: i64, chunk_size: ChunkSize) -> Self {
        Self::resume(min, max, chunk_size)
    }

    /// Restart from a previously recorded cursor.
    pub fn resume(cursor: i64, max: i64, chunk_size: ChunkSize) -> Self {
        Self {
            cursor: Some(cursor),
            max,
            chunk_size,
        }
    }

    /// Start of the next window, or `None` once the domain is exhausted.
    pub fn cursor(&self) -> Option<i64> {
        self.cursor.filter(|cursor| *cursor <= self.max)
    }
}

impl Iterator for Windows {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let cursor = self.cursor()?;
        let window = next_window(cursor, self.chunk_size);
        // A window ending at i64::MAX has no successor.
        self.cursor = window.end.checked_add(1);
        Some(window)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn chunk(value: u32) -> ChunkSize {
        ChunkSize::new(value).expect("chunk size")
    }

    #[test]
    fn windows_cover_domain_with_trailing_overshoot() {
        let windows: Vec<Window> = Windows::new(7, 23, chunk(10)).collect();
        assert_eq!(
            windows,
            vec![Window { start: 7, end: 16 }, Window { start: 17, end: 26 }]
        );
        for id in 7..=23 {
            let hits = windows.iter().filter(|window| window.contains(id)).count();
            assert_eq!(hits, 1, "id {id} must fall in exactly one window");
        }
    }

    #[test]
    fn single_id_domain_yields_one_window() {
        let windows: Vec<Window> = Windows::new(5, 5, chunk(200)).collect();
        assert_eq!(windows, vec![Window { start: 5, end: 204 }]);
    }

    #[test]
    fn resume_continues_from_cursor() {
        let mut windows = Windows::new(1, 30, chunk(10));
        assert_eq!(windows.next(), Some(Window { start: 1, end: 10 }));
        let cursor = windows.cursor().expect("cursor");
        assert_eq!(cursor, 11);

        let resumed: Vec<Window> = Windows::resume(cursor, 30, chunk(10)).collect();
        assert_eq!(
            resumed,
            vec![Window { start: 11, end: 20 }, Window { start: 21, end: 30 }]
        );
    }

    #[test]
    fn cursor_is_none_when_exhausted() {
        let mut windows = Windows::new(1, 3, chunk(5));
        assert!(windows.next().is_some());
        assert_eq!(windows.cursor(), None);
        assert_eq!(windows.next(), None);
    }

    #[test]
    fn window_at_top_of_domain_terminates() {
        let windows: Vec<Window> = Windows::new(i64::MAX - 1, i64::MAX, chunk(10)).collect();
        assert_eq!(
            windows,
            vec![Window {
                start: i64::MAX - 1,
                end: i64::MAX
            }]
        );
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert!(ChunkSize::new(0).is_err());
        assert_eq!(ChunkSize::default().get(), DEFAULT_CHUNK_SIZE);
    }

    proptest! {
        #[test]
        fn prop_windows_partition_domain(
            min in 1_i64..500,
            span in 0_i64..500,
            size in 1_u32..64,
        ) {
            let max = min + span;
            let windows: Vec<Window> = Windows::new(min, max, chunk(size)).collect();
            prop_assert_eq!(windows[0].start, min);
            for pair in windows.windows(2) {
                prop_assert_eq!(pair[0].end + 1, pair[1].start);
            }
            let last = windows.last().expect("at least one window");
            prop_assert!(last.end >= max);
            prop_assert!(last.start <= max);
            prop_assert_eq!(windows.len() as i64, (span + i64::from(size)) / i64::from(size));
        }
    }
}
