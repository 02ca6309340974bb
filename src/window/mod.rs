//! Windowing.
//!
//! Windows are aligned, fixed-length intervals of event time. A
//! window is identified by its [`WindowKey`]: the index of the window
//! counting from the alignment instant. Window start times are
//! inclusive, end times are exclusive.
//!
//! A window closes once the watermark reaches its end. Records that
//! show up for a window that has already closed are late and are
//! dropped; allowed lateness is honoured upstream by holding the
//! watermark back.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

pub mod watermark;

pub use watermark::*;

/// Unique ID for a window coming from a single [`WindowDefinition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey(pub i64);

/// The kind of windows to aggregate over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDefinition {
    size: Duration,
    slide: Duration,
    align_to: DateTime<Utc>,
}

impl WindowDefinition {
    /// Windows that cover all time without overlapping. Each record
    /// falls in exactly one window.
    pub fn tumbling(size: Duration) -> Self {
        Self::sliding(size, size)
    }

    /// Windows of length `size`, a new one starting every `slide`.
    ///
    /// If `slide < size`, windows overlap and each record falls into
    /// several. If `slide > size` there are gaps between windows and
    /// a record may fall in none.
    pub fn sliding(size: Duration, slide: Duration) -> Self {
        Self {
            size,
            slide,
            align_to: DateTime::UNIX_EPOCH,
        }
    }

    /// Align windows so this instant starts a window.
    pub fn aligned_to(mut self, align_to: DateTime<Utc>) -> Self {
        self.align_to = align_to;
        self
    }

    pub fn size(&self) -> Duration {
        self.size
    }

    pub fn slide(&self) -> Duration {
        self.slide
    }

    pub fn is_tumbling(&self) -> bool {
        self.size == self.slide
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigurationError> {
        if self.size.num_milliseconds() <= 0 {
            return Err(ConfigurationError::InvalidWindow(format!(
                "window size must be at least 1ms, got {}",
                self.size
            )));
        }
        if self.slide.num_milliseconds() <= 0 {
            return Err(ConfigurationError::InvalidWindow(format!(
                "window slide must be at least 1ms, got {}",
                self.slide
            )));
        }
        Ok(())
    }

    pub fn window_start(&self, key: WindowKey) -> Option<DateTime<Utc>> {
        let offset = self.slide.num_milliseconds().checked_mul(key.0)?;
        self.align_to
            .checked_add_signed(Duration::try_milliseconds(offset)?)
    }

    /// Yields all windows and their bounds that contain a given
    /// time.
    pub fn intersects(&self, time: DateTime<Utc>) -> impl Iterator<Item = WindowBounds> + '_ {
        let slide_ms = self.slide.num_milliseconds().max(1);
        let since_close_of_first_window =
            time.signed_duration_since(self.align_to) - self.size;
        // Round towards -inf so windows before the alignment instant
        // are found too.
        let first_window_idx = since_close_of_first_window
            .num_milliseconds()
            .div_euclid(slide_ms)
            + 1;
        // Always try at least one window if slide > size, it might
        // be filtered out.
        let num_windows = std::cmp::max(
            (self.size.num_milliseconds() + slide_ms - 1).div_euclid(slide_ms),
            1,
        );

        (0..num_windows).filter_map(move |i| {
            let key = WindowKey(first_window_idx + i);
            let start = self.window_start(key)?;
            let end = start.checked_add_signed(self.size)?;
            (start <= time && time < end).then_some(WindowBounds { key, start, end })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowBounds {
    pub key: WindowKey,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Result of one key's aggregation over one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowResult<K, R> {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub key: K,
    pub result: R,
}
