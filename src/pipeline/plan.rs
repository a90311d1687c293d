//! Page ranges and the windows we split them into.

use std::ops::RangeInclusive;

use crate::prelude::*;

/// An inclusive range of 1-based page numbers, resolved against the
/// document's page count. May be empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    /// First page, at least 1.
    pub first_page: usize,
    /// Last page. Less than `first_page` if the range is empty.
    pub last_page: usize,
}

impl PageRange {
    /// Resolve a user-supplied range against the total page count.
    ///
    /// A `last_page` of zero or less counts back from the end of the
    /// document, so with 20 pages, 0 means page 20 and -5 means page 15. A
    /// positive `last_page` past the end is clipped to the last page.
    pub fn resolve(first_page: usize, last_page: i64, total_pages: usize) -> Result<Self> {
        if first_page == 0 {
            return Err(anyhow!("first page must be at least 1 (pages are 1-based)"));
        }
        let total = i64::try_from(total_pages).context("page count is too large")?;
        let last = if last_page <= 0 {
            total.saturating_add(last_page)
        } else {
            last_page.min(total)
        };
        // Negative results just mean "nothing to do".
        let last_page = usize::try_from(last.max(0)).context("page number is too large")?;
        Ok(Self {
            first_page,
            last_page,
        })
    }

    /// Does this range contain no pages?
    pub fn is_empty(&self) -> bool {
        self.first_page > self.last_page
    }

    /// How many pages are in this range?
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.last_page - self.first_page + 1
        }
    }

    /// Iterate over page numbers.
    pub fn pages(&self) -> RangeInclusive<usize> {
        self.first_page..=self.last_page
    }
}

/// A contiguous, inclusive group of pages rendered and OCRed together.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    /// First page in the window.
    pub start: usize,
    /// Last page in the window.
    pub end: usize,
}

impl Window {
    /// Number of pages in the window. Windows are never empty.
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Iterate over page numbers.
    pub fn pages(&self) -> RangeInclusive<usize> {
        self.start..=self.end
    }
}

/// Split a page range into windows.
///
/// Each window holds `max(batch_size, parallelism)` pages, so that every
/// window can keep all workers busy. Only the final window may be shorter.
pub fn plan_windows(range: PageRange, batch_size: usize, parallelism: usize) -> Vec<Window> {
    let size = batch_size.max(parallelism).max(1);
    if range.is_empty() {
        return vec![];
    }
    (range.first_page..=range.last_page)
        .step_by(size)
        .map(|start| Window {
            start,
            end: start.saturating_add(size - 1).min(range.last_page),
        })
        .collect()
}
