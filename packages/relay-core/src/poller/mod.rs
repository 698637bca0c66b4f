//! Cursor-driven reader over a direction's source ledger.

use log::trace;
use std::sync::Arc;

use crate::relayer::direction::Direction;
use crate::types::{Cursor, RawMessage};
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Poll {
    /// Strictly after the requested cursor, oldest first.
    pub messages: Vec<RawMessage>,
    /// Where the next poll should start once `messages` are handled.
    pub cursor: Cursor,
    /// More history is waiting; poll again before idling.
    pub has_more: bool,
}

pub struct LedgerPoller {
    direction: Arc<dyn Direction>,
    page_size: usize,
    /// Highest cursor this poller was asked to read from. Nothing at or
    /// below it is delivered again.
    high_water: Cursor,
}

impl LedgerPoller {
    pub fn new(direction: Arc<dyn Direction>, page_size: usize) -> Self {
        Self {
            direction,
            page_size: page_size.max(1),
            high_water: Cursor::ZERO,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Reads at most one page after `since`. Calling it again with the same
    /// cursor returns the same messages; an error leaves the poller untouched.
    pub async fn poll(&mut self, since: Cursor) -> Result<Poll> {
        let floor = since.max(self.high_water);
        let page = self.direction.poll_source(floor, self.page_size).await?;
        self.high_water = floor;

        let mut messages: Vec<RawMessage> = page
            .messages
            .into_iter()
            .filter(|m| m.cursor > floor)
            .collect();
        messages.sort_by_key(|m| m.cursor);
        messages.dedup_by_key(|m| m.cursor);

        let truncated = messages.len() > self.page_size;
        messages.truncate(self.page_size);

        let mut cursor = messages.last().map(|m| m.cursor).unwrap_or(floor).max(floor);
        if !truncated {
            if let Some(scanned) = page.scanned_to {
                cursor = cursor.max(scanned);
            }
        }
        trace!(
            "{}: polled {} messages from {}, next {}",
            self.direction.name(),
            messages.len(),
            floor,
            cursor
        );
        Ok(Poll {
            messages,
            cursor,
            has_more: page.has_more || truncated,
        })
    }
}
