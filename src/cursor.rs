//! Per-agency resumable pagination cursor.
//!
//! A [`FetchProgress`] record tracks how far a crawl of one agency's search
//! results has got. Pages are 0-based here; the corpus client translates to
//! the API's 1-based numbering.
//!
//! ```text
//! NotStarted(0) ──start──▶ InProgress(1) ──advance past last page──▶ Complete(2)
//!                               ▲                                        │
//!                               └──────────────── reset ─────────────────┘
//! ```
//!
//! `current_page` moves only through [`FetchProgress::advance`], which the
//! orchestrator calls after a page's writes are stored. A page whose writes
//! fail is simply not advanced past, so the next resume repeats it.

use std::ops::Range;

use serde::Serialize;

/// Three-state completion marker persisted as `is_complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    NotStarted,
    InProgress,
    Complete,
}

impl CompletionState {
    pub fn as_i64(self) -> i64 {
        match self {
            CompletionState::NotStarted => 0,
            CompletionState::InProgress => 1,
            CompletionState::Complete => 2,
        }
    }

    pub fn from_i64(code: i64) -> Self {
        match code {
            1 => CompletionState::InProgress,
            2 => CompletionState::Complete,
            _ => CompletionState::NotStarted,
        }
    }
}

/// `ceil(total_count / per_page)`. A zero page size yields zero pages.
pub fn total_pages(total_count: u64, per_page: u32) -> u32 {
    if per_page == 0 {
        return 0;
    }
    let pages = total_count.div_ceil(u64::from(per_page));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Persisted cursor for one agency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchProgress {
    pub agency_id: i64,
    pub total_count: u64,
    pub per_page: u32,
    pub current_page: u32,
    pub state: CompletionState,
    /// Year filter of the run that created this record, reused on resume.
    pub target_year: Option<i32>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What the caller asks for when starting a crawl.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub total_count: u64,
    pub per_page: u32,
    pub start_page: Option<u32>,
    pub target_year: Option<i32>,
    pub reset: bool,
}

impl FetchProgress {
    /// Fresh in-progress record.
    pub fn start(agency_id: i64, request: &StartRequest, now: i64) -> Self {
        Self {
            agency_id,
            total_count: request.total_count,
            per_page: request.per_page,
            current_page: request.start_page.unwrap_or(0),
            state: CompletionState::InProgress,
            target_year: request.target_year,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resume `existing` if there is one and no reset was asked for,
    /// otherwise start over.
    ///
    /// On resume the stored page size and position are kept, since changing
    /// either would shift page boundaries under already-processed results.
    /// The total is refreshed to the latest count and a caller-supplied year
    /// replaces the stored one; without one the stored year carries over.
    pub fn start_or_resume(
        existing: Option<FetchProgress>,
        agency_id: i64,
        request: &StartRequest,
        now: i64,
    ) -> Self {
        match existing {
            Some(mut progress) if !request.reset => {
                if request.total_count > 0 {
                    progress.total_count = request.total_count;
                }
                if request.target_year.is_some() {
                    progress.target_year = request.target_year;
                }
                if progress.state == CompletionState::NotStarted {
                    progress.state = CompletionState::InProgress;
                }
                progress.updated_at = now;
                progress
            }
            Some(previous) => {
                let mut fresh = Self::start(agency_id, request, now);
                fresh.created_at = previous.created_at;
                fresh
            }
            None => Self::start(agency_id, request, now),
        }
    }

    pub fn total_pages(&self) -> u32 {
        total_pages(self.total_count, self.per_page)
    }

    pub fn is_complete(&self) -> bool {
        self.state == CompletionState::Complete
    }

    /// Pages still to be fetched.
    pub fn remaining_pages(&self) -> Range<u32> {
        if self.is_complete() {
            return 0..0;
        }
        let end = self.total_pages();
        self.current_page.min(end)..end
    }

    /// Record that the current page is stored. Returns `true` once the
    /// cursor has reached the last page.
    pub fn advance(&mut self, now: i64) -> bool {
        self.current_page = self.current_page.saturating_add(1);
        self.updated_at = now;
        if self.current_page >= self.total_pages() {
            self.state = CompletionState::Complete;
        }
        self.is_complete()
    }

    /// Jump to the end after a concurrent run whose workers all finished.
    pub fn complete(&mut self, now: i64) {
        self.current_page = self.current_page.max(self.total_pages());
        self.state = CompletionState::Complete;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(total_count: u64, per_page: u32) -> StartRequest {
        StartRequest {
            total_count,
            per_page,
            ..Default::default()
        }
    }

    #[test]
    fn pagination_math() {
        assert_eq!(total_pages(95, 20), 5);
        assert_eq!(total_pages(100, 20), 5);
        assert_eq!(total_pages(101, 20), 6);
        assert_eq!(total_pages(0, 20), 0);
        assert_eq!(total_pages(10, 0), 0);
    }

    #[test]
    fn completes_after_last_page() {
        let mut p = FetchProgress::start(1, &request(95, 20), 0);
        assert_eq!(p.state, CompletionState::InProgress);
        assert_eq!(p.remaining_pages(), 0..5);
        for _ in 0..4 {
            assert!(!p.advance(1));
        }
        assert!(p.advance(2));
        assert_eq!(p.current_page, 5);
        assert_eq!(p.state.as_i64(), 2);
        assert!(p.remaining_pages().is_empty());
    }

    #[test]
    fn resume_keeps_position_and_year() {
        let mut first = FetchProgress::start(
            3,
            &StartRequest {
                target_year: Some(2024),
                ..request(95, 20)
            },
            10,
        );
        first.advance(11);
        first.advance(12);

        let resumed = FetchProgress::start_or_resume(Some(first), 3, &request(97, 50), 20);
        assert_eq!(resumed.current_page, 2);
        assert_eq!(resumed.per_page, 20);
        assert_eq!(resumed.total_count, 97);
        assert_eq!(resumed.target_year, Some(2024));
        assert_eq!(resumed.remaining_pages(), 2..5);
    }

    #[test]
    fn reset_restarts_completed_cursor() {
        let mut done = FetchProgress::start(3, &request(20, 20), 10);
        done.advance(11);
        assert!(done.is_complete());

        let unchanged = FetchProgress::start_or_resume(Some(done.clone()), 3, &request(20, 20), 12);
        assert!(unchanged.is_complete());

        let reset = FetchProgress::start_or_resume(
            Some(done),
            3,
            &StartRequest {
                reset: true,
                start_page: Some(1),
                ..request(60, 20)
            },
            13,
        );
        assert_eq!(reset.state, CompletionState::InProgress);
        assert_eq!(reset.current_page, 1);
        assert_eq!(reset.created_at, 10);
        assert_eq!(reset.remaining_pages(), 1..3);
    }

    #[test]
    fn complete_jumps_to_end() {
        let mut p = FetchProgress::start(1, &request(95, 20), 0);
        p.complete(5);
        assert_eq!(p.current_page, 5);
        assert!(p.is_complete());
    }

    #[test]
    fn unknown_state_code_reads_as_not_started() {
        assert_eq!(CompletionState::from_i64(9), CompletionState::NotStarted);
        assert_eq!(CompletionState::from_i64(1), CompletionState::InProgress);
    }
}
