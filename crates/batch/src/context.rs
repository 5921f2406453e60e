//! Per-scope execution context.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use policybatch_core::{CompanyId, UserId};

/// Context carried by a transactional scope.
///
/// The generator marks selection as `from_batch`; the executor additionally
/// sets `auto_accept_warnings` and the user to notify. Async workers set
/// `async_worker` so that guarded methods never re-dispatch themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub date: Option<NaiveDate>,
    pub company: Option<CompanyId>,
    pub from_batch: bool,
    pub async_worker: bool,
    pub force_synchronous: bool,
    pub will_be_rolled_back: bool,
    pub auto_accept_warnings: bool,
    pub user_to_notify: Option<UserId>,
    pub job_size: Option<usize>,
    pub transaction_size: Option<usize>,
}

impl ExecutionContext {
    pub fn for_batch(date: NaiveDate, company: CompanyId) -> Self {
        Self {
            date: Some(date),
            company: Some(company),
            from_batch: true,
            ..Self::default()
        }
    }

    pub fn with_sizes(mut self, job_size: usize, transaction_size: usize) -> Self {
        self.job_size = Some(job_size);
        self.transaction_size = Some(transaction_size);
        self
    }

    pub fn async_worker() -> Self {
        Self {
            async_worker: true,
            ..Self::default()
        }
    }

    /// Whether async-capable methods must run inline in this context.
    pub fn forces_synchronous(&self) -> bool {
        self.async_worker || self.from_batch || self.force_synchronous || self.will_be_rolled_back
    }
}
