//! Control parameters.
//!
//! A batch run mixes business parameters (handed to the operation) with
//! control parameters that drive generation and execution. The generator
//! strips the control parameters before selection, then writes them back
//! into the job parameters so the executor can strip them again on the
//! worker side.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::warn;

use policybatch_core::params::{DATE_FORMAT, parse_date};
use policybatch_core::{BatchError, BatchResult, ParamMap, ParamMapExt};

pub const CONNECTION_DATE: &str = "connection_date";
pub const JOB_SIZE: &str = "job_size";
pub const TRANSACTION_SIZE: &str = "transaction_size";
pub const SPLIT: &str = "split";
pub const CHAIN_NAME: &str = "chain_name";
pub const RETRY: &str = "retry";
pub const DISABLE: &str = "disable";

pub const UNKNOWN_CHAIN: &str = "unknown";

/// Number of retries allowed after the first attempt.
///
/// An unbounded budget is expressed as `Option::<RetryBudget>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RetryBudget(u32);

impl RetryBudget {
    pub const NONE: Self = Self(0);

    pub const fn new(retries: u32) -> Self {
        Self(retries)
    }

    pub const fn retries(self) -> u32 {
        self.0
    }

    pub const fn max_attempts(self) -> u32 {
        self.0.saturating_add(1)
    }

    /// Map the integer `retry` parameter: negative means unbounded.
    pub fn from_param(value: i64) -> Option<Self> {
        if value < 0 {
            None
        } else {
            Some(Self(u32::try_from(value).unwrap_or(u32::MAX)))
        }
    }

    /// Inverse of [`RetryBudget::from_param`].
    pub fn to_param(budget: Option<Self>) -> i64 {
        budget.map_or(-1, |b| i64::from(b.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlParams {
    pub connection_date: NaiveDate,
    pub job_size: usize,
    pub transaction_size: usize,
    pub split: bool,
    pub chain_name: String,
    pub retry: Option<RetryBudget>,
}

impl ControlParams {
    /// Remove every control parameter from `params` and parse it.
    ///
    /// `job_size` is required. A missing `connection_date` defaults to
    /// `today` with a warning.
    pub fn extract(params: &mut ParamMap, today: NaiveDate) -> BatchResult<Self> {
        let connection_date = match params.take_date(CONNECTION_DATE)? {
            Some(date) => date,
            None => {
                warn!(default = %today, "missing parameter: connection_date");
                today
            }
        };

        let job_size = params
            .take_int(JOB_SIZE)?
            .ok_or_else(|| BatchError::invalid_param(JOB_SIZE, "required"))?;
        let job_size = non_negative(JOB_SIZE, job_size)?;

        let transaction_size = params.take_int(TRANSACTION_SIZE)?.unwrap_or(0);
        let transaction_size = non_negative(TRANSACTION_SIZE, transaction_size)?;

        let split = params.take_bool(SPLIT)?.unwrap_or(true);
        let chain_name = params
            .take_string(CHAIN_NAME)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| UNKNOWN_CHAIN.to_string());
        let retry = RetryBudget::from_param(params.take_int(RETRY)?.unwrap_or(0));

        Ok(Self {
            connection_date,
            job_size,
            transaction_size,
            split,
            chain_name,
            retry,
        })
    }

    /// True when one job commits several times.
    pub fn is_multi_transaction(&self) -> bool {
        self.transaction_size > 0 && self.transaction_size < self.job_size
    }

    /// A multi-transaction job cannot be replayed as a whole, so it must
    /// be neither resplittable nor retried.
    pub fn validate(&self) -> BatchResult<()> {
        if !self.is_multi_transaction() {
            return Ok(());
        }
        if self.split {
            return Err(BatchError::precondition(
                "jobs with a transaction_size cannot be split; set split to false \
                 in the batch configuration or pass --no-split",
            ));
        }
        if self.retry != Some(RetryBudget::NONE) {
            return Err(BatchError::precondition(
                "jobs with a transaction_size cannot be retried; set retry to 0 \
                 in the batch configuration",
            ));
        }
        Ok(())
    }

    /// Write the control parameters back into `params`.
    pub fn write_into(&self, params: &mut ParamMap) {
        params.insert(
            CONNECTION_DATE.to_string(),
            JsonValue::String(self.connection_date.format(DATE_FORMAT).to_string()),
        );
        params.insert(JOB_SIZE.to_string(), JsonValue::from(self.job_size));
        params.insert(
            TRANSACTION_SIZE.to_string(),
            JsonValue::from(self.transaction_size),
        );
        params.insert(SPLIT.to_string(), JsonValue::Bool(self.split));
        params.insert(
            CHAIN_NAME.to_string(),
            JsonValue::String(self.chain_name.clone()),
        );
        params.insert(
            RETRY.to_string(),
            JsonValue::from(RetryBudget::to_param(self.retry)),
        );
    }

    /// Business parameters merged with the control parameters.
    pub fn into_job_params(&self, business: &ParamMap) -> ParamMap {
        let mut params = business.clone();
        self.write_into(&mut params);
        params
    }
}

/// Read the `split` flag of serialized job params without consuming them.
pub fn job_allows_split(params: &ParamMap) -> BatchResult<bool> {
    match params.get(SPLIT) {
        Some(value) => policybatch_core::params::parse_bool(SPLIT, value),
        None => Ok(true),
    }
}

/// Parse a date control value that may come from the command line.
pub fn parse_connection_date(raw: &str) -> BatchResult<NaiveDate> {
    parse_date(CONNECTION_DATE, &JsonValue::String(raw.to_string()))
}

fn non_negative(name: &str, value: i64) -> BatchResult<usize> {
    usize::try_from(value)
        .map_err(|_| BatchError::invalid_param(name, format!("negative size {value}")))
}
