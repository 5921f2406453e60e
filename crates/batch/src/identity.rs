//! Resolution of the identity batches run as.

use serde::{Deserialize, Serialize};

use policybatch_core::{BatchError, BatchResult, CompanyId, UserId};

use crate::store::{TransactionScope, read_row};

pub const USER_TABLE: &str = "res.user";
pub const ADMIN_LOGIN: &str = "admin";

/// The admin user and the company it works for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub user: UserId,
    pub company: CompanyId,
}

/// Resolves the default execution identity inside a scope.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, scope: &mut dyn TransactionScope) -> BatchResult<AdminIdentity>;
}

#[derive(Debug, Deserialize)]
struct UserRow {
    id: UserId,
    company: Option<CompanyId>,
}

/// Reads the `admin` row of the user table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredAdminIdentity;

impl IdentityResolver for StoredAdminIdentity {
    fn resolve(&self, scope: &mut dyn TransactionScope) -> BatchResult<AdminIdentity> {
        let row: UserRow = read_row(scope, USER_TABLE, ADMIN_LOGIN)?
            .ok_or_else(|| BatchError::precondition("no admin user configured"))?;
        let company = row
            .company
            .ok_or_else(|| BatchError::precondition("no company configured on admin user"))?;
        Ok(AdminIdentity {
            user: row.id,
            company,
        })
    }
}

/// Always resolves to the same identity.
#[derive(Debug, Clone, Copy)]
pub struct FixedIdentity(pub AdminIdentity);

impl IdentityResolver for FixedIdentity {
    fn resolve(&self, _scope: &mut dyn TransactionScope) -> BatchResult<AdminIdentity> {
        Ok(self.0)
    }
}
