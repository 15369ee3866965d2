/// Role-based access control for mediator operations.
///
/// The permission matrix maps `(role, operation)` to allow/deny, always
/// evaluated inside the tenant boundary: a principal authorized in tenant A
/// never reads or writes tenant B's records, regardless of id collisions.
/// The tenant check runs before any record lookup, so a cross-tenant caller
/// learns nothing about whether a record exists.
use crate::error::{StratumError, StratumResult};
use crate::types::{MemoryType, Operation, Principal, Role};

/// Evaluates the role/operation permission matrix.
///
/// The matrix itself is fixed:
///
/// | role    | read       | write            | delete           | search |
/// |---------|------------|------------------|------------------|--------|
/// | Ceo     | all        | all              | all              | all    |
/// | Manager | all        | insights only    | insights only    | all    |
/// | Member  | own        | own              | own              | own*   |
///
/// (*) Member search is allowed here; the mediator post-filters result
/// pages to records the member owns.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessControl;

impl AccessControl {
    /// Create the access control module.
    pub fn new() -> Self {
        Self
    }

    /// Authorize an operation for a principal.
    ///
    /// `record_type` is `None` when the type is not yet known (reads look
    /// the record up only after this check passes). `owner` is `None` when
    /// ownership is resolved post-fetch; pass the record's owner whenever
    /// it is known so member-scoped checks apply.
    pub fn authorize(
        &self,
        principal: &Principal,
        tenant: &str,
        record_type: Option<MemoryType>,
        operation: Operation,
        owner: Option<&str>,
    ) -> StratumResult<()> {
        // Tenant boundary first. Always a permission error, never a
        // not-found, so existence does not leak across tenants.
        if principal.tenant != tenant {
            return Err(self.denied(principal, operation, "tenant boundary violation"));
        }

        match (principal.role, operation) {
            (Role::Ceo, _) => Ok(()),

            (Role::Manager, Operation::Read | Operation::Search) => Ok(()),
            (Role::Manager, Operation::Write | Operation::Delete) => match record_type {
                Some(MemoryType::Insight) => Ok(()),
                Some(other) => Err(self.denied(
                    principal,
                    operation,
                    &format!("managers may only {} insights, not {}", operation.as_str(), other),
                )),
                // Type unresolved yet: allowed here, re-checked post-fetch.
                None => Ok(()),
            },

            // Member search is post-filtered by the mediator.
            (Role::Member, Operation::Search) => Ok(()),
            (Role::Member, _) => match owner {
                Some(record_owner) if record_owner == principal.id => Ok(()),
                None => Ok(()),
                Some(_) => Err(self.denied(
                    principal,
                    operation,
                    "members may only access their own records",
                )),
            },
        }
    }

    fn denied(&self, principal: &Principal, operation: Operation, reason: &str) -> StratumError {
        StratumError::Permission {
            principal: principal.id.clone(),
            reason: format!("{} denied: {}", operation.as_str(), reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceo() -> Principal {
        Principal::new("carol", "acme", Role::Ceo)
    }

    fn manager() -> Principal {
        Principal::new("mallory", "acme", Role::Manager)
    }

    fn member() -> Principal {
        Principal::new("alice", "acme", Role::Member)
    }

    #[test]
    fn test_tenant_boundary_always_denied() {
        let access = AccessControl::new();

        for principal in [ceo(), manager(), member()] {
            let err = access
                .authorize(
                    &principal,
                    "globex",
                    Some(MemoryType::Chat),
                    Operation::Read,
                    None,
                )
                .unwrap_err();
            assert!(matches!(err, StratumError::Permission { .. }));
        }
    }

    #[test]
    fn test_ceo_full_access() {
        let access = AccessControl::new();

        for op in [
            Operation::Read,
            Operation::Write,
            Operation::Delete,
            Operation::Search,
        ] {
            access
                .authorize(&ceo(), "acme", Some(MemoryType::Decision), op, Some("bob"))
                .unwrap();
        }
    }

    #[test]
    fn test_manager_reads_everything_writes_insights_only() {
        let access = AccessControl::new();

        access
            .authorize(
                &manager(),
                "acme",
                Some(MemoryType::Chat),
                Operation::Read,
                Some("bob"),
            )
            .unwrap();
        access
            .authorize(
                &manager(),
                "acme",
                Some(MemoryType::Insight),
                Operation::Write,
                Some("bob"),
            )
            .unwrap();
        access
            .authorize(
                &manager(),
                "acme",
                Some(MemoryType::Insight),
                Operation::Delete,
                Some("bob"),
            )
            .unwrap();

        let err = access
            .authorize(
                &manager(),
                "acme",
                Some(MemoryType::Chat),
                Operation::Write,
                Some("mallory"),
            )
            .unwrap_err();
        assert!(matches!(err, StratumError::Permission { .. }));
    }

    #[test]
    fn test_member_own_records_only() {
        let access = AccessControl::new();

        access
            .authorize(
                &member(),
                "acme",
                Some(MemoryType::Chat),
                Operation::Write,
                Some("alice"),
            )
            .unwrap();

        let err = access
            .authorize(
                &member(),
                "acme",
                Some(MemoryType::Chat),
                Operation::Read,
                Some("bob"),
            )
            .unwrap_err();
        assert!(matches!(err, StratumError::Permission { .. }));

        // Ownership unresolved yet: allowed here, checked post-fetch.
        access
            .authorize(
                &member(),
                "acme",
                None,
                Operation::Read,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_member_search_allowed_for_post_filtering() {
        let access = AccessControl::new();
        access
            .authorize(
                &member(),
                "acme",
                Some(MemoryType::Event),
                Operation::Search,
                None,
            )
            .unwrap();
    }
}
