//! Index-side approximation of read access.
//!
//! Matches documents whose permission tokens name the principal or one of
//! its roles. Only as fresh as the last reindex of each node; the query
//! engine never relies on it for access decisions.

use serde::{Deserialize, Serialize};

use crate::models::Principal;
use crate::projection::fields;
use crate::query::Query;

/// Subjects that bypass permission checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityRoles {
    pub admin_role: String,
    pub admin_user: String,
    pub system_user: String,
}

impl Default for SecurityRoles {
    fn default() -> Self {
        Self {
            admin_role: "ROLE_ADMIN".to_string(),
            admin_user: "okmAdmin".to_string(),
            system_user: "system".to_string(),
        }
    }
}

impl SecurityRoles {
    pub fn is_superuser(&self, principal: &Principal) -> bool {
        principal.user == self.admin_user
            || principal.user == self.system_user
            || principal.has_role(&self.admin_role)
    }
}

/// Builds the permission-token filter for a principal.
pub struct ReadAccessFilter;

impl ReadAccessFilter {
    /// `None` when the principal is not restricted.
    pub fn build(principal: &Principal, security: &SecurityRoles) -> Option<Query> {
        if security.is_superuser(principal) {
            return None;
        }

        let mut clauses = vec![Query::should(Query::term(
            fields::USER_PERMISSION,
            principal.user.as_str(),
        ))];
        clauses.extend(
            principal
                .roles
                .iter()
                .map(|role| Query::should(Query::term(fields::ROLE_PERMISSION, role.as_str()))),
        );
        Some(Query::bool(clauses))
    }

    /// `query` restricted by the principal's filter, if any.
    pub fn apply(query: Query, principal: &Principal, security: &SecurityRoles) -> Query {
        match Self::build(principal, security) {
            Some(filter) => Query::bool(vec![Query::must(query), Query::must(filter)]),
            None => query,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_lists_user_and_roles() {
        let p = Principal::new("alice", ["ROLE_USER", "ROLE_HR"]);
        let q = ReadAccessFilter::build(&p, &SecurityRoles::default()).unwrap();
        assert_eq!(
            q.to_string(),
            "userPermission:alice rolePermission:ROLE_HR rolePermission:ROLE_USER"
        );
    }

    #[test]
    fn superusers_are_unfiltered() {
        let security = SecurityRoles::default();
        assert!(ReadAccessFilter::build(&Principal::new("okmAdmin", Vec::<String>::new()), &security).is_none());
        assert!(ReadAccessFilter::build(&Principal::new("system", Vec::<String>::new()), &security).is_none());
        assert!(ReadAccessFilter::build(&Principal::new("bob", ["ROLE_ADMIN"]), &security).is_none());
    }

    #[test]
    fn apply_requires_both() {
        let p = Principal::new("alice", Vec::<String>::new());
        let q = ReadAccessFilter::apply(Query::term("text", "beta"), &p, &SecurityRoles::default());
        assert_eq!(q.to_string(), "+text:beta +(userPermission:alice)");
    }
}
