//! Key encoding utilities for `RocksDB`.
//!
//! Index keys are concatenations of fixed-width components so that prefix
//! scans select exactly one owner, and sequence numbers are big-endian so that
//! iteration order matches append order.

use prism_core::{AccountId, ApprovalId, BudgetPeriod, ProjectId, ResourceId};

use crate::error::{Result, StoreError};
use crate::schema::cf;

const RESOURCE_LEN: usize = 32;
const UUID_LEN: usize = 16;
const PERIOD_LEN: usize = 7;

/// Encode a resource key (just the resource ID bytes).
#[must_use]
pub fn resource_key(resource_id: &ResourceId) -> Vec<u8> {
    resource_id.as_bytes().to_vec()
}

/// Encode a state-resource index key: `state || resource_id`.
#[must_use]
pub fn state_resource_key(state: u8, resource_id: &ResourceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + RESOURCE_LEN);
    key.push(state);
    key.extend_from_slice(resource_id.as_bytes());
    key
}

/// Encode an account-resource index key: `account_id || resource_id`.
#[must_use]
pub fn account_resource_key(account_id: &AccountId, resource_id: &ResourceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(UUID_LEN + RESOURCE_LEN);
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(resource_id.as_bytes());
    key
}

/// Extract the resource ID from the tail of an index key.
///
/// # Errors
///
/// Returns `StoreError::MalformedKey` if the key is shorter than a resource ID.
pub fn resource_id_suffix(cf: &'static str, key: &[u8]) -> Result<ResourceId> {
    let start = key
        .len()
        .checked_sub(RESOURCE_LEN)
        .ok_or(StoreError::MalformedKey { cf, len: key.len() })?;
    let mut bytes = [0u8; RESOURCE_LEN];
    bytes.copy_from_slice(&key[start..]);
    Ok(ResourceId::from_bytes(bytes))
}

/// Encode an account key.
#[must_use]
pub fn account_key(account_id: &AccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Encode a parent-child index key: `parent_id || account_id`.
#[must_use]
pub fn parent_child_key(parent_id: &AccountId, account_id: &AccountId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * UUID_LEN);
    key.extend_from_slice(parent_id.as_bytes());
    key.extend_from_slice(account_id.as_bytes());
    key
}

/// Extract the child account ID from a parent-child key.
///
/// # Errors
///
/// Returns `StoreError::MalformedKey` if the key is not 32 bytes.
pub fn child_from_parent_key(key: &[u8]) -> Result<AccountId> {
    if key.len() != 2 * UUID_LEN {
        return Err(StoreError::MalformedKey {
            cf: cf::ACCOUNTS_BY_PARENT,
            len: key.len(),
        });
    }
    let mut bytes = [0u8; UUID_LEN];
    bytes.copy_from_slice(&key[UUID_LEN..]);
    Ok(AccountId::from_bytes(bytes))
}

/// Encode a journal key: the big-endian sequence number.
#[must_use]
pub fn journal_key(seq: u64) -> Vec<u8> {
    seq.to_be_bytes().to_vec()
}

/// Decode a journal key.
///
/// # Errors
///
/// Returns `StoreError::MalformedKey` if the key is not 8 bytes.
pub fn seq_from_journal_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| StoreError::MalformedKey {
        cf: cf::JOURNAL,
        len: key.len(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

/// Encode an account-period prefix: `account_id || YYYY-MM`.
#[must_use]
pub fn account_period_prefix(account_id: &AccountId, period: BudgetPeriod) -> Vec<u8> {
    let mut key = Vec::with_capacity(UUID_LEN + PERIOD_LEN);
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(period.to_string().as_bytes());
    key
}

/// Encode a cost index key: `account_id || YYYY-MM || seq`.
#[must_use]
pub fn cost_key(account_id: &AccountId, period: BudgetPeriod, seq: u64) -> Vec<u8> {
    let mut key = account_period_prefix(account_id, period);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Encode an approval key.
#[must_use]
pub fn approval_key(approval_id: &ApprovalId) -> Vec<u8> {
    approval_id.as_bytes().to_vec()
}

/// Encode a status-approval index key: `status || approval_id`.
#[must_use]
pub fn status_approval_key(status: u8, approval_id: &ApprovalId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + UUID_LEN);
    key.push(status);
    key.extend_from_slice(approval_id.as_bytes());
    key
}

/// Extract the approval ID from a status-approval key.
///
/// # Errors
///
/// Returns `StoreError::MalformedKey` if the key is not 17 bytes.
pub fn approval_from_status_key(key: &[u8]) -> Result<ApprovalId> {
    if key.len() != 1 + UUID_LEN {
        return Err(StoreError::MalformedKey {
            cf: cf::APPROVALS_BY_STATUS,
            len: key.len(),
        });
    }
    let mut bytes = [0u8; UUID_LEN];
    bytes.copy_from_slice(&key[1..]);
    Ok(ApprovalId::from_bytes(bytes))
}

/// Encode a policy key.
#[must_use]
pub fn policy_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}

/// Meta key holding a project's default policy name.
#[must_use]
pub fn project_policy_key(project_id: &ProjectId) -> Vec<u8> {
    let mut key = b"project-policy/".to_vec();
    key.extend_from_slice(project_id.as_bytes());
    key
}

/// Meta key holding the daemon checkpoint.
pub const CHECKPOINT_KEY: &[u8] = b"checkpoint";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_suffix_roundtrip() {
        let account = AccountId::generate();
        let resource = ResourceId::from_bytes([7u8; 32]);

        let key = account_resource_key(&account, &resource);
        assert_eq!(key.len(), 48);
        assert_eq!(
            resource_id_suffix(cf::RESOURCES_BY_ACCOUNT, &key).unwrap(),
            resource
        );

        let key = state_resource_key(2, &resource);
        assert_eq!(
            resource_id_suffix(cf::RESOURCES_BY_STATE, &key).unwrap(),
            resource
        );
    }

    #[test]
    fn short_keys_are_rejected() {
        assert!(matches!(
            resource_id_suffix(cf::RESOURCES_BY_STATE, &[1, 2, 3]),
            Err(StoreError::MalformedKey { len: 3, .. })
        ));
        assert!(seq_from_journal_key(&[0, 1]).is_err());
        assert!(child_from_parent_key(&[0; 5]).is_err());
    }

    #[test]
    fn cost_keys_sort_by_sequence_within_period() {
        let account = AccountId::generate();
        let period = BudgetPeriod::new(2026, 10).unwrap();
        let prefix = account_period_prefix(&account, period);

        let k1 = cost_key(&account, period, 9);
        let k2 = cost_key(&account, period, 256);
        assert!(k1.starts_with(&prefix));
        assert!(k2.starts_with(&prefix));
        assert!(k1 < k2);

        let other = cost_key(&account, period.next(), 1);
        assert!(!other.starts_with(&prefix));
    }

    #[test]
    fn parent_child_roundtrip() {
        let parent = AccountId::generate();
        let child = AccountId::generate();
        let key = parent_child_key(&parent, &child);
        assert!(key.starts_with(&account_key(&parent)));
        assert_eq!(child_from_parent_key(&key).unwrap(), child);
    }

    #[test]
    fn journal_keys_order_numerically() {
        assert!(journal_key(2) < journal_key(10));
        assert_eq!(seq_from_journal_key(&journal_key(42)).unwrap(), 42);
    }
}
