//! Wire form of an admitted order on the durable stream.

use thiserror::Error;

use crate::domain::types::{OrderId, UserId, VoucherId};
use crate::store::{FIELD_ORDER_ID, FIELD_USER_ID, FIELD_VOUCHER_ID, StreamEntry};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("stream entry `{entry_id}` is missing field `{field}`")]
    MissingField {
        entry_id: String,
        field: &'static str,
    },
    #[error("stream entry `{entry_id}` field `{field}` is not a valid id: `{value}`")]
    BadField {
        entry_id: String,
        field: &'static str,
        value: String,
    },
}

/// One admitted purchase, as appended by the admission step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRecord {
    pub order_id: OrderId,
    pub voucher_id: VoucherId,
    pub user_id: UserId,
}

impl AdmissionRecord {
    /// Parse an admission record out of a raw stream entry. Fails on missing
    /// or non-numeric fields; the consumer treats such entries as poison.
    pub fn from_entry(entry: &StreamEntry) -> Result<Self, RecordError> {
        Ok(Self {
            order_id: OrderId::new(parse_field(entry, FIELD_ORDER_ID)?),
            voucher_id: VoucherId::new(parse_field(entry, FIELD_VOUCHER_ID)?),
            user_id: UserId::new(parse_field(entry, FIELD_USER_ID)?),
        })
    }
}

fn parse_field(entry: &StreamEntry, field: &'static str) -> Result<u64, RecordError> {
    let value = entry
        .fields
        .get(field)
        .ok_or_else(|| RecordError::MissingField {
            entry_id: entry.id.clone(),
            field,
        })?;
    value.parse().map_err(|_| RecordError::BadField {
        entry_id: entry.id.clone(),
        field,
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(fields: &[(&str, &str)]) -> StreamEntry {
        StreamEntry {
            id: "7-0".to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn parses_a_complete_entry() {
        let record = AdmissionRecord::from_entry(&entry(&[
            ("id", "42"),
            ("voucherId", "7"),
            ("userId", "1001"),
        ]))
        .unwrap();
        assert_eq!(record.order_id, OrderId::new(42));
        assert_eq!(record.voucher_id, VoucherId::new(7));
        assert_eq!(record.user_id, UserId::new(1001));
    }

    #[test]
    fn missing_field_is_rejected() {
        let err =
            AdmissionRecord::from_entry(&entry(&[("id", "42"), ("voucherId", "7")])).unwrap_err();
        assert!(matches!(
            err,
            RecordError::MissingField { field: "userId", .. }
        ));
    }

    #[test]
    fn non_numeric_field_is_rejected() {
        let err = AdmissionRecord::from_entry(&entry(&[
            ("id", "42"),
            ("voucherId", "seven"),
            ("userId", "1001"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            RecordError::BadField { field: "voucherId", .. }
        ));
    }

    #[test]
    fn ignores_unknown_extra_fields() {
        let record = AdmissionRecord::from_entry(&entry(&[
            ("id", "1"),
            ("voucherId", "2"),
            ("userId", "3"),
            ("trace", "abc"),
        ]))
        .unwrap();
        assert_eq!(record.user_id, UserId::new(3));
    }

    #[test]
    fn empty_hashmap_entry_is_poison() {
        let raw = StreamEntry {
            id: "9-0".to_string(),
            fields: HashMap::new(),
        };
        assert!(AdmissionRecord::from_entry(&raw).is_err());
    }
}
