//! Property grouping
//!
//! Groups a user's properties by normalized address. The earliest registered
//! unit at an address anchors the group as its parent; every later unit at the
//! same address is a child priced at the flat rate. Parents get a dense
//! 1..N position in the order their anchors were registered, so appending a
//! property never moves an existing one.

use std::collections::HashMap;

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Property;
use crate::pricing::{tier_price, PricedUnit, FLAT_CHILD_PRICE_CENTS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupingError {
    #[error("Property {property_id} references unknown parent {parent_id}")]
    UnknownParent { property_id: Uuid, parent_id: Uuid },

    #[error("Property {property_id} references parent {parent_id} owned by another user")]
    ForeignParent { property_id: Uuid, parent_id: Uuid },
}

/// Resolved role, position and rate for one property
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyAssignment {
    pub property_id: Uuid,
    pub address_hash: String,
    pub parent_property_id: Option<Uuid>,
    pub is_parent: bool,
    pub position_in_tier: Option<u32>,
    pub monthly_rate_cents: i64,
}

impl PropertyAssignment {
    fn differs_from(&self, property: &Property) -> bool {
        self.address_hash != property.address_hash
            || self.parent_property_id != property.parent_property_id
            || self.is_parent != property.is_parent
            || self.position_in_tier != property.position_in_tier
            || self.monthly_rate_cents != property.monthly_rate_cents
    }
}

/// Grouping of one user's property set, in registration order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GroupingResult {
    pub user_id: Uuid,
    pub assignments: Vec<PropertyAssignment>,
}

impl GroupingResult {
    pub fn parent_count(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_parent).count()
    }

    pub fn priced_units(&self) -> Vec<PricedUnit> {
        self.assignments
            .iter()
            .map(|a| PricedUnit {
                is_parent: a.is_parent,
                position_in_tier: a.position_in_tier,
            })
            .collect()
    }

    /// Assignments that differ from what is currently stored
    pub fn changes<'a>(&'a self, current: &[Property]) -> Vec<&'a PropertyAssignment> {
        let by_id: HashMap<Uuid, &Property> = current.iter().map(|p| (p.id, p)).collect();
        self.assignments
            .iter()
            .filter(|a| by_id.get(&a.property_id).map_or(true, |p| a.differs_from(p)))
            .collect()
    }
}

/// Lowercase, strip punctuation and collapse whitespace
pub fn normalize_address(address: &str) -> String {
    let cleaned: String = address
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 of the normalized address
///
/// A blank address never groups with anything: it hashes the property id
/// instead.
pub fn address_hash(property_id: Uuid, address: &str) -> String {
    let normalized = normalize_address(address);
    let key = if normalized.is_empty() {
        format!("unaddressed:{}", property_id)
    } else {
        normalized
    };
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Group `user_id`'s properties
///
/// `properties` holds the user's own units and may also contain rows of
/// other users that one of them points at; those are only used to reject the
/// reference.
pub fn resolve_groups(
    user_id: Uuid,
    properties: &[Property],
) -> Result<GroupingResult, GroupingError> {
    let known: HashMap<Uuid, &Property> = properties.iter().map(|p| (p.id, p)).collect();

    let mut owned: Vec<&Property> = properties.iter().filter(|p| p.user_id == user_id).collect();
    owned.sort_by_key(|p| (p.created_at, p.id));

    for property in &owned {
        if let Some(parent_id) = property.parent_property_id {
            match known.get(&parent_id) {
                None => {
                    return Err(GroupingError::UnknownParent {
                        property_id: property.id,
                        parent_id,
                    })
                }
                Some(parent) if parent.user_id != user_id => {
                    return Err(GroupingError::ForeignParent {
                        property_id: property.id,
                        parent_id,
                    })
                }
                Some(_) => {}
            }
        }
    }

    let mut anchors: HashMap<String, Uuid> = HashMap::new();
    let mut next_position: u32 = 1;
    let mut assignments = Vec::with_capacity(owned.len());

    for property in owned {
        let hash = if property.address_hash.is_empty() {
            address_hash(property.id, &property.address)
        } else {
            property.address_hash.clone()
        };

        let assignment = match anchors.get(&hash) {
            Some(&anchor_id) => PropertyAssignment {
                property_id: property.id,
                address_hash: hash,
                parent_property_id: Some(anchor_id),
                is_parent: false,
                position_in_tier: None,
                monthly_rate_cents: FLAT_CHILD_PRICE_CENTS,
            },
            None => {
                let position = next_position;
                next_position += 1;
                anchors.insert(hash.clone(), property.id);
                PropertyAssignment {
                    property_id: property.id,
                    address_hash: hash,
                    parent_property_id: None,
                    is_parent: true,
                    position_in_tier: Some(position),
                    monthly_rate_cents: tier_price(position),
                }
            }
        };
        assignments.push(assignment);
    }

    Ok(GroupingResult {
        user_id,
        assignments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};

    fn property(user_id: Uuid, address: &str, minutes: i64) -> Property {
        Property {
            id: Uuid::new_v4(),
            user_id,
            name: None,
            address: address.to_string(),
            address_hash: String::new(),
            parent_property_id: None,
            is_parent: true,
            position_in_tier: None,
            monthly_rate_cents: 0,
            created_at: OffsetDateTime::UNIX_EPOCH + Duration::minutes(minutes),
        }
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address("  12, Rue de Rivoli   PARIS "),
            "12 rue de rivoli paris"
        );
        assert_eq!(normalize_address("12 rue de rivoli, Paris."), "12 rue de rivoli paris");
    }

    #[test]
    fn test_address_hash_ignores_formatting() {
        let id = Uuid::new_v4();
        assert_eq!(
            address_hash(id, "5 Main St."),
            address_hash(Uuid::new_v4(), "5  main st")
        );
        assert_eq!(address_hash(id, "5 Main St.").len(), 64);
    }

    #[test]
    fn test_blank_addresses_never_group() {
        assert_ne!(
            address_hash(Uuid::new_v4(), "  "),
            address_hash(Uuid::new_v4(), "")
        );
    }

    #[test]
    fn test_single_unit_is_parent() {
        let user = Uuid::new_v4();
        let props = vec![property(user, "1 Harbour Road", 0)];
        let result = resolve_groups(user, &props).unwrap();

        assert_eq!(result.assignments.len(), 1);
        assert!(result.assignments[0].is_parent);
        assert_eq!(result.assignments[0].position_in_tier, Some(1));
        assert_eq!(result.assignments[0].monthly_rate_cents, 1399);
    }

    #[test]
    fn test_group_anchor_is_earliest_unit() {
        let user = Uuid::new_v4();
        let later = property(user, "7 Quay Street", 10);
        let earlier = property(user, "7 quay street", 5);
        let props = vec![later.clone(), earlier.clone()];

        let result = resolve_groups(user, &props).unwrap();
        let parent = &result.assignments[0];
        let child = &result.assignments[1];

        assert_eq!(parent.property_id, earlier.id);
        assert!(parent.is_parent);
        assert_eq!(child.property_id, later.id);
        assert!(!child.is_parent);
        assert_eq!(child.parent_property_id, Some(earlier.id));
        assert_eq!(child.position_in_tier, None);
        assert_eq!(child.monthly_rate_cents, FLAT_CHILD_PRICE_CENTS);
    }

    #[test]
    fn test_positions_follow_user_parent_sequence() {
        let user = Uuid::new_v4();
        let props = vec![
            property(user, "A street", 0),
            property(user, "B street", 1),
            property(user, "A street", 2),
            property(user, "C street", 3),
        ];
        let result = resolve_groups(user, &props).unwrap();
        let positions: Vec<Option<u32>> =
            result.assignments.iter().map(|a| a.position_in_tier).collect();

        assert_eq!(positions, vec![Some(1), Some(2), None, Some(3)]);
        assert_eq!(result.parent_count(), 3);
    }

    #[test]
    fn test_appending_keeps_existing_assignments() {
        let user = Uuid::new_v4();
        let mut props = vec![
            property(user, "A street", 0),
            property(user, "B street", 1),
            property(user, "A street", 2),
        ];
        let before = resolve_groups(user, &props).unwrap();

        props.push(property(user, "B street", 3));
        props.push(property(user, "D street", 4));
        let after = resolve_groups(user, &props).unwrap();

        assert_eq!(&after.assignments[..3], &before.assignments[..]);
        assert_eq!(after.assignments[3].parent_property_id, Some(props[1].id));
        assert_eq!(after.assignments[4].position_in_tier, Some(3));
    }

    #[test]
    fn test_rerun_is_idempotent_and_reports_no_changes() {
        let user = Uuid::new_v4();
        let mut props = vec![property(user, "A street", 0), property(user, "A street", 1)];
        let first = resolve_groups(user, &props).unwrap();

        for (prop, assignment) in props.iter_mut().zip(&first.assignments) {
            prop.address_hash = assignment.address_hash.clone();
            prop.parent_property_id = assignment.parent_property_id;
            prop.is_parent = assignment.is_parent;
            prop.position_in_tier = assignment.position_in_tier;
            prop.monthly_rate_cents = assignment.monthly_rate_cents;
        }

        let second = resolve_groups(user, &props).unwrap();
        assert_eq!(first, second);
        assert!(second.changes(&props).is_empty());
    }

    #[test]
    fn test_removal_compacts_positions() {
        let user = Uuid::new_v4();
        let props = vec![
            property(user, "A street", 0),
            property(user, "B street", 1),
            property(user, "C street", 2),
        ];
        let remaining = vec![props[0].clone(), props[2].clone()];
        let result = resolve_groups(user, &remaining).unwrap();

        assert_eq!(result.assignments[1].property_id, props[2].id);
        assert_eq!(result.assignments[1].position_in_tier, Some(2));
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let user = Uuid::new_v4();
        let mut orphan = property(user, "A street", 0);
        let missing = Uuid::new_v4();
        orphan.parent_property_id = Some(missing);

        let err = resolve_groups(user, &[orphan.clone()]).unwrap_err();
        assert_eq!(
            err,
            GroupingError::UnknownParent {
                property_id: orphan.id,
                parent_id: missing
            }
        );
    }

    #[test]
    fn test_foreign_parent_rejected() {
        let user = Uuid::new_v4();
        let other = property(Uuid::new_v4(), "A street", 0);
        let mut mine = property(user, "A street", 1);
        mine.parent_property_id = Some(other.id);

        let err = resolve_groups(user, &[other.clone(), mine.clone()]).unwrap_err();
        assert!(matches!(err, GroupingError::ForeignParent { parent_id, .. } if parent_id == other.id));
    }

    #[test]
    fn test_stored_hash_is_trusted() {
        let user = Uuid::new_v4();
        let mut a = property(user, "Somewhere", 0);
        let mut b = property(user, "Elsewhere", 1);
        a.address_hash = "shared".to_string();
        b.address_hash = "shared".to_string();

        let result = resolve_groups(user, &[a, b]).unwrap();
        assert_eq!(result.parent_count(), 1);
    }
}
