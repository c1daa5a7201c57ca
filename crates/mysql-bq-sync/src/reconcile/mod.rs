//! Schema reconciliation between an existing destination table and the schema
//! freshly derived from the source.
//!
//! Reconciliation only ever widens: nullability moves toward NULLABLE, types
//! already established in the destination are kept, new source columns are
//! added as NULLABLE, and destination-only columns are retained. The function
//! is pure and total; applying the additive update to the destination is the
//! caller's job (see [`added_fields`] and [`relaxed_fields`]).

use std::collections::HashSet;

use tracing::{debug, info};

use crate::core::{DestinationField, FieldMode};

/// Merge an existing destination schema with a proposed one.
pub fn reconcile(
    existing: Option<&[DestinationField]>,
    proposed: &[DestinationField],
) -> Vec<DestinationField> {
    let Some(existing) = existing else {
        return proposed
            .iter()
            .map(|f| DestinationField {
                mode: FieldMode::Nullable,
                ..f.clone()
            })
            .collect();
    };

    let mut merged: Vec<DestinationField> = existing
        .iter()
        .map(|current| match find(proposed, &current.name) {
            Some(observed) => DestinationField {
                name: current.name.clone(),
                logical_type: current.logical_type,
                mode: current.mode.widen(observed.mode),
                description: current
                    .description
                    .clone()
                    .or_else(|| observed.description.clone()),
            },
            None => current.clone(),
        })
        .collect();

    let known: HashSet<String> = existing.iter().map(|f| f.name.to_lowercase()).collect();
    for field in proposed {
        if !known.contains(&field.name.to_lowercase()) {
            merged.push(DestinationField {
                mode: FieldMode::Nullable,
                ..field.clone()
            });
        }
    }

    merged
}

/// Fields of `reconciled` that the existing destination schema lacks.
pub fn added_fields(
    existing: Option<&[DestinationField]>,
    reconciled: &[DestinationField],
) -> Vec<DestinationField> {
    let Some(existing) = existing else {
        return Vec::new();
    };
    reconciled
        .iter()
        .filter(|f| find(existing, &f.name).is_none())
        .cloned()
        .collect()
}

/// Fields that exist in the destination as REQUIRED but are NULLABLE in
/// `reconciled`.
pub fn relaxed_fields(
    existing: Option<&[DestinationField]>,
    reconciled: &[DestinationField],
) -> Vec<DestinationField> {
    let Some(existing) = existing else {
        return Vec::new();
    };
    reconciled
        .iter()
        .filter(|f| f.mode == FieldMode::Nullable)
        .filter(|f| {
            find(existing, &f.name).is_some_and(|current| current.mode == FieldMode::Required)
        })
        .cloned()
        .collect()
}

/// Log a side-by-side view of proposed and existing fields for one table.
pub fn log_comparison(
    table: &str,
    existing: Option<&[DestinationField]>,
    proposed: &[DestinationField],
) {
    match existing {
        None => info!(
            "{}: destination table absent, creating with {} fields",
            table,
            proposed.len()
        ),
        Some(existing) => {
            let added = proposed
                .iter()
                .filter(|f| find(existing, &f.name).is_none())
                .count();
            info!(
                "{}: {} source fields, {} destination fields, {} new",
                table,
                proposed.len(),
                existing.len(),
                added
            );
        }
    }

    for field in proposed {
        let current = existing.and_then(|e| find(e, &field.name));
        debug!(
            "{}:   {:<32} {:<28} {:<10} {}",
            table,
            field.name,
            field.description.as_deref().unwrap_or(""),
            field.logical_type,
            match current {
                Some(c) => c.logical_type.as_str(),
                None => "NEW",
            }
        );
    }
}

// Destination column names are case-insensitive.
fn find<'a>(fields: &'a [DestinationField], name: &str) -> Option<&'a DestinationField> {
    fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LogicalType;

    fn field(name: &str, ty: LogicalType, mode: FieldMode) -> DestinationField {
        DestinationField::new(name, ty, mode)
    }

    fn proposed() -> Vec<DestinationField> {
        vec![
            field("id", LogicalType::Int64, FieldMode::Required),
            field("name", LogicalType::String, FieldMode::Required),
            field("amount", LogicalType::Numeric, FieldMode::Nullable),
        ]
    }

    #[test]
    fn test_new_table_is_all_nullable() {
        let result = reconcile(None, &proposed());
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|f| f.mode == FieldMode::Nullable));
        assert_eq!(result[0].logical_type, LogicalType::Int64);
    }

    #[test]
    fn test_existing_type_is_kept() {
        let existing = vec![field("amount", LogicalType::Float64, FieldMode::Nullable)];
        let result = reconcile(Some(&existing), &proposed());
        let amount = result.iter().find(|f| f.name == "amount").unwrap();
        assert_eq!(amount.logical_type, LogicalType::Float64);
    }

    #[test]
    fn test_nullability_never_narrows() {
        let existing = vec![
            field("id", LogicalType::Int64, FieldMode::Nullable),
            field("name", LogicalType::String, FieldMode::Required),
        ];
        let result = reconcile(Some(&existing), &proposed());
        assert_eq!(result[0].mode, FieldMode::Nullable);
        assert_eq!(result[1].mode, FieldMode::Required);

        let loosened = vec![field("name", LogicalType::String, FieldMode::Nullable)];
        let result = reconcile(Some(&existing), &loosened);
        assert_eq!(result[1].mode, FieldMode::Nullable);
    }

    #[test]
    fn test_new_source_field_added_nullable() {
        let existing = vec![field("id", LogicalType::Int64, FieldMode::Required)];
        let result = reconcile(Some(&existing), &proposed());
        assert_eq!(
            result.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["id", "name", "amount"]
        );
        assert_eq!(result[1].mode, FieldMode::Nullable);
        let added = added_fields(Some(&existing), &result);
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].name, "name");
    }

    #[test]
    fn test_destination_only_field_retained() {
        let existing = vec![
            field("id", LogicalType::Int64, FieldMode::Required),
            field("retired", LogicalType::Date, FieldMode::Required),
        ];
        let result = reconcile(Some(&existing), &proposed());
        let retired = result.iter().find(|f| f.name == "retired").unwrap();
        assert_eq!(retired.logical_type, LogicalType::Date);
        assert_eq!(retired.mode, FieldMode::Required);
    }

    #[test]
    fn test_case_insensitive_match() {
        let existing = vec![field("ID", LogicalType::Int64, FieldMode::Required)];
        let result = reconcile(Some(&existing), &proposed());
        assert_eq!(result.iter().filter(|f| f.name.eq_ignore_ascii_case("id")).count(), 1);
    }

    #[test]
    fn test_idempotent() {
        let cases: Vec<Option<Vec<DestinationField>>> = vec![
            None,
            Some(vec![]),
            Some(vec![
                field("id", LogicalType::String, FieldMode::Required),
                field("legacy", LogicalType::Bool, FieldMode::Required),
            ]),
            Some(vec![field("name", LogicalType::String, FieldMode::Nullable)]),
        ];
        for existing in cases {
            let once = reconcile(existing.as_deref(), &proposed());
            let twice = reconcile(Some(&once), &proposed());
            assert_eq!(once, twice);
            assert!(added_fields(Some(&once), &twice).is_empty());
        }
    }

    #[test]
    fn test_relaxed_fields() {
        let existing = vec![
            field("id", LogicalType::Int64, FieldMode::Required),
            field("NAME", LogicalType::String, FieldMode::Required),
        ];
        let observed = vec![
            field("id", LogicalType::Int64, FieldMode::Required),
            field("name", LogicalType::String, FieldMode::Nullable),
            field("amount", LogicalType::Numeric, FieldMode::Nullable),
        ];
        let result = reconcile(Some(&existing), &observed);

        let relaxed = relaxed_fields(Some(&existing), &result);
        assert_eq!(relaxed.len(), 1);
        assert_eq!(relaxed[0].name, "NAME");
        assert_eq!(relaxed[0].mode, FieldMode::Nullable);

        // New fields are added, not relaxed.
        assert_eq!(added_fields(Some(&existing), &result)[0].name, "amount");
        assert!(relaxed_fields(None, &result).is_empty());
        assert!(relaxed_fields(Some(&result), &reconcile(Some(&result), &observed)).is_empty());
    }

    #[test]
    fn test_added_fields_empty_for_new_table() {
        let result = reconcile(None, &proposed());
        assert!(added_fields(None, &result).is_empty());
    }
}
