use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One row of catalog metadata for a user column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnShape {
    pub table_schema: String,
    pub table_name: String,
    pub column_name: String,
    pub ordinal_position: i32,
    pub data_type: String,
    pub is_nullable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub data_type: String,
    pub is_nullable: bool,
    pub ordinal_position: i32,
}

/// Digest of a database's table/column structure at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaFingerprint {
    /// Keyed by (qualified table, ordinal position, column) so iteration
    /// follows table name, then column position
    columns: BTreeMap<(String, i32, String), ColumnMeta>,
    digest: String,
}

impl SchemaFingerprint {
    /// Build a fingerprint from catalog rows in any order.
    pub fn from_columns<I>(columns: I) -> Self
    where
        I: IntoIterator<Item = ColumnShape>,
    {
        let columns: BTreeMap<_, _> = columns
            .into_iter()
            .map(|c| {
                (
                    (
                        format!("{}.{}", c.table_schema, c.table_name),
                        c.ordinal_position,
                        c.column_name,
                    ),
                    ColumnMeta {
                        data_type: c.data_type,
                        is_nullable: c.is_nullable,
                        ordinal_position: c.ordinal_position,
                    },
                )
            })
            .collect();

        let digest = Self::calculate_digest(&columns);
        Self { columns, digest }
    }

    fn calculate_digest(columns: &BTreeMap<(String, i32, String), ColumnMeta>) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        for ((table, position, column), meta) in columns {
            hasher.update(format!(
                "{}\t{}\t{}\t{}\t{}\n",
                table, position, column, meta.data_type, meta.is_nullable
            ));
        }

        hex::encode(hasher.finalize())
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn tables(&self) -> Vec<&str> {
        let mut tables: Vec<&str> = self.columns.keys().map(|(t, _, _)| t.as_str()).collect();
        tables.dedup();
        tables
    }
}

impl PartialEq for SchemaFingerprint {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for SchemaFingerprint {}

/// Result of a capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Captured(SchemaFingerprint),
    /// No usable driver; callers must assume the schema changed
    Unavailable,
}

impl Fingerprint {
    pub fn unavailable() -> Self {
        Fingerprint::Unavailable
    }

    /// True only when both sides were captured and their digests match.
    pub fn unchanged_from(&self, before: &Fingerprint) -> bool {
        match (before, self) {
            (Fingerprint::Captured(a), Fingerprint::Captured(b)) => a == b,
            _ => false,
        }
    }

    pub fn digest(&self) -> Option<&str> {
        match self {
            Fingerprint::Captured(f) => Some(f.digest()),
            Fingerprint::Unavailable => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(table: &str, name: &str, position: i32, data_type: &str) -> ColumnShape {
        ColumnShape {
            table_schema: "public".to_string(),
            table_name: table.to_string(),
            column_name: name.to_string(),
            ordinal_position: position,
            data_type: data_type.to_string(),
            is_nullable: false,
        }
    }

    fn users() -> Vec<ColumnShape> {
        vec![
            column("users", "id", 1, "integer"),
            column("users", "name", 2, "text"),
            column("orders", "id", 1, "integer"),
        ]
    }

    #[test]
    fn test_digest_is_order_independent() {
        let mut reversed = users();
        reversed.reverse();

        let a = SchemaFingerprint::from_columns(users());
        let b = SchemaFingerprint::from_columns(reversed);

        assert_eq!(a, b);
        assert_eq!(a.digest().len(), 64);
        assert_eq!(a.tables(), vec!["public.orders", "public.users"]);
    }

    #[test]
    fn test_added_column_changes_digest() {
        let before = SchemaFingerprint::from_columns(users());
        let mut columns = users();
        columns.push(column("users", "email", 3, "text"));
        let after = SchemaFingerprint::from_columns(columns);

        assert_ne!(before, after);
        assert_eq!(after.column_count(), 4);
    }

    #[test]
    fn test_type_and_nullability_change_digest() {
        let before = SchemaFingerprint::from_columns(users());

        let mut retyped = users();
        retyped[1].data_type = "character varying".to_string();
        assert_ne!(before, SchemaFingerprint::from_columns(retyped));

        let mut nullable = users();
        nullable[1].is_nullable = true;
        assert_ne!(before, SchemaFingerprint::from_columns(nullable));
    }

    #[test]
    fn test_unavailable_never_matches() {
        let captured = Fingerprint::Captured(SchemaFingerprint::from_columns(users()));

        assert!(captured.unchanged_from(&captured.clone()));
        assert!(!captured.unchanged_from(&Fingerprint::unavailable()));
        assert!(!Fingerprint::unavailable().unchanged_from(&captured));
        assert!(!Fingerprint::unavailable().unchanged_from(&Fingerprint::unavailable()));
    }
}
