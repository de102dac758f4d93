//! Explicit description of the billing schema.
//!
//! Instead of discovering tables by reflection, the schema is an enumerable list of
//! [`TableDefinition`]s. Every statement it renders uses `IF NOT EXISTS`, so applying
//! it to an initialized database is a no-op.
//!
//! # Example
//!
//! ```
//! use billing_core::schema::SchemaDescriptor;
//!
//! let schema = SchemaDescriptor::billing();
//! for statement in schema.statements() {
//!     assert!(statement.contains("IF NOT EXISTS"));
//! }
//! ```

/// Table holding one row per order identifier.
pub const ORDERS_TABLE: &str = "orders";

/// Table holding payloads that could not be mapped to an order.
pub const POISON_MESSAGES_TABLE: &str = "poison_messages";

/// A single column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// SQL type (e.g. `TEXT`, `BIGINT`, `JSONB`)
    pub sql_type: String,
    /// Whether NULL is allowed
    pub nullable: bool,
    /// Optional SQL default expression
    pub default: Option<String>,
}

impl ColumnDefinition {
    fn render(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.sql_type);
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        sql
    }
}

/// A secondary index on a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDefinition {
    /// Index name
    pub name: String,
    /// Indexed columns, in order
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness
    pub unique: bool,
}

/// A table and its indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    name: String,
    columns: Vec<ColumnDefinition>,
    primary_key: Vec<String>,
    indexes: Vec<IndexDefinition>,
}

impl TableDefinition {
    /// Start a table definition with no columns.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a NOT NULL column.
    #[must_use]
    pub fn column(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: false,
            default: None,
        });
        self
    }

    /// Add a nullable column.
    #[must_use]
    pub fn nullable_column(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
        });
        self
    }

    /// Add a NOT NULL column with a default expression.
    #[must_use]
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        sql_type: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.columns.push(ColumnDefinition {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: false,
            default: Some(default.into()),
        });
        self
    }

    /// Set the primary key columns.
    #[must_use]
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| (*c).to_string()).collect();
        self
    }

    /// Add a non-unique index.
    #[must_use]
    pub fn index(self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.push_index(name.into(), columns, false)
    }

    /// Add a unique index.
    #[must_use]
    pub fn unique_index(self, name: impl Into<String>, columns: &[&str]) -> Self {
        self.push_index(name.into(), columns, true)
    }

    fn push_index(mut self, name: String, columns: &[&str], unique: bool) -> Self {
        self.indexes.push(IndexDefinition {
            name,
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            unique,
        });
        self
    }

    /// Table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns in declaration order.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Primary key columns.
    #[must_use]
    pub fn primary_key_columns(&self) -> &[String] {
        &self.primary_key
    }

    /// Secondary indexes.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for this table.
    #[must_use]
    pub fn create_statement(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDefinition::render).collect();
        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.name,
            parts.join(",\n    ")
        )
    }

    /// `CREATE [UNIQUE] INDEX IF NOT EXISTS` statements for this table.
    #[must_use]
    pub fn index_statements(&self) -> Vec<String> {
        self.indexes
            .iter()
            .map(|index| {
                format!(
                    "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                    if index.unique { "UNIQUE " } else { "" },
                    index.name,
                    self.name,
                    index.columns.join(", ")
                )
            })
            .collect()
    }
}

/// The set of tables a store must provide before ingestion starts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaDescriptor {
    tables: Vec<TableDefinition>,
}

impl SchemaDescriptor {
    /// Create a descriptor from explicit table definitions.
    #[must_use]
    pub const fn new(tables: Vec<TableDefinition>) -> Self {
        Self { tables }
    }

    /// The billing schema: `orders` plus the `poison_messages` ledger.
    #[must_use]
    pub fn billing() -> Self {
        let orders = TableDefinition::new(ORDERS_TABLE)
            .column("order_id", "TEXT")
            .column("amount_cents", "BIGINT")
            .column("payload", "JSONB")
            .column("source_topic", "TEXT")
            .column("source_partition", "INTEGER")
            .column("source_offset", "BIGINT")
            .column("received_at", "TIMESTAMPTZ")
            .column_with_default("created_at", "TIMESTAMPTZ", "now()")
            .primary_key(&["order_id"])
            .index("idx_orders_received_at", &["received_at"]);

        let poison = TableDefinition::new(POISON_MESSAGES_TABLE)
            .column("id", "BIGSERIAL")
            .column("source_topic", "TEXT")
            .column("source_partition", "INTEGER")
            .column("source_offset", "BIGINT")
            .nullable_column("message_key", "TEXT")
            .column("payload", "BYTEA")
            .column("error_message", "TEXT")
            .column("received_at", "TIMESTAMPTZ")
            .column_with_default("recorded_at", "TIMESTAMPTZ", "now()")
            .primary_key(&["id"])
            .unique_index(
                "idx_poison_messages_source",
                &["source_topic", "source_partition", "source_offset"],
            );

        Self::new(vec![orders, poison])
    }

    /// Tables in creation order.
    #[must_use]
    pub fn tables(&self) -> &[TableDefinition] {
        &self.tables
    }

    /// Look up a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableDefinition> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Number of tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the descriptor is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// All DDL statements, tables first and then their indexes.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        let mut statements: Vec<String> =
            self.tables.iter().map(TableDefinition::create_statement).collect();
        statements.extend(self.tables.iter().flat_map(TableDefinition::index_statements));
        statements
    }
}
