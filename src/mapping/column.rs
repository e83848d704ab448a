//! Relational column descriptions

use serde::{Deserialize, Serialize};

/// SQL type family of a column, as far as statement generation cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    /// CHAR, VARCHAR, CLOB and friends
    Text,
    /// Integral numbers
    Integer,
    /// Floating point and decimal numbers
    Decimal,
    /// BIT/BOOLEAN
    Boolean,
    /// DATE, TIME, TIMESTAMP
    Timestamp,
    /// BLOB, VARBINARY
    Binary,
    /// Anything the driver reported that isn't covered above
    Other,
}

impl SqlType {
    /// Map a driver type name to its family
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "CHAR" | "VARCHAR" | "VARCHAR2" | "NVARCHAR" | "NVARCHAR2" | "NCHAR" | "TEXT"
            | "CLOB" | "NCLOB" | "LONGVARCHAR" | "LONG" => SqlType::Text,
            "INT" | "INTEGER" | "SMALLINT" | "TINYINT" | "BIGINT" => SqlType::Integer,
            "NUMBER" | "NUMERIC" | "DECIMAL" | "FLOAT" | "REAL" | "DOUBLE" => SqlType::Decimal,
            "BIT" | "BOOLEAN" | "BOOL" => SqlType::Boolean,
            "DATE" | "TIME" | "TIMESTAMP" | "DATETIME" => SqlType::Timestamp,
            "BLOB" | "BINARY" | "VARBINARY" | "LONGVARBINARY" | "RAW" => SqlType::Binary,
            _ => SqlType::Other,
        }
    }

    /// Whether literals of this type are written as quoted strings
    pub fn needs_quotes(self) -> bool {
        matches!(self, SqlType::Text | SqlType::Timestamp | SqlType::Other)
    }
}

/// Role a column plays for its mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnRole {
    /// Primary key column
    Id,
    /// Column holding the node name
    Name,
    /// Column holding the prototype or extension id
    Prototype,
    /// Column mapped to the named property
    Property(String),
    /// Column without a mapping
    Unmapped,
}

/// One column of a mapped table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbColumn {
    name: String,
    sql_type: SqlType,
    role: ColumnRole,
}

impl DbColumn {
    /// Describe a column with no role assigned yet
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            role: ColumnRole::Unmapped,
        }
    }

    /// Same column with the given role
    pub fn with_role(mut self, role: ColumnRole) -> Self {
        self.role = role;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    pub fn role(&self) -> &ColumnRole {
        &self.role
    }

    /// Whether this is the id column
    pub fn is_id(&self) -> bool {
        self.role == ColumnRole::Id
    }

    /// Whether the column takes part in inserts and updates
    pub fn is_mapped(&self) -> bool {
        !matches!(self.role, ColumnRole::Unmapped)
    }

    /// Whether literals for this column are quoted
    pub fn needs_quotes(&self) -> bool {
        self.sql_type.needs_quotes()
    }
}
