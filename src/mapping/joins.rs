//! Outer join rendering
//!
//! Aggressively loaded references are fetched with an outer join on the
//! referenced table. Databases disagree on the syntax, so rendering goes
//! through a [`JoinRenderer`] picked by the source's dialect.

/// One outer join of the select statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClause {
    /// Joined table
    pub table: String,
    /// Alias of the joined table, `_HLM_<property>`
    pub alias: String,
    /// (home column, joined column) pairs, both already qualified
    pub pairs: Vec<(String, String)>,
}

impl JoinClause {
    /// Alias used for the join of `property`
    pub fn alias_for(property: &str) -> String {
        format!("_HLM_{}", property)
    }
}

/// Dialect specific join syntax
pub trait JoinRenderer: Send + Sync {
    /// Append the join to the FROM part
    fn render_from(&self, sql: &mut String, join: &JoinClause);

    /// Collect conditions that belong in the WHERE part
    fn render_conditions(&self, join: &JoinClause, conditions: &mut Vec<String>);
}

/// ANSI `LEFT OUTER JOIN ... ON ...`
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardJoins;

impl JoinRenderer for StandardJoins {
    fn render_from(&self, sql: &mut String, join: &JoinClause) {
        let on: Vec<String> = join
            .pairs
            .iter()
            .map(|(home, other)| format!("{} = {}", home, other))
            .collect();
        sql.push_str(&format!(
            " LEFT OUTER JOIN {} {} ON {}",
            join.table,
            join.alias,
            on.join(" AND ")
        ));
    }

    fn render_conditions(&self, _join: &JoinClause, _conditions: &mut Vec<String>) {}
}

/// Comma join with `(+)` markers in the WHERE part
#[derive(Debug, Default, Clone, Copy)]
pub struct LegacyOuterJoins;

impl JoinRenderer for LegacyOuterJoins {
    fn render_from(&self, sql: &mut String, join: &JoinClause) {
        sql.push_str(&format!(", {} {}", join.table, join.alias));
    }

    fn render_conditions(&self, join: &JoinClause, conditions: &mut Vec<String>) {
        for (home, other) in &join.pairs {
            conditions.push(format!("{} = {}(+)", home, other));
        }
    }
}
