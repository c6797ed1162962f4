use crate::core::{Row, Value};
use std::collections::VecDeque;
use std::fmt;

/// Rows returned by a query, consumed front to back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowStream {
    columns: Vec<String>,
    rows: VecDeque<Row>,
}

impl RowStream {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Rows not yet consumed
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    /// Value of `column` in the next unconsumed row, without consuming it.
    pub fn peek_value(&self, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.front().and_then(|row| row.get(index))
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows.into()
    }
}

impl Iterator for RowStream {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.next_row()
    }
}

impl fmt::Display for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.columns.is_empty() {
            return write!(f, "Empty result set");
        }

        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.len()).collect();
        for row in &self.rows {
            for (i, value) in row.iter().enumerate().take(widths.len()) {
                widths[i] = widths[i].max(value.to_string().len());
            }
        }

        let header: Vec<String> = self
            .columns
            .iter()
            .zip(&widths)
            .map(|(col, width)| format!("{:width$}", col, width = width))
            .collect();
        writeln!(f, "{}", header.join(" | "))?;

        let separator: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        writeln!(f, "{}", separator.join("-+-"))?;

        for row in &self.rows {
            let cells: Vec<String> = row
                .iter()
                .zip(&widths)
                .map(|(val, width)| format!("{:width$}", val.to_string(), width = width))
                .collect();
            writeln!(f, "{}", cells.join(" | "))?;
        }

        write!(f, "({} row(s))", self.rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RowStream {
        RowStream::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Integer(1), Value::from("alice")],
                vec![Value::Integer(2), Value::from("bob")],
            ],
        )
    }

    #[test]
    fn test_consume_rows() {
        let mut rows = sample();
        assert_eq!(rows.row_count(), 2);
        assert_eq!(rows.peek_value("name"), Some(&Value::from("alice")));

        let first = rows.next_row().unwrap();
        assert_eq!(first[0], Value::Integer(1));
        assert_eq!(rows.row_count(), 1);
        assert_eq!(rows.count(), 1);
    }

    #[test]
    fn test_display_table() {
        let text = sample().to_string();
        assert!(text.starts_with("id | name"));
        assert!(text.contains("'alice'"));
        assert!(text.ends_with("(2 row(s))"));
        assert_eq!(RowStream::empty().to_string(), "Empty result set");
    }
}
