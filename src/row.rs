use std::sync::Arc;

use bytes::Bytes;

/// One row of a result set.
///
/// Values are raw server bytes; decoding into typed values is the caller's
/// concern. Column names are shared across all rows of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Option<Bytes>>,
}

impl Row {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Option<Bytes>>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// Raw bytes of the value at `index`; `None` for SQL `NULL` or an
    /// out-of-range index.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        self.values.get(index).and_then(|v| v.as_deref())
    }

    /// The value at `index` as UTF-8, when it is valid UTF-8.
    pub fn as_str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(|b| std::str::from_utf8(b).ok())
    }

    /// The value under the named column, as UTF-8.
    pub fn get_by_name(&self, name: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.as_str(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(values: &[Option<&str>]) -> Row {
        Row::new(
            Arc::new(vec!["a".to_owned(), "b".to_owned()]),
            values
                .iter()
                .map(|v| v.map(|s| Bytes::copy_from_slice(s.as_bytes())))
                .collect(),
        )
    }

    #[test]
    fn null_and_missing_are_none() {
        let r = row(&[Some("1"), None]);
        assert_eq!(r.as_str(0), Some("1"));
        assert_eq!(r.get(1), None);
        assert_eq!(r.get(7), None);
    }

    #[test]
    fn lookup_by_name() {
        let r = row(&[Some("x"), Some("y")]);
        assert_eq!(r.get_by_name("b"), Some("y"));
        assert_eq!(r.get_by_name("c"), None);
    }
}
