use pagetrail_core::{placeholder_offsets, Arg};

/// A piece of query text together with the values for its `?` placeholders,
/// in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub args: Vec<Arg>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    /// Text containing exactly one `?` and its value.
    pub fn bound(sql: impl Into<String>, arg: impl Into<Arg>) -> Self {
        Self {
            sql: sql.into(),
            args: vec![arg.into()],
        }
    }

    pub fn push_sql(&mut self, sql: &str) {
        self.sql.push_str(sql);
    }

    pub fn bind(&mut self, arg: impl Into<Arg>) {
        self.args.push(arg.into());
    }

    pub fn append(&mut self, other: Fragment) {
        self.sql.push_str(&other.sql);
        self.args.extend(other.args);
    }

    /// Appends `parts` separated by `separator`.
    pub fn append_joined(&mut self, parts: Vec<Fragment>, separator: &str) {
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                self.sql.push_str(separator);
            }
            self.append(part);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn placeholders(&self) -> usize {
        placeholder_offsets(&self.sql).len()
    }

    pub fn into_parts(self) -> (String, Vec<Arg>) {
        (self.sql, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::Fragment;

    #[test]
    fn joined_parts_keep_argument_order() {
        let mut out = Fragment::new("WHERE ");
        out.append_joined(
            vec![
                Fragment::bound("a = ?", "x"),
                Fragment::new("b = 1"),
                Fragment::bound("c != ?", 3_i64),
            ],
            " AND ",
        );
        assert_eq!(out.sql, "WHERE a = ? AND b = 1 AND c != ?");
        assert_eq!(out.args.len(), 2);
        assert_eq!(out.placeholders(), out.args.len());
    }
}
