#![forbid(unsafe_code)]

use std::io;

/// Plain column-aligned text table, or CSV of the same cells.
#[derive(Debug, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
    max_width: Option<usize>,
}

impl Table {
    pub fn new(headers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            max_width: None,
        }
    }

    /// Cells longer than `width` chars are cut and suffixed with `...` in the
    /// text rendering. CSV output is never truncated.
    #[must_use]
    pub fn max_cell_width(mut self, width: usize) -> Self {
        self.max_width = Some(width);
        self
    }

    pub fn row(&mut self, cols: impl IntoIterator<Item = impl Into<String>>) {
        self.rows.push(cols.into_iter().map(Into::into).collect());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn print(&self) -> io::Result<()> {
        self.write_text(io::stdout().lock())
    }

    pub fn print_csv(&self) -> io::Result<()> {
        self.write_csv(io::stdout().lock())
    }

    pub fn write_csv(&self, out: impl io::Write) -> io::Result<()> {
        let mut wtr = csv::Writer::from_writer(out);
        wtr.write_record(&self.headers)?;
        for row in &self.rows {
            wtr.write_record(row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    pub fn write_text(&self, mut out: impl io::Write) -> io::Result<()> {
        let headers: Vec<String> = self.headers.iter().map(|h| self.fit(h)).collect();
        let rows: Vec<Vec<String>> = self
            .rows
            .iter()
            .map(|r| r.iter().map(|c| self.fit(c)).collect())
            .collect();

        let columns = rows.iter().map(Vec::len).fold(headers.len(), usize::max);
        let mut widths = vec![0usize; columns];
        for row in std::iter::once(&headers).chain(&rows) {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }

        writeln!(out, "{}", format_row(&headers, &widths))?;
        for row in &rows {
            writeln!(out, "{}", format_row(row, &widths))?;
        }
        Ok(())
    }

    fn fit(&self, cell: &str) -> String {
        // Multi-line values (descriptions) would break alignment.
        let first = cell.lines().next().unwrap_or_default();
        match self.max_width {
            Some(max) if first.chars().count() > max || first.len() < cell.trim_end().len() => {
                let mut out: String = first.chars().take(max).collect();
                out.push_str("...");
                out
            }
            _ => first.to_owned(),
        }
    }
}

fn format_row(row: &[String], widths: &[usize]) -> String {
    let mut out = String::new();
    for (i, cell) in row.iter().enumerate() {
        if i > 0 {
            out.push_str("  ");
        }
        out.push_str(cell);
        if i + 1 < row.len() {
            let pad = widths[i].saturating_sub(cell.chars().count());
            out.extend(std::iter::repeat_n(' ', pad));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(t: &Table) -> String {
        let mut buf = Vec::new();
        t.write_text(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn columns_are_aligned_without_trailing_padding() {
        let mut t = Table::new(["KEY", "SUMMARY"]);
        t.row(["TASK-1", "short"]);
        t.row(["TASK-10", "longer one"]);
        assert_eq!(
            text(&t),
            "KEY      SUMMARY\nTASK-1   short\nTASK-10  longer one\n"
        );
    }

    #[test]
    fn long_and_multiline_cells_are_truncated_in_text_only() {
        let mut t = Table::new(["NAME", "DESCRIPTION"]).max_cell_width(5);
        t.row(["a", "abcdefgh"]);
        t.row(["b", "one\ntwo"]);
        assert_eq!(text(&t), "NAME  DESCR...\na     abcde...\nb     one...\n");

        let mut buf = Vec::new();
        t.write_csv(&mut buf).unwrap();
        let csv = String::from_utf8(buf).unwrap();
        assert!(csv.contains("abcdefgh"));
        assert!(csv.contains("\"one\ntwo\""));
    }
}
