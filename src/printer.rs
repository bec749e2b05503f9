use std::io::Write;

use anyhow::Result;

use crate::catalog::schema::{Schema, TypeId};
use crate::tuple::Tuple;

/// Prints tuples as a table with right-aligned columns.
pub struct Printer {
    column_names: Vec<String>,
    column_widths: Vec<usize>,
}

impl Printer {
    pub fn new(schema: &Schema) -> Self {
        let mut column_names = vec!["offset".to_owned()];
        let mut column_widths = vec![10];
        for col in schema.columns() {
            let col_name_size = col.column_name().chars().count();
            let col_width = match col.type_id() {
                TypeId::Boolean => col_name_size.max("false".chars().count()),
                TypeId::Integer => col_name_size.max(10),
                TypeId::Decimal | TypeId::Date => col_name_size.max(20),
                TypeId::Text => col_name_size.max(col.width().min(25) as usize),
                TypeId::Point => col_name_size.max(24),
            };
            column_names.push(col.column_name().to_owned());
            column_widths.push(col_width);
        }

        Self {
            column_names,
            column_widths,
        }
    }

    fn print_header(&self, writer: &mut impl Write) -> Result<()> {
        let header = self
            .column_widths
            .iter()
            .zip(&self.column_names)
            .map(|(width, name)| format!("{:>1$}", name, *width))
            .collect::<Vec<String>>()
            .join("|");
        writeln!(writer, "{header}")?;
        let separator_line = self
            .column_widths
            .iter()
            .map(|width| format!("{:-^1$}", '-', width))
            .collect::<Vec<String>>()
            .join("+");
        writeln!(writer, "{separator_line}")?;

        Ok(())
    }

    pub fn print_all_tuples(&self, tuples: &[Tuple], writer: &mut impl Write) -> Result<()> {
        self.print_header(writer)?;

        for tuple in tuples {
            let cells = std::iter::once(tuple.tuple_id.to_string())
                .chain(tuple.values().iter().map(|value| value.to_string()));
            let line = self
                .column_widths
                .iter()
                .zip(cells)
                .map(|(width, cell)| format!("{:>1$}", cell, *width))
                .collect::<Vec<String>>()
                .join("|");
            writeln!(writer, "{line}")?;
        }
        writeln!(writer, "({} rows)", tuples.len())?;

        Ok(())
    }
}
