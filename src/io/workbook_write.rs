use std::path::Path;

use rust_xlsxwriter::{Table, Workbook, Worksheet};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::Result;
use crate::snapshot::WorkbookData;

/// Writes the provided workbook data to the given path.
#[instrument(level = "info", skip(workbook), fields(path = %path.display(), sheets = workbook.tables.len()))]
pub fn write_workbook(path: &Path, workbook: &WorkbookData) -> Result<()> {
    let mut workbook_writer = Workbook::new();

    for table in &workbook.tables {
        let worksheet = workbook_writer.add_worksheet();
        worksheet.set_name(&table.sheet_name)?;

        for (col_idx, header) in table.columns.iter().enumerate() {
            worksheet.write_string(0, col_idx as u16, header)?;
        }

        for (row_idx, row) in table.rows.iter().enumerate() {
            for (col_idx, cell) in row.iter().enumerate() {
                write_cell(worksheet, (row_idx + 1) as u32, col_idx as u16, cell)?;
            }
        }

        if !table.rows.is_empty() && !table.columns.is_empty() {
            let mut excel_table = Table::new();
            excel_table.set_autofilter(true);
            let col_end = (table.columns.len() as u16).saturating_sub(1);
            worksheet.add_table(0, 0, table.rows.len() as u32, col_end, &excel_table)?;
        }
        debug!(sheet = %table.sheet_name, rows = table.rows.len(), "sheet written");
    }

    workbook_writer.save(path)?;
    Ok(())
}

/// Numbers and booleans keep their cell type; arrays and objects are stored
/// as JSON text.
fn write_cell(worksheet: &mut Worksheet, row: u32, col: u16, value: &Value) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(flag) => {
            worksheet.write_boolean(row, col, *flag)?;
        }
        Value::Number(number) => match number.as_f64() {
            Some(number) => {
                worksheet.write_number(row, col, number)?;
            }
            None => {
                worksheet.write_string(row, col, &number.to_string())?;
            }
        },
        Value::String(text) => {
            worksheet.write_string(row, col, text)?;
        }
        other => {
            worksheet.write_string(row, col, &serde_json::to_string(other)?)?;
        }
    }
    Ok(())
}
