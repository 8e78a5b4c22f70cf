//! Table generation from pipeline rows.

use super::{Cell, Table};
use crate::analysis::{RollingPoint, VariantDiff};
use crate::models::{ComparisonRow, MovementRow};

/// Movement table: key columns, then `{field}_before`, `{field}_after`,
/// `{field}_change` per mean field and for `margin`, then the cohort counts.
pub fn movement_table(
    name: &str,
    key_columns: &[String],
    fields: &[String],
    with_margin: bool,
    rows: &[MovementRow],
) -> Table {
    let mut measured: Vec<&str> = fields.iter().map(String::as_str).collect();
    if with_margin {
        measured.push("margin");
    }

    let mut columns = key_columns.to_vec();
    for field in &measured {
        columns.push(format!("{}_before", field));
        columns.push(format!("{}_after", field));
        columns.push(format!("{}_change", field));
    }
    columns.push("count_before".to_string());
    columns.push("count_after".to_string());

    let mut table = Table::new(name, columns);
    for row in rows {
        let mut cells: Vec<Cell> = row.key.iter().map(Cell::text).collect();
        for field in &measured {
            let (before, after) = if *field == "margin" {
                (row.before.margin, row.after.margin)
            } else {
                (row.before.mean(field), row.after.mean(field))
            };
            cells.push(before.into());
            cells.push(after.into());
            cells.push(row.change(field).into());
        }
        cells.push(row.before.count.into());
        cells.push(row.after.count.into());
        table.push(cells);
    }
    table
}

/// Comparison table: entity columns, the span (when joined on dates),
/// label columns, `{field}{variant}` per variant, then the diff columns.
///
/// Variant names are appended verbatim, so `_deluxe` gives `probD_deluxe`
/// and `LV` gives `marginLV`.
pub fn comparison_table(
    name: &str,
    entity_columns: &[String],
    label_columns: &[String],
    fields: &[String],
    variants: &[String],
    diff: Option<&VariantDiff>,
    rows: &[ComparisonRow],
) -> Table {
    let with_span = rows.iter().any(|r| r.span.is_some());

    let mut columns = entity_columns.to_vec();
    if with_span {
        columns.push("start_date".to_string());
        columns.push("end_date".to_string());
    }
    columns.extend(label_columns.iter().cloned());
    for variant in variants {
        for field in fields {
            columns.push(format!("{}{}", field, variant));
        }
    }
    if let Some(diff) = diff {
        let diff_name = diff_column(diff);
        let abs_name = format!("{}_abs", diff_name);
        columns.push(diff_name);
        columns.push(abs_name);
    }

    let mut table = Table::new(name, columns);
    for row in rows {
        let mut cells: Vec<Cell> = row.entity.iter().map(Cell::text).collect();
        if with_span {
            match row.span {
                Some(span) => {
                    cells.push(Cell::text(span.start.format("%m/%d/%Y").to_string()));
                    cells.push(Cell::text(span.end.format("%m/%d/%Y").to_string()));
                }
                None => cells.extend([Cell::Empty, Cell::Empty]),
            }
        }
        for label in label_columns {
            cells.push(row.labels.get(label).map_or(Cell::Empty, Cell::text));
        }
        for variant in variants {
            for field in fields {
                cells.push(row.value(variant, field).into());
            }
        }
        if diff.is_some() {
            cells.push(row.delta.map(|d| d.value).into());
            cells.push(row.delta.map(|d| d.magnitude).into());
        }
        table.push(cells);
    }
    table
}

/// `{field}{minuend}_minus{subtrahend}`, e.g. `probD_deluxe_minus_lite`.
pub fn diff_column(diff: &VariantDiff) -> String {
    format!("{}{}_minus{}", diff.field, diff.minuend, diff.subtrahend)
}

/// Rolling margin table, newest first.
pub fn rolling_table(name: &str, windows: &[usize], points: &[RollingPoint]) -> Table {
    let mut columns = vec!["date".to_string(), "margin".to_string()];
    columns.extend(windows.iter().map(|w| format!("{}-day", w)));

    let mut table = Table::new(name, columns);
    for point in points.iter().rev() {
        let mut cells = vec![
            Cell::text(point.date.format("%Y-%m-%d").to_string()),
            Cell::Number(point.value),
        ];
        for window in windows {
            cells.push(point.means.get(window).copied().flatten().into());
        }
        table.push(cells);
    }
    table
}
