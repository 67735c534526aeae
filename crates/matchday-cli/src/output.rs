use serde::Serialize;

/// Longest cell printed in a table; error strings are cut to this.
const MAX_CELL: usize = 60;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    print!("{}", render_table(headers, &rows));
}

/// Counts and depths line up on the right, text on the left. Empty cells
/// print as `-` and long ones are cut at [`MAX_CELL`] characters.
fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| row.iter().map(|c| clip(c)).collect())
        .collect();

    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    let mut numeric = vec![true; headers.len()];
    let mut has_number = vec![false; headers.len()];
    for row in &rows {
        for (i, cell) in row.iter().enumerate().take(headers.len()) {
            widths[i] = widths[i].max(cell.chars().count());
            let is_number = cell.parse::<i64>().is_ok();
            has_number[i] |= is_number;
            numeric[i] &= is_number || cell == "-";
        }
    }
    let right: Vec<bool> = numeric.iter().zip(&has_number).map(|(n, h)| *n && *h).collect();

    let mut out = render_line(headers.iter().copied(), &widths, &right);
    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push_str(&sep.join("  "));
    out.push('\n');
    for row in &rows {
        out.push_str(&render_line(row.iter().map(String::as_str), &widths, &right));
    }
    out
}

fn render_line<'a>(cells: impl Iterator<Item = &'a str>, widths: &[usize], right: &[bool]) -> String {
    let joined: Vec<String> = cells
        .enumerate()
        .map(|(i, cell)| {
            let w = widths.get(i).copied().unwrap_or(0);
            if right.get(i).copied().unwrap_or(false) {
                format!("{cell:>w$}")
            } else {
                format!("{cell:<w$}")
            }
        })
        .collect();
    format!("{}\n", joined.join("  ").trim_end())
}

fn clip(cell: &str) -> String {
    if cell.is_empty() {
        return "-".to_string();
    }
    if cell.chars().count() <= MAX_CELL {
        return cell.to_string();
    }
    let mut cut: String = cell.chars().take(MAX_CELL - 1).collect();
    cut.push('…');
    cut
}

/// Render an optional value, `-` when absent.
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}
