//! Reading single values out of the VOTable XML reports written by SCAMP and PSFEx.
//!
//! This is a plain text scan, sufficient for the flat `TABLEDATA` layout of these reports.

/// Cell of the first row of the first table declaring a `FIELD` named `field`.
pub fn first_value(xml: &str, field: &str) -> Option<String> {
    let name_attr = format!("name=\"{field}\"");

    xml.match_indices("<TABLE")
        .map(|(i, _)| &xml[i + "<TABLE".len()..])
        .filter(|rest| !rest.starts_with("DATA"))
        .find_map(|table| {
            let table = table.split("</TABLE>").next().unwrap_or(table);
            let column = table
                .split("<FIELD")
                .skip(1)
                .filter_map(|f| f.split('>').next())
                .position(|attrs| attrs.contains(&name_attr))?;

            let row = table.split("<TR>").nth(1)?;
            let row = row.split("</TR>").next().unwrap_or(row);
            cells(row).into_iter().nth(column)
        })
}

/// Whitespace separated numbers of a cell, e.g. a two-axis `AstromSigma_Reference`.
pub fn first_numbers(xml: &str, field: &str) -> Option<Vec<f64>> {
    let value = first_value(xml, field)?;
    value
        .split_whitespace()
        .map(|v| v.parse().ok())
        .collect::<Option<Vec<f64>>>()
        .filter(|v| !v.is_empty())
}

fn cells(row: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut rest = row;
    while let Some(start) = rest.find("<TD") {
        rest = &rest[start + 3..];
        if rest.starts_with("/>") {
            cells.push(String::new());
            rest = &rest[2..];
            continue;
        }
        let Some(open_end) = rest.find('>') else {
            break;
        };
        rest = &rest[open_end + 1..];
        let end = rest.find("</TD>").unwrap_or(rest.len());
        cells.push(rest[..end].trim().to_string());
        rest = &rest[end..];
    }
    cells
}
