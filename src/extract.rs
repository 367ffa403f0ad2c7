use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::Rules;
use crate::types::TrackedRow;

/// Minimum number of cells for a row to be considered a calendar entry.
pub const MIN_COLUMNS: usize = 8;

/// Turns raw page content into calendar rows.
pub trait RowExtractor: Send + Sync {
    fn extract(&self, content: &str, page: &Url) -> Vec<TrackedRow>;
}

pub struct TableExtractor {
    rules: Rules,
    tr: Selector,
    td: Selector,
    anchor: Selector,
}

impl TableExtractor {
    pub fn new(rules: Rules) -> Self {
        Self {
            rules,
            tr: Selector::parse("tr").expect("static selector"),
            td: Selector::parse("td").expect("static selector"),
            anchor: Selector::parse("a[href]").expect("static selector"),
        }
    }

    fn wanted(&self, row: &TrackedRow) -> bool {
        let kind = row.kind.to_uppercase();
        if !self.rules.kinds.iter().any(|k| kind.contains(k.as_str())) {
            return false;
        }
        if self.rules.names.is_empty() {
            return true;
        }
        let org = row.organization.to_lowercase();
        self.rules
            .names
            .iter()
            .any(|n| org.contains(&n.to_lowercase()))
    }

    fn link_in(&self, cell: &ElementRef<'_>, page: &Url) -> Option<String> {
        let href = cell.select(&self.anchor).next()?.value().attr("href")?;
        match page.join(href.trim()) {
            Ok(u) => Some(u.to_string()),
            Err(_) => Some(href.to_string()),
        }
    }
}

impl RowExtractor for TableExtractor {
    fn extract(&self, content: &str, page: &Url) -> Vec<TrackedRow> {
        let doc = Html::parse_document(content);

        doc.select(&self.tr)
            .filter_map(|tr| {
                let cells: Vec<ElementRef<'_>> = tr.select(&self.td).collect();
                if cells.len() < MIN_COLUMNS {
                    return None;
                }
                // Positional columns: type, organization, region, city, deadline, spots, status, date.
                let text = |i: usize| cell_text(&cells[i]);
                Some(TrackedRow {
                    kind: text(0),
                    organization: text(1),
                    region: text(2),
                    city: text(3),
                    registration_deadline: text(4),
                    spot_count: text(5),
                    status_text: text(6),
                    target_date: text(7),
                    link: self.link_in(&cells[6], page),
                })
            })
            .filter(|row| self.wanted(row))
            .collect()
    }
}

fn cell_text(cell: &ElementRef<'_>) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
