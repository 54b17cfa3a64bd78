//! HTML fragments served by `/`. Templates live in `templates/`; askama
//! escapes every interpolated value.

use crate::query::ResultRow;
use askama::Template;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use serde_json::Value;
use tracing::error;

#[derive(Template)]
#[template(path = "unavailable.html")]
pub struct UnavailablePage;

#[derive(Template)]
#[template(path = "results.html")]
pub struct ResultsPage<'a> {
    word: &'a str,
    table: String,
}

impl<'a> ResultsPage<'a> {
    pub fn new(word: &'a str, rows: &[ResultRow]) -> Self {
        ResultsPage {
            word,
            table: render_table(rows),
        }
    }
}

#[derive(Template)]
#[template(path = "no_results.html")]
pub struct NoResultsPage<'a> {
    pub word: &'a str,
}

#[derive(Template)]
#[template(path = "error.html")]
pub struct ErrorPage<'a> {
    pub message: &'a str,
}

/// Renders `template` as an HTML response with `status`.
pub fn template_response<T: Template>(status: StatusCode, template: T) -> Response {
    match template.render() {
        Ok(body) => (status, Html(body)).into_response(),
        Err(e) => {
            error!("Failed to render template: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

struct Column {
    name: String,
    cells: Vec<String>,
    numeric: bool,
    width: usize,
}

/// Renders rows as a GitHub-markdown table. Headers are the union of row
/// keys in first-seen order; numeric columns are right-aligned.
pub fn render_table(rows: &[ResultRow]) -> String {
    let mut names: Vec<&str> = Vec::new();
    for row in rows {
        for (name, _) in row.iter() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return String::new();
    }

    let columns: Vec<Column> = names
        .iter()
        .map(|name| {
            let values: Vec<Option<&Value>> = rows.iter().map(|r| r.get(name)).collect();
            let numeric = values
                .iter()
                .flatten()
                .filter(|v| !v.is_null())
                .all(|v| v.is_number());
            let cells: Vec<String> = values.into_iter().map(cell_text).collect();
            // Headers get at least two columns of padding, as tabulate does.
            let width = cells
                .iter()
                .map(|c| c.chars().count())
                .max()
                .unwrap_or(0)
                .max(name.chars().count() + 2);
            Column {
                name: name.to_string(),
                cells,
                numeric,
                width,
            }
        })
        .collect();

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(line(columns.iter().map(|c| pad(&c.name, c.width, c.numeric))));
    lines.push(format!(
        "|{}|",
        columns
            .iter()
            .map(|c| "-".repeat(c.width + 2))
            .collect::<Vec<_>>()
            .join("|")
    ));
    for i in 0..rows.len() {
        lines.push(line(
            columns.iter().map(|c| pad(&c.cells[i], c.width, c.numeric)),
        ));
    }
    lines.join("\n")
}

fn line(cells: impl Iterator<Item = String>) -> String {
    format!("| {} |", cells.collect::<Vec<_>>().join(" | "))
}

fn pad(text: &str, width: usize, right: bool) -> String {
    if right {
        format!("{:>width$}", text, width = width)
    } else {
        format!("{:<width$}", text, width = width)
    }
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shakespeare_rows() -> Vec<ResultRow> {
        vec![
            ResultRow::new().with("corpus", "comedies").with("total_words", 200),
            ResultRow::new().with("corpus", "tragedies").with("total_words", 150),
        ]
    }

    #[test]
    fn renders_github_table() {
        let expected = "\
| corpus    |   total_words |
|-----------|---------------|
| comedies  |           200 |
| tragedies |           150 |";
        assert_eq!(render_table(&shakespeare_rows()), expected);
    }

    #[test]
    fn header_union_keeps_first_seen_order() {
        let rows = vec![
            ResultRow::new().with("corpus", "a"),
            ResultRow::new().with("note", "x").with("corpus", "b"),
        ];
        let table = render_table(&rows);
        let header = table.lines().next().expect("header");
        assert_eq!(header, "| corpus   | note   |");
        let last = table.lines().last().expect("row");
        assert_eq!(last, "| b        | x      |");
        assert!(table.lines().nth(2).expect("row").starts_with("| a        |        |"));
    }

    #[test]
    fn empty_rows_render_nothing() {
        assert_eq!(render_table(&[]), "");
    }

    #[test]
    fn results_page_names_word_and_keeps_order() {
        let page = ResultsPage::new("the", &shakespeare_rows())
            .render()
            .expect("render");
        assert!(page.starts_with("<h4>Amount of times 'the' appears per corpus</h4><pre>"));
        let comedies = page.find("comedies").expect("comedies");
        let tragedies = page.find("tragedies").expect("tragedies");
        assert!(comedies < tragedies);
        assert!(page.ends_with("</pre>"));
    }

    #[test]
    fn fixed_fragments_render_exactly() {
        assert_eq!(
            UnavailablePage.render().expect("render"),
            "<h4>Service Unavailable</h4><p>BigQuery client not available</p>"
        );
        assert_eq!(
            NoResultsPage { word: "zyzzyva" }.render().expect("render"),
            "<h4>No results found for word 'zyzzyva'</h4>"
        );
        assert_eq!(
            ErrorPage { message: "timeout" }.render().expect("render"),
            "<h4>Error</h4><p>Failed to execute query: timeout</p>"
        );
    }

    #[test]
    fn dynamic_text_is_escaped() {
        let page = NoResultsPage {
            word: "<script>alert(1)</script>",
        }
        .render()
        .expect("render");
        assert!(!page.contains("<script>"));
        assert!(page.contains("&lt;script&gt;"));

        let rows = vec![ResultRow::new().with("corpus", "a&b")];
        let page = ResultsPage::new("w", &rows).render().expect("render");
        assert!(page.contains("a&amp;b"));

        assert_eq!(
            ErrorPage { message: "bad \"x\"" }.render().expect("render"),
            "<h4>Error</h4><p>Failed to execute query: bad &quot;x&quot;</p>"
        );
    }

    #[tokio::test]
    async fn template_response_sets_status_and_content_type() {
        let resp = template_response(StatusCode::SERVICE_UNAVAILABLE, UnavailablePage);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/html"), "{}", content_type);
        let bytes = hyper::body::to_bytes(resp.into_body()).await.expect("bytes");
        assert_eq!(
            &bytes[..],
            b"<h4>Service Unavailable</h4><p>BigQuery client not available</p>"
        );
    }
}
