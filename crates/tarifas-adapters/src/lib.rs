//! Page resolution and extraction for the regulator site: canonical URL, link
//! lookup by anchor text, and the company → locality → PDF catalog.

use std::time::Duration;

use scraper::{ElementRef, Html, Node};
use tarifas_core::{Catalog, CompanyEntry, TariffLink};
use tarifas_storage::{FetchError, FetchedResponse, PageFetcher};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const CRATE_NAME: &str = "tarifas-adapters";

/// Elements that may carry a company heading on the tariffs page.
const HEADING_TAGS: &[&str] = &["h2", "h3", "h4", "strong", "b"];

/// Separators between the company name and the rest of a heading.
const NAME_SEPARATORS: &[&str] = &[" - ", " – ", " — "];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error("no link whose text contains `{search_text}` on {page_url}")]
    NotFound {
        page_url: String,
        search_text: String,
    },
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error(transparent)]
    Network(#[from] FetchError),
    #[error("{url} is not an html document (content-type: {content_type})")]
    NotHtml { url: String, content_type: String },
}

/// Read access to a parsed document tree, independent of the HTML parser.
pub trait TreeNode: Sized {
    /// Lowercase element name; `None` for text nodes.
    fn tag(&self) -> Option<&str>;
    fn attr(&self, name: &str) -> Option<&str>;
    /// Text carried by this node itself; `None` for elements.
    fn own_text(&self) -> Option<&str>;
    fn child_nodes(&self) -> &[Self];

    fn is_element(&self, name: &str) -> bool {
        self.tag() == Some(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomNode {
    Element {
        tag: String,
        attrs: Vec<(String, String)>,
        children: Vec<DomNode>,
    },
    Text(String),
}

impl DomNode {
    pub fn element(tag: &str, attrs: &[(&str, &str)], children: Vec<DomNode>) -> Self {
        Self::Element {
            tag: tag.to_ascii_lowercase(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

impl TreeNode for DomNode {
    fn tag(&self) -> Option<&str> {
        match self {
            Self::Element { tag, .. } => Some(tag),
            Self::Text(_) => None,
        }
    }

    fn attr(&self, name: &str) -> Option<&str> {
        match self {
            Self::Element { attrs, .. } => attrs
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            Self::Text(_) => None,
        }
    }

    fn own_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Element { .. } => None,
        }
    }

    fn child_nodes(&self) -> &[Self] {
        match self {
            Self::Element { children, .. } => children,
            Self::Text(_) => &[],
        }
    }
}

/// Parse HTML leniently into an owned [`DomNode`] tree rooted at `<html>`.
pub fn parse_document(html: &str) -> DomNode {
    let document = Html::parse_document(html);
    convert_element(document.root_element())
}

fn convert_element(element: ElementRef<'_>) -> DomNode {
    let children = element
        .children()
        .filter_map(|child| {
            if let Some(child_element) = ElementRef::wrap(child) {
                Some(convert_element(child_element))
            } else if let Node::Text(text) = child.value() {
                Some(DomNode::Text(String::from(&**text)))
            } else {
                None
            }
        })
        .collect();
    let value = element.value();
    DomNode::Element {
        tag: value.name().to_ascii_lowercase(),
        attrs: value
            .attrs()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        children,
    }
}

/// Pre-order walk in document order, root included.
pub struct Preorder<'a, N> {
    stack: Vec<&'a N>,
}

impl<'a, N: TreeNode> Iterator for Preorder<'a, N> {
    type Item = &'a N;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.stack.extend(node.child_nodes().iter().rev());
        Some(node)
    }
}

pub fn preorder<N: TreeNode>(root: &N) -> Preorder<'_, N> {
    Preorder { stack: vec![root] }
}

/// Concatenated text of every descendant text node.
pub fn text_content<N: TreeNode>(node: &N) -> String {
    preorder(node).filter_map(TreeNode::own_text).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `href` of the first anchor, in document order, whose text contains
/// `search_text` case-insensitively. Matching anchors without an `href` are skipped.
pub fn find_anchor_href<'a, N: TreeNode>(root: &'a N, search_text: &str) -> Option<&'a str> {
    let needle = collapse_whitespace(search_text).to_lowercase();
    preorder(root)
        .filter(|node| node.is_element("a"))
        .filter(|anchor| {
            collapse_whitespace(&text_content(*anchor))
                .to_lowercase()
                .contains(&needle)
        })
        .find_map(|anchor| anchor.attr("href").map(str::trim).filter(|h| !h.is_empty()))
}

/// Make `href` absolute against the page it was found on.
///
/// Absolute and scheme-relative hrefs are returned unchanged; root-relative ones
/// take the page's scheme and host; anything else resolves against the page's directory.
pub fn resolve_href(page_url: &str, href: &str) -> Result<String, ResolveError> {
    let href = href.trim();
    if href.starts_with("//") || Url::parse(href).is_ok() {
        return Ok(href.to_string());
    }
    let base = Url::parse(page_url).map_err(|source| ResolveError::InvalidUrl {
        url: page_url.to_string(),
        source,
    })?;
    base.join(href)
        .map(String::from)
        .map_err(|source| ResolveError::InvalidUrl {
            url: href.to_string(),
            source,
        })
}

/// GET `start_url`, letting the client follow any redirect chain, and return
/// the URL the server finally settled on.
pub async fn resolve_redirect(
    fetcher: &dyn PageFetcher,
    start_url: &str,
    timeout: Duration,
) -> Result<String, ResolveError> {
    let resp = fetcher.get(start_url, timeout).await?.error_for_status()?;
    if resp.final_url != start_url {
        debug!(start_url, final_url = %resp.final_url, "redirect followed");
    }
    Ok(resp.final_url)
}

pub async fn find_link_by_text(
    fetcher: &dyn PageFetcher,
    page_url: &str,
    search_text: &str,
    timeout: Duration,
) -> Result<String, ResolveError> {
    let resp = fetcher.get(page_url, timeout).await?.error_for_status()?;
    let document = parse_document(&resp.text());
    let href = find_anchor_href(&document, search_text).ok_or_else(|| ResolveError::NotFound {
        page_url: resp.final_url.clone(),
        search_text: search_text.to_string(),
    })?;
    resolve_href(&resp.final_url, href)
}

pub async fn extract_catalog(
    fetcher: &dyn PageFetcher,
    tariffs_page_url: &str,
    timeout: Duration,
) -> Result<Catalog, ExtractionError> {
    let resp = fetcher
        .get(tariffs_page_url, timeout)
        .await?
        .error_for_status()?;
    ensure_html(&resp)?;
    let catalog = parse_catalog(&resp.text(), &resp.final_url);
    debug!(
        url = %resp.final_url,
        companies = catalog.total_companies,
        pdfs = catalog.pdf_count(),
        "catalog extracted"
    );
    Ok(catalog)
}

fn ensure_html(resp: &FetchedResponse) -> Result<(), ExtractionError> {
    let looks_like_markup = || {
        String::from_utf8_lossy(&resp.body)
            .trim_start_matches('\u{feff}')
            .trim_start()
            .starts_with('<')
    };
    let is_html = match resp.content_type.as_deref() {
        Some(ct) => {
            let ct = ct.to_ascii_lowercase();
            ct.contains("html") || ct.contains("xml") || (ct.starts_with("text/plain") && looks_like_markup())
        }
        None => looks_like_markup(),
    };
    if is_html {
        Ok(())
    } else {
        Err(ExtractionError::NotHtml {
            url: resp.final_url.clone(),
            content_type: resp.content_type.clone().unwrap_or_else(|| "unknown".to_string()),
        })
    }
}

/// Catalog of `html`, with relative PDF links resolved against `page_url`.
pub fn parse_catalog(html: &str, page_url: &str) -> Catalog {
    let document = parse_document(html);
    Catalog::new(page_url, extract_companies(&document, page_url))
}

enum Block<'a, N> {
    Heading(String),
    Table(&'a N, TariffColumns),
}

struct CompanyHeading {
    name: String,
    /// The heading had the `<name> - <label>` shape.
    explicit: bool,
}

fn parse_heading(text: &str) -> Option<CompanyHeading> {
    let split = NAME_SEPARATORS
        .iter()
        .filter_map(|sep| text.find(sep))
        .min()
        .map(|idx| text[..idx].trim());
    let (name, explicit) = match split {
        Some(name) => (name, true),
        None => (text.trim(), false),
    };
    (!name.is_empty()).then(|| CompanyHeading {
        name: name.to_string(),
        explicit,
    })
}

/// Headings that mention a tariff and tariff tables, in document order.
///
/// A tariff table is opaque: headings inside it are cell labels, not companies.
/// Any other table is walked like a container, so content laid out inside a
/// layout table is still found.
fn collect_blocks<N: TreeNode>(root: &N) -> Vec<Block<'_, N>> {
    let mut blocks = Vec::new();
    let mut stack: Vec<(&N, bool)> = vec![(root, false)];
    while let Some((node, in_heading)) = stack.pop() {
        let Some(tag) = node.tag() else {
            continue;
        };
        if tag == "table" {
            if let Some(columns) = tariff_columns(node) {
                blocks.push(Block::Table(node, columns));
                continue;
            }
        }
        let mut child_in_heading = in_heading;
        if !in_heading && HEADING_TAGS.contains(&tag) {
            let text = collapse_whitespace(&text_content(node));
            if text.to_lowercase().contains("tarifa") {
                blocks.push(Block::Heading(text));
                child_in_heading = true;
            }
        }
        stack.extend(
            node.child_nodes()
                .iter()
                .rev()
                .map(|child| (child, child_in_heading)),
        );
    }
    blocks
}

/// Companies in document order. A company heading owns the first tariff table
/// that follows it before the next company heading.
///
/// Headings shaped `<name> - ...` are emitted even when no localities could be
/// parsed; bare headings only when followed by a recognizable tariff table.
pub fn extract_companies<N: TreeNode>(root: &N, page_url: &str) -> Vec<CompanyEntry> {
    let mut companies = Vec::new();
    let mut pending: Option<CompanyHeading> = None;

    let mut finish = |heading: CompanyHeading, table: Option<(&N, TariffColumns)>| {
        let tariffs = table.map(|(t, columns)| parse_tariff_table(t, columns, page_url));
        if tariffs.is_none() && !heading.explicit {
            debug!(heading = %heading.name, "skipping heading without a tariff table");
            return;
        }
        let tariffs = tariffs.unwrap_or_default();
        if tariffs.is_empty() {
            warn!(company = %heading.name, "company listed without parseable tariffs");
        }
        companies.push(CompanyEntry {
            name: heading.name,
            tariffs,
        });
    };

    for block in collect_blocks(root) {
        match block {
            Block::Heading(text) => {
                if let Some(previous) = pending.take() {
                    finish(previous, None);
                }
                pending = parse_heading(&text);
            }
            Block::Table(table, columns) => match pending.take() {
                Some(heading) => finish(heading, Some((table, columns))),
                None => debug!("tariff table without a company heading ignored"),
            },
        }
    }
    if let Some(heading) = pending.take() {
        finish(heading, None);
    }

    companies
}

/// Rows of `table` (nested tables excluded).
fn table_rows<N: TreeNode>(table: &N) -> Vec<&N> {
    let mut rows = Vec::new();
    let mut stack: Vec<&N> = table.child_nodes().iter().rev().collect();
    while let Some(node) = stack.pop() {
        match node.tag() {
            Some("tr") => rows.push(node),
            Some("table") | None => {}
            Some(_) => stack.extend(node.child_nodes().iter().rev()),
        }
    }
    rows
}

fn row_cells<N: TreeNode>(row: &N) -> Vec<&N> {
    row.child_nodes()
        .iter()
        .filter(|c| c.is_element("td") || c.is_element("th"))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TariffColumns {
    locality: usize,
    tariff: usize,
}

/// Column positions when the table's first row names a "localidad" column and
/// a distinct "tarifa vigente" column. A first row wrapping another table is a
/// layout row, not a header.
fn tariff_columns<N: TreeNode>(table: &N) -> Option<TariffColumns> {
    let rows = table_rows(table);
    let header = rows.first()?;
    let cells = row_cells(*header);
    if cells
        .iter()
        .any(|cell| preorder(*cell).any(|n| n.is_element("table")))
    {
        return None;
    }
    let headers: Vec<String> = cells
        .into_iter()
        .map(|cell| collapse_whitespace(&text_content(cell)).to_lowercase())
        .collect();
    let locality = headers.iter().position(|h| h.contains("localidad"))?;
    let tariff = headers
        .iter()
        .enumerate()
        .position(|(idx, h)| idx != locality && h.contains("tarifa") && h.contains("vigente"))?;
    Some(TariffColumns { locality, tariff })
}

/// Locality/PDF pairs below the header row. Rows lacking a locality or a link
/// are dropped.
fn parse_tariff_table<N: TreeNode>(table: &N, columns: TariffColumns, page_url: &str) -> Vec<TariffLink> {
    let TariffColumns {
        locality: locality_idx,
        tariff: tariff_idx,
    } = columns;
    let rows = table_rows(table);
    let body = rows.get(1..).unwrap_or_default();

    let mut links = Vec::new();
    for row in body {
        let cells = row_cells(*row);
        if cells.len() <= locality_idx.max(tariff_idx) {
            continue;
        }
        let locality = collapse_whitespace(&text_content(cells[locality_idx]));
        if locality.is_empty() {
            continue;
        }
        let Some(href) = preorder(cells[tariff_idx])
            .filter(|n| n.is_element("a"))
            .find_map(|a| a.attr("href").map(str::trim).filter(|h| !h.is_empty()))
        else {
            continue;
        };
        match resolve_href(page_url, href) {
            Ok(pdf_url) => links.push(TariffLink { locality, pdf_url }),
            Err(err) => warn!(%locality, href, error = %err, "skipping unresolvable tariff link"),
        }
    }
    links
}
