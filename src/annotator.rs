//! Post-processing of model replies: inline the extracted image of every page
//! the reply mentions.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;

use crate::context::CatalogImage;

/// Words that suggest the user wants to see images when no page was named.
const VIEWING_KEYWORDS: &[&str] = &["imagen", "mostrar", "ver"];

/// Numeric mentions (`Página 3`, `Pág. 3`, `Page 3`) capture the number in
/// group 1; first-page synonyms (`portada`, `primera página`) capture nothing.
fn page_mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(?:p[áa]gina|p[áa]g\.|page)\s*(\d+)|\b(?:portada|primera\s+p[áa]gina)\b")
            .expect("page mention pattern is valid")
    })
}

/// Insert `![Página N](url)` after each first mention of a page that has an
/// image, scanning left to right. If nothing was inserted but the reply talks
/// about viewing images, append the whole catalog sorted by page.
pub fn annotate(raw: &str, catalog: &[CatalogImage]) -> String {
    if catalog.is_empty() {
        return raw.to_string();
    }

    // Last image wins when a page has several.
    let by_page: HashMap<u32, &CatalogImage> =
        catalog.iter().map(|img| (img.page_number, img)).collect();

    let mut out = String::with_capacity(raw.len() + 64);
    let mut copied_up_to = 0;
    let mut inserted: HashSet<u32> = HashSet::new();

    for caps in page_mention_re().captures_iter(raw) {
        let Some(mention) = caps.get(0) else { continue };
        let page = match caps.get(1) {
            Some(n) => match n.as_str().parse::<u32>() {
                Ok(p) => p,
                Err(_) => continue,
            },
            None => 1,
        };
        if inserted.contains(&page) {
            continue;
        }
        let Some(image) = by_page.get(&page) else { continue };

        out.push_str(&raw[copied_up_to..mention.end()]);
        out.push_str(&format!("\n\n![Página {}]({})\n\n", page, image.url()));
        copied_up_to = mention.end();
        inserted.insert(page);
    }
    out.push_str(&raw[copied_up_to..]);

    if inserted.is_empty() && mentions_viewing(raw) && !out.contains("![") {
        append_catalog(&mut out, catalog);
    }

    if !inserted.is_empty() {
        tracing::debug!(pages = ?inserted, "inserted page images into reply");
    }
    out
}

fn mentions_viewing(text: &str) -> bool {
    let lower = text.to_lowercase();
    VIEWING_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn append_catalog(out: &mut String, catalog: &[CatalogImage]) {
    let mut sorted: Vec<&CatalogImage> = catalog.iter().collect();
    sorted.sort_by_key(|img| img.page_number);

    out.push_str("\n\n**Imágenes disponibles:**\n");
    for image in sorted {
        out.push('\n');
        out.push_str(&image.markdown());
        out.push('\n');
    }
}
