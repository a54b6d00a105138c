use archiver_core::MetadataBag;
use scraper::{Html, Selector};
use url::Url;

use crate::html::collapsed_text;

/// Namespaced `<meta>` keys kept in the metadata bag.
const NAMESPACES: &[(&str, &str)] = &[("og:", "og"), ("twitter:", "twitter"), ("article:", "article")];

const IMAGE_KEYS: &[&str] = &[
    "og.image",
    "og.image:url",
    "og.image:secure_url",
    "twitter.image",
    "twitter.image:src",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PageMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub metadata: MetadataBag,
}

/// Reads Open Graph, Twitter Card and standard head metadata.
///
/// Each field follows a fixed fallback chain (Open Graph, then Twitter,
/// then plain HTML), and the first occurrence of a repeated key wins.
pub(crate) fn extract_metadata(doc: &Html, base: Option<&Url>) -> PageMetadata {
    let mut bag = MetadataBag::new();
    let mut plain_description = None;

    if let Ok(selector) = Selector::parse("meta") {
        for meta in doc.select(&selector) {
            let element = meta.value();
            let Some(content) = element
                .attr("content")
                .map(normalize)
                .filter(|content| !content.is_empty())
            else {
                continue;
            };
            for key in [element.attr("property"), element.attr("name")]
                .into_iter()
                .flatten()
            {
                let key = key.trim().to_ascii_lowercase();
                if key == "description" {
                    plain_description.get_or_insert_with(|| content.clone());
                    continue;
                }
                for (prefix, namespace) in NAMESPACES {
                    if let Some(rest) = key.strip_prefix(prefix).filter(|rest| !rest.is_empty()) {
                        bag.insert_namespaced(namespace, rest, content.clone());
                    }
                }
            }
        }
    }

    if let Some(canonical) = canonical_url(doc, base) {
        bag.insert("canonical_url", canonical);
    }

    let document_title = Selector::parse("title")
        .ok()
        .and_then(|selector| doc.select(&selector).next())
        .map(collapsed_text)
        .filter(|title| !title.is_empty());

    let title = first_of(&bag, &["og.title", "twitter.title"]).or(document_title);
    let description = first_of(&bag, &["og.description", "twitter.description"]).or(plain_description);
    let image_url = IMAGE_KEYS
        .iter()
        .filter_map(|key| bag.get(key))
        .find_map(|raw| resolve_http_url(base, raw));

    PageMetadata {
        title,
        description,
        image_url,
        metadata: bag,
    }
}

fn first_of(bag: &MetadataBag, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| bag.get(key)).map(str::to_string)
}

fn canonical_url(doc: &Html, base: Option<&Url>) -> Option<String> {
    let selector = Selector::parse("link[rel][href]").ok()?;
    doc.select(&selector)
        .filter(|link| {
            link.value()
                .attr("rel")
                .is_some_and(|rel| rel.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("canonical")))
        })
        .find_map(|link| link.value().attr("href").and_then(|href| resolve_http_url(base, href)))
}

/// Absolute http(s) form of `raw`, resolved against the page URL when relative.
pub(crate) fn resolve_http_url(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
        Err(_) => return None,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

fn normalize(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}
