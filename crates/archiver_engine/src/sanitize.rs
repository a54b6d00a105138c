use std::collections::HashSet;

use archiver_core::{Failure, FailureReason, Stage};
use archiver_logging::archiver_debug;
use scraper::{ElementRef, Html};

use crate::html::{serialize, NodeFilter, Visit};

/// Elements removed together with everything inside them.
const DANGEROUS_TAGS: &[&str] = &[
    "script", "iframe", "frame", "frameset", "object", "embed", "applet", "base", "meta",
    "link", "style", "template", "noscript", "svg", "math", "form", "input", "button",
    "select", "textarea", "option", "portal", "xml",
];

/// Attributes whose value is dereferenced as a URL.
const URL_ATTRIBUTES: &[&str] = &[
    "href", "src", "action", "formaction", "xlink:href", "data", "poster", "background",
    "cite", "longdesc", "lowsrc", "dynsrc", "srcset", "ping",
];

const DANGEROUS_STYLE: &[&str] = &["expression(", "javascript:", "vbscript:", "behavior:", "-moz-binding", "url("];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("sanitization failed: {0}")]
pub struct SanitizationError(pub String);

impl From<SanitizationError> for Failure {
    fn from(err: SanitizationError) -> Self {
        Failure::new(FailureReason::SanitizationFailed, err.0).at_stage(Stage::Sanitization)
    }
}

pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, html: &str) -> Result<String, SanitizationError>;
}

/// Prunes dangerous subtrees outright, then runs the survivors through an
/// allow-list cleaner.
///
/// Any element that is itself dangerous, or that carries an event handler,
/// a script-capable URL, or a scripting style, is removed with its whole
/// subtree. Siblings are left alone.
#[derive(Debug, Clone, Default)]
pub struct PruningSanitizer {
    extra_tags: HashSet<&'static str>,
}

impl PruningSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also allow `tags` through the final allow-list pass.
    pub fn with_extra_tags(mut self, tags: impl IntoIterator<Item = &'static str>) -> Self {
        self.extra_tags.extend(tags);
        self
    }

    fn clean(&self, html: &str) -> String {
        let mut builder = ammonia::Builder::default();
        builder
            .add_tags(self.extra_tags.iter().copied())
            .url_schemes(["http", "https", "mailto"].into_iter().collect())
            .link_rel(Some("noopener noreferrer nofollow"))
            .strip_comments(true);
        builder.clean(html).to_string()
    }
}

impl Sanitizer for PruningSanitizer {
    fn sanitize(&self, html: &str) -> Result<String, SanitizationError> {
        let fragment = Html::parse_fragment(html);
        let mut filter = PruneFilter::default();
        let pruned = serialize(*fragment.root_element(), false, &mut filter);
        if filter.pruned > 0 {
            archiver_debug!("Pruned {} dangerous subtrees", filter.pruned);
        }

        let cleaned = self.clean(&pruned);
        if cleaned.trim().is_empty() && !html.trim().is_empty() {
            return Err(SanitizationError(format!(
                "no safe content remained ({} subtrees pruned)",
                filter.pruned
            )));
        }
        Ok(cleaned)
    }
}

#[derive(Default)]
struct PruneFilter {
    pruned: usize,
}

impl NodeFilter for PruneFilter {
    fn visit(&mut self, element: ElementRef<'_>) -> Visit {
        if is_dangerous(element) {
            self.pruned += 1;
            Visit::Drop
        } else {
            Visit::Keep
        }
    }
}

fn is_dangerous(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if DANGEROUS_TAGS.contains(&value.name()) {
        return true;
    }
    value.attrs().any(|(name, attr)| is_dangerous_attribute(&name.to_ascii_lowercase(), attr))
}

fn is_dangerous_attribute(name: &str, value: &str) -> bool {
    if name.starts_with("on") || name == "srcdoc" {
        return true;
    }
    if name == "style" {
        let style = squash(value);
        return DANGEROUS_STYLE.iter().any(|needle| style.contains(needle));
    }
    if URL_ATTRIBUTES.contains(&name) {
        let url = squash(value);
        return is_dangerous_url(&url);
    }
    false
}

fn is_dangerous_url(url: &str) -> bool {
    if url.starts_with("javascript:") || url.starts_with("vbscript:") {
        return true;
    }
    // Raster images are the only inline payloads a reader needs.
    url.starts_with("data:") && (!url.starts_with("data:image/") || url.starts_with("data:image/svg"))
}

/// Lowercased value with whitespace and control characters removed, as
/// browsers do before resolving a scheme.
fn squash(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sanitize(html: &str) -> String {
        PruningSanitizer::new().sanitize(html).unwrap()
    }

    #[test]
    fn removes_scripts_and_keeps_siblings() {
        let out = sanitize("<p>before</p><script>alert(1)</script><p>after</p>");
        assert_eq!(out, "<p>before</p><p>after</p>");
    }

    #[test]
    fn event_handler_prunes_whole_element() {
        let out = sanitize(r#"<div><p onclick="steal()">bad <b>text</b></p><p>good</p></div>"#);
        assert_eq!(out, "<div><p>good</p></div>");
    }

    #[test]
    fn obfuscated_javascript_url_is_pruned() {
        let out = sanitize("<p><a href=\" java\tscript:alert(1)\">x</a>kept</p>");
        assert_eq!(out, "<p>kept</p>");
    }

    #[test]
    fn data_images_survive_pruning_but_html_data_does_not() {
        let raster = "<img src=\"data:image/png;base64,AAAA\">";
        let mut filter = PruneFilter::default();
        let doc = Html::parse_fragment(raster);
        serialize(*doc.root_element(), false, &mut filter);
        assert_eq!(filter.pruned, 0);

        let out = sanitize(r#"<p>ok</p><a href="data:text/html,<script>1</script>">x</a>"#);
        assert_eq!(out, "<p>ok</p>");
    }

    #[test]
    fn expression_styles_are_pruned() {
        let out = sanitize(r#"<p style="width: expression(alert(1))">x</p><p>y</p>"#);
        assert_eq!(out, "<p>y</p>");
    }

    #[test]
    fn links_get_safe_rel() {
        let out = sanitize(r#"<a href="https://example.com/">site</a>"#);
        assert_eq!(
            out,
            r#"<a href="https://example.com/" rel="noopener noreferrer nofollow">site</a>"#
        );
    }

    #[test]
    fn everything_dangerous_is_a_failure() {
        let err = PruningSanitizer::new()
            .sanitize("<script>alert(1)</script><iframe src=x></iframe>")
            .unwrap_err();
        assert!(err.0.contains("2 subtrees"));
    }

    #[test]
    fn sanitizing_twice_is_stable() {
        let once = sanitize("<div><h2>Title</h2><p>Body <em>text</em></p><ul><li>one</li></ul></div>");
        assert_eq!(sanitize(&once), once);
    }
}
