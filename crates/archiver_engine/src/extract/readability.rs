use std::collections::HashMap;
use std::sync::LazyLock;

use archiver_logging::archiver_debug;
use ego_tree::iter::Edge;
use ego_tree::{NodeId, NodeRef};
use regex::Regex;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::metadata::extract_metadata;
use super::text::derive_text;
use super::{ExtractedContent, ExtractionError, Extractor};
use crate::html::{collapsed_text, serialize, NodeFilter, Visit};

static UNLIKELY_CANDIDATES: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)-ad-|ai2html|banner|breadcrumbs|combx|comment|community|cover-wrap|disqus|extra|footer|gdpr|header|legends|menu|related|remark|replies|rss|shoutbox|sidebar|skyscraper|social|sponsor|supplemental|ad-break|agegate|pagination|pager|popup|cookie|newsletter|share",
    )
    .ok()
});

static MAYBE_CANDIDATE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)and|article|body|column|content|main|shadow").ok());

static POSITIVE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)article|body|content|entry|hentry|h-entry|main|page|post|text|blog|story").ok()
});

static NEGATIVE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)-ad-|hidden|^hid$| hid$| hid |^hid |banner|combx|comment|com-|contact|foot|footer|footnote|gdpr|masthead|media|meta|outbrain|promo|related|scroll|share|shoutbox|sidebar|skyscraper|sponsor|shopping|tags|tool|widget|cookie|newsletter",
    )
    .ok()
});

static SENTENCE_END: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\.( |$)").ok());

/// Subtrees never considered as content, whatever their score.
const BOILERPLATE_TAGS: &[&str] = &[
    "nav", "footer", "aside", "header", "form", "script", "style", "noscript", "template",
];

/// Removed from the chosen fragment.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "footer", "aside", "form", "iframe",
    "object", "embed", "button", "input", "select", "textarea", "svg", "canvas", "head",
    "title", "meta", "link",
];

const BLOCK_CHILD_TAGS: &[&str] = &[
    "a", "blockquote", "dl", "div", "img", "ol", "p", "pre", "table", "ul", "section",
    "article", "h1", "h2", "h3", "h4", "h5", "h6",
];

const CONDITIONAL_TAGS: &[&str] = &["div", "section", "ul", "ol", "table", "dl"];

fn is_match(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(text))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadabilitySettings {
    /// Paragraphs shorter than this many characters do not vote.
    pub min_paragraph_chars: usize,
    /// Below this many visible characters the page has no readable content.
    pub min_content_chars: usize,
}

impl Default for ReadabilitySettings {
    fn default() -> Self {
        Self {
            min_paragraph_chars: 25,
            min_content_chars: 50,
        }
    }
}

/// Scores paragraph containers by text density and keeps the best one plus
/// related siblings.
#[derive(Debug, Default, Clone)]
pub struct ReadabilityExtractor {
    settings: ReadabilitySettings,
}

impl ReadabilityExtractor {
    pub fn new(settings: ReadabilitySettings) -> Self {
        Self { settings }
    }

    fn main_content(&self, doc: &Html) -> String {
        let stats = DocumentStats::collect(doc.tree.root());
        let candidates = self.score_candidates(doc, &stats);

        let Some((top, top_score)) = candidates.best(doc) else {
            archiver_debug!("No scored candidates; falling back to the page body");
            return fallback_content(doc, &stats);
        };
        archiver_debug!(
            "Top candidate <{}> scored {:.1} among {} candidates",
            top.value().name(),
            top_score,
            candidates.order.len()
        );

        let mut filter = ContentFilter { stats: &stats };
        let mut out = String::from("<div>");
        let parent = top
            .parent()
            .and_then(ElementRef::wrap)
            .filter(|parent| parent.value().name() != "html");
        match parent {
            Some(parent) => {
                let threshold = f64::max(10.0, top_score * 0.2);
                let top_class = top.value().attr("class").filter(|class| !class.trim().is_empty());
                for sibling in parent.children().filter_map(ElementRef::wrap) {
                    let related = sibling.id() == top.id()
                        || is_related_sibling(sibling, top_class, threshold, top_score, &candidates, &stats);
                    if related {
                        out.push_str(&serialize(*sibling, true, &mut filter));
                    }
                }
            }
            None => out.push_str(&serialize(*top, false, &mut filter)),
        }
        out.push_str("</div>");
        out
    }

    fn score_candidates(&self, doc: &Html, stats: &DocumentStats) -> Candidates {
        let mut candidates = Candidates::default();
        let Ok(selector) = Selector::parse("p, pre, td, div") else {
            return candidates;
        };
        for paragraph in doc.select(&selector) {
            if stats.is_excluded(paragraph.id()) {
                continue;
            }
            if paragraph.value().name() == "div" && has_block_children(paragraph) {
                continue;
            }
            let text = collapsed_text(paragraph);
            let len = text.chars().count();
            if len < self.settings.min_paragraph_chars {
                continue;
            }
            let score = 1.0 + text.matches(',').count() as f64 + f64::min((len / 100) as f64, 3.0);

            let Some(parent) = paragraph.parent().and_then(ElementRef::wrap) else {
                continue;
            };
            candidates.add(parent, score);
            if let Some(grandparent) = parent.parent().and_then(ElementRef::wrap) {
                candidates.add(grandparent, score / 2.0);
            }
        }
        candidates.finish(stats);
        candidates
    }
}

impl Extractor for ReadabilityExtractor {
    fn extract(&self, html: &str, source_url: &str) -> Result<ExtractedContent, ExtractionError> {
        if html.trim().is_empty() {
            return Err(ExtractionError::MetadataExtractionFailed(
                "document is empty".to_string(),
            ));
        }
        let doc = Html::parse_document(html);
        let base = Url::parse(source_url).ok();
        let page = extract_metadata(&doc, base.as_ref());

        let content_html = self.main_content(&doc);
        let content_text = derive_text(&content_html);
        let visible = content_text.chars().filter(|c| !c.is_whitespace()).count();
        if visible < self.settings.min_content_chars {
            return Err(ExtractionError::MainContentExtractionFailed(format!(
                "only {visible} characters of readable text (need {})",
                self.settings.min_content_chars
            )));
        }

        Ok(ExtractedContent {
            title: page.title,
            description: page.description,
            image_url: page.image_url,
            metadata: page.metadata,
            content_html,
            content_text,
        })
    }
}

fn fallback_content(doc: &Html, stats: &DocumentStats) -> String {
    let container = ["article", "main", "[role=main]", "body"]
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|selector| doc.select(&selector).next());
    let mut filter = ContentFilter { stats };
    match container {
        Some(container) => format!("<div>{}</div>", serialize(*container, false, &mut filter)),
        None => String::new(),
    }
}

fn is_related_sibling(
    sibling: ElementRef<'_>,
    top_class: Option<&str>,
    threshold: f64,
    top_score: f64,
    candidates: &Candidates,
    stats: &DocumentStats,
) -> bool {
    if stats.is_excluded(sibling.id()) {
        return false;
    }
    let bonus = match (top_class, sibling.value().attr("class")) {
        (Some(top), Some(class)) if top == class => top_score * 0.2,
        _ => 0.0,
    };
    if let Some(score) = candidates.final_score(sibling.id()) {
        if score + bonus >= threshold {
            return true;
        }
    }
    if sibling.value().name() != "p" {
        return false;
    }
    let chars = stats.chars(sibling.id());
    let density = stats.link_density(sibling.id());
    if chars > 80 {
        density < 0.25
    } else {
        density == 0.0 && chars > 0 && is_match(&SENTENCE_END, &collapsed_text(sibling))
    }
}

fn has_block_children(element: ElementRef<'_>) -> bool {
    element
        .children()
        .filter_map(ElementRef::wrap)
        .any(|child| BLOCK_CHILD_TAGS.contains(&child.value().name()))
}

fn class_and_id(element: ElementRef<'_>) -> String {
    let value = element.value();
    format!(
        "{} {}",
        value.attr("class").unwrap_or_default(),
        value.attr("id").unwrap_or_default()
    )
}

fn class_weight(element: ElementRef<'_>) -> f64 {
    let mut weight = 0.0;
    for attr in ["class", "id"] {
        if let Some(value) = element.value().attr(attr).filter(|v| !v.is_empty()) {
            if is_match(&NEGATIVE, value) {
                weight -= 25.0;
            }
            if is_match(&POSITIVE, value) {
                weight += 25.0;
            }
        }
    }
    weight
}

fn tag_weight(element: ElementRef<'_>) -> f64 {
    match element.value().name() {
        "div" | "article" => 5.0,
        "pre" | "td" | "blockquote" => 3.0,
        "address" | "ol" | "ul" | "dl" | "dd" | "dt" | "li" | "form" => -3.0,
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "th" => -5.0,
        _ => 0.0,
    }
}

fn is_hidden(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if value.attr("hidden").is_some() || value.attr("aria-hidden") == Some("true") {
        return true;
    }
    value.attr("style").is_some_and(|style| {
        let style: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        style.contains("display:none") || style.contains("visibility:hidden")
    })
}

/// Whether this element (on its own) marks its subtree as non-content.
fn is_boilerplate(element: ElementRef<'_>) -> bool {
    let name = element.value().name();
    if BOILERPLATE_TAGS.contains(&name) || is_hidden(element) {
        return true;
    }
    if matches!(name, "html" | "body" | "article" | "main") {
        return false;
    }
    let signature = class_and_id(element);
    is_match(&UNLIKELY_CANDIDATES, &signature) && !is_match(&MAYBE_CANDIDATE, &signature)
}

#[derive(Debug, Default, Clone, Copy)]
struct NodeStats {
    chars: usize,
    link_chars: usize,
    excluded: bool,
    raw_text: bool,
}

/// Per-element text counts and exclusion flags, computed in one pass.
struct DocumentStats {
    nodes: HashMap<NodeId, NodeStats>,
}

impl DocumentStats {
    fn collect(root: NodeRef<'_, Node>) -> Self {
        let mut nodes = HashMap::new();
        let mut stack: Vec<(NodeId, NodeStats)> = Vec::new();
        for edge in root.traverse() {
            match edge {
                Edge::Open(node) => match node.value() {
                    Node::Element(element) => {
                        let Some(element_ref) = ElementRef::wrap(node) else {
                            continue;
                        };
                        let inherited = stack.last().is_some_and(|(_, s)| s.excluded);
                        stack.push((
                            node.id(),
                            NodeStats {
                                excluded: inherited || is_boilerplate(element_ref),
                                raw_text: matches!(element.name(), "script" | "style" | "noscript" | "template"),
                                ..NodeStats::default()
                            },
                        ));
                    }
                    Node::Text(text) => {
                        if let Some((_, top)) = stack.last_mut() {
                            if !top.raw_text {
                                top.chars += text.chars().filter(|c| !c.is_whitespace()).count();
                            }
                        }
                    }
                    _ => {}
                },
                Edge::Close(node) => {
                    let Some(element) = ElementRef::wrap(node) else {
                        continue;
                    };
                    let Some((id, mut own)) = stack.pop() else {
                        continue;
                    };
                    if element.value().name() == "a" {
                        own.link_chars = own.chars;
                    }
                    if let Some((_, parent)) = stack.last_mut() {
                        if !parent.raw_text {
                            parent.chars += own.chars;
                            parent.link_chars += own.link_chars;
                        }
                    }
                    nodes.insert(id, own);
                }
            }
        }
        Self { nodes }
    }

    fn is_excluded(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|s| s.excluded)
    }

    fn chars(&self, id: NodeId) -> usize {
        self.nodes.get(&id).map_or(0, |s| s.chars)
    }

    fn link_density(&self, id: NodeId) -> f64 {
        match self.nodes.get(&id) {
            Some(stats) if stats.chars > 0 => stats.link_chars as f64 / stats.chars as f64,
            _ => 0.0,
        }
    }
}

/// Candidate containers in first-seen (document) order so ties resolve the
/// same way every run.
#[derive(Default)]
struct Candidates {
    order: Vec<NodeId>,
    scores: HashMap<NodeId, f64>,
}

impl Candidates {
    fn add(&mut self, element: ElementRef<'_>, score: f64) {
        let order = &mut self.order;
        let entry = self.scores.entry(element.id()).or_insert_with(|| {
            order.push(element.id());
            tag_weight(element) + class_weight(element)
        });
        *entry += score;
    }

    /// Scales every raw score by the share of non-link text.
    fn finish(&mut self, stats: &DocumentStats) {
        for (id, score) in self.scores.iter_mut() {
            *score *= 1.0 - stats.link_density(*id);
        }
    }

    fn final_score(&self, id: NodeId) -> Option<f64> {
        self.scores.get(&id).copied()
    }

    fn best<'a>(&self, doc: &'a Html) -> Option<(ElementRef<'a>, f64)> {
        let mut best: Option<(NodeId, f64)> = None;
        for id in &self.order {
            let score = self.scores.get(id).copied().unwrap_or_default();
            if best.is_none_or(|(_, current)| score > current) {
                best = Some((*id, score));
            }
        }
        let (id, score) = best?;
        doc.tree
            .get(id)
            .and_then(ElementRef::wrap)
            .map(|element| (element, score))
    }
}

/// Drops boilerplate, hidden nodes and link-heavy blocks from the chosen
/// content.
struct ContentFilter<'s> {
    stats: &'s DocumentStats,
}

impl NodeFilter for ContentFilter<'_> {
    fn visit(&mut self, element: ElementRef<'_>) -> Visit {
        let name = element.value().name();
        if DROPPED_TAGS.contains(&name) || self.stats.is_excluded(element.id()) || is_hidden(element) {
            return Visit::Drop;
        }
        if CONDITIONAL_TAGS.contains(&name)
            && self.stats.link_density(element.id()) > 0.5
            && class_weight(element) < 25.0
        {
            return Visit::Drop;
        }
        Visit::Keep
    }
}
